//! An in-process broker implementing the primitive layer.
//!
//! It lets you exercise pools and the topology coordinator without a running RabbitMq:
//! connections and channels can be closed as if the broker did it, recovered,
//! and topology calls are recorded instead of being sent over the wire.
//!
//! ```
//! use std::sync::Arc;
//! use carrot_pool::pool::ConnectionManager;
//! use carrot_pool::transport::memory::MemoryBroker;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), carrot_pool::Error> {
//! let broker = MemoryBroker::recoverable();
//! let manager = ConnectionManager::new(broker.clone(), vec!["localhost".into()], "tests");
//! let channel = manager.create_channel(&CancellationToken::new()).await?;
//!
//! // The broker closes the channel...
//! broker.channel(channel.id()).unwrap().fail(320, "CONNECTION_FORCED");
//! assert!(channel.is_closed());
//! // ...and it comes back.
//! broker.channel(channel.id()).unwrap().recover();
//! assert!(channel.is_open());
//! # Ok(())
//! # }
//! ```
use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;

use super::{
    Channel, ChannelId, ChannelPrimitive, CloseInitiator, CloseReason, ConnectionPrimitive,
    Connector, LinkState,
};
use crate::amqp::declarations::{ExchangeDeclaration, QueueBinding, QueueDeclaration};

const PRECONDITION_FAILED: u16 = 406;

/// A topology call received by the [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyCall {
    DeclareExchange(String),
    DeclareQueue(String),
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Unbind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

#[derive(Default)]
struct BrokerState {
    recoverable: bool,
    unreachable: AtomicBool,
    refuse_channels: AtomicBool,
    connection_attempts: AtomicUsize,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    calls: Mutex<Vec<TopologyCall>>,
    rejected: Mutex<HashSet<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-process broker. Cloning it gives another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// A broker whose connections and channels never recover once closed.
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker whose connections and channels support recovery.
    pub fn recoverable() -> Self {
        Self {
            state: Arc::new(BrokerState {
                recoverable: true,
                ..Default::default()
            }),
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Refuse (or accept again) new channels on open connections.
    pub fn set_refuse_channels(&self, refuse: bool) {
        self.state.refuse_channels.store(refuse, Ordering::SeqCst);
    }

    /// Reject every future declaration of the exchange or queue called `name`,
    /// and every bind or unbind of the queue called `name`.
    pub fn reject(&self, name: impl Into<String>) {
        lock(&self.state.rejected).insert(name.into());
    }

    pub fn connection_attempts(&self) -> usize {
        self.state.connection_attempts.load(Ordering::SeqCst)
    }

    /// The most recently established connection.
    pub fn connection(&self) -> Option<Arc<MemoryConnection>> {
        lock(&self.state.connections).last().cloned()
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<MemoryChannel>> {
        lock(&self.state.channels)
            .iter()
            .find(|channel| channel.id == id)
            .cloned()
    }

    /// Every channel opened so far, in creation order.
    pub fn channels(&self) -> Vec<Arc<MemoryChannel>> {
        lock(&self.state.channels).clone()
    }

    pub fn channels_created(&self) -> usize {
        lock(&self.state.channels).len()
    }

    /// Every topology call received so far, in order, including rejected ones.
    pub fn calls(&self) -> Vec<TopologyCall> {
        lock(&self.state.calls).clone()
    }
}

#[async_trait::async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        hosts: &[String],
        client_name: &str,
    ) -> Result<Arc<dyn ConnectionPrimitive>, anyhow::Error> {
        self.state.connection_attempts.fetch_add(1, Ordering::SeqCst);
        if hosts.is_empty() {
            anyhow::bail!("No RabbitMq host was configured.");
        }
        if self.state.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("Connection refused by every host in {hosts:?}");
        }
        let (state, _) = watch::channel(LinkState::Open);
        let connection = Arc::new(MemoryConnection {
            broker: Arc::downgrade(&self.state),
            host: hosts[0].clone(),
            client_name: client_name.to_owned(),
            recoverable: self.state.recoverable,
            state,
            channels: Mutex::new(Vec::new()),
        });
        lock(&self.state.connections).push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub struct MemoryConnection {
    broker: Weak<BrokerState>,
    host: String,
    client_name: String,
    recoverable: bool,
    state: watch::Sender<LinkState>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnection {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Close the connection and all its channels as the broker would.
    pub fn fail(&self, code: u16, text: &str) {
        self.state
            .send_replace(LinkState::Closed(CloseReason::peer(code, text)));
        for channel in lock(&self.channels).iter() {
            channel.fail(code, text);
        }
    }

    /// Re-open the connection, and the channels the broker closed along with it.
    pub fn recover(&self) {
        self.state.send_replace(LinkState::Open);
        for channel in lock(&self.channels).iter() {
            if channel.closed_by(CloseInitiator::Peer) {
                channel.recover();
            }
        }
    }
}

#[async_trait::async_trait]
impl ConnectionPrimitive for MemoryConnection {
    fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn supports_recovery(&self) -> bool {
        self.recoverable
    }

    async fn create_channel(&self) -> Result<Channel, anyhow::Error> {
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("The broker is gone."))?;
        if let LinkState::Closed(reason) = self.state() {
            anyhow::bail!("Cannot open a channel on a closed connection: {reason}");
        }
        if broker.refuse_channels.load(Ordering::SeqCst) {
            anyhow::bail!("The broker refused to open a new channel.");
        }
        let (state, _) = watch::channel(LinkState::Open);
        let channel = Arc::new(MemoryChannel {
            id: ChannelId::next(),
            broker: self.broker.clone(),
            recoverable: self.recoverable,
            state,
        });
        lock(&self.channels).push(Arc::clone(&channel));
        lock(&broker.channels).push(Arc::clone(&channel));
        Ok(Channel::from(channel as Arc<dyn ChannelPrimitive>))
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.state.send_replace(LinkState::Closed(CloseReason::application(
            "connection closed by the application",
        )));
        for channel in lock(&self.channels).iter() {
            channel.state.send_replace(LinkState::Closed(CloseReason::application(
                "connection closed by the application",
            )));
        }
        Ok(())
    }
}

pub struct MemoryChannel {
    id: ChannelId,
    broker: Weak<BrokerState>,
    recoverable: bool,
    state: watch::Sender<LinkState>,
}

impl MemoryChannel {
    /// Close the channel as the broker would. Closed channels are left untouched.
    pub fn fail(&self, code: u16, text: &str) {
        if self.state().is_open() {
            self.state
                .send_replace(LinkState::Closed(CloseReason::peer(code, text)));
        }
    }

    /// Re-open the channel, unless the application closed it.
    pub fn recover(&self) {
        if !self.closed_by(CloseInitiator::Application) {
            self.state.send_replace(LinkState::Open);
        }
    }

    fn closed_by(&self, initiator: CloseInitiator) -> bool {
        matches!(&*self.state.borrow(), LinkState::Closed(reason) if reason.initiator == initiator)
    }

    /// Record `call`, failing if the channel is closed or `name` is rejected.
    fn record(&self, call: TopologyCall, name: &str) -> Result<(), anyhow::Error> {
        if let LinkState::Closed(reason) = self.state() {
            anyhow::bail!("{} is closed: {reason}", self.id);
        }
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("The broker is gone."))?;
        lock(&broker.calls).push(call);
        if lock(&broker.rejected).contains(name) {
            let text = format!("PRECONDITION_FAILED - `{name}` was rejected");
            // Like RabbitMq, a failed declaration closes the channel.
            self.fail(PRECONDITION_FAILED, &text);
            anyhow::bail!(text);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelPrimitive for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn supports_recovery(&self) -> bool {
        self.recoverable
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn declare_exchange(
        &self,
        declaration: &ExchangeDeclaration,
    ) -> Result<(), anyhow::Error> {
        self.record(
            TopologyCall::DeclareExchange(declaration.name.clone()),
            &declaration.name,
        )
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), anyhow::Error> {
        self.record(
            TopologyCall::DeclareQueue(declaration.name.clone()),
            &declaration.name,
        )
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), anyhow::Error> {
        self.record(
            TopologyCall::Bind {
                queue: binding.queue.clone(),
                exchange: binding.exchange.clone(),
                routing_key: binding.routing_key.clone(),
            },
            &binding.queue,
        )
    }

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), anyhow::Error> {
        self.record(
            TopologyCall::Unbind {
                queue: binding.queue.clone(),
                exchange: binding.exchange.clone(),
                routing_key: binding.routing_key.clone(),
            },
            &binding.queue,
        )
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.state.send_replace(LinkState::Closed(CloseReason::application(
            "channel closed by the application",
        )));
        Ok(())
    }
}
