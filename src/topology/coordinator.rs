use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::bind_key::BindKey;
use crate::amqp::declarations::{ExchangeDeclaration, QueueBinding, QueueDeclaration};
use crate::pool::ConnectionManager;
use crate::transport::Channel;
use crate::Error;

/// Serialises exchange and queue declarations, binds and unbinds on one dedicated channel.
///
/// Topology operations never race each other and never compete with publishers or consumers
/// for a pooled channel. Calls are queued and executed one at a time by a background worker;
/// a failing operation only fails its own caller, the following ones still run.
///
/// # Idempotency
///
/// Operations already known to be satisfied complete immediately, without a network call:
/// - the default exchange is never declared, nor bound to or unbound from;
/// - an exchange is remembered once declared, unless it is auto-delete;
/// - a queue is remembered once declared, only if it is auto-delete;
/// - a binding is remembered once bound, until it is unbound.
///
/// Declaring a durable queue or an auto-delete exchange therefore always reaches the broker.
pub struct TopologyCoordinator {
    tasks: Option<mpsc::UnboundedSender<TopologyTask>>,
    declared: Arc<Mutex<Declared>>,
    worker: Option<JoinHandle<()>>,
}

/// What is known to exist on the broker.
#[derive(Default)]
struct Declared {
    exchanges: HashSet<String>,
    queues: HashSet<String>,
    bindings: HashSet<BindKey>,
}

#[derive(Debug)]
enum Operation {
    DeclareExchange(ExchangeDeclaration),
    DeclareQueue(QueueDeclaration),
    Bind(QueueBinding, BindKey),
    Unbind(QueueBinding, BindKey),
}

struct TopologyTask {
    operation: Operation,
    cancel: CancellationToken,
    done: oneshot::Sender<Result<(), Error>>,
}

impl Declared {
    fn is_satisfied(&self, operation: &Operation) -> bool {
        match operation {
            Operation::DeclareExchange(exchange) => {
                exchange.is_default() || self.exchanges.contains(&exchange.name)
            }
            Operation::DeclareQueue(queue) => self.queues.contains(&queue.name),
            Operation::Bind(binding, key) => {
                binding.targets_default_exchange() || self.bindings.contains(key)
            }
            Operation::Unbind(binding, _) => binding.targets_default_exchange(),
        }
    }

    fn record(&mut self, operation: Operation) {
        match operation {
            Operation::DeclareExchange(exchange) => {
                if !exchange.auto_delete {
                    self.exchanges.insert(exchange.name);
                }
            }
            Operation::DeclareQueue(queue) => {
                if queue.auto_delete {
                    self.queues.insert(queue.name);
                }
            }
            Operation::Bind(_, key) => {
                self.bindings.insert(key);
            }
            Operation::Unbind(_, key) => {
                self.bindings.remove(&key);
            }
        }
    }
}

impl Operation {
    fn describe(&self) -> String {
        match self {
            Self::DeclareExchange(exchange) => format!("declare exchange `{}`", exchange.name),
            Self::DeclareQueue(queue) => format!("declare queue `{}`", queue.name),
            Self::Bind(binding, _) => format!(
                "bind queue `{}` to exchange `{}` with routing key `{}`",
                binding.queue, binding.exchange, binding.routing_key
            ),
            Self::Unbind(binding, _) => format!(
                "unbind queue `{}` from exchange `{}` with routing key `{}`",
                binding.queue, binding.exchange, binding.routing_key
            ),
        }
    }

    async fn execute(&self, channel: &Channel) -> Result<(), anyhow::Error> {
        match self {
            Self::DeclareExchange(exchange) => channel.declare_exchange(exchange).await,
            Self::DeclareQueue(queue) => channel.declare_queue(queue).await,
            Self::Bind(binding, _) => channel.bind_queue(binding).await,
            Self::Unbind(binding, _) => channel.unbind_queue(binding).await,
        }
    }
}

impl TopologyCoordinator {
    /// The dedicated channel is created on the first operation that needs the network.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(connection_manager: Arc<ConnectionManager>) -> Self {
        let (tasks, receiver) = mpsc::unbounded_channel();
        let declared = Arc::new(Mutex::new(Declared::default()));
        let worker = Worker {
            connection_manager,
            channel: None,
            declared: Arc::clone(&declared),
        };
        Self {
            tasks: Some(tasks),
            declared,
            worker: Some(tokio::spawn(worker.run(receiver))),
        }
    }

    pub async fn declare_exchange(
        &self,
        exchange: ExchangeDeclaration,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.submit(Operation::DeclareExchange(exchange), cancel)
            .await
    }

    pub async fn declare_queue(
        &self,
        queue: QueueDeclaration,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.submit(Operation::DeclareQueue(queue), cancel).await
    }

    pub async fn bind(&self, binding: QueueBinding, cancel: &CancellationToken) -> Result<(), Error> {
        let key = BindKey::new(&binding);
        self.submit(Operation::Bind(binding, key), cancel).await
    }

    pub async fn unbind(
        &self,
        binding: QueueBinding,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let key = BindKey::new(&binding);
        self.submit(Operation::Unbind(binding, key), cancel).await
    }

    /// Wait for the queued operations to complete, then close the dedicated channel.
    pub async fn close(mut self) {
        self.tasks.take();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!("The topology worker did not shut down cleanly: {:?}", e);
            }
        }
    }

    async fn submit(&self, operation: Operation, cancel: &CancellationToken) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.declared.lock().await.is_satisfied(&operation) {
            debug!("Skipping `{}`, already done", operation.describe());
            return Ok(());
        }
        let tasks = self
            .tasks
            .as_ref()
            .ok_or(Error::ShutDown("topology coordinator"))?;
        let (done, outcome) = oneshot::channel();
        tasks
            .send(TopologyTask {
                operation,
                cancel: cancel.clone(),
                done,
            })
            .map_err(|_| Error::ShutDown("topology coordinator"))?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            outcome = outcome => outcome.unwrap_or(Err(Error::ShutDown("topology coordinator"))),
        }
    }
}

impl Drop for TopologyCoordinator {
    fn drop(&mut self) {
        // Without the sender the worker drains what is queued, closes its channel and exits.
        self.tasks.take();
    }
}

struct Worker {
    connection_manager: Arc<ConnectionManager>,
    /// The dedicated channel, recreated when found closed.
    channel: Option<Channel>,
    declared: Arc<Mutex<Declared>>,
}

impl Worker {
    async fn run(mut self, mut tasks: mpsc::UnboundedReceiver<TopologyTask>) {
        while let Some(task) = tasks.recv().await {
            if task.done.is_closed() {
                // The caller gave up.
                continue;
            }
            let outcome = tokio::select! {
                biased;
                _ = task.cancel.cancelled() => Err(Error::Cancelled),
                outcome = self.perform(task.operation) => outcome,
            };
            let _ = task.done.send(outcome);
        }
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                warn!(channel = %channel.id(), "Failed to close the topology channel: {:?}", e);
            }
        }
    }

    #[tracing::instrument(name = "topology_operation", skip_all, fields(operation = %operation.describe()))]
    async fn perform(&mut self, operation: Operation) -> Result<(), Error> {
        // An identical operation queued earlier may have completed in the meantime.
        if self.declared.lock().await.is_satisfied(&operation) {
            debug!("Already done");
            return Ok(());
        }
        let channel = self.channel(&CancellationToken::new()).await?;
        match operation.execute(&channel).await {
            Ok(()) => {
                self.declared.lock().await.record(operation);
                Ok(())
            }
            Err(source) => {
                warn!("Topology operation failed: {:?}", source);
                Err(Error::Topology {
                    operation: operation.describe(),
                    source,
                })
            }
        }
    }

    async fn channel(&mut self, cancel: &CancellationToken) -> Result<Channel, Error> {
        if let Some(channel) = self.channel.as_ref().filter(|channel| channel.is_open()) {
            return Ok(channel.clone());
        }
        let channel = self.connection_manager.create_channel(cancel).await?;
        debug!(channel = %channel.id(), "Opened the topology channel");
        self.channel = Some(channel.clone());
        Ok(channel)
    }
}
