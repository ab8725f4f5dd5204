//! The boundary with the connection/channel primitives.
//!
//! The pools and the topology coordinator never talk to [`lapin`] directly: they go through
//! [`Connector`], [`ConnectionPrimitive`] and [`ChannelPrimitive`].
//! [`rabbitmq`] implements them on top of [`lapin`], [`memory`] implements them in-process
//! for tests.
//!
//! Connections and channels publish their [`LinkState`] through a [`watch`] channel: that is
//! how closures initiated by the broker and recoveries reach the rest of the crate.
//!
//! [`lapin`]: https://docs.rs/crate/lapin
use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::amqp::declarations::{ExchangeDeclaration, QueueBinding, QueueDeclaration};

pub mod memory;
pub mod rabbitmq;

/// Who asked for a connection or a channel to be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    /// This process closed it on purpose. It will never come back.
    Application,
    /// The client library closed it, e.g. after a protocol error.
    Library,
    /// The broker closed it.
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub initiator: CloseInitiator,
    pub code: u16,
    pub text: String,
}

impl CloseReason {
    pub fn application(text: impl Into<String>) -> Self {
        Self {
            initiator: CloseInitiator::Application,
            code: 200,
            text: text.into(),
        }
    }

    pub fn library(text: impl Into<String>) -> Self {
        Self {
            initiator: CloseInitiator::Library,
            code: 541,
            text: text.into(),
        }
    }

    pub fn peer(code: u16, text: impl Into<String>) -> Self {
        Self {
            initiator: CloseInitiator::Peer,
            code,
            text: text.into(),
        }
    }

    pub fn is_application_initiated(&self) -> bool {
        self.initiator == CloseInitiator::Application
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "closed by {:?} ({}): {}",
            self.initiator, self.code, self.text
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Open,
    Closed(CloseReason),
}

impl LinkState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            Self::Open => None,
            Self::Closed(reason) => Some(reason),
        }
    }
}

/// Identifies a channel for as long as the process lives, across connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Establishes connections to one of a list of candidate hosts.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        hosts: &[String],
        client_name: &str,
    ) -> Result<Arc<dyn ConnectionPrimitive>, anyhow::Error>;
}

/// A physical connection to the broker.
#[async_trait::async_trait]
pub trait ConnectionPrimitive: Send + Sync + 'static {
    fn state(&self) -> LinkState;

    /// Observe state transitions, including recoveries.
    fn subscribe(&self) -> watch::Receiver<LinkState>;

    /// Whether the connection re-establishes itself after a closure it did not ask for.
    fn supports_recovery(&self) -> bool;

    async fn create_channel(&self) -> Result<Channel, anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A logical channel multiplexed over a [`ConnectionPrimitive`].
#[async_trait::async_trait]
pub trait ChannelPrimitive: Send + Sync + 'static {
    fn id(&self) -> ChannelId;

    fn state(&self) -> LinkState;

    fn subscribe(&self) -> watch::Receiver<LinkState>;

    fn supports_recovery(&self) -> bool;

    fn as_any(&self) -> &dyn Any;

    async fn declare_exchange(&self, declaration: &ExchangeDeclaration)
        -> Result<(), anyhow::Error>;

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), anyhow::Error>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), anyhow::Error>;

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), anyhow::Error>;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A cheap, cloneable handle to a channel.
///
/// This is what the pools hand out. Cloning it does not open a new channel: all clones
/// share the same underlying primitive.
#[derive(Clone)]
pub struct Channel(Arc<dyn ChannelPrimitive>);

impl Channel {
    pub fn new(primitive: impl ChannelPrimitive) -> Self {
        Self(Arc::new(primitive))
    }

    pub fn is_open(&self) -> bool {
        self.0.state().is_open()
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.0.state() {
            LinkState::Open => None,
            LinkState::Closed(reason) => Some(reason),
        }
    }

    /// Get access to the concrete primitive, e.g. a [`RabbitMqChannel`](rabbitmq::RabbitMqChannel)
    /// to publish messages.
    pub fn downcast_ref<T: ChannelPrimitive>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }
}

impl Deref for Channel {
    type Target = dyn ChannelPrimitive;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl From<Arc<dyn ChannelPrimitive>> for Channel {
    fn from(primitive: Arc<dyn ChannelPrimitive>) -> Self {
        Self(primitive)
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
