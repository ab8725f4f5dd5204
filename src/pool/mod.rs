//! Channel pools multiplexed over a single broker connection.
//!
//! This module provides a hierarchy of pools:
//! - [`StaticChannelPool`] serves leases from a fixed set of channels, in rotation.
//! - [`DynamicChannelPool`] lets you add and remove channels at runtime.
//! - [`ResilientChannelPool`] restores a fixed number of channels before serving a lease.
//! - [`AutoScalingChannelPool`] grows and shrinks between two bounds following the demand.
//!
//! All of them evict channels that closed for good, and re-admit recoverable channels once
//! the broker brings them back.
//! [`PoolFactory`] builds and memoizes named pools.
//!
//! ```rust
//! use std::sync::Arc;
//! use carrot_pool::amqp::configuration::{PoolSettings, RabbitMqSettings};
//! use carrot_pool::pool::{ConnectionManager, PoolFactory};
//! use tokio_util::sync::CancellationToken;
//!
//! // Function for asyncness.
//! async fn example() -> Result<(), carrot_pool::Error> {
//!     // initialize rabbitmq connection details and config.
//!     let settings = RabbitMqSettings::default();
//!     let connection_manager = Arc::new(ConnectionManager::from_settings(&settings)?);
//!
//!     let factory = PoolFactory::new(connection_manager, PoolSettings::default());
//!     let pool = factory.get_pool(Some("publishers")).await?;
//!
//!     // lease a channel from the pool.
//!     let channel = pool.lease(&CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

mod auto_scaling;
mod connection;
mod dynamic;
mod factory;
mod request_queue;
mod resilient;
mod static_pool;
mod worker;

use tokio_util::sync::CancellationToken;

use crate::transport::Channel;
use crate::Error;

pub use auto_scaling::{AutoScalingChannelPool, ScalingDecision};
pub use connection::ConnectionManager;
pub use dynamic::DynamicChannelPool;
pub use factory::{PoolFactory, DEFAULT_POOL_NAME};
pub use resilient::ResilientChannelPool;
pub use static_pool::StaticChannelPool;

/// A snapshot of a pool's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Channels leases are served from.
    pub open: usize,
    /// Recoverable channels that are closed, waiting for their recovery.
    pub recovering: usize,
    /// Lease requests waiting for a channel.
    pub pending: usize,
}

impl PoolStats {
    /// The number of channels the pool holds, open or recovering.
    pub fn size(&self) -> usize {
        self.open + self.recovering
    }
}

/// A pool handing out [`Channel`]s.
#[async_trait::async_trait]
pub trait ChannelPool: Send + Sync {
    fn name(&self) -> &str;

    /// Lease a channel, waiting for one to be available.
    ///
    /// The pool does not keep track of leases: nothing prevents two callers from using the
    /// same channel at the same time. Using a leased channel exclusively is up to the caller.
    ///
    /// If `cancel` fires before a channel is handed out, the lease fails with
    /// [`Error::Cancelled`] and the other pending leases are not affected.
    async fn lease(&self, cancel: &CancellationToken) -> Result<Channel, Error>;

    async fn stats(&self) -> Result<PoolStats, Error>;
}

/// assert it's object safe
type _CHECK = Box<dyn ChannelPool>;
