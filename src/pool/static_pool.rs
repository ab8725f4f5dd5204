use tokio_util::sync::CancellationToken;

use super::worker::PoolHandle;
use super::{ChannelPool, PoolStats};
use crate::transport::Channel;
use crate::Error;

/// A pool serving leases from a fixed set of channels, in rotation.
///
/// Channels that close for good are evicted and never replaced: once none is left, leases
/// fail with [`Error::ChannelAvailability`].
/// Recoverable channels leave the rotation while closed and join it again once recovered.
///
/// Cloning the pool gives another handle to the same pool.
#[derive(Clone)]
pub struct StaticChannelPool {
    handle: PoolHandle,
}

impl StaticChannelPool {
    /// Must be called from within a tokio runtime.
    pub fn new(name: &str, channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            handle: PoolHandle::spawn(name, channels.into_iter().collect()),
        }
    }
}

#[async_trait::async_trait]
impl ChannelPool for StaticChannelPool {
    fn name(&self) -> &str {
        self.handle.name()
    }

    #[tracing::instrument(name = "channel_pool_lease", skip_all, fields(pool = %self.name()))]
    async fn lease(&self, cancel: &CancellationToken) -> Result<Channel, Error> {
        self.handle.lease(cancel).await
    }

    async fn stats(&self) -> Result<PoolStats, Error> {
        self.handle.stats().await
    }
}
