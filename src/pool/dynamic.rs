use tokio_util::sync::CancellationToken;

use super::worker::{PoolHandle, Removal};
use super::{ChannelPool, PoolStats};
use crate::transport::Channel;
use crate::Error;

/// A [`StaticChannelPool`](super::StaticChannelPool) whose channels can be added and removed
/// at runtime.
///
/// Cloning the pool gives another handle to the same pool.
#[derive(Clone)]
pub struct DynamicChannelPool {
    handle: PoolHandle,
}

impl DynamicChannelPool {
    /// Must be called from within a tokio runtime.
    pub fn new(name: &str, channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            handle: PoolHandle::spawn(name, channels.into_iter().collect()),
        }
    }

    /// Add channels to the rotation. Channels already in the pool are skipped.
    pub fn add(&self, channels: impl IntoIterator<Item = Channel>) -> Result<(), Error> {
        self.handle.add(channels.into_iter().collect())
    }

    /// Remove channels from the pool, open or recovering.
    ///
    /// The removed channels are returned, still open: closing them is up to the caller.
    pub async fn remove(&self, channels: &[Channel]) -> Result<Vec<Channel>, Error> {
        self.handle
            .remove(Removal::Channels(
                channels.iter().map(|channel| channel.id()).collect(),
            ))
            .await
    }

    /// Remove up to `count` channels from the pool, open channels first.
    ///
    /// The removed channels are returned, still open: closing them is up to the caller.
    pub async fn remove_count(&self, count: usize) -> Result<Vec<Channel>, Error> {
        self.handle.remove(Removal::Count(count)).await
    }
}

#[async_trait::async_trait]
impl ChannelPool for DynamicChannelPool {
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
