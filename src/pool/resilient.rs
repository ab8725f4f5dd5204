use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ChannelPool, ConnectionManager, DynamicChannelPool, PoolStats};
use crate::amqp::configuration::ResilientSettings;
use crate::transport::Channel;
use crate::Error;

/// A pool that restores a fixed number of channels before serving each lease.
///
/// No channel is created up front: the first lease creates all of them.
/// Channels that close for good are evicted as usual, and replaced on the next lease.
pub struct ResilientChannelPool {
    pool: DynamicChannelPool,
    connection_manager: Arc<ConnectionManager>,
    channel_count: usize,
    /// Serialises top-ups, so that concurrent leases do not overshoot `channel_count`.
    top_up: Mutex<()>,
}

impl ResilientChannelPool {
    /// Must be called from within a tokio runtime.
    pub fn new(
        name: &str,
        connection_manager: Arc<ConnectionManager>,
        settings: &ResilientSettings,
    ) -> Result<Self, Error> {
        settings.validate()?;
        Ok(Self {
            pool: DynamicChannelPool::new(name, Vec::new()),
            connection_manager,
            channel_count: settings.channel_count,
            top_up: Mutex::new(()),
        })
    }

    async fn restore_channels(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let _top_up = self.top_up.lock().await;
        let missing = self
            .channel_count
            .saturating_sub(self.pool.stats().await?.size());
        if missing == 0 {
            return Ok(());
        }
        info!(pool = %self.name(), missing, "Restoring channels");
        for _ in 0..missing {
            let channel = self.connection_manager.create_channel(cancel).await?;
            self.pool.add([channel])?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelPool for ResilientChannelPool {
    fn name(&self) -> &str {
        self.pool.name()
    }

    #[tracing::instrument(name = "channel_pool_lease", skip_all, fields(pool = %self.name()))]
    async fn lease(&self, cancel: &CancellationToken) -> Result<Channel, Error> {
        self.restore_channels(cancel).await?;
        self.pool.lease(cancel).await
    }

    async fn stats(&self) -> Result<PoolStats, Error> {
        self.pool.stats().await
    }
}
