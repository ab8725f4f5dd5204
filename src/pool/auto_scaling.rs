use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChannelPool, ConnectionManager, DynamicChannelPool, PoolStats};
use crate::amqp::configuration::AutoScalingSettings;
use crate::transport::Channel;
use crate::Error;

/// The outcome of one workload evaluation of an [`AutoScalingChannelPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    /// A channel was added to the pool.
    Grew,
    /// A channel was removed from the pool and will be closed once the graceful close
    /// interval has elapsed.
    Shrunk,
    Unchanged,
}

/// A pool whose size follows the demand, between
/// [`minimum_pool_size`](AutoScalingSettings::minimum_pool_size) and
/// [`maximum_pool_size`](AutoScalingSettings::maximum_pool_size).
///
/// Before each lease the pool is topped up to its minimum size.
/// Every [`refresh_interval`](AutoScalingSettings::refresh_interval) it evaluates the
/// pending lease requests per channel: above the desired average workload it opens one more
/// channel, below it retires one.
/// A retired channel stops receiving leases right away but is only closed after the
/// [`graceful_close_interval`](AutoScalingSettings::graceful_close_interval), letting
/// in-flight work complete.
pub struct AutoScalingChannelPool {
    scaler: Arc<Scaler>,
    refresh: Option<JoinHandle<()>>,
}

struct Scaler {
    pool: DynamicChannelPool,
    connection_manager: Arc<ConnectionManager>,
    settings: AutoScalingSettings,
    /// Serialises every change to the pool size, keeping it within bounds.
    resize: Mutex<()>,
}

impl AutoScalingChannelPool {
    /// Fails with [`Error::Configuration`] if `settings` are invalid.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        name: &str,
        connection_manager: Arc<ConnectionManager>,
        settings: AutoScalingSettings,
    ) -> Result<Self, Error> {
        settings.validate()?;
        let refresh_interval = settings.refresh_interval();
        let scaler = Arc::new(Scaler {
            pool: DynamicChannelPool::new(name, Vec::new()),
            connection_manager,
            settings,
            resize: Mutex::new(()),
        });
        let refresh =
            refresh_interval.map(|interval| tokio::spawn(refresh(Arc::clone(&scaler), interval)));
        Ok(Self { scaler, refresh })
    }

    /// Evaluate the workload once and resize the pool accordingly.
    ///
    /// This is what the periodic refresh does: call it directly to drive the pool when the
    /// refresh interval is disabled.
    pub async fn evaluate(&self) -> Result<ScalingDecision, Error> {
        self.scaler.evaluate().await
    }
}

impl Drop for AutoScalingChannelPool {
    fn drop(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
    }
}

#[async_trait::async_trait]
impl ChannelPool for AutoScalingChannelPool {
    fn name(&self) -> &str {
        self.scaler.pool.name()
    }

    #[tracing::instrument(name = "channel_pool_lease", skip_all, fields(pool = %self.name()))]
    async fn lease(&self, cancel: &CancellationToken) -> Result<Channel, Error> {
        self.scaler.top_up(cancel).await?;
        self.scaler.pool.lease(cancel).await
    }

    async fn stats(&self) -> Result<PoolStats, Error> {
        self.scaler.pool.stats().await
    }
}

async fn refresh(scaler: Arc<Scaler>, interval: Duration) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticks.tick().await;
    loop {
        ticks.tick().await;
        if let Err(e) = scaler.evaluate().await {
            warn!(pool = %scaler.pool.name(), "Failed to resize the channel pool: {:?}", e);
        }
    }
}

impl Scaler {
    async fn top_up(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let _resize = self.resize.lock().await;
        let missing = self
            .settings
            .minimum_pool_size
            .saturating_sub(self.pool.stats().await?.size());
        if missing == 0 {
            return Ok(());
        }
        info!(pool = %self.pool.name(), missing, "Topping up to the minimum pool size");
        for _ in 0..missing {
            let channel = self.connection_manager.create_channel(cancel).await?;
            self.pool.add([channel])?;
        }
        Ok(())
    }

    #[tracing::instrument(name = "channel_pool_evaluate", skip_all, fields(pool = %self.pool.name()))]
    async fn evaluate(&self) -> Result<ScalingDecision, Error> {
        let _resize = self.resize.lock().await;
        let stats = self.pool.stats().await?;
        let size = stats.size();
        let work_per_channel = if size == 0 {
            0.0
        } else {
            stats.pending as f64 / size as f64
        };
        let desired = self.settings.desired_average_workload;
        debug!(size, pending = stats.pending, work_per_channel, "Evaluating workload");

        if size < self.settings.maximum_pool_size && work_per_channel > desired {
            // Bounded so that a slow broker does not stall the next evaluations.
            let attempt = self.settings.refresh_interval().unwrap_or(Duration::MAX);
            let channel = timeout(
                attempt,
                self.connection_manager.create_channel(&CancellationToken::new()),
            )
            .await
            .map_err(|_| {
                Error::Transport(anyhow::anyhow!(
                    "Timed out while trying to open a new channel."
                ))
            })??;
            info!(size = size + 1, "Scaling the channel pool up");
            self.pool.add([channel])?;
            return Ok(ScalingDecision::Grew);
        }

        if self.settings.minimum_pool_size < size && work_per_channel < desired {
            let Some(channel) = self.pool.remove_count(1).await?.pop() else {
                return Ok(ScalingDecision::Unchanged);
            };
            info!(size = size - 1, channel = %channel.id(), "Scaling the channel pool down");
            tokio::spawn(close_gracefully(
                channel,
                self.settings.graceful_close_interval(),
            ));
            return Ok(ScalingDecision::Shrunk);
        }

        Ok(ScalingDecision::Unchanged)
    }
}

/// Close `channel` once in-flight work had `grace` to complete.
async fn close_gracefully(channel: Channel, grace: Duration) {
    tokio::time::sleep(grace).await;
    if let Err(e) = channel.close().await {
        warn!(channel = %channel.id(), "Failed to close a retired channel: {:?}", e);
    }
}
