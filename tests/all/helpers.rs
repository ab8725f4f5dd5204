use std::sync::Arc;
use std::time::Duration;

use carrot_pool::pool::{ChannelPool, ConnectionManager, PoolStats};
use carrot_pool::transport::memory::{MemoryBroker, MemoryChannel};
use carrot_pool::transport::Channel;
use tokio_util::sync::CancellationToken;

pub const CLIENT_NAME: &str = "carrot-pool-tests";

pub fn get_connection_manager(broker: &MemoryBroker) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(
        broker.clone(),
        vec!["localhost".into()],
        CLIENT_NAME,
    ))
}

pub async fn open_channels(manager: &ConnectionManager, count: usize) -> Vec<Channel> {
    let mut channels = Vec::with_capacity(count);
    for _ in 0..count {
        channels.push(manager.create_channel(&never()).await.unwrap());
    }
    channels
}

/// A token nobody cancels.
pub fn never() -> CancellationToken {
    CancellationToken::new()
}

/// The broker side of `channel`.
pub fn on_broker(broker: &MemoryBroker, channel: &Channel) -> Arc<MemoryChannel> {
    broker.channel(channel.id()).unwrap()
}

pub async fn stats(pool: &dyn ChannelPool) -> PoolStats {
    pool.stats().await.unwrap()
}

/// Poll `condition` until it holds, panicking after a couple of seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..POLL_ATTEMPTS {
        if condition() {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("Timed out waiting for: {what}");
}

/// Poll the stats of `pool` until `condition` holds, panicking after a couple of seconds.
pub async fn wait_for_stats(
    pool: &dyn ChannelPool,
    what: &str,
    condition: impl Fn(PoolStats) -> bool,
) -> PoolStats {
    for _ in 0..POLL_ATTEMPTS {
        let stats = stats(pool).await;
        if condition(stats) {
            return stats;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("Timed out waiting for: {what}");
}

const POLL_ATTEMPTS: usize = 200;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
