use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::info;

use super::{AutoScalingChannelPool, ChannelPool, ConnectionManager, ResilientChannelPool};
use crate::amqp::configuration::{PoolKind, PoolSettings};
use crate::Error;

/// The name of the pool returned by [`PoolFactory::get_pool`] when no name is given.
pub const DEFAULT_POOL_NAME: &str = "default";

type PoolCell = Arc<OnceCell<Arc<dyn ChannelPool>>>;

/// Builds and memoizes named channel pools sharing one [`ConnectionManager`].
///
/// Each pool is built lazily, the first time its name is requested, and exactly once:
/// concurrent first requests for the same name all get the same pool.
/// [`PoolSettings`] determine which kind of pool is built for each name.
pub struct PoolFactory {
    connection_manager: Arc<ConnectionManager>,
    settings: PoolSettings,
    pools: Mutex<HashMap<String, PoolCell>>,
}

impl PoolFactory {
    pub fn new(connection_manager: Arc<ConnectionManager>, settings: PoolSettings) -> Self {
        Self {
            connection_manager,
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Get the pool called `name`, or the [default pool](DEFAULT_POOL_NAME) if `None`.
    ///
    /// A pool that fails to build (e.g. invalid bounds) is not memoized: the error is returned
    /// to every caller.
    pub async fn get_pool(&self, name: Option<&str>) -> Result<Arc<dyn ChannelPool>, Error> {
        let name = name.unwrap_or(DEFAULT_POOL_NAME);
        let cell = Arc::clone(
            self.pools
                .lock()
                .await
                .entry(name.to_owned())
                .or_default(),
        );
        let pool = cell.get_or_try_init(|| async { self.build(name) }).await?;
        Ok(Arc::clone(pool))
    }

    fn build(&self, name: &str) -> Result<Arc<dyn ChannelPool>, Error> {
        let connection_manager = Arc::clone(&self.connection_manager);
        let pool: Arc<dyn ChannelPool> = match self.settings.kind_for(name) {
            PoolKind::Resilient(settings) => Arc::new(ResilientChannelPool::new(
                name,
                connection_manager,
                settings,
            )?),
            PoolKind::AutoScaling(settings) => Arc::new(AutoScalingChannelPool::new(
                name,
                connection_manager,
                settings.clone(),
            )?),
        };
        info!(pool = name, "Channel pool created");
        Ok(pool)
    }
}
