//! `carrot-pool` shares a single RabbitMq connection between many concurrent publishers and
//! consumers, built on top of [`lapin`].
//!
//! It provides:
//! - [channel pools](crate::pool) handing out channels in rotation, evicting the ones that
//!   closed for good, re-admitting the ones that recovered, and resizing themselves on demand;
//! - a [`TopologyCoordinator`](crate::topology::TopologyCoordinator) declaring exchanges,
//!   queues and bindings one at a time on a dedicated channel, skipping what is already there.
//!
//! [`ConnectionManager`](crate::pool::ConnectionManager) owns the connection both rely on.
//!
//! ## Testing
//!
//! [`transport::memory`] implements the connection and channel primitives in-process, so
//! pools and the topology coordinator can be exercised without a broker.

pub mod amqp;
mod error;
pub mod pool;
pub mod topology;
pub mod transport;

pub use error::Error;
