//! Ordered, idempotent declaration of exchanges, queues and bindings.
//!
//! ```rust
//! use std::sync::Arc;
//! use carrot_pool::amqp::configuration::RabbitMqSettings;
//! use carrot_pool::amqp::declarations::{ExchangeDeclaration, QueueBinding, QueueDeclaration};
//! use carrot_pool::amqp::ExchangeKind;
//! use carrot_pool::pool::ConnectionManager;
//! use carrot_pool::topology::TopologyCoordinator;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example() -> Result<(), carrot_pool::Error> {
//!     let settings = RabbitMqSettings::default();
//!     let connection_manager = Arc::new(ConnectionManager::from_settings(&settings)?);
//!     let topology = TopologyCoordinator::new(connection_manager);
//!     let cancel = CancellationToken::new();
//!
//!     topology
//!         .declare_exchange(ExchangeDeclaration::durable("payments", ExchangeKind::Topic), &cancel)
//!         .await?;
//!     topology
//!         .declare_queue(QueueDeclaration::durable("payments.settled"), &cancel)
//!         .await?;
//!     topology
//!         .bind(QueueBinding::new("payments.settled", "payments", "settled.#"), &cancel)
//!         .await?;
//!     Ok(())
//! }
//! ```

mod bind_key;
mod coordinator;

pub use coordinator::TopologyCoordinator;
