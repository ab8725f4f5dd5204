//! Helpers for connecting to a rabbitmq broker and describing its topology.

pub mod configuration;
pub mod declarations;
mod factory;
pub use factory::ConnectionFactory;

pub use lapin::{options, types, ExchangeKind};
