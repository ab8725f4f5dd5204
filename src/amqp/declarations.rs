//! Descriptions of the exchanges, queues and bindings managed by the
//! [`TopologyCoordinator`](crate::topology::TopologyCoordinator).
//!
//! ```
//! use carrot_pool::amqp::declarations::{ExchangeDeclaration, QueueBinding, QueueDeclaration};
//! use carrot_pool::amqp::ExchangeKind;
//!
//! let exchange = ExchangeDeclaration::durable("payments", ExchangeKind::Topic);
//! let queue = QueueDeclaration::durable("payments.settled");
//! let binding = QueueBinding::new(&queue.name, &exchange.name, "payment.settled.*");
//! # drop(binding);
//! ```
use amq_protocol_types::{AMQPValue, FieldTable};
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::ExchangeKind;

/// The name of the default exchange.
///
/// It always exists on the broker and every queue is implicitly bound to it.
pub const DEFAULT_EXCHANGE: &str = "";

/// Everything required to declare an exchange.
#[derive(Debug, Clone)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    /// The exchange survives broker restarts.
    pub durable: bool,
    /// The exchange is deleted once its last binding is removed.
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

impl ExchangeDeclaration {
    /// A durable, non auto-delete exchange.
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: FieldTable::default(),
        }
    }

    /// A transient exchange: it does not survive broker restarts.
    pub fn transient(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            durable: false,
            ..Self::durable(name, kind)
        }
    }

    /// Delete the exchange once its last binding is removed.
    #[must_use]
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_EXCHANGE
    }

    pub(crate) fn options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: false,
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            nowait: false,
        }
    }
}

/// Everything required to declare a queue.
#[derive(Debug, Clone)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

impl QueueDeclaration {
    /// A durable queue that outlives its consumers.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: FieldTable::default(),
        }
    }

    /// A transient queue, deleted once its last consumer goes away.
    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: true,
            arguments: FieldTable::default(),
        }
    }

    /// Only the declaring connection can use the queue.
    #[must_use]
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    pub(crate) fn options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: false,
        }
    }
}

/// A binding between a queue and an exchange.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

impl QueueBinding {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            arguments: FieldTable::default(),
        }
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    /// Add a single binding argument, e.g. a header to match on a headers exchange.
    #[must_use]
    pub fn with_argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    /// Bindings to the default exchange are implicit and can't be changed.
    pub fn targets_default_exchange(&self) -> bool {
        self.exchange == DEFAULT_EXCHANGE
    }

    pub(crate) fn options(&self) -> QueueBindOptions {
        QueueBindOptions { nowait: false }
    }
}
