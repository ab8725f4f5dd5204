use crate::amqp::declarations::QueueBinding;

/// Identifies a binding in the coordinator's cache.
///
/// Arguments are kept sorted by key, so the order they were inserted in never matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct BindKey {
    queue: String,
    exchange: String,
    routing_key: String,
    arguments: Vec<(String, String)>,
}

impl BindKey {
    pub(crate) fn new(binding: &QueueBinding) -> Self {
        // `FieldTable` is backed by a `BTreeMap`: iteration is already sorted by key.
        let arguments = binding
            .arguments
            .inner()
            .iter()
            .map(|(name, value)| (name.as_str().to_owned(), format!("{value:?}")))
            .collect();
        Self {
            queue: binding.queue.clone(),
            exchange: binding.exchange.clone(),
            routing_key: binding.routing_key.clone(),
            arguments,
        }
    }
}
