use amq_protocol_types::{AMQPValue, LongString};
use carrot_pool::amqp::declarations::{
    ExchangeDeclaration, QueueBinding, QueueDeclaration, DEFAULT_EXCHANGE,
};
use carrot_pool::amqp::ExchangeKind;
use carrot_pool::topology::TopologyCoordinator;
use carrot_pool::transport::memory::{MemoryBroker, TopologyCall};
use carrot_pool::transport::ChannelPrimitive;
use carrot_pool::Error;
use fake::{Fake, Faker};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::helpers::{get_connection_manager, never};

fn get_coordinator(broker: &MemoryBroker) -> TopologyCoordinator {
    TopologyCoordinator::new(get_connection_manager(broker))
}

fn name() -> String {
    Uuid::new_v4().to_string()
}

fn header(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value))
}

#[tokio::test]
async fn an_exchange_is_declared_once() {
    // Arrange
    let broker = MemoryBroker::new();
    let topology = get_coordinator(&broker);
    let exchange = ExchangeDeclaration::durable(name(), ExchangeKind::Topic);

    // Act
    topology.declare_exchange(exchange.clone(), &never()).await.unwrap();
    topology.declare_exchange(exchange.clone(), &never()).await.unwrap();

    // Assert
    assert_eq!(
        vec![TopologyCall::DeclareExchange(exchange.name)],
        broker.calls()
    );
}

#[tokio::test]
async fn concurrent_declarations_of_the_same_exchange_reach_the_broker_once() {
    // Arrange
    let broker = MemoryBroker::new();
    let topology = get_coordinator(&broker);
    let exchange = ExchangeDeclaration::durable(name(), ExchangeKind::Fanout);
    let cancel = never();

    // Act
    let (first, second) = tokio::join!(
        topology.declare_exchange(exchange.clone(), &cancel),
        topology.declare_exchange(exchange.clone(), &cancel),
    );

    // Assert
    first.unwrap();
    second.unwrap();
    assert_eq!(1, broker.calls().len());
}

#[tokio::test]
async fn an_auto_delete_exchange_is_declared_every_time() {
    let broker = MemoryBroker::new();
    let topology = get_coordinator(&broker);
    let exchange = ExchangeDeclaration::transient(name(), ExchangeKind::Direct).auto_delete();

    topology.declare_exchange(exchange.clone(), &never()).await.unwrap();
    topology.declare_exchange(exchange, &never()).await.unwrap();

    assert_eq!(2, broker.calls().len());
}

#[tokio::test]
async fn only_auto_delete_queues_are_remembered() {
    // Arrange
    let broker = MemoryBroker::new();
    let topology = get_coordinator(&broker);
    let auto_delete = QueueDeclaration::transient(name());
    let durable = QueueDeclaration::durable(name());

    // Act
    for _ in 0..2 {
        topology.declare_queue(auto_delete.clone(), &never()).await.unwrap();
        topology.declare_queue(durable.clone(), &never()).await.unwrap();
    }

    // Assert
    let calls = broker.calls();
    let declarations_of = |queue: &str| {
        calls
            .iter()
            .filter(|call| **call == TopologyCall::DeclareQueue(queue.to_owned()))
            .count()
    };
    assert_eq!(1, declarations_of(&auto_delete.name));
    assert_eq!(2, declarations_of(&durable.name));
}

#[tokio::test]
async fn bindings_differing_only_by_argument_order_are_bound_once() {
    // Arrange
    let broker = MemoryBroker::new();
    let topology = get_coordinator(&broker);
    let (queue, exchange) = (name(), name());
    let currency: String = Faker.fake();
    let first = QueueBinding::new(&queue, &exchange, "")
        .with_argument("x-match", header("all"))
        .with_argument("currency", header(&currency));
    let second = QueueBinding::new(&queue, &exchange, "")
        .with_argument("currency", header(&currency))
        .with_argument("x-match", header("all"));

    // Act
    topology.bind(first, &never()).await.unwrap();
    topology.bind(second, &never()).await.unwrap();

    // Assert
    assert_eq!(1, broker.calls().len());
}

#[tokio::test]
async fn the_default_exchange_is_never_touched() {
    // Arrange
    let broker = MemoryBroker::new();
    let topology = get_coordinator(&broker);
    let binding = QueueBinding::new(name(), DEFAULT_EXCHANGE, "routing-key");

    // Act
    topology
        .declare_exchange(
            ExchangeDeclaration::durable(DEFAULT_EXCHANGE, ExchangeKind::Direct),
            &never(),
        )
        .await
        .unwrap();
    topology.bind(binding.clone(), &never()).await.unwrap();
    topology.unbind(binding, &never()).await.unwrap();

    // Assert
    assert!(broker.calls().is_empty());
    assert_eq!(0, broker.connection_attempts());
}

#[tokio::test]
async fn unbinding_forgets_the_binding() {
    // Arrange
    let broker = MemoryBroker::new();
    let topology = get_coordinator(&broker);
    let binding = QueueBinding::new(name(), name(), "payment.#");
    let (queue, exchange, routing_key) = (
        binding.queue.clone(),
        binding.exchange.clone(),
        binding.routing_key.clone(),
    );

    // Act
    topology.bind(binding.clone(), &never()).await.unwrap();
    topology.unbind(binding.clone(), &never()).await.unwrap();
    topology.bind(binding, &never()).await.unwrap();

    // Assert
    let bind = TopologyCall::Bind {
        queue: queue.clone(),
        exchange: exchange.clone(),
        routing_key: routing_key.clone(),
    };
    let unbind = TopologyCall::Unbind {
        queue,
        exchange,
        routing_key,
    };
    assert_eq!(vec![bind.clone(), unbind, bind], broker.calls());
}

#[tokio::test]
async fn a_failed_operation_only_fails_its_own_caller() {
    // Arrange
    let broker = MemoryBroker::new();
    let topology = get_coordinator(&broker);
    let (poisoned, healthy) = (name(), name());
    broker.reject(&poisoned);
    let cancel = never();

    // Act
    let (rejected, accepted) = tokio::join!(
        topology.declare_queue(QueueDeclaration::durable(&poisoned), &cancel),
        topology.declare_queue(QueueDeclaration::durable(&healthy), &cancel),
    );

    // Assert
    assert!(matches!(rejected, Err(Error::Topology { .. })));
    accepted.unwrap();
    assert_eq!(
        vec![
            TopologyCall::DeclareQueue(poisoned),
            TopologyCall::DeclareQueue(healthy)
        ],
        broker.calls()
    );
    // The rejection closed the topology channel: a new one was opened.
    assert_eq!(2, broker.channels_created());
}

#[tokio::test]
async fn topology_operations_share_a_single_dedicated_channel() {
    let broker = MemoryBroker::new();
    let topology = get_coordinator(&broker);
    let (queue, exchange) = (name(), name());

    topology
        .declare_exchange(ExchangeDeclaration::durable(&exchange, ExchangeKind::Topic), &never())
        .await
        .unwrap();
    topology
        .declare_queue(QueueDeclaration::durable(&queue), &never())
        .await
        .unwrap();
    topology
        .bind(QueueBinding::new(&queue, &exchange, "#"), &never())
        .await
        .unwrap();

    assert_eq!(3, broker.calls().len());
    assert_eq!(1, broker.channels_created());
}

#[tokio::test]
async fn an_already_cancelled_operation_is_not_sent() {
    let broker = MemoryBroker::new();
    let topology = get_coordinator(&broker);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = topology
        .declare_queue(QueueDeclaration::durable(name()), &cancel)
        .await;

    assert!(matches!(outcome, Err(Error::Cancelled)));
    assert!(broker.calls().is_empty());
}

#[tokio::test]
async fn closing_the_coordinator_closes_its_channel() {
    // Arrange
    let broker = MemoryBroker::new();
    let topology = get_coordinator(&broker);
    topology
        .declare_queue(QueueDeclaration::durable(name()), &never())
        .await
        .unwrap();

    // Act
    topology.close().await;

    // Assert
    let channel = broker.channels().pop().unwrap();
    let state = channel.state();
    assert!(state
        .close_reason()
        .is_some_and(|reason| reason.is_application_initiated()));
}

#[tokio::test]
async fn bindings_whose_names_contain_separators_are_kept_apart() {
    // Arrange
    let broker = MemoryBroker::new();
    let topology = get_coordinator(&broker);

    // Act
    topology
        .bind(QueueBinding::new("a|b", "c", ""), &never())
        .await
        .unwrap();
    topology
        .bind(QueueBinding::new("a", "b|c", ""), &never())
        .await
        .unwrap();

    // Assert
    assert_eq!(
        vec![
            TopologyCall::Bind {
                queue: "a|b".into(),
                exchange: "c".into(),
                routing_key: "".into(),
            },
            TopologyCall::Bind {
                queue: "a".into(),
                exchange: "b|c".into(),
                routing_key: "".into(),
            },
        ],
        broker.calls()
    );
}
