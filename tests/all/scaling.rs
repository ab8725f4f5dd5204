use std::sync::Arc;
use std::time::Duration;

use carrot_pool::amqp::configuration::{AutoScalingSettings, ResilientSettings};
use carrot_pool::pool::{AutoScalingChannelPool, ChannelPool, ResilientChannelPool, ScalingDecision};
use carrot_pool::transport::memory::MemoryBroker;
use carrot_pool::transport::CloseInitiator;
use carrot_pool::Error;

use crate::helpers::{get_connection_manager, never, on_broker, stats, wait_for_stats, wait_until};

fn manual_scaling(minimum_pool_size: usize, maximum_pool_size: usize) -> AutoScalingSettings {
    AutoScalingSettings {
        minimum_pool_size,
        maximum_pool_size,
        desired_average_workload: 0.5,
        refresh_interval_ms: None,
        graceful_close_interval_ms: 0,
    }
}

#[tokio::test]
async fn a_resilient_pool_opens_its_channels_on_the_first_lease() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = ResilientChannelPool::new(
        "resilient",
        get_connection_manager(&broker),
        &ResilientSettings { channel_count: 3 },
    )
    .unwrap();
    assert_eq!(0, broker.connection_attempts());

    // Act
    for _ in 0..6 {
        pool.lease(&never()).await.unwrap();
    }

    // Assert
    assert_eq!(3, broker.channels_created());
    assert_eq!(3, stats(&pool).await.open);
}

#[tokio::test]
async fn a_resilient_pool_replaces_channels_closed_for_good() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = ResilientChannelPool::new(
        "resilient",
        get_connection_manager(&broker),
        &ResilientSettings { channel_count: 2 },
    )
    .unwrap();
    let leased = pool.lease(&never()).await.unwrap();

    // Act
    on_broker(&broker, &leased).fail(406, "PRECONDITION_FAILED");
    let replacement = pool.lease(&never()).await.unwrap();

    // Assert
    assert_ne!(leased, replacement);
    assert_eq!(3, broker.channels_created());
    assert_eq!(2, stats(&pool).await.open);
}

#[tokio::test]
async fn a_resilient_pool_needs_at_least_one_channel() {
    let broker = MemoryBroker::new();

    let outcome = ResilientChannelPool::new(
        "resilient",
        get_connection_manager(&broker),
        &ResilientSettings { channel_count: 0 },
    );

    assert!(matches!(outcome, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn invalid_bounds_are_rejected_before_connecting() {
    // Arrange
    let broker = MemoryBroker::new();
    let invalid = [
        manual_scaling(0, 3),
        manual_scaling(4, 3),
        AutoScalingSettings {
            refresh_interval_ms: Some(0),
            ..manual_scaling(1, 3)
        },
    ];

    for settings in invalid {
        // Act
        let outcome =
            AutoScalingChannelPool::new("scaling", get_connection_manager(&broker), settings);

        // Assert
        assert!(matches!(outcome, Err(Error::Configuration(_))));
    }
    assert_eq!(0, broker.connection_attempts());
}

#[tokio::test]
async fn equal_bounds_are_valid() {
    let broker = MemoryBroker::new();

    let pool = AutoScalingChannelPool::new(
        "scaling",
        get_connection_manager(&broker),
        manual_scaling(2, 2),
    )
    .unwrap();
    pool.lease(&never()).await.unwrap();

    assert_eq!(2, broker.channels_created());
}

#[tokio::test]
async fn an_auto_scaling_pool_grows_under_load_then_shrinks_back() {
    // Arrange
    let broker = MemoryBroker::recoverable();
    let pool = AutoScalingChannelPool::new(
        "scaling",
        get_connection_manager(&broker),
        manual_scaling(1, 2),
    )
    .unwrap();
    let first = pool.lease(&never()).await.unwrap();
    assert_eq!(1, broker.channels_created());
    on_broker(&broker, &first).fail(320, "CONNECTION_FORCED");

    let cancel = never();

    // Act
    let (lease, decision) = tokio::join!(pool.lease(&cancel), async {
        wait_for_stats(&pool, "the lease to be pending", |stats| stats.pending == 1).await;
        pool.evaluate().await.unwrap()
    });

    // Assert
    assert_eq!(ScalingDecision::Grew, decision);
    let second = lease.unwrap();
    assert_ne!(first, second);
    assert_eq!(2, stats(&pool).await.size());

    // Act
    let decision = pool.evaluate().await.unwrap();

    // Assert
    assert_eq!(ScalingDecision::Shrunk, decision);
    assert_eq!(1, stats(&pool).await.size());
    wait_until("the retired channel to be closed", || {
        second
            .close_reason()
            .is_some_and(|reason| reason.initiator == CloseInitiator::Application)
    })
    .await;

    // Act
    let decision = pool.evaluate().await.unwrap();

    // Assert
    assert_eq!(ScalingDecision::Unchanged, decision);
}

#[tokio::test]
async fn an_auto_scaling_pool_stays_within_its_bounds() {
    // Arrange
    let broker = MemoryBroker::recoverable();
    let pool = Arc::new(
        AutoScalingChannelPool::new(
            "scaling",
            get_connection_manager(&broker),
            manual_scaling(1, 3),
        )
        .unwrap(),
    );
    pool.lease(&never()).await.unwrap();

    for _ in 0..5 {
        // Act: every channel goes down while leases pile up.
        for channel in broker.channels() {
            channel.fail(320, "CONNECTION_FORCED");
        }
        let waiting: Vec<_> = (0..4)
            .map(|_| {
                tokio::spawn({
                    let pool = Arc::clone(&pool);
                    async move { pool.lease(&never()).await }
                })
            })
            .collect();
        wait_for_stats(pool.as_ref(), "the leases to be pending", |stats| {
            stats.pending == 4
        })
        .await;
        let _ = pool.evaluate().await.unwrap();

        // Assert
        assert!(stats(pool.as_ref()).await.size() <= 3);

        // Act: everything comes back and the load is gone.
        for channel in broker.channels() {
            channel.recover();
        }
        for lease in waiting {
            lease.await.unwrap().unwrap();
        }
        for _ in 0..3 {
            let _ = pool.evaluate().await.unwrap();
        }

        // Assert
        let size = stats(pool.as_ref()).await.size();
        assert!((1..=3).contains(&size));
    }
}

#[tokio::test(start_paused = true)]
async fn the_refresh_timer_grows_the_pool_under_load() {
    // Arrange
    let broker = MemoryBroker::recoverable();
    let pool = Arc::new(
        AutoScalingChannelPool::new(
            "scaling",
            get_connection_manager(&broker),
            AutoScalingSettings {
                refresh_interval_ms: Some(1_000),
                graceful_close_interval_ms: 60_000,
                ..manual_scaling(1, 2)
            },
        )
        .unwrap(),
    );
    let first = pool.lease(&never()).await.unwrap();
    on_broker(&broker, &first).fail(320, "CONNECTION_FORCED");

    // Act
    let lease = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.lease(&never()).await }
    });
    wait_for_stats(pool.as_ref(), "the lease to be pending", |stats| {
        stats.pending == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Assert
    assert!(!lease.is_finished());
    assert_eq!(1, broker.channels_created());

    // Act
    let second = tokio::time::timeout(Duration::from_secs(2), lease)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // Assert
    assert_ne!(first, second);
    assert_eq!(2, broker.channels_created());
}

#[tokio::test(start_paused = true)]
async fn a_retired_channel_is_closed_once_the_grace_period_elapses() {
    // Arrange
    let broker = MemoryBroker::recoverable();
    let pool = AutoScalingChannelPool::new(
        "scaling",
        get_connection_manager(&broker),
        AutoScalingSettings {
            graceful_close_interval_ms: 5_000,
            ..manual_scaling(1, 2)
        },
    )
    .unwrap();
    let first = pool.lease(&never()).await.unwrap();
    on_broker(&broker, &first).fail(320, "CONNECTION_FORCED");
    let cancel = never();
    let (lease, decision) = tokio::join!(pool.lease(&cancel), async {
        wait_for_stats(&pool, "the lease to be pending", |stats| stats.pending == 1).await;
        pool.evaluate().await.unwrap()
    });
    assert_eq!(ScalingDecision::Grew, decision);
    let retired = lease.unwrap();

    // Act
    assert_eq!(ScalingDecision::Shrunk, pool.evaluate().await.unwrap());
    tokio::time::sleep(Duration::from_millis(4_900)).await;

    // Assert
    assert!(retired.is_open());

    // Act
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Assert
    wait_until("the retired channel to be closed", || {
        retired
            .close_reason()
            .is_some_and(|reason| reason.initiator == CloseInitiator::Application)
    })
    .await;
}
