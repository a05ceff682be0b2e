//! Delivery guarantees of the publish executor
//!
//! Each test scripts broker faults and checks the final outcome and the
//! exact number of attempts spent.

use bytes::Bytes;
use pubgate::broker::MemoryBroker;
use pubgate::pool::{ConnectionPool, PoolConfig};
use pubgate::{ErrorKind, PublishRequest, Publisher, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 4;

fn publisher(broker: &MemoryBroker) -> Publisher {
    let pool = ConnectionPool::new(
        broker.connector(),
        PoolConfig {
            max_size: 4,
            acquire_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(200),
            max_idle_time: Duration::from_secs(60),
        },
    );
    let retry = RetryPolicy {
        max_attempts: MAX_ATTEMPTS,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(8),
        jitter: 0.5,
    };
    Publisher::new(Arc::new(pool), retry)
}

#[tokio::test]
async fn test_clean_publish_uses_one_attempt() {
    for destination in ["test", "orders", "events.v2", "a"] {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        let outcome = publisher.publish(destination, "payload").await;

        assert!(outcome.success, "publish to {} failed", destination);
        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(outcome.error_kind, None);
        assert_eq!(broker.messages(destination).len(), 1);
    }
}

#[tokio::test]
async fn test_success_after_fewer_failures_than_budget() {
    for failures in 0..MAX_ATTEMPTS {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(failures);
        let publisher = publisher(&broker);

        let outcome = publisher.publish("test", "payload").await;

        assert!(outcome.success, "{} failures should be tolerated", failures);
        assert_eq!(outcome.attempts_used, failures + 1);
        // At-least-once: the message arrives exactly once here since failed
        // attempts never reached the queue
        assert_eq!(broker.messages("test"), vec![Bytes::from("payload")]);
    }
}

#[tokio::test]
async fn test_failures_at_or_beyond_budget_are_delivery_failed() {
    for failures in [MAX_ATTEMPTS, MAX_ATTEMPTS + 1, MAX_ATTEMPTS * 3] {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(failures);
        let publisher = publisher(&broker);

        let outcome = publisher.publish("test", "payload").await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::DeliveryFailed));
        assert_eq!(outcome.attempts_used, MAX_ATTEMPTS);
        assert_eq!(broker.publish_attempts(), MAX_ATTEMPTS as u64);
    }
}

#[tokio::test]
async fn test_invalid_destinations_are_never_retried() {
    let broker = MemoryBroker::new();
    broker.reject_destination("locked");
    let publisher = publisher(&broker);

    for destination in ["", "amq.direct", "locked"] {
        let outcome = publisher.publish(destination, "payload").await;

        assert_eq!(outcome.error_kind, Some(ErrorKind::InvalidDestination));
        assert_eq!(outcome.attempts_used, 1, "destination {:?} was retried", destination);
    }

    // Only the broker-side rejection reached the wire
    assert_eq!(broker.publish_attempts(), 1);
}

#[tokio::test]
async fn test_custom_attempt_budget_per_request() {
    let broker = MemoryBroker::new();
    broker.fail_next_publishes(10);
    let publisher = publisher(&broker);

    let request = PublishRequest::new("test", "payload", 2);
    let outcome = publisher.execute(&request).await;

    assert_eq!(outcome.attempts_used, 2);
    assert_eq!(outcome.error_kind, Some(ErrorKind::DeliveryFailed));
    // The request itself is untouched
    assert_eq!(request.attempts_remaining(), 2);
}

#[tokio::test]
async fn test_concurrent_publishes_share_the_pool() {
    let broker = MemoryBroker::new();
    broker.set_publish_delay(Duration::from_millis(2));
    let publisher = Arc::new(publisher(&broker));

    let mut tasks = Vec::new();
    for i in 0..20 {
        let publisher = Arc::clone(&publisher);
        tasks.push(tokio::spawn(async move {
            publisher.publish("bulk", format!("msg-{}", i)).await
        }));
    }

    for task in tasks {
        assert!(task.await.unwrap().success);
    }

    assert_eq!(broker.messages("bulk").len(), 20);
    assert!(broker.connections_opened() <= 4);
}

#[tokio::test]
async fn test_saturated_pool_reports_pool_exhausted() {
    let broker = MemoryBroker::new();
    let pool = Arc::new(ConnectionPool::new(
        broker.connector(),
        PoolConfig {
            max_size: 1,
            acquire_timeout: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(100),
            max_idle_time: Duration::from_secs(60),
        },
    ));
    let publisher = Publisher::new(
        Arc::clone(&pool),
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            jitter: 0.0,
        },
    );

    let held = pool.acquire().await.unwrap();
    let outcome = publisher.publish("test", "payload").await;
    pool.release(held, true).await;

    assert_eq!(outcome.error_kind, Some(ErrorKind::PoolExhausted));
    assert_eq!(outcome.attempts_used, 2);
}
