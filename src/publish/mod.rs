//! Publish executor
//!
//! Turns a (destination, payload) pair into a delivered message:
//! - acquire a pooled connection
//! - publish and wait for the broker's confirmation
//! - retry transient failures with exponential backoff, up to a fixed budget
//! - fail fast on permanent failures such as a rejected destination
//!
//! Individual transient errors are logged, never returned; callers only see
//! the final `PublishOutcome`.

mod backoff;

pub use backoff::RetryPolicy;

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::pool::{ConnectionPool, PoolError};

/// Longest queue name AMQP accepts, in bytes
const MAX_DESTINATION_LEN: usize = 255;

/// Queue names with this prefix are reserved by the broker
const RESERVED_PREFIX: &str = "amq.";

/// Why a publish did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Could not open a connection to the broker
    TransportError,
    /// No pooled connection became available in time
    PoolExhausted,
    /// The destination is malformed or refused by the broker
    InvalidDestination,
    /// Every attempt failed after reaching the broker
    DeliveryFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransportError => "TransportError",
            ErrorKind::PoolExhausted => "PoolExhausted",
            ErrorKind::InvalidDestination => "InvalidDestination",
            ErrorKind::DeliveryFailed => "DeliveryFailed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message to deliver
///
/// Immutable once built; the executor counts attempts on its own copy of
/// `attempts_remaining`.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    destination: String,
    payload: Bytes,
    attempts_remaining: u32,
}

impl PublishRequest {
    pub fn new(destination: impl Into<String>, payload: impl Into<Bytes>, attempts: u32) -> Self {
        Self {
            destination: destination.into(),
            payload: payload.into(),
            attempts_remaining: attempts,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining
    }
}

/// Final result of a publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub attempts_used: u32,
}

impl PublishOutcome {
    fn delivered(attempts_used: u32) -> Self {
        Self {
            success: true,
            error_kind: None,
            attempts_used,
        }
    }

    fn failed(kind: ErrorKind, attempts_used: u32) -> Self {
        Self {
            success: false,
            error_kind: Some(kind),
            attempts_used,
        }
    }
}

/// Check a destination name before any network I/O
pub fn validate_destination(destination: &str) -> Result<(), String> {
    if destination.is_empty() {
        return Err("destination is empty".to_string());
    }
    if destination.len() > MAX_DESTINATION_LEN {
        return Err(format!(
            "destination is {} bytes, limit is {}",
            destination.len(),
            MAX_DESTINATION_LEN
        ));
    }
    if destination.chars().any(char::is_control) {
        return Err("destination contains control characters".to_string());
    }
    if destination.starts_with(RESERVED_PREFIX) {
        return Err(format!("destination uses reserved prefix '{}'", RESERVED_PREFIX));
    }
    Ok(())
}

/// How one attempt ended, when it did not succeed
enum AttemptError {
    Transient(ErrorKind),
    Permanent(ErrorKind),
}

/// Publishes messages through a shared connection pool
pub struct Publisher {
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(pool: Arc<ConnectionPool>, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Publish `payload` to `destination` with the configured attempt budget
    pub async fn publish(
        &self,
        destination: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> PublishOutcome {
        let request = PublishRequest::new(destination, payload, self.retry.max_attempts);
        self.execute(&request).await
    }

    /// Run a request to its terminal outcome
    pub async fn execute(&self, request: &PublishRequest) -> PublishOutcome {
        let destination = request.destination();

        if let Err(reason) = validate_destination(destination) {
            warn!(destination = %destination, reason = %reason, "invalid_destination");
            return PublishOutcome::failed(ErrorKind::InvalidDestination, 1);
        }

        let mut attempts_remaining = request.attempts_remaining();
        let mut attempts_used = 0;
        let mut reached_broker = false;
        let mut last_error = ErrorKind::DeliveryFailed;

        while attempts_remaining > 0 {
            attempts_remaining -= 1;
            attempts_used += 1;

            match self.attempt(request, &mut reached_broker).await {
                Ok(()) => {
                    debug!(
                        destination = %destination,
                        bytes = request.payload().len(),
                        attempts = attempts_used,
                        "published"
                    );
                    return PublishOutcome::delivered(attempts_used);
                }
                Err(AttemptError::Permanent(kind)) => {
                    warn!(
                        destination = %destination,
                        error_kind = %kind,
                        attempts = attempts_used,
                        "publish_rejected"
                    );
                    return PublishOutcome::failed(kind, attempts_used);
                }
                Err(AttemptError::Transient(kind)) => {
                    last_error = kind;
                }
            }

            if attempts_remaining > 0 {
                let delay = self.retry.delay_for_retry(attempts_used);
                debug!(
                    destination = %destination,
                    attempt = attempts_used,
                    error_kind = %last_error,
                    delay_ms = delay.as_millis() as u64,
                    "retry_backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }

        // Only blame the pool when no attempt ever got as far as the broker
        let kind = if reached_broker {
            ErrorKind::DeliveryFailed
        } else {
            last_error
        };

        info!(
            destination = %destination,
            error_kind = %kind,
            attempts = attempts_used,
            "publish_failed"
        );
        PublishOutcome::failed(kind, attempts_used)
    }

    async fn attempt(
        &self,
        request: &PublishRequest,
        reached_broker: &mut bool,
    ) -> Result<(), AttemptError> {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(PoolError::Closed) => return Err(AttemptError::Permanent(ErrorKind::PoolExhausted)),
            Err(PoolError::Exhausted(_)) => {
                return Err(AttemptError::Transient(ErrorKind::PoolExhausted))
            }
            Err(PoolError::Connect(e)) => {
                debug!(error = %e, "acquire_failed");
                return Err(AttemptError::Transient(ErrorKind::TransportError));
            }
        };
        *reached_broker = true;

        match conn.publish(request.destination(), request.payload()).await {
            Ok(()) => {
                self.pool.release(conn, true).await;
                Ok(())
            }
            Err(e) if e.is_transient() => {
                debug!(connection = %conn.id(), error = %e, "publish_attempt_failed");
                self.pool.release(conn, false).await;
                Err(AttemptError::Transient(ErrorKind::DeliveryFailed))
            }
            Err(e) => {
                debug!(connection = %conn.id(), error = %e, "publish_attempt_rejected");
                let healthy = conn.is_open();
                self.pool.release(conn, healthy).await;
                Err(AttemptError::Permanent(ErrorKind::InvalidDestination))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::pool::PoolConfig;
    use std::time::Duration;

    fn publisher(broker: &MemoryBroker, max_attempts: u32) -> Publisher {
        let pool = ConnectionPool::new(
            broker.connector(),
            PoolConfig {
                max_size: 2,
                acquire_timeout: Duration::from_millis(50),
                connect_timeout: Duration::from_millis(50),
                max_idle_time: Duration::from_secs(60),
            },
        );
        let retry = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: 0.0,
        };
        Publisher::new(Arc::new(pool), retry)
    }

    #[test]
    fn test_validate_destination() {
        assert!(validate_destination("test").is_ok());
        assert!(validate_destination("orders.created-v2").is_ok());
        assert!(validate_destination("").is_err());
        assert!(validate_destination("amq.gen-123").is_err());
        assert!(validate_destination("bad\nname").is_err());
        assert!(validate_destination(&"q".repeat(256)).is_err());
        assert!(validate_destination(&"q".repeat(255)).is_ok());
    }

    #[test]
    fn test_error_kind_names() {
        assert_eq!(ErrorKind::DeliveryFailed.to_string(), "DeliveryFailed");
        assert_eq!(
            serde_json::to_string(&ErrorKind::InvalidDestination).unwrap(),
            "\"InvalidDestination\""
        );
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker, 3);

        let outcome = publisher.publish("test", "hello").await;

        assert_eq!(outcome, PublishOutcome::delivered(1));
        assert_eq!(broker.messages("test"), vec![Bytes::from("hello")]);
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(2);
        let publisher = publisher(&broker, 3);

        let outcome = publisher.publish("test", "hello").await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts_used, 3);
        assert_eq!(broker.messages("test").len(), 1);
        // Each failure broke its connection, so each retry reconnected
        assert_eq!(broker.connections_opened(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_report_delivery_failed() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(5);
        let publisher = publisher(&broker, 3);

        let outcome = publisher.publish("test", "hello").await;

        assert_eq!(outcome, PublishOutcome::failed(ErrorKind::DeliveryFailed, 3));
        assert!(broker.messages("test").is_empty());
    }

    #[tokio::test]
    async fn test_rejected_destination_is_not_retried() {
        let broker = MemoryBroker::new();
        broker.reject_destination("forbidden");
        let publisher = publisher(&broker, 5);

        let outcome = publisher.publish("forbidden", "hello").await;

        assert_eq!(outcome, PublishOutcome::failed(ErrorKind::InvalidDestination, 1));
        assert_eq!(broker.publish_attempts(), 1);
    }

    #[tokio::test]
    async fn test_malformed_destination_skips_broker() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker, 5);

        let outcome = publisher.publish("", "hello").await;

        assert_eq!(outcome, PublishOutcome::failed(ErrorKind::InvalidDestination, 1));
        assert_eq!(broker.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_transport_error() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(10);
        let publisher = publisher(&broker, 3);

        let outcome = publisher.publish("test", "hello").await;

        assert_eq!(outcome, PublishOutcome::failed(ErrorKind::TransportError, 3));
    }

    #[tokio::test]
    async fn test_connect_failure_then_success() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(1);
        let publisher = publisher(&broker, 3);

        let outcome = publisher.publish("test", "hello").await;

        assert_eq!(outcome, PublishOutcome::delivered(2));
    }

    #[tokio::test]
    async fn test_closed_pool_fails_fast() {
        let broker = MemoryBroker::new();
        let pool = Arc::new(ConnectionPool::new(broker.connector(), PoolConfig::default()));
        let publisher = Publisher::new(Arc::clone(&pool), RetryPolicy::default());

        pool.close().await;
        let outcome = publisher.publish("test", "hello").await;

        assert_eq!(outcome, PublishOutcome::failed(ErrorKind::PoolExhausted, 1));
    }

    #[test]
    fn test_request_is_immutable_snapshot() {
        let request = PublishRequest::new("test", "payload", 4);
        assert_eq!(request.destination(), "test");
        assert_eq!(request.payload(), &Bytes::from("payload"));
        assert_eq!(request.attempts_remaining(), 4);
    }
}
