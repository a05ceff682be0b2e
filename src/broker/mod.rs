//! Broker transport abstraction
//!
//! This module provides:
//! - The `Connector` / `BrokerChannel` seam used by the connection pool
//! - An AMQP 0-9-1 implementation backed by lapin
//! - An in-memory broker with fault injection for tests and local runs
//!
//! Errors are split into transient failures (worth retrying on a fresh
//! connection) and permanent rejections (retrying cannot help).

pub mod amqp;
pub mod memory;

use async_trait::async_trait;

pub use amqp::AmqpConnector;
pub use memory::{MemoryBroker, MemoryConnector};

/// Errors reported by a broker transport
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Broker did not confirm the publish")]
    Nacked,

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Broker rejected the request: {0}")]
    Rejected(String),
}

impl BrokerError {
    /// Whether a retry on a fresh connection may succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, BrokerError::Rejected(_))
    }
}

/// Opens new connections to a broker
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open one broker connection with a channel ready for publishing
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;

    /// Human-readable target, safe to log (no credentials)
    fn describe(&self) -> String;
}

/// A single open broker channel
#[async_trait]
pub trait BrokerChannel: Send {
    /// Publish `payload` to the queue named `destination` through the default
    /// exchange, declaring the queue first if this channel has not yet done so
    async fn publish(&mut self, destination: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Whether the underlying connection is still usable
    fn is_open(&self) -> bool;

    /// Close the connection, ignoring errors
    async fn close(&mut self);
}
