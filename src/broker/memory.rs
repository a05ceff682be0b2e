//! In-memory broker
//!
//! Stores published messages per queue and lets callers script failures:
//! transient publish faults (each one breaks the channel, like a connection
//! reset), connect failures, rejected destinations and publish latency.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{BrokerChannel, BrokerError, Connector};

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, Vec<Bytes>>,
    rejected: HashSet<String>,
    pending_publish_faults: u32,
    pending_connect_faults: u32,
    publish_delay: Option<Duration>,
    connections_opened: u64,
    publish_attempts: u64,
}

/// Shared handle to an in-memory broker
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that opens channels on this broker
    pub fn connector(&self) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    /// Fail the next `count` publish attempts with a connection reset
    pub fn fail_next_publishes(&self, count: u32) {
        self.state().pending_publish_faults += count;
    }

    /// Fail the next `count` connect attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.state().pending_connect_faults += count;
    }

    /// Reject every publish to `destination` as a permanent error
    pub fn reject_destination(&self, destination: &str) {
        self.state().rejected.insert(destination.to_string());
    }

    /// Delay every publish by `delay`
    pub fn set_publish_delay(&self, delay: Duration) {
        self.state().publish_delay = Some(delay);
    }

    /// Messages delivered to `destination`, oldest first
    pub fn messages(&self, destination: &str) -> Vec<Bytes> {
        self.state()
            .queues
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of connections opened so far
    pub fn connections_opened(&self) -> u64 {
        self.state().connections_opened
    }

    /// Number of publish calls that reached the broker, failed or not
    pub fn publish_attempts(&self) -> u64 {
        self.state().publish_attempts
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Opens channels on a `MemoryBroker`
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let mut state = self.broker.state();
        if state.pending_connect_faults > 0 {
            state.pending_connect_faults -= 1;
            return Err(BrokerError::Transport("connection refused".to_string()));
        }
        state.connections_opened += 1;

        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            open: true,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    open: bool,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn publish(&mut self, destination: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.open {
            return Err(BrokerError::Transport("channel closed".to_string()));
        }

        let delay = self.broker.state().publish_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.broker.state();
        state.publish_attempts += 1;

        if state.pending_publish_faults > 0 {
            state.pending_publish_faults -= 1;
            self.open = false;
            return Err(BrokerError::Transport("connection reset by peer".to_string()));
        }

        if state.rejected.contains(destination) {
            return Err(BrokerError::Rejected(format!(
                "ACCESS_REFUSED - queue '{}' not allowed",
                destination
            )));
        }

        state
            .queues
            .entry(destination.to_string())
            .or_default()
            .push(Bytes::copy_from_slice(payload));
        debug!(queue = %destination, bytes = payload.len(), "Stored message");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) {
        self.open = false;
    }
}
