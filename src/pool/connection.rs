//! Bounded broker connection pool
//!
//! This module provides a pool of broker channels with:
//! - A hard cap on live connections, enforced by a semaphore
//! - Bounded waits for capacity (`PoolError::Exhausted` on timeout)
//! - Lazy replacement of broken connections
//! - Discarding of idle connections that went stale

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::broker::{BrokerChannel, BrokerError, Connector};

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No connection became available within {0:?}")]
    Exhausted(Duration),

    #[error("Failed to connect to broker: {0}")]
    Connect(#[from] BrokerError),

    #[error("Pool is closed")]
    Closed,
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections (idle plus in use)
    pub max_size: usize,

    /// How long `acquire` waits for capacity
    pub acquire_timeout: Duration,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Maximum idle time before a connection is discarded
    pub max_idle_time: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            max_idle_time: Duration::from_secs(300),
        }
    }
}

/// Opaque identifier of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    InUse,
    Broken,
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Configured maximum
    pub max_size: usize,

    /// Connections waiting in the pool
    pub idle: usize,

    /// Connections checked out
    pub in_use: usize,

    /// Total connections created
    pub total_created: u64,

    /// Total checkouts served by an existing connection
    pub total_reused: u64,

    /// Total connections thrown away (broken or stale)
    pub total_discarded: u64,

    /// Failed connection attempts
    pub failed_connects: u64,

    /// Acquisitions that gave up waiting for capacity
    pub acquire_timeouts: u64,
}

#[derive(Default)]
struct Counters {
    total_created: AtomicU64,
    total_reused: AtomicU64,
    total_discarded: AtomicU64,
    failed_connects: AtomicU64,
    acquire_timeouts: AtomicU64,
}

/// A broker connection owned by the pool
///
/// While checked out it holds one unit of pool capacity; dropping it without
/// calling `release` frees that capacity and discards the transport.
pub struct PooledConnection {
    id: ConnectionId,
    state: ConnectionState,
    transport: Box<dyn BrokerChannel>,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    fn new(id: ConnectionId, transport: Box<dyn BrokerChannel>) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: ConnectionState::Idle,
            transport,
            created_at: now,
            last_used: now,
            use_count: 0,
            permit: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    /// Whether the underlying transport still reports open
    pub fn is_open(&self) -> bool {
        self.state != ConnectionState::Broken && self.transport.is_open()
    }

    /// Publish through this connection
    ///
    /// A transient transport error marks the connection Broken.
    pub async fn publish(&mut self, destination: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.last_used = Instant::now();
        let result = self.transport.publish(destination, payload).await;
        if let Err(e) = &result {
            if e.is_transient() {
                self.state = ConnectionState::Broken;
            }
        }
        result
    }

    fn is_reusable(&self, max_idle: Duration) -> bool {
        self.is_open() && self.last_used.elapsed() < max_idle
    }

    fn check_out(&mut self, permit: OwnedSemaphorePermit) {
        self.state = ConnectionState::InUse;
        self.use_count += 1;
        self.last_used = Instant::now();
        self.permit = Some(permit);
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("use_count", &self.use_count)
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

/// Pool of broker connections shared by all publishers
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    /// Idle connections, most recently returned last
    idle: Mutex<Vec<PooledConnection>>,
    /// One permit per connection that may be checked out
    capacity: Arc<Semaphore>,
    next_id: AtomicU64,
    counters: Counters,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Create a new pool; no connection is opened until the first `acquire`
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        info!(
            broker = %connector.describe(),
            max_size = config.max_size,
            "Creating connection pool"
        );

        Self {
            capacity: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(Vec::new()),
            connector,
            config,
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Check out a connection, waiting up to `acquire_timeout` for capacity
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.capacity).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                self.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    waited_ms = self.config.acquire_timeout.as_millis() as u64,
                    max_size = self.config.max_size,
                    "pool_exhausted"
                );
                return Err(PoolError::Exhausted(self.config.acquire_timeout));
            }
        };

        // Try to reuse an existing healthy connection
        if let Some(mut conn) = self.take_idle().await {
            self.counters.total_reused.fetch_add(1, Ordering::Relaxed);
            conn.check_out(permit);
            debug!(
                connection = %conn.id,
                use_count = conn.use_count,
                age_secs = conn.created_at.elapsed().as_secs(),
                "Reusing connection"
            );
            return Ok(conn);
        }

        // The permit is dropped with the error, returning the capacity
        let mut conn = self.create_connection().await?;
        conn.check_out(permit);
        Ok(conn)
    }

    /// Return a checked-out connection
    ///
    /// Healthy connections go back to the idle set; anything else is closed
    /// and will be replaced by the next `acquire` that needs one.
    pub async fn release(&self, mut conn: PooledConnection, healthy: bool) {
        let permit = conn.permit.take();

        if healthy && conn.is_open() && !self.is_closed() {
            conn.state = ConnectionState::Idle;
            conn.last_used = Instant::now();
            // Park the connection before freeing capacity so a woken waiter finds it
            self.idle.lock().await.push(conn);
        } else {
            debug!(connection = %conn.id, healthy, "Discarding connection");
            self.discard(conn);
        }

        drop(permit);
    }

    /// Drop idle connections that are closed or idle for too long
    pub async fn cleanup(&self) {
        let mut idle = self.idle.lock().await;
        let before = idle.len();

        let (keep, stale): (Vec<_>, Vec<_>) = idle
            .drain(..)
            .partition(|conn| conn.is_reusable(self.config.max_idle_time));
        *idle = keep;
        drop(idle);

        let removed = stale.len();
        for conn in stale {
            self.discard(conn);
        }

        if removed > 0 {
            debug!(
                removed = removed,
                remaining = before - removed,
                "Cleaned up idle connections"
            );
        }
    }

    /// Shut the pool down
    ///
    /// Pending and future `acquire` calls fail with `PoolError::Closed`; idle
    /// connections are closed now, checked-out ones when they are released.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.capacity.close();

        let drained: Vec<_> = self.idle.lock().await.drain(..).collect();
        let count = drained.len();
        for mut conn in drained {
            conn.state = ConnectionState::Broken;
            conn.transport.close().await;
        }

        info!(closed_idle = count, "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().await.len();
        let in_use = if self.is_closed() {
            0
        } else {
            self.config.max_size - self.capacity.available_permits()
        };

        PoolStats {
            max_size: self.config.max_size,
            idle,
            in_use,
            total_created: self.counters.total_created.load(Ordering::Relaxed),
            total_reused: self.counters.total_reused.load(Ordering::Relaxed),
            total_discarded: self.counters.total_discarded.load(Ordering::Relaxed),
            failed_connects: self.counters.failed_connects.load(Ordering::Relaxed),
            acquire_timeouts: self.counters.acquire_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Pop the most recently used reusable idle connection, discarding stale ones
    async fn take_idle(&self) -> Option<PooledConnection> {
        let mut idle = self.idle.lock().await;
        while let Some(conn) = idle.pop() {
            if conn.is_reusable(self.config.max_idle_time) {
                return Some(conn);
            }
            debug!(connection = %conn.id, "Discarding unhealthy idle connection");
            self.discard(conn);
        }
        None
    }

    /// Open a new connection to the broker
    async fn create_connection(&self) -> Result<PooledConnection, PoolError> {
        let connected =
            tokio::time::timeout(self.config.connect_timeout, self.connector.connect()).await;

        let transport = match connected {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                self.counters.failed_connects.fetch_add(1, Ordering::Relaxed);
                warn!(broker = %self.connector.describe(), error = %e, "connect_failed");
                return Err(PoolError::Connect(e));
            }
            Err(_) => {
                self.counters.failed_connects.fetch_add(1, Ordering::Relaxed);
                warn!(
                    broker = %self.connector.describe(),
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "connect_timeout"
                );
                return Err(PoolError::Connect(BrokerError::ConnectTimeout(
                    self.config.connect_timeout,
                )));
            }
        };

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let total_created = self.counters.total_created.fetch_add(1, Ordering::Relaxed) + 1;

        info!(
            connection = %id,
            total_created = total_created,
            "Created new connection"
        );

        Ok(PooledConnection::new(id, transport))
    }

    /// Mark a connection Broken and close it off the caller's path
    fn discard(&self, mut conn: PooledConnection) {
        conn.state = ConnectionState::Broken;
        self.counters.total_discarded.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            conn.transport.close().await;
        });
    }
}
