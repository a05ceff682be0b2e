//! Connection pooling module
//!
//! This module provides:
//! - A bounded pool of broker connections shared across requests
//! - Explicit Idle / InUse / Broken lifecycle per connection
//! - Lazy replacement of broken connections

pub mod connection;

pub use connection::{
    ConnectionId, ConnectionPool, ConnectionState, PoolConfig, PoolError, PoolStats,
    PooledConnection,
};
