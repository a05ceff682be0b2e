use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use tracing::info;

use crate::broker::{AmqpConnector, Connector};
use crate::config::Config;
use crate::pool::{ConnectionPool, PoolStats};
use crate::publish::{PublishOutcome, Publisher};

/// Core shared by both CLI and server modes
///
/// Owns the connection pool explicitly; clones share the same pool, so every
/// request handler publishes through the same bounded set of connections.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    pub pool: Arc<ConnectionPool>,
    pub publisher: Arc<Publisher>,
}

impl Core {
    /// Build a core that talks AMQP to the configured broker
    pub fn new(config: Config) -> Result<Self> {
        let connector = Arc::new(AmqpConnector::new(&config.broker, config.gateway.durable));
        Self::with_connector(config, connector)
    }

    /// Build a core on top of any broker connector
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let pool = Arc::new(ConnectionPool::new(connector, config.pool_config()));
        let publisher = Arc::new(Publisher::new(Arc::clone(&pool), config.retry_policy()));

        Ok(Self {
            config,
            pool,
            publisher,
        })
    }

    /// Publish the configured default payload to the default destination
    pub async fn publish_default(&self) -> PublishOutcome {
        let payload = Bytes::from(self.config.gateway.default_payload.clone());
        self.publisher
            .publish(self.config.gateway.default_destination.clone(), payload)
            .await
    }

    /// Current pool statistics
    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Tear down broker connections
    pub async fn shutdown(&self) {
        info!("Shutting down broker connections");
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[tokio::test]
    async fn test_publish_default_uses_gateway_settings() {
        let broker = MemoryBroker::new();
        let mut config = Config::default();
        config.gateway.default_destination = "greetings".to_string();
        config.gateway.default_payload = "hi".to_string();

        let core = Core::with_connector(config, broker.connector()).unwrap();
        let outcome = core.publish_default().await;

        assert!(outcome.success);
        assert_eq!(broker.messages("greetings"), vec![Bytes::from("hi")]);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let broker = MemoryBroker::new();
        let mut config = Config::default();
        config.pool.max_size = 0;

        assert!(Core::with_connector(config, broker.connector()).is_err());
    }

    #[tokio::test]
    async fn test_oversized_pool_is_rejected_before_allocation() {
        let broker = MemoryBroker::new();
        let mut config = Config::default();
        config.pool.max_size = usize::MAX >> 4;

        assert!(Core::with_connector(config, broker.connector()).is_err());
        assert_eq!(broker.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_pool() {
        let broker = MemoryBroker::new();
        let core = Core::with_connector(Config::default(), broker.connector()).unwrap();

        assert!(core.publish_default().await.success);
        core.shutdown().await;

        assert!(core.pool.is_closed());
        assert!(!core.publish_default().await.success);
    }
}
