//! One-shot commands for pubgate
//!
//! ```bash
//! # Publish the configured default message to the default queue
//! pubgate publish
//!
//! # Publish a custom message to another queue
//! pubgate publish --destination orders '{"id": 42}'
//! ```

use anyhow::Result;
use tracing::info;

use crate::core::Core;
use crate::publish::PublishOutcome;

/// Publish one message and print the outcome as JSON
///
/// Falls back to the configured default destination and payload.
pub async fn cmd_publish(
    core: &Core,
    destination: Option<&str>,
    message: Option<&str>,
) -> Result<PublishOutcome> {
    let gateway = &core.config.gateway;
    let destination = destination.unwrap_or(&gateway.default_destination).to_string();
    let message = message.unwrap_or(&gateway.default_payload).to_string();

    info!(destination = %destination, bytes = message.len(), "Publishing message");
    let outcome = core.publisher.publish(destination, message).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    core.shutdown().await;

    if !outcome.success {
        let kind = outcome
            .error_kind
            .map(|k| k.as_str())
            .unwrap_or("Unknown");
        anyhow::bail!(
            "Publish failed after {} attempt(s): {}",
            outcome.attempts_used,
            kind
        );
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::Config;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_cmd_publish_defaults() {
        let broker = MemoryBroker::new();
        let core = Core::with_connector(Config::default(), broker.connector()).unwrap();

        let outcome = cmd_publish(&core, None, None).await.unwrap();

        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(broker.messages("test"), vec![Bytes::from("Hello from pubgate!")]);
    }

    #[tokio::test]
    async fn test_cmd_publish_failure_is_error() {
        let broker = MemoryBroker::new();
        broker.reject_destination("locked");
        let core = Core::with_connector(Config::default(), broker.connector()).unwrap();

        let result = cmd_publish(&core, Some("locked"), Some("x")).await;

        assert!(result.is_err());
    }
}
