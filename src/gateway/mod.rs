//! Pubgate HTTP gateway
//!
//! This module implements the HTTP front end that turns inbound requests into
//! broker publishes and maps each publish outcome to an HTTP status.

mod server;

pub use server::{status_for, GatewayServer, Route};

use anyhow::Result;
use crate::core::Core;

/// Run the gateway until Ctrl-C, then tear down broker connections
///
/// # Arguments
/// * `core` - The pubgate core with connection pool and publisher
/// * `listen` - The address to listen on (e.g., "0.0.0.0:8000")
pub async fn run_server(core: &Core, listen: &str) -> Result<()> {
    let server = GatewayServer::new(core.clone(), listen.to_string());
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}
