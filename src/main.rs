//! Line chat server - Entry Point
//!
//! Binds the listener and accepts connections until Ctrl-C.

use std::env;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use line_chat::{ChatServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=line_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("line_chat=info")),
        )
        .init();

    // Bind address from command line or default
    let config = ServerConfig::from_args(env::args());

    let server = ChatServer::bind(config).await?;
    info!("Chat server listening on {}", server.local_addr()?);

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install Ctrl-C handler: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
