//! btp-node: BTP node binary

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use btp_node::{status_service, BtpServer, NodeConfig, NodeContext, ServiceMode};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting btp-node");

    // Load configuration
    let config = NodeConfig::load()?;
    let context = NodeContext::new(config)?;
    info!(
        user_id = context.user_id(),
        public_key = %context.profile().public_key_hex(),
        "Node profile loaded"
    );

    // Create server and register services
    let server = Arc::new(BtpServer::new(context.clone())?);
    server.add_service(Arc::new(status_service(&context)), ServiceMode::Both, &[])?;

    let listener = server.bind().await?;
    let running = tokio::spawn(server.clone().run(listener));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    server.shutdown();

    if let Err(e) = running.await? {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
