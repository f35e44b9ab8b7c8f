//! Outpost Agent Binary
//!
//! Speaks length-prefixed msgpack frames with the controller over
//! stdin/stdout. Logs go to stderr.

use anyhow::Result;
use outpost_agent::{AgentConfig, AgentLoop};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = AgentConfig::from_env();
    info!(client_id = %config.client_id, version = %config.version, "Starting outpost agent");

    let mut agent = AgentLoop::new(config);
    if let Err(e) = agent.run().await {
        error!("Agent error: {:#}", e);
        std::process::exit(1);
    }

    info!("Agent shutting down");
    Ok(())
}
