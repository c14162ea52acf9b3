//! Runs one scribble node until interrupted.
//!
//! Usage: `scribble-server [config.json]`
//!
//! Without a file the defaults apply. `SCRIBBLE_*` environment variables
//! override either, e.g. `SCRIBBLE_NODE_ID`, `SCRIBBLE_GOSSIP_BIND`,
//! `SCRIBBLE_PEERS=b=ws://10.0.0.2:7400`. Log level comes from `RUST_LOG`.

use log::{error, info};
use scribble_collab::{Node, NodeConfig, NodeError};

fn load_config() -> Result<NodeConfig, NodeError> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {path}");
            NodeConfig::from_json_file(&path)?
        }
        None => NodeConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

async fn run() -> Result<(), NodeError> {
    let config = load_config()?;
    let node = Node::start(config).await?;
    if let Some(addr) = node.gossip_addr() {
        info!("Node {} gossiping on ws://{addr}", node.node_id());
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");
    node.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Scribble server...");
    if let Err(e) = run().await {
        error!("Scribble server failed: {e}");
        std::process::exit(1);
    }
}
