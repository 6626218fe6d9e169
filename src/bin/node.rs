//! Chat node binary: parses [`chat_raft::config::NodeConfig`], wires up
//! the consensus core via [`chat_raft::node::spawn`], and runs forever.
//!
//! Mirrors the teacher's `bin/server.rs` shape (parse args, init
//! tracing, build config, build and run a server) almost line for line.

use anyhow::Result;
use clap::Parser;
use chat_raft::config::NodeConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "chat_raft=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::parse();

    tracing::info!(id = %config.id, "starting chat-raft node");
    tracing::info!(http_port = config.http_port, peer_port = config.peer_port, "listener ports");

    let _node = chat_raft::node::spawn(config).await?;

    // The node's listeners, ticker and gateway run on spawned tasks;
    // block here until the process is killed or receives Ctrl-C.
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    Ok(())
}
