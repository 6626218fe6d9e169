//! Wires the five core components into one running node (spec §5's list
//! of long-lived tasks): the peer-RPC listener, the HTTP gateway
//! listener, and the ~200ms ticker that drives both heartbeats and
//! election expiry.
//!
//! Grounded in the teacher's `bin/server.rs`, which builds a
//! `ServerConfig`, constructs a `Server`, and runs it to completion; this
//! module plays the same role for a chat node, just split out of the
//! binary so integration tests can spin up whole clusters in-process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{DiscoveryMode, NodeConfig};
use crate::consensus::{ConsensusCore, ElectionConfig};
use crate::gateway::{self, GatewayState, LocationConfig};
use crate::peers::{DynamicPeerDirectory, PeerDirectory, StaticPeerDirectory};
use crate::state_machine::ChatStateMachine;
use crate::transport::{self, Transport};

/// Interval of the single background ticker driving heartbeats and
/// election expiry (spec §4.3, "A single background ticker").
const TICK_INTERVAL: Duration = Duration::from_millis(200);

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const INVENTORY_TTL: Duration = Duration::from_secs(2);

/// A node's running handles: the consensus core (for in-process testing
/// and diagnostics) and the bound addresses of its two listeners.
pub struct Node {
    pub core: Arc<ConsensusCore>,
    pub http_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

fn peer_directory(config: &NodeConfig) -> Result<Arc<dyn PeerDirectory>> {
    match config.discovery_mode {
        DiscoveryMode::Static => Ok(Arc::new(StaticPeerDirectory::new(config.peers.clone()))),
        DiscoveryMode::Dynamic => {
            let self_addr = config
                .self_private_addr
                .context("--self-private-addr is required in dynamic discovery mode")?;
            if config.inventory_url.is_empty() {
                anyhow::bail!("--inventory-url is required in dynamic discovery mode");
            }
            Ok(Arc::new(DynamicPeerDirectory::new(
                config.inventory_url.clone(),
                config.cluster_name.clone(),
                self_addr,
                INVENTORY_TTL,
            )))
        }
    }
}

/// Builds the core, binds both listeners, and spawns every long-lived
/// task described in spec §5 except the caller's own lifetime: this
/// function returns as soon as both listeners are bound, leaving the
/// accept loops, the ticker, and the HTTP server running in the
/// background on the current `tokio` runtime. Uses the reference timing
/// (5-10s election range, 1s heartbeat).
pub async fn spawn(config: NodeConfig) -> Result<Node> {
    spawn_with_election_config(config, ElectionConfig::default()).await
}

/// As [`spawn`], but with an explicit [`ElectionConfig`] — used by
/// integration tests to shrink the election timeout well below the 5-10s
/// reference range so a cluster converges in milliseconds rather than
/// seconds.
pub async fn spawn_with_election_config(config: NodeConfig, election: ElectionConfig) -> Result<Node> {
    let peers = peer_directory(&config)?;
    let state_machine = ChatStateMachine::open(config.data_path())
        .with_context(|| format!("opening durable log at {}", config.data_path().display()))?;

    let core = Arc::new(ConsensusCore::new(
        config.id.clone(),
        peers,
        state_machine,
        election,
    ));

    let transport = Transport::new(DIAL_TIMEOUT, READ_TIMEOUT);

    let peer_addr: SocketAddr = format!("0.0.0.0:{}", config.peer_port).parse()?;
    let peer_listener = tokio::net::TcpListener::bind(peer_addr)
        .await
        .with_context(|| format!("binding peer-rpc listener on {peer_addr}"))?;
    let bound_peer_addr = peer_listener.local_addr()?;
    {
        let core = Arc::clone(&core);
        tokio::spawn(async move {
            if let Err(e) = transport::serve_on(core, peer_listener).await {
                tracing::error!(error = %e, "peer transport listener exited");
            }
        });
    }

    {
        let core = Arc::clone(&core);
        let transport = transport.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(TICK_INTERVAL).await;
                core.tick(&transport).await;
            }
        });
    }

    let location = LocationConfig {
        public_host: config.public_host.clone(),
        public_scheme: config.public_scheme.clone(),
        node_ports: config.node_port_map(),
    };
    let gateway_state = Arc::new(GatewayState {
        core: Arc::clone(&core),
        transport,
        location,
        http_client: reqwest::Client::new(),
    });

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding http gateway listener on {http_addr}"))?;
    let bound_http_addr = http_listener.local_addr()?;
    let router = gateway::router(gateway_state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, router).await {
            tracing::error!(error = %e, "http gateway listener exited");
        }
    });

    info!(
        id = %config.id,
        %bound_http_addr,
        %bound_peer_addr,
        "node started"
    );

    Ok(Node {
        core,
        http_addr: bound_http_addr,
        peer_addr: bound_peer_addr,
    })
}
