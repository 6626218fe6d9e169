//! Start-up CLI / environment surface (spec §6, concretized in SPEC_FULL
//! §6). Mirrors the teacher's `bin/server.rs` + `cli::config` pattern:
//! a `clap::Parser` derive struct with environment-variable fallbacks for
//! the cluster-discovery knobs, following the original's actual env var
//! names (`original_source/server/node.py`) where this port keeps them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DiscoveryMode {
    Static,
    Dynamic,
}

/// Command-line / environment configuration for a single chat node.
#[derive(Debug, Parser)]
#[command(
    name = "chat-raft-node",
    about = "A replicated chat node built on a leader-based consensus core"
)]
pub struct NodeConfig {
    /// This node's identifier, used as `candidate_id`/`leader_id` on the wire.
    #[arg(long, env = "CHAT_NODE_ID")]
    pub id: String,

    /// Client-facing HTTP gateway port.
    #[arg(long, env = "CHAT_HTTP_PORT")]
    pub http_port: u16,

    /// Peer-RPC port (`raft_port` in the original).
    #[arg(long, env = "CHAT_PEER_PORT")]
    pub peer_port: u16,

    /// Static peer list, `host:port,host:port,...`. Empty for a single-node
    /// cluster.
    #[arg(long, value_delimiter = ',')]
    pub peers: Vec<SocketAddr>,

    /// Selects between a fixed `--peers` list and inventory-endpoint
    /// discovery.
    #[arg(long, value_enum, env = "CHAT_DISCOVERY_MODE", default_value = "static")]
    pub discovery_mode: DiscoveryMode,

    /// Cluster tag to filter the inventory query by (dynamic mode only).
    #[arg(long, env = "CHAT_CLUSTER_NAME", default_value = "")]
    pub cluster_name: String,

    /// This node's own private address, excluded from its own peer set
    /// (dynamic mode only).
    #[arg(long, env = "CHAT_PRIVATE_ADDR")]
    pub self_private_addr: Option<SocketAddr>,

    /// Inventory HTTP endpoint to query for cluster membership (dynamic
    /// mode only).
    #[arg(long, env = "CHAT_INVENTORY_URL", default_value = "")]
    pub inventory_url: String,

    /// Public front-door hostname for the gateway's Location policy. When
    /// set, every redirect points here instead of at a peer's internal
    /// address.
    #[arg(long, env = "CHAT_PUBLIC_HOST")]
    pub public_host: Option<String>,

    #[arg(long, env = "CHAT_PUBLIC_SCHEME", default_value = "http")]
    pub public_scheme: String,

    /// Directory for the durable state-machine file. The file itself is
    /// named by HTTP port when this is set, matching the original's
    /// `chat_log_{http_port}.jsonl` naming.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// `id=port` pairs for the local node-id -> HTTP-port map used for
    /// redirects when no public hostname is configured (spec §9, "Location
    /// map for local dev"). Repeatable.
    #[arg(long = "node-port")]
    pub node_ports: Vec<String>,
}

impl NodeConfig {
    pub fn node_port_map(&self) -> HashMap<String, u16> {
        self.node_ports
            .iter()
            .filter_map(|entry| {
                let (id, port) = entry.split_once('=')?;
                let port: u16 = port.parse().ok()?;
                Some((id.to_string(), port))
            })
            .collect()
    }

    pub fn data_path(&self) -> PathBuf {
        let filename = format!("chat_log_{}.jsonl", self.http_port);
        match &self.data_dir {
            Some(dir) => dir.join(filename),
            None => PathBuf::from(filename),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_port_map_entries() {
        let mut cfg = minimal();
        cfg.node_ports = vec!["n0=8081".into(), "n1=8082".into(), "garbage".into()];
        let map = cfg.node_port_map();
        assert_eq!(map.get("n0"), Some(&8081));
        assert_eq!(map.get("n1"), Some(&8082));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn data_path_is_named_by_http_port_when_no_dir() {
        let cfg = minimal();
        assert_eq!(cfg.data_path(), PathBuf::from("chat_log_8080.jsonl"));
    }

    fn minimal() -> NodeConfig {
        NodeConfig {
            id: "n0".into(),
            http_port: 8080,
            peer_port: 9090,
            peers: vec![],
            discovery_mode: DiscoveryMode::Static,
            cluster_name: String::new(),
            self_private_addr: None,
            inventory_url: String::new(),
            public_host: None,
            public_scheme: "http".into(),
            data_dir: None,
            node_ports: vec![],
        }
    }
}
