//! End-to-end tests for the replicated chat consensus core (spec §8,
//! "End-to-end scenarios"). Each node runs as a set of spawned `tokio`
//! tasks inside this test binary; `#[serial]` keeps tests from
//! interleaving since they bind real TCP ports.

use std::net::SocketAddr;
use std::time::Duration;

use chat_raft::config::{DiscoveryMode, NodeConfig};
use chat_raft::consensus::rpc::RpcMessage;
use chat_raft::consensus::ElectionConfig;
use chat_raft::node::{self, Node};
use serial_test::serial;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Election timing shrunk well below the 5-10s reference range so a
/// cluster converges within a couple of seconds instead of ten.
fn fast_election() -> ElectionConfig {
    ElectionConfig {
        election_timeout: (Duration::from_millis(300), Duration::from_millis(600)),
        heartbeat_interval: Duration::from_millis(100),
    }
}

fn node_config(
    id: &str,
    http_port: u16,
    peer_port: u16,
    peers: Vec<SocketAddr>,
    node_ports: Vec<String>,
    dir: &std::path::Path,
) -> NodeConfig {
    NodeConfig {
        id: id.to_string(),
        http_port,
        peer_port,
        peers,
        discovery_mode: DiscoveryMode::Static,
        cluster_name: String::new(),
        self_private_addr: None,
        inventory_url: String::new(),
        public_host: None,
        public_scheme: "http".into(),
        data_dir: Some(dir.to_path_buf()),
        node_ports,
    }
}

async fn spawn_cluster(base_http: u16, base_peer: u16, count: u16, dir: &std::path::Path) -> Vec<Node> {
    let ids: Vec<String> = (0..count).map(|i| format!("n{i}")).collect();
    let peer_addrs: Vec<SocketAddr> = (0..count)
        .map(|i| format!("127.0.0.1:{}", base_peer + i).parse().unwrap())
        .collect();
    let node_ports: Vec<String> = (0..count)
        .map(|i| format!("{}={}", ids[i as usize], base_http + i))
        .collect();

    let mut nodes = Vec::new();
    for i in 0..count {
        let peers: Vec<SocketAddr> = peer_addrs
            .iter()
            .enumerate()
            .filter(|(j, _)| *j as u16 != i)
            .map(|(_, a)| *a)
            .collect();
        let config = node_config(
            &ids[i as usize],
            base_http + i,
            base_peer + i,
            peers,
            node_ports.clone(),
            dir,
        );
        let node = node::spawn_with_election_config(config, fast_election())
            .await
            .expect("node should start");
        nodes.push(node);
    }
    nodes
}

/// Sends a single peer RPC directly over the wire (spec §4.4/§6: one
/// JSON-line request, one JSON-line response, one connection), bypassing
/// `chat_raft::transport::Transport` so a test can address a node's
/// peer-RPC listener without going through another full node.
async fn send_rpc(peer_addr: SocketAddr, msg: &RpcMessage) -> RpcMessage {
    let stream = TcpStream::connect(peer_addr).await.unwrap();
    let mut line = serde_json::to_string(msg).unwrap();
    line.push('\n');

    let mut stream = stream;
    stream.write_all(line.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line).await.unwrap();
    serde_json::from_str(response_line.trim_end()).unwrap()
}

async fn wait_for_leader(client: &reqwest::Client, http_port: u16) -> Option<String> {
    let url = format!("http://127.0.0.1:{http_port}/leader");
    for _ in 0..60 {
        if let Ok(resp) = client.get(&url).send().await {
            if let Ok(body) = resp.json::<serde_json::Value>().await {
                if let Some(id) = body["leader_id"].as_str() {
                    return Some(id.to_string());
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    None
}

#[tokio::test]
#[serial]
async fn single_node_commit() {
    let dir = TempDir::new().unwrap();
    let config = node_config("n0", 18770, 18760, vec![], vec![], dir.path());
    let _node = node::spawn_with_election_config(config, fast_election())
        .await
        .unwrap();

    let client = reqwest::Client::new();
    wait_for_leader(&client, 18770)
        .await
        .expect("single node should elect itself leader");

    let resp = client
        .post("http://127.0.0.1:18770/chat")
        .json(&serde_json::json!({
            "type": "chat", "user": "a", "text": "hi", "room": "general", "id": "1"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["index"], 0);

    let messages: Vec<serde_json::Value> = client
        .get("http://127.0.0.1:18770/messages")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["id"], "1");
}

#[tokio::test]
#[serial]
async fn oversize_message_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = node_config("n0", 18771, 18761, vec![], vec![], dir.path());
    let _node = node::spawn_with_election_config(config, fast_election())
        .await
        .unwrap();

    let client = reqwest::Client::new();
    wait_for_leader(&client, 18771).await.unwrap();

    let text = "a".repeat(257);
    let resp = client
        .post("http://127.0.0.1:18771/chat")
        .json(&serde_json::json!({
            "type": "chat", "user": "a", "text": text, "room": "general", "id": "1"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let messages: Vec<serde_json::Value> = client
        .get("http://127.0.0.1:18771/messages")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
#[serial]
async fn retention_keeps_last_hundred() {
    let dir = TempDir::new().unwrap();
    let config = node_config("n0", 18772, 18762, vec![], vec![], dir.path());
    let _node = node::spawn_with_election_config(config, fast_election())
        .await
        .unwrap();

    let client = reqwest::Client::new();
    wait_for_leader(&client, 18772).await.unwrap();

    for i in 0..150 {
        let resp = client
            .post("http://127.0.0.1:18772/chat")
            .json(&serde_json::json!({
                "type": "chat", "user": "a", "text": "m", "room": "general", "id": i.to_string()
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let messages: Vec<serde_json::Value> = client
        .get("http://127.0.0.1:18772/messages")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(messages.len(), 100);
    assert_eq!(messages[0]["id"], "50");
    assert_eq!(messages[99]["id"], "149");
}

#[tokio::test]
#[serial]
async fn three_node_cluster_elects_a_leader_and_replicates() {
    let dir = TempDir::new().unwrap();
    let _nodes = spawn_cluster(18780, 18790, 3, dir.path()).await;

    let client = reqwest::Client::new();
    let leader_id = wait_for_leader(&client, 18780)
        .await
        .expect("cluster of 3 should elect a leader");

    let leader_port = 18780 + leader_id.trim_start_matches('n').parse::<u16>().unwrap();
    let resp = client
        .post(format!("http://127.0.0.1:{leader_port}/chat"))
        .json(&serde_json::json!({
            "type": "chat", "user": "b", "text": "hello", "room": "general", "id": "x"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    // Every node eventually sees the committed command (spec §8 scenario 2).
    for port in [18780u16, 18781, 18782] {
        let mut seen = false;
        for _ in 0..50 {
            let messages: Vec<serde_json::Value> = client
                .get(format!("http://127.0.0.1:{port}/messages"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if messages.iter().any(|m| m["id"] == "x") {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(seen, "node on port {port} never observed the committed command");
    }
}

#[tokio::test]
#[serial]
async fn non_leader_redirects_to_known_leader() {
    let dir = TempDir::new().unwrap();
    let _nodes = spawn_cluster(18800, 18810, 3, dir.path()).await;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let leader_id = wait_for_leader(&client, 18800)
        .await
        .expect("cluster of 3 should elect a leader");

    let follower_port = (0..3u16)
        .map(|i| 18800 + i)
        .find(|p| *p != 18800 + leader_id.trim_start_matches('n').parse::<u16>().unwrap())
        .unwrap();

    let resp = client
        .post(format!("http://127.0.0.1:{follower_port}/chat"))
        .json(&serde_json::json!({
            "type": "chat", "user": "b", "text": "hello", "room": "general", "id": "y"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 302);
    let location = resp
        .headers()
        .get(reqwest::header::LOCATION)
        .expect("redirect must carry a Location header when a leader is known")
        .to_str()
        .unwrap();
    let expected_leader_port = 18800 + leader_id.trim_start_matches('n').parse::<u16>().unwrap();
    assert!(location.contains(&expected_leader_port.to_string()));
}

/// Spec §4.5.1: "If the local node believes an election is in progress
/// (no leader known), reply 503." A node whose only peer is unreachable
/// can never win a vote of its own (majority of 2 requires both), so it
/// never has a leader and the 503 branch is reached deterministically
/// rather than racing a real election.
#[tokio::test]
#[serial]
async fn kill_leader_with_no_known_leader_returns_503() {
    let dir = TempDir::new().unwrap();
    let unreachable: SocketAddr = "127.0.0.1:18769".parse().unwrap();
    let config = node_config("n0", 18773, 18763, vec![unreachable], vec![], dir.path());
    let _node = node::spawn_with_election_config(config, fast_election())
        .await
        .unwrap();

    // Give the ticker a few cycles to attempt (and fail) an election.
    tokio::time::sleep(Duration::from_millis(800)).await;

    let client = reqwest::Client::new();
    let leader: serde_json::Value = client
        .get("http://127.0.0.1:18773/leader")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(leader["leader_id"].is_null());

    let resp = client
        .post("http://127.0.0.1:18773/kill-leader")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
}

/// Spec §4.5.1: a follower proxies `/kill-leader` to the known leader,
/// and "a connection loss during the proxied call is treated as
/// success." Rather than driving a real leader through `/kill-leader`
/// (which would `process::exit` this test binary), this injects a
/// hand-crafted `AppendEntries` directly at the node's peer-RPC listener
/// so the node records a `leader_id` with nothing actually listening on
/// its mapped port, forcing the proxy's connection-loss branch.
#[tokio::test]
#[serial]
async fn kill_leader_proxies_and_treats_connection_loss_as_success() {
    let dir = TempDir::new().unwrap();
    let unreachable: SocketAddr = "127.0.0.1:18769".parse().unwrap();
    let node_ports = vec!["ghost-leader=18768".to_string()];
    let config = node_config("n0", 18774, 18764, vec![unreachable], node_ports, dir.path());
    let node = node::spawn_with_election_config(config, fast_election())
        .await
        .unwrap();

    let reply = send_rpc(
        node.peer_addr,
        &RpcMessage::AppendEntries {
            term: 1,
            leader_id: "ghost-leader".to_string(),
            prev_log_index: -1,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: -1,
        },
    )
    .await;
    match reply {
        RpcMessage::AppendEntriesResponse { success, .. } => assert!(success),
        other => panic!("unexpected reply: {other:?}"),
    }
    assert_eq!(node.core.leader_id().as_deref(), Some("ghost-leader"));
    assert!(!node.core.is_leader());

    let client = reqwest::Client::new();
    let resp = client
        .post("http://127.0.0.1:18774/kill-leader")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}
