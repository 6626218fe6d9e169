//! Peer Transport (spec §4.4): one JSON-line request/response per TCP
//! connection, bounded dial and read timeouts, synthetic failure replies
//! on any transport error.
//!
//! Grounded in the teacher's `server::mod` accept-loop / per-connection
//! task pattern, generalized from its length-prefixed bincode framing to
//! newline-delimited JSON (spec §4.4, §6 mandate line-oriented JSON, not
//! a binary length prefix).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::consensus::rpc::RpcMessage;
use crate::consensus::ConsensusCore;

/// Outbound RPC client: one connection per call, bounded dial and read
/// deadlines (spec §4.4, reference 2s each).
#[derive(Debug, Clone)]
pub struct Transport {
    dial_timeout: Duration,
    read_timeout: Duration,
}

impl Transport {
    pub fn new(dial_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            read_timeout,
        }
    }

    /// Sends `msg` to `addr` and returns its reply, or a synthetic
    /// failure reply if the dial, write or read fails or times out
    /// (spec §4.4: "returns a synthetic failure reply... without
    /// crashing the caller").
    pub async fn call(&self, addr: SocketAddr, msg: RpcMessage) -> RpcMessage {
        match self.try_call(addr, &msg).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(%addr, error = %e, "rpc call failed, synthesizing failure reply");
                RpcMessage::synthetic_failure(0, &msg)
            }
        }
    }

    async fn try_call(&self, addr: SocketAddr, msg: &RpcMessage) -> anyhow::Result<RpcMessage> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr)).await??;

        let mut line = serde_json::to_string(msg)?;
        line.push('\n');

        let mut stream = stream;
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        let read = tokio::time::timeout(self.read_timeout, reader.read_line(&mut response_line)).await??;
        if read == 0 {
            anyhow::bail!("peer closed connection without replying");
        }

        let reply: RpcMessage = serde_json::from_str(response_line.trim_end())?;
        Ok(reply)
    }
}

/// Binds `bind_addr` and runs the inbound peer-RPC listener until the
/// process exits. One short-lived task per connection, dispatching by
/// `type` tag (spec §4.4).
pub async fn serve(core: Arc<ConsensusCore>, bind_addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    serve_on(core, listener).await
}

/// Runs the inbound peer-RPC listener on an already-bound socket (so a
/// caller can read back the OS-assigned address before the accept loop
/// starts, e.g. when a node is started on port 0 in a test).
pub async fn serve_on(core: Arc<ConsensusCore>, listener: TcpListener) -> anyhow::Result<()> {
    info!(bind_addr = %listener.local_addr()?, "peer transport listening");

    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "failed to accept peer connection");
                continue;
            }
        };

        let core = Arc::clone(&core);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(core, socket).await {
                warn!(%peer_addr, error = %e, "peer connection ended with error");
            }
        });
    }
}

async fn handle_connection(core: Arc<ConsensusCore>, socket: TcpStream) -> anyhow::Result<()> {
    let mut reader = BufReader::new(socket);
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Ok(());
    }

    let request: RpcMessage = serde_json::from_str(line.trim_end())?;
    let response = dispatch(&core, request).await;

    let mut out = serde_json::to_string(&response)?;
    out.push('\n');
    reader.get_mut().write_all(out.as_bytes()).await?;
    reader.get_mut().flush().await?;
    Ok(())
}

async fn dispatch(core: &ConsensusCore, request: RpcMessage) -> RpcMessage {
    match request {
        RpcMessage::RequestVote {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        } => core.handle_request_vote(term, candidate_id, last_log_index, last_log_term),
        RpcMessage::AppendEntries {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        } => {
            core.handle_append_entries(
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            )
            .await
        }
        other => {
            warn!(?other, "received a response-shaped message on the inbound listener, ignoring");
            RpcMessage::AppendEntriesResponse {
                term: core.current_term(),
                success: false,
                match_index: None,
            }
        }
    }
}
