//! The two consensus RPCs, as plain JSON-lines messages (spec §6).
//!
//! One JSON object per line over TCP; `type` discriminates the four
//! message shapes. Internally tagged so the wire shape stays a flat
//! object rather than a `{type, payload}` envelope, matching the
//! original's untyped-dict-with-a-type-key messages
//! (`original_source/server/message_protocol.py`).

use serde::{Deserialize, Serialize};

use crate::command::LogEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcMessage {
    RequestVote {
        term: u64,
        candidate_id: String,
        last_log_index: i64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        term: u64,
        vote_granted: bool,
    },
    AppendEntries {
        term: u64,
        leader_id: String,
        prev_log_index: i64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: i64,
    },
    AppendEntriesResponse {
        term: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        match_index: Option<i64>,
    },
}

impl RpcMessage {
    /// A synthetic failure reply for the RPC kind that was attempted,
    /// returned by the transport layer on timeout/dial failure
    /// (spec §4.4) rather than propagating the transport error.
    pub fn synthetic_failure(term: u64, request: &RpcMessage) -> RpcMessage {
        match request {
            RpcMessage::RequestVote { .. } => RpcMessage::RequestVoteResponse {
                term,
                vote_granted: false,
            },
            RpcMessage::AppendEntries { .. } => RpcMessage::AppendEntriesResponse {
                term,
                success: false,
                match_index: None,
            },
            other => other.clone(),
        }
    }
}
