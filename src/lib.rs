//! # chat-raft
//!
//! The consensus core of a replicated chat service: leader election over
//! an asynchronous network, log replication with prefix consistency and
//! majority commit, and a deterministic state machine that applies
//! committed chat/room commands behind a bounded retention window.
//!
//! This crate is the core only — the end-user client, the polling UI
//! loop, and the cluster-front load balancer are external collaborators
//! addressed through [`gateway`]'s HTTP surface and [`consensus::rpc`]'s
//! wire format, not implemented here.
//!
//! ## Module map
//!
//! - [`peers`] — who belongs to the cluster right now, and quorum math.
//! - [`command`] — the wire command enum and replicated log entries.
//! - [`log`] — the in-memory, dense, truncatable replicated log.
//! - [`state_machine`] — deterministic apply, retention, durable persistence.
//! - [`consensus`] — terms, votes, roles, election, replication, commit.
//! - [`transport`] — the peer-to-peer RPC channel the core runs over.
//! - [`gateway`] — the HTTP adapter clients actually talk to.
//! - [`config`] — CLI/env surface for a single node.
//! - [`node`] — wires the above into one running node.

pub mod command;
pub mod config;
pub mod consensus;
pub mod error;
pub mod gateway;
pub mod log;
pub mod node;
pub mod peers;
pub mod state_machine;
pub mod transport;

pub use command::{Command, LogEntry, MAX_MESSAGE_LENGTH};
pub use consensus::{ClientReply, ConsensusCore, ElectionConfig, Role};
pub use config::{DiscoveryMode, NodeConfig};
pub use peers::{majority, DynamicPeerDirectory, PeerDirectory, StaticPeerDirectory};
pub use state_machine::{ChatStateMachine, RETENTION_LIMIT};
pub use transport::Transport;
