//! The command wire format (spec §6) and the log entries that carry it.
//!
//! The original Python implementation passes commands around as untyped
//! dicts with a `type` key (`original_source/server/raft.py`,
//! `original_source/server/node.py`). The Rust port closes that over a
//! tagged enum so every variant is statically known, while keeping the
//! exact wire shape via serde's internal tagging (REDESIGN FLAGS, spec §9).

use serde::{Deserialize, Serialize};

/// Maximum length, in characters, of a chat command's `text` field.
pub const MAX_MESSAGE_LENGTH: usize = 256;

/// A client-submitted or replicated command.
///
/// `Unknown` exists purely for forward compatibility when reading a
/// durable log written by a newer version of this crate: an unrecognized
/// `type` tag deserializes here instead of failing the whole file load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// A user-visible chat message.
    Chat {
        user: String,
        text: String,
        room: String,
        /// Client-chosen opaque token, used by readers to de-duplicate on
        /// re-poll. Never interpreted by the core.
        id: String,
    },
    /// Create a chat room.
    RoomAdd { room: String, user: String },
    /// Remove a chat room.
    RoomDelete { room: String, user: String },
    /// Anything this build doesn't recognize. Only ever produced by
    /// deserialization (load of a persisted log written by a newer
    /// version); never constructed by client-facing code.
    #[serde(other)]
    Unknown,
}

/// The one condition `Command::validate` currently checks for: an
/// oversize `chat` message (spec §4.5, `MAX_MESSAGE_LENGTH`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTooLong {
    pub len: usize,
    pub max: usize,
}

impl Command {
    /// Validate a freshly-deserialized client command before it is handed
    /// to the consensus core. `Ok(())` unless this is an oversize `chat`
    /// message.
    pub fn validate(&self) -> Result<(), MessageTooLong> {
        match self {
            Command::Chat { text, .. } if text.chars().count() > MAX_MESSAGE_LENGTH => {
                Err(MessageTooLong {
                    len: text.chars().count(),
                    max: MAX_MESSAGE_LENGTH,
                })
            }
            _ => Ok(()),
        }
    }
}

/// A single entry in the replicated log: a term paired with the command
/// that entry carries (spec §3, "Log Entry").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: u64, command: Command) -> Self {
        Self { term, command }
    }
}
