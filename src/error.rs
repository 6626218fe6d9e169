//! Gateway-facing error types.
//!
//! Internal plumbing (transport, WAL, peer directory) uses `anyhow::Result`
//! throughout, matching the rest of the crate. The handful of error
//! conditions that must cross the HTTP boundary as a specific status code
//! get their own closed enum instead, mirroring `server::protocol::ErrorCode`
//! in the teacher crate this was adapted from.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

/// Errors the Request Gateway can surface directly to an HTTP client.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The `text` field of a `chat` command exceeded `MAX_MESSAGE_LENGTH`.
    #[error("message too long ({len} chars, max {max})")]
    MessageTooLong { len: usize, max: usize },

    /// The request body was not valid JSON, or was missing required fields
    /// for its `type`.
    #[error("malformed command: {0}")]
    MalformedCommand(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = json!({ "status": "error", "error": self.to_string() });
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}
