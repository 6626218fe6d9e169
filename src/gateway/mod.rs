//! The Request Gateway (spec §4.5): the HTTP-level adapter. Contains no
//! consensus logic beyond routing — every handler either reads a
//! snapshot off the core or forwards a command to it and translates the
//! reply into the status/body table of spec §4.5.
//!
//! Grounded in `aresa-cli/src/server.rs`'s embedded `axum::Router` +
//! `State<AppState>` pattern, the only place in the retrieved pack that
//! builds an HTTP surface on this stack. The endpoint set, classification
//! table and `/kill-leader` semantics come from
//! `original_source/server/node.py`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::header::{HeaderMap, HeaderValue, HOST, LOCATION};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::command::Command;
use crate::consensus::{ClientReply, ConsensusCore};
use crate::error::GatewayError;
use crate::transport::Transport;

/// Resolves the redirect target for a known leader (spec §4.5 "Location
/// policy"): a configured public front-door hostname always wins; failing
/// that, a static node-id → port map; failing that, the incoming `Host`
/// header.
#[derive(Debug, Clone, Default)]
pub struct LocationConfig {
    pub public_host: Option<String>,
    pub public_scheme: String,
    pub node_ports: HashMap<String, u16>,
}

impl LocationConfig {
    pub fn location_for(&self, leader_id: &str, path: &str, fallback_host: &str) -> String {
        if let Some(host) = &self.public_host {
            let scheme = if self.public_scheme.is_empty() {
                "http"
            } else {
                self.public_scheme.as_str()
            };
            return format!("{scheme}://{host}{path}");
        }
        if let Some(port) = self.node_ports.get(leader_id) {
            return format!("http://127.0.0.1:{port}{path}");
        }
        format!("http://{fallback_host}{path}")
    }
}

pub struct GatewayState {
    pub core: Arc<ConsensusCore>,
    pub transport: Transport,
    pub location: LocationConfig,
    pub http_client: reqwest::Client,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/messages", get(get_messages))
        .route("/chat", post(post_chat))
        .route("/instances", get(get_instances))
        .route("/leader", get(get_leader))
        .route("/kill-leader", post(kill_leader))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn get_messages(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.core.visible_messages())
}

async fn get_instances(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({ "instances": state.core.known_instances() }))
}

async fn get_leader(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({ "leader_id": state.core.leader_id() }))
}

async fn post_chat(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let command: Command = match serde_json::from_slice(&body) {
        Ok(c) => c,
        Err(e) => return GatewayError::MalformedCommand(e.to_string()).into_response(),
    };

    if let Err(e) = command.validate() {
        return GatewayError::MessageTooLong {
            len: e.len,
            max: e.max,
        }
        .into_response();
    }

    let reply = state.core.submit_command(command, &state.transport).await;
    classify(reply, &state, &headers)
}

fn classify(reply: ClientReply, state: &GatewayState, headers: &HeaderMap) -> Response {
    match reply {
        ClientReply::Ok { index } => {
            (StatusCode::OK, Json(json!({ "status": "ok", "index": index }))).into_response()
        }
        ClientReply::Failed => {
            (StatusCode::OK, Json(json!({ "status": "failed" }))).into_response()
        }
        ClientReply::NotLeader { leader: Some(leader) } => {
            let host = headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let location = state.location.location_for(&leader, "/chat", host);
            let mut response = StatusCode::FOUND.into_response();
            match HeaderValue::from_str(&location) {
                Ok(value) => {
                    response.headers_mut().insert(LOCATION, value);
                }
                Err(e) => warn!(location, error = %e, "location header is not a valid header value"),
            }
            response
        }
        ClientReply::NotLeader { leader: None } => StatusCode::FOUND.into_response(),
    }
}

/// `/kill-leader` (spec §4.5.1): a chaos-test hook, not part of the
/// normal command path.
async fn kill_leader(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    if state.core.leader_id().is_none() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "election_in_progress" })),
        )
            .into_response();
    }

    if state.core.is_leader() {
        warn!("kill-leader invoked against this leader, terminating process to simulate a crash");
        tokio::spawn(async {
            // Give the response a moment to flush before the hard exit;
            // exactly-once delivery of this response is not guaranteed
            // (spec §4.5.1).
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::process::exit(1);
        });
        return (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response();
    }

    let leader_id = state.core.leader_id().unwrap_or_default();
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let url = state.location.location_for(&leader_id, "/kill-leader", host);

    match state.http_client.post(&url).send().await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => {
            info!(error = %e, "connection to leader lost during kill-leader proxy, treating as success");
            (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
        }
    }
}
