//! HTTP and WebSocket façade
//!
//! A thin axum layer over the collector's public read API: status,
//! target listing, live stats and archived history, plus a WebSocket
//! endpoint streaming probe results filtered by a per-connection
//! subscription set. All measurement logic lives behind the collector;
//! this module only maps it onto routes and status codes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use shared::config::Target;
use shared::ipc::IpcDataPoint;
use shared::metrics::{BurstResult, Stats};

use crate::collector::Collector;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<Collector>,
    pub started_at: Instant,
}

/// Build the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/targets", get(get_targets))
        .route("/api/v1/targets/:name", get(get_target))
        .route("/api/v1/targets/:name/stats", get(get_target_stats))
        .route("/api/v1/targets/:name/history", get(get_target_history))
        .route("/api/v1/ws", get(ws_upgrade))
        .with_state(state)
}

/// Normalize a listen address: the config accepts the Go-style ":8080"
/// shorthand for all interfaces.
pub fn parse_listen_addr(address: &str) -> shared::Result<std::net::SocketAddr> {
    let normalized = if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    };
    normalized
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address {:?}: {}", address, e))
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime_secs: f64,
    target_count: usize,
    version: &'static str,
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs_f64(),
        target_count: state.collector.get_targets().len(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// A target together with its current live statistics
#[derive(Serialize)]
struct TargetWithStats {
    #[serde(flatten)]
    target: Target,
    stats: Stats,
}

async fn get_targets(State(state): State<AppState>) -> impl IntoResponse {
    let mut all_stats = state.collector.get_all_stats();
    let targets: Vec<TargetWithStats> = state
        .collector
        .get_targets()
        .into_iter()
        .map(|target| {
            let stats = all_stats
                .remove(&target.name)
                .unwrap_or_else(|| Stats::empty(&target.name));
            TargetWithStats { target, stats }
        })
        .collect();
    Json(targets)
}

async fn get_target(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .collector
        .get_targets()
        .into_iter()
        .find(|t| t.name == name)
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn get_target_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.collector.get_targets().iter().any(|t| t.name == name) {
        return Err(ApiError::NotFound);
    }
    Ok(Json(state.collector.get_stats(&name)))
}

#[derive(Deserialize)]
struct HistoryQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

async fn get_target_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.collector.get_targets().iter().any(|t| t.name == name) {
        return Err(ApiError::NotFound);
    }

    // Default window: the last hour
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - ChronoDuration::hours(1));

    let points = state
        .collector
        .fetch_history(&name, from, to)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let points: Vec<IpcDataPoint> = points.into_iter().map(IpcDataPoint::from).collect();
    Ok(Json(points))
}

/// Message from a WebSocket client adjusting its subscription set
#[derive(Deserialize)]
struct WsClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    targets: Vec<String>,
}

/// Message pushed to a subscribed WebSocket client
#[derive(Serialize)]
struct WsServerMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a BurstResult,
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(state, socket))
}

/// Per-connection WebSocket loop.
///
/// The client subscribes by target name or "all"; results outside its
/// set are filtered out before serialization. A connection whose send
/// fails is closed — the WS hub drops slow subscribers rather than
/// queueing for them.
async fn handle_ws(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let mut subscription = state.collector.subscribe();
    let mut subscribed: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<WsClientMessage>(&text) {
                        Ok(msg) => apply_ws_subscription(&mut subscribed, msg),
                        Err(e) => debug!("ignoring malformed ws message: {}", e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong handled by axum
                Some(Err(e)) => {
                    debug!("ws receive error: {}", e);
                    break;
                }
            },
            result = subscription.recv() => match result {
                Some(result) => {
                    if !ws_wants(&subscribed, &result.target) {
                        continue;
                    }
                    let message = WsServerMessage { kind: "probe_result", data: &result };
                    let encoded = match serde_json::to_string(&message) {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            warn!("failed to encode ws message: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(encoded)).await.is_err() {
                        break;
                    }
                }
                None => break, // collector shut down
            }
        }
    }
}

fn apply_ws_subscription(subscribed: &mut HashSet<String>, msg: WsClientMessage) {
    match msg.kind.as_str() {
        "subscribe" => subscribed.extend(msg.targets),
        "unsubscribe" => {
            if msg.targets.iter().any(|t| t == "all") {
                subscribed.clear();
            } else {
                for target in &msg.targets {
                    subscribed.remove(target);
                }
            }
        }
        other => debug!("unknown ws message type: {}", other),
    }
}

fn ws_wants(subscribed: &HashSet<String>, target: &str) -> bool {
    subscribed.contains("all") || subscribed.contains(target)
}

/// Handler error mapped onto a status code and JSON body
enum ApiError {
    NotFound,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "target not found".to_string()),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(
            parse_listen_addr(":8080").unwrap(),
            "0.0.0.0:8080".parse::<std::net::SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<std::net::SocketAddr>().unwrap()
        );
        assert!(parse_listen_addr("not an address").is_err());
        assert!(parse_listen_addr(":notaport").is_err());
    }

    #[test]
    fn test_ws_subscription_set() {
        let mut set = HashSet::new();

        apply_ws_subscription(
            &mut set,
            WsClientMessage {
                kind: "subscribe".to_string(),
                targets: vec!["DNS".to_string(), "Web".to_string()],
            },
        );
        assert!(ws_wants(&set, "DNS"));
        assert!(ws_wants(&set, "Web"));
        assert!(!ws_wants(&set, "Other"));

        apply_ws_subscription(
            &mut set,
            WsClientMessage {
                kind: "unsubscribe".to_string(),
                targets: vec!["DNS".to_string()],
            },
        );
        assert!(!ws_wants(&set, "DNS"));

        apply_ws_subscription(
            &mut set,
            WsClientMessage {
                kind: "subscribe".to_string(),
                targets: vec!["all".to_string()],
            },
        );
        assert!(ws_wants(&set, "anything"));

        apply_ws_subscription(
            &mut set,
            WsClientMessage {
                kind: "unsubscribe".to_string(),
                targets: vec!["all".to_string()],
            },
        );
        assert!(!ws_wants(&set, "anything"));
    }
}
