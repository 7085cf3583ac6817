//! Wire protocol for the daemon's local IPC socket
//!
//! Each message is a single JSON object terminated by a newline. Requests
//! may carry a client-chosen `id`, which the daemon echoes on the matching
//! response; pushed `probe_result` messages carry no id. Unknown fields
//! are ignored on both sides so old clients keep working against newer
//! daemons. Timestamps are RFC 3339 with nanosecond precision (the chrono
//! serde default).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Target;
use crate::metrics::{BurstResult, DataPoint, Stats};

/// Message type constants shared by client and server
pub mod msg {
    // Client -> server
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const GET_TARGETS: &str = "get_targets";
    pub const GET_STATS: &str = "get_stats";
    pub const GET_HISTORY: &str = "get_history";

    // Server -> client
    pub const OK: &str = "ok";
    pub const TARGETS: &str = "targets";
    pub const STATS: &str = "stats";
    pub const HISTORY: &str = "history";
    pub const PROBE_RESULT: &str = "probe_result";
    pub const ERROR: &str = "error";
}

/// Maximum accepted message size in bytes (per side, per message)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Request envelope, client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen correlation id, echoed on the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Response envelope, server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Echo of the request id; absent on pushed messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Acknowledgement for a subscribe/unsubscribe request.
    pub fn ok(id: Option<String>) -> Self {
        Response {
            id,
            kind: msg::OK.to_string(),
            data: None,
            error: None,
        }
    }

    /// Error response; `id` is the offending request's id when it had one.
    pub fn error(id: Option<String>, message: impl Into<String>) -> Self {
        Response {
            id,
            kind: msg::ERROR.to_string(),
            data: None,
            error: Some(message.into()),
        }
    }

    /// Successful response carrying a serialized payload.
    pub fn with_data<T: Serialize>(
        id: Option<String>,
        kind: &str,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Response {
            id,
            kind: kind.to_string(),
            data: Some(serde_json::to_value(payload)?),
            error: None,
        })
    }
}

/// Payload of a `get_stats` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStatsRequest {
    pub target: String,
}

/// Payload of a `get_history` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHistoryRequest {
    pub target: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Payload of a `targets` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetsResponse {
    pub targets: Vec<Target>,
}

/// Payload of a `stats` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub target: String,
    pub stats: Stats,
}

/// Payload of a `history` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub target: String,
    pub data_points: Vec<IpcDataPoint>,
}

/// Payload of a pushed `probe_result` message: the full burst result.
pub type ProbeResultData = BurstResult;

/// JSON-safe archived data point.
///
/// JSON has no NaN, so unknown values travel as null: `value` is null
/// when the bucket's latency is unknown, `loss` is null when the bucket
/// holds no data at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcDataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
    pub loss: Option<f64>,
}

impl From<DataPoint> for IpcDataPoint {
    fn from(p: DataPoint) -> Self {
        IpcDataPoint {
            timestamp: p.timestamp,
            value: (!p.value.is_nan()).then_some(p.value),
            loss: (!p.loss.is_nan()).then_some(p.loss),
        }
    }
}

impl From<IpcDataPoint> for DataPoint {
    fn from(p: IpcDataPoint) -> Self {
        DataPoint {
            timestamp: p.timestamp,
            value: p.value.unwrap_or(f64::NAN),
            loss: p.loss.unwrap_or(f64::NAN),
        }
    }
}
