//! Measurement types for the latency monitor
//!
//! This module defines the result of a probe burst, the derived live
//! statistics served from the ring buffer, and the archived data point
//! shape returned by history queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one probe burst against one target.
///
/// `latency_ms` is the SmokePing-canonical median of the burst's RTTs; it
/// is `-1.0` when every ping in the burst was lost. The remaining
/// statistics are all zero on total loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BurstResult {
    /// Name of the target this burst probed
    pub target: String,
    /// When the burst completed
    pub timestamp: DateTime<Utc>,
    /// Median burst latency in milliseconds, -1 on total loss
    pub latency_ms: f64,
    /// Whether at least one ping got a reply
    pub success: bool,
    /// Error description when the burst failed outright
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Minimum RTT in the burst (ms)
    pub min_ms: f64,
    /// Maximum RTT in the burst (ms)
    pub max_ms: f64,
    /// Mean RTT in the burst (ms)
    pub avg_ms: f64,
    /// Median RTT in the burst (ms); equals `latency_ms` on success
    pub median_ms: f64,
    /// Standard deviation of the burst RTTs (ms)
    pub jitter_ms: f64,
    /// Packet loss percentage, 0..=100
    pub loss_pct: f64,
    /// Pings sent in this burst
    pub pings_sent: u32,
    /// Replies received in this burst
    pub pings_recv: u32,
}

/// Live statistics for one target, derived from the ring buffer window.
///
/// All fields stay at their zero values until the target has seen its
/// first successful ping; an all-loss cold start is reported as "no data"
/// rather than 100% loss.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Stats {
    /// Name of the target
    pub target: String,
    /// Minimum latency over the window (ms)
    pub min_ms: f64,
    /// Maximum latency over the window (ms)
    pub max_ms: f64,
    /// Mean latency over the window (ms)
    pub avg_ms: f64,
    /// Median latency over the window (ms)
    pub median_ms: f64,
    /// 95th percentile latency over the window (ms)
    pub p95_ms: f64,
    /// Population standard deviation over the window (ms)
    pub stddev_ms: f64,
    /// Percentage of lost samples in the window, 0..=100
    pub loss_pct: f64,
    /// Number of samples in the window, losses included
    pub sample_count: usize,
    /// Most recent sample (ms), -1 when the most recent sample was a loss
    pub last_ms: f64,
    /// Timestamp of the most recent write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl Stats {
    /// Empty statistics for a target with no successful samples yet.
    pub fn empty(target: &str) -> Self {
        Stats {
            target: target.to_string(),
            ..Default::default()
        }
    }
}

/// A single archived time-series point.
///
/// `value` is the consolidated latency in milliseconds and `loss` the
/// consolidated loss ratio in 0..=1; either is NaN when the bucket holds
/// no usable data. NaN never crosses the IPC/HTTP boundary — see
/// [`crate::ipc::IpcDataPoint`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub loss: f64,
}
