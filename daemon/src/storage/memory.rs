//! In-memory ring buffer with live statistics
//!
//! Each target owns a fixed-capacity circular sample store; statistics
//! are computed on demand over the window that starts at the oldest
//! successful sample still in the buffer. Until a target has seen its
//! first success, its stats read as empty rather than as 100% loss —
//! a freshly added target that hasn't answered yet is "no data", not
//! "down since forever".

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use shared::metrics::Stats;

const DEFAULT_BUFFER_SIZE: usize = 100;

/// Ring-buffered live sample store for all targets.
///
/// Locking: the outer map lock is only written when a new target
/// appears; each per-target buffer has its own lock so concurrent
/// targets never serialize on one another.
pub struct MemoryBuffer {
    buffer_size: usize,
    targets: RwLock<HashMap<String, Arc<RwLock<TargetBuffer>>>>,
}

/// A single measurement slot
#[derive(Debug, Clone, Copy)]
struct Sample {
    #[allow(dead_code)]
    timestamp: DateTime<Utc>,
    /// Latency in milliseconds; negative means the sample was a loss
    latency_ms: f64,
}

/// Circular store for one target
struct TargetBuffer {
    samples: Vec<Sample>,
    /// Next write position
    head: usize,
    /// Number of valid samples
    count: usize,
    /// Whether the buffer has wrapped at least once
    full: bool,
    last_update: Option<DateTime<Utc>>,
    /// Position of the oldest successful sample still in the buffer
    first_success_idx: Option<usize>,
}

impl TargetBuffer {
    fn new(capacity: usize) -> Self {
        TargetBuffer {
            samples: vec![
                Sample {
                    timestamp: DateTime::<Utc>::MIN_UTC,
                    latency_ms: -1.0,
                };
                capacity
            ],
            head: 0,
            count: 0,
            full: false,
            last_update: None,
            first_success_idx: None,
        }
    }

    fn write(&mut self, timestamp: DateTime<Utc>, latency_ms: f64) {
        let cap = self.samples.len();
        let overwriting = self.count == cap;
        let current = self.head;

        self.samples[current] = Sample {
            timestamp,
            latency_ms,
        };
        self.head = (self.head + 1) % cap;
        if !overwriting {
            self.count += 1;
            if self.count == cap {
                self.full = true;
            }
        }

        match self.first_success_idx {
            None => {
                if latency_ms >= 0.0 {
                    self.first_success_idx = Some(current);
                }
            }
            Some(idx) if overwriting && idx == current => {
                // The tracked first success was just overwritten; rescan
                // from the new oldest slot for the next one. The slot we
                // just wrote is scanned last, as the newest sample.
                self.first_success_idx = None;
                for i in 0..cap {
                    let idx = (self.head + i) % cap;
                    if self.samples[idx].latency_ms >= 0.0 {
                        self.first_success_idx = Some(idx);
                        break;
                    }
                }
            }
            Some(_) => {}
        }

        self.last_update = Some(timestamp);
    }

    /// Number of slots from `first_success_idx` up to (excluding) `head`.
    fn window_len(&self, first_success: usize) -> usize {
        let cap = self.samples.len();
        if self.full {
            if self.head > first_success {
                self.head - first_success
            } else {
                cap - first_success + self.head
            }
        } else {
            self.count - first_success
        }
    }

    fn stats(&self, target: &str) -> Stats {
        let mut stats = Stats::empty(target);
        stats.last_update = self.last_update;

        let first_success = match self.first_success_idx {
            Some(idx) if self.count > 0 => idx,
            _ => return stats,
        };

        let cap = self.samples.len();
        let window = self.window_len(first_success);
        if window == 0 {
            return stats;
        }

        let mut values = Vec::with_capacity(window);
        let mut losses = 0usize;
        for i in 0..window {
            let idx = (first_success + i) % cap;
            let latency = self.samples[idx].latency_ms;
            if latency < 0.0 {
                losses += 1;
            } else {
                values.push(latency);
            }
        }

        stats.sample_count = window;
        stats.loss_pct = losses as f64 / window as f64 * 100.0;

        if values.is_empty() {
            stats.last_ms = -1.0;
            return stats;
        }

        let last_idx = (self.head + cap - 1) % cap;
        stats.last_ms = self.samples[last_idx].latency_ms;

        let mut sorted = values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        stats.min_ms = sorted[0];
        stats.max_ms = sorted[sorted.len() - 1];
        stats.median_ms = percentile(&sorted, 50.0);
        stats.p95_ms = percentile(&sorted, 95.0);
        stats.avg_ms = mean(&values);
        stats.stddev_ms = stddev(&values, stats.avg_ms);

        stats
    }
}

impl MemoryBuffer {
    pub fn new(buffer_size: usize) -> Self {
        let buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        MemoryBuffer {
            buffer_size,
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Store a latency sample for a target. Negative latency records a
    /// loss. O(1) except when the write evicts the tracked first
    /// success, which triggers a linear rescan.
    pub fn write(&self, target: &str, timestamp: DateTime<Utc>, latency_ms: f64) {
        let buffer = self.buffer_for(target);
        let mut buffer = buffer.write().unwrap_or_else(|e| e.into_inner());
        buffer.write(timestamp, latency_ms);
    }

    /// Current statistics for a target. Unknown targets report empty
    /// stats rather than an error.
    pub fn get_stats(&self, target: &str) -> Stats {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        match targets.get(target) {
            Some(buffer) => {
                let buffer = buffer.read().unwrap_or_else(|e| e.into_inner());
                buffer.stats(target)
            }
            None => Stats::empty(target),
        }
    }

    /// The last `count` latency values for a target in chronological
    /// order (for sparklines). `count == 0` returns the whole window.
    pub fn get_history(&self, target: &str, count: usize) -> Vec<f64> {
        let buffer = {
            let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
            match targets.get(target) {
                Some(buffer) => Arc::clone(buffer),
                None => return Vec::new(),
            }
        };
        let buffer = buffer.read().unwrap_or_else(|e| e.into_inner());

        let cap = buffer.samples.len();
        let count = if count == 0 || count > buffer.count {
            buffer.count
        } else {
            count
        };

        let start = (buffer.head + cap - count) % cap;
        (0..count)
            .map(|i| buffer.samples[(start + i) % cap].latency_ms)
            .collect()
    }

    /// Statistics for every known target.
    pub fn get_all_stats(&self) -> HashMap<String, Stats> {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        targets
            .iter()
            .map(|(name, buffer)| {
                let buffer = buffer.read().unwrap_or_else(|e| e.into_inner());
                (name.clone(), buffer.stats(name))
            })
            .collect()
    }

    fn buffer_for(&self, target: &str) -> Arc<RwLock<TargetBuffer>> {
        {
            let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
            if let Some(buffer) = targets.get(target) {
                return Arc::clone(buffer);
            }
        }

        let mut targets = self.targets.write().unwrap_or_else(|e| e.into_inner());
        // Double-check after upgrading to the write lock
        Arc::clone(
            targets
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(TargetBuffer::new(self.buffer_size)))),
        )
    }
}

impl Default for MemoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// The p-th percentile of sorted values, with linear interpolation
/// between the neighboring ranks.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let idx = (p / 100.0) * (len - 1) as f64;
            let lower = idx.floor() as usize;
            let upper = idx.ceil() as usize;
            if lower == upper {
                sorted[lower]
            } else {
                let weight = idx - lower as f64;
                sorted[lower] * (1.0 - weight) + sorted[upper] * weight
            }
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (divisor n).
fn stddev(values: &[f64], avg: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let sum_squares: f64 = values.iter().map(|v| (v - avg) * (v - avg)).sum();
    (sum_squares / values.len() as f64).sqrt()
}
