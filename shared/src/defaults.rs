//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields.

use std::time::Duration;

use crate::config::Aggregation;

/// Default HTTP API listen address
pub fn default_address() -> String {
    ":8080".to_string()
}

/// Default terminal UI enablement
pub fn default_enable_tui() -> bool {
    true
}

/// Default probe interval (10 seconds, one burst per tick)
pub fn default_interval() -> Duration {
    Duration::from_secs(10)
}

/// Default probe timeout (5 seconds, must stay below the interval)
pub fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Default number of pings per burst
pub fn default_pings() -> u32 {
    10
}

/// Default archive retention: 10s samples for a day, minutes for a week,
/// hours for 90 days
pub fn default_retention() -> String {
    "10s:1d,1m:7d,1h:90d".to_string()
}

/// Default archive consolidation function
pub fn default_aggregation() -> Aggregation {
    Aggregation::Average
}

/// Default xFilesFactor: a consolidated point stays known while at least
/// half of its raw samples are known
pub fn default_xff() -> f64 {
    0.5
}
