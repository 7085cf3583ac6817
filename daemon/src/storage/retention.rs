//! Retention string parsing for the round-robin archives
//!
//! A retention spec like `"10s:1d,1m:7d,1h:90d"` describes one archive
//! per comma-separated entry: samples at `resolution` kept for
//! `duration`. Resolutions are expressed in consolidation steps relative
//! to the base step, rows as the retained bucket count.

use std::time::Duration;

use anyhow::Result;
use shared::duration::parse_duration;
use shared::PulseError;

/// One archive's shape: `steps` base steps per consolidated bucket,
/// `rows` retained buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RraConfig {
    pub steps: u64,
    pub rows: u64,
}

/// Parse a retention string into archive configurations.
///
/// `steps = resolution / base_step` and `rows = duration / resolution`,
/// both by integer division and clamped to at least 1.
pub fn parse_retention(retention: &str, base_step: Duration) -> Result<Vec<RraConfig>> {
    let base_secs = base_step.as_secs().max(1);
    let mut rras = Vec::new();

    for part in retention.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let mut pieces = part.split(':');
        let (resolution, duration) = match (pieces.next(), pieces.next(), pieces.next()) {
            (Some(r), Some(d), None) => (r, d),
            _ => {
                return Err(PulseError::Storage(format!(
                    "invalid retention format: {}",
                    part
                ))
                .into());
            }
        };

        let resolution = parse_duration(resolution)
            .map_err(|e| PulseError::Storage(format!("invalid resolution in {}: {}", part, e)))?;
        let duration = parse_duration(duration)
            .map_err(|e| PulseError::Storage(format!("invalid duration in {}: {}", part, e)))?;

        let steps = (resolution.as_secs() / base_secs).max(1);
        let rows = (duration.as_secs() / resolution.as_secs().max(1)).max(1);

        rras.push(RraConfig { steps, rows });
    }

    if rras.is_empty() {
        return Err(PulseError::Storage("no valid retentions found".to_string()).into());
    }

    Ok(rras)
}
