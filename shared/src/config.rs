//! Configuration types and validation for the pulse daemon
//!
//! The daemon reads a single YAML file with four sections: `server` (HTTP
//! façade), `global` (probe cadence), `storage` (archive retention) and
//! `targets` (the monitored endpoints). All validation happens at load
//! time; a daemon that got past [`Config::validate`] never has to
//! re-check these invariants.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::defaults::*;
use crate::duration::{parse_duration, serde_duration};
use crate::PulseError;

/// Root configuration loaded from config.yaml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// HTTP façade settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Global probe settings shared by all targets
    #[serde(default)]
    pub global: GlobalConfig,
    /// Archive retention settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// The monitored endpoints; at least one is required
    #[serde(default)]
    pub targets: Vec<Target>,
}

/// HTTP API server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Listen address for the HTTP façade, e.g. ":8080" or "127.0.0.1:8080"
    #[serde(default = "default_address")]
    pub address: String,
    /// Whether the terminal UI may attach to this daemon
    #[serde(default = "default_enable_tui")]
    pub enable_tui: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            enable_tui: default_enable_tui(),
        }
    }
}

/// Global probe settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    /// Time between probe rounds; every target is probed once per round
    #[serde(default = "default_interval", with = "serde_duration")]
    pub interval: Duration,
    /// Deadline for a single burst, measured from the start of the round.
    /// Must be strictly less than `interval`.
    #[serde(default = "default_timeout", with = "serde_duration")]
    pub timeout: Duration,
    /// Number of pings per burst (SmokePing-style), 1..=100
    #[serde(default = "default_pings")]
    pub pings: u32,
    /// Directory for the per-target archive files; resolved from the
    /// platform default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            timeout: default_timeout(),
            pings: default_pings(),
            data_dir: None,
        }
    }
}

/// Archive storage settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Retention specification, e.g. "10s:1d,1m:7d,1h:90d". The first
    /// resolution should match `global.interval`.
    #[serde(default = "default_retention")]
    pub retention: String,
    /// Consolidation function applied to every archive
    #[serde(default = "default_aggregation")]
    pub aggregation: Aggregation,
    /// xFilesFactor: the fraction of raw samples in a consolidated bucket
    /// that may be unknown before the bucket itself becomes unknown
    #[serde(default = "default_xff")]
    pub xff: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            aggregation: default_aggregation(),
            xff: default_xff(),
        }
    }
}

/// Consolidation function for archive buckets
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Average,
    Min,
    Max,
    Last,
}

impl Aggregation {
    /// Canonical uppercase name as used in archive headers and logs
    pub fn as_upper(&self) -> &'static str {
        match self {
            Aggregation::Average => "AVERAGE",
            Aggregation::Min => "MIN",
            Aggregation::Max => "MAX",
            Aggregation::Last => "LAST",
        }
    }
}

/// Probe variant for a target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Icmp,
    Tcp,
}

/// A monitored endpoint. Immutable after configuration load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    /// Unique display name, also the key under which samples are stored
    pub name: String,
    /// DNS name or IP literal
    pub host: String,
    /// TCP port; required iff `probe` is `tcp`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Probe variant
    pub probe: ProbeKind,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        let cfg = Self::from_yaml(&raw)?;
        Ok(cfg)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> crate::Result<Self> {
        let cfg: Config = serde_yaml::from_str(raw).context("failed to parse config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the configuration for required fields and valid values.
    pub fn validate(&self) -> crate::Result<()> {
        if self.targets.is_empty() {
            return Err(PulseError::Config("at least one target is required".to_string()).into());
        }

        for (i, target) in self.targets.iter().enumerate() {
            if target.name.is_empty() {
                return Err(
                    PulseError::Config(format!("target[{}]: name is required", i)).into(),
                );
            }
            if target.host.is_empty() {
                return Err(PulseError::Config(format!(
                    "target[{}] {:?}: host is required",
                    i, target.name
                ))
                .into());
            }
            match target.port {
                Some(0) => {
                    return Err(PulseError::Config(format!(
                        "target[{}] {:?}: port must be between 1 and 65535",
                        i, target.name
                    ))
                    .into());
                }
                None if target.probe == ProbeKind::Tcp => {
                    return Err(PulseError::Config(format!(
                        "target[{}] {:?}: port is required for TCP probe",
                        i, target.name
                    ))
                    .into());
                }
                _ => {}
            }
        }

        let duplicate = self
            .targets
            .iter()
            .enumerate()
            .find(|(i, t)| self.targets[..*i].iter().any(|other| other.name == t.name));
        if let Some((_, t)) = duplicate {
            return Err(PulseError::Config(format!(
                "duplicate target name {:?}",
                t.name
            ))
            .into());
        }

        if self.global.interval.is_zero() {
            return Err(PulseError::Config("global.interval must be positive".to_string()).into());
        }
        if self.global.timeout.is_zero() {
            return Err(PulseError::Config("global.timeout must be positive".to_string()).into());
        }
        if self.global.timeout >= self.global.interval {
            return Err(PulseError::Config(
                "global.timeout must be less than global.interval".to_string(),
            )
            .into());
        }
        if self.global.pings < 1 || self.global.pings > 100 {
            return Err(
                PulseError::Config("global.pings must be between 1 and 100".to_string()).into(),
            );
        }

        if !(0.0..=1.0).contains(&self.storage.xff) {
            return Err(
                PulseError::Config("storage.xff must be between 0 and 1".to_string()).into(),
            );
        }

        validate_retention(&self.storage.retention)
            .map_err(|e| PulseError::Config(format!("storage.retention: {}", e)))?;

        Ok(())
    }
}

/// Validate the archive retention string format.
///
/// Format: `"resolution:duration,resolution:duration,..."`, e.g.
/// `"10s:1d"` or `"10s:1d,1m:7d,1h:90d"`. Errors name the offending
/// archive so a typo in a long retention list is easy to find.
pub fn validate_retention(retention: &str) -> Result<(), String> {
    if retention.trim().is_empty() {
        return Err("retention string cannot be empty".to_string());
    }

    for (i, archive) in retention.split(',').enumerate() {
        let archive = archive.trim();
        let parts: Vec<&str> = archive.split(':').collect();
        if parts.len() != 2 {
            return Err(format!(
                "archive {}: expected format 'resolution:duration', got {:?}",
                i + 1,
                archive
            ));
        }
        if let Err(e) = parse_duration(parts[0]) {
            return Err(format!("archive {}: invalid resolution: {}", i + 1, e));
        }
        if let Err(e) = parse_duration(parts[1]) {
            return Err(format!("archive {}: invalid duration: {}", i + 1, e));
        }
    }

    Ok(())
}
