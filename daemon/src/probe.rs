//! Probe primitives shared by the ICMP and TCP variants
//!
//! A probe executes one burst per scheduling round and condenses the
//! collected round-trip times into a [`BurstResult`]. Probes never fail
//! outward: anything that goes wrong (unresolvable host, socket errors,
//! full packet loss) is expressed inside the result so the collector's
//! round handling stays uniform.

use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use shared::config::{ProbeKind, Target};
use shared::metrics::BurstResult;

use crate::probe_icmp::IcmpProbe;
use crate::probe_tcp::TcpProbe;

/// One monitored endpoint's probe. The variant is fixed at construction
/// from the target configuration.
pub enum Probe {
    Icmp(IcmpProbe),
    Tcp(TcpProbe),
}

impl Probe {
    /// Build the probe matching a target's configuration.
    pub fn for_target(target: &Target, timeout: Duration, pings: u32) -> Probe {
        let spec = ProbeSpec::new(&target.name, &target.host, timeout, pings);
        match target.probe {
            ProbeKind::Icmp => Probe::Icmp(IcmpProbe::new(spec)),
            // Config validation guarantees a port for TCP targets
            ProbeKind::Tcp => Probe::Tcp(TcpProbe::new(spec, target.port.unwrap_or(0))),
        }
    }

    /// Target name this probe reports under.
    pub fn name(&self) -> &str {
        match self {
            Probe::Icmp(p) => &p.spec.name,
            Probe::Tcp(p) => &p.spec.name,
        }
    }

    pub fn kind(&self) -> ProbeKind {
        match self {
            Probe::Icmp(_) => ProbeKind::Icmp,
            Probe::Tcp(_) => ProbeKind::Tcp,
        }
    }

    /// Run one burst. Cancellation happens by dropping the returned
    /// future (the collector races it against the round deadline).
    pub async fn execute(&self) -> BurstResult {
        match self {
            Probe::Icmp(p) => p.execute().await,
            Probe::Tcp(p) => p.execute().await,
        }
    }
}

/// Common probe parameters, shared by both variants.
pub struct ProbeSpec {
    pub name: String,
    pub host: String,
    pub timeout: Duration,
    pub pings: u32,
}

impl ProbeSpec {
    pub fn new(name: &str, host: &str, timeout: Duration, pings: u32) -> Self {
        ProbeSpec {
            name: name.to_string(),
            host: host.to_string(),
            timeout,
            pings: pings.max(1),
        }
    }

    /// Condense a finished burst into a result.
    ///
    /// With zero replies the burst is a total loss: `success = false`,
    /// `latency_ms = -1`, `loss_pct = 100` and all latency statistics
    /// zero. Otherwise `latency_ms` is the median of the collected RTTs
    /// (SmokePing reports median, not average).
    pub fn burst_result(&self, stats: BurstStats, error: Option<String>) -> BurstResult {
        let loss_pct = if stats.sent > 0 {
            (stats.sent - stats.recv) as f64 / stats.sent as f64 * 100.0
        } else {
            100.0
        };

        if stats.recv == 0 {
            return BurstResult {
                target: self.name.clone(),
                timestamp: Utc::now(),
                latency_ms: -1.0,
                success: false,
                error: Some(error.unwrap_or_else(|| "packet loss: no response".to_string())),
                min_ms: 0.0,
                max_ms: 0.0,
                avg_ms: 0.0,
                median_ms: 0.0,
                jitter_ms: 0.0,
                loss_pct,
                pings_sent: stats.sent,
                pings_recv: stats.recv,
            };
        }

        let rtts_ms: Vec<f64> = stats.rtts.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        let median = median_ms(&rtts_ms);
        let min = rtts_ms.iter().copied().fold(f64::INFINITY, f64::min);
        let max = rtts_ms.iter().copied().fold(0.0f64, f64::max);
        let avg = rtts_ms.iter().sum::<f64>() / rtts_ms.len() as f64;
        let jitter = if rtts_ms.len() > 1 {
            let sum_squares: f64 = rtts_ms.iter().map(|v| (v - avg) * (v - avg)).sum();
            (sum_squares / rtts_ms.len() as f64).sqrt()
        } else {
            0.0
        };

        BurstResult {
            target: self.name.clone(),
            timestamp: Utc::now(),
            latency_ms: median,
            success: true,
            error: None,
            min_ms: min,
            max_ms: max,
            avg_ms: avg,
            median_ms: median,
            jitter_ms: jitter,
            loss_pct,
            pings_sent: stats.sent,
            pings_recv: stats.recv,
        }
    }

    /// Result for a burst that never got off the ground (construction or
    /// unrecoverable send failure). The intended ping count is reported
    /// as sent so loss accounting stays consistent.
    pub fn failure_result(&self, error: impl Into<String>) -> BurstResult {
        self.burst_result(
            BurstStats {
                rtts: Vec::new(),
                sent: self.pings,
                recv: 0,
            },
            Some(error.into()),
        )
    }
}

/// Raw material collected by one burst.
pub struct BurstStats {
    /// Round-trip times of the replies that arrived
    pub rtts: Vec<Duration>,
    /// Pings actually sent
    pub sent: u32,
    /// Replies received; `rtts.len()` as u32
    pub recv: u32,
}

/// Median of a set of millisecond latencies.
///
/// Odd count: middle element. Even count: mean of the two middle
/// elements. Empty: 0 (the caller marks the burst as loss).
pub fn median_ms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Resolve a host to an IP address, trying a literal parse before DNS.
pub async fn resolve_host(host: &str) -> Result<IpAddr, String> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs = tokio::net::lookup_host(format!("{}:0", host))
        .await
        .map_err(|e| format!("DNS resolution failed for {}: {}", host, e))?;
    addrs
        .into_iter()
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| format!("DNS resolution returned no addresses for: {}", host))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ProbeSpec {
        ProbeSpec::new("test", "127.0.0.1", Duration::from_secs(5), 4)
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median_ms(&[30.0, 10.0, 20.0]), 20.0);
        assert_eq!(median_ms(&[10.0, 20.0, 30.0, 40.0]), 25.0);
        assert_eq!(median_ms(&[42.0]), 42.0);
        assert_eq!(median_ms(&[]), 0.0);
    }

    #[test]
    fn test_burst_result_success() {
        let stats = BurstStats {
            rtts: vec![
                Duration::from_millis(30),
                Duration::from_millis(10),
                Duration::from_millis(20),
            ],
            sent: 4,
            recv: 3,
        };
        let result = spec().burst_result(stats, None);

        assert!(result.success);
        assert_eq!(result.pings_sent, 4);
        assert_eq!(result.pings_recv, 3);
        assert_eq!(result.latency_ms, 20.0);
        assert_eq!(result.median_ms, 20.0);
        assert_eq!(result.min_ms, 10.0);
        assert_eq!(result.max_ms, 30.0);
        assert_eq!(result.avg_ms, 20.0);
        assert_eq!(result.loss_pct, 25.0);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_burst_result_total_loss() {
        let stats = BurstStats {
            rtts: Vec::new(),
            sent: 4,
            recv: 0,
        };
        let result = spec().burst_result(stats, None);

        assert!(!result.success);
        assert_eq!(result.latency_ms, -1.0);
        assert_eq!(result.loss_pct, 100.0);
        assert_eq!(result.min_ms, 0.0);
        assert_eq!(result.max_ms, 0.0);
        assert_eq!(result.avg_ms, 0.0);
        assert_eq!(result.jitter_ms, 0.0);
        assert_eq!(result.error.as_deref(), Some("packet loss: no response"));
    }

    #[test]
    fn test_burst_result_zero_sent_is_full_loss() {
        let stats = BurstStats {
            rtts: Vec::new(),
            sent: 0,
            recv: 0,
        };
        let result = spec().burst_result(stats, Some("socket gone".to_string()));

        assert!(!result.success);
        assert_eq!(result.loss_pct, 100.0);
        assert_eq!(result.error.as_deref(), Some("socket gone"));
    }

    #[test]
    fn test_failure_result_reports_intended_pings() {
        let result = spec().failure_result("failed to create socket");

        assert!(!result.success);
        assert_eq!(result.pings_sent, 4);
        assert_eq!(result.pings_recv, 0);
        assert_eq!(result.latency_ms, -1.0);
        assert_eq!(result.loss_pct, 100.0);
        assert_eq!(result.error.as_deref(), Some("failed to create socket"));
    }

    #[tokio::test]
    async fn test_resolve_host_literal() {
        assert_eq!(
            resolve_host("127.0.0.1").await.unwrap(),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            resolve_host("::1").await.unwrap(),
            "::1".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_resolve_host_failure() {
        let err = resolve_host("definitely-not-a-real-host.invalid")
            .await
            .unwrap_err();
        assert!(err.contains("DNS resolution"), "{err}");
    }
}
