//! Probe collector and scheduler
//!
//! The collector owns one probe per configured target and drives them in
//! rounds: every target is probed in parallel within a tick, each burst
//! under the global timeout. Results flow, in order, into the ring
//! buffer, the archive, the subscriber fanout and the structured log;
//! every step is best-effort so one failing sink never starves the
//! others. Rounds run sequentially — the driver waits for a round to
//! finish before honoring the next tick, and a tick that fires mid-round
//! is skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use shared::config::Config;
use shared::metrics::{BurstResult, DataPoint, Stats};
use shared::Target;

use crate::fanout::{Fanout, Subscription};
use crate::probe::Probe;
use crate::storage::{MemoryBuffer, RrdStorage};

/// Pause before the first round so freshly created raw sockets settle
const STARTUP_SETTLE: Duration = Duration::from_millis(100);

/// Owns the probe set, both storage tiers and the subscriber fanout.
pub struct Collector {
    config: Arc<Config>,
    probes: Arc<HashMap<String, Arc<Probe>>>,
    memory: Arc<MemoryBuffer>,
    archive: Option<Arc<RrdStorage>>,
    fanout: Fanout<BurstResult>,
    shutdown: broadcast::Sender<()>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Collector {
    /// Bind configuration and storage; probes are created here, one per
    /// target, and live for the collector's lifetime.
    pub fn new(
        config: Arc<Config>,
        memory: Arc<MemoryBuffer>,
        archive: Option<Arc<RrdStorage>>,
    ) -> Self {
        let mut probes = HashMap::new();
        for target in &config.targets {
            let probe = Probe::for_target(target, config.global.timeout, config.global.pings);
            info!(
                target_name = %probe.name(),
                host = %target.host,
                probe = ?probe.kind(),
                pings = config.global.pings,
                "created probe"
            );
            probes.insert(target.name.clone(), Arc::new(probe));
        }

        let (shutdown, _) = broadcast::channel(1);

        Collector {
            config,
            probes: Arc::new(probes),
            memory,
            archive,
            fanout: Fanout::new(),
            shutdown,
            driver: Mutex::new(None),
        }
    }

    /// Start collecting: one immediate round after a short settle pause,
    /// then a round per interval tick.
    pub async fn start(&self) {
        info!(
            interval = ?self.config.global.interval,
            targets = self.probes.len(),
            "starting collection"
        );

        let probes = Arc::clone(&self.probes);
        let memory = Arc::clone(&self.memory);
        let archive = self.archive.clone();
        let fanout = self.fanout.clone();
        let timeout = self.config.global.timeout;
        let interval = self.config.global.interval;
        let mut shutdown_rx = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(STARTUP_SETTLE).await;
            run_round(&probes, &memory, &archive, &fanout, timeout).await;

            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            // A tick that fires while a round is still running is
            // skipped; the next round starts at the next boundary
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("stopping collection");
                        return;
                    }
                    _ = ticker.tick() => {
                        run_round(&probes, &memory, &archive, &fanout, timeout).await;
                    }
                }
            }
        });

        *self.driver.lock().await = Some(handle);
    }

    /// Stop the driver, wait for the in-flight round, close all
    /// subscriber queues and release the archive.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());

        if let Some(handle) = self.driver.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("collector driver ended abnormally: {}", e);
            }
        }

        debug!(
            subscribers = self.fanout.subscriber_count(),
            "closing subscriber queues"
        );
        self.fanout.close_all();
        if let Some(archive) = &self.archive {
            archive.close();
        }
        info!("collector stopped");
    }

    /// Register a live-results subscriber.
    pub fn subscribe(&self) -> Subscription<BurstResult> {
        self.fanout.subscribe()
    }

    pub fn get_stats(&self, target: &str) -> Stats {
        self.memory.get_stats(target)
    }

    pub fn get_all_stats(&self) -> HashMap<String, Stats> {
        self.memory.get_all_stats()
    }

    /// Recent latency values for sparkline-style consumers. Part of the
    /// collector's read contract; the IPC surface serves archive history
    /// instead.
    #[allow(dead_code)]
    pub fn get_history(&self, target: &str, count: usize) -> Vec<f64> {
        self.memory.get_history(target, count)
    }

    pub fn get_targets(&self) -> Vec<Target> {
        self.config.targets.clone()
    }

    /// Archived data points for a target over `[from, to]`.
    pub fn fetch_history(
        &self,
        target: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> shared::Result<Vec<DataPoint>> {
        match &self.archive {
            Some(archive) => archive.fetch(target, from, to),
            None => Ok(Vec::new()),
        }
    }
}

/// Probe every target in parallel and process results as they land.
async fn run_round(
    probes: &Arc<HashMap<String, Arc<Probe>>>,
    memory: &Arc<MemoryBuffer>,
    archive: &Option<Arc<RrdStorage>>,
    fanout: &Fanout<BurstResult>,
    timeout: Duration,
) {
    let mut round = JoinSet::new();
    for probe in probes.values() {
        let probe = Arc::clone(probe);
        round.spawn(async move {
            match tokio::time::timeout(timeout, probe.execute()).await {
                Ok(result) => result,
                // The burst future is dropped here, which cancels any
                // in-flight dial or reply wait
                Err(_) => {
                    warn!(target_name = %probe.name(), "probe exceeded the round deadline");
                    probe.timeout_result(timeout)
                }
            }
        });
    }

    while let Some(joined) = round.join_next().await {
        match joined {
            Ok(result) => handle_result(memory, archive, fanout, result),
            Err(e) => warn!("probe task failed: {}", e),
        }
    }
}

/// Fan a finished burst out to both storage tiers, the subscribers and
/// the log. Each step is independent; failures are logged and dropped.
fn handle_result(
    memory: &Arc<MemoryBuffer>,
    archive: &Option<Arc<RrdStorage>>,
    fanout: &Fanout<BurstResult>,
    result: BurstResult,
) {
    memory.write(&result.target, result.timestamp, result.latency_ms);

    if let Some(archive) = archive {
        if let Err(e) = archive.write(
            &result.target,
            result.timestamp,
            result.latency_ms,
            !result.success,
        ) {
            warn!(target_name = %result.target, "archive write failed: {}", e);
        }
    }

    fanout.broadcast(&result);

    if result.success {
        info!(
            target_name = %result.target,
            latency_ms = result.latency_ms,
            loss_pct = result.loss_pct,
            success = true,
            "probe result"
        );
    } else {
        info!(
            target_name = %result.target,
            latency_ms = result.latency_ms,
            success = false,
            error = result.error.as_deref().unwrap_or("unknown"),
            "probe result"
        );
    }
}

impl Probe {
    /// Result for a burst cut off by the round deadline.
    pub fn timeout_result(&self, timeout: Duration) -> BurstResult {
        let spec = match self {
            Probe::Icmp(p) => &p.spec,
            Probe::Tcp(p) => &p.spec,
        };
        spec.failure_result(format!("probe timed out after {:?}", timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::config::ProbeKind;

    fn test_config(targets: Vec<Target>) -> Arc<Config> {
        Arc::new(Config {
            server: Default::default(),
            global: shared::config::GlobalConfig {
                interval: Duration::from_secs(1),
                timeout: Duration::from_millis(500),
                pings: 2,
                data_dir: None,
            },
            storage: Default::default(),
            targets,
        })
    }

    #[test]
    fn test_probes_created_per_target() {
        let config = test_config(vec![
            Target {
                name: "DNS".to_string(),
                host: "8.8.8.8".to_string(),
                port: None,
                probe: ProbeKind::Icmp,
            },
            Target {
                name: "Web".to_string(),
                host: "example.com".to_string(),
                port: Some(443),
                probe: ProbeKind::Tcp,
            },
        ]);

        let collector = Collector::new(config, Arc::new(MemoryBuffer::default()), None);
        assert_eq!(collector.probes.len(), 2);
        assert_eq!(collector.probes["DNS"].kind(), ProbeKind::Icmp);
        assert_eq!(collector.probes["Web"].kind(), ProbeKind::Tcp);
        assert_eq!(collector.get_targets().len(), 2);
    }

    #[test]
    fn test_timeout_result_shape() {
        let config = test_config(vec![Target {
            name: "Web".to_string(),
            host: "example.com".to_string(),
            port: Some(443),
            probe: ProbeKind::Tcp,
        }]);
        let collector = Collector::new(config, Arc::new(MemoryBuffer::default()), None);

        let result = collector.probes["Web"].timeout_result(Duration::from_millis(500));
        assert!(!result.success);
        assert_eq!(result.latency_ms, -1.0);
        assert_eq!(result.pings_sent, 2);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_fetch_history_without_archive_is_empty() {
        let config = test_config(vec![Target {
            name: "Web".to_string(),
            host: "example.com".to_string(),
            port: Some(443),
            probe: ProbeKind::Tcp,
        }]);
        let collector = Collector::new(config, Arc::new(MemoryBuffer::default()), None);

        let points = collector
            .fetch_history("Web", Utc::now(), Utc::now())
            .unwrap();
        assert!(points.is_empty());
    }
}
