//! TCP connect burst probe
//!
//! Measures pure TCP connection establishment time without any protocol
//! overhead: connect, record the elapsed time, close immediately. A
//! failed or timed-out connect counts as a lost packet. Ten milliseconds
//! of spacing between connects keeps bursts from hammering the target.
//!
//! Cancellation is by future drop: when the collector's round deadline
//! fires the in-flight connect is abandoned and no further dials are
//! issued.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use shared::metrics::BurstResult;

use crate::probe::{BurstStats, ProbeSpec};

/// Pause between consecutive connects in a burst
const CONNECT_SPACING: Duration = Duration::from_millis(10);

/// TCP probe for one target
pub struct TcpProbe {
    pub(crate) spec: ProbeSpec,
    port: u16,
}

impl TcpProbe {
    pub fn new(spec: ProbeSpec, port: u16) -> Self {
        TcpProbe { spec, port }
    }

    /// Per-connect timeout: the burst budget divided among the pings,
    /// but never below one second.
    fn per_ping_timeout(&self) -> Duration {
        std::cmp::max(self.spec.timeout / self.spec.pings, Duration::from_secs(1))
    }

    /// Run one connect burst against the target.
    pub async fn execute(&self) -> BurstResult {
        let ip = match crate::probe::resolve_host(&self.spec.host).await {
            Ok(ip) => ip,
            Err(e) => return self.spec.failure_result(e),
        };
        let addr = SocketAddr::new(ip, self.port);
        let per_ping = self.per_ping_timeout();

        let mut stats = BurstStats {
            rtts: Vec::with_capacity(self.spec.pings as usize),
            sent: 0,
            recv: 0,
        };

        for i in 0..self.spec.pings {
            stats.sent += 1;
            let start = Instant::now();

            match timeout(per_ping, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let elapsed = start.elapsed();
                    // Close right away; the handshake is the measurement
                    drop(stream);
                    stats.rtts.push(elapsed);
                    stats.recv += 1;
                }
                Ok(Err(e)) => {
                    debug!(target_name = %self.spec.name, "connect failed: {}", e);
                }
                Err(_) => {
                    debug!(
                        target_name = %self.spec.name,
                        "connect timed out after {:?}", per_ping
                    );
                }
            }

            if i + 1 < self.spec.pings {
                tokio::time::sleep(CONNECT_SPACING).await;
            }
        }

        self.spec.burst_result(stats, None)
    }
}
