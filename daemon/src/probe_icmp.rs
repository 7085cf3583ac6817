//! ICMP echo burst probe
//!
//! Sends a burst of echo requests over a native ICMP socket, spaced about
//! 50 ms apart, and records each reply's round-trip time. A privileged
//! RAW socket is attempted first; when the platform refuses it the same
//! burst is retried once on an unprivileged DGRAM socket and the probe
//! remembers the fallback for all later bursts.
//!
//! The burst itself runs on a blocking thread: socket reads with real
//! read timeouts give sub-millisecond timing that async wakeups cannot.

use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use shared::metrics::BurstResult;

use crate::probe::{BurstStats, ProbeSpec};

/// Spacing between outgoing pings within a burst. SmokePing/fping use
/// 10-50 ms; the default 1 s ping cadence is far too slow for bursts.
const PING_SPACING: Duration = Duration::from_millis(50);

/// Minimum reply-collection window per ping
const PER_PING_WINDOW: Duration = Duration::from_millis(250);

/// ICMP probe for one target
pub struct IcmpProbe {
    pub(crate) spec: ProbeSpec,
    /// Set once a RAW socket was refused; later bursts go straight to
    /// DGRAM mode
    unprivileged: AtomicBool,
}

/// Socket flavor for a burst
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketMode {
    Raw,
    Datagram,
}

/// Burst-level failure, split so the caller can react to permission
/// errors with the DGRAM retry
enum BurstError {
    Permission(String),
    Socket(String),
}

impl BurstError {
    fn message(self) -> String {
        match self {
            BurstError::Permission(m) | BurstError::Socket(m) => m,
        }
    }
}

impl IcmpProbe {
    pub fn new(spec: ProbeSpec) -> Self {
        IcmpProbe {
            spec,
            unprivileged: AtomicBool::new(false),
        }
    }

    /// Run one echo burst against the target.
    pub async fn execute(&self) -> BurstResult {
        let ip = match crate::probe::resolve_host(&self.spec.host).await {
            Ok(ip) => ip,
            Err(e) => return self.spec.failure_result(e),
        };

        // Overall burst budget: at least 250 ms per ping, more when the
        // configured timeout allows it.
        let pings = self.spec.pings;
        let burst_timeout = std::cmp::max(PER_PING_WINDOW * pings, self.spec.timeout);

        let mode = if self.unprivileged.load(Ordering::Relaxed) {
            SocketMode::Datagram
        } else {
            SocketMode::Raw
        };

        match run_burst(ip, pings, burst_timeout, mode).await {
            Ok(stats) => self.spec.burst_result(stats, None),
            Err(BurstError::Permission(first_err)) if mode == SocketMode::Raw => {
                // Remember the fallback so later bursts skip the refused
                // RAW attempt entirely.
                self.unprivileged.store(true, Ordering::Relaxed);
                debug!(
                    target_name = %self.spec.name,
                    "raw ICMP socket refused ({}), retrying burst unprivileged",
                    first_err
                );

                match run_burst(ip, pings, burst_timeout, SocketMode::Datagram).await {
                    Ok(stats) => self.spec.burst_result(stats, None),
                    Err(e) => {
                        let msg = permission_hint(e.message());
                        warn!(target_name = %self.spec.name, "ICMP burst failed: {}", msg);
                        self.spec.failure_result(msg)
                    }
                }
            }
            Err(e) => self.spec.failure_result(format!("ping failed: {}", e.message())),
        }
    }
}

/// Append guidance for the common unprivileged-ICMP setup problems.
fn permission_hint(error: String) -> String {
    if error.contains("not permitted") || error.contains("denied") {
        format!(
            "{}. Hint: on Linux, widen net.ipv4.ping_group_range or grant \
             cap_net_raw to the daemon binary",
            error
        )
    } else {
        error
    }
}

/// Run the burst on a blocking thread.
async fn run_burst(
    ip: IpAddr,
    pings: u32,
    burst_timeout: Duration,
    mode: SocketMode,
) -> Result<BurstStats, BurstError> {
    tokio::task::spawn_blocking(move || run_burst_blocking(ip, pings, burst_timeout, mode))
        .await
        .map_err(|e| BurstError::Socket(format!("ping task failed: {}", e)))?
}

fn run_burst_blocking(
    ip: IpAddr,
    pings: u32,
    burst_timeout: Duration,
    mode: SocketMode,
) -> Result<BurstStats, BurstError> {
    let socket = open_socket(ip, mode)?;
    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| classify(e, "failed to connect ICMP socket"))?;

    // Per-ping reply window: the burst budget split evenly, never below
    // the 250 ms floor (the budget construction guarantees the floor).
    let window = burst_timeout / pings;
    let identifier: u16 = rand::random();
    let deadline = Instant::now() + burst_timeout;

    let mut stats = BurstStats {
        rtts: Vec::with_capacity(pings as usize),
        sent: 0,
        recv: 0,
    };

    for seq in 0..pings as u16 {
        if Instant::now() >= deadline {
            break;
        }

        let packet = match ip {
            IpAddr::V4(_) => build_echo_request_v4(identifier, seq),
            IpAddr::V6(_) => build_echo_request_v6(identifier, seq),
        };

        stats.sent += 1;
        let send_time = Instant::now();
        if let Err(e) = socket.send(&packet) {
            if e.kind() == ErrorKind::PermissionDenied {
                return Err(BurstError::Permission(format!("send not permitted: {}", e)));
            }
            // Transient send failure: this ping counts as lost
            continue;
        }

        let window_deadline = std::cmp::min(send_time + window, deadline);
        if let Some(rtt) = await_reply(&socket, ip, identifier, seq, send_time, window_deadline) {
            stats.rtts.push(rtt);
            stats.recv += 1;
        }

        // Keep outgoing pings ~50 ms apart regardless of how fast the
        // reply came back
        if u32::from(seq) + 1 < pings {
            let since_send = send_time.elapsed();
            if since_send < PING_SPACING {
                std::thread::sleep(PING_SPACING - since_send);
            }
        }
    }

    Ok(stats)
}

fn open_socket(ip: IpAddr, mode: SocketMode) -> Result<Socket, BurstError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    let ty = match mode {
        SocketMode::Raw => Type::RAW,
        SocketMode::Datagram => Type::DGRAM,
    };

    let socket =
        Socket::new(domain, ty, Some(protocol)).map_err(|e| classify(e, "failed to create ICMP socket"))?;
    if ip.is_ipv4() {
        // Best effort; some platforms refuse TTL on ICMP sockets
        let _ = socket.set_ttl(255);
    }
    Ok(socket)
}

fn classify(e: std::io::Error, context: &str) -> BurstError {
    if e.kind() == ErrorKind::PermissionDenied {
        BurstError::Permission(format!("{}: {}", context, e))
    } else {
        BurstError::Socket(format!("{}: {}", context, e))
    }
}

/// Wait for the echo reply matching (identifier, seq), discarding other
/// traffic on the socket. Returns the round-trip time, or None when the
/// window expired.
fn await_reply(
    socket: &Socket,
    ip: IpAddr,
    identifier: u16,
    seq: u16,
    send_time: Instant,
    window_deadline: Instant,
) -> Option<Duration> {
    loop {
        let remaining = window_deadline.checked_duration_since(Instant::now())?;
        if socket.set_read_timeout(Some(remaining)).is_err() {
            return None;
        }

        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return None;
            }
            Err(_) => return None,
        };
        let elapsed = send_time.elapsed();

        // SAFETY: recv initialized `len` bytes
        let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        if matches_reply(ip, data, identifier, seq) {
            return Some(elapsed);
        }
        // Someone else's packet; keep waiting out the window
    }
}

/// Check whether a received datagram is our echo reply.
///
/// RAW IPv4 sockets deliver the IP header in front of the ICMP message;
/// DGRAM sockets and IPv6 deliver the ICMP message directly.
fn matches_reply(ip: IpAddr, data: &[u8], identifier: u16, seq: u16) -> bool {
    let (offset, reply_type) = match ip {
        IpAddr::V4(_) => {
            let offset = if !data.is_empty() && data[0] >> 4 == 4 { 20 } else { 0 };
            (offset, 0u8) // ICMP Echo Reply
        }
        IpAddr::V6(_) => (0, 129u8), // ICMPv6 Echo Reply
    };

    if data.len() < offset + 8 {
        return false;
    }
    let reply_id = u16::from_be_bytes([data[offset + 4], data[offset + 5]]);
    let reply_seq = u16::from_be_bytes([data[offset + 6], data[offset + 7]]);

    data[offset] == reply_type && reply_id == identifier && reply_seq == seq
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_echo_request_v4(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = 8; // Type: Echo Request
    packet[1] = 0; // Code
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0). The kernel
/// fills in the ICMPv6 checksum.
fn build_echo_request_v6(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = 128; // Type: Echo Request
    packet[1] = 0; // Code
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    packet
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i + 1 < data.len() {
        sum += u32::from(u16::from_be_bytes([data[i], data[i + 1]]));
        i += 2;
    }
    if i < data.len() {
        sum += u32::from(data[i]) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_build_echo_request_v4() {
        let packet = build_echo_request_v4(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(&packet[6..8], &[0x00, 0x01]);
        // Checksum field filled in
        assert!(packet[2] != 0 || packet[3] != 0);
    }

    #[test]
    fn test_checksum_verifies_to_zero() {
        // A packet with a correct checksum sums to 0xFFFF before the
        // final complement, so checksumming it again must yield zero.
        let packet = build_echo_request_v4(0xBEEF, 7);
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        let data = [8u8, 0, 0, 0, 0x12, 0x34, 0x00, 0x01, 0xAB];
        // Must not panic and must produce a stable value
        assert_eq!(icmp_checksum(&data), icmp_checksum(&data));
    }

    #[test]
    fn test_matches_reply_dgram_v4() {
        // DGRAM delivery: ICMP header first, echo reply type 0
        let mut reply = build_echo_request_v4(0x1234, 3);
        reply[0] = 0;
        assert!(matches_reply("127.0.0.1".parse().unwrap(), &reply, 0x1234, 3));
        assert!(!matches_reply("127.0.0.1".parse().unwrap(), &reply, 0x1234, 4));
        assert!(!matches_reply("127.0.0.1".parse().unwrap(), &reply, 0x9999, 3));
    }

    #[test]
    fn test_matches_reply_raw_v4_skips_ip_header() {
        let mut inner = build_echo_request_v4(0x4242, 9);
        inner[0] = 0; // Echo Reply
        let mut datagram = vec![0u8; 20];
        datagram[0] = 0x45; // IPv4, 20-byte header
        datagram.extend_from_slice(&inner);

        assert!(matches_reply(
            "127.0.0.1".parse().unwrap(),
            &datagram,
            0x4242,
            9
        ));
    }

    #[test]
    fn test_matches_reply_v6() {
        let mut reply = build_echo_request_v6(0x0101, 2);
        reply[0] = 129;
        assert!(matches_reply("::1".parse().unwrap(), &reply, 0x0101, 2));
        // Echo request (128) must not match
        reply[0] = 128;
        assert!(!matches_reply("::1".parse().unwrap(), &reply, 0x0101, 2));
    }

    #[test]
    fn test_truncated_reply_rejected() {
        assert!(!matches_reply("127.0.0.1".parse().unwrap(), &[0u8; 4], 1, 1));
        assert!(!matches_reply("::1".parse().unwrap(), &[], 1, 1));
    }

    #[tokio::test]
    async fn test_execute_unresolvable_host_is_loss() {
        let probe = IcmpProbe::new(ProbeSpec::new(
            "bad",
            "definitely-not-a-real-host.invalid",
            Duration::from_secs(1),
            3,
        ));
        let result = probe.execute().await;

        assert!(!result.success);
        assert_eq!(result.latency_ms, -1.0);
        assert_eq!(result.loss_pct, 100.0);
        assert_eq!(result.pings_sent, 3);
        assert!(result.error.unwrap().contains("DNS resolution"));
    }
}
