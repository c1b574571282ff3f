//! Ping collector with native ICMP and command fallback.
//!
//! Native echo series run on blocking sockets inside `spawn_blocking` for
//! sub-millisecond timing precision. When neither RAW nor DGRAM ICMP sockets
//! can be opened the system `ping` binary is used instead and its summary is
//! parsed.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{collection_error, fan_out, Collector};
use crate::config::{resolve_thresholds, GlobalMonitorConfig, PingMonitorConfig};
use crate::model::{monitor_id, AgentIdentity, ErrorType, MonitorType, ProbeResult, Thresholds};

/// Pause between echo requests of one native series.
const PACKET_INTERVAL: Duration = Duration::from_millis(100);
/// Slack added on top of `timeout * packet_count` for the whole probe.
const PROBE_SLACK: Duration = Duration::from_secs(2);

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Generate a unique identifier for each echo series.
fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW or root
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping collector: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // DGRAM works unprivileged on Linux with ping_group_range set, and on macOS
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping collector: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping collector: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// One resolved ping target.
#[derive(Debug, Clone)]
pub struct PingProbeTarget {
    pub id: String,
    pub name: String,
    pub host: String,
    pub packet_count: u32,
    /// Per-packet reply timeout.
    pub timeout: Duration,
    pub thresholds: Thresholds,
}

impl PingProbeTarget {
    /// Time a full native series may take: every reply wait plus the gaps
    /// between packets.
    pub fn series_budget(&self) -> Duration {
        self.timeout * self.packet_count + PACKET_INTERVAL * self.packet_count.saturating_sub(1)
    }

    /// Upper bound for the whole probe.
    pub fn probe_bound(&self) -> Duration {
        self.series_budget() + PROBE_SLACK
    }
}

pub struct PingCollector {
    enabled: bool,
    interval: Duration,
    targets: Vec<PingProbeTarget>,
    identity: Arc<AgentIdentity>,
}

impl PingCollector {
    pub fn new(config: &PingMonitorConfig, global: &GlobalMonitorConfig, identity: Arc<AgentIdentity>) -> Self {
        let defaults = &config.defaults;
        let targets = config
            .targets
            .iter()
            .map(|t| PingProbeTarget {
                id: monitor_id("ping", &t.name),
                name: t.name.clone(),
                host: t.host.clone(),
                packet_count: t.packet_count.unwrap_or(defaults.packet_count).max(1),
                timeout: Duration::from_secs(t.timeout_seconds.unwrap_or(defaults.timeout_seconds).max(1)),
                thresholds: resolve_thresholds(t.thresholds, defaults.thresholds, global.response_time_thresholds),
            })
            .collect();

        Self {
            enabled: config.enabled,
            interval: defaults.interval(),
            targets,
            identity,
        }
    }
}

#[async_trait]
impl Collector for PingCollector {
    fn name(&self) -> &str {
        "ping"
    }

    fn monitor_type(&self) -> MonitorType {
        MonitorType::Ping
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn target_count(&self) -> usize {
        self.targets.len()
    }

    async fn collect(&self) -> Vec<ProbeResult> {
        let identity = self.identity.clone();
        fan_out(
            &self.targets,
            move |target| {
                let identity = identity.clone();
                async move { probe_ping(&identity, &target).await }
            },
            |target, message| collection_error(base_result(&self.identity, target), message),
        )
        .await
    }
}

fn base_result(identity: &AgentIdentity, target: &PingProbeTarget) -> ProbeResult {
    ProbeResult::begin(identity, MonitorType::Ping, target.id.clone(), &target.name, &target.host)
        .with_thresholds(target.thresholds)
}

/// Summary of one echo series.
#[derive(Debug, Clone, PartialEq)]
pub struct PingStats {
    pub transmitted: u32,
    pub received: u32,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub jitter_ms: f64,
}

impl PingStats {
    /// Build from the round trip times of the replies that came back.
    /// Jitter is the mean absolute difference between consecutive RTTs.
    pub fn from_rtts(transmitted: u32, rtts: &[f64]) -> Self {
        let received = rtts.len() as u32;
        if rtts.is_empty() {
            return Self {
                transmitted,
                received,
                min_ms: 0.0,
                avg_ms: 0.0,
                max_ms: 0.0,
                jitter_ms: 0.0,
            };
        }

        let min_ms = rtts.iter().copied().fold(f64::INFINITY, f64::min);
        let max_ms = rtts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg_ms = rtts.iter().sum::<f64>() / rtts.len() as f64;
        let jitter_ms = if rtts.len() < 2 {
            0.0
        } else {
            rtts.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>() / (rtts.len() - 1) as f64
        };

        Self {
            transmitted,
            received,
            min_ms,
            avg_ms,
            max_ms,
            jitter_ms,
        }
    }

    /// Lost share in percent, rounded to two decimals.
    pub fn packet_loss(&self) -> f64 {
        if self.transmitted == 0 {
            return 100.0;
        }
        let lost = self.transmitted.saturating_sub(self.received) as f64;
        (lost / self.transmitted as f64 * 10_000.0).round() / 100.0
    }
}

#[derive(Debug)]
enum PingFailure {
    Permission(String),
    Resolve(String),
    Unreachable(String),
    Failed(String),
}

impl PingFailure {
    fn from_io(context: &str, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied => PingFailure::Permission(format!("{}: {}", context, e)),
            io::ErrorKind::NetworkUnreachable => PingFailure::Unreachable(format!("{}: {}", context, e)),
            _ => PingFailure::Failed(format!("{}: {}", context, e)),
        }
    }
}

/// Probe one target.
pub async fn probe_ping(identity: &AgentIdentity, target: &PingProbeTarget) -> ProbeResult {
    let mut result = base_result(identity, target);
    let start = Instant::now();

    let bound = target.probe_bound();
    let outcome = tokio::time::timeout(bound, run_series(target)).await;
    result.response_time = start.elapsed().as_millis() as u64;

    let (stats, method) = match outcome {
        Ok(Ok(done)) => done,
        Ok(Err(PingFailure::Resolve(message))) => return result.fail(ErrorType::DnsError, message),
        Ok(Err(PingFailure::Unreachable(message))) => {
            return result.fail(ErrorType::NetworkUnreachable, message)
        }
        Ok(Err(PingFailure::Permission(message))) | Ok(Err(PingFailure::Failed(message))) => {
            return result.fail(ErrorType::PingError, message)
        }
        Err(_) => {
            return result.fail(ErrorType::Timeout, format!("Ping timeout after {}ms", bound.as_millis()))
        }
    };

    result.packet_loss = Some(stats.packet_loss());
    result.raw_network_data = Some(serde_json::json!({
        "method": method,
        "packetCount": target.packet_count,
        "packetsTransmitted": stats.transmitted,
        "packetsReceived": stats.received,
        "minTimeMs": stats.min_ms,
        "avgTimeMs": stats.avg_ms,
        "maxTimeMs": stats.max_ms,
    }));

    if stats.received == 0 {
        return result.fail(ErrorType::TotalPacketLoss, "100% packet loss");
    }

    result.jitter_ms = Some(stats.jitter_ms);
    result.response_time = stats.avg_ms.round() as u64;
    result.succeed()
}

async fn run_series(target: &PingProbeTarget) -> Result<(PingStats, &'static str), PingFailure> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        // Resolve before spawn_blocking (DNS is async)
        let ip = resolve_address(&target.host).await?;
        let (count, timeout) = (target.packet_count, target.timeout);
        let deadline = Instant::now() + target.series_budget();

        let series = tokio::task::spawn_blocking(move || run_blocking_series(ip, count, timeout, deadline))
            .await
            .map_err(|e| PingFailure::Failed(format!("spawn_blocking failed: {}", e)))?;

        match series {
            Ok(stats) => return Ok((stats, "icmp")),
            Err(PingFailure::Permission(reason)) => {
                tracing::warn!(
                    host = %target.host,
                    error = %reason,
                    "Native ping not permitted, falling back to command"
                );
            }
            Err(other) => return Err(other),
        }
    }

    let stats = run_ping_command(&target.host, target.packet_count, target.timeout).await?;
    Ok((stats, "command"))
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, PingFailure> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((address, 0))
        .await
        .map_err(|e| PingFailure::Resolve(format!("Host not found: {} ({})", address, e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| PingFailure::Resolve(format!("Host not found: {}", address)))
}

/// Send `count` echo requests over one socket and collect the RTTs in ms.
/// This runs in a dedicated thread via spawn_blocking and gives up at
/// `deadline`; packets not sent by then count as lost.
fn run_blocking_series(
    ip: IpAddr,
    count: u32,
    timeout: Duration,
    deadline: Instant,
) -> Result<PingStats, PingFailure> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 8u8, 0u8),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 128u8, 129u8),
    };

    // Try RAW first (privileged), then DGRAM (unprivileged)
    let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(socket) => (socket, true),
        Err(_) => Socket::new(domain, Type::DGRAM, Some(protocol))
            .map(|s| (s, false))
            .map_err(|e| PingFailure::from_io("Failed to create ICMP socket", e))?,
    };

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| PingFailure::from_io("Failed to set timeout", e))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| PingFailure::from_io("Failed to connect", e))?;

    let (identifier, first_sequence) = generate_ping_id();
    let mut rtts = Vec::with_capacity(count as usize);

    for i in 0..count {
        if i > 0 {
            std::thread::sleep(PACKET_INTERVAL);
        }
        let Some(wait) = packet_wait(timeout, deadline) else {
            break;
        };

        let sequence = first_sequence.wrapping_add(i as u16);
        let packet = build_echo_request(request_type, identifier, sequence, ip.is_ipv4());

        let start = Instant::now();
        socket
            .send(&packet)
            .map_err(|e| PingFailure::from_io("Failed to send", e))?;

        if let Some(rtt) = await_reply(&socket, start, wait, reply_type, identifier, sequence, raw && ip.is_ipv4())? {
            rtts.push(rtt.as_secs_f64() * 1000.0);
        }
    }

    Ok(PingStats::from_rtts(count, &rtts))
}

/// Reply wait for the next packet, or `None` once the series deadline has passed.
fn packet_wait(timeout: Duration, deadline: Instant) -> Option<Duration> {
    let left = deadline.checked_duration_since(Instant::now())?;
    (!left.is_zero()).then(|| timeout.min(left))
}

/// Wait for the echo reply matching `sequence`. `None` means it was lost.
fn await_reply(
    socket: &Socket,
    start: Instant,
    timeout: Duration,
    reply_type: u8,
    identifier: u16,
    sequence: u16,
    has_ip_header: bool,
) -> Result<Option<Duration>, PingFailure> {
    loop {
        let remaining = match timeout.checked_sub(start.elapsed()) {
            Some(r) if !r.is_zero() => r,
            _ => return Ok(None),
        };
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| PingFailure::from_io("Failed to set timeout", e))?;

        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => return Ok(None),
            Err(e) => return Err(PingFailure::from_io("Failed to receive", e)),
        };
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
        let elapsed = start.elapsed();

        let offset = if has_ip_header && !buf.is_empty() {
            ((buf[0] & 0x0f) as usize) * 4
        } else {
            0
        };
        if len < offset + 8 {
            continue;
        }

        let icmp = &buf[offset..];
        let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
        let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

        // The kernel rewrites the identifier on DGRAM sockets.
        let id_matches = !has_ip_header || reply_id == identifier;
        if icmp[0] == reply_type && reply_seq == sequence && id_matches {
            return Ok(Some(elapsed));
        }
        // Someone else's packet, keep waiting
    }
}

/// Build an ICMP or ICMPv6 Echo Request packet.
fn build_echo_request(request_type: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = request_type;
    packet[1] = 0; // Code
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    // The kernel computes the ICMPv6 checksum.
    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [odd] = chunks.remainder() {
        sum += (*odd as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via command execution (fallback).
async fn run_ping_command(host: &str, count: u32, timeout: Duration) -> Result<PingStats, PingFailure> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", &count.to_string(), "-W", &timeout_secs.to_string(), host])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| PingFailure::Failed(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if let Some(failure) = classify_command_failure(&stderr) {
        return Err(failure);
    }

    match parse_ping_output(&stdout) {
        Some(stats) => Ok(stats),
        None if !output.status.success() => Err(PingFailure::Failed(format!("Ping error: {}", stderr.trim()))),
        None => Err(PingFailure::Failed(format!("failed to parse ping output: {}", stdout.trim()))),
    }
}

fn classify_command_failure(stderr: &str) -> Option<PingFailure> {
    const RESOLVE_MARKERS: [&str; 5] = [
        "unknown host",
        "Name or service not known",
        "cannot resolve",
        "Temporary failure in name resolution",
        "nodename nor servname",
    ];

    if RESOLVE_MARKERS.iter().any(|m| stderr.contains(m)) {
        return Some(PingFailure::Resolve("Host not found".to_string()));
    }
    if stderr.contains("Network is unreachable") {
        return Some(PingFailure::Unreachable("Network unreachable".to_string()));
    }
    None
}

/// Parse the summary of `ping -c` output (Linux iputils and BSD/macOS).
fn parse_ping_output(output: &str) -> Option<PingStats> {
    static COUNTS: OnceLock<Regex> = OnceLock::new();
    let counts = COUNTS.get_or_init(|| {
        Regex::new(r"(?P<tx>\d+) packets transmitted, (?P<rx>\d+) (?:packets )?received").unwrap()
    });

    static RTT: OnceLock<Regex> = OnceLock::new();
    let rtt = RTT.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip) min/avg/max/(?:mdev|stddev) = ([0-9.]+)/([0-9.]+)/([0-9.]+)/([0-9.]+)")
            .unwrap()
    });

    let caps = counts.captures(output)?;
    let transmitted: u32 = caps["tx"].parse().ok()?;
    let received: u32 = caps["rx"].parse().ok()?;

    let mut stats = PingStats::from_rtts(transmitted, &[]);
    stats.received = received;

    if let Some(caps) = rtt.captures(output) {
        let field = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok()).unwrap_or(0.0);
        stats.min_ms = field(1);
        stats.avg_ms = field(2);
        stats.max_ms = field(3);
        stats.jitter_ms = field(4);
    }

    Some(stats)
}
