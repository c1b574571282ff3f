//! TCP reachability collector.
//!
//! Opens a connection to each target and closes it right away; no data is
//! exchanged.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::error::io_failure;
use super::{collection_error, fan_out, Collector};
use crate::config::{resolve_thresholds, GlobalMonitorConfig, TcpMonitorConfig};
use crate::model::{monitor_id, AgentIdentity, ErrorType, MonitorType, ProbeResult, Thresholds};

/// One resolved TCP target.
#[derive(Debug, Clone)]
pub struct TcpProbeTarget {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub thresholds: Thresholds,
}

pub struct TcpCollector {
    enabled: bool,
    interval: Duration,
    targets: Vec<TcpProbeTarget>,
    identity: Arc<AgentIdentity>,
}

impl TcpCollector {
    pub fn new(config: &TcpMonitorConfig, global: &GlobalMonitorConfig, identity: Arc<AgentIdentity>) -> Self {
        let defaults = &config.defaults;
        let targets = config
            .targets
            .iter()
            .map(|t| TcpProbeTarget {
                id: monitor_id("tcp", &t.name),
                name: t.name.clone(),
                host: t.host.clone(),
                port: t.port,
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

    pub fn targets(&self) -> &[TcpProbeTarget] {
        &self.targets
    }
}

#[async_trait]
impl Collector for TcpCollector {
    fn name(&self) -> &str {
        "tcp"
    }

    fn monitor_type(&self) -> MonitorType {
        MonitorType::Tcp
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
                async move { probe_tcp(&identity, &target).await }
            },
            |target, message| collection_error(base_result(&self.identity, target), message),
        )
        .await
    }
}

fn base_result(identity: &AgentIdentity, target: &TcpProbeTarget) -> ProbeResult {
    let mut result = ProbeResult::begin(identity, MonitorType::Tcp, target.id.clone(), &target.name, &target.host)
        .with_thresholds(target.thresholds);
    result.target_port = Some(target.port);
    result
}

/// Failure raised before a connection is established.
enum ConnectFailure {
    Resolve(io::Error),
    NoAddresses,
    Connect(io::Error),
}

/// Resolve then connect, trying each address in turn.
async fn connect(host: &str, port: u16, dns_ms: &mut Option<u64>) -> Result<(TcpStream, Duration), ConnectFailure> {
    let lookup_start = Instant::now();
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(ConnectFailure::Resolve)?
        .collect();
    *dns_ms = Some(lookup_start.elapsed().as_millis() as u64);

    let mut last_err = None;
    for addr in addrs {
        let connect_start = Instant::now();
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok((stream, connect_start.elapsed())),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.map(ConnectFailure::Connect).unwrap_or(ConnectFailure::NoAddresses))
}

/// Probe one target: resolve, connect within the timeout, close.
pub async fn probe_tcp(identity: &AgentIdentity, target: &TcpProbeTarget) -> ProbeResult {
    let mut result = base_result(identity, target);
    let start = Instant::now();

    let mut dns_ms = None;
    let outcome = tokio::time::timeout(target.timeout, connect(&target.host, target.port, &mut dns_ms)).await;
    result.response_time = start.elapsed().as_millis() as u64;
    result.dns_lookup_ms = dns_ms;

    match outcome {
        Ok(Ok((stream, connect_time))) => {
            result.tcp_connect_ms = Some(connect_time.as_millis() as u64);
            result.raw_network_data = stream
                .peer_addr()
                .ok()
                .map(|addr| serde_json::json!({ "remoteAddress": addr.to_string() }));
            drop(stream);
            result.succeed()
        }
        Ok(Err(ConnectFailure::Resolve(e))) => {
            result.fail(ErrorType::DnsError, format!("Host not found: {} ({})", target.host, e))
        }
        Ok(Err(ConnectFailure::NoAddresses)) => {
            result.fail(ErrorType::DnsError, format!("Host not found: {}", target.host))
        }
        Ok(Err(ConnectFailure::Connect(e))) => {
            let (kind, message) = io_failure(&e);
            result.fail(kind, message)
        }
        // Dropping the connect future closes the half-open socket.
        Err(_) => result.fail(
            ErrorType::Timeout,
            format!("Connection timeout after {}ms", target.timeout.as_millis()),
        ),
    }
}
