//! Probe result model.
//!
//! A [`ProbeResult`] is the canonical outcome record of one probe against one
//! target. It is built by a collector, handed to storage by value, and never
//! mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol tag of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MonitorType {
    Http,
    Https,
    Tcp,
    Ping,
    Dns,
}

impl MonitorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorType::Http => "HTTP",
            MonitorType::Https => "HTTPS",
            MonitorType::Tcp => "TCP",
            MonitorType::Ping => "PING",
            MonitorType::Dns => "DNS",
        }
    }
}

impl fmt::Display for MonitorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of failure classifications carried by failed results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    Timeout,
    ConnectionRefused,
    ConnectionReset,
    HostUnreachable,
    NetworkUnreachable,
    DnsError,
    ConnectionError,
    StatusCodeMismatch,
    HttpError,
    PingError,
    TotalPacketLoss,
    CollectionError,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Timeout => "TIMEOUT",
            ErrorType::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorType::ConnectionReset => "CONNECTION_RESET",
            ErrorType::HostUnreachable => "HOST_UNREACHABLE",
            ErrorType::NetworkUnreachable => "NETWORK_UNREACHABLE",
            ErrorType::DnsError => "DNS_ERROR",
            ErrorType::ConnectionError => "CONNECTION_ERROR",
            ErrorType::StatusCodeMismatch => "STATUS_CODE_MISMATCH",
            ErrorType::HttpError => "HTTP_ERROR",
            ErrorType::PingError => "PING_ERROR",
            ErrorType::TotalPacketLoss => "TOTAL_PACKET_LOSS",
            ErrorType::CollectionError => "COLLECTION_ERROR",
            ErrorType::Unknown => "UNKNOWN",
        }
    }

    /// Human-readable fallback used when a failure carries no message.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorType::Timeout => "Operation timed out",
            ErrorType::ConnectionRefused => "Connection refused",
            ErrorType::ConnectionReset => "Connection reset",
            ErrorType::HostUnreachable => "Host unreachable",
            ErrorType::NetworkUnreachable => "Network unreachable",
            ErrorType::DnsError => "DNS resolution failed",
            ErrorType::ConnectionError => "Connection error",
            ErrorType::StatusCodeMismatch => "Unexpected status code",
            ErrorType::HttpError => "HTTP request failed",
            ErrorType::PingError => "Ping failed",
            ErrorType::TotalPacketLoss => "100% packet loss",
            ErrorType::CollectionError => "Collection error",
            ErrorType::Unknown => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Warning/critical latency thresholds in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning: u64,
    pub critical: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning: 500,
            critical: 1000,
        }
    }
}

/// Identity of the agent stamped on every result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// `name@host`
    pub agent_id: String,
    pub region: Option<String>,
}

/// Build the stable monitor id for a target: `<protocol>-<slug(name)>`.
pub fn monitor_id(prefix: &str, name: &str) -> String {
    let slug = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    format!("{}-{}", prefix, slug)
}

/// Outcome record of one probe.
///
/// The success flag and error fields are private so that a failed result
/// always carries an [`ErrorType`] and a non-empty message, and a successful
/// one carries neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub monitor_id: String,
    pub monitor_name: String,
    pub monitor_type: MonitorType,

    pub target_host: String,
    pub target_port: Option<u16>,
    pub target_path: Option<String>,

    pub executed_at: DateTime<Utc>,
    pub agent_id: String,
    pub agent_region: Option<String>,

    success: bool,
    /// Wall-clock duration of the whole probe.
    pub response_time: u64,
    pub response_size_bytes: Option<u64>,

    pub http_method: Option<String>,
    pub expected_status_code: Option<u16>,
    pub response_status_code: Option<u16>,
    pub response_content_type: Option<String>,
    pub response_server: Option<String>,
    pub response_cache_status: Option<String>,

    pub dns_lookup_ms: Option<u64>,
    pub tcp_connect_ms: Option<u64>,
    pub tls_handshake_ms: Option<u64>,
    pub time_to_first_byte_ms: Option<u64>,

    pub warning_threshold_ms: Option<u64>,
    pub critical_threshold_ms: Option<u64>,

    pub packet_loss: Option<f64>,
    pub jitter_ms: Option<f64>,

    pub dns_query_type: Option<String>,
    pub dns_expected_response: Option<String>,
    pub dns_response_value: Option<Vec<String>>,

    error_message: Option<String>,
    error_type: Option<ErrorType>,

    pub raw_response_headers: Option<serde_json::Value>,
    pub raw_response_body: Option<String>,
    pub raw_request_headers: Option<serde_json::Value>,
    pub raw_network_data: Option<serde_json::Value>,
}

impl ProbeResult {
    /// Start a result for a probe that begins now. The result is successful
    /// until [`ProbeResult::fail`] is called.
    pub fn begin(
        identity: &AgentIdentity,
        monitor_type: MonitorType,
        monitor_id: String,
        monitor_name: &str,
        target_host: &str,
    ) -> Self {
        Self {
            monitor_id,
            monitor_name: monitor_name.to_string(),
            monitor_type,
            target_host: target_host.to_string(),
            target_port: None,
            target_path: None,
            executed_at: Utc::now(),
            agent_id: identity.agent_id.clone(),
            agent_region: identity.region.clone(),
            success: true,
            response_time: 0,
            response_size_bytes: None,
            http_method: None,
            expected_status_code: None,
            response_status_code: None,
            response_content_type: None,
            response_server: None,
            response_cache_status: None,
            dns_lookup_ms: None,
            tcp_connect_ms: None,
            tls_handshake_ms: None,
            time_to_first_byte_ms: None,
            warning_threshold_ms: None,
            critical_threshold_ms: None,
            packet_loss: None,
            jitter_ms: None,
            dns_query_type: None,
            dns_expected_response: None,
            dns_response_value: None,
            error_message: None,
            error_type: None,
            raw_response_headers: None,
            raw_response_body: None,
            raw_request_headers: None,
            raw_network_data: None,
        }
    }

    /// Mark the result as failed.
    pub fn fail(mut self, error_type: ErrorType, message: impl Into<String>) -> Self {
        let message = message.into();
        self.success = false;
        self.error_type = Some(error_type);
        self.error_message = Some(if message.trim().is_empty() {
            error_type.description().to_string()
        } else {
            message
        });
        self
    }

    /// Mark the result as successful, clearing any error fields.
    pub fn succeed(mut self) -> Self {
        self.success = true;
        self.error_type = None;
        self.error_message = None;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.warning_threshold_ms = Some(thresholds.warning);
        self.critical_threshold_ms = Some(thresholds.critical);
        self
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn error_type(&self) -> Option<ErrorType> {
        self.error_type
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> AgentIdentity {
        AgentIdentity {
            agent_id: "edge-1@host".to_string(),
            region: Some("eu-west".to_string()),
        }
    }

    #[test]
    fn test_monitor_id_slug() {
        assert_eq!(monitor_id("dns", "Main  Site Lookup"), "dns-main-site-lookup");
        assert_eq!(monitor_id("tcp", "db"), "tcp-db");
    }

    #[test]
    fn test_failure_always_has_type_and_message() {
        let r = ProbeResult::begin(&identity(), MonitorType::Tcp, "tcp-db".into(), "db", "10.0.0.1")
            .fail(ErrorType::Timeout, "");
        assert!(!r.success());
        assert_eq!(r.error_type(), Some(ErrorType::Timeout));
        assert_eq!(r.error_message(), Some("Operation timed out"));
    }

    #[test]
    fn test_succeed_clears_error() {
        let r = ProbeResult::begin(&identity(), MonitorType::Dns, "dns-a".into(), "a", "example.com")
            .fail(ErrorType::DnsError, "nxdomain")
            .succeed();
        assert!(r.success());
        assert!(r.error_type().is_none());
        assert!(r.error_message().is_none());
    }

    #[test]
    fn test_serializes_camel_case_with_screaming_error_type() {
        let r = ProbeResult::begin(&identity(), MonitorType::Tcp, "tcp-db".into(), "db", "10.0.0.1")
            .fail(ErrorType::ConnectionRefused, "Connection refused");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["monitorType"], "TCP");
        assert_eq!(json["errorType"], "CONNECTION_REFUSED");
        assert_eq!(json["success"], false);
        assert_eq!(json["agentRegion"], "eu-west");
    }
}
