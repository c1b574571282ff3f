//! Configuration module for probeagent.
//!
//! The agent consumes an already-parsed [`AgentConfig`]. Where it comes from is
//! decided by a [`ConfigSource`]; the binary uses [`JsonFileConfigSource`],
//! located through environment variables with sensible defaults.

use std::collections::BTreeMap;
use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{AgentIdentity, Thresholds};

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Process bootstrap settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Path to the JSON configuration document (default: "probeagent.json")
    pub config_path: PathBuf,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("probeagent.json"),
        }
    }
}

impl BootstrapConfig {
    /// Load bootstrap settings from environment variables.
    ///
    /// Environment variables:
    /// - `PROBEAGENT_CONFIG`: configuration file path (default: "probeagent.json")
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = env::var("PROBEAGENT_CONFIG") {
            if !path.trim().is_empty() {
                cfg.config_path = PathBuf::from(path);
            }
        }

        cfg
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub storage: StorageConfig,
    pub monitors: MonitorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub name: String,
    pub host: Option<String>,
    pub datacenter: Option<String>,
    pub region: Option<String>,
    pub health: HealthConfig,
    pub buffering: BufferingConfig,
    pub scheduler: SchedulerConfig,
}

impl AgentSection {
    /// Host name, falling back to `$HOSTNAME` and then `localhost`.
    pub fn host(&self) -> String {
        self.host
            .clone()
            .or_else(|| env::var("HOSTNAME").ok())
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            agent_id: format!("{}@{}", self.name, self.host()),
            region: self.region.clone().or_else(|| self.datacenter.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferingConfig {
    /// Buffer length that triggers an immediate flush.
    pub max_buffer_size: usize,
    pub flush_interval_seconds: u64,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 100,
            flush_interval_seconds: 10,
        }
    }
}

impl BufferingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_jitter_seconds: u64,
    /// Upper bound on collector cycles running at once; 0 means unlimited.
    pub max_concurrent_cycles: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub sqlite: Option<SqliteStorageConfig>,
    pub file: Option<FileStorageConfig>,
}

impl StorageConfig {
    pub fn any_enabled(&self) -> bool {
        self.sqlite.as_ref().is_some_and(|s| s.enabled) || self.file.as_ref().is_some_and(|f| f.enabled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteStorageConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("probeagent.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStorageConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub rotation: RotationConfig,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("probeagent-results.jsonl"),
            rotation: RotationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub max_size_mb: u64,
    pub max_files: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 100,
            max_files: 5,
        }
    }
}

// ============================================================================
// Monitors
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub http: Option<HttpMonitorConfig>,
    pub tcp: Option<TcpMonitorConfig>,
    pub ping: Option<PingMonitorConfig>,
    pub dns: Option<DnsMonitorConfig>,
    pub global: GlobalMonitorConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalMonitorConfig {
    pub response_time_thresholds: Option<Thresholds>,
    pub include_response_body: bool,
}

/// Pick the thresholds for a target: its own, else the collector defaults,
/// else the global ones, else 500/1000 ms.
pub fn resolve_thresholds(
    target: Option<Thresholds>,
    defaults: Option<Thresholds>,
    global: Option<Thresholds>,
) -> Thresholds {
    target.or(defaults).or(global).unwrap_or_default()
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value.max(1))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpMonitorConfig {
    pub enabled: bool,
    pub defaults: HttpDefaults,
    pub targets: Vec<HttpTarget>,
    pub groups: Vec<HttpGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpDefaults {
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub method: String,
    pub follow_redirects: bool,
    pub verify_ssl: bool,
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
    pub thresholds: Option<Thresholds>,
}

impl Default for HttpDefaults {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            timeout_seconds: 10,
            method: "GET".to_string(),
            follow_redirects: true,
            verify_ssl: true,
            user_agent: concat!("probeagent/", env!("CARGO_PKG_VERSION")).to_string(),
            headers: BTreeMap::new(),
            thresholds: None,
        }
    }
}

impl HttpDefaults {
    pub fn interval(&self) -> Duration {
        secs(self.interval_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTarget {
    pub name: String,
    /// Absolute URL, or a path relative to the owning group's `base_url`.
    pub url: String,
    pub method: Option<String>,
    /// When absent, any response status counts as success.
    pub expected_status: Option<Vec<u16>>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub include_response_body: Option<bool>,
    pub thresholds: Option<Thresholds>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpGroup {
    pub name: String,
    pub base_url: Option<String>,
    pub enabled: bool,
    pub defaults: HttpGroupDefaults,
    pub monitors: Vec<HttpTarget>,
}

impl Default for HttpGroup {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_url: None,
            enabled: true,
            defaults: HttpGroupDefaults::default(),
            monitors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpGroupDefaults {
    pub timeout_seconds: Option<u64>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpMonitorConfig {
    pub enabled: bool,
    pub defaults: TcpDefaults,
    pub targets: Vec<TcpTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpDefaults {
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub thresholds: Option<Thresholds>,
}

impl Default for TcpDefaults {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            timeout_seconds: 5,
            thresholds: None,
        }
    }
}

impl TcpDefaults {
    pub fn interval(&self) -> Duration {
        secs(self.interval_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpTarget {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub timeout_seconds: Option<u64>,
    pub thresholds: Option<Thresholds>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PingMonitorConfig {
    pub enabled: bool,
    pub defaults: PingDefaults,
    pub targets: Vec<PingTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingDefaults {
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub packet_count: u32,
    pub thresholds: Option<Thresholds>,
}

impl Default for PingDefaults {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            timeout_seconds: 3,
            packet_count: 3,
            thresholds: None,
        }
    }
}

impl PingDefaults {
    pub fn interval(&self) -> Duration {
        secs(self.interval_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PingTarget {
    pub name: String,
    pub host: String,
    pub packet_count: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub thresholds: Option<Thresholds>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsMonitorConfig {
    pub enabled: bool,
    pub defaults: DnsDefaults,
    pub targets: Vec<DnsTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsDefaults {
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub thresholds: Option<Thresholds>,
}

impl Default for DnsDefaults {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
            timeout_seconds: 10,
            thresholds: None,
        }
    }
}

impl DnsDefaults {
    pub fn interval(&self) -> Duration {
        secs(self.interval_seconds)
    }
}

/// DNS record type to query. Unknown names fall back to `A`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DnsRecordType {
    #[default]
    A,
    Aaaa,
    Mx,
    Txt,
    Cname,
    Ns,
}

impl DnsRecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsRecordType::A => "A",
            DnsRecordType::Aaaa => "AAAA",
            DnsRecordType::Mx => "MX",
            DnsRecordType::Txt => "TXT",
            DnsRecordType::Cname => "CNAME",
            DnsRecordType::Ns => "NS",
        }
    }
}

impl From<String> for DnsRecordType {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "AAAA" => DnsRecordType::Aaaa,
            "MX" => DnsRecordType::Mx,
            "TXT" => DnsRecordType::Txt,
            "CNAME" => DnsRecordType::Cname,
            "NS" => DnsRecordType::Ns,
            _ => DnsRecordType::A,
        }
    }
}

impl From<DnsRecordType> for String {
    fn from(value: DnsRecordType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsTarget {
    pub name: String,
    pub domain: String,
    pub record_type: DnsRecordType,
    pub expected_ips: Vec<String>,
    pub expected_cname: Option<String>,
    pub nameserver: Option<IpAddr>,
    pub timeout_seconds: Option<u64>,
    pub thresholds: Option<Thresholds>,
}

impl AgentConfig {
    /// Parse a JSON document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.name.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.name must not be empty".into()));
        }
        if self.agent.buffering.max_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "agent.buffering.max_buffer_size must be positive".into(),
            ));
        }
        if !self.storage.any_enabled() {
            return Err(ConfigError::Invalid("no storage adapter is enabled".into()));
        }
        self.monitors.validate()
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if let Some(http) = self.http.as_ref().filter(|c| c.enabled) {
            if http.defaults.interval_seconds == 0 {
                return invalid("monitors.http.defaults.interval_seconds must be positive".into());
            }
            let grouped = http.groups.iter().flat_map(|g| g.monitors.iter());
            for target in http.targets.iter().chain(grouped) {
                if target.url.trim().is_empty() {
                    return invalid(format!("http target {:?} has no url", target.name));
                }
            }
        }

        if let Some(tcp) = self.tcp.as_ref().filter(|c| c.enabled) {
            if tcp.defaults.interval_seconds == 0 {
                return invalid("monitors.tcp.defaults.interval_seconds must be positive".into());
            }
            for target in &tcp.targets {
                if target.host.trim().is_empty() || target.port == 0 {
                    return invalid(format!("tcp target {:?} needs a host and a port", target.name));
                }
            }
        }

        if let Some(ping) = self.ping.as_ref().filter(|c| c.enabled) {
            if ping.defaults.interval_seconds == 0 {
                return invalid("monitors.ping.defaults.interval_seconds must be positive".into());
            }
            for target in &ping.targets {
                if target.host.trim().is_empty() {
                    return invalid(format!("ping target {:?} has no host", target.name));
                }
            }
        }

        if let Some(dns) = self.dns.as_ref().filter(|c| c.enabled) {
            if dns.defaults.interval_seconds == 0 {
                return invalid("monitors.dns.defaults.interval_seconds must be positive".into());
            }
            for target in &dns.targets {
                if target.domain.trim().is_empty() {
                    return invalid(format!("dns target {:?} has no domain", target.name));
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// Sources
// ============================================================================

/// Supplier of configuration snapshots. Called once at start and again on
/// every reload.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<AgentConfig, ConfigError>;
}

/// Reads a JSON configuration document from disk on every load.
#[derive(Debug, Clone)]
pub struct JsonFileConfigSource {
    path: PathBuf,
}

impl JsonFileConfigSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigSource for JsonFileConfigSource {
    fn load(&self) -> Result<AgentConfig, ConfigError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        AgentConfig::from_json(&text)
    }
}

/// In-memory configuration, replaceable between reloads.
#[derive(Debug)]
pub struct StaticConfigSource {
    config: RwLock<AgentConfig>,
}

impl StaticConfigSource {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn replace(&self, config: AgentConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }
}

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<AgentConfig, ConfigError> {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner).clone();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "agent": { "name": "edge-1", "host": "node-a", "datacenter": "fra1",
                   "buffering": { "max_buffer_size": 50 } },
        "storage": { "sqlite": { "enabled": true, "path": "/tmp/x.db" } },
        "monitors": {
            "tcp": { "enabled": true, "targets": [ { "name": "db", "host": "127.0.0.1", "port": 5432 } ] },
            "dns": { "enabled": true, "defaults": { "thresholds": { "warning": 200, "critical": 400 } },
                     "targets": [ { "name": "site", "domain": "example.com", "record_type": "srv" } ] }
        }
    }"#;

    #[test]
    fn test_default_bootstrap_config() {
        let cfg = BootstrapConfig::default();
        assert_eq!(cfg.config_path, PathBuf::from("probeagent.json"));
    }

    #[test]
    fn test_parse_applies_defaults() {
        let cfg = AgentConfig::from_json(SAMPLE).unwrap();
        assert_eq!(cfg.agent.buffering.max_buffer_size, 50);
        assert_eq!(cfg.agent.buffering.flush_interval_seconds, 10);
        assert!(!cfg.agent.health.enabled);

        let tcp = cfg.monitors.tcp.unwrap();
        assert_eq!(tcp.defaults.timeout_seconds, 5);
        assert_eq!(tcp.defaults.interval_seconds, 60);

        let dns = cfg.monitors.dns.unwrap();
        assert_eq!(dns.defaults.interval_seconds, 300);
        // unknown record types fall back to A
        assert_eq!(dns.targets[0].record_type, DnsRecordType::A);
    }

    #[test]
    fn test_identity_uses_datacenter_as_region() {
        let cfg = AgentConfig::from_json(SAMPLE).unwrap();
        let id = cfg.agent.identity();
        assert_eq!(id.agent_id, "edge-1@node-a");
        assert_eq!(id.region.as_deref(), Some("fra1"));
    }

    #[test]
    fn test_validation_rejects_missing_storage() {
        let text = r#"{ "agent": { "name": "a" } }"#;
        assert!(matches!(AgentConfig::from_json(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_zero_port() {
        let text = r#"{ "agent": { "name": "a" }, "storage": { "sqlite": {} },
            "monitors": { "tcp": { "enabled": true, "targets": [ { "name": "x", "host": "h", "port": 0 } ] } } }"#;
        assert!(matches!(AgentConfig::from_json(text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_resolve_thresholds_precedence() {
        let t = |w, c| Some(Thresholds { warning: w, critical: c });
        assert_eq!(resolve_thresholds(t(1, 2), t(3, 4), t(5, 6)), Thresholds { warning: 1, critical: 2 });
        assert_eq!(resolve_thresholds(None, t(3, 4), t(5, 6)), Thresholds { warning: 3, critical: 4 });
        assert_eq!(resolve_thresholds(None, None, t(5, 6)), Thresholds { warning: 5, critical: 6 });
        assert_eq!(resolve_thresholds(None, None, None), Thresholds { warning: 500, critical: 1000 });
    }

    #[test]
    fn test_json_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let source = JsonFileConfigSource::new(file.path());
        let cfg = source.load().unwrap();
        assert_eq!(cfg.agent.name, "edge-1");
    }

    #[test]
    fn test_static_source_replace() {
        let source = StaticConfigSource::new(AgentConfig::from_json(SAMPLE).unwrap());
        let mut next = source.load().unwrap();
        next.agent.name = "edge-2".into();
        source.replace(next);
        assert_eq!(source.load().unwrap().agent.name, "edge-2");
    }
}
