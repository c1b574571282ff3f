//! Agent orchestrator.
//!
//! Owns the storage manager, the collector registry, the scheduler and the
//! optional health server, and moves them through
//! `stopped -> starting -> running -> stopping -> stopped`.

mod health;

pub use health::*;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::collector::{build_collectors, CollectorError, CollectorFactory, CollectorRegistry, CollectorStats};
use crate::config::{AgentConfig, ConfigError, ConfigSource};
use crate::model::AgentIdentity;
use crate::scheduler::{SchedulePolicy, Scheduler, SchedulerStatus};
use crate::storage::{build_adapters, AdapterFactory, StorageError, StorageManager, StorageStatus};
use crate::web::HealthServer;

/// Agent error types.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("health server failed to start: {0}")]
    HealthServer(#[source] std::io::Error),
    #[error("agent is not running")]
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Stopped => "stopped",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Computed health snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub memory_mb: f64,
    pub cpu_percent: f32,
    pub active_collectors: usize,
    pub storage_adapters: BTreeMap<String, bool>,
    pub buffer_size: usize,
    pub last_flush: Option<DateTime<Utc>>,
}

/// Point-in-time view of the whole agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub running: bool,
    pub state: AgentState,
    pub agent_id: Option<String>,
    pub region: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    /// Seconds since start.
    #[serde(rename = "uptime")]
    pub uptime_seconds: u64,
    pub collectors: Vec<CollectorStats>,
    pub scheduler: Option<SchedulerStatus>,
    pub storage: Option<StorageStatus>,
    pub health: AgentHealth,
}

/// Everything built by one successful `start()`.
struct Components {
    identity: Arc<AgentIdentity>,
    storage: Arc<StorageManager>,
    registry: Arc<CollectorRegistry>,
    scheduler: Arc<Scheduler>,
    health_server: Option<HealthServer>,
    started: Instant,
    start_time: DateTime<Utc>,
}

impl Components {
    fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

pub struct Agent {
    source: Arc<dyn ConfigSource>,
    collector_factory: CollectorFactory,
    adapter_factory: AdapterFactory,
    state: RwLock<AgentState>,
    components: RwLock<Option<Arc<Components>>>,
    /// Serializes start/stop/reload.
    lifecycle: Mutex<()>,
    sampler: ProcessSampler,
    this: Weak<Agent>,
}

impl Agent {
    pub fn new(source: Arc<dyn ConfigSource>) -> Arc<Self> {
        Self::with_factories(source, Arc::new(build_collectors), Arc::new(build_adapters))
    }

    pub fn with_factories(
        source: Arc<dyn ConfigSource>,
        collector_factory: CollectorFactory,
        adapter_factory: AdapterFactory,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            source,
            collector_factory,
            adapter_factory,
            state: RwLock::new(AgentState::Stopped),
            components: RwLock::new(None),
            lifecycle: Mutex::new(()),
            sampler: ProcessSampler::new(),
            this: this.clone(),
        })
    }

    pub fn state(&self) -> AgentState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state() == AgentState::Running
    }

    fn set_state(&self, state: AgentState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        tracing::info!(state = %state, "Agent state changed");
    }

    fn components(&self) -> Option<Arc<Components>> {
        self.components.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn identity(&self) -> Option<Arc<AgentIdentity>> {
        self.components().map(|c| c.identity.clone())
    }

    /// Bring every component up. On failure whatever was already started is
    /// torn down again and the agent stays stopped.
    pub async fn start(&self) -> Result<(), AgentError> {
        let _guard = self.lifecycle.lock().await;

        if self.state() != AgentState::Stopped {
            tracing::warn!(state = %self.state(), "Agent start requested while not stopped");
            return Ok(());
        }

        self.set_state(AgentState::Starting);
        match self.start_components().await {
            Ok(components) => {
                tracing::info!(
                    agent_id = %components.identity.agent_id,
                    collectors = components.registry.collectors().len(),
                    "Agent started"
                );
                *self.components.write().unwrap_or_else(PoisonError::into_inner) = Some(components);
                self.set_state(AgentState::Running);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Agent failed to start");
                self.set_state(AgentState::Stopped);
                Err(e)
            }
        }
    }

    async fn start_components(&self) -> Result<Arc<Components>, AgentError> {
        let config: AgentConfig = self.source.load()?;
        let identity = Arc::new(config.agent.identity());
        tracing::info!(agent_id = %identity.agent_id, region = ?identity.region, "Starting agent");

        let storage = StorageManager::new(&config.agent.buffering, (self.adapter_factory)(&config.storage));
        storage.initialize().await?;

        let policy = SchedulePolicy::from_config(&config.agent.scheduler);
        let registry = Arc::new(CollectorRegistry::with_factory(
            config.monitors.clone(),
            identity.clone(),
            storage.clone(),
            policy.clone(),
            self.collector_factory.clone(),
        ));
        if let Err(e) = registry.initialize().await {
            storage.shutdown().await;
            return Err(e.into());
        }

        let scheduler = Arc::new(Scheduler::new(policy));
        scheduler.start();

        let health_server = if config.agent.health.enabled {
            match HealthServer::start(config.agent.health.port, self.this.clone()).await {
                Ok(server) => Some(server),
                Err(e) => {
                    scheduler.stop();
                    registry.shutdown().await;
                    storage.shutdown().await;
                    return Err(AgentError::HealthServer(e));
                }
            }
        } else {
            None
        };

        registry.start_all().await;
        for handle in registry.collectors().iter().filter(|h| h.enabled()) {
            scheduler.schedule_collector(handle);
        }

        Ok(Arc::new(Components {
            identity,
            storage,
            registry,
            scheduler,
            health_server,
            started: Instant::now(),
            start_time: Utc::now(),
        }))
    }

    /// Tear down in reverse order. A no-op unless running.
    pub async fn stop(&self) -> Result<(), AgentError> {
        let _guard = self.lifecycle.lock().await;

        if self.state() != AgentState::Running {
            tracing::debug!(state = %self.state(), "Agent stop requested while not running");
            return Ok(());
        }

        self.set_state(AgentState::Stopping);
        let components = self.components.write().unwrap_or_else(PoisonError::into_inner).take();

        if let Some(c) = components {
            c.scheduler.stop();
            c.registry.shutdown().await;
            c.storage.shutdown().await;
            if let Some(server) = &c.health_server {
                server.stop().await;
            }
            tracing::info!(uptime_seconds = c.uptime_seconds(), "Agent stopped");
        }

        self.set_state(AgentState::Stopped);
        Ok(())
    }

    /// Re-read configuration and swap the collectors. Storage, identity and
    /// the health server keep their startup configuration.
    pub async fn reload_config(&self) -> Result<usize, AgentError> {
        let _guard = self.lifecycle.lock().await;

        let components = match (self.state(), self.components()) {
            (AgentState::Running, Some(c)) => c,
            _ => return Err(AgentError::NotRunning),
        };

        tracing::info!("Reloading agent configuration");
        let config = match self.source.load() {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "Configuration reload failed, keeping current collectors");
                return Err(e.into());
            }
        };

        if config.agent.identity() != *components.identity {
            tracing::warn!("Agent identity changes take effect on restart");
        }

        let count = components.registry.reload(config.monitors).await?;
        components.scheduler.retrack(&components.registry.collectors());

        tracing::info!(collectors = count, "Agent configuration reloaded");
        Ok(count)
    }

    /// Computed health, sampling process resources.
    pub async fn health(&self) -> AgentHealth {
        let sample = self.sampler.sample().await;
        let running = self.is_running();

        match self.components() {
            Some(c) => {
                let adapters = c.storage.health();
                let status = if !running {
                    HealthStatus::Unhealthy
                } else if adapters.values().all(|healthy| *healthy) {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                };
                AgentHealth {
                    status,
                    uptime_seconds: c.uptime_seconds(),
                    memory_mb: sample.memory_mb(),
                    cpu_percent: sample.cpu_percent,
                    active_collectors: c.registry.active_count(),
                    storage_adapters: adapters,
                    buffer_size: c.storage.buffer_size(),
                    last_flush: c.storage.last_flush(),
                }
            }
            None => AgentHealth {
                status: HealthStatus::Unhealthy,
                uptime_seconds: 0,
                memory_mb: sample.memory_mb(),
                cpu_percent: sample.cpu_percent,
                active_collectors: 0,
                storage_adapters: BTreeMap::new(),
                buffer_size: 0,
                last_flush: None,
            },
        }
    }

    pub async fn status(&self) -> AgentStatus {
        let health = self.health().await;
        let state = self.state();
        let components = self.components();

        AgentStatus {
            running: state == AgentState::Running,
            state,
            agent_id: components.as_ref().map(|c| c.identity.agent_id.clone()),
            region: components.as_ref().and_then(|c| c.identity.region.clone()),
            start_time: components.as_ref().map(|c| c.start_time),
            uptime_seconds: components.as_ref().map(|c| c.uptime_seconds()).unwrap_or(0),
            collectors: components.as_ref().map(|c| c.registry.stats()).unwrap_or_default(),
            scheduler: components.as_ref().map(|c| c.scheduler.status()),
            storage: components.as_ref().map(|c| c.storage.status()),
            health,
        }
    }

    /// Round-trip check against every adapter. Empty when not running.
    pub async fn storage_deep_health(&self) -> BTreeMap<String, bool> {
        match self.components() {
            Some(c) => c.storage.deep_health().await,
            None => BTreeMap::new(),
        }
    }

    /// Bound address of the health server, if one is running.
    pub fn health_server_addr(&self) -> Option<std::net::SocketAddr> {
        self.components()
            .and_then(|c| c.health_server.as_ref().map(HealthServer::local_addr))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::collector::testing::FakeCollector;
    use crate::collector::Collector;
    use crate::config::{MonitorConfig, SqliteStorageConfig, StaticConfigSource};
    use crate::storage::testing::MemoryAdapter;
    use crate::storage::StorageAdapter;
    use crate::config::StorageConfig;

    pub fn config(name: &str) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.agent.name = name.to_string();
        config.agent.host = Some("node-a".to_string());
        config.storage.sqlite = Some(SqliteStorageConfig::default());
        config
    }

    /// Agent wired to an in-memory adapter and one fake collector with
    /// `targets` results per cycle.
    pub fn agent(
        config: AgentConfig,
        adapter: Arc<MemoryAdapter>,
        targets: usize,
    ) -> (Arc<Agent>, Arc<StaticConfigSource>) {
        let source = Arc::new(StaticConfigSource::new(config));
        let collectors: CollectorFactory = Arc::new(move |_: &MonitorConfig, _: &Arc<AgentIdentity>| {
            Ok(vec![Arc::new(FakeCollector::new("fake", targets)) as Arc<dyn Collector>])
        });
        let adapters: AdapterFactory =
            Arc::new(move |_: &StorageConfig| vec![adapter.clone() as Arc<dyn StorageAdapter>]);
        (Agent::with_factories(source.clone(), collectors, adapters), source)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{agent, config};
    use super::*;
    use crate::collector::testing::FakeCollector;
    use crate::collector::Collector;
    use crate::config::{MonitorConfig, StaticConfigSource, StorageConfig};
    use crate::storage::testing::MemoryAdapter;
    use crate::storage::StorageAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let adapter = Arc::new(MemoryAdapter::default());
        let (agent, _) = agent(config("edge-1"), adapter.clone(), 3);

        agent.start().await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);
        assert_eq!(agent.identity().unwrap().agent_id, "edge-1@node-a");

        let status = agent.status().await;
        assert!(status.running);
        assert!(status.start_time.is_some());
        assert_eq!(status.collectors.len(), 1);
        assert_eq!(status.collectors[0].cycles, 1);
        assert_eq!(status.scheduler.as_ref().unwrap().tracked_collectors, 1);
        // first cycle is buffered, below the flush threshold
        assert_eq!(status.health.buffer_size, 3);
        assert_eq!(status.health.status, HealthStatus::Healthy);
        assert_eq!(status.health.active_collectors, 1);

        let json = serde_json::to_value(&status).unwrap();
        assert!(json["uptime"].is_u64());
        assert_eq!(json["storage"]["adapters"], serde_json::json!(["memory"]));
        assert_eq!(json["storage"]["bufferSize"], 3);
        assert!(json["storage"]["lastFlush"].is_null());
        assert_eq!(json["storage"]["health"]["memory"], true);

        agent.stop().await.unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
        assert_eq!(adapter.stored().len(), 3);
        assert_eq!(adapter.disconnects.load(Ordering::SeqCst), 1);

        // second stop is a no-op
        agent.stop().await.unwrap();
        assert_eq!(adapter.disconnects.load(Ordering::SeqCst), 1);
        assert!(!agent.status().await.running);
    }

    #[tokio::test]
    async fn test_start_twice_keeps_single_generation() {
        let adapter = Arc::new(MemoryAdapter::default());
        let (agent, _) = agent(config("edge-1"), adapter, 1);

        agent.start().await.unwrap();
        agent.start().await.unwrap();
        assert_eq!(agent.status().await.collectors.len(), 1);
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_without_storage() {
        let adapter = Arc::new(MemoryAdapter::unreachable());
        let (agent, _) = agent(config("edge-1"), adapter, 1);

        let err = agent.start().await.unwrap_err();
        assert!(matches!(err, AgentError::Storage(StorageError::NoAdapters)));
        assert_eq!(agent.state(), AgentState::Stopped);
        assert!(agent.status().await.collectors.is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_on_invalid_config() {
        let adapter = Arc::new(MemoryAdapter::default());
        let (agent, _) = agent(config(""), adapter.clone(), 1);

        assert!(matches!(agent.start().await, Err(AgentError::Config(_))));
        assert_eq!(agent.state(), AgentState::Stopped);
        assert!(!adapter.connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_collector_failure_shuts_storage_down() {
        let adapter = Arc::new(MemoryAdapter::default());
        let source = Arc::new(StaticConfigSource::new(config("edge-1")));
        let collectors: CollectorFactory = Arc::new(|_: &MonitorConfig, _: &Arc<AgentIdentity>| {
            Err(CollectorError::Config("bad target".into()))
        });
        let adapter_ref = adapter.clone();
        let adapters: AdapterFactory =
            Arc::new(move |_: &StorageConfig| vec![adapter_ref.clone() as Arc<dyn StorageAdapter>]);
        let agent = Agent::with_factories(source, collectors, adapters);

        assert!(matches!(agent.start().await, Err(AgentError::Collector(_))));
        assert_eq!(agent.state(), AgentState::Stopped);
        assert_eq!(adapter.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reload_swaps_collectors() {
        let adapter = Arc::new(MemoryAdapter::default());
        let source = Arc::new(StaticConfigSource::new(config("edge-1")));
        let generation = Arc::new(AtomicUsize::new(0));
        let generation_ref = generation.clone();
        let collectors: CollectorFactory = Arc::new(move |_: &MonitorConfig, _: &Arc<AgentIdentity>| {
            let name = format!("gen{}", generation_ref.fetch_add(1, Ordering::SeqCst));
            Ok(vec![Arc::new(FakeCollector::new(&name, 1)) as Arc<dyn Collector>])
        });
        let adapter_ref = adapter.clone();
        let adapters: AdapterFactory =
            Arc::new(move |_: &StorageConfig| vec![adapter_ref.clone() as Arc<dyn StorageAdapter>]);
        let agent = Agent::with_factories(source.clone(), collectors, adapters);

        assert!(matches!(agent.reload_config().await, Err(AgentError::NotRunning)));

        agent.start().await.unwrap();
        assert_eq!(agent.reload_config().await.unwrap(), 1);

        let status = agent.status().await;
        assert_eq!(status.collectors[0].name, "gen1");
        assert_eq!(status.scheduler.unwrap().collectors, vec!["gen1".to_string()]);

        // an invalid configuration keeps the running generation
        source.replace(config(""));
        assert!(agent.reload_config().await.is_err());
        assert_eq!(agent.status().await.collectors[0].name, "gen1");
        assert_eq!(generation.load(Ordering::SeqCst), 2);

        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnected_adapter_degrades_health() {
        let adapter = Arc::new(MemoryAdapter::default());
        let (agent, _) = agent(config("edge-1"), adapter.clone(), 1);
        agent.start().await.unwrap();

        adapter.connected.store(false, Ordering::SeqCst);
        let health = agent.health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.storage_adapters.get("memory"), Some(&false));
        assert_eq!(agent.storage_deep_health().await.get("memory"), Some(&false));

        agent.stop().await.unwrap();
        assert_eq!(agent.health().await.status, HealthStatus::Unhealthy);
    }
}
