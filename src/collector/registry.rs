//! Collector registry: owns the active collector generation.

use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use tokio::sync::Mutex;

use super::error::CollectorError;
use super::{Collector, CollectorHandle, CollectorStats, DnsCollector, HttpCollector, PingCollector, ResultSink, TcpCollector};
use crate::config::MonitorConfig;
use crate::model::AgentIdentity;
use crate::scheduler::SchedulePolicy;

/// Builds the collectors of one generation from a monitor configuration.
pub type CollectorFactory =
    Arc<dyn Fn(&MonitorConfig, &Arc<AgentIdentity>) -> Result<Vec<Arc<dyn Collector>>, CollectorError> + Send + Sync>;

/// Construct one collector per enabled protocol.
pub fn build_collectors(
    config: &MonitorConfig,
    identity: &Arc<AgentIdentity>,
) -> Result<Vec<Arc<dyn Collector>>, CollectorError> {
    let global = &config.global;
    let mut collectors: Vec<Arc<dyn Collector>> = Vec::new();

    if let Some(http) = config.http.as_ref().filter(|c| c.enabled) {
        collectors.push(Arc::new(HttpCollector::new(http, global, identity.clone())?));
    }
    if let Some(tcp) = config.tcp.as_ref().filter(|c| c.enabled) {
        collectors.push(Arc::new(TcpCollector::new(tcp, global, identity.clone())));
    }
    if let Some(ping) = config.ping.as_ref().filter(|c| c.enabled) {
        collectors.push(Arc::new(PingCollector::new(ping, global, identity.clone())));
    }
    if let Some(dns) = config.dns.as_ref().filter(|c| c.enabled) {
        collectors.push(Arc::new(DnsCollector::new(dns, global, identity.clone())));
    }

    for c in &collectors {
        tracing::info!(collector = c.name(), targets = c.target_count(), "Registered collector");
    }

    Ok(collectors)
}

/// Owns the current set of collectors and swaps it on reload.
pub struct CollectorRegistry {
    config: RwLock<MonitorConfig>,
    identity: Arc<AgentIdentity>,
    sink: Arc<dyn ResultSink>,
    policy: SchedulePolicy,
    factory: CollectorFactory,
    collectors: RwLock<Vec<Arc<CollectorHandle>>>,
    /// Serializes initialize/start/reload/shutdown.
    lifecycle: Mutex<()>,
}

impl CollectorRegistry {
    pub fn new(
        config: MonitorConfig,
        identity: Arc<AgentIdentity>,
        sink: Arc<dyn ResultSink>,
        policy: SchedulePolicy,
    ) -> Self {
        Self::with_factory(config, identity, sink, policy, Arc::new(build_collectors))
    }

    pub fn with_factory(
        config: MonitorConfig,
        identity: Arc<AgentIdentity>,
        sink: Arc<dyn ResultSink>,
        policy: SchedulePolicy,
        factory: CollectorFactory,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            identity,
            sink,
            policy,
            factory,
            collectors: RwLock::new(Vec::new()),
            lifecycle: Mutex::new(()),
        }
    }

    fn build_generation(&self, config: &MonitorConfig) -> Result<Vec<Arc<CollectorHandle>>, CollectorError> {
        let collectors = (self.factory)(config, &self.identity)?;
        Ok(collectors
            .into_iter()
            .map(|c| Arc::new(CollectorHandle::new(c, self.sink.clone(), self.policy.clone())))
            .collect())
    }

    fn replace_collectors(&self, handles: Vec<Arc<CollectorHandle>>) -> Vec<Arc<CollectorHandle>> {
        std::mem::replace(
            &mut *self.collectors.write().unwrap_or_else(PoisonError::into_inner),
            handles,
        )
    }

    /// Construct the collectors for the current configuration.
    pub async fn initialize(&self) -> Result<usize, CollectorError> {
        let _guard = self.lifecycle.lock().await;

        if !self.collectors().is_empty() {
            tracing::warn!("Collector registry already initialized");
            return Ok(self.collectors().len());
        }

        let config = self.config.read().unwrap_or_else(PoisonError::into_inner).clone();
        let handles = self.build_generation(&config)?;
        let count = handles.len();
        self.replace_collectors(handles);

        tracing::info!(collectors = count, "Collector registry initialized");
        Ok(count)
    }

    /// Start every enabled collector. Each runs its first cycle before this
    /// returns.
    pub async fn start_all(&self) {
        let _guard = self.lifecycle.lock().await;
        start_handles(&self.collectors()).await;
    }

    /// Swap in a new configuration.
    ///
    /// The new generation is built before anything is torn down, so a
    /// construction failure leaves the running collectors untouched. Old
    /// collectors are fully stopped (in-flight cycles included) before the new
    /// ones start. A configuration with no enabled collector is rejected.
    pub async fn reload(&self, config: MonitorConfig) -> Result<usize, CollectorError> {
        let _guard = self.lifecycle.lock().await;
        tracing::info!("Reloading collectors");

        let handles = match self.build_generation(&config) {
            Ok(h) if h.is_empty() => Err(CollectorError::NoCollectors),
            built => built,
        };
        let handles = match handles {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(error = %e, "Collector reload failed, keeping current collectors");
                return Err(e);
            }
        };

        let old = self.collectors();
        stop_handles(&old).await;

        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        self.replace_collectors(handles.clone());

        start_handles(&handles).await;

        tracing::info!(stopped = old.len(), started = handles.len(), "Collector reload complete");
        Ok(handles.len())
    }

    /// Stop and discard every collector.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        let old = self.replace_collectors(Vec::new());
        stop_handles(&old).await;
        tracing::info!(collectors = old.len(), "Collector registry shut down");
    }

    pub fn collectors(&self) -> Vec<Arc<CollectorHandle>> {
        self.collectors.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stats(&self) -> Vec<CollectorStats> {
        self.collectors().iter().map(|c| c.stats()).collect()
    }

    /// Number of collectors with a live timer.
    pub fn active_count(&self) -> usize {
        self.collectors().iter().filter(|c| c.is_running()).count()
    }

    pub fn config(&self) -> MonitorConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

async fn start_handles(handles: &[Arc<CollectorHandle>]) {
    join_all(handles.iter().filter(|h| h.enabled()).map(|h| h.start())).await;
}

async fn stop_handles(handles: &[Arc<CollectorHandle>]) {
    join_all(handles.iter().map(|h| h.stop())).await;
}
