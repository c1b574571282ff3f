//! Protocol collectors.
//!
//! A [`Collector`] owns the targets of one protocol and runs one probe cycle
//! over all of them per call to [`Collector::collect`]. A [`CollectorHandle`]
//! wraps a collector with its timer task and forwards every cycle's results to
//! a [`ResultSink`].

mod dns;
mod error;
mod http;
mod ping;
mod registry;
mod tcp;

pub use dns::*;
pub use error::*;
pub use http::*;
pub use ping::*;
pub use registry::*;
pub use tcp::*;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::model::{ErrorType, MonitorType, ProbeResult};
use crate::scheduler::{run_collector_loop, SchedulePolicy};

/// A same-protocol set of targets that can be probed in one cycle.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    fn monitor_type(&self) -> MonitorType;

    fn enabled(&self) -> bool;

    /// Time between the starts of two periodic cycles.
    fn interval(&self) -> Duration;

    fn target_count(&self) -> usize;

    /// Probe every target once. Never fails: per-target problems come back
    /// as unsuccessful results, one per target.
    async fn collect(&self) -> Vec<ProbeResult>;
}

/// Destination of every cycle's results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn handle(&self, results: Vec<ProbeResult>);
}

tokio::task_local! {
    static CONTAINED_PROBE: ();
}

/// True while running inside a single target's probe task, where a panic is
/// converted into a `COLLECTION_ERROR` result instead of ending the process.
pub fn in_contained_probe() -> bool {
    CONTAINED_PROBE.try_with(|_| ()).is_ok()
}

/// Probe every target concurrently, one task per target, and join.
///
/// Output order follows `targets`. A probe task that panics yields the result
/// built by `on_panic` for that target.
pub(crate) async fn fan_out<T, P, Fut, E>(targets: &[T], probe: P, on_panic: E) -> Vec<ProbeResult>
where
    T: Clone + Send + 'static,
    P: Fn(T) -> Fut,
    Fut: Future<Output = ProbeResult> + Send + 'static,
    E: Fn(&T, String) -> ProbeResult,
{
    let handles: Vec<_> = targets
        .iter()
        .cloned()
        .map(|target| tokio::spawn(CONTAINED_PROBE.scope((), probe(target))))
        .collect();

    let joined = join_all(handles).await;

    targets
        .iter()
        .zip(joined)
        .map(|(target, outcome)| match outcome {
            Ok(result) => result,
            Err(e) => {
                let message = if e.is_panic() {
                    let payload = e.into_panic();
                    payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "probe task panicked".to_string())
                } else {
                    e.to_string()
                };
                tracing::warn!(error = %message, "Probe task failed");
                on_panic(target, message)
            }
        })
        .collect()
}

/// Convenience for `on_panic` callbacks.
pub(crate) fn collection_error(base: ProbeResult, message: String) -> ProbeResult {
    base.fail(ErrorType::CollectionError, message)
}

/// Cycle counters for one collector.
#[derive(Debug, Default)]
pub(crate) struct CycleCounters {
    cycles: AtomicU64,
    results: AtomicU64,
    failures: AtomicU64,
    last_cycle_ms: AtomicU64,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl CycleCounters {
    fn record(&self, results: usize, failures: usize, elapsed: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.results.fetch_add(results as u64, Ordering::Relaxed);
        self.failures.fetch_add(failures as u64, Ordering::Relaxed);
        self.last_cycle_ms.store(elapsed.as_millis() as u64, Ordering::Relaxed);
        *self.last_run.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }
}

/// Introspection snapshot of one collector.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorStats {
    pub name: String,
    pub enabled: bool,
    #[serde(rename = "type")]
    pub monitor_type: MonitorType,
    pub target_count: usize,
    pub running: bool,
    pub cycles: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub results_total: u64,
    pub failures_total: u64,
    pub last_cycle_ms: u64,
}

/// A collector bound to its sink and its periodic task.
///
/// A handle belongs to one registry generation: once stopped it is discarded,
/// never restarted.
pub struct CollectorHandle {
    collector: Arc<dyn Collector>,
    sink: Arc<dyn ResultSink>,
    policy: SchedulePolicy,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<CycleCounters>,
}

impl CollectorHandle {
    pub fn new(collector: Arc<dyn Collector>, sink: Arc<dyn ResultSink>, policy: SchedulePolicy) -> Self {
        Self {
            collector,
            sink,
            policy,
            token: CancellationToken::new(),
            task: Mutex::new(None),
            counters: Arc::new(CycleCounters::default()),
        }
    }

    pub fn name(&self) -> &str {
        self.collector.name()
    }

    pub fn monitor_type(&self) -> MonitorType {
        self.collector.monitor_type()
    }

    pub fn enabled(&self) -> bool {
        self.collector.enabled()
    }

    /// Token cancelled when the collector stops; cancelling it stops the timer.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Run one cycle right away, then arm the periodic timer.
    pub async fn start(&self) {
        if !self.collector.enabled() {
            tracing::info!(collector = self.name(), "Collector disabled, not starting");
            return;
        }
        if self.token.is_cancelled() {
            tracing::warn!(collector = self.name(), "Collector already stopped, not restarting");
            return;
        }
        if self.task.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            return;
        }

        tracing::info!(
            collector = self.name(),
            targets = self.collector.target_count(),
            interval_secs = self.collector.interval().as_secs(),
            "Starting collector"
        );

        run_cycle(&self.collector, &self.sink, &self.counters, &self.policy).await;

        let task = tokio::spawn(run_collector_loop(
            self.collector.clone(),
            self.sink.clone(),
            self.counters.clone(),
            self.policy.clone(),
            self.token.clone(),
        ));

        // If stop() raced with the first cycle the loop sees the cancelled
        // token and exits on its own.
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Cancel future cycles and wait for an in-flight cycle to finish.
    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(collector = self.name(), error = %e, "Collector task ended abnormally");
            }
        }
        tracing::info!(collector = self.name(), "Stopped collector");
    }

    pub fn stats(&self) -> CollectorStats {
        let c = &self.counters;
        CollectorStats {
            name: self.name().to_string(),
            enabled: self.enabled(),
            monitor_type: self.monitor_type(),
            target_count: self.collector.target_count(),
            running: self.is_running(),
            cycles: c.cycles.load(Ordering::Relaxed),
            last_run: *c.last_run.lock().unwrap_or_else(PoisonError::into_inner),
            results_total: c.results.load(Ordering::Relaxed),
            failures_total: c.failures.load(Ordering::Relaxed),
            last_cycle_ms: c.last_cycle_ms.load(Ordering::Relaxed),
        }
    }
}

/// One full cycle: collect, log, forward to the sink.
pub(crate) async fn run_cycle(
    collector: &Arc<dyn Collector>,
    sink: &Arc<dyn ResultSink>,
    counters: &CycleCounters,
    policy: &SchedulePolicy,
) {
    let _permit = policy.acquire().await;

    let started = Instant::now();
    let results = collector.collect().await;
    let elapsed = started.elapsed();

    let failures = results.iter().filter(|r| !r.success()).count();
    counters.record(results.len(), failures, elapsed);

    tracing::info!(
        collector = collector.name(),
        results = results.len(),
        failures,
        duration_ms = elapsed.as_millis() as u64,
        "Collection cycle completed"
    );
    for r in &results {
        tracing::debug!(
            monitor = %r.monitor_id,
            success = r.success(),
            response_time_ms = r.response_time,
            error_type = ?r.error_type(),
            "Probe result"
        );
    }

    if !results.is_empty() {
        sink.handle(results).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::model::{monitor_id, AgentIdentity};
    use std::sync::atomic::AtomicUsize;

    pub fn identity() -> Arc<AgentIdentity> {
        Arc::new(AgentIdentity {
            agent_id: "test@localhost".to_string(),
            region: None,
        })
    }

    /// Collector producing `targets` successful results per cycle after `delay`.
    pub struct FakeCollector {
        pub name: String,
        pub targets: usize,
        pub delay: Duration,
        pub interval: Duration,
        pub cycles: AtomicUsize,
        pub completed: AtomicUsize,
    }

    impl FakeCollector {
        pub fn new(name: &str, targets: usize) -> Self {
            Self {
                name: name.to_string(),
                targets,
                delay: Duration::ZERO,
                interval: Duration::from_secs(3600),
                cycles: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Collector for FakeCollector {
        fn name(&self) -> &str {
            &self.name
        }

        fn monitor_type(&self) -> MonitorType {
            MonitorType::Tcp
        }

        fn enabled(&self) -> bool {
            true
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn target_count(&self) -> usize {
            self.targets
        }

        async fn collect(&self) -> Vec<ProbeResult> {
            let cycle = self.cycles.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let identity = identity();
            let results = (0..self.targets)
                .map(|i| {
                    let name = format!("{} {} {}", self.name, cycle, i);
                    ProbeResult::begin(&identity, MonitorType::Tcp, monitor_id("tcp", &name), &name, "127.0.0.1")
                })
                .collect();
            self.completed.fetch_add(1, Ordering::SeqCst);
            results
        }
    }

    /// Sink that keeps everything it receives.
    #[derive(Default)]
    pub struct CaptureSink {
        pub received: Mutex<Vec<ProbeResult>>,
    }

    impl CaptureSink {
        pub fn len(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ResultSink for CaptureSink {
        async fn handle(&self, results: Vec<ProbeResult>) {
            self.received.lock().unwrap().extend(results);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::model::{monitor_id, MonitorType};

    #[tokio::test]
    async fn test_start_runs_first_cycle_through_sink() {
        let collector = Arc::new(FakeCollector::new("fake", 3));
        let sink = Arc::new(CaptureSink::default());
        let handle = CollectorHandle::new(collector.clone(), sink.clone(), SchedulePolicy::default());

        handle.start().await;
        assert_eq!(sink.len(), 3);
        assert_eq!(handle.stats().cycles, 1);
        assert!(handle.is_running());

        handle.stop().await;
        assert!(!handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_cycles_stop_after_stop() {
        let mut fake = FakeCollector::new("fake", 1);
        fake.interval = Duration::from_secs(10);
        let collector = Arc::new(fake);
        let sink = Arc::new(CaptureSink::default());
        let handle = CollectorHandle::new(collector.clone(), sink.clone(), SchedulePolicy::default());

        handle.start().await;
        tokio::time::sleep(Duration::from_secs(25)).await;
        let cycles = collector.cycles.load(Ordering::SeqCst);
        assert_eq!(cycles, 3);

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(collector.cycles.load(Ordering::SeqCst), cycles);
        assert_eq!(sink.len(), cycles);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_cycle() {
        let mut fake = FakeCollector::new("slow", 2);
        fake.interval = Duration::from_secs(5);
        fake.delay = Duration::from_secs(3);
        let collector = Arc::new(fake);
        let sink = Arc::new(CaptureSink::default());
        let handle = CollectorHandle::new(collector.clone(), sink.clone(), SchedulePolicy::default());

        handle.start().await; // first cycle: 3s
        tokio::time::sleep(Duration::from_secs(6)).await; // second cycle in flight
        assert_eq!(collector.cycles.load(Ordering::SeqCst), 2);
        assert_eq!(collector.completed.load(Ordering::SeqCst), 1);

        handle.stop().await;
        assert_eq!(collector.completed.load(Ordering::SeqCst), 2);
        assert_eq!(sink.len(), 4);
    }

    #[tokio::test]
    async fn test_fan_out_converts_panic_to_collection_error() {
        let identity = identity();
        let targets = vec!["good".to_string(), "bad".to_string()];
        let id = identity.clone();
        let results = fan_out(
            &targets,
            move |name: String| {
                let identity = id.clone();
                async move {
                    if name == "bad" {
                        panic!("probe exploded");
                    }
                    ProbeResult::begin(&identity, MonitorType::Tcp, monitor_id("tcp", &name), &name, "h")
                }
            },
            |name, message| {
                let base = ProbeResult::begin(&identity, MonitorType::Tcp, monitor_id("tcp", name), name, "h");
                collection_error(base, message)
            },
        )
        .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].success());
        assert!(!results[1].success());
        assert_eq!(results[1].error_type(), Some(ErrorType::CollectionError));
        assert_eq!(results[1].error_message(), Some("probe exploded"));
    }
}
