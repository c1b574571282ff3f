//! Scheduler module: periodic collector loops and the central scheduling policy.
//!
//! Collectors are self-scheduling through [`CollectorHandle`]; the
//! [`Scheduler`] tracks their cancellation tokens and owns the
//! [`SchedulePolicy`] every loop consults before a cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::collector::{run_cycle, Collector, CollectorHandle, CycleCounters, ResultSink};
use crate::config::SchedulerConfig;

/// Policy applied to every periodic cycle: random start delay and a global
/// cap on concurrently running cycles.
#[derive(Debug, Clone, Default)]
pub struct SchedulePolicy {
    max_jitter: Duration,
    permits: Option<Arc<Semaphore>>,
    max_concurrent: usize,
}

impl SchedulePolicy {
    /// `max_concurrent == 0` means unlimited.
    pub fn new(max_jitter: Duration, max_concurrent: usize) -> Self {
        Self {
            max_jitter,
            permits: (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent))),
            max_concurrent,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(Duration::from_secs(config.max_jitter_seconds), config.max_concurrent_cycles)
    }

    /// Random delay in `[0, max_jitter]`.
    pub fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Wait for a cycle slot. `None` when cycles are unbounded.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match &self.permits {
            Some(permits) => permits.clone().acquire_owned().await.ok(),
            None => None,
        }
    }

    pub fn max_jitter(&self) -> Duration {
        self.max_jitter
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        (self.max_concurrent > 0).then_some(self.max_concurrent)
    }
}

/// Periodic loop of one collector, started after its first cycle.
///
/// Cancellation is checked only between cycles: a cycle already running
/// finishes and hands its results to the sink.
pub(crate) async fn run_collector_loop(
    collector: Arc<dyn Collector>,
    sink: Arc<dyn ResultSink>,
    counters: Arc<CycleCounters>,
    policy: SchedulePolicy,
    token: CancellationToken,
) {
    let period = collector.interval();
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let delay = policy.jitter();
        if !delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        run_cycle(&collector, &sink, &counters, &policy).await;
    }

    tracing::debug!(collector = collector.name(), "Collector loop exited");
}

struct Tracked {
    name: String,
    token: CancellationToken,
}

/// Aggregate scheduler status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub tracked_collectors: usize,
    pub collectors: Vec<String>,
    pub max_jitter_seconds: u64,
    pub max_concurrent_cycles: Option<usize>,
}

/// Registry of self-scheduling collectors.
pub struct Scheduler {
    policy: SchedulePolicy,
    tracked: Mutex<Vec<Tracked>>,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(policy: SchedulePolicy) -> Self {
        Self {
            policy,
            tracked: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Scheduler started");
    }

    /// Record that a collector schedules itself.
    pub fn schedule_collector(&self, handle: &CollectorHandle) {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        if tracked.iter().any(|t| t.name == handle.name()) {
            return;
        }
        tracing::debug!(collector = handle.name(), "Scheduler: tracking collector");
        tracked.push(Tracked {
            name: handle.name().to_string(),
            token: handle.token().clone(),
        });
    }

    /// Replace the tracked set after a registry reload.
    pub fn retrack(&self, handles: &[Arc<CollectorHandle>]) {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner).clear();
        for handle in handles.iter().filter(|h| h.enabled()) {
            self.schedule_collector(handle);
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            tracked_collectors: tracked.len(),
            collectors: tracked.iter().map(|t| t.name.clone()).collect(),
            max_jitter_seconds: self.policy.max_jitter().as_secs(),
            max_concurrent_cycles: self.policy.max_concurrent(),
        }
    }

    /// Cancel every tracked timer. In-flight cycles still complete.
    pub fn stop(&self) {
        let tracked: Vec<Tracked> = std::mem::take(&mut *self.tracked.lock().unwrap_or_else(PoisonError::into_inner));
        for t in &tracked {
            t.token.cancel();
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(collectors = tracked.len(), "Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing::{CaptureSink, FakeCollector};

    #[test]
    fn test_policy_defaults_unbounded() {
        let policy = SchedulePolicy::default();
        assert_eq!(policy.jitter(), Duration::ZERO);
        assert_eq!(policy.max_concurrent(), None);
    }

    #[test]
    fn test_jitter_within_bound() {
        let policy = SchedulePolicy::new(Duration::from_secs(2), 0);
        for _ in 0..50 {
            assert!(policy.jitter() <= Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn test_acquire_bounds_concurrency() {
        let policy = SchedulePolicy::new(Duration::ZERO, 1);
        let first = policy.acquire().await;
        assert!(first.is_some());

        let blocked = tokio::time::timeout(Duration::from_millis(50), policy.acquire()).await;
        assert!(blocked.is_err());

        drop(first);
        assert!(policy.acquire().await.is_some());
    }

    #[tokio::test]
    async fn test_tracks_and_stops_collectors() {
        let sink = Arc::new(CaptureSink::default());
        let handle = CollectorHandle::new(Arc::new(FakeCollector::new("a", 1)), sink, SchedulePolicy::default());

        let scheduler = Scheduler::new(SchedulePolicy::new(Duration::from_secs(3), 4));
        scheduler.start();
        scheduler.schedule_collector(&handle);
        scheduler.schedule_collector(&handle);

        let status = scheduler.status();
        assert!(status.running);
        assert_eq!(status.tracked_collectors, 1);
        assert_eq!(status.max_jitter_seconds, 3);
        assert_eq!(status.max_concurrent_cycles, Some(4));

        scheduler.stop();
        assert!(handle.token().is_cancelled());
        assert!(!scheduler.status().running);
        assert_eq!(scheduler.status().tracked_collectors, 0);
    }
}
