//! Storage manager: buffers results and fans every flush out to all adapters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{StorageAdapter, StorageError};
use crate::collector::ResultSink;
use crate::config::BufferingConfig;
use crate::model::ProbeResult;

#[derive(Debug, Default)]
struct AdapterCounters {
    batches_stored: AtomicU64,
    results_stored: AtomicU64,
    batches_failed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

struct AdapterSlot {
    adapter: Arc<dyn StorageAdapter>,
    counters: AdapterCounters,
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batch_size: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Per-adapter status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStatus {
    pub name: String,
    pub healthy: bool,
    pub batches_stored: u64,
    pub results_stored: u64,
    pub batches_failed: u64,
    pub last_error: Option<String>,
}

/// Point-in-time storage status.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    /// Names of the active adapters.
    pub adapters: Vec<String>,
    pub adapter_stats: Vec<AdapterStatus>,
    pub buffer_size: usize,
    pub last_flush: Option<DateTime<Utc>>,
    /// Adapter name to cheap health flag.
    pub health: BTreeMap<String, bool>,
    pub max_buffer_size: usize,
    pub flush_interval_seconds: u64,
}

/// Decouples probe cadence from persistence cadence.
///
/// Collectors only ever call [`StorageManager::store`]; the buffer is swapped
/// out whole at the start of each flush, so a result lands in exactly one
/// batch.
pub struct StorageManager {
    pending: Mutex<Vec<Arc<dyn StorageAdapter>>>,
    adapters: RwLock<Vec<Arc<AdapterSlot>>>,
    buffer: Mutex<Vec<ProbeResult>>,
    max_buffer_size: usize,
    flush_interval: Duration,
    last_flush: Mutex<Option<DateTime<Utc>>>,
    flushes: AtomicU64,
    token: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl StorageManager {
    pub fn new(buffering: &BufferingConfig, adapters: Vec<Arc<dyn StorageAdapter>>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(adapters),
            adapters: RwLock::new(Vec::new()),
            buffer: Mutex::new(Vec::new()),
            max_buffer_size: buffering.max_buffer_size.max(1),
            flush_interval: buffering.flush_interval(),
            last_flush: Mutex::new(None),
            flushes: AtomicU64::new(0),
            token: CancellationToken::new(),
            timer: Mutex::new(None),
        })
    }

    /// Connect every adapter and start the flush timer.
    ///
    /// Adapters that fail to connect are dropped; with none left the manager
    /// refuses to start.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), StorageError> {
        let candidates = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));

        let connected = join_all(candidates.into_iter().map(|adapter| async move {
            let outcome = adapter.connect().await;
            (adapter, outcome)
        }))
        .await;

        let mut active = Vec::new();
        for (adapter, outcome) in connected {
            match outcome {
                Ok(()) => {
                    tracing::info!(adapter = adapter.name(), "Storage adapter connected");
                    active.push(Arc::new(AdapterSlot {
                        adapter,
                        counters: AdapterCounters::default(),
                    }));
                }
                Err(e) => {
                    tracing::error!(adapter = adapter.name(), error = %e, "Storage adapter failed to connect");
                }
            }
        }

        if active.is_empty() {
            return Err(StorageError::NoAdapters);
        }

        let count = active.len();
        *self.adapters.write().unwrap_or_else(PoisonError::into_inner) = active;
        self.start_timer();

        tracing::info!(
            adapters = count,
            max_buffer_size = self.max_buffer_size,
            flush_interval_secs = self.flush_interval.as_secs(),
            "Storage manager initialized"
        );
        Ok(())
    }

    fn start_timer(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let token = self.token.clone();
        let period = self.flush_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.flush().await;
                    }
                }
            }
        });

        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    fn slots(&self) -> Vec<Arc<AdapterSlot>> {
        self.adapters.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Append results; flush right away once the buffer reaches the threshold.
    pub async fn store(&self, results: Vec<ProbeResult>) {
        if results.is_empty() {
            return;
        }

        let len = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.extend(results);
            buffer.len()
        };

        if len >= self.max_buffer_size {
            tracing::debug!(buffer_size = len, "Buffer threshold reached, flushing");
            self.flush().await;
        }
    }

    /// Take the whole buffer and hand it to every adapter concurrently.
    ///
    /// A failed adapter does not affect the others and the batch is not
    /// re-queued for it.
    pub async fn flush(&self) -> FlushReport {
        let batch = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner));
        if batch.is_empty() {
            return FlushReport::default();
        }

        let batch: Arc<[ProbeResult]> = batch.into();
        let slots = self.slots();
        if slots.is_empty() {
            tracing::error!(batch_size = batch.len(), "No active storage adapters, dropping batch");
            return FlushReport {
                batch_size: batch.len(),
                succeeded: 0,
                failed: 0,
            };
        }

        let outcomes = join_all(slots.iter().map(|slot| {
            let batch = batch.clone();
            async move { slot.adapter.store(batch).await }
        }))
        .await;

        let mut report = FlushReport {
            batch_size: batch.len(),
            ..Default::default()
        };

        for (slot, outcome) in slots.iter().zip(outcomes) {
            let counters = &slot.counters;
            match outcome {
                Ok(()) => {
                    report.succeeded += 1;
                    counters.batches_stored.fetch_add(1, Ordering::Relaxed);
                    counters.results_stored.fetch_add(batch.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    report.failed += 1;
                    counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        adapter = slot.adapter.name(),
                        batch_size = batch.len(),
                        error = %e,
                        "Storage adapter failed to store batch"
                    );
                    *counters.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
                }
            }
        }

        if report.succeeded > 0 {
            *self.last_flush.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            batch_size = report.batch_size,
            succeeded = report.succeeded,
            failed = report.failed,
            "Flushed results"
        );
        report
    }

    /// Stop the timer, drain the buffer, disconnect every adapter.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(timer) = timer {
            // An in-progress timer flush runs to completion.
            if let Err(e) = timer.await {
                tracing::error!(error = %e, "Flush timer ended abnormally");
            }
        }

        self.flush().await;

        let slots = std::mem::take(&mut *self.adapters.write().unwrap_or_else(PoisonError::into_inner));
        let outcomes = join_all(slots.iter().map(|slot| slot.adapter.disconnect())).await;
        for (slot, outcome) in slots.iter().zip(outcomes) {
            match outcome {
                Ok(()) => tracing::info!(adapter = slot.adapter.name(), "Storage adapter disconnected"),
                Err(e) => {
                    tracing::error!(adapter = slot.adapter.name(), error = %e, "Storage adapter failed to disconnect")
                }
            }
        }

        tracing::info!("Storage manager shut down");
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn last_flush(&self) -> Option<DateTime<Utc>> {
        *self.last_flush.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of non-empty flushes performed so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Cheap per-adapter health flags.
    pub fn health(&self) -> BTreeMap<String, bool> {
        self.slots()
            .iter()
            .map(|slot| (slot.adapter.name().to_string(), slot.adapter.health_check()))
            .collect()
    }

    /// Per-adapter health from a real round trip.
    pub async fn deep_health(&self) -> BTreeMap<String, bool> {
        let slots = self.slots();
        let checks = join_all(slots.iter().map(|slot| slot.adapter.is_healthy())).await;
        slots
            .iter()
            .zip(checks)
            .map(|(slot, healthy)| (slot.adapter.name().to_string(), healthy))
            .collect()
    }

    pub fn status(&self) -> StorageStatus {
        let slots = self.slots();
        let adapter_stats: Vec<AdapterStatus> = slots
            .iter()
            .map(|slot| {
                let c = &slot.counters;
                AdapterStatus {
                    name: slot.adapter.name().to_string(),
                    healthy: slot.adapter.health_check(),
                    batches_stored: c.batches_stored.load(Ordering::Relaxed),
                    results_stored: c.results_stored.load(Ordering::Relaxed),
                    batches_failed: c.batches_failed.load(Ordering::Relaxed),
                    last_error: c.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone(),
                }
            })
            .collect::<Vec<_>>();

        StorageStatus {
            adapters: adapter_stats.iter().map(|a| a.name.clone()).collect(),
            health: adapter_stats.iter().map(|a| (a.name.clone(), a.healthy)).collect(),
            adapter_stats,
            buffer_size: self.buffer_size(),
            last_flush: self.last_flush(),
            max_buffer_size: self.max_buffer_size,
            flush_interval_seconds: self.flush_interval.as_secs(),
        }
    }
}

#[async_trait]
impl ResultSink for StorageManager {
    async fn handle(&self, results: Vec<ProbeResult>) {
        self.store(results).await;
    }
}
