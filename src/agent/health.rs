//! Process resource sampling for the health snapshot.

use std::sync::{Arc, Mutex, PoisonError};

use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

/// Resident memory and CPU usage of this process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessSample {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

impl ProcessSample {
    pub fn memory_mb(&self) -> f64 {
        let mb = self.memory_bytes as f64 / (1024.0 * 1024.0);
        (mb * 100.0).round() / 100.0
    }
}

/// Keeps one `System` alive between samples; CPU usage is measured against the
/// previous refresh, so the first sample always reports 0%.
pub struct ProcessSampler {
    pid: Option<Pid>,
    system: Arc<Mutex<System>>,
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            system: Arc::new(Mutex::new(System::new_with_specifics(RefreshKind::nothing()))),
        }
    }

    /// Refresh and read the current process on the blocking pool.
    pub async fn sample(&self) -> ProcessSample {
        let Some(pid) = self.pid else {
            return ProcessSample::default();
        };
        let system = self.system.clone();

        let join = tokio::task::spawn_blocking(move || {
            let mut system = system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                false,
                ProcessRefreshKind::nothing().with_memory().with_cpu(),
            );
            system
                .process(pid)
                .map(|p: &Process| ProcessSample {
                    memory_bytes: p.memory(),
                    cpu_percent: p.cpu_usage(),
                })
                .unwrap_or_default()
        });

        match join.await {
            Ok(sample) => sample,
            Err(e) => {
                tracing::debug!(error = %e, "Process sample task failed");
                ProcessSample::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_mb_rounding() {
        let sample = ProcessSample {
            memory_bytes: 3 * 1024 * 1024 + 512 * 1024,
            cpu_percent: 0.0,
        };
        assert_eq!(sample.memory_mb(), 3.5);
    }

    #[tokio::test]
    async fn test_sample_reads_own_process() {
        let sampler = ProcessSampler::new();
        let sample = sampler.sample().await;
        assert!(sample.memory_bytes > 0);
        assert!(sample.cpu_percent >= 0.0);
    }
}
