//! Prometheus metrics for the render worker.

use std::net::{Ipv4Addr, SocketAddr};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vrender_gpu::LedgerEvent;

/// Install the Prometheus recorder with an HTTP listener on `port`.
///
/// Must be called from within a Tokio runtime.
pub fn install_prometheus(port: u16) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .install()
}

/// Metric names as constants for consistency.
pub mod names {
    // Jobs
    pub const JOBS_STARTED_TOTAL: &str = "vrender_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "vrender_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "vrender_jobs_failed_total";
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "vrender_jobs_dead_lettered_total";
    pub const JOBS_IN_FLIGHT: &str = "vrender_jobs_in_flight";

    // Durations
    pub const RENDER_DURATION_SECONDS: &str = "vrender_render_duration_seconds";
    pub const ADMISSION_WAIT_SECONDS: &str = "vrender_admission_wait_seconds";

    // GPU ledger
    pub const GPU_ALLOCATIONS_ACTIVE: &str = "vrender_gpu_allocations_active";
    pub const GPU_RESERVED_MEMORY_MB: &str = "vrender_gpu_reserved_memory_mb";
    pub const GPU_LIMIT_WARNINGS_TOTAL: &str = "vrender_gpu_limit_warnings_total";
    pub const GPU_STALE_RELEASES_TOTAL: &str = "vrender_gpu_stale_releases_total";

    // Processes
    pub const PROCESS_LIMIT_EXCEEDED_TOTAL: &str = "vrender_process_limit_exceeded_total";
}

pub fn record_job_started() {
    counter!(names::JOBS_STARTED_TOTAL).increment(1);
}

pub fn record_job_completed(duration_secs: f64) {
    counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
    histogram!(names::RENDER_DURATION_SECONDS).record(duration_secs);
}

pub fn record_job_failed(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_job_dead_lettered() {
    counter!(names::JOBS_DEAD_LETTERED_TOTAL).increment(1);
}

pub fn set_jobs_in_flight(count: usize) {
    gauge!(names::JOBS_IN_FLIGHT).set(count as f64);
}

pub fn record_admission_wait(wait_secs: f64) {
    histogram!(names::ADMISSION_WAIT_SECONDS).record(wait_secs);
}

pub fn record_limit_exceeded(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::PROCESS_LIMIT_EXCEEDED_TOTAL, &labels).increment(1);
}

/// Ledger occupancy mirrored from [`LedgerEvent`]s.
#[derive(Debug, Default)]
pub struct LedgerGauges {
    allocations: u64,
    reserved_mb: u64,
}

impl LedgerGauges {
    pub fn apply(&mut self, event: &LedgerEvent) {
        match event {
            LedgerEvent::Allocated(allocation) => {
                self.allocations += 1;
                self.reserved_mb += allocation.reserved_memory_mb;
            }
            LedgerEvent::Released { allocation, reason } => {
                self.allocations = self.allocations.saturating_sub(1);
                self.reserved_mb = self.reserved_mb.saturating_sub(allocation.reserved_memory_mb);
                if *reason == vrender_gpu::ReleaseReason::Stale {
                    counter!(names::GPU_STALE_RELEASES_TOTAL).increment(1);
                }
            }
            LedgerEvent::LimitWarning {
                device_index, kind, ..
            } => {
                let labels = [
                    ("device", device_index.to_string()),
                    ("kind", format!("{:?}", kind).to_lowercase()),
                ];
                counter!(names::GPU_LIMIT_WARNINGS_TOTAL, &labels).increment(1);
            }
            LedgerEvent::LimitsUpdated(_) => {}
        }

        gauge!(names::GPU_ALLOCATIONS_ACTIVE).set(self.allocations as f64);
        gauge!(names::GPU_RESERVED_MEMORY_MB).set(self.reserved_mb as f64);
    }

    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn reserved_mb(&self) -> u64 {
        self.reserved_mb
    }
}

/// Follow the ledger's audit channel and keep the GPU gauges current.
pub fn spawn_ledger_metrics(mut events: broadcast::Receiver<LedgerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut gauges = LedgerGauges::default();
        loop {
            match events.recv().await {
                Ok(event) => {
                    debug!(event = event.name(), "Ledger event");
                    gauges.apply(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Ledger metrics lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vrender_gpu::{LimitKind, ReleaseReason};
    use vrender_models::{Allocation, JobId};

    fn allocation(job: &str, mb: u64) -> Allocation {
        Allocation {
            job_id: JobId::from_string(job),
            device_index: 0,
            reserved_memory_mb: mb,
            created_at: Utc::now(),
            priority: 0,
        }
    }

    #[test]
    fn test_ledger_gauges_follow_events() {
        let mut gauges = LedgerGauges::default();

        gauges.apply(&LedgerEvent::Allocated(allocation("a", 4096)));
        gauges.apply(&LedgerEvent::Allocated(allocation("b", 2048)));
        assert_eq!(gauges.allocations(), 2);
        assert_eq!(gauges.reserved_mb(), 6144);

        gauges.apply(&LedgerEvent::Released {
            allocation: allocation("a", 4096),
            reason: ReleaseReason::Stale,
        });
        gauges.apply(&LedgerEvent::LimitWarning {
            device_index: 0,
            kind: LimitKind::Temperature,
            value: 91.0,
            limit: 85.0,
        });
        assert_eq!(gauges.allocations(), 1);
        assert_eq!(gauges.reserved_mb(), 2048);
    }

    #[tokio::test]
    async fn test_ledger_metrics_task_stops_when_ledger_is_gone() {
        let (tx, rx) = broadcast::channel(4);
        let task = spawn_ledger_metrics(rx);

        tx.send(LedgerEvent::Allocated(allocation("a", 1024))).unwrap();
        drop(tx);

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("task should exit")
            .unwrap();
    }
}
