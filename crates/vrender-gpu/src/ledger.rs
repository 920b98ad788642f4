//! Resource ledger: admission control over GPU memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use vrender_models::{Allocation, Device, JobId, LedgerSummary, LimitsUpdate, ResourceLimits};

use crate::error::{GpuError, GpuResult};
use crate::events::{LedgerEvent, LimitKind, ReleaseReason};
use crate::telemetry::TelemetrySource;

/// Default interval between admission attempts while waiting for capacity.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 256;

/// Admission interface used by the render coordinator.
///
/// [`ResourceLedger`] is the production implementation.
#[async_trait]
pub trait ResourceAllocator: Send + Sync {
    /// Current admission limits.
    async fn limits(&self) -> ResourceLimits;

    /// Admit the job on the best fitting device, or `None` when nothing fits right now.
    async fn try_allocate(
        &self,
        job_id: &JobId,
        requested_mb: u64,
        priority: i32,
    ) -> GpuResult<Option<Allocation>>;

    /// Drop the job's allocation. Unknown ids are a no-op.
    async fn release(&self, job_id: &JobId) -> Option<Allocation>;

    /// Retry [`try_allocate`](Self::try_allocate) until it succeeds or `timeout` elapses.
    ///
    /// Only the calling task sleeps between attempts. Telemetry failures are
    /// returned to the caller rather than retried here.
    async fn wait_for_allocation(
        &self,
        job_id: &JobId,
        requested_mb: u64,
        priority: i32,
        timeout: Duration,
        poll_interval: Duration,
    ) -> GpuResult<Allocation> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if let Some(allocation) = self.try_allocate(job_id, requested_mb, priority).await? {
                return Ok(allocation);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(GpuError::AllocationTimedOut {
                    job_id: job_id.clone(),
                    requested_mb,
                    waited_secs: started.elapsed().as_secs(),
                });
            }

            debug!(
                job_id = %job_id,
                requested_mb,
                "No GPU capacity yet, retrying in {:?}",
                poll_interval
            );
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    devices: Vec<Device>,
    taken_at: Instant,
}

#[derive(Debug, Default)]
struct LedgerState {
    allocations: HashMap<JobId, Allocation>,
    limits: ResourceLimits,
    snapshot: Option<Snapshot>,
}

impl LedgerState {
    fn reserved_on(&self, device_index: u32) -> u64 {
        self.allocations
            .values()
            .filter(|a| a.device_index == device_index)
            .map(|a| a.reserved_memory_mb)
            .sum()
    }

    /// Best device for `requested_mb`, or `None`.
    ///
    /// A device qualifies when the ledger's own reservations plus the request fit
    /// under `total - headroom`, the driver reports at least `requested_mb` free,
    /// and utilization and temperature are below their limits. Ties go to the
    /// lowest index.
    fn select_device<'a>(&self, devices: &'a [Device], requested_mb: u64) -> Option<&'a Device> {
        let limits = &self.limits;
        let mut best: Option<(&Device, f64)> = None;

        for device in devices {
            let reserved = self.reserved_on(device.index);
            if reserved + requested_mb > limits.reservable_on(device.total_memory_mb) {
                continue;
            }
            if device.free_memory_mb < requested_mb {
                continue;
            }
            if matches!(device.utilization_percent, Some(u) if u >= limits.max_utilization_percent) {
                continue;
            }
            if matches!(device.temperature_c, Some(t) if t >= limits.max_temperature_c) {
                continue;
            }

            let score = device.free_memory_mb as f64
                - reserved as f64
                - device.utilization_percent.unwrap_or(0.0) as f64;
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((device, score));
            }
        }

        best.map(|(device, _)| device)
    }
}

/// Authoritative record of which job holds how much memory on which GPU.
///
/// Shared behind an `Arc`. The admission decision and its commit happen under one
/// lock, so concurrent admissions are first-commit-wins and the per-device sum of
/// reservations never exceeds `total - headroom`.
pub struct ResourceLedger {
    telemetry: Arc<dyn TelemetrySource>,
    state: Mutex<LedgerState>,
    events: broadcast::Sender<LedgerEvent>,
    snapshot_ttl: Duration,
}

impl ResourceLedger {
    pub fn new(telemetry: Arc<dyn TelemetrySource>, limits: ResourceLimits) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            telemetry,
            state: Mutex::new(LedgerState {
                limits,
                ..Default::default()
            }),
            events,
            snapshot_ttl: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How long [`summary`](Self::summary) may reuse the last snapshot.
    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl = ttl;
        self
    }

    /// Subscribe to audit events.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LedgerEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Poll telemetry and cache the snapshot.
    pub async fn refresh(&self) -> GpuResult<Vec<Device>> {
        let devices = self.telemetry.devices().await?;

        let limits = {
            let mut state = self.state.lock().await;
            state.snapshot = Some(Snapshot {
                devices: devices.clone(),
                taken_at: Instant::now(),
            });
            state.limits.clone()
        };

        self.warn_on_limits(&devices, &limits);
        Ok(devices)
    }

    fn warn_on_limits(&self, devices: &[Device], limits: &ResourceLimits) {
        for device in devices {
            if let Some(utilization) = device.utilization_percent {
                if utilization >= limits.max_utilization_percent {
                    debug!(device = device.index, utilization, "GPU at utilization limit");
                    self.emit(LedgerEvent::LimitWarning {
                        device_index: device.index,
                        kind: LimitKind::Utilization,
                        value: utilization,
                        limit: limits.max_utilization_percent,
                    });
                }
            }
            if let Some(temp) = device.temperature_c {
                if temp >= limits.max_temperature_c {
                    debug!(device = device.index, temperature = temp, "GPU at temperature limit");
                    self.emit(LedgerEvent::LimitWarning {
                        device_index: device.index,
                        kind: LimitKind::Temperature,
                        value: temp,
                        limit: limits.max_temperature_c,
                    });
                }
            }
        }
    }

    /// Admit `job_id` for `requested_mb` on the best qualifying device.
    ///
    /// Always re-polls telemetry first. Returns the existing allocation unchanged
    /// when the job already holds one.
    pub async fn try_allocate(
        &self,
        job_id: &JobId,
        requested_mb: u64,
        priority: i32,
    ) -> GpuResult<Option<Allocation>> {
        {
            let state = self.state.lock().await;
            if let Some(existing) = state.allocations.get(job_id) {
                return Ok(Some(existing.clone()));
            }
            if requested_mb > state.limits.max_reservable_memory_mb {
                warn!(
                    job_id = %job_id,
                    requested_mb,
                    max_mb = state.limits.max_reservable_memory_mb,
                    "Request exceeds reservable memory limit"
                );
                return Ok(None);
            }
        }

        let devices = self.refresh().await?;

        let mut state = self.state.lock().await;
        // Another task may have admitted the same job while we polled
        if let Some(existing) = state.allocations.get(job_id) {
            return Ok(Some(existing.clone()));
        }

        let Some(device) = state.select_device(&devices, requested_mb) else {
            debug!(job_id = %job_id, requested_mb, "No GPU can fit request");
            return Ok(None);
        };

        let allocation = Allocation {
            job_id: job_id.clone(),
            device_index: device.index,
            reserved_memory_mb: requested_mb,
            created_at: Utc::now(),
            priority,
        };
        state.allocations.insert(job_id.clone(), allocation.clone());
        drop(state);

        info!(
            job_id = %job_id,
            device = allocation.device_index,
            reserved_mb = requested_mb,
            "GPU memory allocated"
        );
        self.emit(LedgerEvent::Allocated(allocation.clone()));
        Ok(Some(allocation))
    }

    /// Release the job's allocation. Idempotent.
    pub async fn release(&self, job_id: &JobId) -> Option<Allocation> {
        let removed = self.state.lock().await.allocations.remove(job_id);

        if let Some(allocation) = &removed {
            info!(
                job_id = %job_id,
                device = allocation.device_index,
                reserved_mb = allocation.reserved_memory_mb,
                "GPU memory released"
            );
            self.emit(LedgerEvent::Released {
                allocation: allocation.clone(),
                reason: ReleaseReason::Explicit,
            });
        }

        removed
    }

    pub async fn allocation(&self, job_id: &JobId) -> Option<Allocation> {
        self.state.lock().await.allocations.get(job_id).cloned()
    }

    /// All current allocations, oldest first.
    pub async fn allocations(&self) -> Vec<Allocation> {
        let state = self.state.lock().await;
        let mut all: Vec<Allocation> = state.allocations.values().cloned().collect();
        all.sort_by_key(|a| a.created_at);
        all
    }

    pub async fn limits(&self) -> ResourceLimits {
        self.state.lock().await.limits.clone()
    }

    /// Aggregate view. Reuses the cached snapshot when it is fresh enough.
    pub async fn summary(&self) -> GpuResult<LedgerSummary> {
        let cached = {
            let state = self.state.lock().await;
            state
                .snapshot
                .as_ref()
                .filter(|s| s.taken_at.elapsed() < self.snapshot_ttl)
                .map(|s| s.devices.clone())
        };

        let devices = match cached {
            Some(devices) => devices,
            None => self.refresh().await?,
        };

        let state = self.state.lock().await;
        let reported: Vec<f32> = devices.iter().filter_map(|d| d.utilization_percent).collect();
        let average_utilization = if reported.is_empty() {
            0.0
        } else {
            reported.iter().sum::<f32>() / reported.len() as f32
        };

        Ok(LedgerSummary {
            device_count: devices.len(),
            total_memory_mb: devices.iter().map(|d| d.total_memory_mb).sum(),
            free_memory_mb: devices.iter().map(|d| d.free_memory_mb).sum(),
            used_memory_mb: devices.iter().map(|d| d.used_memory_mb).sum(),
            allocation_count: state.allocations.len(),
            reserved_memory_mb: state.allocations.values().map(|a| a.reserved_memory_mb).sum(),
            average_utilization,
        })
    }

    /// Replace the named limit fields. Existing allocations are kept.
    pub async fn update_limits(&self, update: &LimitsUpdate) -> ResourceLimits {
        let limits = {
            let mut state = self.state.lock().await;
            update.apply_to(&mut state.limits);
            state.limits.clone()
        };

        info!(?limits, "Resource limits updated");
        self.emit(LedgerEvent::LimitsUpdated(limits.clone()));
        limits
    }

    /// Release allocations older than `max_age` whose job `is_job_alive` reports dead.
    ///
    /// Returns the released job ids.
    pub async fn cleanup_stale<F>(&self, max_age: Duration, is_job_alive: F) -> Vec<JobId>
    where
        F: Fn(&JobId) -> bool,
    {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);

        let stale: Vec<Allocation> = {
            let mut state = self.state.lock().await;
            let ids: Vec<JobId> = state
                .allocations
                .values()
                .filter(|a| now - a.created_at >= max_age && !is_job_alive(&a.job_id))
                .map(|a| a.job_id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.allocations.remove(id))
                .collect()
        };

        for allocation in &stale {
            warn!(
                job_id = %allocation.job_id,
                device = allocation.device_index,
                reserved_mb = allocation.reserved_memory_mb,
                "Released stale GPU allocation"
            );
            self.emit(LedgerEvent::Released {
                allocation: allocation.clone(),
                reason: ReleaseReason::Stale,
            });
        }

        stale.into_iter().map(|a| a.job_id).collect()
    }
}

#[async_trait]
impl ResourceAllocator for ResourceLedger {
    async fn limits(&self) -> ResourceLimits {
        ResourceLedger::limits(self).await
    }

    async fn try_allocate(
        &self,
        job_id: &JobId,
        requested_mb: u64,
        priority: i32,
    ) -> GpuResult<Option<Allocation>> {
        ResourceLedger::try_allocate(self, job_id, requested_mb, priority).await
    }

    async fn release(&self, job_id: &JobId) -> Option<Allocation> {
        ResourceLedger::release(self, job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::StaticTelemetry;

    fn device(index: u32, total: u64, free: u64, utilization: f32) -> Device {
        Device {
            index,
            name: format!("GPU {}", index),
            total_memory_mb: total,
            free_memory_mb: free,
            used_memory_mb: total - free,
            utilization_percent: Some(utilization),
            temperature_c: Some(40.0),
            power_draw_w: None,
        }
    }

    fn limits(headroom: u64) -> ResourceLimits {
        ResourceLimits {
            max_reservable_memory_mb: 16 * 1024,
            max_utilization_percent: 90.0,
            max_temperature_c: 85.0,
            reserved_headroom_mb: headroom,
        }
    }

    fn ledger_with(devices: Vec<Device>, headroom: u64) -> (Arc<StaticTelemetry>, ResourceLedger) {
        let telemetry = Arc::new(StaticTelemetry::new(devices));
        let ledger = ResourceLedger::new(telemetry.clone(), limits(headroom));
        (telemetry, ledger)
    }

    #[tokio::test]
    async fn test_headroom_scenario() {
        let (_, ledger) = ledger_with(vec![device(0, 8192, 8192, 0.0)], 1024);

        let first = ledger.try_allocate(&"a".into(), 6144, 0).await.unwrap();
        assert_eq!(first.map(|a| a.device_index), Some(0));

        let second = ledger.try_allocate(&"b".into(), 2048, 0).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_allocation_returns_existing() {
        let (_, ledger) = ledger_with(vec![device(0, 8192, 8192, 0.0)], 0);
        let job: JobId = "dup".into();

        let first = ledger.try_allocate(&job, 1024, 1).await.unwrap().unwrap();
        let second = ledger.try_allocate(&job, 4096, 9).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.allocations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (_, ledger) = ledger_with(vec![device(0, 8192, 8192, 0.0)], 0);
        let job: JobId = "r".into();
        let mut events = ledger.subscribe();

        ledger.try_allocate(&job, 1024, 0).await.unwrap();
        assert!(ledger.release(&job).await.is_some());
        assert!(ledger.release(&job).await.is_none());
        assert!(ledger.release(&"never".into()).await.is_none());

        assert_eq!(events.recv().await.unwrap().name(), "allocated");
        assert_eq!(events.recv().await.unwrap().name(), "released");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_picks_device_with_most_net_free_memory() {
        let (_, ledger) = ledger_with(
            vec![device(0, 16384, 4096, 10.0), device(1, 16384, 12000, 10.0)],
            0,
        );
        let allocation = ledger.try_allocate(&"j".into(), 2048, 0).await.unwrap().unwrap();
        assert_eq!(allocation.device_index, 1);
    }

    #[tokio::test]
    async fn test_reservations_steer_away_before_telemetry_catches_up() {
        let (_, ledger) = ledger_with(
            vec![device(0, 16384, 16000, 0.0), device(1, 16384, 15000, 0.0)],
            0,
        );
        let a = ledger.try_allocate(&"a".into(), 4096, 0).await.unwrap().unwrap();
        let b = ledger.try_allocate(&"b".into(), 4096, 0).await.unwrap().unwrap();

        assert_eq!(a.device_index, 0);
        // Device 0 now scores 16000 - 4096 below device 1's 15000
        assert_eq!(b.device_index, 1);
    }

    #[tokio::test]
    async fn test_skips_hot_and_busy_devices() {
        let mut hot = device(0, 16384, 16384, 0.0);
        hot.temperature_c = Some(90.0);
        let busy = device(1, 16384, 16384, 95.0);
        let (telemetry, ledger) = ledger_with(vec![hot, busy], 0);
        let mut events = ledger.subscribe();

        assert!(ledger.try_allocate(&"j".into(), 1024, 0).await.unwrap().is_none());

        let mut kinds = Vec::new();
        while let Ok(LedgerEvent::LimitWarning { kind, .. }) = events.try_recv() {
            kinds.push(kind);
        }
        assert!(kinds.contains(&LimitKind::Temperature));
        assert!(kinds.contains(&LimitKind::Utilization));

        telemetry.set_devices(vec![device(0, 16384, 16384, 0.0)]);
        assert!(ledger.try_allocate(&"j".into(), 1024, 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_device_without_utilization_is_admitted() {
        let mut mig = device(0, 16384, 16384, 0.0);
        mig.utilization_percent = None;
        let (_, ledger) = ledger_with(vec![mig], 0);
        let mut events = ledger.subscribe();

        let allocation = ledger.try_allocate(&"j".into(), 4096, 0).await.unwrap();
        assert_eq!(allocation.map(|a| a.device_index), Some(0));
        assert_eq!(events.recv().await.unwrap().name(), "allocated");
        assert_eq!(ledger.summary().await.unwrap().average_utilization, 0.0);
    }

    #[tokio::test]
    async fn test_reported_free_memory_must_cover_request() {
        // Another host process holds most of the memory
        let (_, ledger) = ledger_with(vec![device(0, 8192, 1000, 0.0)], 0);
        assert!(ledger.try_allocate(&"j".into(), 2048, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_over_max_reservable_is_rejected() {
        let (_, ledger) = ledger_with(vec![device(0, 65536, 65536, 0.0)], 0);
        let result = ledger.try_allocate(&"big".into(), 20 * 1024, 0).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_telemetry_failure_propagates() {
        let (telemetry, ledger) = ledger_with(vec![device(0, 8192, 8192, 0.0)], 0);
        telemetry.set_unavailable(Some("nvidia-smi crashed"));

        let err = ledger.try_allocate(&"j".into(), 1024, 0).await.unwrap_err();
        assert!(matches!(err, GpuError::TelemetryUnavailable(_)));
        assert!(ledger.allocations().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_device_list_is_not_an_error() {
        let (_, ledger) = ledger_with(Vec::new(), 0);
        assert!(ledger.refresh().await.unwrap().is_empty());
        assert!(ledger.try_allocate(&"j".into(), 1, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_admission_never_oversubscribes() {
        let (_, ledger) = ledger_with(vec![device(0, 8192, 8192, 0.0)], 1024);
        let ledger = Arc::new(ledger);

        let attempts = (0..20).map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .try_allocate(&JobId::from_string(format!("job-{}", i)), 1024, 0)
                    .await
                    .unwrap()
            })
        });
        let results = futures::future::join_all(attempts).await;

        let admitted = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(_))))
            .count();
        assert_eq!(admitted, 7);

        let reserved: u64 = ledger
            .allocations()
            .await
            .iter()
            .map(|a| a.reserved_memory_mb)
            .sum();
        assert!(reserved <= 8192 - 1024);
    }

    #[tokio::test]
    async fn test_wait_for_allocation_succeeds_after_release() {
        let (_, ledger) = ledger_with(vec![device(0, 8192, 8192, 0.0)], 1024);
        let ledger = Arc::new(ledger);
        ledger.try_allocate(&"holder".into(), 6144, 0).await.unwrap();

        let releaser = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ledger.release(&"holder".into()).await;
            })
        };

        let allocation = ledger
            .wait_for_allocation(
                &"waiter".into(),
                2048,
                0,
                Duration::from_secs(2),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert_eq!(allocation.job_id, JobId::from("waiter"));
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_allocation_times_out() {
        let (_, ledger) = ledger_with(vec![device(0, 4096, 4096, 0.0)], 0);
        let err = ledger
            .wait_for_allocation(
                &"j".into(),
                8192,
                0,
                Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GpuError::AllocationTimedOut { .. }));
    }

    #[tokio::test]
    async fn test_update_limits_does_not_revoke() {
        let (_, ledger) = ledger_with(vec![device(0, 8192, 8192, 0.0)], 0);
        ledger.try_allocate(&"a".into(), 4096, 0).await.unwrap();

        let limits = ledger
            .update_limits(&LimitsUpdate {
                reserved_headroom_mb: Some(6000),
                ..Default::default()
            })
            .await;
        assert_eq!(limits.reserved_headroom_mb, 6000);
        assert_eq!(ledger.allocations().await.len(), 1);
        assert!(ledger.try_allocate(&"b".into(), 1024, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_stale_only_releases_dead_jobs() {
        let (_, ledger) = ledger_with(vec![device(0, 16384, 16384, 0.0)], 0);
        ledger.try_allocate(&"alive".into(), 1024, 0).await.unwrap();
        ledger.try_allocate(&"dead".into(), 1024, 0).await.unwrap();

        // Nothing is old enough yet
        assert!(ledger.cleanup_stale(Duration::from_secs(3600), |_| false).await.is_empty());

        let released = ledger
            .cleanup_stale(Duration::ZERO, |id| id.as_str() == "alive")
            .await;
        assert_eq!(released, vec![JobId::from("dead")]);
        assert!(ledger.allocation(&"alive".into()).await.is_some());
    }

    #[tokio::test]
    async fn test_summary() {
        let (_, ledger) = ledger_with(
            vec![device(0, 8192, 6000, 20.0), device(1, 8192, 8192, 40.0)],
            0,
        );
        ledger.try_allocate(&"a".into(), 1000, 0).await.unwrap();

        let summary = ledger.summary().await.unwrap();
        assert_eq!(summary.device_count, 2);
        assert_eq!(summary.total_memory_mb, 16384);
        assert_eq!(summary.free_memory_mb, 14192);
        assert_eq!(summary.allocation_count, 1);
        assert_eq!(summary.reserved_memory_mb, 1000);
        assert!((summary.average_utilization - 30.0).abs() < 0.001);
    }
}
