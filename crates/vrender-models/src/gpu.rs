//! GPU devices, allocations and admission limits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// One GPU as reported by the last telemetry poll.
///
/// Recomputed on every poll and never mutated in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub index: u32,
    pub name: String,
    pub total_memory_mb: u64,
    pub free_memory_mb: u64,
    pub used_memory_mb: u64,
    /// MIG instances and some datacenter boards report no utilization.
    pub utilization_percent: Option<f32>,
    /// Not all boards expose a temperature sensor.
    pub temperature_c: Option<f32>,
    /// Not all boards report power draw.
    pub power_draw_w: Option<f32>,
}

/// A job's claim on a device's memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub job_id: JobId,
    pub device_index: u32,
    pub reserved_memory_mb: u64,
    pub created_at: DateTime<Utc>,
    pub priority: i32,
}

/// Admission limits applied by the resource ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Hard ceiling for a single request; larger requests are rejected outright
    pub max_reservable_memory_mb: u64,
    /// Devices at or above this utilization are not admitted to
    pub max_utilization_percent: f32,
    /// Devices at or above this temperature are not admitted to
    pub max_temperature_c: f32,
    /// Memory withheld per device to absorb telemetry lag and foreign processes
    pub reserved_headroom_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_reservable_memory_mb: 22 * 1024,
            max_utilization_percent: 90.0,
            max_temperature_c: 85.0,
            reserved_headroom_mb: 1024,
        }
    }
}

impl ResourceLimits {
    /// Memory on a device of `total_memory_mb` that allocations may claim.
    pub fn reservable_on(&self, total_memory_mb: u64) -> u64 {
        total_memory_mb.saturating_sub(self.reserved_headroom_mb)
    }
}

/// Partial administrative update of [`ResourceLimits`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reservable_memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_utilization_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_temperature_c: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_headroom_mb: Option<u64>,
}

impl LimitsUpdate {
    /// Apply the present fields onto `limits`.
    pub fn apply_to(&self, limits: &mut ResourceLimits) {
        if let Some(v) = self.max_reservable_memory_mb {
            limits.max_reservable_memory_mb = v;
        }
        if let Some(v) = self.max_utilization_percent {
            limits.max_utilization_percent = v;
        }
        if let Some(v) = self.max_temperature_c {
            limits.max_temperature_c = v;
        }
        if let Some(v) = self.reserved_headroom_mb {
            limits.reserved_headroom_mb = v;
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Read-only aggregate over the last telemetry snapshot and current allocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub device_count: usize,
    pub total_memory_mb: u64,
    pub free_memory_mb: u64,
    pub used_memory_mb: u64,
    pub allocation_count: usize,
    pub reserved_memory_mb: u64,
    pub average_utilization: f32,
}
