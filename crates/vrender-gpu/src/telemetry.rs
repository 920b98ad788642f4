//! Hardware telemetry via `nvidia-smi`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use vrender_models::Device;

use crate::error::{GpuError, GpuResult};

const GPU_QUERY: &str = "--query-gpu=index,name,memory.total,memory.free,memory.used,utilization.gpu,temperature.gpu,power.draw";
const COMPUTE_APPS_QUERY: &str = "--query-compute-apps=pid,used_memory";
const CSV_FORMAT: &str = "--format=csv,noheader,nounits";

/// Source of per-device and per-process GPU statistics.
///
/// Implementations are stateless: every call polls the hardware afresh.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Poll all devices. An empty list is a valid answer on hosts without GPUs.
    async fn devices(&self) -> GpuResult<Vec<Device>>;

    /// GPU memory in MB held by each compute process, keyed by pid.
    async fn process_memory(&self) -> GpuResult<HashMap<u32, u64>>;
}

/// Telemetry backed by the `nvidia-smi` command line tool.
#[derive(Debug, Clone)]
pub struct NvidiaSmiTelemetry {
    program: PathBuf,
    timeout: Duration,
}

impl Default for NvidiaSmiTelemetry {
    fn default() -> Self {
        Self::new("nvidia-smi")
    }
}

impl NvidiaSmiTelemetry {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Resolve `nvidia-smi` from `PATH`.
    pub fn locate() -> GpuResult<Self> {
        which::which("nvidia-smi")
            .map(Self::new)
            .map_err(|_| GpuError::telemetry_unavailable("nvidia-smi not found in PATH"))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn query(&self, args: &[&str]) -> GpuResult<String> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| {
                GpuError::telemetry_unavailable(format!(
                    "{} did not answer within {:?}",
                    self.program.display(),
                    self.timeout
                ))
            })?
            .map_err(|e| {
                GpuError::telemetry_unavailable(format!(
                    "cannot execute {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(GpuError::telemetry_unavailable(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TelemetrySource for NvidiaSmiTelemetry {
    async fn devices(&self) -> GpuResult<Vec<Device>> {
        let stdout = self.query(&[GPU_QUERY, CSV_FORMAT]).await?;
        parse_devices(&stdout)
    }

    async fn process_memory(&self) -> GpuResult<HashMap<u32, u64>> {
        let stdout = self.query(&[COMPUTE_APPS_QUERY, CSV_FORMAT]).await?;
        Ok(parse_compute_apps(&stdout))
    }
}

/// Fixed telemetry snapshot, settable at runtime.
///
/// Useful on development hosts without a GPU driver and in tests.
#[derive(Debug, Default)]
pub struct StaticTelemetry {
    devices: Mutex<Vec<Device>>,
    processes: Mutex<HashMap<u32, u64>>,
    unavailable: Mutex<Option<String>>,
}

impl StaticTelemetry {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: Mutex::new(devices),
            ..Default::default()
        }
    }

    /// A single idle device with the given total memory.
    pub fn single(total_memory_mb: u64) -> Self {
        Self::new(vec![Device {
            index: 0,
            name: "Static GPU".to_string(),
            total_memory_mb,
            free_memory_mb: total_memory_mb,
            used_memory_mb: 0,
            utilization_percent: Some(0.0),
            temperature_c: None,
            power_draw_w: None,
        }])
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        if let Ok(mut guard) = self.devices.lock() {
            *guard = devices;
        }
    }

    pub fn set_process_memory(&self, pid: u32, memory_mb: u64) {
        if let Ok(mut guard) = self.processes.lock() {
            guard.insert(pid, memory_mb);
        }
    }

    /// Make every subsequent poll fail (or succeed again with `None`).
    pub fn set_unavailable(&self, reason: Option<&str>) {
        if let Ok(mut guard) = self.unavailable.lock() {
            *guard = reason.map(str::to_string);
        }
    }

    fn check_available(&self) -> GpuResult<()> {
        match self.unavailable.lock().ok().and_then(|g| g.clone()) {
            Some(reason) => Err(GpuError::TelemetryUnavailable(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TelemetrySource for StaticTelemetry {
    async fn devices(&self) -> GpuResult<Vec<Device>> {
        self.check_available()?;
        Ok(self.devices.lock().map(|d| d.clone()).unwrap_or_default())
    }

    async fn process_memory(&self) -> GpuResult<HashMap<u32, u64>> {
        self.check_available()?;
        Ok(self.processes.lock().map(|p| p.clone()).unwrap_or_default())
    }
}

/// Parses `--query-gpu` CSV output.
///
/// ```console
/// $ nvidia-smi --query-gpu=index,name,memory.total,memory.free,memory.used,utilization.gpu,temperature.gpu,power.draw --format=csv,noheader,nounits
/// 0, NVIDIA GeForce RTX 4090, 24564, 23010, 1554, 3, 41, 27.80
/// 1, Tesla T4, 15360, 15098, 262, 0, [N/A], [N/A]
/// ```
///
/// Malformed lines are skipped. Output that has content but not a single
/// parseable line is treated as a telemetry failure.
pub fn parse_devices(output: &str) -> GpuResult<Vec<Device>> {
    let mut devices = Vec::new();
    let mut rejected = 0usize;

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match parse_device_line(line) {
            Some(device) => devices.push(device),
            None => {
                debug!(line, "Skipping unparseable nvidia-smi line");
                rejected += 1;
            }
        }
    }

    if devices.is_empty() && rejected > 0 {
        return Err(GpuError::telemetry_unavailable(format!(
            "none of {} nvidia-smi lines could be parsed",
            rejected
        )));
    }

    devices.sort_by_key(|d| d.index);
    Ok(devices)
}

fn parse_device_line(line: &str) -> Option<Device> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 6 {
        return None;
    }

    Some(Device {
        index: fields[0].parse().ok()?,
        name: fields[1].to_string(),
        total_memory_mb: parse_mb(fields[2])?,
        free_memory_mb: parse_mb(fields[3])?,
        used_memory_mb: parse_mb(fields[4])?,
        utilization_percent: parse_optional(fields[5]),
        temperature_c: fields.get(6).and_then(|f| parse_optional(f)),
        power_draw_w: fields.get(7).and_then(|f| parse_optional(f)),
    })
}

/// Parses `--query-compute-apps=pid,used_memory` output into pid -> MB.
pub fn parse_compute_apps(output: &str) -> HashMap<u32, u64> {
    let mut usage = HashMap::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.split(',').map(str::trim);
        let pid = fields.next().and_then(|f| f.parse::<u32>().ok());
        let memory = fields.next().and_then(parse_mb);
        match (pid, memory) {
            // A process using several devices appears once per device
            (Some(pid), Some(mb)) => *usage.entry(pid).or_insert(0) += mb,
            _ => debug!(line, "Skipping unparseable compute-apps line"),
        }
    }

    usage
}

/// `nounits` output is MiB, occasionally with a fractional part.
fn parse_mb(field: &str) -> Option<u64> {
    let value: f64 = field.parse().ok()?;
    (value >= 0.0).then(|| value.round() as u64)
}

/// Boards without a sensor answer `[N/A]` or `[Not Supported]`.
fn parse_optional(field: &str) -> Option<f32> {
    if field.starts_with('[') {
        return None;
    }
    field.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        let output = "0, NVIDIA GeForce RTX 4090, 24564, 23010, 1554, 3, 41, 27.80\n\
                      1, Tesla T4, 15360, 15098, 262, 0, [N/A], [Not Supported]\n";
        let devices = parse_devices(output).unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "NVIDIA GeForce RTX 4090");
        assert_eq!(devices[0].total_memory_mb, 24564);
        assert_eq!(devices[0].temperature_c, Some(41.0));
        assert_eq!(devices[0].power_draw_w, Some(27.8));
        assert_eq!(devices[1].temperature_c, None);
        assert_eq!(devices[1].power_draw_w, None);
    }

    #[test]
    fn test_parse_devices_keeps_boards_without_utilization() {
        let output = "0, NVIDIA A100-SXM4-40GB MIG 3g.20gb, 20096, 19800, 296, [N/A], 33, 61.20\n";
        let devices = parse_devices(output).unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].utilization_percent, None);
        assert_eq!(devices[0].temperature_c, Some(33.0));
    }

    #[test]
    fn test_parse_devices_skips_bad_lines() {
        let output = "garbage line\n0, GPU, 8192, 8000, 192, 5, 50, 100\n";
        let devices = parse_devices(output).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].index, 0);
    }

    #[test]
    fn test_parse_devices_empty_is_ok() {
        assert!(parse_devices("").unwrap().is_empty());
        assert!(parse_devices("\n  \n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_devices_all_garbage_fails() {
        let err = parse_devices("NVIDIA-SMI has failed because it couldn't communicate").unwrap_err();
        assert!(matches!(err, GpuError::TelemetryUnavailable(_)));
    }

    #[test]
    fn test_parse_compute_apps() {
        let output = "1234, 5120\n1234, 1024\n999, 300\nNo running processes found\n";
        let usage = parse_compute_apps(output);
        assert_eq!(usage.get(&1234), Some(&6144));
        assert_eq!(usage.get(&999), Some(&300));
        assert_eq!(usage.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let telemetry = NvidiaSmiTelemetry::new("/nonexistent/nvidia-smi");
        let err = telemetry.devices().await.unwrap_err();
        assert!(matches!(err, GpuError::TelemetryUnavailable(_)));
    }

    #[tokio::test]
    async fn test_static_telemetry_can_fail() {
        let telemetry = StaticTelemetry::single(8192);
        tokio_test::assert_ok!(telemetry.devices().await);

        telemetry.set_unavailable(Some("driver reset"));
        tokio_test::assert_err!(telemetry.devices().await);

        telemetry.set_unavailable(None);
        assert_eq!(telemetry.devices().await.unwrap().len(), 1);
    }
}
