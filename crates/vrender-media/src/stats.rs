//! Per-process CPU and memory sampling.

use std::collections::{HashMap, HashSet};

use psutil::process::Process;
use tracing::debug;

/// One CPU/memory sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    pub cpu_percent: f32,
    pub memory_mb: u64,
}

/// Samples processes by pid.
///
/// CPU percent is measured between consecutive samples of the same pid, so the
/// sampler keeps one handle per pid alive between poll ticks.
#[derive(Default)]
pub struct ProcessSampler {
    processes: HashMap<u32, Process>,
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample `pid`. Returns `None` once the process is gone.
    pub fn sample(&mut self, pid: u32) -> Option<ProcessSample> {
        let process = match self.processes.entry(pid) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => match Process::new(pid) {
                Ok(p) => e.insert(p),
                Err(error) => {
                    debug!(pid, ?error, "Cannot inspect process");
                    return None;
                }
            },
        };

        let sample = process.cpu_percent().and_then(|cpu| {
            process.memory_info().map(|mem| ProcessSample {
                cpu_percent: cpu,
                memory_mb: bytes_to_mb(mem.rss()),
            })
        });

        match sample {
            Ok(sample) => Some(sample),
            Err(error) => {
                debug!(pid, ?error, "Process sample failed");
                self.processes.remove(&pid);
                None
            }
        }
    }

    /// Forget every pid not in `live`.
    pub fn retain(&mut self, live: &HashSet<u32>) {
        self.processes.retain(|pid, _| live.contains(pid));
    }
}

/// Any nonzero usage counts as at least 1 MB.
fn bytes_to_mb(bytes: u64) -> u64 {
    bytes.div_ceil(1024 * 1024)
}
