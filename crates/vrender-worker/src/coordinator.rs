//! Render job coordination.
//!
//! Takes one [`RenderJob`] from admission to a verified output file:
//! validate, reserve GPU memory, launch the generator pinned to the
//! reserved device, relay progress, classify the outcome and release the
//! reservation. Release happens exactly once on every path through RAII
//! guards, including when the caller's progress callback panics or the
//! render future is dropped mid-flight.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tracing::{debug, error, warn, Instrument};
use validator::Validate;
use vrender_gpu::{GpuError, ResourceAllocator, DEFAULT_POLL_INTERVAL};
use vrender_media::{
    verify_output, GenerationCommand, ProcessEvent, ProcessLauncher, ProcessOutcome, StartOptions,
    StopReason,
};
use vrender_models::{
    AdmissionPolicy, Allocation, JobId, ProcessMetrics, ProcessState, RenderJob, RenderProgress,
    RenderStatus,
};

use crate::error::RenderError;
use crate::logging::JobLogger;
use crate::metrics;
use crate::retry::{retry_async_if, RetryConfig};

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Executable of the AI video generator
    pub render_command: String,
    /// Arguments placed before the generated flags
    pub render_args: Vec<String>,
    /// Working directory of render processes; relative output paths resolve here
    pub work_dir: Option<PathBuf>,
    /// Upper bound applied to a job's own wait timeout
    pub max_allocation_wait: Duration,
    pub allocation_poll_interval: Duration,
    /// Backoff for admission attempts that hit a telemetry failure
    pub telemetry_retry: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            render_command: "vgen-render".to_string(),
            render_args: Vec::new(),
            work_dir: None,
            max_allocation_wait: Duration::from_secs(600),
            allocation_poll_interval: DEFAULT_POLL_INTERVAL,
            telemetry_retry: RetryConfig::new("gpu_admission"),
        }
    }
}

/// A finished, verified render.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub job_id: JobId,
    pub output_path: PathBuf,
    pub output_bytes: u64,
    pub device_index: u32,
    pub frames_generated: u64,
    pub metrics: ProcessMetrics,
}

/// Runs render jobs against an allocator and a process launcher.
pub struct RenderCoordinator {
    allocator: Arc<dyn ResourceAllocator>,
    launcher: Arc<dyn ProcessLauncher>,
    config: CoordinatorConfig,
    in_flight: Arc<Mutex<HashSet<JobId>>>,
}

impl RenderCoordinator {
    pub fn new(
        allocator: Arc<dyn ResourceAllocator>,
        launcher: Arc<dyn ProcessLauncher>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            allocator,
            launcher,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Jobs between receipt and their terminal progress update.
    pub fn in_flight_jobs(&self) -> HashSet<JobId> {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Render `job`, reporting progress through `on_progress`.
    ///
    /// `on_progress` sees zero or more non-terminal updates and then exactly
    /// one terminal update matching the returned result. A job id already
    /// rendering on this coordinator fails with [`RenderError::AlreadyRunning`]
    /// and reports nothing, since the terminal update belongs to the running render.
    pub async fn render<F>(&self, job: &RenderJob, on_progress: F) -> Result<RenderOutput, RenderError>
    where
        F: Fn(RenderProgress) + Send + Sync,
    {
        let logger = JobLogger::for_job(job);
        let Some(_in_flight) = InFlightGuard::claim(&self.in_flight, &job.job_id) else {
            logger.warning("Job is already rendering here, ignoring duplicate delivery");
            return Err(RenderError::AlreadyRunning(job.job_id.clone()));
        };

        let started = Instant::now();
        let mut progress = ProgressTracker::new(job.job_id.clone(), &on_progress);

        let result = self
            .run(job, &logger, &mut progress)
            .instrument(logger.span())
            .await;

        match &result {
            Ok(output) => {
                logger.completed(output.output_bytes, started.elapsed());
                metrics::record_job_completed(started.elapsed().as_secs_f64());
                progress.finish(RenderStatus::Completed, None);
            }
            Err(e) => {
                logger.failed(e);
                metrics::record_job_failed(e.kind());
                progress.finish(e.render_status(), Some(e.to_string()));
            }
        }

        result
    }

    async fn run(
        &self,
        job: &RenderJob,
        logger: &JobLogger,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<RenderOutput, RenderError> {
        logger.received(job);
        self.validate(job).await?;

        progress.emit(RenderStatus::Allocating);
        let admission_started = Instant::now();
        let allocation = self.admit(job).await?;
        let waited = admission_started.elapsed();
        logger.admitted(&allocation, waited);
        metrics::record_admission_wait(waited.as_secs_f64());

        let mut guard = AllocationGuard::new(Arc::clone(&self.allocator), job.job_id.clone());
        let result = self
            .execute(job, &allocation, &mut guard, logger, progress)
            .await;
        guard.release().await;

        result
    }

    async fn validate(&self, job: &RenderJob) -> Result<(), RenderError> {
        job.validate()
            .map_err(|e| RenderError::invalid_request(e.to_string()))?;

        let limits = self.allocator.limits().await;
        if job.memory_mb > limits.max_reservable_memory_mb {
            return Err(RenderError::invalid_request(format!(
                "requested {} MB exceeds the {} MB per-job maximum",
                job.memory_mb, limits.max_reservable_memory_mb
            )));
        }

        Ok(())
    }

    /// Reserve GPU memory according to the job's admission policy.
    async fn admit(&self, job: &RenderJob) -> Result<Allocation, RenderError> {
        let is_telemetry_failure = |e: &GpuError| matches!(e, GpuError::TelemetryUnavailable(_));

        let immediate = retry_async_if(
            &self.config.telemetry_retry,
            || {
                self.allocator
                    .try_allocate(&job.job_id, job.memory_mb, job.priority)
            },
            is_telemetry_failure,
        )
        .await?;

        if let Some(allocation) = immediate {
            return Ok(allocation);
        }

        match job.admission {
            AdmissionPolicy::FailFast => Err(RenderError::ResourcesUnavailable {
                requested_mb: job.memory_mb,
                reason: "no device has capacity".to_string(),
            }),
            AdmissionPolicy::Wait { timeout_secs } => {
                let timeout = Duration::from_secs(timeout_secs).min(self.config.max_allocation_wait);
                let deadline = Instant::now() + timeout;
                debug!(job_id = %job.job_id, ?timeout, "Waiting for GPU capacity");

                // A retried wait only gets what is left of the original timeout
                let allocation = retry_async_if(
                    &self.config.telemetry_retry,
                    || {
                        self.allocator.wait_for_allocation(
                            &job.job_id,
                            job.memory_mb,
                            job.priority,
                            deadline.saturating_duration_since(Instant::now()),
                            self.config.allocation_poll_interval,
                        )
                    },
                    is_telemetry_failure,
                )
                .await?;
                Ok(allocation)
            }
        }
    }

    async fn execute(
        &self,
        job: &RenderJob,
        allocation: &Allocation,
        guard: &mut AllocationGuard,
        logger: &JobLogger,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<RenderOutput, RenderError> {
        let output_path = self.resolve_output(job);
        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| process_io_error("cannot create output directory", e))?;
        }

        let command = GenerationCommand::from_job(&self.config.render_command, job)
            .output_path(&output_path)
            .device(allocation.device_index)
            .memory_budget_mb(allocation.reserved_memory_mb);

        let mut args = self.config.render_args.clone();
        args.extend(command.build_args());

        let options = StartOptions {
            cwd: self.config.work_dir.clone(),
            env: command.build_env(),
            timeout: job.timeout_secs.map(Duration::from_secs),
            limits: None,
        };

        let mut handle = self
            .launcher
            .start(&job.job_id, &self.config.render_command, &args, options)
            .await?;
        guard.track_process(Arc::clone(&self.launcher));

        logger.process_started(handle.pid());
        metrics::record_job_started();
        progress.emit(RenderStatus::Running);

        let mut exited = None;
        while let Some(event) = handle.next_event().await {
            match event {
                ProcessEvent::Started { .. } => {}
                ProcessEvent::Progress { percent } => {
                    progress.percent = percent;
                    progress.emit(RenderStatus::Running);
                }
                ProcessEvent::Frames { count } => {
                    progress.frames = count;
                    progress.emit(RenderStatus::Running);
                }
                ProcessEvent::Step { name } => {
                    logger.step(&name);
                    progress.step = Some(name);
                    progress.emit(RenderStatus::Running);
                }
                ProcessEvent::RecoverableError { line } => {
                    logger.warning(&format!("Recoverable render error: {}", line));
                }
                ProcessEvent::FatalError { line } => {
                    logger.warning(&format!("Fatal render error, process killed: {}", line));
                }
                ProcessEvent::LimitExceeded { kind, value, limit } => {
                    metrics::record_limit_exceeded(&format!("{:?}", kind).to_lowercase());
                    logger.warning(&format!(
                        "Process over {:?} limit: {:.1} > {:.1}",
                        kind, value, limit
                    ));
                }
                ProcessEvent::TimedOut => {
                    logger.warning("Render timed out, terminating");
                }
                ProcessEvent::CleanupForced => {
                    error!(job_id = %job.job_id, "Render process survived SIGKILL, tracking dropped");
                }
                ProcessEvent::Exited(outcome) => {
                    exited = Some(outcome);
                    break;
                }
            }
        }

        let outcome = match exited {
            Some(outcome) => outcome,
            None => handle.wait().await,
        };
        guard.process_exited();

        self.conclude(allocation, output_path, outcome, progress.frames)
            .await
    }

    /// Map a terminal process outcome onto the render result.
    async fn conclude(
        &self,
        allocation: &Allocation,
        output_path: PathBuf,
        outcome: ProcessOutcome,
        frames_generated: u64,
    ) -> Result<RenderOutput, RenderError> {
        match (outcome.state, outcome.stop_reason) {
            (ProcessState::Completed, _) => match verify_output(&output_path).await {
                Ok(output_bytes) => Ok(RenderOutput {
                    job_id: outcome.job_id,
                    output_path,
                    output_bytes,
                    device_index: allocation.device_index,
                    frames_generated: frames_generated.max(outcome.metrics.frames_processed),
                    metrics: outcome.metrics,
                }),
                Err(e) => Err(RenderError::ProcessFailed {
                    state: ProcessState::Completed,
                    message: format!("exited successfully but {}", e),
                    stderr_tail: outcome.stderr_tail,
                    retryable: true,
                }),
            },
            (_, Some(StopReason::Timeout)) => Err(RenderError::TimedOut {
                state: outcome.state,
                elapsed_secs: outcome.metrics.elapsed().map(|d| d.as_secs()).unwrap_or(0),
                stderr_tail: outcome.stderr_tail,
            }),
            (_, Some(StopReason::FatalError)) => Err(RenderError::ProcessFailed {
                state: outcome.state,
                message: format!(
                    "crashed: {}",
                    outcome.fatal_error.as_deref().unwrap_or("fatal stderr output")
                ),
                stderr_tail: outcome.stderr_tail,
                retryable: false,
            }),
            (_, Some(StopReason::Cancelled)) => Err(RenderError::ProcessFailed {
                state: outcome.state,
                message: "cancelled".to_string(),
                stderr_tail: outcome.stderr_tail,
                retryable: true,
            }),
            (state, None) => {
                let message = match (outcome.exit_code, &outcome.fatal_error) {
                    (_, Some(line)) => format!("crashed: {}", line),
                    (Some(code), None) => format!("exit code {}", code),
                    (None, None) => "terminated by signal".to_string(),
                };
                Err(RenderError::ProcessFailed {
                    state,
                    message,
                    retryable: outcome.fatal_error.is_none(),
                    stderr_tail: outcome.stderr_tail,
                })
            }
        }
    }

    fn resolve_output(&self, job: &RenderJob) -> PathBuf {
        match &self.config.work_dir {
            Some(dir) if job.output_path.is_relative() => dir.join(&job.output_path),
            _ => job.output_path.clone(),
        }
    }
}

fn process_io_error(context: &str, e: std::io::Error) -> RenderError {
    RenderError::ProcessFailed {
        state: ProcessState::Starting,
        message: format!("{}: {}", context, e),
        stderr_tail: Vec::new(),
        retryable: true,
    }
}

/// Accumulates the latest progress values and forwards snapshots to the caller.
struct ProgressTracker<'a> {
    job_id: JobId,
    percent: u8,
    step: Option<String>,
    frames: u64,
    callback: &'a (dyn Fn(RenderProgress) + Send + Sync),
}

impl<'a> ProgressTracker<'a> {
    fn new(job_id: JobId, callback: &'a (dyn Fn(RenderProgress) + Send + Sync)) -> Self {
        Self {
            job_id,
            percent: 0,
            step: None,
            frames: 0,
            callback,
        }
    }

    fn snapshot(&self, status: RenderStatus) -> RenderProgress {
        let mut progress = RenderProgress::new(self.job_id.clone(), status)
            .with_percent(self.percent)
            .with_frames(self.frames);
        if let Some(step) = &self.step {
            progress = progress.with_step(step.clone());
        }
        progress
    }

    fn emit(&self, status: RenderStatus) {
        (self.callback)(self.snapshot(status));
    }

    /// Deliver the single terminal update.
    fn finish(mut self, status: RenderStatus, error: Option<String>) {
        if status == RenderStatus::Completed {
            self.percent = 100;
        }
        let mut progress = self.snapshot(status);
        if let Some(error) = error {
            progress = progress.with_error(error);
        }
        (self.callback)(progress);
    }
}

/// Marks a job id as rendering on this coordinator until dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<JobId>>>,
    job_id: JobId,
}

impl InFlightGuard {
    fn claim(set: &Arc<Mutex<HashSet<JobId>>>, job_id: &JobId) -> Option<Self> {
        let mut jobs = set.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job_id.clone()).then(|| Self {
            set: Arc::clone(set),
            job_id: job_id.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut jobs = self.set.lock().unwrap_or_else(|e| e.into_inner());
        jobs.remove(&self.job_id);
    }
}

/// Releases a job's GPU allocation exactly once.
///
/// [`release`](Self::release) is the normal path. If the guard is dropped
/// without it (panic, cancelled future) a single background task kills the
/// tracked render process and releases once the process is gone.
struct AllocationGuard {
    allocator: Arc<dyn ResourceAllocator>,
    job_id: JobId,
    process: Option<Arc<dyn ProcessLauncher>>,
    released: bool,
}

impl AllocationGuard {
    fn new(allocator: Arc<dyn ResourceAllocator>, job_id: JobId) -> Self {
        Self {
            allocator,
            job_id,
            process: None,
            released: false,
        }
    }

    /// The job's render process is running under `launcher`.
    fn track_process(&mut self, launcher: Arc<dyn ProcessLauncher>) {
        self.process = Some(launcher);
    }

    fn process_exited(&mut self) {
        self.process = None;
    }

    async fn release(mut self) {
        self.released = true;
        if let Some(launcher) = self.process.take() {
            launcher.terminate(&self.job_id, false).await;
        }
        self.allocator.release(&self.job_id).await;
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!(job_id = %self.job_id, "Render aborted, releasing GPU allocation in background");
        match Handle::try_current() {
            Ok(runtime) => {
                let allocator = Arc::clone(&self.allocator);
                let process = self.process.take();
                let job_id = self.job_id.clone();
                runtime.spawn(async move {
                    if let Some(launcher) = process {
                        launcher.terminate(&job_id, false).await;
                    }
                    allocator.release(&job_id).await;
                });
            }
            Err(_) => {
                error!(
                    job_id = %self.job_id,
                    "No runtime to release GPU allocation; stale sweep will reclaim it"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use vrender_gpu::{GpuResult, ResourceLedger, StaticTelemetry};
    use vrender_media::{MediaError, MediaResult, ProcessHandle, ProcessSupervisor, SupervisorConfig};
    use vrender_models::ResourceLimits;

    /// Ledger double that counts grants and releases.
    struct CountingAllocator {
        ledger: ResourceLedger,
        granted: AtomicUsize,
        released: AtomicUsize,
        journal: Arc<Mutex<Vec<&'static str>>>,
    }

    impl CountingAllocator {
        fn new(telemetry: Arc<StaticTelemetry>) -> Self {
            let limits = ResourceLimits {
                reserved_headroom_mb: 1024,
                ..Default::default()
            };
            Self {
                ledger: ResourceLedger::new(telemetry, limits),
                granted: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                journal: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn granted(&self) -> usize {
            self.granted.load(Ordering::SeqCst)
        }

        fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }

        async fn assert_no_leak(&self) {
            assert_eq!(self.granted(), self.released(), "allocation leaked");
            assert!(self.ledger.allocations().await.is_empty());
        }
    }

    #[async_trait]
    impl ResourceAllocator for CountingAllocator {
        async fn limits(&self) -> ResourceLimits {
            self.ledger.limits().await
        }

        async fn try_allocate(
            &self,
            job_id: &JobId,
            requested_mb: u64,
            priority: i32,
        ) -> GpuResult<Option<Allocation>> {
            let fresh = self.ledger.allocation(job_id).await.is_none();
            let result = self.ledger.try_allocate(job_id, requested_mb, priority).await?;
            if fresh && result.is_some() {
                self.granted.fetch_add(1, Ordering::SeqCst);
            }
            Ok(result)
        }

        async fn release(&self, job_id: &JobId) -> Option<Allocation> {
            let released = self.ledger.release(job_id).await;
            if released.is_some() {
                self.released.fetch_add(1, Ordering::SeqCst);
                self.journal.lock().unwrap().push("released");
            }
            released
        }
    }

    /// Allocator that never has capacity and fails telemetry on one call.
    struct FlakyAllocator {
        calls: AtomicUsize,
        fail_on_call: usize,
    }

    #[async_trait]
    impl ResourceAllocator for FlakyAllocator {
        async fn limits(&self) -> ResourceLimits {
            ResourceLimits::default()
        }

        async fn try_allocate(
            &self,
            _job_id: &JobId,
            _requested_mb: u64,
            _priority: i32,
        ) -> GpuResult<Option<Allocation>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_on_call {
                return Err(GpuError::telemetry_unavailable("driver reset"));
            }
            Ok(None)
        }

        async fn release(&self, _job_id: &JobId) -> Option<Allocation> {
            None
        }
    }

    /// Supervisor wrapper that journals confirmed terminations.
    struct RecordingLauncher {
        inner: ProcessSupervisor,
        journal: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ProcessLauncher for RecordingLauncher {
        async fn start(
            &self,
            job_id: &JobId,
            program: &str,
            args: &[String],
            options: StartOptions,
        ) -> MediaResult<ProcessHandle> {
            self.inner.start(job_id, program, args, options).await
        }

        async fn terminate(&self, job_id: &JobId, graceful: bool) {
            self.inner.terminate(job_id, graceful).await;
            self.journal.lock().unwrap().push("terminated");
        }

        async fn active_jobs(&self) -> HashSet<JobId> {
            self.inner.active_jobs().await
        }
    }

    /// Launcher whose every start fails.
    struct FailingLauncher;

    #[async_trait]
    impl ProcessLauncher for FailingLauncher {
        async fn start(
            &self,
            _job_id: &JobId,
            program: &str,
            _args: &[String],
            _options: StartOptions,
        ) -> MediaResult<ProcessHandle> {
            Err(MediaError::spawn_failed(
                program,
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "not executable"),
            ))
        }

        async fn terminate(&self, _job_id: &JobId, _graceful: bool) {}

        async fn active_jobs(&self) -> HashSet<JobId> {
            HashSet::new()
        }
    }

    /// Fake generator: parses the flags it is given, then runs `body`.
    ///
    /// Executed as `sh <script> --prompt ...` so the script file never needs
    /// the executable bit.
    const SCRIPT_PRELUDE: &str = r#"
out=""; gpu=""; vram=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    --gpu) gpu="$2"; shift 2 ;;
    --max-vram-mb) vram="$2"; shift 2 ;;
    *) shift ;;
  esac
done
"#;

    const WRITES_OUTPUT: &str = r#"
echo "Step: sampling"
echo "Progress: 10%"
echo "Progress: 50%"
echo "Frames generated: 120"
echo "Progress: 100%"
printf 'gpu=%s vram=%s cuda=%s' "$gpu" "$vram" "$CUDA_VISIBLE_DEVICES" > "$out"
"#;

    struct Harness {
        _dir: tempfile::TempDir,
        dir: PathBuf,
        allocator: Arc<CountingAllocator>,
        telemetry: Arc<StaticTelemetry>,
        coordinator: RenderCoordinator,
    }

    fn harness(body: &str) -> Harness {
        harness_with_launcher(body, None)
    }

    fn harness_with_launcher(body: &str, launcher: Option<Arc<dyn ProcessLauncher>>) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_path_buf();
        let script = dir.join("render.sh");
        std::fs::write(&script, format!("{}{}", SCRIPT_PRELUDE, body)).unwrap();

        let telemetry = Arc::new(StaticTelemetry::single(8192));
        let allocator = Arc::new(CountingAllocator::new(Arc::clone(&telemetry)));
        let launcher: Arc<dyn ProcessLauncher> = match launcher {
            Some(launcher) => launcher,
            None => Arc::new(ProcessSupervisor::new(SupervisorConfig {
                grace_period: Duration::from_millis(200),
                ..Default::default()
            })),
        };

        let config = CoordinatorConfig {
            render_command: "sh".to_string(),
            render_args: vec![script.to_string_lossy().into_owned()],
            work_dir: Some(dir.clone()),
            max_allocation_wait: Duration::from_secs(10),
            allocation_poll_interval: Duration::from_millis(50),
            telemetry_retry: RetryConfig::new("test")
                .with_max_retries(2)
                .with_base_delay(Duration::from_millis(1)),
        };
        let coordinator = RenderCoordinator::new(
            Arc::clone(&allocator) as Arc<dyn ResourceAllocator>,
            launcher,
            config,
        );

        Harness {
            _dir: tmp,
            dir,
            allocator,
            telemetry,
            coordinator,
        }
    }

    fn job(output: &Path, memory_mb: u64) -> RenderJob {
        RenderJob::new("user_1", "a lighthouse in fog", output, memory_mb)
    }

    fn recorder() -> (
        Arc<Mutex<Vec<RenderProgress>>>,
        impl Fn(RenderProgress) + Send + Sync,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |p: RenderProgress| sink.lock().unwrap().push(p))
    }

    fn terminal_count(seen: &[RenderProgress]) -> usize {
        seen.iter().filter(|p| p.status.is_terminal()).count()
    }

    #[tokio::test]
    async fn test_successful_render() {
        let h = harness(WRITES_OUTPUT);
        let output = h.dir.join("clips/out.mp4");
        let (seen, on_progress) = recorder();

        let result = h.coordinator.render(&job(&output, 4096), on_progress).await.unwrap();

        assert_eq!(result.output_path, output);
        assert_eq!(result.device_index, 0);
        assert_eq!(result.frames_generated, 120);
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "gpu=0 vram=4096 cuda=0"
        );

        let seen = seen.lock().unwrap();
        let percents: Vec<u8> = seen
            .iter()
            .filter(|p| p.status == RenderStatus::Running)
            .map(|p| p.progress_percent)
            .collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert!(percents.contains(&10) && percents.contains(&50) && percents.contains(&100));
        assert_eq!(seen.first().unwrap().status, RenderStatus::Allocating);
        assert_eq!(seen.last().unwrap().status, RenderStatus::Completed);
        assert_eq!(seen.last().unwrap().current_step.as_deref(), Some("sampling"));
        assert_eq!(terminal_count(&seen), 1);

        h.allocator.assert_no_leak().await;
        assert_eq!(h.allocator.granted(), 1);
    }

    #[tokio::test]
    async fn test_relative_output_resolves_in_work_dir() {
        let h = harness(WRITES_OUTPUT);
        let result = tokio_test::assert_ok!(
            h.coordinator
                .render(&job(Path::new("relative.mp4"), 2048), |_| {})
                .await
        );

        assert_eq!(result.output_path, h.dir.join("relative.mp4"));
        assert!(result.output_bytes > 0);
    }

    #[tokio::test]
    async fn test_exit_zero_without_output_is_process_failed() {
        let h = harness("echo 'Progress: 100%'\n");
        let (seen, on_progress) = recorder();

        let err = h
            .coordinator
            .render(&job(&h.dir.join("missing.mp4"), 2048), on_progress)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RenderError::ProcessFailed {
                state: ProcessState::Completed,
                retryable: true,
                ..
            }
        ));
        let seen = seen.lock().unwrap();
        assert_eq!(terminal_count(&seen), 1);
        assert_eq!(seen.last().unwrap().status, RenderStatus::Failed);
        assert!(seen.last().unwrap().error.is_some());
        h.allocator.assert_no_leak().await;
    }

    #[tokio::test]
    async fn test_empty_output_is_process_failed() {
        let h = harness(": > \"$out\"\n");
        let err = h
            .coordinator
            .render(&job(&h.dir.join("empty.mp4"), 2048), |_| {})
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "process_failed");
        assert_eq!(err.state(), Some(ProcessState::Completed));
        h.allocator.assert_no_leak().await;
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr_tail() {
        let h = harness("echo 'model weights missing' >&2\nexit 3\n");
        let err = h
            .coordinator
            .render(&job(&h.dir.join("out.mp4"), 2048), |_| {})
            .await
            .unwrap_err();

        assert_eq!(err.state(), Some(ProcessState::Failed));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("exit code 3"));
        assert_eq!(err.stderr_tail(), ["model weights missing".to_string()]);
        h.allocator.assert_no_leak().await;
    }

    #[tokio::test]
    async fn test_fatal_stderr_is_not_retryable() {
        let h = harness("echo 'Segmentation fault (core dumped)' >&2\nsleep 30\n");
        let (seen, on_progress) = recorder();

        let started = Instant::now();
        let err = h
            .coordinator
            .render(&job(&h.dir.join("out.mp4"), 2048), on_progress)
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(err.state(), Some(ProcessState::Killed));
        assert!(!err.is_retryable());
        assert_eq!(seen.lock().unwrap().last().unwrap().status, RenderStatus::Killed);
        h.allocator.assert_no_leak().await;
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let h = harness("sleep 30\n");
        let (seen, on_progress) = recorder();

        let started = Instant::now();
        let err = h
            .coordinator
            .render(
                &job(&h.dir.join("out.mp4"), 2048).with_timeout_secs(1),
                on_progress,
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            err,
            RenderError::TimedOut {
                state: ProcessState::Killed,
                ..
            }
        ));
        assert!(err.is_retryable());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().unwrap().status, RenderStatus::TimedOut);
        assert_eq!(terminal_count(&seen), 1);
        h.allocator.assert_no_leak().await;
    }

    #[tokio::test]
    async fn test_over_max_reservable_is_invalid() {
        let h = harness(WRITES_OUTPUT);
        let (seen, on_progress) = recorder();

        let err = h
            .coordinator
            .render(&job(&h.dir.join("out.mp4"), 64 * 1024), on_progress)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "invalid_request");
        assert!(!err.is_retryable());
        assert_eq!(h.allocator.granted(), 0);
        assert_eq!(terminal_count(&seen.lock().unwrap()), 1);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_rejected() {
        let h = harness(WRITES_OUTPUT);
        let mut bad = job(&h.dir.join("out.mp4"), 2048);
        bad.prompt.clear();

        let err = h.coordinator.render(&bad, |_| {}).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
        assert_eq!(h.allocator.granted(), 0);
    }

    #[tokio::test]
    async fn test_fail_fast_when_no_capacity() {
        let h = harness(WRITES_OUTPUT);
        h.allocator
            .try_allocate(&JobId::from_string("other"), 6144, 0)
            .await
            .unwrap()
            .unwrap();

        let err = h
            .coordinator
            .render(&job(&h.dir.join("out.mp4"), 2048), |_| {})
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "resources_unavailable");
        assert!(err.is_retryable());
        assert_eq!(h.allocator.granted(), 1);
    }

    #[tokio::test]
    async fn test_wait_admission_succeeds_after_release() {
        let h = harness(WRITES_OUTPUT);
        let other = JobId::from_string("other");
        h.allocator.try_allocate(&other, 6144, 0).await.unwrap().unwrap();

        let allocator = Arc::clone(&h.allocator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            allocator.release(&other).await;
        });

        let waiting = job(&h.dir.join("out.mp4"), 2048)
            .with_admission(AdmissionPolicy::Wait { timeout_secs: 5 });
        let result = h.coordinator.render(&waiting, |_| {}).await;

        assert!(result.is_ok());
        h.allocator.assert_no_leak().await;
    }

    #[tokio::test]
    async fn test_wait_admission_times_out() {
        let h = harness(WRITES_OUTPUT);
        h.allocator
            .try_allocate(&JobId::from_string("other"), 6144, 0)
            .await
            .unwrap()
            .unwrap();

        let waiting = job(&h.dir.join("out.mp4"), 2048)
            .with_admission(AdmissionPolicy::Wait { timeout_secs: 1 });
        let err = h.coordinator.render(&waiting, |_| {}).await.unwrap_err();

        assert_eq!(err.kind(), "resources_unavailable");
    }

    #[tokio::test]
    async fn test_telemetry_failure_is_retryable() {
        let h = harness(WRITES_OUTPUT);
        h.telemetry.set_unavailable(Some("driver reset"));

        let err = h
            .coordinator
            .render(&job(&h.dir.join("out.mp4"), 2048), |_| {})
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "telemetry_unavailable");
        assert!(err.is_retryable());
        assert_eq!(h.allocator.granted(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_releases_allocation() {
        let h = harness_with_launcher(WRITES_OUTPUT, Some(Arc::new(FailingLauncher)));
        let (seen, on_progress) = recorder();

        let err = h
            .coordinator
            .render(&job(&h.dir.join("out.mp4"), 2048), on_progress)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "process_failed");
        assert!(!err.is_retryable());
        assert_eq!(terminal_count(&seen.lock().unwrap()), 1);
        assert_eq!(h.allocator.granted(), 1);
        h.allocator.assert_no_leak().await;
    }

    #[tokio::test]
    async fn test_duplicate_render_is_already_running() {
        let h = harness(&format!("sleep 1\n{}", WRITES_OUTPUT));
        let coordinator = Arc::new(h.coordinator);
        let first_job = job(&h.dir.join("out.mp4"), 2048);
        let second_job = first_job.clone();

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.render(&first_job, |_| {}).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = coordinator.render(&second_job, |_| {}).await.unwrap_err();
        assert_eq!(err.kind(), "already_running");

        assert!(first.await.unwrap().is_ok());
        h.allocator.assert_no_leak().await;
    }

    #[tokio::test]
    async fn test_duplicate_render_leaves_progress_to_owner() {
        let h = harness(&format!("sleep 1\n{}", WRITES_OUTPUT));
        let coordinator = Arc::new(h.coordinator);
        let (seen, on_progress) = recorder();
        let on_progress = Arc::new(on_progress);
        let first_job = job(&h.dir.join("out.mp4"), 2048);
        let second_job = first_job.clone();

        let first = {
            let coordinator = Arc::clone(&coordinator);
            let sink = Arc::clone(&on_progress);
            tokio::spawn(async move { coordinator.render(&first_job, |p| (*sink)(p)).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        let sink = Arc::clone(&on_progress);
        let err = coordinator
            .render(&second_job, |p| (*sink)(p))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "already_running");
        assert!(first.await.unwrap().is_ok());

        let seen = seen.lock().unwrap();
        let terminal: Vec<RenderStatus> = seen
            .iter()
            .filter(|p| p.status.is_terminal())
            .map(|p| p.status)
            .collect();
        assert_eq!(terminal, vec![RenderStatus::Completed]);
        assert_eq!(seen.last().unwrap().status, RenderStatus::Completed);
    }

    #[tokio::test]
    async fn test_abandoned_render_kills_before_release() {
        let h = harness("sleep 30\n");
        let journal = Arc::clone(&h.allocator.journal);
        let launcher = Arc::new(RecordingLauncher {
            inner: ProcessSupervisor::new(SupervisorConfig {
                grace_period: Duration::from_millis(200),
                ..Default::default()
            }),
            journal: Arc::clone(&journal),
        });
        let coordinator = Arc::new(RenderCoordinator::new(
            Arc::clone(&h.allocator) as Arc<dyn ResourceAllocator>,
            launcher,
            h.coordinator.config().clone(),
        ));
        let render_job = job(&h.dir.join("out.mp4"), 2048);

        let task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .render(&render_job, |p| {
                        if p.status == RenderStatus::Running {
                            panic!("callback blew up");
                        }
                    })
                    .await
            })
        };
        assert!(task.await.unwrap_err().is_panic());

        let deadline = Instant::now() + Duration::from_secs(5);
        while journal.lock().unwrap().len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*journal.lock().unwrap(), vec!["terminated", "released"]);
        h.allocator.assert_no_leak().await;
    }

    #[tokio::test]
    async fn test_telemetry_retry_keeps_wait_deadline() {
        let h = harness(WRITES_OUTPUT);
        // Poll interval is 50ms, so call 12 lands about halfway through the wait
        let allocator = Arc::new(FlakyAllocator {
            calls: AtomicUsize::new(0),
            fail_on_call: 12,
        });
        let coordinator = RenderCoordinator::new(
            Arc::clone(&allocator) as Arc<dyn ResourceAllocator>,
            Arc::new(FailingLauncher),
            h.coordinator.config().clone(),
        );
        let waiting = job(&h.dir.join("out.mp4"), 2048)
            .with_admission(AdmissionPolicy::Wait { timeout_secs: 1 });

        let started = Instant::now();
        let err = coordinator.render(&waiting, |_| {}).await.unwrap_err();

        assert_eq!(err.kind(), "resources_unavailable");
        assert!(allocator.calls.load(Ordering::SeqCst) > 12);
        assert!(
            started.elapsed() < Duration::from_millis(1400),
            "wait restarted after telemetry retry: {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_panicking_callback_still_releases() {
        let h = harness("sleep 30\n");
        let coordinator = Arc::new(h.coordinator);
        let render_job = job(&h.dir.join("out.mp4"), 2048);

        let task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .render(&render_job, |p| {
                        if p.status == RenderStatus::Running {
                            panic!("callback blew up");
                        }
                    })
                    .await
            })
        };
        assert!(task.await.unwrap_err().is_panic());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !h.allocator.ledger.allocations().await.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        h.allocator.assert_no_leak().await;
    }
}
