//! Supervision of external render processes.
//!
//! Each started process gets one monitor task that owns the child and decides
//! its terminal state, plus one reader task per output stream. A single shared
//! poll task samples CPU, memory and GPU memory of every live process per tick.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vrender_gpu::TelemetrySource;
use vrender_models::{JobId, ProcessLimits, ProcessMetrics, ProcessResourceInfo, ProcessState};

use crate::classify::{classify_stderr, StderrClass};
use crate::config::SupervisorConfig;
use crate::error::{MediaError, MediaResult};
use crate::events::{LimitViolation, ProcessEvent, ProcessOutcome, StopReason};
use crate::progress::{parse_output_line, OutputEvent};
use crate::stats::ProcessSampler;

/// Floor for the resource poll period. `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Per-start options.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Overrides the configured default timeout
    pub timeout: Option<Duration>,
    /// Overrides the configured default limits
    pub limits: Option<ProcessLimits>,
}

/// Launch interface used by the render coordinator.
///
/// [`ProcessSupervisor`] is the production implementation.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn start(
        &self,
        job_id: &JobId,
        program: &str,
        args: &[String],
        options: StartOptions,
    ) -> MediaResult<ProcessHandle>;

    async fn terminate(&self, job_id: &JobId, graceful: bool);

    /// Ids of every process currently supervised.
    async fn active_jobs(&self) -> HashSet<JobId>;
}

/// Caller side of a started process.
pub struct ProcessHandle {
    job_id: JobId,
    pid: u32,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    outcome: watch::Receiver<Option<ProcessOutcome>>,
}

impl ProcessHandle {
    pub fn new(
        job_id: JobId,
        pid: u32,
        events: mpsc::UnboundedReceiver<ProcessEvent>,
        outcome: watch::Receiver<Option<ProcessOutcome>>,
    ) -> Self {
        Self {
            job_id,
            pid,
            events,
            outcome,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Next event, or `None` after `Exited` has been delivered.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }

    /// Wait for the process to finish.
    pub async fn wait(&mut self) -> ProcessOutcome {
        let job_id = self.job_id.clone();
        match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(|| lost_outcome(job_id)),
            Err(_) => lost_outcome(job_id),
        }
    }
}

/// Outcome reported when the monitor task vanished without reporting.
fn lost_outcome(job_id: JobId) -> ProcessOutcome {
    ProcessOutcome {
        job_id,
        state: ProcessState::Failed,
        exit_code: None,
        stop_reason: None,
        fatal_error: Some("process monitor exited without reporting".to_string()),
        stderr_tail: Vec::new(),
        metrics: ProcessMetrics::default(),
        cleanup_forced: false,
    }
}

struct StopRequest {
    reason: StopReason,
    graceful: bool,
}

struct Entry {
    pid: u32,
    state: ProcessState,
    started: Instant,
    metrics: ProcessMetrics,
    limits: ProcessLimits,
    usage: ProcessResourceInfo,
    subscribers: Vec<mpsc::UnboundedSender<ProcessEvent>>,
    stderr_tail: VecDeque<String>,
    fatal_error: Option<String>,
    stop_tx: mpsc::UnboundedSender<StopRequest>,
    outcome_rx: watch::Receiver<Option<ProcessOutcome>>,
}

impl Entry {
    fn publish(&mut self, event: ProcessEvent) {
        // Drop subscribers that went away
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

struct Inner {
    config: SupervisorConfig,
    telemetry: Option<Arc<dyn TelemetrySource>>,
    processes: Mutex<HashMap<JobId, Entry>>,
    poller_started: AtomicBool,
}

impl Inner {
    async fn publish(&self, job_id: &JobId, event: ProcessEvent) {
        if let Some(entry) = self.processes.lock().await.get_mut(job_id) {
            entry.publish(event);
        }
    }

    async fn set_state(&self, job_id: &JobId, state: ProcessState) {
        if let Some(entry) = self.processes.lock().await.get_mut(job_id) {
            entry.state = state;
        }
    }

    async fn handle_stdout_line(&self, job_id: &JobId, line: String) {
        let Some(event) = parse_output_line(&line) else {
            debug!(job_id = %job_id, line = %line, "render stdout");
            return;
        };

        let mut processes = self.processes.lock().await;
        let Some(entry) = processes.get_mut(job_id) else {
            return;
        };
        let event = match event {
            OutputEvent::Progress { percent } => ProcessEvent::Progress { percent },
            OutputEvent::Frames { count } => {
                entry.metrics.frames_processed = count;
                ProcessEvent::Frames { count }
            }
            OutputEvent::Step { name } => ProcessEvent::Step { name },
        };
        entry.publish(event);
    }

    async fn handle_stderr_line(&self, job_id: &JobId, line: String) {
        let class = classify_stderr(&line);

        let stop_tx = {
            let mut processes = self.processes.lock().await;
            let Some(entry) = processes.get_mut(job_id) else {
                return;
            };

            if self.config.stderr_tail_lines > 0 {
                if entry.stderr_tail.len() >= self.config.stderr_tail_lines {
                    entry.stderr_tail.pop_front();
                }
                entry.stderr_tail.push_back(line.clone());
            }

            match class {
                None => {
                    debug!(job_id = %job_id, line = %line, "render stderr");
                    return;
                }
                Some(StderrClass::Recoverable) => {
                    warn!(job_id = %job_id, line = %line, "Recoverable render error");
                    entry.metrics.error_count += 1;
                    entry.publish(ProcessEvent::RecoverableError { line });
                    return;
                }
                Some(StderrClass::Fatal) => {
                    error!(job_id = %job_id, line = %line, "Fatal render error, killing process");
                    entry.metrics.error_count += 1;
                    entry.fatal_error.get_or_insert_with(|| line.clone());
                    entry.publish(ProcessEvent::FatalError { line });
                    entry.stop_tx.clone()
                }
            }
        };

        let _ = stop_tx.send(StopRequest {
            reason: StopReason::FatalError,
            graceful: false,
        });
    }

    /// One resource poll over every live process.
    async fn poll_once(&self, sampler: &mut ProcessSampler) {
        let pids: HashMap<JobId, u32> = {
            let processes = self.processes.lock().await;
            processes
                .iter()
                .filter(|(_, e)| e.state == ProcessState::Running)
                .map(|(id, e)| (id.clone(), e.pid))
                .collect()
        };
        if pids.is_empty() {
            sampler.retain(&HashSet::new());
            return;
        }

        // One driver query per tick for all processes
        let gpu_usage = match &self.telemetry {
            Some(telemetry) => match telemetry.process_memory().await {
                Ok(usage) => usage,
                Err(e) => {
                    debug!(error = %e, "Per-process GPU telemetry unavailable");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        let samples: Vec<(JobId, Option<_>)> = pids
            .iter()
            .map(|(id, pid)| (id.clone(), sampler.sample(*pid)))
            .collect();
        sampler.retain(&pids.values().copied().collect());

        let mut processes = self.processes.lock().await;
        for (job_id, sample) in samples {
            let Some(entry) = processes.get_mut(&job_id) else {
                continue;
            };
            let Some(sample) = sample else {
                continue;
            };

            entry.metrics.record_sample(sample.cpu_percent, sample.memory_mb);
            entry.usage = ProcessResourceInfo {
                pid: entry.pid,
                cpu_percent: sample.cpu_percent,
                memory_mb: sample.memory_mb,
                uptime_secs: entry.started.elapsed().as_secs(),
                gpu_memory_mb: gpu_usage.get(&entry.pid).copied(),
            };

            for (kind, value, limit) in check_limits(&entry.usage, &entry.limits) {
                warn!(
                    job_id = %job_id,
                    limit = ?kind,
                    value,
                    max = limit,
                    "Process exceeded resource limit"
                );
                entry.publish(ProcessEvent::LimitExceeded { kind, value, limit });
            }
        }
    }
}

/// Limits exceeded by `usage` as `(kind, value, limit)`.
pub fn check_limits(
    usage: &ProcessResourceInfo,
    limits: &ProcessLimits,
) -> Vec<(LimitViolation, f64, f64)> {
    let mut violations = Vec::new();

    if usage.memory_mb > limits.max_memory_mb {
        violations.push((
            LimitViolation::Memory,
            usage.memory_mb as f64,
            limits.max_memory_mb as f64,
        ));
    }
    if usage.cpu_percent > limits.max_cpu_percent {
        violations.push((
            LimitViolation::Cpu,
            usage.cpu_percent as f64,
            limits.max_cpu_percent as f64,
        ));
    }
    if let Some(gpu) = usage.gpu_memory_mb {
        if gpu > limits.max_gpu_memory_mb {
            violations.push((
                LimitViolation::GpuMemory,
                gpu as f64,
                limits.max_gpu_memory_mb as f64,
            ));
        }
    }

    violations
}

/// Owns every external render process on this host.
///
/// Cheap to clone; clones share the same process table.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::build(config, None)
    }

    /// Supervisor that also attributes GPU memory per process.
    pub fn with_telemetry(config: SupervisorConfig, telemetry: Arc<dyn TelemetrySource>) -> Self {
        Self::build(config, Some(telemetry))
    }

    fn build(config: SupervisorConfig, telemetry: Option<Arc<dyn TelemetrySource>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                telemetry,
                processes: Mutex::new(HashMap::new()),
                poller_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    fn ensure_poller(&self) {
        if self.inner.poller_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.poll_interval.max(MIN_POLL_INTERVAL);
        tokio::spawn(async move {
            let mut sampler = ProcessSampler::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("Supervisor dropped, stopping resource poll");
                    break;
                };
                inner.poll_once(&mut sampler).await;
            }
        });
    }

    /// Spawn `program` under supervision for `job_id`.
    ///
    /// The returned handle is already subscribed, so it sees every event from
    /// `Started` to `Exited`.
    pub async fn start(
        &self,
        job_id: &JobId,
        program: &str,
        args: &[String],
        options: StartOptions,
    ) -> MediaResult<ProcessHandle> {
        let config = &self.inner.config;
        let limits = options.limits.unwrap_or_else(|| config.limits.clone());
        let timeout = options.timeout.unwrap_or(limits.timeout);

        let mut processes = self.inner.processes.lock().await;
        if processes.contains_key(job_id) {
            return Err(MediaError::AlreadyRunning(job_id.clone()));
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group so signals reach the whole tree
            .process_group(0)
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| MediaError::spawn_failed(program, e))?;
        let Some(pid) = child.id() else {
            return Err(MediaError::spawn_failed(
                program,
                std::io::Error::other("process exited before its pid was read"),
            ));
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let mut entry = Entry {
            pid,
            state: ProcessState::Starting,
            started: Instant::now(),
            metrics: ProcessMetrics::started(Utc::now()),
            limits,
            usage: ProcessResourceInfo {
                pid,
                cpu_percent: 0.0,
                memory_mb: 0,
                uptime_secs: 0,
                gpu_memory_mb: None,
            },
            subscribers: vec![event_tx],
            stderr_tail: VecDeque::with_capacity(config.stderr_tail_lines),
            fatal_error: None,
            stop_tx,
            outcome_rx: outcome_rx.clone(),
        };
        entry.state = ProcessState::Running;
        entry.publish(ProcessEvent::Started { pid });
        processes.insert(job_id.clone(), entry);
        drop(processes);

        info!(job_id = %job_id, pid, program, ?timeout, "Render process started");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(self.inner.clone(), job_id.clone(), stdout, Stream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(self.inner.clone(), job_id.clone(), stderr, Stream::Stderr));
        }

        tokio::spawn(monitor(
            self.inner.clone(),
            job_id.clone(),
            child,
            pid,
            timeout,
            stop_rx,
            readers,
            outcome_tx,
        ));
        self.ensure_poller();

        Ok(ProcessHandle::new(job_id.clone(), pid, event_rx, outcome_rx))
    }

    /// Additional event subscription. `None` when the job is not supervised.
    pub async fn subscribe(&self, job_id: &JobId) -> Option<mpsc::UnboundedReceiver<ProcessEvent>> {
        let mut processes = self.inner.processes.lock().await;
        let entry = processes.get_mut(job_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        entry.subscribers.push(tx);
        Some(rx)
    }

    /// Stop the job's process and wait until it is gone.
    ///
    /// Graceful sends SIGINT, waits the grace period, then SIGKILL; otherwise
    /// SIGKILL right away. Unknown ids return immediately.
    pub async fn terminate(&self, job_id: &JobId, graceful: bool) {
        let mut outcome_rx = {
            let processes = self.inner.processes.lock().await;
            let Some(entry) = processes.get(job_id) else {
                return;
            };
            let _ = entry.stop_tx.send(StopRequest {
                reason: StopReason::Cancelled,
                graceful,
            });
            entry.outcome_rx.clone()
        };

        let _ = outcome_rx.wait_for(Option::is_some).await;
    }

    /// Latest resource sample. `None` when the job is not supervised.
    pub async fn resource_usage(&self, job_id: &JobId) -> Option<ProcessResourceInfo> {
        let processes = self.inner.processes.lock().await;
        let entry = processes.get(job_id)?;
        let mut usage = entry.usage.clone();
        usage.uptime_secs = entry.started.elapsed().as_secs();
        Some(usage)
    }

    /// Cumulative metrics. `None` when the job is not supervised.
    pub async fn metrics(&self, job_id: &JobId) -> Option<ProcessMetrics> {
        let processes = self.inner.processes.lock().await;
        processes.get(job_id).map(|e| e.metrics.clone())
    }

    pub async fn state(&self, job_id: &JobId) -> Option<ProcessState> {
        let processes = self.inner.processes.lock().await;
        processes.get(job_id).map(|e| e.state)
    }

    pub async fn is_running(&self, job_id: &JobId) -> bool {
        self.inner.processes.lock().await.contains_key(job_id)
    }

    pub async fn active_jobs(&self) -> HashSet<JobId> {
        self.inner.processes.lock().await.keys().cloned().collect()
    }

    /// Terminate every supervised process.
    pub async fn shutdown(&self, graceful: bool) {
        let jobs = self.active_jobs().await;
        if !jobs.is_empty() {
            info!(count = jobs.len(), "Terminating supervised processes");
        }
        futures::future::join_all(jobs.iter().map(|id| self.terminate(id, graceful))).await;
    }
}

#[async_trait]
impl ProcessLauncher for ProcessSupervisor {
    async fn start(
        &self,
        job_id: &JobId,
        program: &str,
        args: &[String],
        options: StartOptions,
    ) -> MediaResult<ProcessHandle> {
        ProcessSupervisor::start(self, job_id, program, args, options).await
    }

    async fn terminate(&self, job_id: &JobId, graceful: bool) {
        ProcessSupervisor::terminate(self, job_id, graceful).await
    }

    async fn active_jobs(&self) -> HashSet<JobId> {
        ProcessSupervisor::active_jobs(self).await
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_reader<R>(inner: Arc<Inner>, job_id: JobId, stream: R, kind: Stream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match kind {
                    Stream::Stdout => inner.handle_stdout_line(&job_id, line).await,
                    Stream::Stderr => inner.handle_stderr_line(&job_id, line).await,
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(job_id = %job_id, error = %e, ?kind, "Output stream read failed");
                    break;
                }
            }
        }
    })
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Stop(StopRequest),
}

/// Owns the child until it is gone and reports the outcome.
#[allow(clippy::too_many_arguments)]
async fn monitor(
    inner: Arc<Inner>,
    job_id: JobId,
    mut child: Child,
    pid: u32,
    timeout: Duration,
    mut stop_rx: mpsc::UnboundedReceiver<StopRequest>,
    readers: Vec<JoinHandle<()>>,
    outcome_tx: watch::Sender<Option<ProcessOutcome>>,
) {
    let grace = inner.config.grace_period;

    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        _ = tokio::time::sleep(timeout) => Wake::TimedOut,
        Some(request) = stop_rx.recv() => Wake::Stop(request),
    };

    let (mut state, exit_code, stop_reason, mut cleanup_forced) = match wake {
        Wake::Exited(Ok(status)) => {
            let state = if status.success() {
                ProcessState::Completed
            } else {
                ProcessState::Failed
            };
            (state, status.code(), None, false)
        }
        Wake::Exited(Err(e)) => {
            error!(job_id = %job_id, error = %e, "Failed to wait for render process");
            (ProcessState::Failed, None, None, false)
        }
        Wake::TimedOut => {
            warn!(job_id = %job_id, ?timeout, "Render process timed out, terminating");
            inner.set_state(&job_id, ProcessState::TimedOut).await;
            inner.publish(&job_id, ProcessEvent::TimedOut).await;
            let status = terminate_child(&mut child, pid, true, grace).await;
            (
                ProcessState::Killed,
                status.and_then(|s| s.code()),
                Some(StopReason::Timeout),
                status.is_none(),
            )
        }
        Wake::Stop(request) => {
            info!(
                job_id = %job_id,
                reason = ?request.reason,
                graceful = request.graceful,
                "Terminating render process"
            );
            let status = terminate_child(&mut child, pid, request.graceful, grace).await;
            (
                ProcessState::Killed,
                status.and_then(|s| s.code()),
                Some(request.reason),
                status.is_none(),
            )
        }
    };

    if cleanup_forced {
        error!(job_id = %job_id, pid, "Render process survived SIGKILL, dropping it");
        inner.publish(&job_id, ProcessEvent::CleanupForced).await;
    }

    // Drain output so every line is delivered before Exited
    for reader in readers {
        if tokio::time::timeout(grace, reader).await.is_err() {
            warn!(job_id = %job_id, "Output reader did not finish after exit");
            cleanup_forced = true;
        }
    }

    let Some(mut entry) = inner.processes.lock().await.remove(&job_id) else {
        return;
    };

    // Crashed after exiting cleanly is still a crash
    if state == ProcessState::Completed && entry.fatal_error.is_some() {
        state = ProcessState::Failed;
    }

    entry.state = state;
    entry.metrics.ended_at = Some(Utc::now());

    let outcome = ProcessOutcome {
        job_id: job_id.clone(),
        state,
        exit_code,
        stop_reason,
        fatal_error: entry.fatal_error.take(),
        stderr_tail: entry.stderr_tail.drain(..).collect(),
        metrics: entry.metrics.clone(),
        cleanup_forced,
    };

    info!(
        job_id = %job_id,
        state = %outcome.state,
        exit_code = ?outcome.exit_code,
        stop_reason = ?outcome.stop_reason,
        "Render process finished"
    );

    entry.publish(ProcessEvent::Exited(outcome.clone()));
    let _ = outcome_tx.send(Some(outcome));
}

/// The one termination path: signal, grace, SIGKILL, grace.
///
/// Returns `None` when the process still has not exited.
async fn terminate_child(
    child: &mut Child,
    pid: u32,
    graceful: bool,
    grace: Duration,
) -> Option<ExitStatus> {
    if graceful {
        signal_group(pid, Signal::SIGINT);
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            debug!(pid, "Process ended gracefully after SIGINT");
            return Some(status);
        }
    }

    signal_group(pid, Signal::SIGKILL);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => None,
    }
}

fn signal_group(pid: u32, sig: Signal) {
    let pid = Pid::from_raw(pid as i32);
    let result = match nix::unistd::getpgid(Some(pid)) {
        Ok(pgid) => signal::killpg(pgid, sig),
        Err(_) => signal::kill(pid, sig),
    };
    if let Err(e) = result {
        debug!(pid = %pid, signal = ?sig, error = %e, "Cannot signal process");
    }
}
