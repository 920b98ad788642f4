//! Job executor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vrender_gpu::{ResourceAllocator, ResourceLedger};
use vrender_media::{ProcessLauncher, ProcessSupervisor};
use vrender_models::RenderProgress;
use vrender_queue::{JobQueue, ProgressChannel, QueueJob};

use crate::config::WorkerConfig;
use crate::coordinator::RenderCoordinator;
use crate::error::{RenderError, WorkerError, WorkerResult};
use crate::metrics;
use crate::retry::FailureTracker;

/// Floor for background task periods. `tokio::time::interval` rejects zero.
const MIN_TASK_INTERVAL: Duration = Duration::from_secs(1);

/// What to do with a queue message whose render failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureAction {
    /// Leave it pending; it is redelivered once idle past the visibility timeout
    Retry,
    /// Retrying cannot help
    DeadLetter,
    /// Another delivery of the same job is still rendering here
    Ignore,
}

fn failure_action(err: &RenderError) -> FailureAction {
    match err {
        RenderError::AlreadyRunning(_) => FailureAction::Ignore,
        e if e.is_retryable() => FailureAction::Retry,
        _ => FailureAction::DeadLetter,
    }
}

/// Shared by every job task.
struct JobContext {
    queue: Arc<JobQueue>,
    coordinator: Arc<RenderCoordinator>,
    progress_tx: mpsc::UnboundedSender<RenderProgress>,
    semaphore: Arc<Semaphore>,
    max_jobs: usize,
}

impl JobContext {
    fn report_in_flight(&self) {
        metrics::set_jobs_in_flight(self.max_jobs - self.semaphore.available_permits());
    }
}

/// Job executor that renders jobs from the queue.
pub struct JobExecutor {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    progress: Arc<ProgressChannel>,
    ledger: Arc<ResourceLedger>,
    supervisor: ProcessSupervisor,
    coordinator: Arc<RenderCoordinator>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    consumer_name: String,
}

impl JobExecutor {
    pub fn new(
        config: WorkerConfig,
        queue: JobQueue,
        progress: ProgressChannel,
        ledger: Arc<ResourceLedger>,
        supervisor: ProcessSupervisor,
    ) -> Self {
        let coordinator = RenderCoordinator::new(
            Arc::clone(&ledger) as Arc<dyn ResourceAllocator>,
            Arc::new(supervisor.clone()) as Arc<dyn ProcessLauncher>,
            config.coordinator_config(),
        );
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4());

        Self {
            config,
            queue: Arc::new(queue),
            progress: Arc::new(progress),
            ledger,
            supervisor,
            coordinator: Arc::new(coordinator),
            job_semaphore,
            shutdown,
            consumer_name,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Run until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.consumer_name, self.config.max_concurrent_jobs
        );

        self.queue.init().await?;
        tokio::fs::create_dir_all(&self.config.work_dir).await?;

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let publisher = spawn_progress_publisher(Arc::clone(&self.progress), progress_rx);
        let ledger_metrics = metrics::spawn_ledger_metrics(self.ledger.subscribe());

        let ctx = Arc::new(JobContext {
            queue: Arc::clone(&self.queue),
            coordinator: Arc::clone(&self.coordinator),
            progress_tx,
            semaphore: Arc::clone(&self.job_semaphore),
            max_jobs: self.config.max_concurrent_jobs,
        });

        let claim_task = self.spawn_claim_task(Arc::clone(&ctx));
        let sweep_task = self.spawn_stale_sweep();

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut consume_failures = FailureTracker::new(5);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping executor");
                        break;
                    }
                }
                result = self.consume_jobs(&ctx) => {
                    match result {
                        Ok(()) => consume_failures.record_success(),
                        Err(e) => {
                            if consume_failures.record_failure() {
                                error!("Error consuming jobs: {}", e);
                            }
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }

        claim_task.abort();
        sweep_task.abort();
        drop(ctx);

        info!("Waiting for in-flight renders to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!(
                "Renders still running after {:?}, terminating them",
                self.config.shutdown_timeout
            );
            self.supervisor.shutdown(true).await;
            let _ = tokio::time::timeout(Duration::from_secs(30), self.wait_for_jobs()).await;
        }

        // Job tasks hold the last progress senders; the publisher drains and exits
        if tokio::time::timeout(Duration::from_secs(5), publisher)
            .await
            .is_err()
        {
            warn!("Progress publisher did not drain in time");
        }
        ledger_metrics.abort();

        info!("Job executor stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Consume and render jobs from the queue.
    async fn consume_jobs(&self, ctx: &Arc<JobContext>) -> WorkerResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let jobs = self
            .queue
            .consume(&self.consumer_name, 1000, available)
            .await?;

        if jobs.is_empty() {
            return Ok(());
        }

        debug!("Consumed {} jobs from queue", jobs.len());

        for (message_id, job) in jobs {
            let permit = Arc::clone(&self.job_semaphore)
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;
            spawn_job(Arc::clone(ctx), permit, message_id, job);
        }

        Ok(())
    }

    /// Periodically take over jobs left pending by crashed workers.
    fn spawn_claim_task(&self, ctx: Arc<JobContext>) -> JoinHandle<()> {
        let consumer_name = self.consumer_name.clone();
        let interval_period = self.config.claim_interval.max(MIN_TASK_INTERVAL);
        let min_idle_ms = self.queue.config().visibility_timeout.as_millis() as u64;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_period);
            let mut failures = FailureTracker::new(3);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let free = ctx.semaphore.available_permits();
                        if free == 0 {
                            continue;
                        }

                        match ctx.queue.claim_pending(&consumer_name, min_idle_ms, free).await {
                            Ok(jobs) => {
                                failures.record_success();
                                if !jobs.is_empty() {
                                    info!("Claimed {} pending jobs", jobs.len());
                                }
                                for (message_id, job) in jobs {
                                    let Ok(permit) = Arc::clone(&ctx.semaphore).acquire_owned().await else {
                                        break;
                                    };
                                    spawn_job(Arc::clone(&ctx), permit, message_id, job);
                                }
                            }
                            Err(e) => {
                                if failures.record_failure() {
                                    warn!("Failed to claim pending jobs: {}", e);
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Periodically release allocations whose render is no longer alive.
    fn spawn_stale_sweep(&self) -> JoinHandle<()> {
        let ledger = Arc::clone(&self.ledger);
        let supervisor = self.supervisor.clone();
        let coordinator = Arc::clone(&self.coordinator);
        let period = self.config.stale_sweep_interval.max(MIN_TASK_INTERVAL);
        let max_age = self.config.stale_max_age;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let running = supervisor.active_jobs().await;
                        let rendering = coordinator.in_flight_jobs();
                        let released = ledger
                            .cleanup_stale(max_age, |id| running.contains(id) || rendering.contains(id))
                            .await;
                        if !released.is_empty() {
                            warn!(count = released.len(), "Released stale GPU allocations");
                        }
                    }
                }
            }
        })
    }

    /// Wait for all in-flight jobs to complete.
    async fn wait_for_jobs(&self) {
        while self.job_semaphore.available_permits() < self.config.max_concurrent_jobs {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

fn spawn_job(ctx: Arc<JobContext>, permit: OwnedSemaphorePermit, message_id: String, job: QueueJob) {
    ctx.report_in_flight();
    tokio::spawn(async move {
        execute_job(&ctx, &message_id, job).await;
        drop(permit);
        ctx.report_in_flight();
    });
}

/// Render a single job and settle its queue message.
async fn execute_job(ctx: &JobContext, message_id: &str, job: QueueJob) {
    let job_id = job.job_id().clone();
    info!(job_id = %job_id, message_id, "Executing job");

    let progress_tx = ctx.progress_tx.clone();
    let on_progress = move |progress: RenderProgress| {
        let _ = progress_tx.send(progress);
    };

    let result = match &job {
        QueueJob::Render(render_job) => ctx.coordinator.render(render_job, on_progress).await,
    };

    let err = match result {
        Ok(output) => {
            info!(
                job_id = %job_id,
                output = %output.output_path.display(),
                "Job completed successfully"
            );
            if let Err(e) = ctx.queue.ack(message_id).await {
                error!(job_id = %job_id, "Failed to ack job: {}", e);
            }
            return;
        }
        Err(e) => e,
    };

    match failure_action(&err) {
        FailureAction::Ignore => {
            debug!(job_id = %job_id, "Duplicate delivery of a job still rendering");
        }
        FailureAction::DeadLetter => {
            dead_letter(ctx, message_id, &job, &err.to_string()).await;
        }
        FailureAction::Retry => {
            let retry_count = ctx.queue.increment_retry(message_id).await.unwrap_or(u32::MAX);
            let max_retries = ctx.queue.max_retries();

            if retry_count >= max_retries {
                warn!(job_id = %job_id, "Job exceeded max retries ({})", max_retries);
                let reason = format!("failed after {} attempts: {}", retry_count, err);
                dead_letter(ctx, message_id, &job, &reason).await;
            } else {
                info!(
                    job_id = %job_id,
                    "Job will be retried (attempt {}/{})", retry_count, max_retries
                );
            }
        }
    }
}

async fn dead_letter(ctx: &JobContext, message_id: &str, job: &QueueJob, reason: &str) {
    metrics::record_job_dead_lettered();
    if let Err(e) = ctx.queue.dlq(message_id, job, reason).await {
        error!(job_id = %job.job_id(), "Failed to move job to DLQ: {}", e);
    }
}

/// Forward render progress to Redis pub/sub in delivery order.
fn spawn_progress_publisher(
    channel: Arc<ProgressChannel>,
    mut rx: mpsc::UnboundedReceiver<RenderProgress>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures = FailureTracker::new(3);
        while let Some(progress) = rx.recv().await {
            match channel.publish(&progress).await {
                Ok(()) => failures.record_success(),
                Err(e) => {
                    if failures.record_failure() {
                        warn!(job_id = %progress.job_id, "Failed to publish progress: {}", e);
                    }
                }
            }
        }
    })
}
