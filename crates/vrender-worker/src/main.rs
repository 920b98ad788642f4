//! GPU render worker binary.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vrender_gpu::{NvidiaSmiTelemetry, ResourceLedger, TelemetrySource};
use vrender_media::{check_render_command, ProcessSupervisor, SupervisorConfig};
use vrender_queue::{JobQueue, ProgressChannel};
use vrender_worker::{metrics, JobExecutor, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("vrender=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }

    info!("Starting vrender-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(port) = config.metrics_port {
        metrics::install_prometheus(port).context("failed to install Prometheus exporter")?;
        info!("Metrics listening on port {}", port);
    }

    match check_render_command(&config.render_command) {
        Ok(path) => info!("Render command: {}", path.display()),
        Err(e) => warn!("{}; every render will fail until it is installed", e),
    }

    let telemetry: Arc<dyn TelemetrySource> =
        Arc::new(NvidiaSmiTelemetry::locate().context("GPU telemetry is required")?);
    let ledger = Arc::new(ResourceLedger::new(
        Arc::clone(&telemetry),
        config.gpu_limits.clone(),
    ));
    match ledger.summary().await {
        Ok(summary) => info!(
            devices = summary.device_count,
            total_mb = summary.total_memory_mb,
            free_mb = summary.free_memory_mb,
            "GPU inventory"
        ),
        Err(e) => warn!("Initial GPU poll failed: {}", e),
    }

    let supervisor = ProcessSupervisor::with_telemetry(SupervisorConfig::from_env(), telemetry);

    let queue = JobQueue::from_env().context("failed to create job queue")?;
    let progress = ProgressChannel::new(&queue.config().redis_url)
        .context("failed to create progress channel")?;

    let executor = Arc::new(JobExecutor::new(
        config,
        queue,
        progress,
        ledger,
        supervisor,
    ));

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_executor.shutdown();
        }
    });

    if let Err(e) = executor.run().await {
        error!("Executor error: {}", e);
        return Err(e.into());
    }

    info!("Worker shutdown complete");
    Ok(())
}
