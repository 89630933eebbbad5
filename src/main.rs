//! Subtitle Worker Service
//!
//! Stages finished downloads and drives them through transcription and
//! translation, one heavy job at a time.
//!
//! ## Usage
//!
//! ```text
//! subtitle-worker [PATH...]
//! ```
//!
//! Every PATH (a video file or a download directory) is submitted at startup.
//! The worker then runs until Ctrl+C.
//!
//! ## Configuration
//!
//! Environment variables (see `config` for the full list):
//! - `DATA_ROOT`: root of the stage folders (default: /data)
//! - `QUEUE_MAX_RETRIES`: attempts per heavy job (default: 3)
//! - `DRY_RUN`: skip the external tools (default: false)
//! - `RETRY_STAGING_ON_START`: re-queue leftover staging files (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint (unset: no export)
//! - `OTEL_SERVICE_NAME`: service name on exported spans (default: subtitle-worker)
//! - `LOG_FORMAT`: `json` for JSON logs (default: pretty)
//! - `RUST_LOG`: Log level (default: info)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use subtitle_worker::config::Config;
use subtitle_worker::dispatcher::Dispatcher;
use subtitle_worker::harness::Harness;
use subtitle_worker::notify::LogNotifier;
use subtitle_worker::pipeline::SubtitlePipeline;
use subtitle_worker::queue::JobQueue;
use subtitle_worker::telemetry;
use subtitle_worker::tools::{Transcriber, Translator};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    telemetry::init_logging(json_logs);

    info!("Starting subtitle worker v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    if let Err(e) = telemetry::init_telemetry(&config.telemetry) {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!(
        "Configuration: data_root={}, max_retries={}, retry_delay={:?}, dry_run={}",
        config.data_root.display(),
        config.queue.max_retries,
        config.queue.retry_delay,
        config.dry_run
    );

    let folders = config.folders();
    folders
        .ensure_all()
        .await
        .context("Failed to create stage folders")?;

    let harness = Harness::new(&config.harness);
    let interpreter = config.harness.interpreter.clone();
    let transcriber = Transcriber::new(
        harness.clone(),
        interpreter.clone(),
        config.whisper.clone(),
        config.translate.clone(),
    );
    let translator = Translator::new(harness, interpreter, config.translate.clone());

    let pipeline = Arc::new(
        SubtitlePipeline::new(
            folders,
            Arc::new(transcriber),
            Arc::new(translator),
            Arc::new(LogNotifier),
        )
        .with_dry_run(config.dry_run),
    );

    let queue = JobQueue::new(pipeline.clone(), config.queue.clone());
    queue.start();

    let dispatcher = Dispatcher::new(queue.clone(), pipeline);

    if config.retry_staging_on_start {
        match dispatcher.retry_staging().await {
            Ok(ids) => info!("Re-queued {} staging file(s)", ids.len()),
            Err(e) => error!("Failed to re-queue staging files: {}", e),
        }
    }

    for path in std::env::args_os().skip(1).map(PathBuf::from) {
        match dispatcher.submit(&path, "", "").await {
            Ok(submission) => info!(
                "Submitted {}: job {} ({})",
                path.display(),
                submission.job_id,
                submission.kind
            ),
            Err(e) => error!("Rejected {}: {}", path.display(), e),
        }
    }

    info!("Worker service ready, press Ctrl+C to shutdown");
    signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Received shutdown signal, waiting for current job to finish...");
    queue.stop().await;

    let stats = serde_json::to_string(&queue.stats()).context("Failed to serialize stats")?;
    info!("Final queue stats: {}", stats);

    telemetry::shutdown_telemetry();
    info!("Worker service shutdown complete");
    Ok(())
}
