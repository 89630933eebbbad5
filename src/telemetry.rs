//! Telemetry and structured logging for the subtitle worker.

use crate::config::TelemetryConfig;
use crate::job::{Job, JobStatus};
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace, Resource};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TRACER_NAME: &str = "subtitle-worker";

/// Heavy jobs running longer than this get a warning (2 hours).
const SLOW_JOB_THRESHOLD_MS: i64 = 2 * 60 * 60 * 1000;

/// Records telemetry for a finished attempt of a job.
///
/// Emits a structured log line and an OpenTelemetry span carrying the job id,
/// classification, status, retry count and, for terminal jobs, the duration.
/// Called after every failed attempt as well as on terminal transitions.
pub fn record_job_telemetry(job: &Job) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("subtitle_job");

    span.set_attribute(KeyValue::new("job_id", job.id.clone()));
    span.set_attribute(KeyValue::new("file_name", job.file_name.clone()));
    span.set_attribute(KeyValue::new("kind", job.kind().to_string()));
    span.set_attribute(KeyValue::new("status", job.status.to_string()));
    span.set_attribute(KeyValue::new("retries", job.retries as i64));

    if let Some(duration_ms) = job.processing_duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            job_id = %job.id,
            kind = %job.kind(),
            duration_ms = duration_ms,
            status = %job.status,
            "Subtitle job finished"
        );

        if duration_ms > SLOW_JOB_THRESHOLD_MS {
            warn!(
                job_id = %job.id,
                duration_ms = duration_ms,
                "Subtitle job exceeded slow-job threshold ({}ms)",
                SLOW_JOB_THRESHOLD_MS
            );
        }
    }

    if let Some(ref error) = job.last_error {
        span.set_attribute(KeyValue::new("error", error.clone()));
        if job.status == JobStatus::Failed {
            warn!(
                job_id = %job.id,
                error = %error,
                retries = job.retries,
                "Subtitle job failed"
            );
        }
    }

    if !job.category.is_empty() {
        span.set_attribute(KeyValue::new("category", job.category.clone()));
    }

    span.end();
}

/// Records a worker heartbeat with the number of pending jobs.
pub fn record_worker_heartbeat(pending: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("pending", pending as i64));
    span.end();

    info!(pending = pending, "Worker heartbeat");
}

/// Installs the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` (default `info`); `json` switches the
/// formatter to one JSON object per line.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resource attached to every exported span.
fn service_resource(config: &TelemetryConfig) -> Resource {
    Resource::new(vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ])
}

/// Installs the OTLP span exporter as the global tracer provider.
///
/// Returns `Ok(false)` without touching the global provider when no endpoint
/// is configured; spans then go to the no-op tracer. Must run inside the
/// Tokio runtime otherwise.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<bool, Box<dyn std::error::Error>> {
    let Some(endpoint) = config.otlp_endpoint.as_deref() else {
        info!("OTLP export disabled, no collector endpoint configured");
        return Ok(false);
    };

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);
    let trace_config = trace::config().with_resource(service_resource(config));

    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(trace_config)
        .install_batch(runtime::Tokio)?
        .provider()
        .ok_or("OTLP pipeline returned no tracer provider")?;
    global::set_tracer_provider(provider);

    info!(
        endpoint = endpoint,
        service = %config.service_name,
        "Exporting job spans over OTLP"
    );
    Ok(true)
}

/// Flushes pending spans. Call once on shutdown.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
