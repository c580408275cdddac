//! Prometheus metrics registration and export.
//!
//! All metrics live in process-wide `OnceLock`s so that dispatchers and worker
//! pools can record without threading a registry through every call.

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder};
use parking_lot::Mutex;
use std::sync::OnceLock;

/// Global Prometheus registry for all redjob metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Dispatch attempts, labeled by queue and outcome (`dispatched`, `duplicate`).
pub static JOBS_DISPATCHED: OnceLock<CounterVec> = OnceLock::new();

/// Finished executions, labeled by queue and outcome
/// (`acked`, `retried`, `dead_lettered`, `discarded`).
pub static JOBS_FINISHED: OnceLock<CounterVec> = OnceLock::new();

/// Handler execution time in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Executions currently running, labeled by queue.
pub static JOBS_IN_PROGRESS: OnceLock<GaugeVec> = OnceLock::new();

/// Pending envelopes, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Serializes initialization so every cell comes from the same registry.
static INIT_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls are harmless: the first registered set
/// stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric cannot be built or registered.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock();
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let jobs_dispatched = CounterVec::new(
        Opts::new("redjob_jobs_dispatched_total", "Total dispatch attempts"),
        &["queue", "outcome"],
    )?;

    let jobs_finished = CounterVec::new(
        Opts::new("redjob_jobs_finished_total", "Total finished job executions"),
        &["queue", "outcome"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "redjob_job_duration_seconds",
            "Job handler execution time in seconds",
        )
        .buckets(vec![0.005, 0.05, 0.25, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["queue"],
    )?;

    let jobs_in_progress = GaugeVec::new(
        Opts::new("redjob_jobs_in_progress", "Job executions currently running"),
        &["queue"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("redjob_queue_depth", "Pending envelopes per queue"),
        &["queue_name"],
    )?;

    registry.register(Box::new(jobs_dispatched.clone()))?;
    registry.register(Box::new(jobs_finished.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;

    // Only this locked section ever sets the cells, and only once.
    let _ = JOBS_DISPATCHED.set(jobs_dispatched);
    let _ = JOBS_FINISHED.set(jobs_finished);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = REGISTRY.set(registry);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of failing when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
