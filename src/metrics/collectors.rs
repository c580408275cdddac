//! High-level recording interface over the raw Prometheus metrics.

use std::time::Duration;

use crate::scheduler::job::JobState;

use super::prometheus::{
    JOBS_DISPATCHED, JOBS_FINISHED, JOBS_IN_PROGRESS, JOB_DURATION, QUEUE_DEPTH,
};

/// Terminal or intermediate outcome of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded; envelope removed.
    Acked,
    /// Handler failed; envelope returned to the queue.
    Retried,
    /// Failure budget exhausted; envelope moved to the dead-letter area.
    DeadLettered,
    /// Failure budget exhausted; envelope dropped.
    Discarded,
}

impl JobOutcome {
    /// Label value used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Acked => "acked",
            JobOutcome::Retried => "retried",
            JobOutcome::DeadLettered => "dead_lettered",
            JobOutcome::Discarded => "discarded",
        }
    }

    /// State the envelope is left in.
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Acked => JobState::Acked,
            JobOutcome::Retried => JobState::Requeued,
            JobOutcome::DeadLettered => JobState::DeadLettered,
            JobOutcome::Discarded => JobState::Discarded,
        }
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records queue metrics.
///
/// Every method is a no-op until [`init_metrics`](super::init_metrics) has
/// run, so library users that never export metrics pay nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a dispatch attempt (`dispatched` or `duplicate`).
    pub fn record_dispatch(&self, queue: &str, outcome: &str) {
        if let Some(dispatched) = JOBS_DISPATCHED.get() {
            dispatched.with_label_values(&[queue, outcome]).inc();
        }

        tracing::trace!(queue = queue, outcome = outcome, "Recorded dispatch metric");
    }

    /// Record a finished execution and how long the handler ran.
    pub fn record_job_finished(&self, queue: &str, outcome: JobOutcome, elapsed: Duration) {
        if let Some(finished) = JOBS_FINISHED.get() {
            finished
                .with_label_values(&[queue, outcome.as_str()])
                .inc();
        }

        if let Some(duration) = JOB_DURATION.get() {
            duration
                .with_label_values(&[queue])
                .observe(elapsed.as_secs_f64());
        }

        tracing::trace!(
            queue = queue,
            outcome = %outcome,
            duration_secs = elapsed.as_secs_f64(),
            "Recorded job metric"
        );
    }

    /// Update the pending depth for a queue.
    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }
    }

    /// Increment the count of running executions by 1.
    pub fn inc_jobs_in_progress(&self, queue: &str) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.with_label_values(&[queue]).inc();
        }
    }

    /// Decrement the count of running executions by 1.
    pub fn dec_jobs_in_progress(&self, queue: &str) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.with_label_values(&[queue]).dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(JobOutcome::Acked.as_str(), "acked");
        assert_eq!(JobOutcome::Retried.to_string(), "retried");
        assert_eq!(JobOutcome::DeadLettered.as_str(), "dead_lettered");
        assert_eq!(JobOutcome::Discarded.as_str(), "discarded");
    }

    #[test]
    fn test_outcome_states() {
        assert_eq!(JobOutcome::Retried.state(), JobState::Requeued);
        assert!(!JobOutcome::Retried.state().is_terminal());
        assert!(JobOutcome::Acked.state().is_terminal());
        assert!(JobOutcome::DeadLettered.state().is_terminal());
        assert_eq!(JobOutcome::Discarded.state().to_string(), "discarded");
    }

    #[test]
    fn test_metrics_collector_is_zero_sized() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_dispatch_counts() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_dispatch("collector-dispatch", "dispatched");
        collector.record_dispatch("collector-dispatch", "dispatched");

        let counter = JOBS_DISPATCHED.get().expect("initialized");
        let value = counter
            .with_label_values(&["collector-dispatch", "dispatched"])
            .get();
        assert!(value >= 2.0);
    }

    #[test]
    fn test_in_progress_goes_up_and_down() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.inc_jobs_in_progress("collector-gauge");
        collector.inc_jobs_in_progress("collector-gauge");
        collector.dec_jobs_in_progress("collector-gauge");

        let gauge = JOBS_IN_PROGRESS.get().expect("initialized");
        assert_eq!(gauge.with_label_values(&["collector-gauge"]).get(), 1.0);
    }

    #[test]
    fn test_record_job_finished_and_depth() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_job_finished("collector-finish", JobOutcome::Acked, Duration::from_millis(12));
        collector.record_job_finished("collector-finish", JobOutcome::DeadLettered, Duration::from_secs(1));
        collector.update_queue_depth("collector-finish", 7);

        let depth = QUEUE_DEPTH.get().expect("initialized");
        assert_eq!(depth.with_label_values(&["collector-finish"]).get(), 7.0);
    }
}
