//! Prometheus-based monitoring for dispatchers and worker pools.
//!
//! # Example
//!
//! ```ignore
//! use redjob::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run worker pools ...
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{JobOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    JOBS_DISPATCHED, JOBS_FINISHED, JOBS_IN_PROGRESS, JOB_DURATION, QUEUE_DEPTH, REGISTRY,
};
