//! redjob: Redis-backed job queue with a concurrent worker pool.
//!
//! Producers push typed payloads through a [`Dispatcher`]; a [`WorkerPool`]
//! claims envelopes in priority order and runs them under bounded
//! concurrency, per-job time limits and a retry budget, moving exhausted
//! jobs to a dead-letter list.

pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod observer;
pub mod scheduler;
pub mod store;

pub use config::StoreConfig;
pub use error::{QueueError, Result};
pub use scheduler::{
    Dispatcher, JobContext, JobEnvelope, PoolError, PoolStats, RetryBackoff, WorkerOptions,
    WorkerPool,
};
pub use store::{QueueBackend, QueueStats, StoreHandle};
