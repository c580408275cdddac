//! Error types for redjob operations.
//!
//! Defines the error taxonomy shared by the store connector, the dispatcher
//! and the worker pool:
//! - Store connectivity and pool acquisition
//! - Payload encoding and decoding
//! - Handler failures (errors, panics, timeouts)
//! - Invalid configuration

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the job store or running jobs.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store could not be reached.
    #[error("Store connection failed: {0}")]
    Connectivity(String),

    /// Every pooled connection is busy; acquisition does not wait.
    #[error("Store connection pool exhausted")]
    PoolExhausted,

    /// A store command failed.
    #[error("Store operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Payload or envelope could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `dispatch` was called before `set_payload`.
    #[error("No payload set for queue '{0}'")]
    MissingPayload(String),

    /// Invalid options or queue name.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The job handler returned an error or panicked.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// The job handler exceeded its execution limit.
    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),
}

impl From<deadpool_redis::PoolError> for QueueError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        match err {
            deadpool_redis::PoolError::Timeout(_) => QueueError::PoolExhausted,
            deadpool_redis::PoolError::Backend(e) => QueueError::Connectivity(e.to_string()),
            other => QueueError::Connectivity(other.to_string()),
        }
    }
}

impl QueueError {
    /// Returns whether the error came from the store rather than from job code.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            QueueError::Connectivity(_) | QueueError::PoolExhausted | QueueError::Redis(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;
