//! Per-execution context handed to job handlers.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What a handler knows about the execution it is running.
///
/// The token is cancelled when this execution exceeds its time limit. Sibling
/// executions are unaffected, and stopping the pool lets running handlers
/// finish. Handlers that ignore the token are aborted at their next await
/// point once the limit passes.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: Uuid,
    queue: String,
    attempt: u32,
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        job_id: Uuid,
        queue: impl Into<String>,
        attempt: u32,
        timeout: Option<Duration>,
        token: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            queue: queue.into(),
            attempt,
            deadline: timeout.map(|limit| Instant::now() + limit),
            token,
        }
    }

    /// Id of the envelope being executed.
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Queue the envelope was claimed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// 1-based attempt number (previous failures + 1).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// When the execution will be cut off, if it has a limit.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` without a limit.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns true once the execution has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the execution is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Token for passing into nested work.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
