//! Producer side: typed construction and submission of envelopes.

use serde::Serialize;
use tracing::{debug, info};

use super::job::{payload_unique_key, validate_queue_name, JobEnvelope, DEFAULT_PRIORITY};
use crate::error::{QueueError, Result};
use crate::metrics::MetricsCollector;
use crate::store::StoreHandle;

/// Submits payloads of type `T` to one queue.
///
/// # Example
///
/// ```rust,ignore
/// let mut dispatcher = Dispatcher::<Signup>::bind(store.clone(), "signups")?;
/// dispatcher.set_payload(Signup { id: 1 });
/// dispatcher.dispatch().await?;
/// ```
pub struct Dispatcher<T> {
    store: StoreHandle,
    queue: String,
    priority: u32,
    unique_key: Option<String>,
    payload: Option<T>,
    metrics: MetricsCollector,
}

impl<T: Serialize> Dispatcher<T> {
    /// Creates a dispatcher scoped to `queue`.
    pub fn bind(store: StoreHandle, queue: impl Into<String>) -> Result<Self> {
        let queue = queue.into();
        validate_queue_name(&queue)?;
        Ok(Self::bound(store, queue))
    }

    /// Creates a dispatcher for a queue name that was already validated.
    pub(crate) fn bound(store: StoreHandle, queue: String) -> Self {
        Self {
            store,
            queue,
            priority: DEFAULT_PRIORITY,
            unique_key: None,
            payload: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the priority of dispatched envelopes.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Uses `key` instead of the payload digest for [`dispatch_unique`](Self::dispatch_unique).
    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    /// Sets the payload for the next dispatch. The last call wins.
    pub fn set_payload(&mut self, value: T) -> &mut Self {
        self.payload = Some(value);
        self
    }

    /// Returns the bound queue name.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Returns the priority applied to dispatched envelopes.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Pushes a new envelope, even if an identical one is already pending.
    pub async fn dispatch(&self) -> Result<JobEnvelope> {
        let envelope = self.build_envelope()?;
        self.store.push(&envelope).await?;
        self.metrics.record_dispatch(&self.queue, "dispatched");

        info!(queue = %self.queue, job_id = %envelope.id, priority = envelope.priority, "Job dispatched");
        Ok(envelope)
    }

    /// Pushes a new envelope unless one with the same uniqueness key is
    /// still pending in this queue.
    ///
    /// Returns `Ok(None)` when the dispatch was suppressed as a duplicate.
    pub async fn dispatch_unique(&self) -> Result<Option<JobEnvelope>> {
        let mut envelope = self.build_envelope()?;
        let key = self
            .unique_key
            .clone()
            .unwrap_or_else(|| payload_unique_key(&envelope.payload));
        envelope.unique_key = Some(key);

        if !self.store.push(&envelope).await? {
            self.metrics.record_dispatch(&self.queue, "duplicate");
            debug!(queue = %self.queue, unique_key = ?envelope.unique_key, "Duplicate dispatch suppressed");
            return Ok(None);
        }

        self.metrics.record_dispatch(&self.queue, "dispatched");
        info!(queue = %self.queue, job_id = %envelope.id, unique_key = ?envelope.unique_key, "Unique job dispatched");
        Ok(Some(envelope))
    }

    fn build_envelope(&self) -> Result<JobEnvelope> {
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| QueueError::MissingPayload(self.queue.clone()))?;
        Ok(JobEnvelope::encode(&self.queue, payload)?.with_priority(self.priority))
    }
}
