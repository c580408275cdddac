//! Durable job store.
//!
//! The worker pool and dispatchers never talk to a store directly; they go
//! through a [`StoreHandle`], which wraps one [`QueueBackend`]:
//!
//! - [`RedisBackend`]: pooled Redis connections, atomic claims via Lua
//! - [`MemoryBackend`]: in-process store with the same semantics
//!
//! # Lease model
//!
//! `claim` atomically moves the highest-priority pending envelope (FIFO among
//! equal priorities) into the in-progress area and returns a [`Lease`]. The
//! lease ends with exactly one of `ack`, `requeue`, `dead_letter` or
//! `discard`. Until then no other claimer can observe the envelope.
//!
//! Every claim carries a fresh token. Ending a lease whose token no longer
//! matches the in-progress entry (because it was recovered, and possibly
//! claimed again) changes nothing and returns `false`.
//!
//! # Uniqueness
//!
//! A uniqueness key is held only while its envelope waits in the queue
//! (pending or scheduled for retry). Claiming releases it, so a duplicate
//! may be dispatched while the first copy runs. Returning a failed envelope
//! takes the key back; if a newer duplicate already holds it, the failed
//! copy is dropped in favour of the newer one.

pub mod memory;
pub mod redis_backend;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::Result;
use crate::scheduler::job::{DeadLetterRecord, JobEnvelope};

pub use self::memory::MemoryBackend;
pub use self::redis_backend::RedisBackend;

/// Exclusive ownership of one claimed envelope.
#[derive(Debug, Clone)]
pub struct Lease {
    /// The claimed envelope as stored at claim time.
    pub envelope: JobEnvelope,
    /// When the claim happened.
    pub claimed_at: DateTime<Utc>,
    /// Identifies this claim among all claims of the same envelope.
    pub token: u64,
}

impl Lease {
    /// Creates a lease starting now.
    pub fn new(envelope: JobEnvelope, token: u64) -> Self {
        Self {
            envelope,
            claimed_at: Utc::now(),
            token,
        }
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Envelopes waiting to be claimed.
    pub pending_jobs: usize,
    /// Envelopes currently leased.
    pub in_progress_jobs: usize,
    /// Envelopes waiting for their retry delay.
    pub scheduled_retries: usize,
    /// Envelopes in the dead-letter area.
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    /// Returns the total number of envelopes held for this queue.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.in_progress_jobs + self.scheduled_retries + self.dead_letter_jobs
    }
}

/// Operations a job store must provide.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Adds an envelope to its queue.
    ///
    /// When the envelope carries a uniqueness key that is already held by a
    /// waiting envelope in the same queue, nothing is stored and `false` is
    /// returned.
    async fn push(&self, envelope: &JobEnvelope) -> Result<bool>;

    /// Atomically leases the next envelope, if any, releasing its
    /// uniqueness key.
    async fn claim(&self, queue: &str) -> Result<Option<Lease>>;

    /// Ends a lease successfully and removes the envelope.
    ///
    /// Returns `false` when the lease was no longer held.
    async fn ack(&self, lease: &Lease) -> Result<bool>;

    /// Ends a lease by returning `envelope` (with its updated fail count) to
    /// the queue, immediately or once `delay` has elapsed.
    ///
    /// Returns `false` when the lease was no longer held, or when a newer
    /// envelope holds the uniqueness key and this one was dropped.
    async fn requeue(
        &self,
        lease: &Lease,
        envelope: &JobEnvelope,
        delay: Duration,
    ) -> Result<bool>;

    /// Ends a lease by moving the envelope to the dead-letter area.
    ///
    /// Returns `false` when the lease was no longer held.
    async fn dead_letter(&self, lease: &Lease, record: &DeadLetterRecord) -> Result<bool>;

    /// Ends a lease by dropping the envelope.
    ///
    /// Returns `false` when the lease was no longer held.
    async fn discard(&self, lease: &Lease) -> Result<bool>;

    /// Returns envelopes leased longer than `older_than` to the queue.
    async fn recover_in_progress(&self, queue: &str, older_than: Duration) -> Result<usize>;

    /// Returns queue statistics.
    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    /// Returns up to `limit` dead-letter records, newest first.
    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterRecord>>;

    /// Deletes every envelope and record for `queue`.
    async fn clear(&self, queue: &str) -> Result<()>;
}

/// Shared, cloneable access to the job store.
///
/// Construct one at process start and hand clones to every dispatcher and
/// worker pool.
#[derive(Clone)]
pub struct StoreHandle {
    backend: Arc<dyn QueueBackend>,
    config: Option<StoreConfig>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

static SHARED_STORE: OnceLock<StoreHandle> = OnceLock::new();

impl StoreHandle {
    /// Creates a handle backed by a Redis connection pool.
    ///
    /// No connection is opened until the first operation.
    pub fn connect(config: StoreConfig) -> Result<Self> {
        let backend = RedisBackend::new(&config)?;
        info!(url = %config.redacted_url(), namespace = %config.namespace, "Store pool created");
        Ok(Self {
            backend: Arc::new(backend),
            config: Some(config),
        })
    }

    /// Returns the process-wide handle, creating it on first use.
    ///
    /// The first successful call decides the configuration. Later calls get
    /// the same handle back; if they pass a different configuration it is
    /// ignored and a warning is logged.
    pub fn shared(config: StoreConfig) -> Result<Self> {
        if let Some(existing) = SHARED_STORE.get() {
            existing.warn_if_different(&config);
            return Ok(existing.clone());
        }

        let handle = Self::connect(config.clone())?;
        let stored = SHARED_STORE.get_or_init(|| handle);
        stored.warn_if_different(&config);
        Ok(stored.clone())
    }

    /// Creates a handle backed by an in-process store.
    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(MemoryBackend::new()))
    }

    /// Wraps an arbitrary backend.
    pub fn from_backend(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            config: None,
        }
    }

    /// Returns the configuration this handle was built from, if any.
    pub fn config(&self) -> Option<&StoreConfig> {
        self.config.as_ref()
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Checks connectivity. Safe to call concurrently and repeatedly.
    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }

    fn warn_if_different(&self, requested: &StoreConfig) {
        if let Some(active) = &self.config {
            if active != requested {
                warn!(
                    active = %active.redacted_url(),
                    requested = %requested.redacted_url(),
                    active_namespace = %active.namespace,
                    requested_namespace = %requested.namespace,
                    "Shared store already initialized with a different configuration; keeping the first one"
                );
            }
        }
    }
}

impl std::ops::Deref for StoreHandle {
    type Target = dyn QueueBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}
