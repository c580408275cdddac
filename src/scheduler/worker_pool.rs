//! Worker pool that executes envelopes from one queue.
//!
//! A single claim loop leases envelopes while execution slots are free and
//! hands each lease to its own task. Every handler invocation runs in a
//! further task of its own, so a panic or a timeout is settled at the slot
//! boundary and never reaches the loop or sibling executions.
//!
//! # Lifecycle
//!
//! - [`WorkerPool::configure`] binds a pool to a store and queue
//! - [`WorkerPool::run`] starts the claim loop in the background
//! - [`WorkerPool::stop`] stops claiming and waits for in-flight executions

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::JobContext;
use super::dispatcher::Dispatcher;
use super::job::{validate_queue_name, DeadLetterRecord};
use super::options::WorkerOptions;
use crate::error::QueueError;
use crate::metrics::{JobOutcome, MetricsCollector};
use crate::observer::{topics, EventBus};
use crate::store::{Lease, QueueStats, StoreHandle};

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type BoxedHandler<T> = Arc<dyn Fn(JobContext, T) -> HandlerFuture + Send + Sync>;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Store or configuration failure.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    /// Execution slots (`usize`-bounded when concurrency is unbounded).
    pub max_concurrency: usize,
    /// Executions currently running.
    pub in_flight: usize,
    /// Executions that succeeded.
    pub acked: u64,
    /// Failures that were returned to the queue.
    pub retried: u64,
    /// Failures that exhausted the budget and were dead-lettered.
    pub dead_lettered: u64,
    /// Failures that exhausted the budget and were dropped.
    pub discarded: u64,
    /// Average handler execution time.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of finished executions.
    pub fn total_processed(&self) -> u64 {
        self.acked + self.retried + self.dead_lettered + self.discarded
    }

    /// Returns the number of failed executions.
    pub fn failures(&self) -> u64 {
        self.retried + self.dead_lettered + self.discarded
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.acked as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    discarded: AtomicU64,
    total_duration_ms: AtomicU64,
    in_flight: AtomicU64,
}

impl SharedPoolStats {
    fn record(&self, outcome: JobOutcome, duration: Duration) {
        let counter = match outcome {
            JobOutcome::Acked => &self.acked,
            JobOutcome::Retried => &self.retried,
            JobOutcome::DeadLettered => &self.dead_lettered,
            JobOutcome::Discarded => &self.discarded,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, max_concurrency: usize) -> PoolStats {
        let acked = self.acked.load(Ordering::SeqCst);
        let retried = self.retried.load(Ordering::SeqCst);
        let dead_lettered = self.dead_lettered.load(Ordering::SeqCst);
        let discarded = self.discarded.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total_jobs = acked + retried + dead_lettered + discarded;
        let average_job_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            max_concurrency,
            in_flight: self.in_flight.load(Ordering::SeqCst) as usize,
            acked,
            retried,
            dead_lettered,
            discarded,
            average_job_duration,
        }
    }
}

/// State shared by the pool handle, the claim loop and every slot.
struct PoolShared {
    store: StoreHandle,
    queue: String,
    options: WorkerOptions,
    stats: SharedPoolStats,
    metrics: MetricsCollector,
    events: Option<EventBus>,
}

struct Running {
    shutdown: CancellationToken,
    claim_loop: JoinHandle<()>,
}

/// Pool of execution slots serving one queue with payloads of type `T`.
pub struct WorkerPool<T> {
    shared: Arc<PoolShared>,
    running: Mutex<Option<Running>>,
    is_running: AtomicBool,
    _payload: PhantomData<fn() -> T>,
}

impl<T> WorkerPool<T> {
    /// Creates a pool bound to `queue`. Nothing runs until [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Queue` when the queue name is empty.
    pub fn configure(
        store: StoreHandle,
        queue: impl Into<String>,
        options: WorkerOptions,
    ) -> Result<Self, PoolError> {
        let queue = queue.into();
        validate_queue_name(&queue)?;

        Ok(Self {
            shared: Arc::new(PoolShared {
                store,
                queue,
                options,
                stats: SharedPoolStats::default(),
                metrics: MetricsCollector::new(),
                events: None,
            }),
            running: Mutex::new(None),
            is_running: AtomicBool::new(false),
            _payload: PhantomData,
        })
    }

    /// Publishes job lifecycle events to `bus` (see [`topics`]).
    ///
    /// Has no effect once the pool has been started.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.events = Some(bus),
            None => warn!(queue = %self.shared.queue, "Event bus ignored: pool already started"),
        }
        self
    }

    /// Stops claiming and waits for in-flight executions to settle.
    ///
    /// Safe to call more than once, before `run`, or concurrently; every call
    /// returns only after the pool is idle.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running {
            shutdown,
            claim_loop,
        }) = running.take()
        else {
            return;
        };

        info!(queue = %self.shared.queue, "Initiating worker pool shutdown");
        shutdown.cancel();

        if let Err(e) = claim_loop.await {
            error!(queue = %self.shared.queue, error = %e, "Claim loop panicked during shutdown");
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!(queue = %self.shared.queue, "Worker pool shutdown complete");
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.shared
            .stats
            .to_pool_stats(self.shared.options.slots())
    }

    /// Fetches store-side statistics for the queue and updates the depth gauge.
    pub async fn queue_stats(&self) -> Result<QueueStats, PoolError> {
        let stats = self.shared.store.stats(&self.shared.queue).await?;
        self.shared
            .metrics
            .update_queue_depth(&self.shared.queue, stats.pending_jobs);
        Ok(stats)
    }

    /// Returns whether the claim loop is running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the queue this pool serves.
    pub fn queue(&self) -> &str {
        &self.shared.queue
    }

    /// Returns the pool policy.
    pub fn options(&self) -> &WorkerOptions {
        &self.shared.options
    }
}

impl<T: Serialize> WorkerPool<T> {
    /// Returns a dispatcher for this pool's queue carrying its priority hint.
    pub fn dispatcher(&self) -> Dispatcher<T> {
        Dispatcher::bound(self.shared.store.clone(), self.shared.queue.clone())
            .with_priority(self.shared.options.priority)
    }
}

impl<T> WorkerPool<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Starts the claim loop with `handler` and returns immediately.
    ///
    /// When [`WorkerOptions::recover_after`] is set, leases older than that
    /// age are first returned to the queue.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), PoolError>
    where
        F: Fn(JobContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(PoolError::AlreadyRunning);
        }

        if let Some(age) = self.shared.options.recover_after {
            match self
                .shared
                .store
                .recover_in_progress(&self.shared.queue, age)
                .await
            {
                Ok(recovered) if recovered > 0 => {
                    info!(queue = %self.shared.queue, recovered = recovered, "Recovered stale leases");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(queue = %self.shared.queue, error = %e, "Failed to recover stale leases");
                }
            }
        }

        let handler: BoxedHandler<T> =
            Arc::new(move |ctx, payload| -> HandlerFuture { Box::pin(handler(ctx, payload)) });
        let shutdown = CancellationToken::new();
        let claim_loop = tokio::spawn(claim_loop(
            Arc::clone(&self.shared),
            handler,
            shutdown.clone(),
        ));

        *running = Some(Running {
            shutdown,
            claim_loop,
        });
        self.is_running.store(true, Ordering::SeqCst);

        info!(
            queue = %self.shared.queue,
            max_concurrency = self.shared.options.max_concurrency,
            max_fails = self.shared.options.effective_max_fails(),
            max_timeout = self.shared.options.max_timeout,
            "Worker pool started"
        );

        Ok(())
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        // The loop drains in-flight executions on its own once cancelled.
        if let Some(running) = self.running.get_mut().as_ref() {
            running.shutdown.cancel();
        }
    }
}

/// Claims envelopes while slots are free until `shutdown` is cancelled,
/// then waits for every started slot.
async fn claim_loop<T>(shared: Arc<PoolShared>, handler: BoxedHandler<T>, shutdown: CancellationToken)
where
    T: DeserializeOwned + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(shared.options.slots()));
    let mut slots = JoinSet::new();
    let poll_interval = shared.options.poll_interval;

    debug!(queue = %shared.queue, "Claim loop started");

    loop {
        while let Some(finished) = slots.try_join_next() {
            if let Err(e) = finished {
                error!(queue = %shared.queue, error = %e, "Execution slot failed");
            }
        }

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // A claim is never raced against shutdown: dropping it mid-flight
        // could lose a lease.
        if shutdown.is_cancelled() {
            break;
        }

        match shared.store.claim(&shared.queue).await {
            Ok(Some(lease)) => {
                slots.spawn(run_slot(
                    Arc::clone(&shared),
                    Arc::clone(&handler),
                    lease,
                    permit,
                ));
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(e) => {
                drop(permit);
                error!(queue = %shared.queue, error = %e, "Failed to claim job");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    info!(queue = %shared.queue, in_flight = slots.len(), "Claim loop stopped, draining executions");

    while let Some(finished) = slots.join_next().await {
        if let Err(e) = finished {
            error!(queue = %shared.queue, error = %e, "Execution slot failed");
        }
    }
}

/// Executes one lease and settles it. Holds the slot permit until done.
async fn run_slot<T>(
    shared: Arc<PoolShared>,
    handler: BoxedHandler<T>,
    lease: Lease,
    _permit: OwnedSemaphorePermit,
) where
    T: DeserializeOwned + Send + 'static,
{
    let envelope = &lease.envelope;
    let attempt = envelope.fail_count.saturating_add(1);
    let start_time = Instant::now();

    debug!(queue = %shared.queue, job_id = %envelope.id, attempt = attempt, "Processing job");

    shared.stats.increment_in_flight();
    shared.metrics.inc_jobs_in_progress(&shared.queue);

    let result = execute(&shared, &handler, &lease, attempt).await;
    let duration = start_time.elapsed();
    let failure = result.as_ref().err().cloned();

    let outcome = settle(&shared, &lease, result).await;

    shared.stats.decrement_in_flight();
    shared.metrics.dec_jobs_in_progress(&shared.queue);
    shared.stats.record(outcome, duration);
    shared
        .metrics
        .record_job_finished(&shared.queue, outcome, duration);

    if let Some(bus) = &shared.events {
        let topic = match outcome {
            JobOutcome::Acked => topics::JOB_ACKED,
            JobOutcome::Retried => topics::JOB_RETRIED,
            JobOutcome::DeadLettered => topics::JOB_DEAD_LETTERED,
            JobOutcome::Discarded => topics::JOB_DISCARDED,
        };
        let fail_count = envelope.fail_count + u32::from(failure.is_some());
        let state = outcome.state();
        bus.publish(
            topic,
            serde_json::json!({
                "queue": shared.queue,
                "job_id": envelope.id,
                "state": state.to_string(),
                "terminal": state.is_terminal(),
                "fail_count": fail_count,
                "duration_ms": duration.as_millis() as u64,
                "error": failure,
            }),
        );
    }
}

/// Runs the handler in its own task, bounded by the pool's time limit.
///
/// Returns the failure message when the payload does not decode, the handler
/// errors, panics or runs out of time.
async fn execute<T>(
    shared: &PoolShared,
    handler: &BoxedHandler<T>,
    lease: &Lease,
    attempt: u32,
) -> Result<(), String>
where
    T: DeserializeOwned + Send + 'static,
{
    let envelope = &lease.envelope;
    let payload: T = envelope
        .decode()
        .map_err(|e| format!("Payload could not be decoded: {}", e))?;

    let limit = shared.options.timeout();
    let token = CancellationToken::new();
    let ctx = JobContext::new(envelope.id, &shared.queue, attempt, limit, token.clone());
    let mut task = tokio::spawn(handler(ctx, payload));

    let joined = match limit {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                token.cancel();
                task.abort();
                return Err(QueueError::Timeout(limit).to_string());
            }
        },
        None => (&mut task).await,
    };

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(e) if e.is_panic() => {
            let detail = panic_message(e.into_panic());
            error!(
                queue = %shared.queue,
                job_id = %envelope.id,
                attempt = attempt,
                panic = %detail,
                "Job handler panicked"
            );
            Err(format!("Handler panicked: {}", detail))
        }
        Err(e) => Err(format!("Handler task cancelled: {}", e)),
    }
}

/// Ends the lease according to the execution result and the failure budget.
async fn settle(shared: &PoolShared, lease: &Lease, result: Result<(), String>) -> JobOutcome {
    let queue = &shared.queue;
    let job_id = lease.envelope.id;

    let message = match result {
        Ok(()) => {
            match shared.store.ack(lease).await {
                Ok(true) => {}
                Ok(false) => warn!(queue = %queue, job_id = %job_id, "Lease was recovered before ack"),
                Err(e) => error!(queue = %queue, job_id = %job_id, error = %e, "Failed to ack job"),
            }
            info!(queue = %queue, job_id = %job_id, "Job completed successfully");
            return JobOutcome::Acked;
        }
        Err(message) => message,
    };

    let max_fails = shared.options.effective_max_fails();
    let mut envelope = lease.envelope.clone();
    envelope.record_failure(message.as_str());

    if envelope.should_retry(max_fails) {
        let delay = shared.options.retry_backoff.delay_for(envelope.fail_count);
        warn!(
            queue = %queue,
            job_id = %job_id,
            fail_count = envelope.fail_count,
            remaining_attempts = envelope.remaining_attempts(max_fails),
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "Job failed, requeueing for retry"
        );
        match shared.store.requeue(lease, &envelope, delay).await {
            Ok(true) => {}
            Ok(false) => warn!(
                queue = %queue,
                job_id = %job_id,
                "Job not requeued: lease was recovered or a newer duplicate is waiting"
            ),
            Err(e) => error!(queue = %queue, job_id = %job_id, error = %e, "Failed to requeue job"),
        }
        return JobOutcome::Retried;
    }

    if shared.options.skip_dead_letter {
        warn!(
            queue = %queue,
            job_id = %job_id,
            fail_count = envelope.fail_count,
            error = %message,
            "Job failed permanently, discarding"
        );
        match shared.store.discard(lease).await {
            Ok(true) => {}
            Ok(false) => warn!(queue = %queue, job_id = %job_id, "Lease was recovered before discard"),
            Err(e) => error!(queue = %queue, job_id = %job_id, error = %e, "Failed to discard job"),
        }
        return JobOutcome::Discarded;
    }

    error!(
        queue = %queue,
        job_id = %job_id,
        fail_count = envelope.fail_count,
        error = %message,
        "Job failed permanently, moving to dead letter queue"
    );
    let record = DeadLetterRecord::new(envelope, message);
    match shared.store.dead_letter(lease, &record).await {
        Ok(true) => {}
        Ok(false) => warn!(queue = %queue, job_id = %job_id, "Lease was recovered before dead-lettering"),
        Err(e) => error!(queue = %queue, job_id = %job_id, error = %e, "Failed to move job to dead letter queue"),
    }
    JobOutcome::DeadLettered
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        id: u32,
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn fast_options() -> WorkerOptions {
        WorkerOptions::default().with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();

        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.total_processed(), 0);
        assert_eq!(stats.failures(), 0);
        assert_eq!(stats.average_job_duration, Duration::ZERO);
        assert!((stats.success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            max_concurrency: 4,
            in_flight: 2,
            acked: 80,
            retried: 10,
            dead_lettered: 6,
            discarded: 4,
            average_job_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert_eq!(stats.failures(), 20);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::default();

        stats.record(JobOutcome::Acked, Duration::from_secs(10));
        stats.record(JobOutcome::Acked, Duration::from_secs(20));
        stats.record(JobOutcome::DeadLettered, Duration::from_secs(5));

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.max_concurrency, 4);
        assert_eq!(pool_stats.acked, 2);
        assert_eq!(pool_stats.dead_lettered, 1);
        // (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    #[test]
    fn test_shared_pool_stats_in_flight() {
        let stats = SharedPoolStats::default();

        stats.increment_in_flight();
        stats.increment_in_flight();
        stats.decrement_in_flight();

        assert_eq!(stats.to_pool_stats(1).in_flight, 1);
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::AlreadyRunning;
        assert!(err.to_string().contains("already running"));

        let err = PoolError::from(QueueError::Configuration("queue name must not be empty".into()));
        assert!(err.to_string().contains("queue name"));
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("static str")), "static str");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic payload");
    }

    #[test]
    fn test_configure_rejects_empty_queue() {
        let result = WorkerPool::<Ping>::configure(StoreHandle::in_memory(), "", WorkerOptions::default());
        assert!(matches!(result, Err(PoolError::Queue(QueueError::Configuration(_)))));
    }

    #[tokio::test]
    async fn test_dispatcher_carries_pool_priority() {
        let pool = WorkerPool::<Ping>::configure(
            StoreHandle::in_memory(),
            "pings",
            WorkerOptions::default().with_priority(7),
        )
        .unwrap();

        let dispatcher = pool.dispatcher();
        assert_eq!(dispatcher.queue(), "pings");
        assert_eq!(dispatcher.priority(), 7);
    }

    #[tokio::test]
    async fn test_stop_before_run_is_noop() {
        let pool = WorkerPool::<Ping>::configure(StoreHandle::in_memory(), "pings", fast_options()).unwrap();
        pool.stop().await;
        pool.stop().await;
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let pool = WorkerPool::<Ping>::configure(StoreHandle::in_memory(), "pings", fast_options()).unwrap();
        pool.run(|_ctx, _ping: Ping| async { Ok(()) }).await.unwrap();

        let second = pool.run(|_ctx, _ping: Ping| async { Ok(()) }).await;
        assert!(matches!(second, Err(PoolError::AlreadyRunning)));

        pool.stop().await;
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_processes_and_acks() {
        let store = StoreHandle::in_memory();
        let pool = WorkerPool::<Ping>::configure(store.clone(), "pings", fast_options()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        pool.run(move |ctx, ping: Ping| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(ctx.queue(), "pings");
                assert_eq!(ctx.attempt(), 1);
                counter.fetch_add(ping.id as usize, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        let mut dispatcher = pool.dispatcher();
        dispatcher.set_payload(Ping { id: 3 });
        dispatcher.dispatch().await.unwrap();

        wait_until(|| pool.stats().acked == 1).await;
        pool.stop().await;

        assert_eq!(seen.load(Ordering::SeqCst), 3);
        let stats = store.stats("pings").await.unwrap();
        assert_eq!(stats.total_jobs(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_payload_counts_as_failure() {
        let store = StoreHandle::in_memory();
        let pool = WorkerPool::<Ping>::configure(
            store.clone(),
            "pings",
            fast_options().with_max_fails(1),
        )
        .unwrap();
        let invoked = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&invoked);
        pool.run(move |_ctx, _ping: Ping| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        store
            .push(&crate::scheduler::job::JobEnvelope::new("pings", "not json"))
            .await
            .unwrap();

        wait_until(|| pool.stats().dead_lettered == 1).await;
        pool.stop().await;

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        let dead = store.dead_letters("pings", 10).await.unwrap();
        assert!(dead[0].error.contains("decoded"));
    }

    #[tokio::test]
    async fn test_publishes_lifecycle_events() {
        use crate::observer::Observer;

        #[derive(Default)]
        struct Collect(parking_lot::Mutex<Vec<serde_json::Value>>);

        #[async_trait::async_trait]
        impl Observer for Collect {
            async fn handle(&self, _topic: &str, data: serde_json::Value) {
                self.0.lock().push(data);
            }

            fn name(&self) -> &str {
                "collect"
            }
        }

        let bus = EventBus::new();
        let dead = Arc::new(Collect::default());
        bus.subscribe(topics::JOB_DEAD_LETTERED, dead.clone());

        let pool = WorkerPool::<Ping>::configure(
            StoreHandle::in_memory(),
            "pings",
            fast_options().with_max_fails(1),
        )
        .unwrap()
        .with_event_bus(bus);

        pool.run(|_ctx, _ping: Ping| async { Err::<(), _>(anyhow::anyhow!("always fails")) })
            .await
            .unwrap();

        let mut dispatcher = pool.dispatcher();
        dispatcher.set_payload(Ping { id: 9 });
        let envelope = dispatcher.dispatch().await.unwrap();

        wait_until(|| dead.0.lock().len() == 1).await;
        pool.stop().await;

        let event = dead.0.lock()[0].clone();
        assert_eq!(event["queue"], "pings");
        assert_eq!(event["job_id"], envelope.id.to_string());
        assert_eq!(event["fail_count"], 1);
        assert_eq!(event["state"], "dead_lettered");
        assert_eq!(event["terminal"], true);
        assert_eq!(event["error"], "always fails");
    }

    #[tokio::test]
    async fn test_queue_stats_reads_store() {
        let store = StoreHandle::in_memory();
        let pool = WorkerPool::<Ping>::configure(store, "pings", fast_options()).unwrap();

        let mut dispatcher = pool.dispatcher();
        dispatcher.set_payload(Ping { id: 1 });
        dispatcher.dispatch().await.unwrap();

        let stats = pool.queue_stats().await.unwrap();
        assert_eq!(stats.pending_jobs, 1);
    }
}
