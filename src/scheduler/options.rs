//! Worker pool policy.

use std::time::Duration;

use rand::RngExt;

/// Default number of failed executions before an envelope is terminal.
pub const DEFAULT_MAX_FAILS: u32 = 3;

/// Default number of concurrent executions per pool.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Default wait between claim attempts on an empty queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Delay applied before a failed envelope becomes claimable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryBackoff {
    /// Requeue immediately.
    #[default]
    None,
    /// Same delay after every failure.
    Fixed(Duration),
    /// `base * 2^(fails - 1)` capped at `max`, plus up to 10% jitter.
    Exponential {
        /// Delay after the first failure.
        base: Duration,
        /// Upper bound before jitter.
        max: Duration,
    },
}

impl RetryBackoff {
    /// Returns the delay to apply after the `fail_count`-th failure.
    pub fn delay_for(&self, fail_count: u32) -> Duration {
        match *self {
            RetryBackoff::None => Duration::ZERO,
            RetryBackoff::Fixed(delay) => delay,
            RetryBackoff::Exponential { base, max } => {
                let exponent = fail_count.saturating_sub(1).min(31);
                let delay = base.saturating_mul(1u32 << exponent).min(max);
                let jitter_ceiling = delay.as_millis() as u64 / 10;
                if jitter_ceiling == 0 {
                    return delay;
                }
                let jitter = rand::rng().random_range(0..=jitter_ceiling);
                delay + Duration::from_millis(jitter)
            }
        }
    }
}

/// Per-pool policy.
///
/// Fields not set explicitly keep their defaults: `max_fails = 3`,
/// `max_concurrency = 10`, everything else zero/off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Priority given to envelopes dispatched through the pool's dispatcher.
    pub priority: u32,
    /// Failed executions allowed before the envelope is terminal (at least 1).
    pub max_fails: u32,
    /// Drop exhausted envelopes instead of dead-lettering them.
    pub skip_dead_letter: bool,
    /// Concurrent executions allowed (0 = unbounded).
    pub max_concurrency: usize,
    /// Per-execution limit in seconds (0 = none).
    pub max_timeout: u64,
    /// Wait between claim attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Delay before a failed envelope is claimable again.
    pub retry_backoff: RetryBackoff,
    /// On start, return leases older than this to the queue.
    pub recover_after: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_fails: DEFAULT_MAX_FAILS,
            skip_dead_letter: false,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_timeout: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_backoff: RetryBackoff::None,
            recover_after: None,
        }
    }
}

impl WorkerOptions {
    /// Sets the dispatch priority hint.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the failure budget. Values below 1 are raised to 1.
    pub fn with_max_fails(mut self, max_fails: u32) -> Self {
        self.max_fails = max_fails.max(1);
        self
    }

    /// Drops exhausted envelopes instead of dead-lettering them.
    pub fn with_skip_dead(mut self) -> Self {
        self.skip_dead_letter = true;
        self
    }

    /// Sets the concurrency limit (0 = unbounded).
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets the per-execution limit in seconds (0 = none).
    pub fn with_max_timeout(mut self, seconds: u64) -> Self {
        self.max_timeout = seconds;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the retry backoff policy.
    pub fn with_retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Recovers leases older than `age` when the pool starts.
    pub fn with_recover_after(mut self, age: Duration) -> Self {
        self.recover_after = Some(age);
        self
    }

    /// Returns the execution limit, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.max_timeout > 0).then(|| Duration::from_secs(self.max_timeout))
    }

    /// Returns the effective failure budget.
    pub fn effective_max_fails(&self) -> u32 {
        self.max_fails.max(1)
    }

    /// Returns the number of execution slots.
    pub fn slots(&self) -> usize {
        if self.max_concurrency == 0 {
            tokio::sync::Semaphore::MAX_PERMITS
        } else {
            self.max_concurrency
        }
    }
}
