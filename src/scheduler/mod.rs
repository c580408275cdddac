//! Job dispatch and execution on top of the job store.
//!
//! - **Dispatcher**: typed producer that encodes payloads into envelopes
//! - **WorkerPool**: bounded set of execution slots consuming one queue
//! - **JobEnvelope**: the unit of work persisted in the store
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  Dispatcher  │
//!                      └──────┬───────┘
//!                             │ push
//!                      ┌──────▼───────┐
//!                      │  Job store   │
//!                      │ (priority Z) │
//!                      └──────┬───────┘
//!                             │ claim (atomic)
//!                      ┌──────▼───────┐
//!                      │  Claim loop  │
//!                      └──────┬───────┘
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Slot 1  │         │ Slot 2  │         │ Slot N  │
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use redjob::scheduler::{WorkerOptions, WorkerPool};
//! use redjob::store::StoreHandle;
//!
//! let store = StoreHandle::connect(StoreConfig::from_env())?;
//! let pool = WorkerPool::<Signup>::configure(
//!     store.clone(),
//!     "signups",
//!     WorkerOptions::default().with_max_fails(5).with_max_timeout(30),
//! )?;
//!
//! pool.run(|ctx, signup: Signup| async move {
//!     send_welcome(&signup.email).await?;
//!     Ok(())
//! })
//! .await?;
//!
//! let mut dispatcher = pool.dispatcher();
//! dispatcher.set_payload(Signup { email: "a@example.com".into() });
//! dispatcher.dispatch_unique().await?;
//!
//! pool.stop().await;
//! ```
//!
//! # Failure handling
//!
//! - Handler errors, panics and timeouts all count as one failure
//! - Below `max_fails` the envelope returns to the queue
//! - At `max_fails` it is dead-lettered, or dropped with `skip_dead_letter`

pub mod context;
pub mod dispatcher;
pub mod job;
pub mod options;
pub mod worker_pool;

pub use context::JobContext;
pub use dispatcher::Dispatcher;
pub use job::{DeadLetterRecord, JobEnvelope, JobState, DEFAULT_PRIORITY};
pub use options::{
    RetryBackoff, WorkerOptions, DEFAULT_MAX_CONCURRENCY, DEFAULT_MAX_FAILS, DEFAULT_POLL_INTERVAL,
};
pub use worker_pool::{PoolError, PoolStats, WorkerPool};
