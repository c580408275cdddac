//! Job definitions for the scheduler.
//!
//! This module defines the durable unit of work and its terminal records:
//!
//! - `JobEnvelope`: an encoded payload plus the routing and retry metadata
//! - `DeadLetterRecord`: an envelope that exhausted its retry budget
//! - `JobState`: the lifecycle an envelope moves through

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{QueueError, Result};

/// Default priority for envelopes (0 is the lowest).
pub const DEFAULT_PRIORITY: u32 = 0;

/// A unit of work stored in a queue.
///
/// The payload is the encoded form of a caller type. The envelope never
/// inspects it; decoding back into the right type is the caller's contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Unique identifier for this envelope.
    pub id: Uuid,
    /// Name of the queue the envelope belongs to.
    pub queue: String,
    /// Encoded payload (UTF-8 JSON).
    pub payload: String,
    /// Key guaranteeing at most one waiting envelope per queue.
    #[serde(default)]
    pub unique_key: Option<String>,
    /// Higher values are claimed first.
    #[serde(default)]
    pub priority: u32,
    /// Number of failed executions so far.
    #[serde(default)]
    pub fail_count: u32,
    /// When the envelope was first dispatched.
    pub enqueued_at: DateTime<Utc>,
    /// Message of the most recent failure.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl JobEnvelope {
    /// Creates an envelope from an already encoded payload.
    pub fn new(queue: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            payload: payload.into(),
            unique_key: None,
            priority: DEFAULT_PRIORITY,
            fail_count: 0,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    /// Encodes `value` and wraps it in a new envelope.
    pub fn encode<T: Serialize>(queue: impl Into<String>, value: &T) -> Result<Self> {
        let payload = serde_json::to_string(value)?;
        Ok(Self::new(queue, payload))
    }

    /// Decodes the payload into the caller's type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the uniqueness key.
    pub fn with_unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    /// Records a failed execution.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.fail_count = self.fail_count.saturating_add(1);
        self.last_error = Some(error.into());
    }

    /// Returns whether another attempt is allowed under `max_fails`.
    pub fn should_retry(&self, max_fails: u32) -> bool {
        self.fail_count < max_fails
    }

    /// Returns the number of remaining attempts under `max_fails`.
    pub fn remaining_attempts(&self, max_fails: u32) -> u32 {
        max_fails.saturating_sub(self.fail_count)
    }

    /// Serializes the envelope for storage.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a stored envelope.
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Derives a uniqueness key from encoded payload bytes.
///
/// Identical payloads always map to the same key.
pub fn payload_unique_key(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    hex::encode(digest)
}

/// Checks that a queue name is usable.
pub fn validate_queue_name(queue: &str) -> Result<()> {
    if queue.trim().is_empty() {
        return Err(QueueError::Configuration(
            "queue name must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// An envelope that exhausted its retry budget, kept for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// The envelope, including queue name, payload and final fail count.
    pub envelope: JobEnvelope,
    /// Description of the final error.
    pub error: String,
    /// When the envelope was moved to the dead-letter area.
    pub dead_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Creates a record for `envelope`.
    pub fn new(envelope: JobEnvelope, error: impl Into<String>) -> Self {
        Self {
            envelope,
            error: error.into(),
            dead_at: Utc::now(),
        }
    }
}

/// Lifecycle state of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting in the queue.
    Pending,
    /// Leased by one execution slot.
    Claimed,
    /// Handler succeeded and the envelope was removed.
    Acked,
    /// Handler failed and the envelope went back to the queue.
    Requeued,
    /// Retry budget exhausted; kept in the dead-letter area.
    DeadLettered,
    /// Retry budget exhausted; dropped.
    Discarded,
}

impl JobState {
    /// Returns whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Acked | JobState::DeadLettered | JobState::Discarded
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Claimed => write!(f, "claimed"),
            JobState::Acked => write!(f, "acked"),
            JobState::Requeued => write!(f, "requeued"),
            JobState::DeadLettered => write!(f, "dead_lettered"),
            JobState::Discarded => write!(f, "discarded"),
        }
    }
}
