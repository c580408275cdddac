//! In-process job store.
//!
//! Mirrors the Redis layout with plain collections behind one mutex, so every
//! operation is atomic with respect to every other. Used by tests and by
//! hosts that want the worker pool without a network store.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Lease, QueueBackend, QueueStats};
use crate::error::Result;
use crate::scheduler::job::{DeadLetterRecord, JobEnvelope};

struct InFlight {
    envelope: JobEnvelope,
    claimed_at: Instant,
    token: u64,
}

#[derive(Default)]
struct MemoryQueue {
    seq: u64,
    pending: BTreeMap<(Reverse<u32>, u64), JobEnvelope>,
    in_progress: HashMap<Uuid, InFlight>,
    retries: Vec<(Instant, JobEnvelope)>,
    unique: HashSet<String>,
    dead: Vec<DeadLetterRecord>,
}

impl MemoryQueue {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn enqueue(&mut self, envelope: JobEnvelope) {
        let seq = self.next_seq();
        self.pending.insert((Reverse(envelope.priority), seq), envelope);
    }

    fn promote_due_retries(&mut self, now: Instant) {
        if self.retries.is_empty() {
            return;
        }
        self.retries.sort_by_key(|(due, _)| *due);
        let split = self.retries.partition_point(|(due, _)| *due <= now);
        let due: Vec<_> = self.retries.drain(..split).collect();
        for (_, envelope) in due {
            self.enqueue(envelope);
        }
    }

    /// Removes the in-progress entry if it still belongs to `lease`.
    fn take_lease(&mut self, lease: &Lease) -> Option<InFlight> {
        let id = lease.envelope.id;
        let held = self
            .in_progress
            .get(&id)
            .is_some_and(|entry| entry.token == lease.token);
        if !held {
            return None;
        }
        self.in_progress.remove(&id)
    }

    /// Puts `envelope` back in line, retaking its uniqueness key.
    fn return_to_queue(&mut self, envelope: JobEnvelope, due: Option<Instant>) -> bool {
        if let Some(key) = &envelope.unique_key {
            if !self.unique.insert(key.clone()) {
                return false;
            }
        }
        match due {
            Some(due) => self.retries.push((due, envelope)),
            None => self.enqueue(envelope),
        }
        true
    }
}

/// Job store kept entirely in process memory.
#[derive(Default)]
pub struct MemoryBackend {
    queues: Mutex<HashMap<String, MemoryQueue>>,
}

impl MemoryBackend {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&mut MemoryQueue) -> R) -> R {
        let mut queues = self.queues.lock();
        let entry = queues.entry(queue.to_string()).or_default();
        f(entry)
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn push(&self, envelope: &JobEnvelope) -> Result<bool> {
        Ok(self.with_queue(&envelope.queue, |q| {
            if let Some(key) = &envelope.unique_key {
                if !q.unique.insert(key.clone()) {
                    return false;
                }
            }
            q.enqueue(envelope.clone());
            true
        }))
    }

    async fn claim(&self, queue: &str) -> Result<Option<Lease>> {
        let now = Instant::now();
        Ok(self.with_queue(queue, |q| {
            q.promote_due_retries(now);
            let (_, envelope) = q.pending.pop_first()?;
            if let Some(key) = &envelope.unique_key {
                q.unique.remove(key);
            }
            let token = q.next_seq();
            q.in_progress.insert(
                envelope.id,
                InFlight {
                    envelope: envelope.clone(),
                    claimed_at: now,
                    token,
                },
            );
            Some(Lease::new(envelope, token))
        }))
    }

    async fn ack(&self, lease: &Lease) -> Result<bool> {
        Ok(self.with_queue(&lease.envelope.queue, |q| q.take_lease(lease).is_some()))
    }

    async fn requeue(
        &self,
        lease: &Lease,
        envelope: &JobEnvelope,
        delay: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        Ok(self.with_queue(&lease.envelope.queue, |q| {
            if q.take_lease(lease).is_none() {
                return false;
            }
            let due = (!delay.is_zero()).then(|| now + delay);
            q.return_to_queue(envelope.clone(), due)
        }))
    }

    async fn dead_letter(&self, lease: &Lease, record: &DeadLetterRecord) -> Result<bool> {
        Ok(self.with_queue(&lease.envelope.queue, |q| {
            if q.take_lease(lease).is_none() {
                return false;
            }
            q.dead.push(record.clone());
            true
        }))
    }

    async fn discard(&self, lease: &Lease) -> Result<bool> {
        Ok(self.with_queue(&lease.envelope.queue, |q| q.take_lease(lease).is_some()))
    }

    async fn recover_in_progress(&self, queue: &str, older_than: Duration) -> Result<usize> {
        let now = Instant::now();
        Ok(self.with_queue(queue, |q| {
            let stale: Vec<Uuid> = q
                .in_progress
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.claimed_at) >= older_than)
                .map(|(id, _)| *id)
                .collect();

            let mut recovered = 0;
            for id in &stale {
                if let Some(entry) = q.in_progress.remove(id) {
                    if q.return_to_queue(entry.envelope, None) {
                        recovered += 1;
                    }
                }
            }
            recovered
        }))
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        Ok(self.with_queue(queue, |q| QueueStats {
            queue_name: queue.to_string(),
            pending_jobs: q.pending.len(),
            in_progress_jobs: q.in_progress.len(),
            scheduled_retries: q.retries.len(),
            dead_letter_jobs: q.dead.len(),
        }))
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        Ok(self.with_queue(queue, |q| {
            q.dead.iter().rev().take(limit).cloned().collect()
        }))
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        self.queues.lock().remove(queue);
        Ok(())
    }
}
