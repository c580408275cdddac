//! Redis-backed job store.
//!
//! # Key layout
//!
//! For namespace `ns` and queue `q`:
//!
//! - `ns:jobs:q`: ZSET of pending envelope ids. Score is `-priority`; members
//!   are `<20-digit sequence>:<id>`, so `ZPOPMIN` yields the highest priority
//!   and, within a priority, the oldest dispatch.
//! - `ns:jobs:q:seq`: sequence counter for the members above
//! - `ns:jobs:q:data`: HASH id -> envelope json (pending, retrying, leased)
//! - `ns:jobs:q:inprogress`: HASH id -> `<claim ms>:<lease token>` (active leases)
//! - `ns:jobs:q:retry`: ZSET `<priority>:<id>` scored by due time in ms
//! - `ns:jobs:q:unique`: SET of uniqueness keys held by waiting envelopes
//! - `ns:jobs:q:dead`: LIST of dead-letter records, newest at the head
//!
//! Claims, unique pushes and lease endings run as Lua scripts so that each
//! is a single atomic step on the server. Lease endings check the token and
//! do nothing when the lease was recovered in the meantime.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config as PoolSettings, Connection, Pool, PoolConfig, Runtime};
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};

use super::{Lease, QueueBackend, QueueStats};
use crate::config::StoreConfig;
use crate::error::{QueueError, Result};
use crate::scheduler::job::{DeadLetterRecord, JobEnvelope};

/// KEYS: pending, seq, data, unique
/// ARGV: id, priority, envelope json, unique key ("" for none)
const PUSH_SCRIPT: &str = r#"
if ARGV[4] ~= '' then
  if redis.call('SADD', KEYS[4], ARGV[4]) == 0 then
    return 0
  end
end
local seq = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[1], -tonumber(ARGV[2]), string.format('%020d', seq) .. ':' .. ARGV[1])
return 1
"#;

/// KEYS: pending, retry, seq, data, inprogress, unique
/// ARGV: now (ms)
/// Returns {envelope json, lease token} or nil.
const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, member in ipairs(due) do
  local sep = string.find(member, ':', 1, true)
  local priority = tonumber(string.sub(member, 1, sep - 1))
  local id = string.sub(member, sep + 1)
  local seq = redis.call('INCR', KEYS[3])
  redis.call('ZADD', KEYS[1], -priority, string.format('%020d', seq) .. ':' .. id)
  redis.call('ZREM', KEYS[2], member)
end
while true do
  local popped = redis.call('ZPOPMIN', KEYS[1])
  if #popped == 0 then
    return false
  end
  local id = string.sub(popped[1], 22)
  local body = redis.call('HGET', KEYS[4], id)
  if body then
    local token = redis.call('INCR', KEYS[3])
    redis.call('HSET', KEYS[5], id, ARGV[1] .. ':' .. token)
    local ok, envelope = pcall(cjson.decode, body)
    if ok and type(envelope['unique_key']) == 'string' then
      redis.call('SREM', KEYS[6], envelope['unique_key'])
    end
    return {body, token}
  end
end
"#;

/// Lua prelude returning 0 unless `KEYS[lease_key]` maps `ARGV[1]` to an entry
/// carrying the token in `ARGV[token_arg]`; otherwise drops that entry.
fn lease_check(lease_key: usize, token_arg: usize) -> String {
    format!(
        r#"
local held = redis.call('HGET', KEYS[{lease_key}], ARGV[1])
if not held then
  return 0
end
local sep = string.find(held, ':', 1, true)
if not sep or string.sub(held, sep + 1) ~= ARGV[{token_arg}] then
  return 0
end
redis.call('HDEL', KEYS[{lease_key}], ARGV[1])
"#
    )
}

/// KEYS: pending, seq, data, inprogress, retry, unique
/// ARGV: id, priority, envelope json, delay (ms), now (ms), lease token, unique key ("" for none)
const REQUEUE_BODY: &str = r#"
if ARGV[7] ~= '' and redis.call('SADD', KEYS[6], ARGV[7]) == 0 then
  redis.call('HDEL', KEYS[3], ARGV[1])
  return 0
end
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
local delay = tonumber(ARGV[4])
if delay > 0 then
  redis.call('ZADD', KEYS[5], tonumber(ARGV[5]) + delay, ARGV[2] .. ':' .. ARGV[1])
else
  local seq = redis.call('INCR', KEYS[2])
  redis.call('ZADD', KEYS[1], -tonumber(ARGV[2]), string.format('%020d', seq) .. ':' .. ARGV[1])
end
return 1
"#;

/// KEYS: inprogress, data, dead
/// ARGV: id, lease token, dead-letter record ("" for none)
const FINISH_BODY: &str = r#"
redis.call('HDEL', KEYS[2], ARGV[1])
if ARGV[3] ~= '' then
  redis.call('LPUSH', KEYS[3], ARGV[3])
end
return 1
"#;

/// Redis keys belonging to one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub pending: String,
    pub seq: String,
    pub data: String,
    pub in_progress: String,
    pub retry: String,
    pub unique: String,
    pub dead: String,
}

impl QueueKeys {
    /// Builds the key set for `queue` under `namespace`.
    pub fn new(namespace: &str, queue: &str) -> Self {
        let base = if namespace.is_empty() {
            format!("jobs:{}", queue)
        } else {
            format!("{}:jobs:{}", namespace, queue)
        };

        Self {
            seq: format!("{}:seq", base),
            data: format!("{}:data", base),
            in_progress: format!("{}:inprogress", base),
            retry: format!("{}:retry", base),
            unique: format!("{}:unique", base),
            dead: format!("{}:dead", base),
            pending: base,
        }
    }
}

/// Job store backed by a pool of Redis connections.
///
/// Connection acquisition never waits: when every pooled connection is in
/// use the caller gets [`QueueError::PoolExhausted`] straight away.
pub struct RedisBackend {
    pool: Pool,
    namespace: String,
    push_script: Script,
    claim_script: Script,
    requeue_script: Script,
    finish_script: Script,
}

impl RedisBackend {
    /// Creates the pool. No connection is opened yet.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let mut pool_config = PoolConfig::new(config.pool_size.max(1));
        pool_config.timeouts.wait = Some(Duration::ZERO);
        pool_config.timeouts.create = Some(config.connect_timeout);
        pool_config.timeouts.recycle = Some(config.connect_timeout);

        let mut settings = PoolSettings::from_url(config.redis_url());
        settings.pool = Some(pool_config);

        let pool = settings
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| QueueError::Configuration(e.to_string()))?;

        Ok(Self {
            pool,
            namespace: config.namespace.clone(),
            push_script: Script::new(PUSH_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            requeue_script: Script::new(&format!("{}{}", lease_check(4, 6), REQUEUE_BODY)),
            finish_script: Script::new(&format!("{}{}", lease_check(1, 2), FINISH_BODY)),
        })
    }

    /// Returns the key set for `queue`.
    pub fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.namespace, queue)
    }

    async fn conn(&self) -> Result<Connection> {
        Ok(self.pool.get().await?)
    }

    async fn requeue_on(
        &self,
        conn: &mut Connection,
        id: &str,
        token: u64,
        envelope: &JobEnvelope,
        delay: Duration,
    ) -> Result<bool> {
        let keys = self.keys(&envelope.queue);
        let body = envelope.to_json()?;

        let mut invocation = self.requeue_script.prepare_invoke();
        invocation
            .key(&keys.pending)
            .key(&keys.seq)
            .key(&keys.data)
            .key(&keys.in_progress)
            .key(&keys.retry)
            .key(&keys.unique)
            .arg(id)
            .arg(envelope.priority)
            .arg(body)
            .arg(delay.as_millis() as u64)
            .arg(Utc::now().timestamp_millis())
            .arg(token)
            .arg(envelope.unique_key.as_deref().unwrap_or(""));
        let requeued: i64 = invocation.invoke_async(conn).await?;
        Ok(requeued == 1)
    }

    async fn finish_lease(&self, lease: &Lease, dead: Option<String>) -> Result<bool> {
        let envelope = &lease.envelope;
        let keys = self.keys(&envelope.queue);
        let mut conn = self.conn().await?;

        let mut invocation = self.finish_script.prepare_invoke();
        invocation
            .key(&keys.in_progress)
            .key(&keys.data)
            .key(&keys.dead)
            .arg(envelope.id.to_string())
            .arg(lease.token)
            .arg(dead.unwrap_or_default());
        let finished: i64 = invocation.invoke_async(&mut conn).await?;

        if finished == 0 {
            debug!(queue = %envelope.queue, job_id = %envelope.id, "Lease no longer held, nothing to finish");
        }
        Ok(finished == 1)
    }
}

/// Splits an in-progress value into claim time (ms) and lease token.
fn parse_lease_value(value: &str) -> Option<(i64, u64)> {
    let (claimed_at, token) = value.split_once(':')?;
    Some((claimed_at.parse().ok()?, token.parse().ok()?))
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn ping(&self) -> Result<()> {
        let mut conn = self
            .conn()
            .await
            .map_err(|e| QueueError::Connectivity(e.to_string()))?;
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Connectivity(e.to_string()))?;

        if reply != "PONG" {
            return Err(QueueError::Connectivity(format!(
                "unexpected PING reply: {}",
                reply
            )));
        }
        Ok(())
    }

    async fn push(&self, envelope: &JobEnvelope) -> Result<bool> {
        let keys = self.keys(&envelope.queue);
        let body = envelope.to_json()?;
        let mut conn = self.conn().await?;

        let mut invocation = self.push_script.prepare_invoke();
        invocation
            .key(&keys.pending)
            .key(&keys.seq)
            .key(&keys.data)
            .key(&keys.unique)
            .arg(envelope.id.to_string())
            .arg(envelope.priority)
            .arg(body)
            .arg(envelope.unique_key.as_deref().unwrap_or(""));
        let stored: i64 = invocation.invoke_async(&mut conn).await?;

        debug!(queue = %envelope.queue, job_id = %envelope.id, stored = stored == 1, "Pushed envelope");
        Ok(stored == 1)
    }

    async fn claim(&self, queue: &str) -> Result<Option<Lease>> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let mut invocation = self.claim_script.prepare_invoke();
        invocation
            .key(&keys.pending)
            .key(&keys.retry)
            .key(&keys.seq)
            .key(&keys.data)
            .key(&keys.in_progress)
            .key(&keys.unique)
            .arg(Utc::now().timestamp_millis());
        let claimed: Option<(String, u64)> = invocation.invoke_async(&mut conn).await?;

        match claimed {
            Some((data, token)) => Ok(Some(Lease::new(JobEnvelope::from_json(&data)?, token))),
            None => Ok(None),
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<bool> {
        self.finish_lease(lease, None).await
    }

    async fn requeue(
        &self,
        lease: &Lease,
        envelope: &JobEnvelope,
        delay: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let id = lease.envelope.id.to_string();
        self.requeue_on(&mut conn, &id, lease.token, envelope, delay)
            .await
    }

    async fn dead_letter(&self, lease: &Lease, record: &DeadLetterRecord) -> Result<bool> {
        let serialized = serde_json::to_string(record)?;
        self.finish_lease(lease, Some(serialized)).await
    }

    async fn discard(&self, lease: &Lease) -> Result<bool> {
        self.finish_lease(lease, None).await
    }

    async fn recover_in_progress(&self, queue: &str, older_than: Duration) -> Result<usize> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;

        let leases: HashMap<String, String> = conn.hgetall(&keys.in_progress).await?;
        let mut recovered = 0;

        for (id, value) in leases {
            let Some((claimed_at, token)) = parse_lease_value(&value) else {
                warn!(queue = %queue, job_id = %id, value = %value, "Malformed lease entry, skipping");
                continue;
            };
            if claimed_at > cutoff {
                continue;
            }

            let body: Option<String> = conn.hget(&keys.data, &id).await?;
            let Some(body) = body else {
                warn!(queue = %queue, job_id = %id, "Lease without envelope body, dropping");
                conn.hdel::<_, _, ()>(&keys.in_progress, &id).await?;
                continue;
            };

            let envelope = match JobEnvelope::from_json(&body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(queue = %queue, job_id = %id, error = %e, "Unreadable envelope in progress area");
                    continue;
                }
            };

            if self
                .requeue_on(&mut conn, &id, token, &envelope, Duration::ZERO)
                .await?
            {
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let (pending, in_progress, retries, dead): (usize, usize, usize, usize) = redis::pipe()
            .zcard(&keys.pending)
            .hlen(&keys.in_progress)
            .zcard(&keys.retry)
            .llen(&keys.dead)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            queue_name: queue.to_string(),
            pending_jobs: pending,
            in_progress_jobs: in_progress,
            scheduled_retries: retries,
            dead_letter_jobs: dead,
        })
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let keys = self.keys(queue);
        let mut conn = self.conn().await?;
        let data: Vec<String> = conn.lrange(&keys.dead, 0, limit as isize - 1).await?;

        let records: std::result::Result<Vec<DeadLetterRecord>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();
        Ok(records?)
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        let keys = self.keys(queue);
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.del(&keys.pending)
            .del(&keys.seq)
            .del(&keys.data)
            .del(&keys.in_progress)
            .del(&keys.retry)
            .del(&keys.unique)
            .del(&keys.dead);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }
}
