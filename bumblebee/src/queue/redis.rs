//! Redis-backed queue backend
//!
//! Layout under the configured namespace (`bb` here for brevity):
//!
//! - `bb:queue:ready` — zset of pending entries scored by visibility time;
//!   members carry a fixed-width insertion sequence so equal scores keep
//!   insertion order;
//! - `bb:queue:leased` — zset of claimed entries scored by lease expiry;
//! - `bb:queue:tokens` — hash of entry -> fencing token for the current
//!   lease;
//! - `bb:queue:job:<id>` — JSON job record;
//! - `bb:queue:dead` — zset of dead-lettered entries scored by the
//!   dead-letter time (records stay for inspection);
//! - `bb:queue:seq` — insertion sequence counter.
//!
//! Claim, ack and nack are single Lua scripts so every multi-key
//! transition is atomic: the broker's lease mechanism is the only point of
//! mutual exclusion for job delivery. Claim reaps expired leases before
//! picking, which is how crash recovery happens without a separate reaper
//! process.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use super::{DeadLetter, FailureRecord, JobDescriptor, JobId, JobQueue, LeaseToken, LeasedJob};
use crate::config::BrokerSettings;
use crate::error::{OrchestratorError, Result};

/// Reap expired leases, then claim the earliest visible entry.
///
/// KEYS: ready, leased, tokens; ARGV: now_ms, lease_expiry_ms, token.
static CLAIM_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
        for _, member in ipairs(expired) do
            redis.call('ZREM', KEYS[2], member)
            redis.call('HDEL', KEYS[3], member)
            redis.call('ZADD', KEYS[1], ARGV[1], member)
        end
        local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
        if #due == 0 then
            return false
        end
        local member = due[1]
        redis.call('ZREM', KEYS[1], member)
        redis.call('ZADD', KEYS[2], ARGV[2], member)
        redis.call('HSET', KEYS[3], member, ARGV[3])
        return member
        ",
    )
});

/// Remove a settled job if the caller still holds its lease.
///
/// KEYS: leased, tokens, job; ARGV: entry, token.
static ACK_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        if redis.call('HGET', KEYS[2], ARGV[1]) == ARGV[2] then
            redis.call('ZREM', KEYS[1], ARGV[1])
            redis.call('HDEL', KEYS[2], ARGV[1])
            redis.call('DEL', KEYS[3])
            return 1
        end
        return 0
        ",
    )
});

/// Move a failed job to its destination (retry or dead) if the caller
/// still holds its lease.
///
/// KEYS: leased, tokens, job, destination; ARGV: entry, token, score, json.
static NACK_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        if redis.call('HGET', KEYS[2], ARGV[1]) == ARGV[2] then
            redis.call('ZREM', KEYS[1], ARGV[1])
            redis.call('HDEL', KEYS[2], ARGV[1])
            redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
            redis.call('SET', KEYS[3], ARGV[4])
            return 1
        end
        return 0
        ",
    )
});

#[derive(Debug, Clone)]
struct Keys {
    ready: String,
    leased: String,
    tokens: String,
    dead: String,
    seq: String,
    job_prefix: String,
}

impl Keys {
    fn new(namespace: &str) -> Self {
        Self {
            ready: format!("{namespace}:queue:ready"),
            leased: format!("{namespace}:queue:leased"),
            tokens: format!("{namespace}:queue:tokens"),
            dead: format!("{namespace}:queue:dead"),
            seq: format!("{namespace}:queue:seq"),
            job_prefix: format!("{namespace}:queue:job:"),
        }
    }

    fn job(&self, id: JobId) -> String {
        format!("{}{id}", self.job_prefix)
    }
}

/// Encode a queue entry: zero-padded insertion sequence, then job id.
/// Lexicographic member order inside one score equals insertion order.
fn entry_member(seq: u64, id: JobId) -> String {
    format!("{seq:016}:{id}")
}

/// Recover the job id from a queue entry.
fn entry_job_id(member: &str) -> Result<JobId> {
    let id = member
        .split(':')
        .nth(1)
        .ok_or_else(|| OrchestratorError::JobExecution(format!("malformed queue entry `{member}`")))?;
    Uuid::parse_str(id)
        .map_err(|err| OrchestratorError::JobExecution(format!("bad job id in `{member}`: {err}")))
}

/// Queue backend over the deployment's broker.
#[derive(Clone)]
pub struct RedisJobQueue {
    pool: Pool,
    keys: Keys,
}

impl RedisJobQueue {
    /// Queue over an existing pool.
    #[must_use]
    pub fn new(pool: Pool, namespace: &str) -> Self {
        Self {
            pool,
            keys: Keys::new(namespace),
        }
    }

    /// Build a pool from broker settings and wrap it.
    ///
    /// # Errors
    ///
    /// Fails when the broker URL does not parse or the pool cannot be
    /// created. Connection failures surface later, per operation.
    pub fn connect(settings: &BrokerSettings) -> Result<Self> {
        let pool = PoolConfig::from_url(settings.url())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| OrchestratorError::Config(format!("broker pool: {err}")))?;
        Ok(Self::new(pool, &settings.namespace))
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|err| OrchestratorError::TransientDependency {
                name: "broker".to_string(),
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: JobDescriptor) -> Result<JobId> {
        let mut conn = self.conn().await?;
        let seq: u64 = conn.incr(&self.keys.seq, 1u64).await?;
        let member = entry_member(seq, job.id);
        let record = serde_json::to_string(&job)?;
        let score = job.scheduled_for.timestamp_millis();

        redis::pipe()
            .atomic()
            .set(self.keys.job(job.id), record)
            .ignore()
            .zadd(&self.keys.ready, member, score)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(job.id)
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<LeasedJob>> {
        let mut conn = self.conn().await?;
        let now_ms = Utc::now().timestamp_millis();
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let token = Uuid::new_v4();

        let member: Option<String> = CLAIM_SCRIPT
            .key(&self.keys.ready)
            .key(&self.keys.leased)
            .key(&self.keys.tokens)
            .arg(now_ms)
            .arg(now_ms.saturating_add(lease_ms))
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await?;
        let Some(member) = member else {
            return Ok(None);
        };

        let job_id = entry_job_id(&member)?;
        let record: Option<String> = conn.get(self.keys.job(job_id)).await?;
        let Some(record) = record else {
            // Entry without a record; drop the orphan claim.
            tracing::warn!(entry = %member, "leased entry had no job record, dropping");
            redis::pipe()
                .atomic()
                .zrem(&self.keys.leased, &member)
                .ignore()
                .hdel(&self.keys.tokens, &member)
                .ignore()
                .query_async::<()>(&mut conn)
                .await?;
            return Ok(None);
        };

        let job: JobDescriptor = serde_json::from_str(&record)?;
        Ok(Some(LeasedJob {
            job,
            token: LeaseToken {
                job_id,
                entry: member,
                token,
            },
        }))
    }

    async fn ack(&self, token: &LeaseToken) -> Result<()> {
        let mut conn = self.conn().await?;
        let settled: i64 = ACK_SCRIPT
            .key(&self.keys.leased)
            .key(&self.keys.tokens)
            .key(self.keys.job(token.job_id))
            .arg(&token.entry)
            .arg(token.token.to_string())
            .invoke_async(&mut conn)
            .await?;
        if settled == 0 {
            tracing::debug!(job_id = %token.job_id, "stale ack ignored");
        }
        Ok(())
    }

    async fn nack(&self, token: &LeaseToken, requeue_delay: Duration, error: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let record: Option<String> = conn.get(self.keys.job(token.job_id)).await?;
        let Some(record) = record else {
            return Ok(());
        };
        let mut job: JobDescriptor = serde_json::from_str(&record)?;

        let now = Utc::now();
        job.attempts += 1;
        job.failures.push(FailureRecord {
            attempt: job.attempts,
            error: error.to_string(),
            failed_at: now,
        });

        let exhausted = job.attempts >= job.max_attempts;
        let (destination, score) = if exhausted {
            (&self.keys.dead, now.timestamp_millis())
        } else {
            let retry_at = now + crate::clock::to_chrono(requeue_delay);
            job.scheduled_for = retry_at;
            (&self.keys.ready, retry_at.timestamp_millis())
        };

        let settled: i64 = NACK_SCRIPT
            .key(&self.keys.leased)
            .key(&self.keys.tokens)
            .key(self.keys.job(token.job_id))
            .key(destination)
            .arg(&token.entry)
            .arg(token.token.to_string())
            .arg(score)
            .arg(serde_json::to_string(&job)?)
            .invoke_async(&mut conn)
            .await?;

        if settled == 0 {
            tracing::debug!(job_id = %token.job_id, "stale nack ignored");
        } else if exhausted {
            tracing::warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                "retry budget spent, dead-lettering job"
            );
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut conn = self.conn().await?;
        let entries: Vec<(String, f64)> = conn.zrange_withscores(&self.keys.dead, 0, -1).await?;

        let mut dead = Vec::with_capacity(entries.len());
        for (member, score) in entries {
            let job_id = entry_job_id(&member)?;
            let record: Option<String> = conn.get(self.keys.job(job_id)).await?;
            let Some(record) = record else {
                tracing::warn!(entry = %member, "dead-letter entry had no job record");
                continue;
            };
            let job: JobDescriptor = serde_json::from_str(&record)?;
            #[allow(clippy::cast_possible_truncation)]
            let dead_lettered_at = DateTime::<Utc>::from_timestamp_millis(score as i64)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            dead.push(DeadLetter {
                job,
                dead_lettered_at,
            });
        }
        Ok(dead)
    }
}
