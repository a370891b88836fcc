//! Broker-backed job queue
//!
//! The shared medium between the scheduler (producer) and the worker pool
//! (consumers). Delivery is at-least-once under a lease discipline:
//!
//! - a job is visible to consumers only once its `scheduled_for` has
//!   passed; visible jobs are delivered in ascending
//!   `(scheduled_for, insertion order)`;
//! - `dequeue` hands out a time-bounded exclusive [`LeaseToken`]; until the
//!   lease expires no other consumer can receive the job;
//! - an unacknowledged job becomes visible again when its lease expires
//!   (crash recovery), re-entering the queue at its expiry time;
//! - `ack` permanently removes the job; `nack` records the failure,
//!   increments the attempt count and re-schedules after a delay, or moves
//!   the job to the dead-letter state once the retry budget is spent;
//! - `ack` and `nack` against an expired or foreign lease are no-ops, so a
//!   worker that outlives its lease cannot resurrect an already-requeued
//!   job.
//!
//! Exactly-once execution is NOT guaranteed: business logic must tolerate
//! duplicate execution on lease-timeout races.
//!
//! Two implementations share these semantics: [`RedisJobQueue`] for
//! production and [`MemoryJobQueue`] for tests and local development.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub use self::memory::MemoryJobQueue;
pub use self::redis::RedisJobQueue;

/// Unique job identifier.
pub type JobId = Uuid;

/// One recorded execution failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Which attempt failed (1-based).
    pub attempt: u32,
    /// The recorded error.
    pub error: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Unique id.
    pub id: JobId,
    /// Handler dispatch key.
    pub job_type: String,
    /// Opaque payload; the queue never interprets it.
    pub payload: serde_json::Value,
    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest instant the job may be delivered.
    pub scheduled_for: DateTime<Utc>,
    /// Failed executions recorded so far.
    pub attempts: u32,
    /// Retry budget; reaching it dead-letters the job.
    pub max_attempts: u32,
    /// Failure history, newest last.
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
}

impl JobDescriptor {
    /// A job visible immediately.
    #[must_use]
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            payload,
            enqueued_at: now,
            scheduled_for: now,
            attempts: 0,
            max_attempts,
            failures: Vec::new(),
        }
    }

    /// Delay first visibility until `at`.
    #[must_use]
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = at;
        self
    }
}

/// Time-bounded exclusive claim on a dequeued job.
///
/// Opaque outside the queue: consumers hold it only to `ack` or `nack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    /// The leased job.
    pub job_id: JobId,
    /// Backend-internal queue entry identifier.
    pub(crate) entry: String,
    /// Fencing token distinguishing this lease from any later one.
    pub(crate) token: Uuid,
}

/// A dequeued job together with its lease.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    /// The job descriptor as of dequeue time.
    pub job: JobDescriptor,
    /// The lease to settle with `ack` or `nack`.
    pub token: LeaseToken,
}

/// A job that exhausted its retry budget, held for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The final descriptor, including the full failure history.
    pub job: JobDescriptor,
    /// When the job was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

/// The queue contract shared by all backends.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. Returns its id.
    async fn enqueue(&self, job: JobDescriptor) -> Result<JobId>;

    /// Claim the next visible job under a lease of `lease` duration.
    /// Returns `None` when nothing is visible.
    async fn dequeue(&self, lease: Duration) -> Result<Option<LeasedJob>>;

    /// Permanently remove an executed job. A no-op when the lease has
    /// expired or was superseded.
    async fn ack(&self, token: &LeaseToken) -> Result<()>;

    /// Record a failed execution and either re-schedule the job after
    /// `requeue_delay` or dead-letter it once the budget is spent. A no-op
    /// when the lease has expired or was superseded.
    async fn nack(&self, token: &LeaseToken, requeue_delay: Duration, error: &str) -> Result<()>;

    /// Read-only listing of dead-lettered jobs, oldest first.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults() {
        let now = Utc::now();
        let job = JobDescriptor::new("demo.task", serde_json::json!({"n": 1}), 3, now);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.scheduled_for, now);
        assert!(job.failures.is_empty());
    }

    #[test]
    fn descriptor_roundtrips_through_json() {
        let now = Utc::now();
        let job = JobDescriptor::new("demo.task", serde_json::json!(null), 1, now)
            .scheduled_at(now + chrono::Duration::seconds(10));
        let json = serde_json::to_string(&job).unwrap();
        let back: JobDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.scheduled_for, job.scheduled_for);
    }
}
