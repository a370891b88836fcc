//! In-memory queue backend
//!
//! Same contract as the Redis backend over process-local state, with a
//! pluggable [`Clock`] so visibility and lease expiry are deterministic
//! under test. Also serves single-process development setups where no
//! broker is running.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{DeadLetter, FailureRecord, JobDescriptor, JobId, JobQueue, LeaseToken, LeasedJob};
use crate::clock::{to_chrono, Clock, SystemClock};
use crate::error::Result;

#[derive(Debug)]
struct Lease {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, JobDescriptor>,
    /// Visible/pending jobs keyed by `(scheduled_for millis, insertion seq)`.
    ready: BTreeMap<(i64, u64), JobId>,
    leases: HashMap<JobId, Lease>,
    dead: Vec<DeadLetter>,
    seq: u64,
}

impl State {
    fn push_ready(&mut self, at_ms: i64, job_id: JobId) {
        let seq = self.seq;
        self.seq += 1;
        self.ready.insert((at_ms, seq), job_id);
    }

    /// Return expired leases to the ready queue at their expiry time.
    fn reap_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<JobId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for job_id in expired {
            if let Some(lease) = self.leases.remove(&job_id) {
                tracing::debug!(job_id = %job_id, "lease expired, job visible again");
                self.push_ready(lease.expires_at.timestamp_millis(), job_id);
            }
        }
    }
}

/// Queue backend over shared process memory.
#[derive(Debug, Clone)]
pub struct MemoryJobQueue {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    /// Queue on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Queue on an explicit clock (tests use [`crate::clock::ManualClock`]).
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: JobDescriptor) -> Result<JobId> {
        let mut state = self.state.lock();
        let job_id = job.id;
        let at_ms = job.scheduled_for.timestamp_millis();
        state.jobs.insert(job_id, job);
        state.push_ready(at_ms, job_id);
        Ok(job_id)
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<LeasedJob>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.reap_expired(now);

        let Some((&key, &job_id)) = state.ready.iter().next() else {
            return Ok(None);
        };
        if key.0 > now.timestamp_millis() {
            // Earliest entry is in the future; nothing is visible.
            return Ok(None);
        }
        state.ready.remove(&key);

        let token = Uuid::new_v4();
        state.leases.insert(
            job_id,
            Lease {
                token,
                expires_at: now + to_chrono(lease),
            },
        );
        let Some(job) = state.jobs.get(&job_id).cloned() else {
            // Ready entry without a record; drop the orphan and report empty.
            state.leases.remove(&job_id);
            tracing::warn!(job_id = %job_id, "ready entry had no job record, dropping");
            return Ok(None);
        };
        Ok(Some(LeasedJob {
            job,
            token: LeaseToken {
                job_id,
                entry: job_id.to_string(),
                token,
            },
        }))
    }

    async fn ack(&self, token: &LeaseToken) -> Result<()> {
        let mut state = self.state.lock();
        let holds = state
            .leases
            .get(&token.job_id)
            .is_some_and(|lease| lease.token == token.token);
        if holds {
            state.leases.remove(&token.job_id);
            state.jobs.remove(&token.job_id);
        }
        // Anything else: the lease expired and the job was requeued (or
        // already settled); acknowledging it now must change nothing.
        Ok(())
    }

    async fn nack(&self, token: &LeaseToken, requeue_delay: Duration, error: &str) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let holds = state
            .leases
            .get(&token.job_id)
            .is_some_and(|lease| lease.token == token.token);
        if !holds {
            return Ok(());
        }
        state.leases.remove(&token.job_id);

        let Some(job) = state.jobs.get_mut(&token.job_id) else {
            return Ok(());
        };
        job.attempts += 1;
        job.failures.push(FailureRecord {
            attempt: job.attempts,
            error: error.to_string(),
            failed_at: now,
        });

        if job.attempts >= job.max_attempts {
            let Some(job) = state.jobs.remove(&token.job_id) else {
                return Ok(());
            };
            tracing::warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                "retry budget spent, dead-lettering job"
            );
            state.dead.push(DeadLetter {
                job,
                dead_lettered_at: now,
            });
        } else {
            let retry_at = now + to_chrono(requeue_delay);
            job.scheduled_for = retry_at;
            state.push_ready(retry_at.timestamp_millis(), token.job_id);
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.state.lock().dead.clone())
    }
}
