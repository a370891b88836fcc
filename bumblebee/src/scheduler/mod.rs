//! Recurring job scheduler
//!
//! A single-writer producer: on each tick it enqueues a fresh job for every
//! schedule entry whose next-fire time has passed, then advances that
//! entry's next-fire time. Entries are derived from static configuration
//! and owned exclusively by the scheduler, so a crash loses nothing — the
//! restart re-derives them and re-acquires leadership.
//!
//! Mutual exclusion: the scheduler only ticks while holding the
//! cluster-wide [`LeadershipLock`], so at most one instance enqueues at a
//! time even if several are started. The intended deployment runs exactly
//! one; the lock is a defensive generalization for multi-replica safety.
//! Losing leadership stops ticking and silently re-enters acquisition.

pub mod leadership;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::clock::{to_chrono, Clock};
use crate::config::{QueueSettings, ScheduleEntryConfig, SchedulerSettings};
use crate::error::{OrchestratorError, Result};
use crate::queue::{JobDescriptor, JobQueue};

pub use self::leadership::{
    LeadershipLock, MemoryLeadershipLock, MemoryLeadershipRegistry, RedisLeadershipLock,
};

/// How an entry's next fire time advances.
#[derive(Debug, Clone)]
pub enum Recurrence {
    /// Fixed interval.
    Every(chrono::Duration),
    /// Cron expression (seconds-resolution, UTC).
    Cron(Box<cron::Schedule>),
}

/// One recurring job template. Mutated only by the scheduler's tick.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    /// Entry name, for logs.
    pub name: String,
    /// Job type stamped on every enqueued job.
    pub job_type: String,
    /// Payload template copied into every enqueued job.
    pub payload: serde_json::Value,
    /// Retry budget stamped on every enqueued job.
    pub max_attempts: u32,
    recurrence: Recurrence,
    next_fire: DateTime<Utc>,
}

impl ScheduleEntry {
    /// Entry firing every `interval`, first at `now + interval`.
    ///
    /// # Errors
    ///
    /// Rejects non-positive intervals, which would fire continuously.
    pub fn every(
        name: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        interval: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if interval <= chrono::Duration::zero() {
            return Err(OrchestratorError::Config(
                "schedule interval must be positive".to_string(),
            ));
        }
        Ok(Self {
            name: name.into(),
            job_type: job_type.into(),
            payload,
            max_attempts,
            next_fire: now + interval,
            recurrence: Recurrence::Every(interval),
        })
    }

    /// Entry firing on a cron expression, first at its next upcoming time.
    ///
    /// # Errors
    ///
    /// Rejects unparseable expressions.
    pub fn cron(
        name: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        expression: &str,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let name = name.into();
        let schedule = cron::Schedule::from_str(expression).map_err(|err| {
            OrchestratorError::Config(format!(
                "schedule entry `{name}` has a bad cron expression: {err}"
            ))
        })?;
        let next_fire = schedule
            .after(&now)
            .next()
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Ok(Self {
            name,
            job_type: job_type.into(),
            payload,
            max_attempts,
            next_fire,
            recurrence: Recurrence::Cron(Box::new(schedule)),
        })
    }

    /// Build an entry from its configuration form.
    ///
    /// # Errors
    ///
    /// Exactly one of `every_secs` and `cron` must be set.
    pub fn from_config(
        config: &ScheduleEntryConfig,
        queue_defaults: &QueueSettings,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let max_attempts = config.max_attempts.unwrap_or(queue_defaults.max_attempts);
        match (config.every_secs, config.cron.as_deref()) {
            (Some(secs), None) => Self::every(
                &config.name,
                &config.job_type,
                config.payload.clone(),
                max_attempts,
                to_chrono(Duration::from_secs(secs)),
                now,
            ),
            (None, Some(expression)) => Self::cron(
                &config.name,
                &config.job_type,
                config.payload.clone(),
                max_attempts,
                expression,
                now,
            ),
            _ => Err(OrchestratorError::Config(format!(
                "schedule entry `{}` must set exactly one of `every_secs` and `cron`",
                config.name
            ))),
        }
    }

    /// When this entry fires next.
    #[must_use]
    pub fn next_fire(&self) -> DateTime<Utc> {
        self.next_fire
    }

    fn due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire <= now
    }

    /// Advance past `now`. Interval entries skip any windows missed while
    /// no leader was ticking instead of backfilling a burst; cron entries
    /// take the next upcoming fire time.
    fn advance(&mut self, now: DateTime<Utc>) {
        match &self.recurrence {
            Recurrence::Every(interval) => {
                while self.next_fire <= now {
                    self.next_fire += *interval;
                }
            }
            Recurrence::Cron(schedule) => {
                self.next_fire = schedule
                    .after(&now)
                    .next()
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
            }
        }
    }

    fn job(&self, now: DateTime<Utc>) -> JobDescriptor {
        JobDescriptor::new(
            self.job_type.clone(),
            self.payload.clone(),
            self.max_attempts,
            now,
        )
    }
}

/// The scheduler process body.
pub struct Scheduler<Q, L> {
    queue: Arc<Q>,
    leadership: L,
    entries: Vec<ScheduleEntry>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    acquire_retry: Duration,
    leading: bool,
}

impl<Q: JobQueue, L: LeadershipLock> Scheduler<Q, L> {
    /// Build a scheduler over a queue, a leadership lock and its entries.
    pub fn new(
        queue: Arc<Q>,
        leadership: L,
        entries: Vec<ScheduleEntry>,
        clock: Arc<dyn Clock>,
        settings: &SchedulerSettings,
    ) -> Self {
        Self {
            queue,
            leadership,
            entries,
            clock,
            tick_interval: settings.tick_interval(),
            acquire_retry: settings.acquire_retry(),
            leading: false,
        }
    }

    /// Whether this instance currently holds leadership.
    #[must_use]
    pub fn is_leading(&self) -> bool {
        self.leading
    }

    /// One leadership-gated evaluation: acquire (or renew) the lock, and
    /// tick only while holding it. Returns `None` when this instance is
    /// not the leader — either the lock is held elsewhere or it was just
    /// lost.
    ///
    /// # Errors
    ///
    /// Broker failures during acquisition, renewal or enqueue.
    pub async fn poll_tick(&mut self) -> Result<Option<usize>> {
        if self.leading {
            match self.leadership.renew().await {
                Ok(true) => {}
                Ok(false) => {
                    self.leading = false;
                    tracing::warn!("scheduler leadership lost, standing by");
                    return Ok(None);
                }
                Err(err) => {
                    self.leading = false;
                    return Err(err);
                }
            }
        } else if self.leadership.try_acquire().await? {
            self.leading = true;
            tracing::info!("scheduler leadership acquired");
        } else {
            tracing::debug!("scheduler leadership held elsewhere");
            return Ok(None);
        }

        Ok(Some(self.tick().await?))
    }

    /// Evaluate every due entry once: enqueue a fresh job from its
    /// template, then advance its next-fire time. Returns how many jobs
    /// were enqueued.
    ///
    /// # Errors
    ///
    /// Enqueue failures; the failing entry is left un-advanced so the next
    /// tick retries it.
    pub async fn tick(&mut self) -> Result<usize> {
        let now = self.clock.now();
        let mut enqueued = 0;
        for entry in &mut self.entries {
            if !entry.due(now) {
                continue;
            }
            let job = entry.job(now);
            tracing::debug!(
                entry = %entry.name,
                job_id = %job.id,
                job_type = %job.job_type,
                "enqueueing scheduled job"
            );
            self.queue.enqueue(job).await?;
            entry.advance(now);
            enqueued += 1;
        }
        Ok(enqueued)
    }

    /// Run until shutdown: acquire leadership (retrying on a sleep), tick
    /// on the configured interval while leader, renew before each tick.
    ///
    /// # Errors
    ///
    /// Only non-transient failures end the loop; broker hiccups are logged
    /// and retried.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            entries = self.entries.len(),
            tick_interval = ?self.tick_interval,
            "scheduler started"
        );
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let sleep_for = match self.poll_tick().await {
                Ok(Some(enqueued)) => {
                    if enqueued > 0 {
                        tracing::info!(enqueued, "scheduler tick enqueued jobs");
                    }
                    self.tick_interval
                }
                Ok(None) => self.acquire_retry,
                Err(err) if err.is_transient() => {
                    tracing::warn!(error = %err, "scheduler broker hiccup, retrying");
                    self.acquire_retry
                }
                Err(err) => return Err(err),
            };
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(sleep_for) => {}
            }
        }
        if self.leading {
            self.leadership.release().await?;
            tracing::info!("scheduler leadership relinquished");
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }
}
