//! Worker pool
//!
//! Each worker runs an independent `dequeue -> execute -> ack|nack` loop.
//! Workers are stateless between jobs and coordinate only through the
//! queue's lease mechanism, so the pool scales horizontally by running
//! more processes.
//!
//! Failure handling: a handler error, a timeout, or an unknown job type is
//! recorded via `nack` with an exponential requeue delay; a job that spends
//! its retry budget lands in the dead-letter queue for inspection rather
//! than being lost — and never crashes the worker. A worker that outlives
//! its lease loses it silently; the late `ack` is a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerSettings;
use crate::error::Result;
use crate::queue::{JobDescriptor, JobQueue, LeasedJob};

/// Business logic for one job type.
///
/// Delivery is at-least-once: implementations must be idempotent or
/// tolerate duplicate execution on lease-timeout races.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler executes.
    fn job_type(&self) -> &str;

    /// Execute one job.
    async fn execute(&self, job: &JobDescriptor) -> anyhow::Result<()>;
}

/// Dispatch table from job type to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type().to_string();
        if self.handlers.insert(job_type.clone(), handler).is_some() {
            tracing::warn!(job_type = %job_type, "replacing registered job handler");
        }
    }

    /// Look up the handler for a job type.
    #[must_use]
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Registered job types, for startup logging.
    #[must_use]
    pub fn job_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// Exponential requeue delay: `base * 2^failures`, capped.
#[must_use]
pub fn retry_delay(settings: &WorkerSettings, failures: u32) -> Duration {
    let factor = 1u64 << failures.min(16);
    let secs = settings
        .retry_backoff_secs
        .saturating_mul(factor)
        .min(settings.retry_backoff_cap_secs);
    Duration::from_secs(secs)
}

/// A pool of independent worker loops over one queue.
pub struct WorkerPool<Q> {
    queue: Arc<Q>,
    registry: Arc<HandlerRegistry>,
    settings: WorkerSettings,
    lease: Duration,
}

impl<Q: JobQueue + 'static> WorkerPool<Q> {
    /// Build a pool. `lease` is the configured queue lease duration and
    /// must comfortably exceed the job timeout, otherwise a slow job is
    /// redelivered while still executing.
    pub fn new(
        queue: Arc<Q>,
        registry: Arc<HandlerRegistry>,
        settings: WorkerSettings,
        lease: Duration,
    ) -> Self {
        if lease <= settings.job_timeout() {
            tracing::warn!(
                lease_secs = lease.as_secs(),
                job_timeout_secs = settings.job_timeout_secs,
                "queue lease does not cover the job timeout; expect redelivery races"
            );
        }
        Self {
            queue,
            registry,
            settings,
            lease,
        }
    }

    /// Run all workers until shutdown, draining in-flight jobs first.
    ///
    /// # Errors
    ///
    /// Infallible in practice: queue errors are retried inside the loops
    /// and handler failures are settled through the queue.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut types = self.registry.job_types();
        types.sort_unstable();
        tracing::info!(
            concurrency = self.settings.concurrency,
            job_types = ?types,
            "worker pool started"
        );

        let mut workers = JoinSet::new();
        for id in 0..self.settings.concurrency {
            let worker = Worker {
                id,
                queue: Arc::clone(&self.queue),
                registry: Arc::clone(&self.registry),
                settings: self.settings.clone(),
                lease: self.lease,
            };
            workers.spawn(worker.run(shutdown.clone()));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "worker task aborted");
            }
        }
        tracing::info!("worker pool stopped");
        Ok(())
    }
}

struct Worker<Q> {
    id: usize,
    queue: Arc<Q>,
    registry: Arc<HandlerRegistry>,
    settings: WorkerSettings,
    lease: Duration,
}

impl<Q: JobQueue> Worker<Q> {
    async fn run(self, shutdown: CancellationToken) {
        tracing::debug!(worker = self.id, "worker loop started");
        loop {
            let dequeued = tokio::select! {
                () = shutdown.cancelled() => break,
                result = self.queue.dequeue(self.lease) => result,
            };
            match dequeued {
                Ok(Some(leased)) => self.process(leased).await,
                Ok(None) => {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.settings.poll_interval()) => {}
                    }
                }
                Err(err) => {
                    // Transient broker trouble; retried at this boundary.
                    tracing::warn!(worker = self.id, error = %err, "dequeue failed, backing off");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.settings.poll_interval()) => {}
                    }
                }
            }
        }
        tracing::debug!(worker = self.id, "worker loop stopped");
    }

    async fn process(&self, leased: LeasedJob) {
        let LeasedJob { job, token } = leased;
        let attempt = job.attempts + 1;
        tracing::info!(
            worker = self.id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt,
            max_attempts = job.max_attempts,
            "executing job"
        );

        let failure = match self.registry.get(&job.job_type) {
            None => Some(format!("no handler registered for job type `{}`", job.job_type)),
            Some(handler) => {
                match tokio::time::timeout(self.settings.job_timeout(), handler.execute(&job)).await
                {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(format!("{err:#}")),
                    Err(_) => Some(format!(
                        "timed out after {}s",
                        self.settings.job_timeout_secs
                    )),
                }
            }
        };

        match failure {
            None => {
                if let Err(err) = self.queue.ack(&token).await {
                    tracing::warn!(job_id = %job.id, error = %err, "ack failed");
                } else {
                    tracing::info!(worker = self.id, job_id = %job.id, "job completed");
                }
            }
            Some(reason) => {
                let delay = retry_delay(&self.settings, job.attempts);
                tracing::warn!(
                    worker = self.id,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt,
                    error = %reason,
                    requeue_delay_secs = delay.as_secs(),
                    "job failed"
                );
                if let Err(err) = self.queue.nack(&token, delay, &reason).await {
                    tracing::warn!(job_id = %job.id, error = %err, "nack failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_and_caps() {
        let settings = WorkerSettings {
            retry_backoff_secs: 5,
            retry_backoff_cap_secs: 300,
            ..WorkerSettings::default()
        };
        assert_eq!(retry_delay(&settings, 0), Duration::from_secs(5));
        assert_eq!(retry_delay(&settings, 1), Duration::from_secs(10));
        assert_eq!(retry_delay(&settings, 2), Duration::from_secs(20));
        assert_eq!(retry_delay(&settings, 6), Duration::from_secs(300));
        // Large failure counts must not overflow.
        assert_eq!(retry_delay(&settings, u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn registry_replaces_duplicate_types() {
        struct Noop(&'static str);

        #[async_trait]
        impl JobHandler for Noop {
            fn job_type(&self) -> &str {
                self.0
            }
            async fn execute(&self, _job: &JobDescriptor) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Noop("a")));
        registry.register(Arc::new(Noop("a")));
        registry.register(Arc::new(Noop("b")));
        assert_eq!(registry.job_types().len(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
    }
}
