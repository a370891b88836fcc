//! Worker pool: execute/ack, retry-then-dead-letter, and unknown job
//! types are never silently lost.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use bumblebee::clock::{Clock, ManualClock};
use bumblebee::config::WorkerSettings;
use bumblebee::queue::{JobDescriptor, JobQueue, MemoryJobQueue};
use bumblebee::worker::{HandlerRegistry, JobHandler, WorkerPool};

const LEASE: Duration = Duration::from_secs(600);

struct CountingHandler {
    failures_before_success: u32,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl JobHandler for CountingHandler {
    fn job_type(&self) -> &str {
        "test.task"
    }

    async fn execute(&self, _job: &JobDescriptor) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            anyhow::bail!("induced failure {}", call + 1);
        }
        Ok(())
    }
}

struct Harness {
    queue: Arc<MemoryJobQueue>,
    clock: ManualClock,
    calls: Arc<AtomicU32>,
    shutdown: CancellationToken,
    pool_task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(failures_before_success: u32) -> Self {
        let clock = ManualClock::new(Utc::now());
        let queue = Arc::new(MemoryJobQueue::with_clock(Arc::new(clock.clone())));
        let calls = Arc::new(AtomicU32::new(0));

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(CountingHandler {
            failures_before_success,
            calls: Arc::clone(&calls),
        }));

        let settings = WorkerSettings {
            concurrency: 2,
            poll_interval_ms: 10,
            // Immediate retries keep the frozen test clock simple.
            retry_backoff_secs: 0,
            retry_backoff_cap_secs: 0,
            job_timeout_secs: 30,
        };

        let shutdown = CancellationToken::new();
        let pool = WorkerPool::new(Arc::clone(&queue), Arc::new(registry), settings, LEASE);
        let pool_shutdown = shutdown.clone();
        let pool_task = tokio::spawn(async move {
            pool.run(pool_shutdown).await.unwrap();
        });

        Self {
            queue,
            clock,
            calls,
            shutdown,
            pool_task,
        }
    }

    async fn enqueue(&self, job_type: &str, max_attempts: u32) {
        self.queue
            .enqueue(JobDescriptor::new(
                job_type,
                json!(null),
                max_attempts,
                self.clock.now(),
            ))
            .await
            .unwrap();
    }

    async fn wait_for_calls(&self, expected: u32) {
        let waited = tokio::time::timeout(Duration::from_secs(60), async {
            while self.calls.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {expected} executions");
    }

    async fn wait_for_dead_letters(&self, expected: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(60), async {
            while self.queue.dead_letters().await.unwrap().len() < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {expected} dead letters");
    }

    async fn stop(self) -> (Arc<MemoryJobQueue>, u32) {
        self.shutdown.cancel();
        self.pool_task.await.unwrap();
        (self.queue, self.calls.load(Ordering::SeqCst))
    }
}

#[tokio::test(start_paused = true)]
async fn executes_and_acks_a_healthy_job() {
    let harness = Harness::start(0);
    harness.enqueue("test.task", 3).await;
    harness.wait_for_calls(1).await;

    let (queue, _calls) = harness.stop().await;
    assert!(queue.dequeue(LEASE).await.unwrap().is_none(), "job was acked");
    assert!(queue.dead_letters().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn retries_a_flaky_job_until_it_succeeds() {
    let harness = Harness::start(2);
    harness.enqueue("test.task", 5).await;
    harness.wait_for_calls(3).await;

    let (queue, calls) = harness.stop().await;
    assert_eq!(calls, 3);
    assert!(queue.dequeue(LEASE).await.unwrap().is_none());
    assert!(queue.dead_letters().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_dead_letter_with_recorded_history() {
    let harness = Harness::start(u32::MAX);
    harness.enqueue("test.task", 2).await;
    harness.wait_for_dead_letters(1).await;

    let (queue, calls) = harness.stop().await;
    assert_eq!(calls, 2, "dead-lettered after exactly max_attempts executions");

    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.attempts, 2);
    assert_eq!(dead[0].job.failures.len(), 2);
    assert!(dead[0].job.failures[0].error.contains("induced failure 1"));
    assert!(dead[0].job.failures[1].error.contains("induced failure 2"));
    // The dead letter is held for inspection, not redelivered.
    assert!(queue.dequeue(LEASE).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn unknown_job_type_is_dead_lettered_not_lost() {
    let harness = Harness::start(0);
    harness.enqueue("nobody.home", 1).await;
    harness.wait_for_dead_letters(1).await;

    let (queue, calls) = harness.stop().await;
    assert_eq!(calls, 0, "no handler must run for an unroutable job");

    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.job_type, "nobody.home");
    assert!(dead[0].job.failures[0].error.contains("no handler registered"));
}
