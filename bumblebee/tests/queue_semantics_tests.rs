//! Queue delivery semantics: lease mutual exclusion, idempotent
//! acknowledgment, retry budgets and ordering.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;

use bumblebee::clock::{Clock, ManualClock};
use bumblebee::queue::{JobDescriptor, JobQueue, MemoryJobQueue};

const LEASE: Duration = Duration::from_secs(30);

fn fixture() -> (Arc<MemoryJobQueue>, ManualClock) {
    let clock = ManualClock::new(Utc::now());
    let queue = Arc::new(MemoryJobQueue::with_clock(Arc::new(clock.clone())));
    (queue, clock)
}

#[tokio::test]
async fn concurrent_consumers_never_share_an_unexpired_lease() {
    let (queue, clock) = fixture();
    for n in 0..5 {
        queue
            .enqueue(JobDescriptor::new("t", json!(n), 3, clock.now()))
            .await
            .unwrap();
    }

    // Three consumers drain the queue concurrently; every job must be
    // delivered to exactly one of them.
    let mut consumers = Vec::new();
    for _ in 0..3 {
        let queue = Arc::clone(&queue);
        consumers.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(leased) = queue.dequeue(LEASE).await.unwrap() {
                ids.push(leased.job.id);
            }
            ids
        }));
    }

    let mut delivered = Vec::new();
    for consumer in consumers {
        delivered.extend(consumer.await.unwrap());
    }
    assert_eq!(delivered.len(), 5);
    let unique: HashSet<_> = delivered.iter().collect();
    assert_eq!(unique.len(), 5, "a job was delivered to two consumers");
}

#[tokio::test]
async fn ack_after_nack_triggered_requeue_is_a_noop() {
    let (queue, _clock) = fixture();
    queue
        .enqueue(JobDescriptor::new("t", json!(null), 3, Utc::now()))
        .await
        .unwrap();

    let first = queue.dequeue(LEASE).await.unwrap().unwrap();
    queue
        .nack(&first.token, Duration::ZERO, "transient failure")
        .await
        .unwrap();

    // The job is requeued and re-leased; the stale token must not be able
    // to remove it.
    let second = queue.dequeue(LEASE).await.unwrap().unwrap();
    assert_eq!(second.job.attempts, 1);
    queue.ack(&first.token).await.unwrap();

    // Still alive under the second lease: a further nack sees attempt 2.
    queue
        .nack(&second.token, Duration::ZERO, "again")
        .await
        .unwrap();
    let third = queue.dequeue(LEASE).await.unwrap().unwrap();
    assert_eq!(third.job.attempts, 2);

    queue.ack(&third.token).await.unwrap();
    assert!(queue.dequeue(LEASE).await.unwrap().is_none());
}

#[tokio::test]
async fn dead_letter_lands_after_exactly_max_attempts() {
    let (queue, _clock) = fixture();
    queue
        .enqueue(JobDescriptor::new("t", json!(null), 3, Utc::now()))
        .await
        .unwrap();

    for attempt in 1..=2 {
        let leased = queue.dequeue(LEASE).await.unwrap().unwrap();
        queue
            .nack(&leased.token, Duration::ZERO, &format!("failure {attempt}"))
            .await
            .unwrap();
        // Never before the budget is spent.
        assert!(queue.dead_letters().await.unwrap().is_empty());
    }

    let leased = queue.dequeue(LEASE).await.unwrap().unwrap();
    queue
        .nack(&leased.token, Duration::ZERO, "failure 3")
        .await
        .unwrap();

    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.attempts, 3);
    let errors: Vec<_> = dead[0]
        .job
        .failures
        .iter()
        .map(|f| f.error.as_str())
        .collect();
    assert_eq!(errors, ["failure 1", "failure 2", "failure 3"]);
    // Never after: the job is gone from delivery.
    assert!(queue.dequeue(LEASE).await.unwrap().is_none());
}

#[tokio::test]
async fn expired_lease_makes_the_job_visible_again() {
    let (queue, clock) = fixture();
    queue
        .enqueue(JobDescriptor::new("t", json!(null), 3, clock.now()))
        .await
        .unwrap();

    let crashed_consumer = queue.dequeue(LEASE).await.unwrap().unwrap();
    assert!(queue.dequeue(LEASE).await.unwrap().is_none());

    clock.advance(Duration::from_secs(31));
    let recovered = queue.dequeue(LEASE).await.unwrap().unwrap();
    assert_eq!(recovered.job.id, crashed_consumer.job.id);
    // Crash recovery is redelivery, not failure: no attempt was recorded.
    assert_eq!(recovered.job.attempts, 0);
}

proptest! {
    /// Visible jobs are always delivered in ascending
    /// `(scheduled_for, insertion order)`.
    #[test]
    fn delivery_follows_schedule_then_insertion(delays in prop::collection::vec(0i64..4, 1..16)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (queue, clock) = fixture();
            let base = clock.now();

            let mut expected: Vec<(i64, usize)> = Vec::new();
            for (index, delay) in delays.iter().enumerate() {
                let job = JobDescriptor::new("t", json!(index), 3, base)
                    .scheduled_at(base + chrono::Duration::seconds(*delay));
                queue.enqueue(job).await.unwrap();
                expected.push((*delay, index));
            }
            expected.sort_by_key(|&(delay, index)| (delay, index));

            clock.advance(Duration::from_secs(5));
            let mut delivered = Vec::new();
            while let Some(leased) = queue.dequeue(LEASE).await.unwrap() {
                delivered.push(leased.job.payload.as_u64().unwrap() as usize);
            }

            let expected_order: Vec<usize> =
                expected.into_iter().map(|(_, index)| index).collect();
            assert_eq!(delivered, expected_order);
        });
    }
}
