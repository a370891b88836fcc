//! Migration gate: idempotent re-entry, crash/replay, lock contention and
//! the generation unblocking signal.

use std::time::Duration;

use bumblebee::config::Settings;
use bumblebee::error::OrchestratorError;
use bumblebee::gate::{
    baseline_steps, wait_for_generation, GateStore, Generation, MemoryGateStore, MigrationGate,
};

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

fn target_generation() -> Generation {
    Generation::compute(&Settings::default(), baseline_steps()).unwrap()
}

#[tokio::test]
async fn first_run_applies_every_step_and_records_the_generation() {
    let store = MemoryGateStore::new();
    let inspect = store.attempt();

    let outcome = MigrationGate::new(store, baseline_steps(), target_generation(), LOCK_TIMEOUT)
        .run()
        .await
        .unwrap();

    assert!(!outcome.up_to_date);
    assert_eq!(outcome.applied, baseline_steps().len());
    let applied = inspect.applied();
    let expected: Vec<_> = baseline_steps().iter().map(|s| s.name.to_string()).collect();
    assert_eq!(applied, expected);
    assert_eq!(inspect.generation(), Some(target_generation().as_str().to_string()));
    assert!(!inspect.is_locked());
}

#[tokio::test]
async fn rerun_with_same_generation_short_circuits() {
    let store = MemoryGateStore::new();
    let inspect = store.attempt();

    MigrationGate::new(store, baseline_steps(), target_generation(), LOCK_TIMEOUT)
        .run()
        .await
        .unwrap();
    let outcome = MigrationGate::new(
        inspect.attempt(),
        baseline_steps(),
        target_generation(),
        LOCK_TIMEOUT,
    )
    .run()
    .await
    .unwrap();

    assert!(outcome.up_to_date);
    assert_eq!(outcome.applied, 0);
    // No step ran twice.
    for step in baseline_steps() {
        assert_eq!(inspect.apply_attempts(step.name), 1);
    }
}

#[tokio::test]
async fn crash_mid_run_replays_only_unapplied_steps() {
    let steps = baseline_steps();
    let mut store = MemoryGateStore::new();
    let inspect = store.attempt();

    // Run 1 applies the first two steps, then "crashes" on the third.
    store.fail_on(Some(steps[2].name));
    let err = MigrationGate::new(store, steps, target_generation(), LOCK_TIMEOUT)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::MigrationStep { .. }));
    assert_eq!(inspect.applied().len(), 2);
    assert_eq!(inspect.generation(), None);
    // The failed attempt released the lock.
    assert!(!inspect.is_locked());

    // Run 2 must apply only the remaining steps, then mark the generation.
    let outcome = MigrationGate::new(inspect.attempt(), steps, target_generation(), LOCK_TIMEOUT)
        .run()
        .await
        .unwrap();
    assert_eq!(outcome.applied, 2);
    assert_eq!(inspect.generation(), Some(target_generation().as_str().to_string()));

    // One crash: no step ran more than (crash count + 1) times.
    assert_eq!(inspect.apply_attempts(steps[0].name), 1);
    assert_eq!(inspect.apply_attempts(steps[1].name), 1);
    assert_eq!(inspect.apply_attempts(steps[2].name), 2);
    assert_eq!(inspect.apply_attempts(steps[3].name), 1);
}

#[tokio::test(start_paused = true)]
async fn held_lock_times_the_attempt_out() {
    let mut holder = MemoryGateStore::new();
    assert!(holder.try_lock().await.unwrap());

    let contender = holder.attempt();
    let err = MigrationGate::new(contender, baseline_steps(), target_generation(), LOCK_TIMEOUT)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::LockTimeout { .. }));

    // The holder proceeds once it is released.
    holder.unlock().await.unwrap();
    let outcome = MigrationGate::new(
        holder.attempt(),
        baseline_steps(),
        target_generation(),
        LOCK_TIMEOUT,
    )
    .run()
    .await
    .unwrap();
    assert_eq!(outcome.applied, baseline_steps().len());
}

#[tokio::test(start_paused = true)]
async fn dependents_unblock_on_the_persisted_generation() {
    let store = MemoryGateStore::new();
    let mut watcher = store.attempt();
    let generation = target_generation();

    // Nothing recorded yet: the watcher times out.
    let err = wait_for_generation(
        &mut watcher,
        &generation,
        Duration::from_secs(5),
        Duration::from_millis(100),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OrchestratorError::ReadinessTimeout { .. }));

    MigrationGate::new(store, baseline_steps(), generation.clone(), LOCK_TIMEOUT)
        .run()
        .await
        .unwrap();

    wait_for_generation(
        &mut watcher,
        &generation,
        Duration::from_secs(5),
        Duration::from_millis(100),
    )
    .await
    .unwrap();
}
