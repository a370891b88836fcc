//! In-memory gate store
//!
//! Shares its state between clones the way independent bootstrap attempts
//! share a datastore, which makes crash/replay and lock-contention
//! scenarios straightforward to exercise without Postgres.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{GateStore, MigrationStep};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Default)]
struct SharedState {
    locked: bool,
    generation: Option<String>,
    applied: Vec<String>,
    apply_attempts: HashMap<String, u32>,
}

/// Gate store over shared process memory.
#[derive(Debug, Default)]
pub struct MemoryGateStore {
    shared: Arc<Mutex<SharedState>>,
    holds_lock: bool,
    fail_on: Option<String>,
}

impl MemoryGateStore {
    /// Fresh store with empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A second bootstrap attempt against the same persisted state.
    #[must_use]
    pub fn attempt(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            holds_lock: false,
            fail_on: None,
        }
    }

    /// Make `apply_step` fail for the named step, simulating a crash
    /// mid-run.
    pub fn fail_on(&mut self, step: Option<&str>) {
        self.fail_on = step.map(str::to_string);
    }

    /// Step names applied so far, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<String> {
        self.shared.lock().applied.clone()
    }

    /// How many times `apply_step` ran for a step, successful or not.
    #[must_use]
    pub fn apply_attempts(&self, step: &str) -> u32 {
        self.shared
            .lock()
            .apply_attempts
            .get(step)
            .copied()
            .unwrap_or(0)
    }

    /// The recorded generation, if any.
    #[must_use]
    pub fn generation(&self) -> Option<String> {
        self.shared.lock().generation.clone()
    }

    /// Whether the shared lock is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.shared.lock().locked
    }
}

#[async_trait]
impl GateStore for MemoryGateStore {
    async fn try_lock(&mut self) -> Result<bool> {
        let mut state = self.shared.lock();
        if state.locked {
            Ok(false)
        } else {
            state.locked = true;
            self.holds_lock = true;
            Ok(true)
        }
    }

    async fn unlock(&mut self) -> Result<()> {
        if self.holds_lock {
            self.shared.lock().locked = false;
            self.holds_lock = false;
        }
        Ok(())
    }

    async fn last_generation(&mut self) -> Result<Option<String>> {
        Ok(self.shared.lock().generation.clone())
    }

    async fn applied_steps(&mut self) -> Result<HashSet<String>> {
        Ok(self.shared.lock().applied.iter().cloned().collect())
    }

    async fn apply_step(&mut self, step: &MigrationStep) -> Result<()> {
        let mut state = self.shared.lock();
        *state
            .apply_attempts
            .entry(step.name.to_string())
            .or_insert(0) += 1;
        if self.fail_on.as_deref() == Some(step.name) {
            return Err(OrchestratorError::MigrationStep {
                step: step.name.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        state.applied.push(step.name.to_string());
        Ok(())
    }

    async fn record_generation(&mut self, generation: &str) -> Result<()> {
        self.shared.lock().generation = Some(generation.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_between_attempts() {
        let mut first = MemoryGateStore::new();
        let mut second = first.attempt();

        assert!(first.try_lock().await.unwrap());
        assert!(!second.try_lock().await.unwrap());

        first.unlock().await.unwrap();
        assert!(second.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn unlock_is_a_noop_for_non_holder() {
        let mut first = MemoryGateStore::new();
        let mut second = first.attempt();

        assert!(first.try_lock().await.unwrap());
        second.unlock().await.unwrap();
        assert!(first.is_locked());
    }
}
