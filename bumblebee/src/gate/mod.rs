//! Migration gate
//!
//! A one-shot coordinator that runs schema migrations exactly once per
//! deployment generation. The state machine is
//! `Idle -> Running -> {Succeeded, Failed}`:
//!
//! - entering `Running` acquires an exclusive lock scoped to the datastore,
//!   so concurrent bootstrap attempts serialize; a held lock blocks the
//!   newcomer until [`crate::config::GateSettings::lock_timeout`] elapses,
//!   which fails the attempt;
//! - if the recorded generation already equals the target, the run
//!   short-circuits to `Succeeded` without touching any step;
//! - otherwise steps apply in order, skipping those whose completion marker
//!   is already persisted — a crash mid-run followed by a restart replays
//!   from the first unapplied step;
//! - `Failed` maps to a non-zero process exit so an `on-failure` restart
//!   policy re-invokes the whole gate.
//!
//! Dependent processes never watch the gate process itself; they watch the
//! persisted generation marker via [`wait_for_generation`].

pub mod memory;
pub mod postgres;

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Settings;
use crate::error::{OrchestratorError, Result};

pub use self::memory::MemoryGateStore;
pub use self::postgres::PgGateStore;

/// Sleep between advisory-lock acquisition attempts.
const LOCK_POLL: Duration = Duration::from_millis(500);

/// One ordered migration step. The SQL must be individually idempotent
/// (`IF NOT EXISTS` and friends): a crash between apply and marker commit
/// means the step runs again on the next attempt.
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    /// Unique step name, also the persisted completion marker.
    pub name: &'static str,
    /// The statement to execute.
    pub sql: &'static str,
}

/// The workspace schema baseline and its evolution.
#[must_use]
pub fn baseline_steps() -> &'static [MigrationStep] {
    &[
        MigrationStep {
            name: "0001_create_instances",
            sql: "CREATE TABLE IF NOT EXISTS instance (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                username TEXT NOT NULL,
                desktop_type TEXT NOT NULL,
                created TIMESTAMPTZ NOT NULL DEFAULT now(),
                marked_for_deletion TIMESTAMPTZ
            )",
        },
        MigrationStep {
            name: "0002_create_backups",
            sql: "CREATE TABLE IF NOT EXISTS backup (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                instance_id UUID NOT NULL REFERENCES instance (id),
                created TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        },
        MigrationStep {
            name: "0003_add_backup_expiration",
            sql: "ALTER TABLE backup
                ADD COLUMN IF NOT EXISTS expiration TIMESTAMPTZ",
        },
        MigrationStep {
            name: "0004_add_console_addr_port",
            sql: "ALTER TABLE instance
                ADD COLUMN IF NOT EXISTS console_addr TEXT,
                ADD COLUMN IF NOT EXISTS console_port INTEGER",
        },
    ]
}

/// Opaque identifier for one configuration/bootstrap attempt.
///
/// Computed as a SHA-256 digest over the canonicalized settings document
/// and the ordered step list, so either kind of change produces a new
/// generation. Equality with the persisted marker is the "already migrated"
/// signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation(String);

impl Generation {
    /// Compute the generation for a settings document and step list.
    ///
    /// # Errors
    ///
    /// Fails only if the settings document cannot be serialized.
    pub fn compute(settings: &Settings, steps: &[MigrationStep]) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(settings)?);
        for step in steps {
            hasher.update(step.name.as_bytes());
            hasher.update(step.sql.as_bytes());
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// The hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Gate lifecycle states, for logging and inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Not started.
    Idle,
    /// Lock held, steps applying.
    Running,
    /// Generation marker persisted (or already current).
    Succeeded,
    /// The attempt is over; the process should exit non-zero.
    Failed,
}

/// Result of a successful gate run.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    /// The generation now persisted.
    pub generation: Generation,
    /// Number of steps applied by this run.
    pub applied: usize,
    /// Whether the run short-circuited because the marker already matched.
    pub up_to_date: bool,
}

/// Persistence operations the gate needs. The production implementation is
/// [`PgGateStore`]; [`MemoryGateStore`] backs tests and local development.
///
/// All state lives behind this trait rather than in process memory so any
/// instance can resume correctly after a crash.
#[async_trait]
pub trait GateStore: Send {
    /// Try to take the exclusive migration lock. Non-blocking.
    async fn try_lock(&mut self) -> Result<bool>;

    /// Release the lock if held by this store.
    async fn unlock(&mut self) -> Result<()>;

    /// The last successfully migrated generation, if any.
    async fn last_generation(&mut self) -> Result<Option<String>>;

    /// Names of steps whose completion marker is persisted.
    async fn applied_steps(&mut self) -> Result<HashSet<String>>;

    /// Execute a step and persist its completion marker atomically.
    async fn apply_step(&mut self, step: &MigrationStep) -> Result<()>;

    /// Persist the generation marker, replacing any previous one.
    async fn record_generation(&mut self, generation: &str) -> Result<()>;
}

/// The migration gate itself.
pub struct MigrationGate<S> {
    store: S,
    steps: &'static [MigrationStep],
    generation: Generation,
    lock_timeout: Duration,
}

impl<S: GateStore> MigrationGate<S> {
    /// Build a gate for one bootstrap attempt.
    pub fn new(
        store: S,
        steps: &'static [MigrationStep],
        generation: Generation,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            steps,
            generation,
            lock_timeout,
        }
    }

    /// Run the gate to completion.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::LockTimeout`] when another bootstrap attempt
    /// holds the lock for the whole window, [`OrchestratorError::MigrationStep`]
    /// when a step fails, or a datastore error from the store itself. Any
    /// error means the `Failed` state: exit non-zero and let the restart
    /// policy retry.
    pub async fn run(mut self) -> Result<GateOutcome> {
        tracing::info!(state = ?GateState::Running, generation = %self.generation, "migration gate starting");

        let started = tokio::time::Instant::now();
        loop {
            if self.store.try_lock().await? {
                break;
            }
            if started.elapsed() + LOCK_POLL >= self.lock_timeout {
                tracing::error!(state = ?GateState::Failed, "migration lock held elsewhere");
                return Err(OrchestratorError::LockTimeout {
                    waited: self.lock_timeout,
                });
            }
            tracing::debug!("migration lock held elsewhere, waiting");
            tokio::time::sleep(LOCK_POLL).await;
        }

        let result = self.migrate().await;
        if let Err(err) = self.store.unlock().await {
            tracing::warn!(error = %err, "failed to release migration lock");
        }

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    state = ?GateState::Succeeded,
                    applied = outcome.applied,
                    up_to_date = outcome.up_to_date,
                    "migration gate finished"
                );
            }
            Err(err) => {
                tracing::error!(state = ?GateState::Failed, error = %err, "migration gate failed");
            }
        }
        result
    }

    async fn migrate(&mut self) -> Result<GateOutcome> {
        if self.store.last_generation().await?.as_deref() == Some(self.generation.as_str()) {
            tracing::info!(generation = %self.generation, "generation already migrated, skipping");
            return Ok(GateOutcome {
                generation: self.generation.clone(),
                applied: 0,
                up_to_date: true,
            });
        }

        let already_applied = self.store.applied_steps().await?;
        let mut applied = 0;
        for step in self.steps {
            if already_applied.contains(step.name) {
                tracing::debug!(step = step.name, "step already applied, skipping");
                continue;
            }
            self.store.apply_step(step).await.map_err(|err| {
                OrchestratorError::MigrationStep {
                    step: step.name.to_string(),
                    reason: err.to_string(),
                }
            })?;
            tracing::info!(step = step.name, "migration step applied");
            applied += 1;
        }

        self.store
            .record_generation(self.generation.as_str())
            .await?;
        Ok(GateOutcome {
            generation: self.generation.clone(),
            applied,
            up_to_date: false,
        })
    }
}

/// Block until the persisted generation marker equals `generation`.
///
/// This is how dependents observe gate completion: the signal is durable
/// state in the datastore, not the gate process's lifetime.
///
/// # Errors
///
/// [`OrchestratorError::ReadinessTimeout`] when the marker does not appear
/// within `timeout`. Transient datastore errors are logged and retried.
pub async fn wait_for_generation<S: GateStore>(
    store: &mut S,
    generation: &Generation,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match store.last_generation().await {
            Ok(Some(current)) if current == generation.as_str() => {
                tracing::info!(generation = %generation, "migration generation is current");
                return Ok(());
            }
            Ok(current) => {
                tracing::debug!(
                    recorded = current.as_deref().unwrap_or("<none>"),
                    expected = generation.as_str(),
                    "migration generation not yet current"
                );
            }
            Err(err) if err.is_transient() => {
                tracing::debug!(error = %err, "generation check failed, retrying");
            }
            Err(err) => return Err(err),
        }
        if tokio::time::Instant::now() + poll_interval >= deadline {
            return Err(OrchestratorError::ReadinessTimeout {
                name: "migration-gate".to_string(),
                waited: timeout,
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}
