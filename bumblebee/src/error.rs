//! Error types and propagation policy
//!
//! One taxonomy for the whole orchestration core:
//!
//! - [`OrchestratorError::TransientDependency`] — the datastore or broker is
//!   temporarily unreachable. Retried with backoff at the component boundary
//!   (readiness poll loops, worker dequeue loops) and never surfaced to job
//!   business logic.
//! - [`OrchestratorError::MigrationStep`] — fatal for the current bootstrap
//!   attempt. Surfaced as a non-zero process exit so the supervising restart
//!   policy re-invokes the whole gate.
//! - [`OrchestratorError::JobExecution`] — recovered via `nack`/requeue and
//!   eventually dead-lettered; never crashes a worker.
//! - [`OrchestratorError::LeadershipLost`] — the scheduler stops ticking and
//!   relinquishes silently; no data is lost because enqueue state lives in
//!   the broker.

use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Error type for the orchestration core.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A stateful dependency is temporarily unreachable.
    #[error("dependency `{name}` unavailable: {reason}")]
    TransientDependency {
        /// Dependency name from the service topology.
        name: String,
        /// Underlying connection/probe failure.
        reason: String,
    },

    /// A dependency did not become ready within the configured window.
    #[error("dependency `{name}` not ready after {waited:?}")]
    ReadinessTimeout {
        /// Dependency name from the service topology.
        name: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// A migration step failed; the bootstrap attempt is over.
    #[error("migration step `{step}` failed: {reason}")]
    MigrationStep {
        /// Name of the failing step.
        step: String,
        /// Why it failed.
        reason: String,
    },

    /// The migration lock is held by another bootstrap attempt.
    #[error("migration lock not acquired within {waited:?}")]
    LockTimeout {
        /// How long the gate waited for the lock.
        waited: Duration,
    },

    /// A job's business logic failed.
    #[error("job execution failed: {0}")]
    JobExecution(String),

    /// The scheduler's leadership lock could not be renewed.
    #[error("scheduler leadership lost")]
    LeadershipLost,

    /// The service topology is malformed (unknown dependency, cycle, ...).
    #[error("invalid topology: {0}")]
    Topology(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// Datastore error.
    #[error("datastore error: {0}")]
    Database(#[from] sqlx::Error),

    /// Broker error.
    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),

    /// Payload or record (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (sockets, child processes).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for OrchestratorError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl OrchestratorError {
    /// Whether retrying after a delay could plausibly succeed.
    ///
    /// Infrastructure-level failures are retried transparently at component
    /// boundaries; everything else propagates.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientDependency { .. } | Self::Database(_) | Self::Broker(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let err = OrchestratorError::TransientDependency {
            name: "datastore".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(err.is_transient());

        let err = OrchestratorError::MigrationStep {
            step: "0001_create_instances".to_string(),
            reason: "syntax error".to_string(),
        };
        assert!(!err.is_transient());
        assert!(!OrchestratorError::LeadershipLost.is_transient());
    }

    #[test]
    fn display_includes_context() {
        let err = OrchestratorError::ReadinessTimeout {
            name: "broker".to_string(),
            waited: Duration::from_secs(60),
        };
        assert!(err.to_string().contains("broker"));
    }
}
