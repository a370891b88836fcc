//! bumblebee: bootstrap and job orchestration for the workspace deployment
//!
//! The core that brings a multi-service deployment up in the right order
//! and keeps its background work flowing:
//!
//! - **readiness** — polls the stateful dependencies (datastore, broker)
//!   until they answer their health probes;
//! - **gate** — runs schema migrations exactly once per deployment
//!   generation behind a datastore advisory lock, and unblocks dependents
//!   through a persisted generation marker;
//! - **queue** — a broker-backed job queue with lease-based at-least-once
//!   delivery and a dead-letter state;
//! - **scheduler** — a leader-elected recurring producer feeding the queue
//!   from static schedule entries;
//! - **worker** — a pool of stateless `dequeue -> execute -> ack|nack`
//!   loops with retry backoff;
//! - **server** — the application-server boundary: health endpoints and
//!   read-only dead-letter inspection;
//! - **supervisor** — a local coordinator that launches the whole
//!   topology for development and single-host installs.
//!
//! Processes share no memory: coordination happens through the datastore
//! (advisory lock, generation marker) and the broker (queue leases,
//! leadership lock), so any instance can crash and resume.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bumblebee::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     bumblebee::observability::init(settings.debug);
//!
//!     let queue = Arc::new(RedisJobQueue::connect(&settings.broker)?);
//!     let mut registry = HandlerRegistry::new();
//!     // registry.register(Arc::new(MyHandler));
//!
//!     let shutdown = bumblebee::shutdown::install_handler();
//!     WorkerPool::new(
//!         queue,
//!         Arc::new(registry),
//!         settings.worker.clone(),
//!         settings.queue.lease(),
//!     )
//!     .run(shutdown)
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod observability;
pub mod queue;
pub mod readiness;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod supervisor;
pub mod topology;
pub mod worker;

pub mod prelude {
    //! Convenience re-exports for common types and traits

    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::Settings;
    pub use crate::error::{OrchestratorError, Result};
    pub use crate::gate::{
        baseline_steps, wait_for_generation, GateOutcome, GateStore, Generation, MemoryGateStore,
        MigrationGate, PgGateStore,
    };
    pub use crate::queue::{
        DeadLetter, JobDescriptor, JobQueue, LeaseToken, LeasedJob, MemoryJobQueue, RedisJobQueue,
    };
    pub use crate::readiness::{
        wait_all_ready, wait_ready, HealthProbe, PostgresProbe, Readiness, RedisProbe, TcpProbe,
    };
    pub use crate::scheduler::{
        LeadershipLock, MemoryLeadershipRegistry, RedisLeadershipLock, ScheduleEntry, Scheduler,
    };
    pub use crate::server::AppState;
    pub use crate::supervisor::Supervisor;
    pub use crate::topology::{ProbeSpec, RestartPolicy, ServiceSpec, Topology};
    pub use crate::worker::{HandlerRegistry, JobHandler, WorkerPool};
}
