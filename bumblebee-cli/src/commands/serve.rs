//! `bumblebee serve` — the application-server boundary
//!
//! Starts only after both stateful dependencies are ready and the
//! migration gate has succeeded. With `RUN_MIGRATIONS` set this process
//! runs the gate itself; otherwise it waits for the persisted generation
//! marker that a separate `bootstrap` run records.

use std::sync::Arc;

use anyhow::{Context, Result};

use bumblebee::gate::{baseline_steps, Generation, MigrationGate, PgGateStore};
use bumblebee::queue::{JobQueue, RedisJobQueue};
use bumblebee::readiness::{HealthProbe, PostgresProbe, RedisProbe};
use bumblebee::server::{self, AppState};

pub async fn run() -> Result<()> {
    let settings = super::init()?;
    super::await_dependencies(&settings, true, true).await?;

    if settings.gate.migrate_on_serve {
        let steps = baseline_steps();
        let generation = Generation::compute(&settings, steps)?;
        let store = PgGateStore::connect(&settings).await?;
        MigrationGate::new(store, steps, generation, settings.gate.lock_timeout())
            .run()
            .await
            .context("migration gate failed")?;
    } else {
        super::await_generation(&settings).await?;
    }

    let queue: Arc<dyn JobQueue> = Arc::new(RedisJobQueue::connect(&settings.broker)?);
    let probe_timeout = settings.readiness.probe_timeout();
    let probes: Vec<Box<dyn HealthProbe>> = vec![
        Box::new(PostgresProbe::new(
            "datastore",
            settings.database.url(),
            probe_timeout,
        )),
        Box::new(RedisProbe::new(
            "broker",
            settings.broker.url(),
            probe_timeout,
        )?),
    ];

    let shutdown = bumblebee::shutdown::install_handler();
    server::serve(
        AppState::new(queue, probes),
        &settings.server.bind,
        shutdown,
    )
    .await?;
    Ok(())
}
