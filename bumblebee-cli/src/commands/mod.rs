//! Per-command implementations

pub mod bootstrap;
pub mod jobs;
pub mod scheduler;
pub mod serve;
pub mod up;
pub mod worker;

use anyhow::{Context, Result};

use bumblebee::config::Settings;
use bumblebee::gate::{baseline_steps, wait_for_generation, Generation, PgGateStore};
use bumblebee::readiness::{wait_all_ready, HealthProbe, PostgresProbe, RedisProbe};

/// Load settings and bring up logging. Every command starts here.
pub(crate) fn init() -> Result<Settings> {
    let settings = Settings::load().context("loading configuration")?;
    bumblebee::observability::init(settings.debug);
    Ok(settings)
}

/// Block until the selected stateful dependencies answer their probes.
pub(crate) async fn await_dependencies(
    settings: &Settings,
    datastore: bool,
    broker: bool,
) -> Result<()> {
    let probe_timeout = settings.readiness.probe_timeout();
    let mut probes: Vec<Box<dyn HealthProbe>> = Vec::new();
    if datastore {
        probes.push(Box::new(PostgresProbe::new(
            "datastore",
            settings.database.url(),
            probe_timeout,
        )));
    }
    if broker {
        probes.push(Box::new(RedisProbe::new(
            "broker",
            settings.broker.url(),
            probe_timeout,
        )?));
    }
    wait_all_ready(
        &probes,
        settings.readiness.timeout(),
        settings.readiness.poll_interval(),
    )
    .await
    .context("waiting for stateful dependencies")
}

/// Block until the migration gate has recorded the current generation.
pub(crate) async fn await_generation(settings: &Settings) -> Result<()> {
    let generation = Generation::compute(settings, baseline_steps())?;
    let mut store = PgGateStore::connect(settings).await?;
    wait_for_generation(
        &mut store,
        &generation,
        settings.gate.generation_wait(),
        settings.gate.generation_poll(),
    )
    .await
    .context("waiting for the migration gate")
}
