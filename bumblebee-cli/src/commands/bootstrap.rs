//! `bumblebee bootstrap` — run the migration gate once
//!
//! Exit code is the contract: zero when the schema is at the current
//! generation (freshly migrated or already there), non-zero otherwise so
//! the supervising `on-failure` restart policy re-invokes the gate.

use anyhow::{Context, Result};
use console::style;

use bumblebee::gate::{baseline_steps, Generation, MigrationGate, PgGateStore};

pub async fn run() -> Result<()> {
    let settings = super::init()?;
    super::await_dependencies(&settings, true, false).await?;

    let steps = baseline_steps();
    let generation = Generation::compute(&settings, steps)?;
    let store = PgGateStore::connect(&settings)
        .await
        .context("connecting to the datastore")?;

    let outcome = MigrationGate::new(store, steps, generation, settings.gate.lock_timeout())
        .run()
        .await
        .context("migration gate failed")?;

    let digest = &outcome.generation.as_str()[..12];
    if outcome.up_to_date {
        println!(
            "{} schema already at generation {}",
            style("✓").green(),
            style(digest).cyan()
        );
    } else {
        println!(
            "{} applied {} migration step(s), now at generation {}",
            style("✓").green(),
            outcome.applied,
            style(digest).cyan()
        );
    }
    Ok(())
}
