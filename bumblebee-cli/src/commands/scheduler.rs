//! `bumblebee scheduler` — the recurring job producer
//!
//! Gated on the broker (its queue), the datastore (generation check) and
//! the migration gate. Holds the cluster-wide leadership lock while
//! ticking, so extra replicas stand by instead of double-enqueueing.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use bumblebee::clock::SystemClock;
use bumblebee::queue::RedisJobQueue;
use bumblebee::scheduler::{RedisLeadershipLock, ScheduleEntry, Scheduler};

pub async fn run() -> Result<()> {
    let settings = super::init()?;
    super::await_dependencies(&settings, true, true).await?;
    super::await_generation(&settings).await?;

    let now = Utc::now();
    let entries = settings
        .scheduler
        .entries
        .iter()
        .map(|entry| ScheduleEntry::from_config(entry, &settings.queue, now))
        .collect::<bumblebee::error::Result<Vec<_>>>()
        .context("building schedule entries")?;

    let queue = Arc::new(RedisJobQueue::connect(&settings.broker)?);
    let leadership =
        RedisLeadershipLock::connect(&settings.broker, settings.scheduler.leadership_ttl())?;

    let shutdown = bumblebee::shutdown::install_handler();
    Scheduler::new(
        queue,
        leadership,
        entries,
        Arc::new(SystemClock),
        &settings.scheduler,
    )
    .run(shutdown)
    .await?;
    Ok(())
}
