//! `bumblebee worker` — a pool of job consumers
//!
//! Gated on both stateful dependencies and the migration gate, then loops
//! `dequeue -> execute -> ack|nack` until shutdown. Horizontally scalable:
//! run as many worker processes as the workload needs.

use std::sync::Arc;

use anyhow::Result;

use bumblebee::queue::RedisJobQueue;
use bumblebee::worker::WorkerPool;

pub async fn run() -> Result<()> {
    let settings = super::init()?;
    super::await_dependencies(&settings, true, true).await?;
    super::await_generation(&settings).await?;

    let queue = Arc::new(RedisJobQueue::connect(&settings.broker)?);
    let registry = Arc::new(crate::handlers::registry());

    let shutdown = bumblebee::shutdown::install_handler();
    WorkerPool::new(
        queue,
        registry,
        settings.worker.clone(),
        settings.queue.lease(),
    )
    .run(shutdown)
    .await?;
    Ok(())
}
