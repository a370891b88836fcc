//! `bumblebee up` — run the whole topology locally
//!
//! Development and single-host convenience: supervises the static
//! workspace topology (probing the externally managed datastore and
//! broker, launching and restarting everything else) until interrupted.

use anyhow::Result;

use bumblebee::supervisor::Supervisor;
use bumblebee::topology::Topology;

pub async fn run() -> Result<()> {
    let settings = super::init()?;
    let topology = Topology::workspace(&settings)?;

    let shutdown = bumblebee::shutdown::install_handler();
    Supervisor::new(topology, settings).run(shutdown).await?;
    Ok(())
}
