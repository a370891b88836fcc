//! bumblebee process entry commands

mod commands;
mod handlers;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::jobs::JobsCommand;

#[derive(Parser)]
#[command(name = "bumblebee")]
#[command(version)]
#[command(about = "Deployment orchestrator for the Bumblebee workspace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the application server (waits for dependencies and migrations)
    Serve,
    /// Run the migration gate once; exits zero when the schema is current
    Bootstrap,
    /// Start the recurring job scheduler
    Scheduler,
    /// Start a pool of job workers
    Worker,
    /// Inspect background jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
    /// Launch the whole local topology under a supervisor
    Up,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => commands::serve::run().await,
        Commands::Bootstrap => commands::bootstrap::run().await,
        Commands::Scheduler => commands::scheduler::run().await,
        Commands::Worker => commands::worker::run().await,
        Commands::Jobs { command } => command.execute().await,
        Commands::Up => commands::up::run().await,
    }
}
