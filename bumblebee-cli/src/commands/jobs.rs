//! Job inspection commands

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use console::style;

use bumblebee::queue::{JobQueue, RedisJobQueue};

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

/// Background job inspection.
#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    /// List jobs that exhausted their retry budget
    DeadLetters {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

impl JobsCommand {
    /// Execute the command.
    pub async fn execute(&self) -> Result<()> {
        match self {
            Self::DeadLetters { output } => dead_letters(output).await,
        }
    }
}

async fn dead_letters(output: &OutputFormat) -> Result<()> {
    let settings = super::init()?;
    let queue = RedisJobQueue::connect(&settings.broker)?;
    let dead = queue
        .dead_letters()
        .await
        .context("listing dead-lettered jobs")?;

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&dead)?);
        }
        OutputFormat::Table => {
            if dead.is_empty() {
                println!("No dead-lettered jobs.");
                return Ok(());
            }
            println!(
                "{:<38} {:<24} {:<9} {:<22} LAST ERROR",
                "JOB ID", "TYPE", "ATTEMPTS", "DEAD-LETTERED AT"
            );
            println!("{}", "-".repeat(110));
            for entry in &dead {
                let last_error = entry
                    .job
                    .failures
                    .last()
                    .map_or("-", |failure| failure.error.as_str());
                let last_error = if last_error.len() > 40 {
                    format!("{}...", &last_error[..37])
                } else {
                    last_error.to_string()
                };
                println!(
                    "{:<38} {:<24} {:<9} {:<22} {}",
                    entry.job.id.to_string(),
                    entry.job.job_type,
                    entry.job.attempts,
                    entry.dead_lettered_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    last_error
                );
            }
            println!();
            println!(
                "{} {} job(s) held for inspection",
                style("ℹ").cyan(),
                dead.len()
            );
        }
    }
    Ok(())
}
