//! Built-in job handlers
//!
//! The workspace application registers its own handlers for the jobs it
//! enqueues; these built-ins cover the orchestrator's default schedule
//! entries so the queue drains in deployments where the application has
//! not yet installed them. They log the sweep and succeed — the business
//! semantics of the payloads live outside the orchestration core.

use std::sync::Arc;

use async_trait::async_trait;

use bumblebee::queue::JobDescriptor;
use bumblebee::worker::{HandlerRegistry, JobHandler};

struct InstanceExpirySweep;

#[async_trait]
impl JobHandler for InstanceExpirySweep {
    fn job_type(&self) -> &str {
        "instance.expiry_sweep"
    }

    async fn execute(&self, job: &JobDescriptor) -> anyhow::Result<()> {
        tracing::info!(job_id = %job.id, "instance expiry sweep requested");
        Ok(())
    }
}

struct BackupExpirySweep;

#[async_trait]
impl JobHandler for BackupExpirySweep {
    fn job_type(&self) -> &str {
        "backup.expiry_sweep"
    }

    async fn execute(&self, job: &JobDescriptor) -> anyhow::Result<()> {
        tracing::info!(job_id = %job.id, "backup expiry sweep requested");
        Ok(())
    }
}

/// The worker's dispatch table.
#[must_use]
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(InstanceExpirySweep));
    registry.register(Arc::new(BackupExpirySweep));
    registry
}
