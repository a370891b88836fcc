//! Local bootstrap coordinator
//!
//! Brings up the managed services of a [`Topology`] in dependency order
//! and keeps them running per their restart policies. This is the
//! deployment's compose-file behavior made explicit: externally managed
//! dependencies (datastore, broker) are only observed through their
//! readiness probes, while every other service is a supervised child
//! process.
//!
//! Readiness signals per service kind:
//!
//! - external (no command): its probe reports ready;
//! - long-running (`unless-stopped`): the process is up and, when a probe
//!   is declared, the probe reports ready;
//! - one-shot (`on-failure`, `none`): the process exited zero. This is the
//!   migration gate's contract — dependents unblock on exit-zero, and
//!   `on-failure` re-invokes a failed gate.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::Result;
use crate::readiness::{self, wait_ready, HealthProbe, Readiness};
use crate::topology::{RestartPolicy, ServiceSpec, Topology};

/// Pause between restarts of a failed service.
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Supervises one topology until shutdown.
pub struct Supervisor {
    topology: Topology,
    settings: Settings,
}

impl Supervisor {
    /// Build a supervisor over a validated topology.
    #[must_use]
    pub fn new(topology: Topology, settings: Settings) -> Self {
        Self { topology, settings }
    }

    /// Launch every service (readiness-gated on its dependencies) and run
    /// until shutdown. Children are killed on the way out.
    ///
    /// # Errors
    ///
    /// Infallible in practice; per-service failures are handled by restart
    /// policies and logged.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let order = self.topology.startup_order();
        tracing::info!(
            services = ?order.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            "supervisor starting topology"
        );

        let mut up_signals: HashMap<String, watch::Receiver<bool>> = HashMap::new();
        let mut services = JoinSet::new();
        for spec in order {
            let (tx, rx) = watch::channel(false);
            // Startup order guarantees every dependency already has a signal.
            let deps: Vec<watch::Receiver<bool>> = spec
                .depends_on
                .iter()
                .filter_map(|dep| up_signals.get(dep).cloned())
                .collect();
            up_signals.insert(spec.name.clone(), rx);

            let spec = spec.clone();
            let settings = self.settings.clone();
            let shutdown = shutdown.clone();
            services.spawn(async move {
                supervise(spec, settings, deps, tx, shutdown).await;
            });
        }

        while let Some(joined) = services.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "service supervisor task aborted");
            }
        }
        tracing::info!("supervisor stopped");
        Ok(())
    }
}

async fn supervise(
    spec: ServiceSpec,
    settings: Settings,
    mut deps: Vec<watch::Receiver<bool>>,
    up: watch::Sender<bool>,
    shutdown: CancellationToken,
) {
    // Block until every dependency reports up.
    for dep in &mut deps {
        tokio::select! {
            () = shutdown.cancelled() => return,
            result = dep.wait_for(|ready| *ready) => {
                if result.is_err() {
                    // Dependency supervisor is gone; nothing sane to do.
                    return;
                }
            }
        }
    }

    let probe = build_probe(&spec, &settings);
    match spec.command.clone() {
        None => observe_external(&spec, &settings, probe.as_deref(), &up, &shutdown).await,
        Some(command) => {
            supervise_managed(&spec, &command, &settings, probe.as_deref(), &up, &shutdown).await;
        }
    }
}

fn build_probe(spec: &ServiceSpec, settings: &Settings) -> Option<Box<dyn HealthProbe>> {
    let probe_spec = spec.probe.as_ref()?;
    match readiness::probe_for(&spec.name, probe_spec, settings) {
        Ok(probe) => Some(probe),
        Err(err) => {
            tracing::error!(service = %spec.name, error = %err, "probe setup failed");
            None
        }
    }
}

/// An externally managed dependency: poll its probe until ready, however
/// long that takes, then mark it up for its dependents.
async fn observe_external(
    spec: &ServiceSpec,
    settings: &Settings,
    probe: Option<&dyn HealthProbe>,
    up: &watch::Sender<bool>,
    shutdown: &CancellationToken,
) {
    if let Some(probe) = probe {
        loop {
            let outcome = tokio::select! {
                () = shutdown.cancelled() => return,
                outcome = wait_ready(
                    probe,
                    settings.readiness.timeout(),
                    settings.readiness.poll_interval(),
                ) => outcome,
            };
            match outcome {
                Readiness::Ready => break,
                Readiness::TimedOut => {
                    tracing::warn!(service = %spec.name, "external dependency still not ready");
                }
            }
        }
    }
    let _ = up.send(true);
}

async fn supervise_managed(
    spec: &ServiceSpec,
    command: &str,
    settings: &Settings,
    probe: Option<&dyn HealthProbe>,
    up: &watch::Sender<bool>,
    shutdown: &CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        tracing::info!(service = %spec.name, command, "starting service");
        let mut child = match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(service = %spec.name, error = %err, "spawn failed");
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(RESTART_DELAY) => continue,
                }
            }
        };

        // Long-running services are up once (optionally) probed ready;
        // one-shot services signal up at clean exit instead.
        if spec.restart == RestartPolicy::UnlessStopped {
            if let Some(probe) = probe {
                let outcome = tokio::select! {
                    () = shutdown.cancelled() => {
                        let _ = child.kill().await;
                        return;
                    }
                    outcome = wait_ready(
                        probe,
                        settings.readiness.timeout(),
                        settings.readiness.poll_interval(),
                    ) => outcome,
                };
                if outcome == Readiness::TimedOut {
                    tracing::warn!(service = %spec.name, "service never became ready, restarting");
                    let _ = child.kill().await;
                    tokio::select! {
                        () = shutdown.cancelled() => return,
                        () = tokio::time::sleep(RESTART_DELAY) => continue,
                    }
                }
            }
            let _ = up.send(true);
        }

        let status = tokio::select! {
            () = shutdown.cancelled() => {
                tracing::info!(service = %spec.name, "stopping service");
                let _ = child.kill().await;
                return;
            }
            status = child.wait() => status,
        };
        let _ = up.send(false);
        let success = matches!(&status, Ok(code) if code.success());

        match spec.restart {
            RestartPolicy::UnlessStopped => {
                tracing::warn!(service = %spec.name, status = ?status, "service exited, restarting");
            }
            RestartPolicy::OnFailure => {
                if success {
                    tracing::info!(service = %spec.name, "service completed");
                    let _ = up.send(true);
                    return;
                }
                tracing::warn!(service = %spec.name, status = ?status, "service failed, retrying");
            }
            RestartPolicy::None => {
                if success {
                    let _ = up.send(true);
                } else {
                    tracing::error!(service = %spec.name, status = ?status, "one-shot service failed");
                }
                return;
            }
        }
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(RESTART_DELAY) => {}
        }
    }
}
