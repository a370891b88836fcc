//! Readiness tracking: dependent processes must block until their
//! dependencies answer, and fail cleanly after the configured window.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use bumblebee::error::{OrchestratorError, Result};
use bumblebee::readiness::{wait_all_ready, wait_ready, HealthProbe, Readiness};

/// Probe that starts answering after a number of failures.
struct WarmingProbe {
    name: &'static str,
    failures_before_ready: u32,
    calls: AtomicU32,
}

impl WarmingProbe {
    fn new(name: &'static str, failures_before_ready: u32) -> Self {
        Self {
            name,
            failures_before_ready,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl HealthProbe for WarmingProbe {
    fn name(&self) -> &str {
        self.name
    }

    async fn check(&self) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.failures_before_ready {
            Ok(())
        } else {
            Err(OrchestratorError::TransientDependency {
                name: self.name.to_string(),
                reason: "connection refused".to_string(),
            })
        }
    }
}

#[tokio::test(start_paused = true)]
async fn waits_through_a_slow_dependency_start() {
    // The datastore answers only after 20 seconds of polling.
    let probe = WarmingProbe::new("datastore", 20);
    let outcome = wait_ready(&probe, Duration::from_secs(60), Duration::from_secs(1)).await;
    assert_eq!(outcome, Readiness::Ready);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 21);
}

#[tokio::test(start_paused = true)]
async fn start_is_blocked_while_a_dependency_is_down() {
    // The broker is fine, the datastore never comes up: the process must
    // not start, and the failure must name the datastore.
    let probes: Vec<Box<dyn HealthProbe>> = vec![
        Box::new(WarmingProbe::new("broker", 0)),
        Box::new(WarmingProbe::new("datastore", u32::MAX)),
    ];
    let err = wait_all_ready(&probes, Duration::from_secs(60), Duration::from_secs(1))
        .await
        .unwrap_err();
    match err {
        OrchestratorError::ReadinessTimeout { name, waited } => {
            assert_eq!(name, "datastore");
            assert_eq!(waited, Duration::from_secs(60));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn start_proceeds_once_all_dependencies_answer() {
    let probes: Vec<Box<dyn HealthProbe>> = vec![
        Box::new(WarmingProbe::new("datastore", 3)),
        Box::new(WarmingProbe::new("broker", 5)),
    ];
    wait_all_ready(&probes, Duration::from_secs(60), Duration::from_secs(1))
        .await
        .unwrap();
}
