//! Dependency readiness tracker
//!
//! Polls a dependency's health probe until it succeeds or a deadline
//! passes. Each failed probe is logged at debug level, the final state at
//! info (or warn) level. There are no retries beyond the poll loop itself;
//! the caller decides what a [`Readiness::TimedOut`] means.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};

use crate::config::Settings;
use crate::error::{OrchestratorError, Result};
use crate::topology::ProbeSpec;

/// Outcome of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The probe succeeded at least once.
    Ready,
    /// The deadline passed without a successful probe.
    TimedOut,
}

/// A synchronous health check returning success or failure within a bounded
/// time.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Dependency name, used in logs and errors.
    fn name(&self) -> &str;

    /// Run the check once.
    async fn check(&self) -> Result<()>;
}

/// Connect-and-ping probe for the relational datastore.
pub struct PostgresProbe {
    name: String,
    url: String,
    probe_timeout: Duration,
}

impl PostgresProbe {
    /// Build a probe against a `postgres://` URL.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>, probe_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            probe_timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for PostgresProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<()> {
        let attempt = async {
            let mut conn = PgConnection::connect(&self.url).await?;
            conn.ping().await?;
            conn.close().await?;
            Ok(())
        };
        clamp(self.name(), self.probe_timeout, attempt).await
    }
}

/// PING probe for the in-memory broker.
pub struct RedisProbe {
    name: String,
    client: redis::Client,
    probe_timeout: Duration,
}

impl RedisProbe {
    /// Build a probe against a `redis://` URL.
    ///
    /// # Errors
    ///
    /// Fails if the URL does not parse.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        probe_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            client: redis::Client::open(url.into().as_str())?,
            probe_timeout,
        })
    }
}

#[async_trait]
impl HealthProbe for RedisProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<()> {
        let attempt = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            if pong == "PONG" {
                Ok(())
            } else {
                Err(OrchestratorError::TransientDependency {
                    name: self.name.clone(),
                    reason: format!("unexpected PING reply `{pong}`"),
                })
            }
        };
        clamp(self.name(), self.probe_timeout, attempt).await
    }
}

/// Plain TCP connect probe, used for managed services that expose a socket.
pub struct TcpProbe {
    name: String,
    addr: String,
    probe_timeout: Duration,
}

impl TcpProbe {
    /// Build a probe against a `host:port` address.
    #[must_use]
    pub fn new(name: impl Into<String>, addr: impl Into<String>, probe_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            probe_timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<()> {
        let attempt = async {
            tokio::net::TcpStream::connect(&self.addr).await?;
            Ok(())
        };
        clamp(self.name(), self.probe_timeout, attempt).await
    }
}

/// Bound a single probe call, folding the elapsed case into the transient
/// taxonomy.
async fn clamp(
    name: &str,
    probe_timeout: Duration,
    attempt: impl std::future::Future<Output = Result<()>> + Send,
) -> Result<()> {
    match tokio::time::timeout(probe_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(OrchestratorError::TransientDependency {
            name: name.to_string(),
            reason: format!("probe timed out after {probe_timeout:?}"),
        }),
    }
}

/// Build the probe a [`ProbeSpec`] describes, bound to this deployment's
/// connection settings.
///
/// # Errors
///
/// Fails if the broker URL does not parse.
pub fn probe_for(name: &str, spec: &ProbeSpec, settings: &Settings) -> Result<Box<dyn HealthProbe>> {
    let probe_timeout = settings.readiness.probe_timeout();
    Ok(match spec {
        ProbeSpec::Postgres => Box::new(PostgresProbe::new(
            name,
            settings.database.url(),
            probe_timeout,
        )),
        ProbeSpec::Redis => Box::new(RedisProbe::new(name, settings.broker.url(), probe_timeout)?),
        ProbeSpec::Tcp(addr) => Box::new(TcpProbe::new(name, addr.clone(), probe_timeout)),
    })
}

/// Poll `probe` every `poll_interval` until it succeeds or `timeout`
/// elapses.
///
/// Always runs at least one probe, so a zero timeout still observes an
/// already-ready dependency.
pub async fn wait_ready(
    probe: &dyn HealthProbe,
    timeout: Duration,
    poll_interval: Duration,
) -> Readiness {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match probe.check().await {
            Ok(()) => {
                tracing::info!(dependency = probe.name(), "dependency ready");
                return Readiness::Ready;
            }
            Err(err) => {
                tracing::debug!(dependency = probe.name(), error = %err, "probe failed");
            }
        }
        if tokio::time::Instant::now() + poll_interval >= deadline {
            tracing::warn!(
                dependency = probe.name(),
                timeout = ?timeout,
                "dependency readiness timed out"
            );
            return Readiness::TimedOut;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Wait for every probe in turn, each with the full configured window.
///
/// # Errors
///
/// Returns [`OrchestratorError::ReadinessTimeout`] naming the first
/// dependency that failed to become ready.
pub async fn wait_all_ready(
    probes: &[Box<dyn HealthProbe>],
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    for probe in probes {
        if wait_ready(probe.as_ref(), timeout, poll_interval).await == Readiness::TimedOut {
            return Err(OrchestratorError::ReadinessTimeout {
                name: probe.name().to_string(),
                waited: timeout,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Probe that fails a fixed number of times before succeeding.
    struct FlakyProbe {
        remaining_failures: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyProbe {
        fn new(failures: u32) -> Self {
            Self {
                remaining_failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl HealthProbe for FlakyProbe {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn check(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.remaining_failures.load(Ordering::SeqCst) == 0 {
                Ok(())
            } else {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                Err(OrchestratorError::TransientDependency {
                    name: "flaky".to_string(),
                    reason: "not yet".to_string(),
                })
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_first_success() {
        let probe = FlakyProbe::new(3);
        let outcome = wait_ready(
            &probe,
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(outcome, Readiness::Ready);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_ready() {
        let probe = FlakyProbe::new(u32::MAX);
        let outcome = wait_ready(
            &probe,
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(outcome, Readiness::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_still_probes_once() {
        let probe = FlakyProbe::new(0);
        let outcome = wait_ready(&probe, Duration::ZERO, Duration::from_secs(1)).await;
        assert_eq!(outcome, Readiness::Ready);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }
}
