//! Static service topology
//!
//! The deployment's implicit "A must exist before B starts" ordering is made
//! explicit here: a set of immutable [`ServiceSpec`]s forming a dependency
//! graph, validated once at load time and never mutated afterwards. The
//! supervisor walks [`Topology::startup_order`]; every other process only
//! cares about the readiness probes attached to its own dependencies.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::config::Settings;
use crate::error::{OrchestratorError, Result};

/// What the supervisor does when a managed service exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Restart on any exit until shut down.
    UnlessStopped,
    /// Restart only on non-zero exit; a clean exit marks the service done.
    /// This is the migration gate's retry path.
    OnFailure,
    /// Run once, never restart.
    None,
}

/// How a service's readiness is observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "target")]
pub enum ProbeSpec {
    /// Connect-and-ping against the configured datastore.
    Postgres,
    /// PING against the configured broker.
    Redis,
    /// TCP connect against an address.
    Tcp(String),
}

/// One service in the deployment topology. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique service name.
    pub name: String,
    /// Startup command, run through `sh -c`. `None` marks an externally
    /// managed dependency (datastore, broker): the supervisor never launches
    /// it and only observes its probe.
    #[serde(default)]
    pub command: Option<String>,
    /// Names of services that must be up before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Restart behavior.
    pub restart: RestartPolicy,
    /// Optional readiness probe.
    #[serde(default)]
    pub probe: Option<ProbeSpec>,
}

/// Validated service dependency graph.
#[derive(Debug, Clone)]
pub struct Topology {
    services: Vec<ServiceSpec>,
}

impl Topology {
    /// Build and validate a topology.
    ///
    /// # Errors
    ///
    /// Rejects duplicate names, dependencies on unknown services, and
    /// dependency cycles.
    pub fn new(services: Vec<ServiceSpec>) -> Result<Self> {
        let topology = Self { services };
        topology.validate()?;
        Ok(topology)
    }

    /// The static six-service workspace deployment: two stateful
    /// dependencies, the migration gate and the three processes gated on it.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the built-in graph is valid by construction.
    pub fn workspace(settings: &Settings) -> Result<Self> {
        Self::new(vec![
            ServiceSpec {
                name: "datastore".to_string(),
                command: None,
                depends_on: vec![],
                restart: RestartPolicy::UnlessStopped,
                probe: Some(ProbeSpec::Postgres),
            },
            ServiceSpec {
                name: "broker".to_string(),
                command: None,
                depends_on: vec![],
                restart: RestartPolicy::UnlessStopped,
                probe: Some(ProbeSpec::Redis),
            },
            ServiceSpec {
                name: "migrate".to_string(),
                command: Some("bumblebee bootstrap".to_string()),
                depends_on: vec!["datastore".to_string()],
                restart: RestartPolicy::OnFailure,
                probe: None,
            },
            ServiceSpec {
                name: "web".to_string(),
                command: Some("bumblebee serve".to_string()),
                depends_on: vec![
                    "datastore".to_string(),
                    "broker".to_string(),
                    "migrate".to_string(),
                ],
                restart: RestartPolicy::UnlessStopped,
                probe: Some(ProbeSpec::Tcp(settings.server.bind.clone())),
            },
            ServiceSpec {
                name: "scheduler".to_string(),
                command: Some("bumblebee scheduler".to_string()),
                depends_on: vec![
                    "datastore".to_string(),
                    "broker".to_string(),
                    "migrate".to_string(),
                ],
                restart: RestartPolicy::UnlessStopped,
                probe: None,
            },
            ServiceSpec {
                name: "worker".to_string(),
                command: Some("bumblebee worker".to_string()),
                depends_on: vec![
                    "datastore".to_string(),
                    "broker".to_string(),
                    "migrate".to_string(),
                ],
                restart: RestartPolicy::UnlessStopped,
                probe: None,
            },
        ])
    }

    /// Look up a service by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// All services, in declaration order.
    #[must_use]
    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    /// Services in startup order: every service appears after all of its
    /// dependencies. Declaration order breaks ties, so the result is
    /// deterministic.
    #[must_use]
    pub fn startup_order(&self) -> Vec<&ServiceSpec> {
        // Kahn's algorithm; validation already ruled out cycles.
        let mut indegree: HashMap<&str, usize> = self
            .services
            .iter()
            .map(|s| (s.name.as_str(), s.depends_on.len()))
            .collect();
        let mut order = Vec::with_capacity(self.services.len());
        let mut placed: HashSet<&str> = HashSet::new();

        while order.len() < self.services.len() {
            for spec in &self.services {
                if placed.contains(spec.name.as_str()) {
                    continue;
                }
                if indegree[spec.name.as_str()] == 0 {
                    placed.insert(spec.name.as_str());
                    order.push(spec);
                    for other in &self.services {
                        if other.depends_on.iter().any(|d| d == &spec.name) {
                            if let Some(n) = indegree.get_mut(other.name.as_str()) {
                                *n -= 1;
                            }
                        }
                    }
                }
            }
        }
        order
    }

    fn validate(&self) -> Result<()> {
        let mut names: HashSet<&str> = HashSet::new();
        for spec in &self.services {
            if !names.insert(spec.name.as_str()) {
                return Err(OrchestratorError::Topology(format!(
                    "duplicate service name `{}`",
                    spec.name
                )));
            }
        }
        for spec in &self.services {
            for dep in &spec.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(OrchestratorError::Topology(format!(
                        "service `{}` depends on unknown service `{dep}`",
                        spec.name
                    )));
                }
            }
        }

        // Cycle check: repeatedly strip services whose dependencies are all
        // stripped; anything left participates in a cycle.
        let mut remaining: HashSet<&str> = names;
        loop {
            let strippable: Vec<&str> = self
                .services
                .iter()
                .filter(|s| remaining.contains(s.name.as_str()))
                .filter(|s| s.depends_on.iter().all(|d| !remaining.contains(d.as_str())))
                .map(|s| s.name.as_str())
                .collect();
            if strippable.is_empty() {
                break;
            }
            for name in strippable {
                remaining.remove(name);
            }
        }
        if let Some(stuck) = remaining.iter().next() {
            return Err(OrchestratorError::Topology(format!(
                "dependency cycle involving `{stuck}`"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, deps: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            command: Some(format!("run-{name}")),
            depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
            restart: RestartPolicy::UnlessStopped,
            probe: None,
        }
    }

    #[test]
    fn workspace_topology_is_valid() {
        let topology = Topology::workspace(&Settings::default()).unwrap();
        assert_eq!(topology.services().len(), 6);
        assert!(topology.get("migrate").is_some());
    }

    #[test]
    fn startup_order_respects_dependencies() {
        let topology = Topology::workspace(&Settings::default()).unwrap();
        let order: Vec<&str> = topology
            .startup_order()
            .iter()
            .map(|s| s.name.as_str())
            .collect();

        let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();
        assert!(pos("datastore") < pos("migrate"));
        assert!(pos("migrate") < pos("web"));
        assert!(pos("migrate") < pos("scheduler"));
        assert!(pos("migrate") < pos("worker"));
        assert!(pos("broker") < pos("worker"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = Topology::new(vec![spec("web", &["ghost"])]).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let err = Topology::new(vec![spec("web", &[]), spec("web", &[])]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn cycle_is_rejected() {
        let err = Topology::new(vec![
            spec("a", &["b"]),
            spec("b", &["c"]),
            spec("c", &["a"]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }
}
