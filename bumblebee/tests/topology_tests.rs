//! The declarative service graph: startup ordering and the config-borne
//! spec format.

use bumblebee::config::Settings;
use bumblebee::topology::{ProbeSpec, RestartPolicy, ServiceSpec, Topology};

#[test]
fn workspace_startup_order_gates_everything_on_the_migration_gate() {
    let topology = Topology::workspace(&Settings::default()).unwrap();
    let order: Vec<&str> = topology
        .startup_order()
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();

    // Stateful dependencies first, then the gate, then everything else.
    assert!(pos("datastore") < pos("migrate"));
    for dependent in ["web", "scheduler", "worker"] {
        assert!(pos("migrate") < pos(dependent));
        assert!(pos("broker") < pos(dependent));
    }
}

#[test]
fn external_dependencies_carry_probes_but_no_command() {
    let topology = Topology::workspace(&Settings::default()).unwrap();
    for name in ["datastore", "broker"] {
        let spec = topology.get(name).unwrap();
        assert!(spec.command.is_none());
        assert!(spec.probe.is_some());
    }
    let gate = topology.get("migrate").unwrap();
    assert_eq!(gate.restart, RestartPolicy::OnFailure);
    assert!(gate.command.is_some());
}

#[test]
fn service_specs_deserialize_from_config_form() {
    let spec: ServiceSpec = toml::from_str(
        r#"
        name = "web"
        command = "bumblebee serve"
        depends_on = ["datastore", "migrate"]
        restart = "unless-stopped"

        [probe]
        kind = "tcp"
        target = "127.0.0.1:8000"
        "#,
    )
    .unwrap();
    assert_eq!(spec.name, "web");
    assert_eq!(spec.restart, RestartPolicy::UnlessStopped);
    assert_eq!(spec.probe, Some(ProbeSpec::Tcp("127.0.0.1:8000".to_string())));

    let external: ServiceSpec = toml::from_str(
        r#"
        name = "broker"
        restart = "unless-stopped"

        [probe]
        kind = "redis"
        "#,
    )
    .unwrap();
    assert!(external.command.is_none());
    assert_eq!(external.probe, Some(ProbeSpec::Redis));
}
