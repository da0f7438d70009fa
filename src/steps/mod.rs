//! Concrete provisioning steps and graph construction
//!
//! Each submodule contributes the steps for one phase; this module
//! assembles them into the dependency graph the scheduler walks. Edges
//! encode the original phase ordering where it matters (packages before
//! users, incus before networks, networks before containers) while
//! leaving the postgres and dev chains free to run concurrently once
//! their containers are up.

pub mod backups;
pub mod containers;
pub mod dev_setup;
pub mod host;
pub mod incus;
pub mod network;
pub mod postgres;

use orchestrate::{BoxedStep, Graph, GraphError};

use crate::config::Config;

/// Graph-level options, resolved from CLI flags
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphOptions {
    /// Leave the whole backups phase out of the graph
    pub skip_backups: bool,
}

/// Build the full provisioning graph for one configuration.
pub fn build_graph(config: &Config, opts: GraphOptions) -> Result<Graph, GraphError> {
    let mut steps: Vec<BoxedStep> = Vec::new();
    steps.extend(host::steps(config));
    steps.extend(incus::steps(config));
    steps.extend(network::steps(config));
    steps.extend(containers::steps(config));
    steps.extend(postgres::steps(config));
    steps.extend(dev_setup::steps(config));
    steps.extend(containers::common_steps(config));
    if !opts.skip_backups {
        steps.extend(backups::steps(config));
    }

    // SSH hardening locks the original user out of new sessions, and
    // the transport opens a new session per command - so it runs only
    // after every other step has finished
    let after: Vec<String> = steps.iter().map(|s| s.id()).collect();
    steps.push(host::harden_ssh_step(config, after));

    Graph::build(steps)
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    const YAML: &str = r#"
server:
  host: 203.0.113.10
  auth_method: ssh_key
  ssh_key_path: ~/.ssh/id_ed25519
admin:
  username: ops
  ssh_public_key: "ssh-ed25519 AAAAC3Nza ops@laptop"
network:
  interface: enp5s0
  gateway: 203.0.113.1
  netmask: 255.255.255.0
  ips:
    host: 203.0.113.10
    dev: 203.0.113.11
    staging: 203.0.113.12
    prod: 203.0.113.13
resources:
  dev:
    memory: 16GB
    cpu_allowance: 30%
  staging:
    memory: 8GB
    cpu_allowance: 15%
  prod:
    memory: 16GB
    cpu_allowance: 30%
  postgres:
    memory: 8GB
    cpu_allowance: 20%
postgres:
  version: "17"
  databases:
    - name: app_prod
      user: app
    - name: app_staging
      user: app_staging
backups:
  offsite:
    enabled: true
    storagebox_host: u123.example.net
    storagebox_user: u123
dev_setup:
  packages: [git, vim]
common_setup:
  packages: [curl]
"#;
    serde_yaml::from_str(YAML).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrate::{RunState, StepRecord, StepStatus};

    fn ids(graph: &Graph) -> Vec<String> {
        (0..graph.len()).map(|i| graph.step(i).id()).collect()
    }

    fn mark_succeeded(graph: &Graph, state: &mut RunState, id: &str) {
        state
            .record(
                graph.index_of(id).unwrap(),
                StepRecord {
                    status: StepStatus::Succeeded,
                    detail: None,
                    error: None,
                    duration: None,
                },
            )
            .unwrap();
    }

    #[test]
    fn full_graph_builds_acyclic() {
        let graph = build_graph(&test_config(), GraphOptions::default()).unwrap();
        let all = ids(&graph);
        for expected in [
            "hardening.contrib-repo",
            "hardening.ssh",
            "incus.install",
            "network.private-bridge",
            "containers.launch.postgres",
            "containers.ssh.dev",
            "postgres.db.app_prod",
            "postgres.connectivity",
            "dev.python",
            "common.dev",
            "backups.initial-snapshot",
        ] {
            assert!(all.contains(&expected.to_string()), "missing {expected}");
        }
        // postgres gets no ssh step
        assert!(!all.contains(&"containers.ssh.postgres".to_string()));
    }

    #[test]
    fn skip_backups_omits_the_phase() {
        let graph = build_graph(
            &test_config(),
            GraphOptions { skip_backups: true },
        )
        .unwrap();
        assert!(ids(&graph).iter().all(|id| !id.starts_with("backups.")));
    }

    #[test]
    fn only_the_hardening_root_is_initially_ready() {
        let graph = build_graph(&test_config(), GraphOptions::default()).unwrap();
        let state = RunState::new(graph.len());
        let ready: Vec<String> = graph
            .ready(&state)
            .into_iter()
            .map(|i| graph.step(i).id())
            .collect();
        assert_eq!(ready, vec!["hardening.contrib-repo".to_string()]);
    }

    #[test]
    fn ssh_hardening_waits_for_every_other_step() {
        let graph = build_graph(&test_config(), GraphOptions::default()).unwrap();
        let mut state = RunState::new(graph.len());
        for id in ids(&graph) {
            if id != "hardening.ssh" {
                mark_succeeded(&graph, &mut state, &id);
            }
        }
        let ready: Vec<String> = graph
            .ready(&state)
            .into_iter()
            .map(|i| graph.step(i).id())
            .collect();
        assert_eq!(ready, vec!["hardening.ssh".to_string()]);

        // With anything still pending, ssh hardening is not eligible
        let fresh = RunState::new(graph.len());
        assert!(
            !graph
                .ready(&fresh)
                .into_iter()
                .any(|i| graph.step(i).id() == "hardening.ssh")
        );
    }

    #[test]
    fn postgres_and_dev_chains_are_independent() {
        let graph = build_graph(&test_config(), GraphOptions::default()).unwrap();
        let mut state = RunState::new(graph.len());
        // Drive the shared prefix to completion
        for id in [
            "hardening.contrib-repo",
            "hardening.system-update",
            "hardening.admin-user",
            "hardening.firewall",
            "hardening.kernel-params",
            "incus.install",
            "incus.init",
            "incus.profiles",
            "incus.docker-profile",
            "network.private-bridge",
            "network.public-macvlan",
            "network.private-profiles",
            "network.firewall",
            "containers.launch.dev",
            "containers.launch.postgres",
            "containers.network.dev",
            "containers.network.postgres",
            "containers.ssh.dev",
        ] {
            mark_succeeded(&graph, &mut state, id);
        }

        let ready: Vec<String> = graph
            .ready(&state)
            .into_iter()
            .map(|i| graph.step(i).id())
            .collect();
        assert!(ready.contains(&"postgres.install".to_string()));
        assert!(ready.contains(&"dev.packages".to_string()));
        assert!(ready.contains(&"common.dev".to_string()));
    }

    #[test]
    fn database_steps_gate_the_connectivity_probe() {
        let graph = build_graph(&test_config(), GraphOptions::default()).unwrap();
        let idx = graph.index_of("postgres.connectivity").unwrap();
        let deps = graph.step(idx).depends_on();
        assert!(deps.contains(&"postgres.db.app_prod".to_string()));
        assert!(deps.contains(&"postgres.db.app_staging".to_string()));
    }

    #[test]
    fn step_ids_are_unique_across_phases() {
        let graph = build_graph(&test_config(), GraphOptions::default()).unwrap();
        let mut all = ids(&graph);
        let before = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), before);
    }
}
