use crate::comm::{Rank, COORDINATOR_RANK};
use crate::work;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path, path::PathBuf};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Config file could not be read")]
    ReadFailed(#[from] std::io::Error),
    #[error("Config file could not be parsed")]
    ParseFailed(#[from] serde_yaml::Error),
    #[error("Config did not pass the preflight checks")]
    PreflightFailed,
    #[error("Service selects no ranks")]
    EmptyRanks(String),
    #[error("Service rank selection is invalid")]
    InvalidRanks(String),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    // Base directory the services work out of
    pub workdir: PathBuf,
    // Environment modules the services expect, exposed as the ${modules} template
    #[serde(default)]
    pub modules: Vec<String>,
    // Seconds the scheduler sleeps between polling passes
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    // Services as named work definitions placed on ranks
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    // Name of the selected work kind, see Works::load for the selection process
    pub kind: String,
    // Ranks the service is placed on
    pub ranks: RankSelector,
    // Configuration source, resolved and handed to the work kind
    pub config: PathBuf,
}

/// Ranks a service lands on, either by role or spelled out.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum RankSelector {
    Named(NamedSelector),
    List(Vec<Rank>),
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NamedSelector {
    Coordinator,
    Workers,
    All,
}

impl RankSelector {
    /// Concrete world ranks for a world of `world_size` processes. The
    /// list keeps its order since position 0 leads the service's group.
    pub fn resolve(&self, world_size: u32) -> Vec<Rank> {
        match self {
            RankSelector::Named(NamedSelector::Coordinator) => vec![COORDINATOR_RANK],
            RankSelector::Named(NamedSelector::Workers) => (1..world_size).collect(),
            RankSelector::Named(NamedSelector::All) => (0..world_size).collect(),
            RankSelector::List(ranks) => ranks.clone(),
        }
    }
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let text = fs::read_to_string(path)?;
        let mut config: ClusterConfig = serde_yaml::from_str(&text)?;

        if let Some(base) = path.parent() {
            config.anchor_paths(base);
        }

        Ok(config)
    }

    /// Service config paths are given relative to the cluster config
    /// file, not to whatever directory each rank happens to run in.
    fn anchor_paths(&mut self, base: &Path) {
        for service in self.services.values_mut() {
            if service.config.is_relative() {
                service.config = base.join(&service.config);
            }
        }
    }

    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.services.is_empty() {
            error!("No service was defined, the cluster would have nothing to run");
            contains_error = true;
        }

        if self.poll_interval == 0 {
            error!("poll_interval cannot be 0, the scheduler would spin instead of sleeping");
            contains_error = true;
        }

        if self.workdir.is_relative() {
            warn!(
                "workdir {} is relative and will resolve against each rank's working directory",
                self.workdir.to_string_lossy()
            );
        }

        for (name, service) in self.services.iter_mut() {
            service.kind = service.kind.to_lowercase();

            if !work::is_known_kind(&service.kind) {
                error!(
                    "services.{name}.kind ({}) is not supported, see the work kind list",
                    service.kind
                );
                contains_error = true;
            }

            if !service.config.is_file() {
                error!(
                    "Failed to find services.{name}.config. Either not a file or not found at {}",
                    service.config.to_string_lossy()
                );
                contains_error = true;
            }

            if let RankSelector::List(ranks) = &service.ranks {
                if ranks.is_empty() {
                    error!("services.{name}.ranks selects no ranks, a service can't be a NOP");
                    contains_error = true;
                }
                if !ranks.iter().all_unique() {
                    error!("services.{name}.ranks contains duplicate ranks: {ranks:?}");
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

fn default_poll_interval() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXAMPLE: &str = "
workdir: /scratch/muster
modules:
  - hdfs
poll_interval: 5
services:
  namenode:
    kind: daemon
    ranks: coordinator
    config: namenode.yaml
  datanodes:
    kind: daemon
    ranks: workers
    config: datanode.yaml
  probe:
    kind: echo
    ranks: [1, 3]
    config: probe.yaml
";

    #[test]
    fn parses_the_example_document() {
        let config: ClusterConfig = serde_yaml::from_str(EXAMPLE).unwrap();

        assert_eq!(config.workdir, PathBuf::from("/scratch/muster"));
        assert_eq!(config.modules, vec!["hdfs"]);
        assert_eq!(config.poll_interval, 5);
        assert_eq!(config.services.len(), 3);
        assert_eq!(
            config.services["namenode"].ranks,
            RankSelector::Named(NamedSelector::Coordinator)
        );
        assert_eq!(config.services["probe"].ranks, RankSelector::List(vec![1, 3]));
    }

    #[test]
    fn poll_interval_defaults_to_a_minute() {
        let config: ClusterConfig =
            serde_yaml::from_str("workdir: /tmp\nservices: {}\n").unwrap();

        assert_eq!(config.poll_interval, 60);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result =
            serde_yaml::from_str::<ClusterConfig>("workdir: /tmp\nservices: {}\nworkdirs: /b\n");

        assert!(result.is_err());
    }

    #[test]
    fn selectors_resolve_against_the_world_size() {
        assert_eq!(
            RankSelector::Named(NamedSelector::Coordinator).resolve(4),
            vec![COORDINATOR_RANK]
        );
        assert_eq!(RankSelector::Named(NamedSelector::Workers).resolve(4), vec![1, 2, 3]);
        assert_eq!(RankSelector::Named(NamedSelector::All).resolve(3), vec![0, 1, 2]);
        assert_eq!(RankSelector::List(vec![2, 0]).resolve(4), vec![2, 0]);
        assert_eq!(RankSelector::Named(NamedSelector::Workers).resolve(1), Vec::<Rank>::new());
    }

    #[test]
    fn load_anchors_service_configs_next_to_the_cluster_config() {
        let dir = tempfile::tempdir().unwrap();
        let service_config = dir.path().join("probe.yaml");
        fs::write(&service_config, "polls: 1\n").unwrap();

        let cluster_config = dir.path().join("cluster.yaml");
        let mut file = fs::File::create(&cluster_config).unwrap();
        write!(
            file,
            "workdir: /tmp\nservices:\n  probe:\n    kind: echo\n    ranks: all\n    config: probe.yaml\n"
        )
        .unwrap();

        let config = ClusterConfig::load(&cluster_config).unwrap();

        assert_eq!(config.services["probe"].config, service_config);
    }

    #[test]
    fn preflight_flags_broken_definitions() {
        let mut config: ClusterConfig = serde_yaml::from_str(
            "
workdir: /tmp
poll_interval: 0
services:
  ghost:
    kind: Teleport
    ranks: [1, 1]
    config: /nonexistent/ghost.yaml
",
        )
        .unwrap();

        assert!(config.preflight_checks());
        // kinds are normalized even when the run is abandoned
        assert_eq!(config.services["ghost"].kind, "teleport");
    }

    #[test]
    fn preflight_accepts_a_complete_config() {
        let dir = tempfile::tempdir().unwrap();
        let service_config = dir.path().join("probe.yaml");
        fs::write(&service_config, "polls: 2\n").unwrap();

        let mut config: ClusterConfig = serde_yaml::from_str(&format!(
            "workdir: /tmp\nservices:\n  probe:\n    kind: ECHO\n    ranks: all\n    config: {}\n",
            service_config.display()
        ))
        .unwrap();

        assert!(!config.preflight_checks());
        assert_eq!(config.services["probe"].kind, "echo");
    }
}
