//! Task distribution across the world.
//!
//! Rank 0 coordinates: it gathers the environment facts, runs the
//! assignment strategy and replicates the outcome, so every process
//! leaves [`setup_tasks`] with a byte-identical task list.

use crate::comm::{self, Bootstrap, Channel, CommError, Rank, SharedChannel, COORDINATOR_RANK};
use crate::config::{ClusterConfig, ConfigErrors};
use crate::node::{self, NodeError};
use crate::template::ConfigTemplate;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_unwrap::ResultExt;

pub const MASTER_HOSTNAME_FACT: &str = "masterhostname";
pub const MASTER_DATANAME_FACT: &str = "masterdataname";

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Collective exchange failed")]
    CommFailed(#[from] CommError),
    #[error("Task assignment failed")]
    AssignFailed(#[from] ConfigErrors),
    #[error("Failed to gather the coordinator facts")]
    FactsFailed(#[from] NodeError),
    #[error("Task has an invalid rank set")]
    InvalidRanks(String),
}

/// One named value about the coordinator's environment.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Fact {
    pub name: String,
    pub value: String,
    pub default: String,
}

/// Facts gathered on the coordinator and replicated verbatim, in a
/// stable order. They feed both config templates and service
/// environments.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvironmentFacts {
    facts: Vec<Fact>,
}

impl EnvironmentFacts {
    pub fn push(&mut self, name: &str, value: &str, default: &str) {
        if let Some(existing) = self.facts.iter_mut().find(|fact| fact.name == name) {
            existing.value = value.to_string();
            existing.default = default.to_string();
        } else {
            self.facts.push(Fact {
                name: name.to_string(),
                value: value.to_string(),
                default: default.to_string(),
            });
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.facts.iter().find(|fact| fact.name == name).map(|fact| fact.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Fact> {
        self.facts.iter()
    }

    pub fn to_templates(&self) -> Vec<ConfigTemplate> {
        self.facts
            .iter()
            .map(|fact| ConfigTemplate::new(&fact.name, &fact.value, &fact.default))
            .collect()
    }

    /// Facts as environment variables for service processes, fact
    /// names verbatim as variable names.
    pub fn to_env(&self) -> BTreeMap<String, String> {
        self.facts.iter().map(|fact| (fact.name.clone(), fact.value.clone())).collect()
    }
}

/// Everything a rank needs to rebuild a service configuration locally.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ConfigParams {
    // Configuration source for the work kind
    pub path: PathBuf,
    // Shared base directory services work out of
    pub workdir: PathBuf,
    // Environment modules the services expect
    pub modules: Vec<String>,
    // Coordinator facts the templates resolve against
    pub facts: EnvironmentFacts,
}

/// One unit of placed work, replicated identically to every rank.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub kind: String,
    pub name: String,
    // World ranks running this task. Position 0 leads the task group.
    pub ranks: Vec<Rank>,
    pub config_opts: ConfigParams,
    // Environment handed to service processes
    pub master_env: BTreeMap<String, String>,
}

/// Per-process coordination state: the root group plus every task
/// group this process became a member of.
pub struct ProcessContext {
    root: SharedChannel,
    pub rank: Rank,
    pub size: u32,
    pub facts: EnvironmentFacts,
    pub tasks: Vec<Task>,
    ephemeral: Vec<SharedChannel>,
    down: bool,
}

impl ProcessContext {
    /// Join the world the launcher put us in.
    pub fn bootstrap() -> Result<Self, CommError> {
        let boot = Bootstrap::from_env()?;
        let channel = comm::connect_root(&boot)?;

        Ok(Self::from_channel(channel))
    }

    pub fn from_channel(channel: Channel) -> Self {
        let rank = channel.rank();
        let size = channel.size();

        Self {
            root: channel.into_shared(),
            rank,
            size,
            facts: EnvironmentFacts::default(),
            tasks: Vec::new(),
            ephemeral: Vec::new(),
            down: false,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == COORDINATOR_RANK
    }

    pub fn root(&self) -> SharedChannel {
        Arc::clone(&self.root)
    }

    /// Track a task group so shutdown can tear it down before the root
    /// group goes away.
    pub fn adopt_group(&mut self, group: SharedChannel) {
        self.ephemeral.push(group);
    }

    pub fn ephemeral_groups(&self) -> usize {
        self.ephemeral.len()
    }

    /// Tear down every group this process belongs to, task groups first
    /// in creation order, the root group last. Errors are logged, not
    /// returned; teardown continues past them. Calling this again does
    /// nothing.
    pub fn shutdown(&mut self) {
        if self.down {
            debug!(rank = self.rank, "context already shut down");
            return;
        }
        self.down = true;

        for group in self.ephemeral.drain(..) {
            let mut channel = group.lock().unwrap_or_log();
            if let Err(error) = channel.teardown() {
                warn!(rank = self.rank, error = ?error, "Failed to tear down a task group: {error}");
            }
        }

        let mut channel = self.root.lock().unwrap_or_log();
        if let Err(error) = channel.teardown() {
            warn!(rank = self.rank, error = ?error, "Failed to tear down the root group: {error}");
        }

        debug!(rank = self.rank, "context shut down");
    }
}

/// Strategy deciding which service runs where. Runs on every rank with
/// identical facts; only the coordinator's outcome is distributed.
pub trait AssignTasks {
    fn assign(
        &self,
        ctx: &ProcessContext,
        facts: &EnvironmentFacts,
    ) -> Result<Vec<Task>, DispatchError>;
}

/// Facts about the coordinating process the services need to find it.
pub fn coordinator_facts() -> Result<EnvironmentFacts, DispatchError> {
    let hostname = node::hostname()?;
    let dataname = node::data_name().unwrap_or_else(|| hostname.clone());

    let mut facts = EnvironmentFacts::default();
    facts.push(MASTER_HOSTNAME_FACT, &hostname, "localhost");
    facts.push(MASTER_DATANAME_FACT, &dataname, "localhost");

    Ok(facts)
}

fn validate_tasks(tasks: &[Task], world_size: u32) -> Result<(), DispatchError> {
    for task in tasks {
        if task.ranks.is_empty() {
            return Err(DispatchError::InvalidRanks(format!("{}: empty rank list", task.name)));
        }
        if !task.ranks.iter().all_unique() {
            return Err(DispatchError::InvalidRanks(format!(
                "{}: duplicate ranks in {:?}",
                task.name, task.ranks
            )));
        }
        if let Some(&bad) = task.ranks.iter().find(|&&rank| rank >= world_size) {
            return Err(DispatchError::InvalidRanks(format!(
                "{}: rank {bad} outside the world of {world_size}",
                task.name
            )));
        }
    }

    Ok(())
}

/// The two-phase distribution: replicate the coordinator facts, run
/// the assignment everywhere, then replicate the coordinator's task
/// list. Collective; every rank of the world must call this.
pub fn setup_tasks<A: AssignTasks>(
    ctx: &mut ProcessContext,
    assigner: &A,
) -> Result<(), DispatchError> {
    let root = ctx.root();

    let facts = {
        let mine = if ctx.is_coordinator() { Some(coordinator_facts()?) } else { None };
        let mut channel = root.lock().unwrap_or_log();
        channel.broadcast(mine, COORDINATOR_RANK)?
    };
    debug!(rank = ctx.rank, facts = facts.len(), "facts replicated");

    let proposed = assigner.assign(ctx, &facts)?;
    if !ctx.is_coordinator() {
        debug!(rank = ctx.rank, proposed = proposed.len(), "local proposal computed, deferring to the coordinator");
    } else {
        validate_tasks(&proposed, ctx.size)?;
    }

    {
        let mut channel = root.lock().unwrap_or_log();
        channel.barrier()?;
    }

    let tasks = {
        let mine = if ctx.is_coordinator() { Some(proposed) } else { None };
        let mut channel = root.lock().unwrap_or_log();
        channel.broadcast(mine, COORDINATOR_RANK)?
    };

    info!(rank = ctx.rank, tasks = tasks.len(), "task list replicated");
    ctx.facts = facts;
    ctx.tasks = tasks;

    Ok(())
}

/// Assignment driven by the cluster config: every service becomes one
/// task on the ranks its selector names.
pub struct ConfigAssigner<'a> {
    config: &'a ClusterConfig,
}

impl<'a> ConfigAssigner<'a> {
    pub fn new(config: &'a ClusterConfig) -> Self {
        Self { config }
    }
}

impl AssignTasks for ConfigAssigner<'_> {
    fn assign(
        &self,
        ctx: &ProcessContext,
        facts: &EnvironmentFacts,
    ) -> Result<Vec<Task>, DispatchError> {
        let mut tasks = Vec::with_capacity(self.config.services.len());

        for (name, service) in &self.config.services {
            let ranks = service.ranks.resolve(ctx.size);
            if ranks.is_empty() {
                return Err(ConfigErrors::EmptyRanks(name.clone()).into());
            }

            tasks.push(Task {
                kind: service.kind.clone(),
                name: name.clone(),
                ranks,
                config_opts: ConfigParams {
                    path: service.config.clone(),
                    workdir: self.config.workdir.clone(),
                    modules: self.config.modules.clone(),
                    facts: facts.clone(),
                },
                master_env: facts.to_env(),
            });
        }

        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::testing::run_world;
    use crate::config::{NamedSelector, RankSelector, ServiceConfig};

    fn task(name: &str, ranks: Vec<Rank>) -> Task {
        Task {
            kind: String::from("echo"),
            name: name.to_string(),
            ranks,
            config_opts: ConfigParams {
                path: PathBuf::from("/tmp/probe.yaml"),
                workdir: PathBuf::from("/tmp"),
                modules: Vec::new(),
                facts: EnvironmentFacts::default(),
            },
            master_env: BTreeMap::new(),
        }
    }

    struct DivergentAssigner;

    impl AssignTasks for DivergentAssigner {
        fn assign(
            &self,
            ctx: &ProcessContext,
            facts: &EnvironmentFacts,
        ) -> Result<Vec<Task>, DispatchError> {
            let mut proposal = task(&format!("proposal-from-{}", ctx.rank), vec![0]);
            proposal.config_opts.facts = facts.clone();

            Ok(vec![proposal])
        }
    }

    #[test]
    fn facts_replace_on_the_same_name() {
        let mut facts = EnvironmentFacts::default();
        facts.push("alpha", "1", "");
        facts.push("beta", "2", "");
        facts.push("alpha", "3", "x");

        assert_eq!(facts.len(), 2);
        assert_eq!(facts.get("alpha"), Some("3"));
        assert_eq!(facts.iter().next().unwrap().name, "alpha");
        assert_eq!(facts.to_env()["beta"], "2");
    }

    #[test]
    fn coordinator_facts_name_the_local_host() {
        let facts = coordinator_facts().unwrap();

        assert_eq!(facts.get(MASTER_HOSTNAME_FACT), Some(node::hostname().unwrap().as_str()));
        assert!(facts.get(MASTER_DATANAME_FACT).is_some());
    }

    #[test]
    fn validation_rejects_broken_rank_sets() {
        assert!(validate_tasks(&[task("a", vec![0, 1])], 4).is_ok());
        assert!(matches!(
            validate_tasks(&[task("a", vec![])], 4),
            Err(DispatchError::InvalidRanks(_))
        ));
        assert!(matches!(
            validate_tasks(&[task("a", vec![1, 1])], 4),
            Err(DispatchError::InvalidRanks(_))
        ));
        assert!(matches!(
            validate_tasks(&[task("a", vec![4])], 4),
            Err(DispatchError::InvalidRanks(_))
        ));
    }

    #[test]
    fn setup_replicates_the_coordinator_outcome() {
        let results = run_world(3, |channel| {
            let mut ctx = ProcessContext::from_channel(channel);
            setup_tasks(&mut ctx, &DivergentAssigner).unwrap();
            let summary = (ctx.tasks.clone(), ctx.facts.clone());
            ctx.shutdown();
            summary
        });

        let (reference_tasks, reference_facts) = &results[0];
        assert_eq!(reference_tasks.len(), 1);
        // every rank proposed its own name, the coordinator's won
        assert_eq!(reference_tasks[0].name, "proposal-from-0");
        assert_eq!(reference_facts.get(MASTER_HOSTNAME_FACT), Some(node::hostname().unwrap().as_str()));

        for (tasks, facts) in &results {
            assert_eq!(tasks, reference_tasks);
            assert_eq!(facts, reference_facts);
        }
    }

    #[test]
    fn config_assignment_follows_the_service_table() {
        let config = ClusterConfig {
            workdir: PathBuf::from("/scratch/muster"),
            modules: vec![String::from("hdfs")],
            poll_interval: 60,
            services: BTreeMap::from([
                (
                    String::from("namenode"),
                    ServiceConfig {
                        kind: String::from("daemon"),
                        ranks: RankSelector::Named(NamedSelector::Coordinator),
                        config: PathBuf::from("/etc/namenode.yaml"),
                    },
                ),
                (
                    String::from("probe"),
                    ServiceConfig {
                        kind: String::from("echo"),
                        ranks: RankSelector::List(vec![2, 1]),
                        config: PathBuf::from("/etc/probe.yaml"),
                    },
                ),
            ]),
        };

        let results = run_world(4, move |channel| {
            let mut ctx = ProcessContext::from_channel(channel);
            let assigner = ConfigAssigner::new(&config);
            setup_tasks(&mut ctx, &assigner).unwrap();
            let tasks = ctx.tasks.clone();
            ctx.shutdown();
            tasks
        });

        for tasks in &results {
            assert_eq!(tasks.len(), 2);
            // BTreeMap order: namenode before probe
            assert_eq!(tasks[0].name, "namenode");
            assert_eq!(tasks[0].ranks, vec![0]);
            assert_eq!(tasks[1].name, "probe");
            assert_eq!(tasks[1].ranks, vec![2, 1]);
            assert_eq!(tasks[1].config_opts.workdir, PathBuf::from("/scratch/muster"));
            assert_eq!(tasks[1].config_opts.modules, vec!["hdfs"]);
            assert!(tasks[1].master_env.contains_key(MASTER_HOSTNAME_FACT));
        }
    }

    #[test]
    fn empty_selection_fails_the_assignment() {
        let config = ClusterConfig {
            workdir: PathBuf::from("/tmp"),
            modules: Vec::new(),
            poll_interval: 60,
            services: BTreeMap::from([(
                String::from("lonely"),
                ServiceConfig {
                    kind: String::from("echo"),
                    ranks: RankSelector::Named(NamedSelector::Workers),
                    config: PathBuf::from("/tmp/x.yaml"),
                },
            )]),
        };

        let ctx = ProcessContext::from_channel(Channel::solo(0));
        let assigner = ConfigAssigner::new(&config);

        assert!(matches!(
            assigner.assign(&ctx, &EnvironmentFacts::default()),
            Err(DispatchError::AssignFailed(ConfigErrors::EmptyRanks(_)))
        ));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut ctx = ProcessContext::from_channel(Channel::solo(0));
        ctx.adopt_group(Channel::solo(0).into_shared());

        ctx.shutdown();
        ctx.shutdown();

        assert!(ctx.root().lock().unwrap().is_closed());
    }
}
