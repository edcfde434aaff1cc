pub mod daemon;
pub mod echo;

use crate::comm::Rank;
use std::{collections::BTreeMap, path::PathBuf};
use thiserror::Error;

pub const DAEMON_KIND: &str = "daemon";
pub const ECHO_KIND: &str = "echo";

pub fn is_known_kind(kind: &str) -> bool {
    matches!(kind, DAEMON_KIND | ECHO_KIND)
}

#[derive(Error, Debug)]
pub enum WorkError {
    #[error("Work kind is not supported")]
    UnsupportedKind(String),
    #[error("Work config could not be parsed")]
    BadConfig(#[from] serde_yaml::Error),
    #[error("Failed to prepare the work directory")]
    PrepareFailed(std::io::Error),
    #[error("Failed to spawn the service process")]
    SpawnFailed(std::io::Error),
    #[error("Failed to poll a child process")]
    PollFailed(#[from] std::io::Error),
}

/// Coordinates a work item runs under. Mostly feeds logs and decides
/// where the item may place its files.
#[derive(Debug, Clone)]
pub struct WorkScope {
    pub task_name: String,
    pub world_rank: Rank,
    pub group_rank: Rank,
    pub group_size: u32,
    pub workdir: PathBuf,
    pub master_env: BTreeMap<String, String>,
}

#[derive(Debug)]
pub enum Works {
    Daemon(daemon::DaemonWork),
    Echo(echo::EchoWork),
}

impl Works {
    pub fn load(kind: &str, scope: WorkScope, config: &str) -> Result<Self, WorkError> {
        match kind {
            DAEMON_KIND => Ok(Self::Daemon(daemon::DaemonWork::load(scope, config)?)),
            ECHO_KIND => Ok(Self::Echo(echo::EchoWork::load(scope, config)?)),
            _ => Err(WorkError::UnsupportedKind(kind.to_string())),
        }
    }

    pub fn scope(&self) -> &WorkScope {
        match self {
            Self::Daemon(work) => work.scope(),
            Self::Echo(work) => work.scope(),
        }
    }

    /// Lay the groundwork the item needs before it may start, like
    /// directories and materialized config files.
    pub fn prepare_work_cfg(&mut self) -> Result<(), WorkError> {
        match self {
            Self::Daemon(work) => work.prepare_work_cfg(),
            Self::Echo(work) => work.prepare_work_cfg(),
        }
    }

    pub fn do_work_start(&mut self) -> Result<(), WorkError> {
        match self {
            Self::Daemon(work) => work.do_work_start(),
            Self::Echo(work) => work.do_work_start(),
        }
    }

    /// One non-blocking completion probe. `true` means the item is done
    /// and wants to be stopped.
    pub fn do_work_wait(&mut self) -> Result<bool, WorkError> {
        match self {
            Self::Daemon(work) => work.do_work_wait(),
            Self::Echo(work) => work.do_work_wait(),
        }
    }

    pub fn do_work_stop(&mut self) -> Result<(), WorkError> {
        match self {
            Self::Daemon(work) => work.do_work_stop(),
            Self::Echo(work) => work.do_work_stop(),
        }
    }

    pub fn work_end(&mut self) -> Result<(), WorkError> {
        match self {
            Self::Daemon(work) => work.work_end(),
            Self::Echo(work) => work.work_end(),
        }
    }
}
