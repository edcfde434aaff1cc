//! Bookkeeping for running clusters.
//!
//! The coordinator records every cluster it brings up under a label in
//! `$XDG_CONFIG_HOME/muster.d/<label>/`, with the batch job id and a
//! shell snippet that prepares an environment for reaching the
//! services. `list` and `clean` work off the same directory.

use crate::dispatch::EnvironmentFacts;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::{env, fs};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const INFO_DIR_NAME: &str = "muster.d";
pub const JOBID_FILE: &str = "jobid";
pub const ENV_FILE: &str = "env";

// batch scheduler job id variables, in lookup order
const JOB_ID_VARS: [&str; 2] = ["PBS_JOBID", "SLURM_JOB_ID"];

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Cluster info could not be accessed")]
    AccessFailed(#[from] std::io::Error),
    #[error("Cluster label is unknown")]
    UnknownLabel(String),
}

/// Directory the cluster info lives in for this user.
pub fn info_dir() -> PathBuf {
    match env::var_os("XDG_CONFIG_HOME") {
        Some(base) if !base.is_empty() => PathBuf::from(base).join(INFO_DIR_NAME),
        _ => {
            let home = env::var_os("HOME").unwrap_or_else(|| OsString::from("."));
            PathBuf::from(home).join(".config").join(INFO_DIR_NAME)
        }
    }
}

/// Job id of the surrounding batch allocation, if there is one.
pub fn batch_job_id() -> Option<String> {
    for key in JOB_ID_VARS {
        if let Ok(value) = env::var(key) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }

    None
}

/// Label for a new cluster: the explicit one wins, then the batch job
/// id, then a generated one.
pub fn resolve_label(explicit: Option<String>) -> String {
    explicit
        .or_else(batch_job_id)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
}

/// Shell snippet that prepares an environment for talking to the
/// cluster's services.
pub fn generate_env_script(facts: &EnvironmentFacts, workdir: &Path, modules: &[String]) -> String {
    let mut script = String::from("# environment for reaching this muster cluster\n");

    for module in modules {
        script.push_str(&format!("module load {module}\n"));
    }
    for fact in facts.iter() {
        script.push_str(&format!("export {}=\"{}\"\n", fact.name, fact.value));
    }
    script.push_str(&format!("export MUSTER_WORKDIR=\"{}\"\n", workdir.display()));

    script
}

/// Handle on one info directory.
pub struct ClusterInfo {
    base: PathBuf,
}

impl ClusterInfo {
    pub fn open_default() -> Self {
        Self { base: info_dir() }
    }

    pub fn at(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn label_dir(&self, label: &str) -> PathBuf {
        self.base.join(label)
    }

    /// Record a cluster under `label`. Returns the directory written.
    pub fn create(
        &self,
        label: &str,
        jobid: &str,
        env_script: &str,
    ) -> Result<PathBuf, ClusterError> {
        let dir = self.label_dir(label);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(JOBID_FILE), format!("{jobid}\n"))?;
        fs::write(dir.join(ENV_FILE), env_script)?;

        info!(label, dir = %dir.display(), "cluster info written");
        Ok(dir)
    }

    /// All recorded labels, sorted. A missing info directory simply
    /// means no clusters.
    pub fn labels(&self) -> Result<Vec<String>, ClusterError> {
        let entries = match fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut labels = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                labels.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        labels.sort();

        Ok(labels)
    }

    pub fn jobid(&self, label: &str) -> Result<String, ClusterError> {
        match fs::read_to_string(self.label_dir(label).join(JOBID_FILE)) {
            Ok(jobid) => Ok(jobid.trim().to_string()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(ClusterError::UnknownLabel(label.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    pub fn remove(&self, label: &str) -> Result<(), ClusterError> {
        match fs::remove_dir_all(self.label_dir(label)) {
            Ok(()) => {
                debug!(label, "cluster info removed");
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(ClusterError::UnknownLabel(label.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Remove every recorded cluster, returning the labels that went.
    pub fn remove_all(&self) -> Result<Vec<String>, ClusterError> {
        let labels = self.labels()?;
        for label in &labels {
            self.remove(label)?;
        }

        Ok(labels)
    }
}
