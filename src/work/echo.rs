use super::{WorkError, WorkScope};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};
use tracing::{debug, info};

/// Smoke-test work kind. Does nothing but count its polls, which makes
/// group placement and scheduler behavior observable from the outside.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EchoConfig {
    // Number of polls before the item reports completion
    #[serde(default = "default_polls")]
    pub polls: u32,
    #[serde(default)]
    pub message: Option<String>,
    // File touched on work_end, suffixed with the group rank
    #[serde(default)]
    pub marker: Option<PathBuf>,
}

fn default_polls() -> u32 {
    1
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self { polls: default_polls(), message: None, marker: None }
    }
}

#[derive(Debug)]
pub struct EchoWork {
    scope: WorkScope,
    config: EchoConfig,
    polled: u32,
}

impl EchoWork {
    pub fn load(scope: WorkScope, config: &str) -> Result<Self, WorkError> {
        let parsed = if config.trim().is_empty() {
            EchoConfig::default()
        } else {
            serde_yaml::from_str(config)?
        };

        Ok(Self { scope, config: parsed, polled: 0 })
    }

    pub fn scope(&self) -> &WorkScope {
        &self.scope
    }

    pub fn polled(&self) -> u32 {
        self.polled
    }

    pub fn prepare_work_cfg(&mut self) -> Result<(), WorkError> {
        debug!(task = %self.scope.task_name, polls = self.config.polls, "echo prepared");
        Ok(())
    }

    pub fn do_work_start(&mut self) -> Result<(), WorkError> {
        let message = self.config.message.as_deref().unwrap_or("echo running");
        info!(
            task = %self.scope.task_name,
            rank = self.scope.world_rank,
            group_rank = self.scope.group_rank,
            "{message}"
        );
        Ok(())
    }

    pub fn do_work_wait(&mut self) -> Result<bool, WorkError> {
        self.polled += 1;
        let done = self.polled >= self.config.polls;
        debug!(
            task = %self.scope.task_name,
            polled = self.polled,
            polls = self.config.polls,
            done,
            "echo polled"
        );

        Ok(done)
    }

    pub fn do_work_stop(&mut self) -> Result<(), WorkError> {
        debug!(task = %self.scope.task_name, "echo stopping");
        Ok(())
    }

    pub fn work_end(&mut self) -> Result<(), WorkError> {
        if let Some(marker) = &self.config.marker {
            let path = marker.with_file_name(format!(
                "{}.{}",
                marker.file_name().unwrap_or_default().to_string_lossy(),
                self.scope.group_rank
            ));
            fs::write(&path, format!("{}\n", self.polled)).map_err(WorkError::PrepareFailed)?;
            debug!(task = %self.scope.task_name, marker = %path.display(), "echo marker written");
        }

        info!(task = %self.scope.task_name, polled = self.polled, "echo finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn scope() -> WorkScope {
        WorkScope {
            task_name: String::from("probe"),
            world_rank: 2,
            group_rank: 1,
            group_size: 2,
            workdir: std::env::temp_dir(),
            master_env: BTreeMap::new(),
        }
    }

    #[test]
    fn empty_config_means_one_poll() {
        let mut work = EchoWork::load(scope(), "").unwrap();

        work.prepare_work_cfg().unwrap();
        work.do_work_start().unwrap();
        assert!(work.do_work_wait().unwrap());
        assert_eq!(work.polled(), 1);
    }

    #[test]
    fn completion_comes_on_the_configured_poll() {
        let mut work = EchoWork::load(scope(), "polls: 3\n").unwrap();

        assert!(!work.do_work_wait().unwrap());
        assert!(!work.do_work_wait().unwrap());
        assert!(work.do_work_wait().unwrap());
        assert_eq!(work.polled(), 3);
    }

    #[test]
    fn marker_lands_next_to_the_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("done");
        let config = format!("polls: 2\nmarker: {}\n", marker.display());
        let mut work = EchoWork::load(scope(), &config).unwrap();

        while !work.do_work_wait().unwrap() {}
        work.do_work_stop().unwrap();
        work.work_end().unwrap();

        let written = fs::read_to_string(dir.path().join("done.1")).unwrap();
        assert_eq!(written.trim(), "2");
    }

    #[test]
    fn unknown_config_fields_are_rejected() {
        assert!(matches!(
            EchoWork::load(scope(), "pols: 2\n"),
            Err(WorkError::BadConfig(_))
        ));
    }
}
