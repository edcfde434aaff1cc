use super::{WorkError, WorkScope};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    time::Duration,
};
use tracing::{debug, error, info, warn};
use wait_timeout::ChildExt;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    // Command that brings the service up, run from the item's directory
    pub start: CommandLine,
    // Optional command to ask the service to wind down before signalling
    pub stop: Option<CommandLine>,
    // Extra environment on top of the facts handed down by the coordinator
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    // Seconds a daemon gets between SIGTERM and SIGKILL
    #[serde(default = "default_grace")]
    pub grace: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CommandLine {
    pub exec: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_grace() -> u64 {
    10
}

/// Long-running service process owned by one rank.
#[derive(Debug)]
pub struct DaemonWork {
    scope: WorkScope,
    config: DaemonConfig,
    // directory the daemon runs in, distinct per rank so shared
    // filesystems do not clobber
    rundir: PathBuf,
    resolved: String,
    child: Option<Child>,
    exit: Option<ExitStatus>,
}

impl DaemonWork {
    pub fn load(scope: WorkScope, config: &str) -> Result<Self, WorkError> {
        let parsed: DaemonConfig = serde_yaml::from_str(config)?;
        let rundir = scope
            .workdir
            .join(&scope.task_name)
            .join(format!("rank-{}", scope.world_rank));

        Ok(Self {
            scope,
            config: parsed,
            rundir,
            resolved: config.to_string(),
            child: None,
            exit: None,
        })
    }

    pub fn scope(&self) -> &WorkScope {
        &self.scope
    }

    pub fn rundir(&self) -> &PathBuf {
        &self.rundir
    }

    pub fn exit(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Create the run directory and keep a copy of the resolved config
    /// next to the service for operators to inspect.
    pub fn prepare_work_cfg(&mut self) -> Result<(), WorkError> {
        fs::create_dir_all(&self.rundir).map_err(WorkError::PrepareFailed)?;
        fs::write(self.rundir.join("service.yaml"), &self.resolved)
            .map_err(WorkError::PrepareFailed)?;

        debug!(
            task = %self.scope.task_name,
            rundir = %self.rundir.display(),
            "daemon directory prepared"
        );
        Ok(())
    }

    pub fn do_work_start(&mut self) -> Result<(), WorkError> {
        let stdout = File::create(self.rundir.join("stdout.log")).map_err(WorkError::PrepareFailed)?;
        let stderr = File::create(self.rundir.join("stderr.log")).map_err(WorkError::PrepareFailed)?;

        match Command::new(&self.config.start.exec)
            .args(self.config.start.args.iter())
            .envs(self.scope.master_env.iter())
            .envs(self.config.env.iter())
            .env("MUSTER_SERVICE", &self.scope.task_name)
            .env("MUSTER_RANK", self.scope.world_rank.to_string())
            .env("MUSTER_GROUP_RANK", self.scope.group_rank.to_string())
            .current_dir(&self.rundir)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
        {
            Ok(child) => {
                info!(
                    task = %self.scope.task_name,
                    pid = child.id(),
                    exec = %self.config.start.exec.display(),
                    "daemon started"
                );
                self.child = Some(child);
                Ok(())
            }
            Err(e) => {
                error!(
                    task = %self.scope.task_name,
                    exec = %self.config.start.exec.display(),
                    "Failed to start daemon: {e}"
                );
                Err(WorkError::SpawnFailed(e))
            }
        }
    }

    pub fn do_work_wait(&mut self) -> Result<bool, WorkError> {
        match &mut self.child {
            Some(child) => match child.try_wait()? {
                Some(status) => {
                    info!(task = %self.scope.task_name, %status, "daemon exited");
                    self.exit = Some(status);
                    Ok(true)
                }
                None => Ok(false),
            },
            None => Ok(true),
        }
    }

    pub fn do_work_stop(&mut self) -> Result<(), WorkError> {
        if self.exit.is_some() {
            return Ok(());
        }
        let child = match self.child.as_mut() {
            Some(child) => child,
            None => return Ok(()),
        };
        let grace = Duration::from_secs(self.config.grace);

        if let Some(stop) = &self.config.stop {
            debug!(task = %self.scope.task_name, exec = %stop.exec.display(), "running stop command");
            match Command::new(&stop.exec)
                .args(stop.args.iter())
                .envs(self.scope.master_env.iter())
                .envs(self.config.env.iter())
                .current_dir(&self.rundir)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(mut stopper) => match stopper.wait_timeout(grace)? {
                    Some(status) if !status.success() => {
                        warn!(task = %self.scope.task_name, %status, "stop command failed");
                    }
                    Some(_) => {}
                    None => {
                        warn!(task = %self.scope.task_name, "stop command ran into its grace period");
                        stopper.kill()?;
                        stopper.wait()?;
                    }
                },
                Err(e) => warn!(task = %self.scope.task_name, "Failed to run stop command: {e}"),
            }
        }

        match child.try_wait()? {
            Some(status) => self.exit = Some(status),
            None => {
                let pid = Pid::from_raw(child.id() as i32);
                debug!(task = %self.scope.task_name, %pid, "sending SIGTERM");
                if let Err(errno) = signal::kill(pid, Signal::SIGTERM) {
                    // ESRCH just means the daemon won the race and is gone
                    debug!(task = %self.scope.task_name, %errno, "SIGTERM not delivered");
                }

                match child.wait_timeout(grace)? {
                    Some(status) => self.exit = Some(status),
                    None => {
                        warn!(task = %self.scope.task_name, "daemon survived SIGTERM, killing it");
                        child.kill()?;
                        self.exit = Some(child.wait()?);
                    }
                }
            }
        }

        Ok(())
    }

    pub fn work_end(&mut self) -> Result<(), WorkError> {
        if let Some(mut child) = self.child.take() {
            if self.exit.is_none() {
                self.exit = Some(child.wait()?);
            }
        }

        info!(
            task = %self.scope.task_name,
            status = ?self.exit,
            "daemon wound down"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(workdir: &std::path::Path) -> WorkScope {
        WorkScope {
            task_name: String::from("webd"),
            world_rank: 2,
            group_rank: 1,
            group_size: 2,
            workdir: workdir.to_path_buf(),
            master_env: BTreeMap::from([(
                String::from("masterhostname"),
                String::from("node-0"),
            )]),
        }
    }

    #[test]
    fn config_parses_with_defaults() {
        let config: DaemonConfig =
            serde_yaml::from_str("start:\n  exec: /usr/bin/served\n").unwrap();

        assert_eq!(config.start.exec, PathBuf::from("/usr/bin/served"));
        assert!(config.start.args.is_empty());
        assert!(config.stop.is_none());
        assert_eq!(config.grace, 10);
    }

    #[test]
    fn config_requires_a_start_command() {
        assert!(serde_yaml::from_str::<DaemonConfig>("env: {}\n").is_err());
    }

    #[test]
    fn short_lived_daemon_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let config = "start:\n  exec: /bin/sh\n  args: [\"-c\", \"echo $masterhostname\"]\n";
        let mut work = DaemonWork::load(scope(dir.path()), config).unwrap();

        work.prepare_work_cfg().unwrap();
        assert!(work.rundir().join("service.yaml").is_file());

        work.do_work_start().unwrap();
        while !work.do_work_wait().unwrap() {
            std::thread::sleep(Duration::from_millis(10));
        }
        work.do_work_stop().unwrap();
        work.work_end().unwrap();

        assert!(work.exit().unwrap().success());
        let stdout = fs::read_to_string(work.rundir().join("stdout.log")).unwrap();
        assert_eq!(stdout.trim(), "node-0");
    }

    #[test]
    fn lingering_daemon_is_terminated_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let config = "start:\n  exec: /bin/sleep\n  args: [\"600\"]\ngrace: 2\n";
        let mut work = DaemonWork::load(scope(dir.path()), config).unwrap();

        work.prepare_work_cfg().unwrap();
        work.do_work_start().unwrap();
        assert!(!work.do_work_wait().unwrap());

        work.do_work_stop().unwrap();
        work.work_end().unwrap();

        // killed by signal, not a clean exit
        assert!(!work.exit().unwrap().success());
    }

    #[test]
    fn missing_executable_fails_the_start_hook() {
        let dir = tempfile::tempdir().unwrap();
        let config = "start:\n  exec: /nonexistent/muster-daemon\n";
        let mut work = DaemonWork::load(scope(dir.path()), config).unwrap();

        work.prepare_work_cfg().unwrap();

        assert!(matches!(work.do_work_start(), Err(WorkError::SpawnFailed(_))));
    }
}
