//! Cooperative scheduling of materialized work.
//!
//! One thread, no preemption: every pass polls each active item once in
//! task order, finished items are wound down in the pass that reported
//! them done, and the scheduler sleeps between passes. A long poll on
//! one item delays the others, so work kinds keep their wait hook
//! prompt.

use crate::comm::{CommError, Rank, SharedChannel};
use crate::dispatch::{ConfigParams, ProcessContext, Task};
use crate::template::{self, TemplateError, TemplateRegistry};
use crate::work::{WorkError, WorkScope, Works};
use std::sync::Arc;
use std::time::Duration;
use std::{fs, thread};
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_unwrap::ResultExt;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Collective exchange failed")]
    CommFailed(#[from] CommError),
    #[error("Work item failed")]
    WorkFailed(#[from] WorkError),
    #[error("Work config could not be resolved")]
    ResolveFailed(#[from] TemplateError),
    #[error("Work config source could not be read")]
    SourceMissing(std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Configured,
    Running,
    Waiting,
    Stopping,
    Ended,
}

/// One task this rank participates in: the work kind plus the task
/// group it may coordinate over.
pub struct WorkItem {
    task_name: String,
    group: SharedChannel,
    state: LifecycleState,
    work: Works,
}

impl WorkItem {
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn group(&self) -> SharedChannel {
        Arc::clone(&self.group)
    }

    pub fn work(&self) -> &Works {
        &self.work
    }

    fn configure(&mut self) -> Result<(), SchedulerError> {
        self.work.prepare_work_cfg()?;
        self.state = LifecycleState::Configured;
        Ok(())
    }

    fn start(&mut self) -> Result<(), SchedulerError> {
        self.work.do_work_start()?;
        self.state = LifecycleState::Running;
        Ok(())
    }

    fn poll(&mut self) -> Result<bool, SchedulerError> {
        let done = self.work.do_work_wait()?;
        if !done {
            self.state = LifecycleState::Waiting;
        }
        Ok(done)
    }

    fn finish(&mut self) -> Result<(), SchedulerError> {
        self.state = LifecycleState::Stopping;
        self.work.do_work_stop()?;
        self.work.work_end()?;
        self.state = LifecycleState::Ended;
        Ok(())
    }
}

/// Rebuild the service configuration text for this rank: the task's
/// source with standard and coordinator-fact templates substituted.
pub fn resolve_work_cfg(params: &ConfigParams) -> Result<String, SchedulerError> {
    let text = match fs::read_to_string(&params.path) {
        Ok(text) => text,
        Err(error) => {
            error!(
                path = %params.path.display(),
                "Failed to read work config source: {error}"
            );
            return Err(SchedulerError::SourceMissing(error));
        }
    };

    let mut registry = TemplateRegistry::new();
    for template in template::standard_templates(&params.workdir, &params.modules) {
        registry.register(template);
    }
    for template in params.facts.to_templates() {
        registry.register(template);
    }

    Ok(registry.to_resolver().resolve(&text)?)
}

fn build_item(
    task: &Task,
    group: SharedChannel,
    group_rank: Rank,
    group_size: u32,
    world_rank: Rank,
) -> Result<WorkItem, SchedulerError> {
    let resolved = resolve_work_cfg(&task.config_opts)?;

    let scope = WorkScope {
        task_name: task.name.clone(),
        world_rank,
        group_rank,
        group_size,
        workdir: task.config_opts.workdir.clone(),
        master_env: task.master_env.clone(),
    };
    let work = Works::load(&task.kind, scope, &resolved)?;

    let mut item = WorkItem {
        task_name: task.name.clone(),
        group,
        state: LifecycleState::Created,
        work,
    };
    item.configure()?;

    Ok(item)
}

/// Walk the replicated task list in order and build a work item for
/// every task this rank is named in. Each task's `restrict` is
/// collective, so all ranks call this in lockstep even when they end
/// up with nothing to run.
pub fn materialize(ctx: &mut ProcessContext) -> Result<Vec<WorkItem>, SchedulerError> {
    let tasks = ctx.tasks.clone();
    let mut items = Vec::new();

    for task in &tasks {
        let restricted = {
            let root = ctx.root();
            let mut channel = root.lock().unwrap_or_log();
            channel.restrict(&task.ranks)?
        };

        let group = match restricted {
            Some(group) => group,
            None => {
                debug!(rank = ctx.rank, task = %task.name, "rank not part of this task");
                continue;
            }
        };

        let group_rank = group.rank();
        let group_size = group.size();
        let shared = group.into_shared();
        // adopted before the fallible steps below; shutdown only tears
        // down groups the context knows about
        ctx.adopt_group(Arc::clone(&shared));

        match build_item(task, shared, group_rank, group_size, ctx.rank) {
            Ok(item) => items.push(item),
            Err(error) => {
                error!(
                    rank = ctx.rank,
                    task = %task.name,
                    phase = "materialize",
                    error = ?error,
                    "Failed to materialize work: {error}"
                );
                return Err(error);
            }
        }
    }

    debug!(rank = ctx.rank, items = items.len(), "work materialized");
    Ok(items)
}

/// Poll every active item once, in order. Items reporting completion
/// are stopped and ended within the same pass and moved to `ended`.
fn poll_pass(active: &mut Vec<WorkItem>, ended: &mut Vec<WorkItem>) -> Result<(), SchedulerError> {
    let mut index = 0;
    while index < active.len() {
        let done = match active[index].poll() {
            Ok(done) => done,
            Err(error) => {
                error!(
                    task = %active[index].task_name,
                    phase = "wait",
                    error = ?error,
                    "Work item failed: {error}"
                );
                return Err(error);
            }
        };

        if done {
            let mut item = active.remove(index);
            if let Err(error) = item.finish() {
                error!(
                    task = %item.task_name,
                    phase = "stop",
                    error = ?error,
                    "Work item failed to wind down: {error}"
                );
                return Err(error);
            }
            ended.push(item);
        } else {
            index += 1;
        }
    }

    Ok(())
}

/// Drive all items to completion: start everything, then poll in
/// passes with a sleep in between until nothing is left.
pub fn run_work(
    items: Vec<WorkItem>,
    interval: Duration,
) -> Result<Vec<WorkItem>, SchedulerError> {
    let mut active = items;
    let mut ended = Vec::with_capacity(active.len());

    for item in active.iter_mut() {
        if let Err(error) = item.start() {
            error!(
                task = %item.task_name,
                phase = "start",
                error = ?error,
                "Failed to start work: {error}"
            );
            return Err(error);
        }
    }
    info!(active = active.len(), "all work started");

    while !active.is_empty() {
        poll_pass(&mut active, &mut ended)?;
        if !active.is_empty() {
            debug!(active = active.len(), interval = ?interval, "work remains, sleeping");
            thread::sleep(interval);
        }
    }

    info!(ended = ended.len(), "no active work left");
    Ok(ended)
}

/// Materialize this rank's share of the task list and run it.
pub fn run_tasks(
    ctx: &mut ProcessContext,
    interval: Duration,
) -> Result<Vec<WorkItem>, SchedulerError> {
    let items = materialize(ctx)?;
    run_work(items, interval)
}
