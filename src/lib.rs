//! Coordinate service clusters inside batch-scheduler allocations.
//!
//! A launcher starts one process per rank with `RANK`, `WORLD_SIZE`
//! and the master address in the environment. The processes meet over
//! TCP, replicate a task list from the coordinator, carve a process
//! group per task and drive the services through a cooperative
//! polling loop until everything has ended.
//!
//! - [`comm`]: rank rendezvous and group collectives
//! - [`dispatch`]: fact gathering and two-phase task distribution
//! - [`scheduler`]: work lifecycle and the polling loop
//! - [`work`]: the service kinds that can be placed on ranks
//! - [`config`]: the cluster description file
//! - [`template`]: `${name}` substitution for service configs
//! - [`node`]: hostname and interface discovery
//! - [`cluster`]: per-user records of running clusters

pub mod cluster;
pub mod comm;
pub mod config;
pub mod dispatch;
pub mod node;
pub mod scheduler;
pub mod template;
pub mod work;

pub use comm::{Channel, CommError, Rank, SharedChannel, COORDINATOR_RANK};
pub use config::ClusterConfig;
pub use dispatch::{
    setup_tasks, AssignTasks, ConfigAssigner, ConfigParams, EnvironmentFacts, ProcessContext, Task,
};
pub use scheduler::{run_tasks, WorkItem};
