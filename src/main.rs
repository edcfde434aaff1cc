use clap::{Args, Parser, Subcommand};
use muster::cluster::{self, ClusterError, ClusterInfo};
use muster::comm::{self, CommError};
use muster::config::{ClusterConfig, ConfigErrors};
use muster::dispatch::{setup_tasks, ConfigAssigner, DispatchError, ProcessContext};
use muster::scheduler::{run_tasks, SchedulerError};
use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

#[derive(Parser)]
#[command(
    name = "muster",
    about = "Coordinate service clusters inside batch-scheduler allocations",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the world as one rank and run this rank's share of the work
    Run(RunArgs),
    /// Launch a local world of `run` processes and wait for them
    Spawn(SpawnArgs),
    /// List recorded clusters
    List,
    /// Forget recorded clusters
    Clean(CleanArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Cluster description file
    #[arg(short, long)]
    config: PathBuf,
    /// Label to record the cluster under (default: the batch job id)
    #[arg(short, long)]
    label: Option<String>,
    /// Seconds between polling passes, overriding the config
    #[arg(long)]
    poll_interval: Option<u64>,
    /// Skip writing cluster info on the coordinator
    #[arg(long)]
    no_cluster_info: bool,
}

#[derive(Args)]
struct SpawnArgs {
    /// Cluster description file
    #[arg(short, long)]
    config: PathBuf,
    /// World size to launch
    #[arg(short, long, default_value_t = 4)]
    nprocs: u32,
    /// Rendezvous port the coordinator listens on
    #[arg(short, long, default_value_t = comm::DEFAULT_MASTER_PORT)]
    port: u16,
    /// Seconds between polling passes, overriding the config
    #[arg(long)]
    poll_interval: Option<u64>,
}

#[derive(Args)]
struct CleanArgs {
    /// Label to forget
    #[arg(conflicts_with = "all")]
    label: Option<String>,
    /// Forget every recorded cluster
    #[arg(long)]
    all: bool,
}

#[derive(Error, Debug)]
enum RunError {
    #[error("Cluster config is unusable")]
    ConfigFailed(#[from] ConfigErrors),
    #[error("Collective exchange failed")]
    CommFailed(#[from] CommError),
    #[error("Task distribution failed")]
    DispatchFailed(#[from] DispatchError),
    #[error("Work scheduling failed")]
    SchedulerFailed(#[from] SchedulerError),
    #[error("Cluster info failed")]
    ClusterFailed(#[from] ClusterError),
    #[error("Rank could not be launched")]
    LaunchFailed(#[from] std::io::Error),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Spawn(args) => cmd_spawn(args),
        Commands::List => cmd_list(),
        Commands::Clean(args) => cmd_clean(args),
    };

    process::exit(code);
}

fn load_config(path: &Path) -> Result<ClusterConfig, RunError> {
    let mut config = ClusterConfig::load(path)?;
    if config.preflight_checks() {
        return Err(ConfigErrors::PreflightFailed.into());
    }

    Ok(config)
}

fn cmd_run(args: RunArgs) -> i32 {
    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(error) => {
            error!(error = ?error, "Config is unusable: {error}");
            return 1;
        }
    };

    let mut ctx = match ProcessContext::bootstrap() {
        Ok(ctx) => ctx,
        Err(error) => {
            error!(error = ?error, "World rendezvous failed: {error}");
            return 1;
        }
    };

    let rank = ctx.rank;
    let result = drive(&mut ctx, &config, &args);
    // Groups come down whether the run succeeded or not.
    ctx.shutdown();

    match result {
        Ok(()) => {
            info!(rank, "rank done");
            0
        }
        Err(error) => {
            error!(rank, error = ?error, "Run failed: {error}");
            1
        }
    }
}

fn drive(ctx: &mut ProcessContext, config: &ClusterConfig, args: &RunArgs) -> Result<(), RunError> {
    let members = ctx.root().lock().unwrap_or_log().members()?;
    info!(rank = ctx.rank, ?members, "world assembled");

    let assigner = ConfigAssigner::new(config);
    setup_tasks(ctx, &assigner)?;

    // Facts are known once the tasks are, so the info snippet is
    // written only now.
    if ctx.is_coordinator() && !args.no_cluster_info {
        record_cluster(ctx, config, args.label.clone())?;
    }

    let interval = Duration::from_secs(args.poll_interval.unwrap_or(config.poll_interval));
    let ended = run_tasks(ctx, interval)?;
    info!(rank = ctx.rank, ended = ended.len(), "all work ended");

    Ok(())
}

fn record_cluster(
    ctx: &ProcessContext,
    config: &ClusterConfig,
    label: Option<String>,
) -> Result<(), RunError> {
    let label = cluster::resolve_label(label);
    let jobid = cluster::batch_job_id().unwrap_or_else(|| String::from("interactive"));
    let script = cluster::generate_env_script(&ctx.facts, &config.workdir, &config.modules);
    ClusterInfo::open_default().create(&label, &jobid, &script)?;

    Ok(())
}

fn cmd_spawn(args: SpawnArgs) -> i32 {
    match spawn_world(&args) {
        Ok(0) => 0,
        Ok(failed) => {
            error!(failed, "Some ranks failed");
            1
        }
        Err(error) => {
            error!(error = ?error, "World could not be launched: {error}");
            1
        }
    }
}

fn spawn_world(args: &SpawnArgs) -> Result<u32, RunError> {
    let exe = std::env::current_exe()?;
    let mut children = Vec::new();

    for rank in 0..args.nprocs {
        let mut command = Command::new(&exe);
        command
            .arg("run")
            .arg("--config")
            .arg(&args.config)
            .env(comm::ENV_RANK, rank.to_string())
            .env(comm::ENV_WORLD_SIZE, args.nprocs.to_string())
            .env(comm::ENV_MASTER_ADDR, comm::DEFAULT_MASTER_ADDR)
            .env(comm::ENV_MASTER_PORT, args.port.to_string());
        if let Some(interval) = args.poll_interval {
            command.arg("--poll-interval").arg(interval.to_string());
        }

        let child = command.spawn()?;
        info!(rank, pid = child.id(), "rank launched");
        children.push((rank, child));
    }

    let mut failed = 0;
    for (rank, mut child) in children {
        let status = child.wait()?;
        if status.success() {
            info!(rank, "rank finished");
        } else {
            error!(rank, status = ?status, "Rank failed");
            failed += 1;
        }
    }

    Ok(failed)
}

fn cmd_list() -> i32 {
    match list_clusters(&ClusterInfo::open_default()) {
        Ok(()) => 0,
        Err(error) => {
            error!(error = ?error, "Cluster info could not be listed: {error}");
            1
        }
    }
}

fn list_clusters(info: &ClusterInfo) -> Result<(), RunError> {
    let labels = info.labels()?;
    if labels.is_empty() {
        println!("no recorded clusters");
        return Ok(());
    }

    for label in labels {
        let jobid = info.jobid(&label)?;
        println!("{label}\t{jobid}");
    }

    Ok(())
}

fn cmd_clean(args: CleanArgs) -> i32 {
    let info = ClusterInfo::open_default();
    let result = match (args.label, args.all) {
        (Some(label), _) => info.remove(&label).map(|()| println!("removed {label}")),
        (None, true) => info.remove_all().map(|labels| {
            for label in labels {
                println!("removed {label}");
            }
        }),
        (None, false) => {
            error!("Pass a label or --all");
            return 2;
        }
    };

    match result {
        Ok(()) => 0,
        Err(error) => {
            error!(error = ?error, "Cluster info could not be cleaned: {error}");
            1
        }
    }
}
