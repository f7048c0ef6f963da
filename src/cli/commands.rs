//! `pool` command definitions and handlers

use crate::backend::{BackendFactory, BackendType, EchoExecutor};
use crate::core::{OrchestratorError, Task};
use crate::distribution::DistributionStrategy;
use crate::manager::{ManagerConfig, PoolManager};
use crate::pool::{PoolConfig, PoolHealth};
use crate::registry::{DirectorySource, PoolDescriptor};
use crate::routing::RoutingStrategy;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default directory holding pool descriptors
const DEFAULT_STATE_DIR: &str = ".pools";

/// Orchestrate worker pools and route tasks across them.
#[derive(Parser, Debug)]
#[command(name = "pool")]
#[command(about = "Orchestrate worker pools and route tasks across them")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Directory of pool descriptors, discovered on every invocation.
    #[arg(long, default_value = DEFAULT_STATE_DIR, global = true, env = "POOL_STATE_DIR")]
    pub state_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register a pool and persist its descriptor.
    Register(RegisterArgs),
    /// List pools with status and load.
    #[command(alias = "ls")]
    List(ListArgs),
    /// Run one task on a named pool.
    Execute(ExecuteArgs),
    /// Show which pool a task would be routed to.
    Route(RouteArgs),
    /// Fan a task out over pools.
    Distribute(DistributeArgs),
    /// Resize a pool.
    Scale(ScaleArgs),
    /// Poll every pool and report system health.
    Health(HealthArgs),
    /// Recommend (or apply) resizes that equalize load.
    Rebalance(RebalanceArgs),
    /// Drain a pool and forget its descriptor.
    #[command(alias = "rm")]
    Unregister(PoolArg),
}

/// Arguments for `pool register`.
#[derive(Args, Debug)]
pub struct RegisterArgs {
    /// Unique pool name.
    #[arg(long)]
    pub name: String,
    /// Backend kind (local, delegated, cluster).
    #[arg(long, default_value = "local")]
    pub backend: BackendType,
    /// Minimum workers.
    #[arg(long, default_value = "1")]
    pub min: usize,
    /// Maximum workers.
    #[arg(long, default_value = "1")]
    pub max: usize,
    /// Routing tag; repeatable.
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    /// Backend option as key=value; the value is parsed as JSON when it can be.
    #[arg(long = "option", value_parser = parse_option)]
    pub options: Vec<(String, Value)>,
}

/// Arguments for `pool list`.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only pools carrying this tag.
    #[arg(long)]
    pub tag: Option<String>,
    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// A pool selected by id or name.
#[derive(Args, Debug)]
pub struct PoolArg {
    /// Pool id or name.
    #[arg(long)]
    pub pool: String,
}

/// Arguments for `pool execute`.
#[derive(Args, Debug)]
pub struct ExecuteArgs {
    /// Pool id or name.
    #[arg(long)]
    pub pool: String,
    /// Task payload as JSON.
    #[arg(long)]
    pub payload: String,
}

/// Arguments for `pool route`.
#[derive(Args, Debug)]
pub struct RouteArgs {
    /// Task payload as JSON.
    #[arg(long)]
    pub payload: String,
    /// Routing strategy.
    #[arg(long, default_value = "least_loaded")]
    pub strategy: RoutingStrategy,
    /// Affinity key, overriding the payload's.
    #[arg(long)]
    pub affinity_key: Option<String>,
    /// Also run the task on the chosen pool.
    #[arg(long)]
    pub submit: bool,
}

/// Arguments for `pool distribute`.
#[derive(Args, Debug)]
pub struct DistributeArgs {
    /// Task payload as JSON.
    #[arg(long)]
    pub payload: String,
    /// Distribution strategy.
    #[arg(long)]
    pub strategy: DistributionStrategy,
    /// Split function (items, chunks:<n>).
    #[arg(long)]
    pub split_fn: Option<String>,
    /// Reduce function (collect, sum, concat).
    #[arg(long)]
    pub reduce_fn: Option<String>,
    /// Print the plan without running it.
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for `pool scale`.
#[derive(Args, Debug)]
pub struct ScaleArgs {
    /// Pool id or name.
    #[arg(long)]
    pub pool: String,
    /// Target worker count.
    #[arg(long)]
    pub target: usize,
}

/// Arguments for `pool health`.
#[derive(Args, Debug)]
pub struct HealthArgs {
    /// Include every pool's health.
    #[arg(long)]
    pub all: bool,
}

/// Arguments for `pool rebalance`.
#[derive(Args, Debug)]
pub struct RebalanceArgs {
    /// Strategy to equalize for.
    #[arg(long, default_value = "least_loaded")]
    pub strategy: RoutingStrategy,
    /// Imbalance threshold.
    #[arg(long)]
    pub threshold: Option<f64>,
    /// Execute the recommended resizes.
    #[arg(long)]
    pub apply: bool,
}

fn parse_option(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn parse_task(payload: &str) -> crate::core::Result<Task> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| OrchestratorError::invalid_task(format!("payload is not valid JSON: {}", e)))?;
    Task::from_payload(value)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Build the manager and load every pool described in `state_dir`.
async fn load(state_dir: &Path) -> anyhow::Result<(PoolManager, DirectorySource)> {
    let factory = BackendFactory::default().with_fallback_remote(Arc::new(EchoExecutor));
    let manager = PoolManager::with_factory(ManagerConfig::default(), factory)?;
    let source = DirectorySource::new(state_dir);
    let report = manager.discover(&source, true).await?;
    for failure in &report.failed {
        warn!(pool = %failure.name, code = %failure.code, "Skipping pool: {}", failure.message);
    }
    debug!(
        state_dir = %state_dir.display(),
        pools = report.registered.len(),
        "State loaded"
    );
    Ok((manager, source))
}

/// Run the command line with parsed arguments.
///
/// Orchestrator failures are returned as [`OrchestratorError`] inside the
/// `anyhow::Error` so the binary can map them to exit codes.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let (manager, source) = load(&cli.state_dir).await?;
    let result = dispatch(cli.command, &manager, &source).await;
    if let Err(e) = manager.shutdown().await {
        warn!(error = %e, "Pools did not drain cleanly");
    }
    result
}

async fn dispatch(command: Commands, manager: &PoolManager, source: &DirectorySource) -> anyhow::Result<()> {
    match command {
        Commands::Register(args) => run_register(args, manager, source).await,
        Commands::List(args) => run_list(args, manager),
        Commands::Execute(args) => {
            let pool = manager.resolve(&args.pool)?;
            let task = parse_task(&args.payload)?;
            let result = manager.execute(pool.id(), task).await?;
            print_json(&result)
        }
        Commands::Route(args) => {
            let mut task = parse_task(&args.payload)?;
            if let Some(key) = args.affinity_key {
                task = task.with_affinity_key(key);
            }
            let decision = manager.route(&task, Some(args.strategy))?;
            if args.submit {
                let result = manager.execute(decision.pool_id, task).await?;
                print_json(&json!({"decision": decision, "result": result}))
            } else {
                print_json(&decision)
            }
        }
        Commands::Distribute(args) => run_distribute(args, manager).await,
        Commands::Scale(args) => {
            let pool = manager.resolve(&args.pool)?;
            let report = manager.scale(pool.id(), args.target).await?;
            print_json(&json!({"pool": pool.name(), "scale": report, "health": pool.health()}))
        }
        Commands::Health(args) => {
            let poll = manager.check_health().await;
            let system = manager.health();
            if args.all {
                let pools: Vec<PoolHealth> = manager.list(None).iter().map(|pool| pool.health()).collect();
                print_json(&json!({"system": system, "poll": poll, "pools": pools}))
            } else {
                print_json(&json!({"system": system, "poll": poll}))
            }
        }
        Commands::Rebalance(args) => {
            let report = manager
                .rebalance(args.strategy, args.threshold, args.apply)
                .await?;
            print_json(&report)
        }
        Commands::Unregister(args) => {
            let pool = manager.resolve(&args.pool)?;
            manager.unregister(pool.id()).await?;
            source.remove_descriptor(pool.name()).await?;
            println!("{}", pool.id());
            Ok(())
        }
    }
}

async fn run_register(args: RegisterArgs, manager: &PoolManager, source: &DirectorySource) -> anyhow::Result<()> {
    let mut config = PoolConfig::new(&args.name, args.backend).with_workers(args.min, args.max);
    for tag in args.tags {
        config = config.with_tag(tag);
    }
    for (key, value) in args.options {
        config = config.with_option(key, value);
    }

    let id = manager.register(config.clone()).await?;
    let path = source
        .write_descriptor(&PoolDescriptor::new(config).with_id(id))
        .await
        .with_context(|| format!("pool '{}' registered but its descriptor was not saved", args.name))?;
    debug!(path = %path.display(), "Descriptor written");
    println!("{}", id);
    Ok(())
}

fn run_list(args: ListArgs, manager: &PoolManager) -> anyhow::Result<()> {
    let pools: Vec<PoolHealth> = manager
        .list(args.tag.as_deref())
        .iter()
        .map(|pool| pool.health())
        .collect();
    if args.json {
        return print_json(&pools);
    }

    println!(
        "{:<20} {:<36} {:<10} {:<9} {:>9} {:>7} {:>6}  TAGS",
        "NAME", "ID", "BACKEND", "STATUS", "WORKERS", "ACTIVE", "LOAD"
    );
    for pool in &pools {
        println!(
            "{:<20} {:<36} {:<10} {:<9} {:>9} {:>7} {:>6.2}  {}",
            pool.name,
            pool.pool_id.to_string(),
            pool.backend_type.as_str(),
            pool.status.as_str(),
            format!("{}/{}-{}", pool.total_workers, pool.min_workers, pool.max_workers),
            pool.active_tasks,
            pool.load_ratio,
            pool.tags.join(",")
        );
    }
    Ok(())
}

async fn run_distribute(args: DistributeArgs, manager: &PoolManager) -> anyhow::Result<()> {
    let task = parse_task(&args.payload)?;
    if args.dry_run {
        let plan = manager.plan(&task, args.strategy, args.split_fn.as_deref())?;
        return print_json(&plan);
    }

    match manager
        .distribute(
            &task,
            args.strategy,
            args.split_fn.as_deref(),
            args.reduce_fn.as_deref(),
        )
        .await
    {
        Ok(report) => print_json(&report),
        Err(e) => {
            if let Some(report) = e.partial_report() {
                print_json(report)?;
            }
            Err(e.into())
        }
    }
}
