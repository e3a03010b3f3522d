use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobwarden::config::{Config, LogSink, StoreBackend};
use jobwarden::metrics;
use jobwarden::prelude::*;
use jobwarden::scheduler::{HandlerRegistry, NameSelector, StateSelector};

#[derive(Parser)]
#[command(
    name = "jobwarden",
    version,
    about = "Distributed job scheduler with heartbeat-based leader election",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file; environment variables are used when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scheduler node until interrupted
    Serve,

    /// Enqueue a job
    Enqueue {
        /// Job name
        name: String,

        /// JSON array of arguments, or a single JSON value; a trailing
        /// object with date/in/on/priority/unique/singular is the job config
        args: Option<String>,
    },

    /// List jobs
    List {
        /// Only jobs with this name
        #[arg(short, long)]
        name: Option<String>,

        /// Only jobs in this state (pending, success, failure)
        #[arg(short, long)]
        state: Option<JobState>,

        /// Maximum number of jobs to print
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Remove jobs in bulk
    Clear {
        /// "*" or a comma separated list of states; finished jobs by default
        #[arg(short, long)]
        state: Option<String>,

        /// Only jobs with this name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Change the due date or priority of a pending job
    Reschedule {
        /// Job id
        id: String,

        /// JSON config object, e.g. '{"in": {"minutes": 5}}'
        config: String,
    },

    /// Remove one job
    Remove {
        /// Job id
        id: String,
    },

    /// Print the leadership record and queue size
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(format) = cli.log_format.clone() {
        config.logging.format = format;
    }
    if cli.verbose {
        config.logging.sink = LogSink::Verbose;
    }
    config.validate()?;

    // Initialize tracing/logging
    setup_tracing(&config)?;

    tracing::debug!(backend = ?config.store.backend, "jobwarden starting");

    match cli.command {
        Commands::Serve => serve(&config).await?,
        Commands::Enqueue { name, args } => enqueue(&config, &name, args.as_deref()).await?,
        Commands::List { name, state, limit } => list(&config, name, state, limit).await?,
        Commands::Clear { state, name } => clear(&config, state.as_deref(), name).await?,
        Commands::Reschedule { id, config: job_config } => {
            reschedule(&config, &id, &job_config).await?
        }
        Commands::Remove { id } => remove(&config, &id).await?,
        Commands::Status => status(&config).await?,
    }

    Ok(())
}

fn setup_tracing(config: &Config) -> Result<()> {
    let Some(directive) = config.logging.sink.directive() else {
        return Ok(());
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("{directive},warn")));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

fn demo_handlers() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("log", |ctx: JobContext, args: Vec<Value>| async move {
            tracing::info!(job_id = %ctx.id(), args = ?args, "log job executed");
            ctx.success().await?;
            anyhow::Ok(())
        })
        .register("noop", |ctx: JobContext, _args: Vec<Value>| async move {
            ctx.success().await?;
            anyhow::Ok(())
        });
    registry
}

fn build_jobs(config: &Config) -> Result<Jobs> {
    let builder = match config.store.backend {
        StoreBackend::Memory => Jobs::builder(MemoryStore::new()),
        StoreBackend::Sqlite => {
            let path = &config.store.sqlite_path;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create data directory: {}", parent.display())
                })?;
            }
            let store = SqliteStore::open(path, config.poll_interval())
                .with_context(|| format!("Failed to open job store: {}", path.display()))?;
            Jobs::builder(store)
        }
    };

    Ok(builder
        .settings(config.to_settings()?)
        .registry(demo_handlers())
        .build())
}

async fn serve(config: &Config) -> Result<()> {
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Failed to register metrics");
    }

    let jobs = build_jobs(config)?;
    let server_id = jobs.start().await?;
    tracing::info!(
        server_id = %server_id,
        handlers = ?jobs.handler_names(),
        "Scheduler node running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    jobs.shutdown().await;

    if let Ok(text) = metrics::encode_metrics() {
        tracing::debug!(metrics = %text, "Final metrics");
    }
    Ok(())
}

fn parse_args(raw: Option<&str>) -> Result<Vec<Value>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("Invalid JSON arguments: {raw}"))?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

async fn enqueue(config: &Config, name: &str, args: Option<&str>) -> Result<()> {
    let jobs = build_jobs(config)?;
    match jobs.run(name, parse_args(args)?).await? {
        EnqueueOutcome::Scheduled(job) => println!("Scheduled {}", job.display()),
        EnqueueOutcome::Rejected(reason) => println!("Not scheduled: {reason}"),
    }
    Ok(())
}

async fn list(
    config: &Config,
    name: Option<String>,
    state: Option<JobState>,
    limit: usize,
) -> Result<()> {
    let jobs = build_jobs(config)?;

    let mut query = JobQuery::all();
    if let Some(name) = name {
        query = query.with_names([name]);
    }
    if let Some(state) = state {
        query = query.with_state(state);
    }

    let found = jobs
        .find(&query, &FindOptions::sorted(JobSort::Due).limit(limit))
        .await?;
    if found.is_empty() {
        println!("No jobs");
    }
    for job in found {
        println!("{}", job.display());
    }
    Ok(())
}

async fn clear(config: &Config, state: Option<&str>, name: Option<String>) -> Result<()> {
    let jobs = build_jobs(config)?;

    let states = match state {
        Some(state) => StateSelector::parse(state)?,
        None => StateSelector::Finished,
    };
    let names = name.map(NameSelector::one).unwrap_or_default();

    let removed = jobs.clear(&ClearFilter::new(states, names)).await?;
    println!("Removed {removed} job(s)");
    Ok(())
}

async fn reschedule(config: &Config, id: &str, raw: &str) -> Result<()> {
    let jobs = build_jobs(config)?;
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("Invalid JSON config: {raw}"))?;
    let job_config = JobConfig::from_value(&value)?;

    match jobs.reschedule(&JobId::from(id), &job_config).await? {
        0 => println!("Job {id} was not rescheduled (missing or not pending)"),
        _ => println!("Rescheduled {id}"),
    }
    Ok(())
}

async fn remove(config: &Config, id: &str) -> Result<()> {
    let jobs = build_jobs(config)?;
    if jobs.remove(&JobId::from(id)).await? {
        println!("Removed {id}");
    } else {
        println!("Job {id} not found");
    }
    Ok(())
}

async fn status(config: &Config) -> Result<()> {
    let jobs = build_jobs(config)?;

    match jobs.leader_record().await? {
        Some(record) => println!(
            "Leader: {} (last heartbeat {})",
            record.server_id,
            record.date.to_rfc3339()
        ),
        None => println!("Leader: none"),
    }

    let pending = jobs.find(&JobQuery::pending(), &FindOptions::default()).await?;
    println!("Pending jobs: {}", pending.len());
    if let Some(next) = pending.iter().min_by_key(|job| job.due) {
        println!("Next due: {}", next.display());
    }
    Ok(())
}
