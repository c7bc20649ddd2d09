use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{info, warn};

use catalogue_ingest::config::{ConfigProvider, EnvConfig, StaticConfig};
use catalogue_ingest::database_ops::db::Db;
use catalogue_ingest::database_ops::memory::MemoryStore;
use catalogue_ingest::database_ops::postgres::PgStore;
use catalogue_ingest::database_ops::provider_client::HttpProviderFactory;
use catalogue_ingest::jobs::{
    build_job, top_games, JobQueue, Services, WorkerPool, JOB_NAMES,
};
use catalogue_ingest::tracing::{init_tracing, LogFormat};
use catalogue_ingest::util::env as env_util;

#[derive(Parser, Debug)]
#[command(name = "ingest_worker", about = "Game catalogue ingestion worker")]
struct Cli {
    /// Use the in-memory store even when a database URL is set.
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker pool until Ctrl-C.
    Work {
        #[arg(long)]
        concurrency: Option<usize>,
        /// Comma-separated queue names; defaults to WORKER_QUEUES.
        #[arg(long)]
        queues: Option<String>,
        /// Queue a top-games import before starting.
        #[arg(long)]
        seed: bool,
    },
    /// Queue one job and drain the queue, follow-ups included.
    Dispatch {
        job: String,
        /// Job parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        context: String,
        /// Override the idempotency key.
        #[arg(long)]
        key: Option<String>,
    },
    /// Run the trending aggregation and print it without persisting.
    Aggregate {
        #[arg(long, default_value_t = top_games::DEFAULT_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = top_games::DEFAULT_WINDOW_DAYS)]
        window: u32,
    },
    /// List recent sync and aggregation runs.
    Snapshots {
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the job names `dispatch` accepts.
    Jobs,
}

async fn services(force_memory: bool, config: Arc<dyn ConfigProvider>) -> Result<Services> {
    let providers = Arc::new(HttpProviderFactory);
    match env_util::db_url().filter(|_| !force_memory) {
        Some(url) => {
            let db = Db::connect_from_url(&url).await?;
            Ok(Services::postgres(PgStore::new(db, "tgdb"), config, providers))
        }
        None => {
            warn!("running against the in-memory store; nothing will be persisted");
            Ok(Services::in_memory(MemoryStore::default(), config, providers))
        }
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("encoding output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::bootstrap_cli("ingest_worker");
    let cli = Cli::parse();
    let format = match cli.command {
        Command::Work { .. } => LogFormat::Compact,
        _ => LogFormat::Full,
    };
    init_tracing("info,catalogue_ingest=info,sqlx=warn", format)?;

    match cli.command {
        Command::Work {
            concurrency,
            queues,
            seed,
        } => {
            let services = services(cli.memory, Arc::new(EnvConfig)).await?;
            let queue = JobQueue::new();
            let mut pool = WorkerPool::new(services, queue.clone());
            if let Some(n) = concurrency {
                pool = pool.with_concurrency(n);
            }
            if let Some(raw) = queues {
                pool = pool.with_queues(env_util::split_list(&raw));
            }
            if seed {
                let job = build_job("fetch_top_games", &json!({}))?;
                queue.dispatch(job);
            }
            pool.run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "ctrl-c handler failed; stopping");
                }
                info!("shutdown requested");
            })
            .await;
        }
        Command::Dispatch { job, context, key } => {
            let params: Value = serde_json::from_str(&context).context("--context must be JSON")?;
            let services = services(cli.memory, Arc::new(EnvConfig)).await?;
            let queue = JobQueue::new();
            let job = build_job(&job, &params)?;
            if !queue.dispatch_with_key(job, key) {
                info!("an identical job is already queued");
            }
            let report = WorkerPool::new(services, queue.clone()).drain().await;
            print_json(&json!({ "report": report, "failures": queue.failures() }))?;
        }
        Command::Aggregate { limit, window } => {
            let config = EnvConfig.load();
            let services = services(cli.memory, Arc::new(StaticConfig(config.clone()))).await?;
            let ctx = services.context(&JobQueue::new());
            let result = ctx.aggregator().aggregate(&config.catalogue, limit, window).await;
            print_json(&serde_json::to_value(&result).context("encoding aggregate")?)?;
        }
        Command::Snapshots { kind, limit } => {
            let services = services(cli.memory, Arc::new(EnvConfig)).await?;
            let rows = services.snapshots.list(kind.as_deref(), limit).await?;
            print_json(&serde_json::to_value(&rows).context("encoding snapshots")?)?;
        }
        Command::Jobs => {
            for name in JOB_NAMES {
                println!("{name}");
            }
        }
    }
    Ok(())
}
