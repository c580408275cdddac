//! CLI command definitions for redjob.
//!
//! Operator commands for inspecting and maintaining queues in the shared
//! store, plus a standalone health endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{StoreConfig, DEFAULT_HOST, DEFAULT_POOL_SIZE, DEFAULT_PORT};
use crate::health::{self, HealthCheck};
use crate::metrics::{export_metrics, MetricsCollector};
use crate::scheduler::{Dispatcher, JobEnvelope};
use crate::store::StoreHandle;

/// Default number of dead-letter records shown.
const DEFAULT_DEAD_LETTER_LIMIT: usize = 20;

/// Default age after which a lease counts as abandoned.
const DEFAULT_RECOVER_AFTER_SECS: u64 = 300;

/// Redis-backed job queue operator tool.
#[derive(Parser, Debug)]
#[command(name = "redjob")]
#[command(about = "Inspect and operate redjob queues")]
#[command(version)]
#[command(
    long_about = "redjob inspects and maintains job queues stored in Redis.\n\nConnection settings come from flags or the REDIS_* / APP_NAME environment variables.\n\nExample usage:\n  redjob stats emails\n  redjob dispatch emails '{\"to\":\"a@example.com\"}' --priority 5 --unique"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Store connection settings.
    #[command(flatten)]
    pub store: StoreArgs,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Connection settings shared by every command.
#[derive(clap::Args, Debug, Clone)]
pub struct StoreArgs {
    /// Redis host.
    #[arg(long = "redis-host", env = "REDIS_HOST", default_value = DEFAULT_HOST, global = true)]
    pub host: String,

    /// Redis port.
    #[arg(long = "redis-port", env = "REDIS_PORT", default_value_t = DEFAULT_PORT, global = true)]
    pub port: u16,

    /// Redis password.
    #[arg(long = "redis-password", env = "REDIS_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    /// Redis database index.
    #[arg(long = "redis-db", env = "REDIS_DB", default_value_t = 0, global = true)]
    pub db: i64,

    /// Namespace prefix isolating this application's queues.
    #[arg(long, env = "APP_NAME", default_value = "", global = true)]
    pub namespace: String,

    /// Maximum pooled connections.
    #[arg(long, env = "REDIS_POOL_SIZE", default_value_t = DEFAULT_POOL_SIZE, global = true)]
    pub pool_size: usize,
}

impl StoreArgs {
    /// Converts the flags into a store configuration.
    pub fn to_config(&self) -> StoreConfig {
        let mut config = StoreConfig::new(self.host.clone(), self.port)
            .with_db(self.db)
            .with_namespace(self.namespace.clone())
            .with_pool_size(self.pool_size);
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            config = config.with_password(password);
        }
        config
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Check that the store is reachable.
    Ping,

    /// Show pending, in-progress, retry and dead-letter counts for a queue.
    Stats(QueueArgs),

    /// List the most recent dead-letter records for a queue.
    #[command(name = "dead-letters", alias = "dlq")]
    DeadLetters(DeadLettersArgs),

    /// Return abandoned leases to the queue.
    Recover(RecoverArgs),

    /// Delete every envelope and record for a queue.
    Clear(ClearArgs),

    /// Push a JSON payload onto a queue.
    Dispatch(DispatchArgs),

    /// Serve the TCP health endpoint until interrupted.
    Health(HealthArgs),
}

/// Arguments naming a single queue.
#[derive(clap::Args, Debug)]
pub struct QueueArgs {
    /// Queue name.
    pub queue: String,

    /// Print machine-readable JSON.
    #[arg(long)]
    pub json: bool,

    /// Print the depth gauge in Prometheus text format.
    #[arg(long, conflicts_with = "json")]
    pub prometheus: bool,
}

/// Arguments for `redjob dead-letters`.
#[derive(clap::Args, Debug)]
pub struct DeadLettersArgs {
    /// Queue name.
    pub queue: String,

    /// Maximum number of records to show.
    #[arg(short = 'n', long, default_value_t = DEFAULT_DEAD_LETTER_LIMIT)]
    pub limit: usize,
}

/// Arguments for `redjob recover`.
#[derive(clap::Args, Debug)]
pub struct RecoverArgs {
    /// Queue name.
    pub queue: String,

    /// Only recover leases older than this many seconds.
    #[arg(long, default_value_t = DEFAULT_RECOVER_AFTER_SECS)]
    pub older_than: u64,
}

/// Arguments for `redjob clear`.
#[derive(clap::Args, Debug)]
pub struct ClearArgs {
    /// Queue name.
    pub queue: String,

    /// Confirm deletion.
    #[arg(long)]
    pub yes: bool,
}

/// Arguments for `redjob dispatch`.
#[derive(clap::Args, Debug)]
pub struct DispatchArgs {
    /// Queue name.
    pub queue: String,

    /// Payload as a JSON document.
    pub payload: String,

    /// Envelope priority (higher runs first).
    #[arg(short, long, default_value_t = 0)]
    pub priority: u32,

    /// Suppress the dispatch if an identical payload is still pending.
    #[arg(long)]
    pub unique: bool,

    /// Explicit uniqueness key (implies --unique).
    #[arg(long)]
    pub unique_key: Option<String>,
}

/// Arguments for `redjob health`.
#[derive(clap::Args, Debug)]
pub struct HealthArgs {
    /// Address to listen on.
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], health::DEFAULT_HEALTH_PORT)))]
    pub bind: SocketAddr,
}

/// Parse CLI arguments and return the Cli struct.
///
/// Use this when you need access to CLI args before running commands
/// (e.g., to configure logging based on --log-level).
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = cli.store.to_config();
    let store = StoreHandle::connect(config).context("Failed to create store pool")?;

    match cli.command {
        Commands::Ping => run_ping_command(&store).await,
        Commands::Stats(args) => run_stats_command(&store, args).await,
        Commands::DeadLetters(args) => run_dead_letters_command(&store, args).await,
        Commands::Recover(args) => run_recover_command(&store, args).await,
        Commands::Clear(args) => run_clear_command(&store, args).await,
        Commands::Dispatch(args) => run_dispatch_command(&store, args).await.map(|_| ()),
        Commands::Health(args) => run_health_command(&store, args).await,
    }
}

async fn run_ping_command(store: &StoreHandle) -> anyhow::Result<()> {
    store.ping().await.context("Store is unreachable")?;
    println!("PONG");
    Ok(())
}

async fn run_stats_command(store: &StoreHandle, args: QueueArgs) -> anyhow::Result<()> {
    let stats = store.stats(&args.queue).await?;

    if args.prometheus {
        MetricsCollector::new().update_queue_depth(&stats.queue_name, stats.pending_jobs);
        print!("{}", export_metrics());
        return Ok(());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("\n=== Queue: {} ===", stats.queue_name);
    println!("Pending:           {}", stats.pending_jobs);
    println!("In progress:       {}", stats.in_progress_jobs);
    println!("Scheduled retries: {}", stats.scheduled_retries);
    println!("Dead letters:      {}", stats.dead_letter_jobs);
    println!("Total:             {}", stats.total_jobs());
    Ok(())
}

#[derive(Debug, Serialize)]
struct DeadLetterLine<'a> {
    job_id: String,
    dead_at: String,
    fail_count: u32,
    error: &'a str,
    payload: &'a str,
}

async fn run_dead_letters_command(store: &StoreHandle, args: DeadLettersArgs) -> anyhow::Result<()> {
    let records = store.dead_letters(&args.queue, args.limit).await?;

    for record in &records {
        let line = DeadLetterLine {
            job_id: record.envelope.id.to_string(),
            dead_at: record.dead_at.to_rfc3339(),
            fail_count: record.envelope.fail_count,
            error: &record.error,
            payload: &record.envelope.payload,
        };
        println!("{}", serde_json::to_string(&line)?);
    }

    info!(queue = %args.queue, shown = records.len(), "Listed dead letters");
    Ok(())
}

async fn run_recover_command(store: &StoreHandle, args: RecoverArgs) -> anyhow::Result<()> {
    let recovered = store
        .recover_in_progress(&args.queue, Duration::from_secs(args.older_than))
        .await?;
    println!("Recovered {} lease(s) on queue {}", recovered, args.queue);
    Ok(())
}

async fn run_clear_command(store: &StoreHandle, args: ClearArgs) -> anyhow::Result<()> {
    if !args.yes {
        anyhow::bail!("Refusing to clear queue {} without --yes", args.queue);
    }
    store.clear(&args.queue).await?;
    warn!(queue = %args.queue, "Queue cleared");
    Ok(())
}

/// Dispatches the payload; `None` when suppressed as a duplicate.
async fn run_dispatch_command(
    store: &StoreHandle,
    args: DispatchArgs,
) -> anyhow::Result<Option<JobEnvelope>> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("Payload must be valid JSON")?;

    let mut dispatcher =
        Dispatcher::<serde_json::Value>::bind(store.clone(), args.queue.clone())?.with_priority(args.priority);
    let unique = args.unique || args.unique_key.is_some();
    if let Some(key) = args.unique_key {
        dispatcher = dispatcher.with_unique_key(key);
    }
    dispatcher.set_payload(payload);

    let envelope = if unique {
        dispatcher.dispatch_unique().await?
    } else {
        Some(dispatcher.dispatch().await?)
    };

    match &envelope {
        Some(envelope) => println!("{}", envelope.id),
        None => println!("Duplicate suppressed"),
    }
    Ok(envelope)
}

async fn run_health_command(store: &StoreHandle, args: HealthArgs) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, stopping health endpoint");
        }
        signal.cancel();
    });

    let checks: Vec<Arc<dyn HealthCheck>> = vec![Arc::new(store.clone())];
    health::serve(args.bind, checks, shutdown).await?;
    Ok(())
}
