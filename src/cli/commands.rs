//! CLI command definitions for relayq.
//!
//! Producer commands (`enqueue`, `schedule`), operator commands (`task`,
//! `delete`, `queues`, `stats`), and `work`, which runs the execution runtime
//! with an external program as the task handler.

use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::info;

use crate::client::Client;
use crate::runtime::{self, CommandHandler, RuntimeConfig};
use crate::task::{TaskId, TaskSummary};

/// Default Redis URL.
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Default queue name.
const DEFAULT_QUEUE: &str = "default";

/// Distributed task queue on Redis.
#[derive(Parser)]
#[command(name = "relayq")]
#[command(about = "Distributed task queue with crash recovery on Redis")]
#[command(version)]
#[command(
    long_about = "relayq queues opaque tasks in Redis and runs each one in an isolated process.\n\nExample usage:\n  relayq --queue emails enqueue '{\"to\":\"a@b.c\"}'\n  relayq --queue emails work --concurrency 4 -- ./send-email"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Redis connection URL.
    #[arg(long, env = "RELAYQ_REDIS_URL", default_value = DEFAULT_REDIS_URL, global = true)]
    pub redis_url: String,

    /// Queue to operate on.
    #[arg(short, long, env = "RELAYQ_QUEUE", default_value = DEFAULT_QUEUE, global = true)]
    pub queue: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Add a task to the queue for immediate execution.
    Enqueue(EnqueueArgs),

    /// Add a task to be executed at a later time.
    Schedule(ScheduleArgs),

    /// Show a task.
    Task(TaskArgs),

    /// Delete a complete or failed task.
    Delete(TaskArgs),

    /// List known queues with their listener counts.
    Queues(OutputArgs),

    /// Show task and listener counts for the queue.
    Stats(OutputArgs),

    /// Run tasks from the queue, one process per task.
    Work(WorkArgs),
}

/// Arguments for `relayq enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Opaque task parameters.
    pub parameters: String,
}

/// Arguments for `relayq schedule`.
#[derive(Parser, Debug)]
pub struct ScheduleArgs {
    /// Opaque task parameters.
    pub parameters: String,

    /// Seconds from now until the task becomes due.
    #[arg(long, conflicts_with = "at", required_unless_present = "at")]
    pub delay: Option<u64>,

    /// Absolute due time (RFC 3339).
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,
}

/// Arguments for commands addressing one task.
#[derive(Parser, Debug)]
pub struct TaskArgs {
    /// Task id.
    pub id: String,
}

/// Output format selection.
#[derive(Parser, Debug)]
pub struct OutputArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `relayq work`.
#[derive(Parser, Debug)]
pub struct WorkArgs {
    /// Number of tasks executed at once.
    #[arg(short = 'c', long, default_value = "1")]
    pub concurrency: usize,

    /// Seconds between polls of an empty queue.
    #[arg(long, default_value = "1")]
    pub poll_interval: u64,

    /// Seconds to wait for running tasks on shutdown.
    #[arg(long, default_value = "60")]
    pub shutdown_timeout: u64,

    /// Program run per task, with the parameters on stdin.
    #[arg(required = true, last = true)]
    pub program: Vec<String>,
}

impl WorkArgs {
    fn runtime_config(&self, redis_url: &str, queue: &str) -> RuntimeConfig {
        RuntimeConfig::new(queue)
            .with_redis_url(redis_url)
            .with_concurrency(self.concurrency)
            .with_poll_interval(Duration::from_secs(self.poll_interval))
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout))
    }

    fn handler(&self) -> anyhow::Result<CommandHandler> {
        let (program, args) = self
            .program
            .split_first()
            .context("no program given to run tasks with")?;
        Ok(CommandHandler::new(program).with_args(args))
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Work(args) = &cli.command {
        let config = args.runtime_config(&cli.redis_url, &cli.queue);
        runtime::run(config, args.handler()?).await?;
        return Ok(());
    }

    let client = Client::connect(&cli.redis_url)
        .await
        .with_context(|| format!("failed to connect to {}", cli.redis_url))?;

    match cli.command {
        Commands::Enqueue(args) => run_enqueue_command(&client, &cli.queue, args).await,
        Commands::Schedule(args) => run_schedule_command(&client, &cli.queue, args).await,
        Commands::Task(args) => run_task_command(&client, args).await,
        Commands::Delete(args) => run_delete_command(&client, args).await,
        Commands::Queues(args) => run_queues_command(&client, args).await,
        Commands::Stats(args) => run_stats_command(&client, &cli.queue, args).await,
        Commands::Work(_) => Ok(()),
    }
}

async fn run_enqueue_command(
    client: &Client,
    queue: &str,
    args: EnqueueArgs,
) -> anyhow::Result<()> {
    let task_id = client.queue(queue).enqueue(&args.parameters).await?;
    info!(queue, task_id = %task_id, "Enqueued task");
    println!("{}", task_id);
    Ok(())
}

async fn run_schedule_command(
    client: &Client,
    queue: &str,
    args: ScheduleArgs,
) -> anyhow::Result<()> {
    let eta = resolve_eta(&args, Utc::now())?;
    let task_id = client.queue(queue).schedule(&args.parameters, eta).await?;
    info!(queue, task_id = %task_id, eta = %eta, "Scheduled task");
    println!("{}", task_id);
    Ok(())
}

fn resolve_eta(args: &ScheduleArgs, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    match (args.at, args.delay) {
        (Some(at), _) => Ok(at),
        (None, Some(delay)) => {
            let delay = chrono::Duration::from_std(Duration::from_secs(delay))
                .with_context(|| format!("delay of {} seconds is out of range", delay))?;
            now.checked_add_signed(delay)
                .context("eta is out of range")
        }
        (None, None) => bail!("either --delay or --at is required"),
    }
}

async fn run_task_command(client: &Client, args: TaskArgs) -> anyhow::Result<()> {
    let task = client.task(&TaskId::from(args.id.as_str())).await?;
    if task.is_empty() {
        bail!("task {} not found", args.id);
    }
    println!("{}", serde_json::to_string_pretty(&TaskSummary::from(&task))?);
    Ok(())
}

async fn run_delete_command(client: &Client, args: TaskArgs) -> anyhow::Result<()> {
    let task_id = TaskId::from(args.id.as_str());
    let task = client.task(&task_id).await?;

    let (Some(queue), Some(status)) = (task.queue(), task.status()) else {
        bail!("task {} not found", task_id);
    };
    if !status.is_terminal() {
        bail!("task {} is {} and cannot be deleted", task_id, status);
    }

    client.queue(queue).delete_task(&task_id, status).await?;
    println!("Deleted task {}", task_id);
    Ok(())
}

async fn run_queues_command(client: &Client, args: OutputArgs) -> anyhow::Result<()> {
    let queues = client.admin().queues().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&queues)?);
        return Ok(());
    }

    if queues.is_empty() {
        println!("No queues found.");
    }
    for queue in queues {
        println!("{:<32} {} listener(s)", queue.name, queue.listeners);
    }
    Ok(())
}

async fn run_stats_command(client: &Client, queue: &str, args: OutputArgs) -> anyhow::Result<()> {
    let stats = client.admin().queue(queue).stats().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("=== Queue {} ===", stats.queue_name);
    println!("Scheduled:  {}", stats.scheduled);
    println!("Pending:    {}", stats.pending);
    println!("Reserved:   {}", stats.reserved);
    println!("Started:    {}", stats.started);
    println!("Complete:   {}", stats.complete);
    println!("Failed:     {}", stats.failed);
    println!("Listeners:  {}", stats.listeners.len());
    for listener in &stats.listeners {
        println!("  {}", listener);
    }
    Ok(())
}
