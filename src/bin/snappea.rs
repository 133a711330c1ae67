//! snappea CLI: operator interface to the task queue.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use snappea::command::load_registry;
use snappea::config::Config;
use snappea::config::secrets::redact_url;
use snappea::db::Db;
use snappea::enqueue::Enqueuer;
use snappea::health::HealthReporter;
use snappea::model::{Arguments, NewTask, Status, SubmitResult, TaskId};
use snappea::store::{TaskFilter, TaskStore};
use snappea::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use snappea::worker::Runner;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "snappea", about = "Task queue and worker runner")]
struct Cli {
    /// Optional TOML config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending queue migrations
    Migrate,
    /// Run the worker until interrupted
    Run {
        /// Concurrent execution slots (overrides SNAPPEA_SLOTS)
        #[arg(long)]
        slots: Option<usize>,
        /// Directory containing task TOML declarations
        #[arg(long)]
        tasks_dir: Option<PathBuf>,
    },
    /// Enqueue a task
    Enqueue {
        /// Task type; must be declared in the tasks directory
        task_type: String,
        /// JSON object of arguments
        #[arg(long)]
        args: Option<String>,
        /// Deduplicate against live tasks with this key
        #[arg(long)]
        idempotency_key: Option<String>,
        /// Delay before the task becomes eligible
        #[arg(long)]
        delay_secs: Option<u64>,
        /// Attempt ceiling for this task
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// List tasks, newest first
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Filter by task type
        #[arg(long = "type")]
        task_type: Option<String>,
        /// Maximum tasks to show
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..))]
        limit: u32,
    },
    /// Show a task and its event history
    Show {
        /// Task ID
        id: TaskId,
    },
    /// Dead-letter a pending task
    Cancel {
        /// Task ID
        id: TaskId,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Print readiness as JSON; exits non-zero when not ready
    Health {
        /// Liveness only: prints "ok" without contacting the store
        #[arg(long)]
        live: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    if let Command::Health { live: true } = cli.command {
        println!("{}", HealthReporter::live());
        return Ok(());
    }
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Migrate => cmd_migrate(&config).await,
        Command::Run { slots, tasks_dir } => cmd_run(config, slots, tasks_dir).await,
        Command::Enqueue {
            task_type,
            args,
            idempotency_key,
            delay_secs,
            max_attempts,
        } => {
            cmd_enqueue(
                &config,
                task_type,
                args,
                idempotency_key,
                delay_secs,
                max_attempts,
            )
            .await
        }
        Command::List {
            status,
            task_type,
            limit,
        } => cmd_list(&config, status, task_type, limit).await,
        Command::Show { id } => cmd_show(&config, id).await,
        Command::Cancel { id, reason } => cmd_cancel(&config, id, reason).await,
        Command::Health { .. } => cmd_health(&config).await,
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "snappea".to_string(),
        log_level: config.log_level.clone(),
    })?;
    Ok(guard)
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    Db::connect(config.queue_database_url.expose_secret())
        .await
        .with_context(|| {
            format!(
                "cannot connect to queue database {}",
                redact_url(&config.queue_database_url)
            )
        })
}

async fn cmd_migrate(config: &Config) -> anyhow::Result<()> {
    let db = connect(config).await?;
    db.migrate().await?;
    println!("Queue migrations applied.");
    Ok(())
}

async fn cmd_run(
    mut config: Config,
    slots: Option<usize>,
    tasks_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(slots) = slots {
        anyhow::ensure!(slots > 0, "--slots must be at least 1");
        config.slots = slots;
    }
    if let Some(dir) = tasks_dir {
        config.tasks_dir = dir;
    }

    let guard = telemetry(&config)?;

    let registry = load_registry(&config.tasks_dir)?;
    let db = connect(&config).await?;
    db.migrate().await?;
    info!(
        database = %redact_url(&config.queue_database_url),
        slots = config.slots,
        exporting = guard.is_exporting(),
        "queue database ready"
    );

    let store: Arc<dyn TaskStore> = Arc::new(db);
    let runner = Runner::new(store, Arc::new(registry), config.runner_config());

    let stopper = runner.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("interrupt received, shutting down");
        stopper.shutdown();
    });

    runner.run().await?;
    Ok(())
}

async fn cmd_enqueue(
    config: &Config,
    task_type: String,
    args: Option<String>,
    idempotency_key: Option<String>,
    delay_secs: Option<u64>,
    max_attempts: Option<u32>,
) -> anyhow::Result<()> {
    let arguments = match args {
        Some(json) => {
            let value: serde_json::Value =
                serde_json::from_str(&json).context("--args is not valid JSON")?;
            Arguments::try_from(value)?
        }
        None => Arguments::empty(),
    };

    let mut new = NewTask::new(&task_type).arguments(arguments);
    if let Some(key) = idempotency_key {
        new = new.idempotency_key(key);
    }
    if let Some(secs) = delay_secs {
        let delay = chrono::Duration::seconds(i64::try_from(secs).context("--delay-secs too large")?);
        new = new.not_before(Utc::now() + delay);
    }
    if let Some(n) = max_attempts {
        new = new.max_attempts(n);
    }

    let registry = load_registry(&config.tasks_dir)?;
    let store: Arc<dyn TaskStore> = Arc::new(connect(config).await?);
    let enqueuer = Enqueuer::new(store, Arc::new(registry))
        .with_default_max_attempts(config.max_attempts);

    match enqueuer.submit(new).await? {
        SubmitResult::Created(id) => println!("Created: {id}"),
        SubmitResult::Deduplicated(id) => println!("Deduplicated: existing task {id}"),
    }
    Ok(())
}

async fn cmd_list(
    config: &Config,
    status: Option<String>,
    task_type: Option<String>,
    limit: u32,
) -> anyhow::Result<()> {
    let status: Option<Status> = match status {
        Some(s) => Some(s.parse()?),
        None => None,
    };

    let db = connect(config).await?;
    let tasks = db
        .list(&TaskFilter {
            status,
            task_type,
            limit: i64::from(limit),
        })
        .await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<11}  {:<8}  {:<19}  CREATED",
        "ID", "TYPE", "STATUS", "ATTEMPTS", "NOT_BEFORE"
    );
    println!("{}", "-".repeat(90));

    for task in &tasks {
        println!(
            "{:<8}  {:<20}  {:<11}  {:<8}  {:<19}  {}",
            task.id,
            task.task_type,
            task.status,
            format!("{}/{}", task.attempts, task.max_attempts),
            task.not_before.format("%Y-%m-%d %H:%M:%S"),
            task.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} task(s)", tasks.len());
    Ok(())
}

async fn cmd_show(config: &Config, id: TaskId) -> anyhow::Result<()> {
    let db = connect(config).await?;
    let task = db.get(id).await?;
    let events = db.events_for(id).await?;

    println!("ID:          {}", task.id);
    println!("Type:        {}", task.task_type);
    println!("Status:      {}", task.status);
    println!("Attempts:    {}/{}", task.attempts, task.max_attempts);
    println!("Not Before:  {}", task.not_before);
    println!(
        "Idem. Key:   {}",
        task.idempotency_key.as_deref().unwrap_or("-")
    );
    println!(
        "Arguments:   {}",
        serde_json::to_string_pretty(&task.arguments)?
    );
    if let Some(ref owner) = task.lease_owner {
        println!("Lease Owner: {owner}");
    }
    if let Some(expires) = task.lease_expires_at {
        println!("Lease Until: {expires}");
    }
    if let Some(ref err) = task.last_error {
        println!("Last Error:  {err}");
    }
    println!("Created:     {}", task.created_at);
    println!("Updated:     {}", task.updated_at);

    if !events.is_empty() {
        println!("---");
        for event in &events {
            println!(
                "{}  {:<16}  {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                event.kind.name(),
                serde_json::to_string(&event.kind)?
            );
        }
    }

    Ok(())
}

async fn cmd_cancel(config: &Config, id: TaskId, reason: String) -> anyhow::Result<()> {
    let db = connect(config).await?;
    db.cancel(id, &reason, Utc::now()).await?;
    println!("Dead-lettered: {id}");
    Ok(())
}

async fn cmd_health(config: &Config) -> anyhow::Result<()> {
    let mut reporter = match connect(config).await {
        Ok(db) => HealthReporter::new(Arc::new(db)),
        Err(e) => {
            let report = serde_json::json!({
                "status": "error",
                "store": format!("error: {e:#}"),
                "registry": "error: not checked",
                "version": env!("CARGO_PKG_VERSION"),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            std::process::exit(1);
        }
    };
    if let Ok(registry) = load_registry(&config.tasks_dir) {
        reporter = reporter.with_registry(Arc::new(registry));
    }

    let report = reporter.check().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_ready() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_limit_must_be_positive() {
        assert!(Cli::try_parse_from(["snappea", "list", "--limit", "-1"]).is_err());
        assert!(Cli::try_parse_from(["snappea", "list", "--limit", "0"]).is_err());
        let cli = Cli::try_parse_from(["snappea", "list", "--limit", "5"]).unwrap();
        assert!(matches!(cli.command, Command::List { limit: 5, .. }));
    }

    #[test]
    fn health_live_flag_parses() {
        let cli = Cli::try_parse_from(["snappea", "health", "--live"]).unwrap();
        assert!(matches!(cli.command, Command::Health { live: true }));
        let cli = Cli::try_parse_from(["snappea", "health"]).unwrap();
        assert!(matches!(cli.command, Command::Health { live: false }));
    }
}
