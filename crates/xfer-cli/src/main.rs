mod client;
mod config;
mod serve_cmd;
mod status_cmd;
mod task_cmd;
#[cfg(test)]
mod test_util;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use xfer_core::cancellation::CancellationRegistry;
use xfer_core::engine::{EngineConfig, TransferEngine};
use xfer_core::health::{HealthConfig, HealthMonitor};
use xfer_core::notify::LoggingNotificationSink;
use xfer_core::progress::SharedProgressBus;
use xfer_core::repository::{PgTaskRepository, TaskRepository};
use xfer_core::scheduler::{Scheduler, SchedulerConfig};
use xfer_core::supervisor::ConnectionSupervisor;
use xfer_db::pool;

use config::XferConfig;

#[derive(Parser)]
#[command(name = "xfer", about = "Scheduled recordset transfer engine between two SQL servers")]
struct Cli {
    /// Database URL (overrides XFER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Base URL of a running `xfer serve` instance, for runtime-action
    /// commands (overrides the config file's serve.bind/serve.port)
    #[arg(long, global = true)]
    serve_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an xfer config file (no database required)
    Init {
        /// PostgreSQL connection URL for the task repository
        #[arg(long, default_value = "postgresql://localhost:5432/xfer")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the task repository database (requires config file or env vars)
    DbInit,
    /// Task definition management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Manually run a task now (requires a running `xfer serve`)
    Trigger {
        /// Task ID to trigger
        task_id: String,
    },
    /// Cancel a task's in-flight execution (requires a running `xfer serve`)
    Cancel {
        /// Task ID to cancel
        task_id: String,
    },
    /// Daily schedule control (requires a running `xfer serve` for enable/disable)
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Show task definitions and their latest execution (omit task_id to list all)
    Status {
        /// Task ID to show status for (omit to list all active tasks)
        task_id: Option<String>,
    },
    /// Run the long-lived daemon: connection pools, scheduler timer, and HTTP API
    Serve {
        /// Bind address (overrides config file's serve.bind)
        #[arg(long)]
        bind: Option<String>,
        /// Port (overrides config file's serve.port)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create a new task definition
    Create {
        /// Unique task name
        name: String,
        /// Source query run against server A
        #[arg(long)]
        query: String,
        /// Filter as field,op,value (repeatable); op is one of = < <= > >= <> IN BETWEEN
        #[arg(long = "param")]
        params: Vec<String>,
        /// Field that must be non-null on every fetched record (repeatable)
        #[arg(long = "required-field")]
        required_fields: Vec<String>,
        /// Column forming the existence key checked against the destination (repeatable)
        #[arg(long = "existence-key")]
        existence_key: Vec<String>,
        /// Truncate the destination table before inserting
        #[arg(long)]
        clear_before_insert: bool,
        /// Query run against server B after a successful write
        #[arg(long)]
        post_update_query: Option<String>,
        /// Table key consulted by the post-update query
        #[arg(long)]
        post_update_table_key: Option<String>,
        /// Direction: up (A -> B) or down (B -> A)
        #[arg(long, default_value = "up")]
        transfer_type: String,
        /// Linked group tag; tasks sharing a tag run as one coordinated unit
        #[arg(long)]
        linked_group: Option<String>,
        /// Position within a linked group's execution order
        #[arg(long, default_value_t = 0)]
        linked_execution_order: i32,
    },
    /// List tasks (active-only by default)
    List {
        /// Include inactive tasks
        #[arg(long)]
        all: bool,
    },
    /// Show a task's definition and latest execution
    Show {
        /// Task ID to show
        task_id: String,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Show whether the daily timer is enabled and when it next fires
    Status,
    /// Enable the daily timer at the given hour (HH:MM, in the server's configured timezone)
    Enable {
        /// Time of day to fire, HH:MM
        hour: String,
    },
    /// Disable the daily timer
    Disable,
}

/// Execute the `xfer init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        server_a: config::ServerSection::default(),
        server_b: config::ServerSection::default(),
        scheduler: config::SchedulerSection::default(),
        serve: config::ServeSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: set [server_a]/[server_b] connection details, then run `xfer db-init`.");

    Ok(())
}

/// Execute the `xfer db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = XferConfig::resolve(cli_db_url)?;

    println!("Initializing xfer task repository...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("xfer db-init complete.");
    Ok(())
}

async fn run_task_command(command: TaskCommands, db_pool: &sqlx::PgPool) -> anyhow::Result<()> {
    match command {
        TaskCommands::Create {
            name,
            query,
            params,
            required_fields,
            existence_key,
            clear_before_insert,
            post_update_query,
            post_update_table_key,
            transfer_type,
            linked_group,
            linked_execution_order,
        } => {
            task_cmd::run_create(
                db_pool,
                &name,
                &query,
                &params,
                &required_fields,
                &existence_key,
                clear_before_insert,
                post_update_query.as_deref(),
                post_update_table_key.as_deref(),
                &transfer_type,
                linked_group.as_deref(),
                linked_execution_order,
            )
            .await
        }
        TaskCommands::List { all } => task_cmd::run_list(db_pool, all).await,
        TaskCommands::Show { task_id } => task_cmd::run_show(db_pool, &task_id).await,
    }
}

/// Resolve the base URL of a running `xfer serve` instance: `--serve-url`
/// flag, else the config file's `serve.bind`/`serve.port`.
fn resolve_serve_url(cli_serve_url: Option<&str>, resolved: &XferConfig) -> String {
    cli_serve_url
        .map(str::to_string)
        .unwrap_or_else(|| format!("http://{}:{}", resolved.serve_bind, resolved.serve_port))
}

async fn run_schedule_command(
    command: ScheduleCommands,
    client: &client::ServeClient,
) -> anyhow::Result<()> {
    let status = match command {
        ScheduleCommands::Status => client.schedule_status().await?,
        ScheduleCommands::Enable { hour } => client.schedule_enable(&hour).await?,
        ScheduleCommands::Disable => client.schedule_disable().await?,
    };

    println!("enabled: {}", status.enabled);
    println!("active: {}", status.active);
    println!("running: {}", status.running);
    if let Some(hour) = &status.hour {
        println!("hour: {hour}");
    }
    if let Some(next) = status.next_execution {
        println!("next execution: {next}");
    }

    Ok(())
}

async fn build_serve_state(resolved: &XferConfig, db_pool: sqlx::PgPool) -> anyhow::Result<serve_cmd::ServeState> {
    let repo: Arc<dyn TaskRepository> = Arc::new(PgTaskRepository::new(db_pool));

    let config_a = resolved.server_a.to_tiberius_config();
    let config_b = resolved.server_b.to_tiberius_config();
    let supervisor = Arc::new(ConnectionSupervisor::new(config_a, config_b));

    let progress = SharedProgressBus::new();
    let cancellation = Arc::new(CancellationRegistry::new());

    let health = HealthMonitor::new(Arc::clone(&repo), Arc::clone(&supervisor), HealthConfig::default());

    let engine = Arc::new(
        TransferEngine::new(
            Arc::clone(&repo),
            Arc::clone(&supervisor),
            progress.clone(),
            Arc::clone(&cancellation),
            EngineConfig::default(),
        )
        .with_health_monitor(Arc::clone(&health)),
    );

    let timezone: chrono_tz::Tz = resolved
        .scheduler_timezone
        .parse()
        .unwrap_or(chrono_tz::Tz::UTC);

    let scheduler = Scheduler::new(
        Arc::clone(&repo),
        Arc::clone(&engine),
        Arc::clone(&supervisor),
        Arc::new(LoggingNotificationSink),
        SchedulerConfig {
            timezone,
            ..SchedulerConfig::default()
        },
    );

    if resolved.scheduler_enabled {
        scheduler.set_enabled(true, &resolved.scheduler_hour)?;
    }

    Ok(serve_cmd::ServeState {
        repo,
        engine,
        supervisor,
        scheduler,
        cancellation,
        progress,
        health,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Task { command } => {
            let resolved = XferConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = run_task_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { task_id } => {
            let resolved = XferConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, task_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Trigger { task_id } => {
            let resolved = XferConfig::resolve(cli.database_url.as_deref())?;
            let url = resolve_serve_url(cli.serve_url.as_deref(), &resolved);
            let id = Uuid::parse_str(&task_id).with_context(|| format!("invalid task ID: {task_id}"))?;
            let client = client::ServeClient::new(url);
            let result = client.trigger(id).await?;
            println!(
                "success={} rows={} inserted={} duplicates={} errors={}",
                result.success, result.rows, result.inserted, result.duplicates, result.errors
            );
            println!("{}", result.message);
        }
        Commands::Cancel { task_id } => {
            let resolved = XferConfig::resolve(cli.database_url.as_deref())?;
            let url = resolve_serve_url(cli.serve_url.as_deref(), &resolved);
            let id = Uuid::parse_str(&task_id).with_context(|| format!("invalid task ID: {task_id}"))?;
            let client = client::ServeClient::new(url);
            let result = client.cancel(id).await?;
            if result.cancelled {
                println!("Task {task_id} cancelled.");
            } else {
                println!("Task {task_id} was not running.");
            }
        }
        Commands::Schedule { command } => {
            let resolved = XferConfig::resolve(cli.database_url.as_deref())?;
            let url = resolve_serve_url(cli.serve_url.as_deref(), &resolved);
            let client = client::ServeClient::new(url);
            run_schedule_command(command, &client).await?;
        }
        Commands::Serve { bind, port } => {
            let resolved = XferConfig::resolve(cli.database_url.as_deref())?;
            let bind = bind.unwrap_or_else(|| resolved.serve_bind.clone());
            let port = port.unwrap_or(resolved.serve_port);

            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let state = build_serve_state(&resolved, db_pool).await?;
            serve_cmd::run_serve(state, &bind, port).await?;
        }
    }

    Ok(())
}
