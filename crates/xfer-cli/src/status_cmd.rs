//! `xfer status` command: show a task's persisted definition and latest
//! execution (omit the task id to list every active task with a one-line
//! summary). Reads straight from Postgres -- the same durable state
//! `task show`/`task list` read -- since no running `xfer serve` instance
//! is required just to see what already happened.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use xfer_db::queries::{executions, tasks as task_db};

pub async fn run_status(pool: &PgPool, task_id_str: Option<&str>) -> Result<()> {
    match task_id_str {
        Some(id_str) => run_single_status(pool, id_str).await,
        None => run_fleet_status(pool).await,
    }
}

async fn run_single_status(pool: &PgPool, task_id_str: &str) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;

    let task = task_db::get_task_by_id(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task: {} ({})", task.name, task.id);
    println!("Active: {}", task.active);
    println!("Transfer type: {}", task.transfer_type);

    match executions::get_latest_execution_for_task(pool, task_id).await? {
        Some(execution) => {
            println!(
                "Latest run: {} status={} progress={}",
                execution.started_at, execution.status, execution.progress
            );
            println!(
                "  rows={} inserted={} duplicates={} errors={}",
                execution.rows, execution.inserted, execution.duplicates, execution.errors
            );
        }
        None => println!("No executions yet."),
    }

    Ok(())
}

async fn run_fleet_status(pool: &PgPool) -> Result<()> {
    let tasks = task_db::list_active_tasks(pool).await?;

    if tasks.is_empty() {
        println!("No active tasks.");
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<12} {:>10}",
        "ID", "NAME", "LAST STATUS", "PROGRESS"
    );
    println!("{}", "-".repeat(88));

    for task in &tasks {
        let (status, progress) = match executions::get_latest_execution_for_task(pool, task.id).await? {
            Some(execution) => (execution.status.to_string(), execution.progress.to_string()),
            None => ("never run".to_string(), "-".to_string()),
        };
        let name_display = if task.name.len() > 22 {
            format!("{}...", &task.name[..19])
        } else {
            task.name.clone()
        };
        println!("{:<38} {:<24} {:<12} {:>10}", task.id, name_display, status, progress);
    }

    Ok(())
}
