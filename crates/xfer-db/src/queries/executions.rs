//! Database query functions for the `task_executions` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{ExecutionStatus, TaskExecution};

/// A newly-observed execution outcome, ready to be appended to the
/// repository. Mirrors the transfer engine's result object.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    pub status: ExecutionStatus,
    pub rows: i64,
    pub inserted: i64,
    pub duplicates: i64,
    pub errors: i64,
    pub initial_count: i64,
    pub final_count: i64,
    pub affected_keys: Vec<String>,
    pub message: Option<String>,
    pub error_detail: Option<String>,
}

/// Append a new execution row for a task. The engine calls this once, at
/// the start of `Starting → Connecting`, to create the `running` placeholder,
/// then again (via [`finish_execution`]) once the outcome is known.
pub async fn append_execution(pool: &PgPool, task_id: Uuid) -> Result<TaskExecution> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "INSERT INTO task_executions \
            (task_id, started_at, status, progress, rows, inserted, duplicates, errors, \
             initial_count, final_count, affected_keys) \
         VALUES ($1, NOW(), 'running', 0, 0, 0, 0, 0, 0, 0, '[]') \
         RETURNING *",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to append task execution")?;

    Ok(execution)
}

/// Update an execution's status and progress. Idempotent: repeating the
/// same terminal write leaves the row equivalent.
pub async fn update_status(
    pool: &PgPool,
    execution_id: Uuid,
    status: ExecutionStatus,
    progress: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_executions SET status = $1, progress = $2 WHERE id = $3",
    )
    .bind(status)
    .bind(progress)
    .bind(execution_id)
    .execute(pool)
    .await
    .context("failed to update execution status")?;

    Ok(result.rows_affected())
}

/// Persist the engine's final summary and mark the execution finished.
pub async fn finish_execution(
    pool: &PgPool,
    execution_id: Uuid,
    summary: &ExecutionSummary,
) -> Result<u64> {
    let progress = match summary.status {
        ExecutionStatus::Completed => 100,
        ExecutionStatus::Cancelled | ExecutionStatus::Failed => -1,
        ExecutionStatus::Pending | ExecutionStatus::Running => 0,
    };

    let result = sqlx::query(
        "UPDATE task_executions \
         SET status = $1, progress = $2, finished_at = NOW(), rows = $3, inserted = $4, \
             duplicates = $5, errors = $6, initial_count = $7, final_count = $8, \
             affected_keys = $9, message = $10, error_detail = $11 \
         WHERE id = $12",
    )
    .bind(summary.status)
    .bind(progress)
    .bind(summary.rows)
    .bind(summary.inserted)
    .bind(summary.duplicates)
    .bind(summary.errors)
    .bind(summary.initial_count)
    .bind(summary.final_count)
    .bind(Json(&summary.affected_keys))
    .bind(&summary.message)
    .bind(&summary.error_detail)
    .bind(execution_id)
    .execute(pool)
    .await
    .context("failed to finish task execution")?;

    Ok(result.rows_affected())
}

/// Fetch a single execution by ID.
pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<Option<TaskExecution>> {
    let execution = sqlx::query_as::<_, TaskExecution>("SELECT * FROM task_executions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task execution")?;

    Ok(execution)
}

/// List all executions for a task, most recent first.
pub async fn list_executions_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskExecution>> {
    let executions = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions WHERE task_id = $1 ORDER BY started_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list task executions")?;

    Ok(executions)
}

/// Fetch the most recent execution for a task, if any.
pub async fn get_latest_execution_for_task(
    pool: &PgPool,
    task_id: Uuid,
) -> Result<Option<TaskExecution>> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions WHERE task_id = $1 ORDER BY started_at DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest task execution")?;

    Ok(execution)
}

/// Prune finished executions older than `started_at`, keeping at least the
/// most recent one per task. Used by retention housekeeping.
pub async fn prune_finished_before(pool: &PgPool, before: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM task_executions \
         WHERE finished_at IS NOT NULL AND started_at < $1 \
           AND id NOT IN ( \
               SELECT DISTINCT ON (task_id) id FROM task_executions \
               ORDER BY task_id, started_at DESC \
           )",
    )
    .bind(before)
    .execute(pool)
    .await
    .context("failed to prune old task executions")?;

    Ok(result.rows_affected())
}
