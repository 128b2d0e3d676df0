//! Database query functions for the `task_definitions` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{
    ParamOperator, PostUpdateMapping, TaskDefinition, TaskParameter, TransferType, ValidationRules,
};

/// Insert a new task definition. Returns the inserted row with
/// server-generated defaults (`id`, `created_at`, `updated_at`).
#[allow(clippy::too_many_arguments)]
pub async fn insert_task(
    pool: &PgPool,
    name: &str,
    query: &str,
    parameters: Vec<TaskParameter>,
    validation_rules: ValidationRules,
    clear_before_insert: bool,
    post_update_query: Option<&str>,
    post_update_mapping: PostUpdateMapping,
    transfer_type: TransferType,
    linked_group: Option<&str>,
    linked_tasks: Vec<Uuid>,
    linked_execution_order: i32,
) -> Result<TaskDefinition> {
    let task = sqlx::query_as::<_, TaskDefinition>(
        "INSERT INTO task_definitions \
            (name, active, query, parameters, validation_rules, clear_before_insert, \
             post_update_query, post_update_mapping, transfer_type, linked_group, \
             linked_tasks, linked_execution_order) \
         VALUES ($1, true, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         RETURNING *",
    )
    .bind(name)
    .bind(query)
    .bind(Json(parameters))
    .bind(Json(validation_rules))
    .bind(clear_before_insert)
    .bind(post_update_query)
    .bind(Json(post_update_mapping))
    .bind(transfer_type)
    .bind(linked_group)
    .bind(Json(linked_tasks))
    .bind(linked_execution_order)
    .fetch_one(pool)
    .await
    .context("failed to insert task definition")?;

    Ok(task)
}

/// Fetch a single task definition by ID.
pub async fn get_task_by_id(pool: &PgPool, id: Uuid) -> Result<Option<TaskDefinition>> {
    let task =
        sqlx::query_as::<_, TaskDefinition>("SELECT * FROM task_definitions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch task definition")?;

    Ok(task)
}

/// List every active task definition the scheduler considers on each tick.
///
/// There is no separate manual/auto flag in the persisted model, so this
/// returns all active rows regardless of `transfer_type`.
pub async fn get_active_auto_or_both(pool: &PgPool) -> Result<Vec<TaskDefinition>> {
    let tasks = sqlx::query_as::<_, TaskDefinition>(
        "SELECT * FROM task_definitions WHERE active = true ORDER BY name ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active task definitions")?;

    Ok(tasks)
}

/// List active task definitions, most recently updated first.
pub async fn list_active_tasks(pool: &PgPool) -> Result<Vec<TaskDefinition>> {
    let tasks = sqlx::query_as::<_, TaskDefinition>(
        "SELECT * FROM task_definitions WHERE active = true ORDER BY updated_at DESC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active task definitions")?;

    Ok(tasks)
}

/// Find every task definition sharing a `linked_group` tag, ordered by
/// `linked_execution_order` ascending -- the order the Linked Group
/// Coordinator runs group members in.
pub async fn find_group_members(pool: &PgPool, group_tag: &str) -> Result<Vec<TaskDefinition>> {
    let tasks = sqlx::query_as::<_, TaskDefinition>(
        "SELECT * FROM task_definitions \
         WHERE linked_group = $1 \
         ORDER BY linked_execution_order ASC",
    )
    .bind(group_tag)
    .fetch_all(pool)
    .await
    .context("failed to find linked group members")?;

    Ok(tasks)
}

/// Resolve the IDs a task lists in its `linked_tasks` column.
pub async fn find_linked(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let row: Option<(Json<Vec<Uuid>>,)> =
        sqlx::query_as("SELECT linked_tasks FROM task_definitions WHERE id = $1")
            .bind(task_id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch linked tasks")?;

    Ok(row.map(|(Json(ids),)| ids).unwrap_or_default())
}

/// Stamp a member of a linked group with the group execution that just ran
/// it -- `last_group_execution_id`/`last_group_execution` on every member's
/// own row, so each task's row reflects the group run it participated in
/// independent of which member happened to be the coordinator.
pub async fn record_group_execution(
    pool: &PgPool,
    task_id: Uuid,
    group_execution_id: Uuid,
    executed_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_definitions \
         SET last_group_execution_id = $1, last_group_execution = $2 \
         WHERE id = $3",
    )
    .bind(group_execution_id)
    .bind(executed_at)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to record group execution on task definition")?;

    Ok(result.rows_affected())
}

/// Toggle a task definition's `active` flag.
pub async fn set_active(pool: &PgPool, id: Uuid, active: bool) -> Result<u64> {
    let result = sqlx::query("UPDATE task_definitions SET active = $1, updated_at = NOW() WHERE id = $2")
        .bind(active)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to toggle task definition active flag")?;

    Ok(result.rows_affected())
}
