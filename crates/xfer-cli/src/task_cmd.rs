//! `xfer task` subcommands: create, list, show. Talk to Postgres directly,
//! the way `status_cmd` and the old plan/invariant commands did -- no
//! running `xfer serve` instance required.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use xfer_db::models::{
    ParamOperator, PostUpdateMapping, TaskParameter, TransferType, ValidationRules,
};
use xfer_db::queries::{executions, tasks as task_db};

/// Parsed form of the `--param field,op,value` flag, e.g. `region,in,["east"]`.
///
/// Comma-separated rather than `=`-separated since several operators
/// (`<=`, `>=`, `<>`) themselves contain `=`.
pub fn parse_param(raw: &str) -> Result<TaskParameter> {
    let mut parts = raw.splitn(3, ',');
    let field = parts
        .next()
        .filter(|s| !s.is_empty())
        .with_context(|| format!("malformed --param {raw:?}: expected field,op,value"))?;
    let op = parts
        .next()
        .with_context(|| format!("malformed --param {raw:?}: expected field,op,value"))?;
    let value_str = parts
        .next()
        .with_context(|| format!("malformed --param {raw:?}: expected field,op,value"))?;

    let operator: ParamOperator = op
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid operator in --param {raw:?}: {e}"))?;
    let value: serde_json::Value = serde_json::from_str(value_str)
        .or_else(|_| serde_json::to_value(value_str.to_string()))
        .with_context(|| format!("could not interpret value in --param {raw:?}"))?;

    Ok(TaskParameter {
        field: field.to_string(),
        operator,
        value,
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn run_create(
    pool: &PgPool,
    name: &str,
    query: &str,
    params: &[String],
    required_fields: &[String],
    existence_key: &[String],
    clear_before_insert: bool,
    post_update_query: Option<&str>,
    post_update_table_key: Option<&str>,
    transfer_type: &str,
    linked_group: Option<&str>,
    linked_execution_order: i32,
) -> Result<()> {
    let parameters = params
        .iter()
        .map(|p| parse_param(p))
        .collect::<Result<Vec<_>>>()?;

    let validation_rules = ValidationRules {
        required_fields: required_fields.to_vec(),
        existence_key: existence_key.to_vec(),
    };

    let post_update_mapping = PostUpdateMapping {
        table_key: post_update_table_key.map(|s| s.to_string()),
    };

    let transfer_type: TransferType = transfer_type
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid --transfer-type: {e}"))?;

    let task = task_db::insert_task(
        pool,
        name,
        query,
        parameters,
        validation_rules,
        clear_before_insert,
        post_update_query,
        post_update_mapping,
        transfer_type,
        linked_group,
        Vec::new(),
        linked_execution_order,
    )
    .await?;

    println!("Created task {} ({})", task.name, task.id);
    Ok(())
}

pub async fn run_list(pool: &PgPool, all: bool) -> Result<()> {
    let tasks = if all {
        task_db::list_active_tasks(pool).await?
    } else {
        task_db::get_active_auto_or_both(pool).await?
    };

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<8} {:<6} {:<10}",
        "ID", "NAME", "ACTIVE", "TYPE", "GROUP"
    );
    println!("{}", "-".repeat(92));
    for task in &tasks {
        println!(
            "{:<38} {:<24} {:<8} {:<6} {:<10}",
            task.id,
            task.name,
            task.active,
            task.transfer_type,
            task.linked_group.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

pub async fn run_show(pool: &PgPool, task_id_str: &str) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;

    let task = task_db::get_task_by_id(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task: {} ({})", task.name, task.id);
    println!("Active: {}", task.active);
    println!("Transfer type: {}", task.transfer_type);
    println!("Query: {}", task.query);
    println!("Clear before insert: {}", task.clear_before_insert);
    if let Some(group) = &task.linked_group {
        println!("Linked group: {group} (order {})", task.linked_execution_order);
    }
    if let Some(post_update) = &task.post_update_query {
        println!("Post-update query: {post_update}");
    }
    println!();

    match executions::get_latest_execution_for_task(pool, task_id).await? {
        Some(execution) => {
            println!("Latest execution: {} (started {})", execution.id, execution.started_at);
            println!(
                "  status={} progress={} rows={} inserted={} duplicates={} errors={}",
                execution.status,
                execution.progress,
                execution.rows,
                execution.inserted,
                execution.duplicates,
                execution.errors,
            );
            if let Some(message) = &execution.message {
                println!("  message: {message}");
            }
            if let Some(error_detail) = &execution.error_detail {
                println!("  error: {error_detail}");
            }
        }
        None => println!("No executions yet."),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_param_accepts_json_array_value() {
        let param = parse_param(r#"region,in,["east","west"]"#).unwrap();
        assert_eq!(param.field, "region");
        assert_eq!(param.operator, ParamOperator::In);
        assert_eq!(param.value, serde_json::json!(["east", "west"]));
    }

    #[test]
    fn parse_param_falls_back_to_bare_string() {
        let param = parse_param("status,=,active").unwrap();
        assert_eq!(param.field, "status");
        assert_eq!(param.operator, ParamOperator::Eq);
        assert_eq!(param.value, serde_json::json!("active"));
    }

    #[test]
    fn parse_param_accepts_comparison_operators_with_equals() {
        let param = parse_param("created_at,>=,2026-01-01").unwrap();
        assert_eq!(param.operator, ParamOperator::Ge);
        assert_eq!(param.value, serde_json::json!("2026-01-01"));
    }

    #[test]
    fn parse_param_rejects_missing_value() {
        assert!(parse_param("region,in").is_err());
    }

    #[test]
    fn parse_param_rejects_unknown_operator() {
        assert!(parse_param("region,LIKE,foo").is_err());
    }
}
