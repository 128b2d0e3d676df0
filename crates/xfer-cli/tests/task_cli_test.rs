//! Integration tests for the task repository queries that back `xfer task`
//! and `xfer status`.
//!
//! Each test creates an isolated temporary database with migrations
//! applied and drops it on completion.

use xfer_db::models::{
    ExecutionStatus, ParamOperator, PostUpdateMapping, TaskParameter, TransferType,
    ValidationRules,
};
use xfer_db::queries::executions::{self, ExecutionSummary};
use xfer_db::queries::tasks as task_db;
use xfer_test_utils::{create_test_db, drop_test_db};

fn region_param() -> TaskParameter {
    TaskParameter {
        field: "region".to_string(),
        operator: ParamOperator::In,
        value: serde_json::json!(["east", "west"]),
    }
}

// -----------------------------------------------------------------------
// Tests: task create / list / show
// -----------------------------------------------------------------------

#[tokio::test]
async fn create_and_fetch_round_trips_a_task() {
    let (pool, db_name) = create_test_db().await;

    let validation_rules = ValidationRules {
        required_fields: vec!["customer_id".to_string()],
        existence_key: vec!["order_id".to_string()],
    };
    let post_update_mapping = PostUpdateMapping {
        table_key: Some("order_id".to_string()),
    };

    let created = task_db::insert_task(
        &pool,
        "daily-orders",
        "SELECT * FROM dbo.orders WHERE @region",
        vec![region_param()],
        validation_rules.clone(),
        true,
        Some("UPDATE dbo.orders SET synced = 1 WHERE @order_id"),
        post_update_mapping.clone(),
        TransferType::Up,
        None,
        Vec::new(),
        0,
    )
    .await
    .expect("task creation should succeed");

    assert!(created.active);
    assert_eq!(created.transfer_type, TransferType::Up);
    assert!(created.clear_before_insert);
    assert_eq!(created.parameters.len(), 1);
    assert_eq!(created.parameters[0].field, "region");
    assert_eq!(created.parameters[0].operator, ParamOperator::In);

    let fetched = task_db::get_task_by_id(&pool, created.id)
        .await
        .expect("get_task_by_id should succeed")
        .expect("task should exist");
    assert_eq!(fetched.id, created.id);
    assert_eq!(fetched.validation_rules, validation_rules);
    assert_eq!(fetched.post_update_mapping, post_update_mapping);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_active_excludes_deactivated_tasks() {
    let (pool, db_name) = create_test_db().await;

    task_db::insert_task(
        &pool,
        "active-task",
        "SELECT 1",
        Vec::new(),
        ValidationRules::default(),
        false,
        None,
        PostUpdateMapping::default(),
        TransferType::Up,
        None,
        Vec::new(),
        0,
    )
    .await
    .unwrap();
    let inactive = task_db::insert_task(
        &pool,
        "inactive-task",
        "SELECT 1",
        Vec::new(),
        ValidationRules::default(),
        false,
        None,
        PostUpdateMapping::default(),
        TransferType::Down,
        None,
        Vec::new(),
        0,
    )
    .await
    .unwrap();
    task_db::set_active(&pool, inactive.id, false).await.unwrap();

    let active_only = task_db::get_active_auto_or_both(&pool).await.unwrap();
    assert_eq!(active_only.len(), 1);
    assert_eq!(active_only[0].name, "active-task");

    let all = task_db::list_active_tasks(&pool).await.unwrap();
    assert_eq!(all.len(), 1, "list_active_tasks only returns still-active rows");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn linked_group_task_round_trips_execution_order() {
    let (pool, db_name) = create_test_db().await;

    task_db::insert_task(
        &pool,
        "group-member-a",
        "SELECT 1",
        Vec::new(),
        ValidationRules::default(),
        false,
        None,
        PostUpdateMapping::default(),
        TransferType::Up,
        Some("nightly-batch"),
        Vec::new(),
        1,
    )
    .await
    .unwrap();

    let members = task_db::get_active_auto_or_both(&pool).await.unwrap();
    let member = members.iter().find(|t| t.name == "group-member-a").unwrap();
    assert_eq!(member.linked_group.as_deref(), Some("nightly-batch"));
    assert_eq!(member.linked_execution_order, 1);

    drop_test_db(&db_name).await;
}

// -----------------------------------------------------------------------
// Tests: status reflects persisted executions
// -----------------------------------------------------------------------

#[tokio::test]
async fn status_reflects_latest_execution() {
    let (pool, db_name) = create_test_db().await;

    let task = task_db::insert_task(
        &pool,
        "status-task",
        "SELECT 1",
        Vec::new(),
        ValidationRules::default(),
        false,
        None,
        PostUpdateMapping::default(),
        TransferType::Up,
        None,
        Vec::new(),
        0,
    )
    .await
    .unwrap();

    assert!(
        executions::get_latest_execution_for_task(&pool, task.id)
            .await
            .unwrap()
            .is_none(),
        "a freshly created task has no executions yet"
    );

    let execution = executions::append_execution(&pool, task.id).await.unwrap();
    executions::finish_execution(
        &pool,
        execution.id,
        &ExecutionSummary {
            status: ExecutionStatus::Completed,
            rows: 42,
            inserted: 40,
            duplicates: 2,
            errors: 0,
            initial_count: 100,
            final_count: 140,
            affected_keys: vec!["1001".to_string(), "1002".to_string()],
            message: Some("ok".to_string()),
            error_detail: None,
        },
    )
    .await
    .unwrap();

    let latest = executions::get_latest_execution_for_task(&pool, task.id)
        .await
        .unwrap()
        .expect("execution should now exist");
    assert_eq!(latest.status, ExecutionStatus::Completed);
    assert_eq!(latest.progress, 100);
    assert_eq!(latest.rows, 42);
    assert_eq!(latest.inserted, 40);
    assert_eq!(latest.duplicates, 2);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn update_status_moves_execution_into_running_state() {
    let (pool, db_name) = create_test_db().await;

    let task = task_db::insert_task(
        &pool,
        "in-flight-task",
        "SELECT 1",
        Vec::new(),
        ValidationRules::default(),
        false,
        None,
        PostUpdateMapping::default(),
        TransferType::Up,
        None,
        Vec::new(),
        0,
    )
    .await
    .unwrap();

    let execution = executions::append_execution(&pool, task.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.progress, 0);

    let rows_affected = executions::update_status(&pool, execution.id, ExecutionStatus::Running, 45)
        .await
        .unwrap();
    assert_eq!(rows_affected, 1);

    let refreshed = executions::get_execution(&pool, execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.progress, 45);
    assert!(refreshed.finished_at.is_none());

    drop_test_db(&db_name).await;
}
