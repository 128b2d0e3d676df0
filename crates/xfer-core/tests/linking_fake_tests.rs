//! Repository-facing linking behavior against `FakeTaskRepository`: group
//! resolution/ordering (P5) and the per-member group-execution stamp
//! recorded after a group run finishes.

use chrono::Utc;
use uuid::Uuid;

use xfer_core::linking::linking_info_for;
use xfer_core::repository::fake::FakeTaskRepository;
use xfer_core::repository::TaskRepository;
use xfer_db::models::{PostUpdateMapping, TaskDefinition, TaskParameter, TransferType, ValidationRules};

fn sample_task(name: &str, group: Option<&str>, order: i32, post_update: Option<&str>) -> TaskDefinition {
    let now = Utc::now();
    TaskDefinition {
        id: Uuid::new_v4(),
        name: name.to_string(),
        active: true,
        query: "SELECT * FROM src".to_string(),
        parameters: sqlx::types::Json(Vec::<TaskParameter>::new()),
        validation_rules: sqlx::types::Json(ValidationRules {
            required_fields: vec![],
            existence_key: vec!["id".to_string()],
        }),
        clear_before_insert: false,
        post_update_query: post_update.map(|s| s.to_string()),
        post_update_mapping: sqlx::types::Json(PostUpdateMapping::default()),
        transfer_type: TransferType::Up,
        linked_group: group.map(|s| s.to_string()),
        linked_tasks: sqlx::types::Json(Vec::new()),
        linked_execution_order: order,
        last_group_execution_id: None,
        last_group_execution: None,
        created_at: now,
        updated_at: now,
    }
}

/// P5: a trigger against any member of group `G` resolves the same set of
/// members, ordered by `linkedExecutionOrder` regardless of insertion
/// order.
#[tokio::test]
async fn group_members_resolve_in_ascending_order() {
    let repo = FakeTaskRepository::new();
    let m2 = sample_task("m2", Some("G"), 2, Some("UPDATE src SET flag=1"));
    let m1 = sample_task("m1", Some("G"), 1, None);
    let m1_id = m1.id;
    repo.insert_task(m2);
    repo.insert_task(m1);

    let info = linking_info_for(&repo, m1_id).await.unwrap();
    assert!(info.has_links);
    assert_eq!(info.group_tag.as_deref(), Some("G"));
    assert_eq!(info.members.len(), 2);
    assert_eq!(info.members[0].name, "m1");
    assert_eq!(info.members[1].name, "m2");
    assert_eq!(info.coordinator_task_id, Some(info.members[1].id));
}

/// Every member of a group, not only the coordinator, ends up stamped
/// with the same group-execution id once the run completes.
#[tokio::test]
async fn record_group_execution_stamps_every_member() {
    let repo = FakeTaskRepository::new();
    let m1 = sample_task("m1", Some("G"), 1, None);
    let m2 = sample_task("m2", Some("G"), 2, Some("UPDATE src SET flag=1"));
    let (m1_id, m2_id) = (m1.id, m2.id);
    repo.insert_task(m1);
    repo.insert_task(m2);

    let group_execution_id = Uuid::new_v4();
    let executed_at = Utc::now();
    for id in [m1_id, m2_id] {
        repo.record_group_execution(id, group_execution_id, executed_at)
            .await
            .unwrap();
    }

    let refreshed_m1 = repo.get_task_by_id(m1_id).await.unwrap().unwrap();
    let refreshed_m2 = repo.get_task_by_id(m2_id).await.unwrap().unwrap();
    assert_eq!(refreshed_m1.last_group_execution_id, Some(group_execution_id));
    assert_eq!(refreshed_m2.last_group_execution_id, Some(group_execution_id));
}

/// A task with no `linkedGroup` and no `linkedTasks` resolves to no links.
#[tokio::test]
async fn task_without_links_resolves_empty() {
    let repo = FakeTaskRepository::new();
    let solo = sample_task("solo", None, 0, None);
    let solo_id = solo.id;
    repo.insert_task(solo);

    let info = linking_info_for(&repo, solo_id).await.unwrap();
    assert!(!info.has_links);
    assert!(info.members.is_empty());
}
