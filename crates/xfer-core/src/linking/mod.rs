//! Resolves a task's group membership and drives the serial, coordinated
//! execution of a linked group.
//!
//! `linked_group` takes precedence over `linked_tasks` when a task carries
//! both.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use uuid::Uuid;

use xfer_db::models::TaskDefinition;

use crate::engine::{self, TransferEngine, TransferResult};
use crate::repository::TaskRepository;
use crate::supervisor::{ConnectionSupervisor, ServerKey};

/// How a group (or single task) run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOrigin {
    Manual,
    Auto,
}

/// Group membership resolved for a single task.
#[derive(Debug, Clone)]
pub struct LinkingInfo {
    pub has_links: bool,
    pub group_tag: Option<String>,
    /// Ordered by `linkedExecutionOrder`.
    pub members: Vec<TaskDefinition>,
    pub coordinator_task_id: Option<Uuid>,
    pub is_coordinator: bool,
}

/// Resolve `task_id`'s linking info: its group (if `linkedGroup` is set),
/// else its explicit `linkedTasks`, else none.
pub async fn linking_info_for(repo: &dyn TaskRepository, task_id: Uuid) -> Result<LinkingInfo> {
    let task = match repo.get_task_by_id(task_id).await? {
        Some(t) => t,
        None => {
            return Ok(LinkingInfo {
                has_links: false,
                group_tag: None,
                members: Vec::new(),
                coordinator_task_id: None,
                is_coordinator: false,
            });
        }
    };

    let mut members = if let Some(group_tag) = &task.linked_group {
        repo.find_group_members(group_tag).await?
    } else {
        let linked_ids = repo.find_linked(task_id).await?;
        if linked_ids.is_empty() {
            Vec::new()
        } else {
            let mut resolved = vec![task.clone()];
            for id in linked_ids {
                if let Some(member) = repo.get_task_by_id(id).await? {
                    resolved.push(member);
                }
            }
            resolved
        }
    };
    members.sort_by_key(|m| m.linked_execution_order);

    let coordinator_task_id = members
        .iter()
        .find(|m| m.post_update_query.is_some())
        .map(|m| m.id);

    Ok(LinkingInfo {
        has_links: !members.is_empty(),
        group_tag: task.linked_group.clone(),
        is_coordinator: coordinator_task_id == Some(task_id),
        members,
        coordinator_task_id,
    })
}

/// A single member's outcome within a group execution.
#[derive(Debug, Clone)]
pub struct MemberOutcome {
    pub task_id: Uuid,
    pub task_name: String,
    pub is_group_member: bool,
    pub group_name: Option<String>,
    pub result: TransferResult,
}

/// Aggregate outcome of running a whole linked group (or a lone task).
#[derive(Debug, Clone)]
pub struct GroupExecutionResult {
    pub group_tag: Option<String>,
    pub member_outcomes: Vec<MemberOutcome>,
    pub successful_members: usize,
    pub total_members: usize,
    pub post_update_ran: bool,
}

impl GroupExecutionResult {
    pub fn success(&self) -> bool {
        self.successful_members == self.total_members
    }
}

/// Resolve `trigger_task_id`'s group, run every member serially (each
/// suppressing its own `postUpdateQuery`), then run the coordinator's
/// combined post-update once over every member's `affectedKeys`.
pub async fn execute_group(
    repo: &Arc<dyn TaskRepository>,
    engine: &TransferEngine,
    supervisor: &Arc<ConnectionSupervisor>,
    trigger_task_id: Uuid,
    origin: ExecutionOrigin,
) -> Result<GroupExecutionResult> {
    let info = linking_info_for(repo.as_ref(), trigger_task_id).await?;

    if !info.has_links {
        let task = repo
            .get_task_by_id(trigger_task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown task {trigger_task_id}"))?;
        let result = engine.run(trigger_task_id).await?;
        let success = result.success;
        return Ok(GroupExecutionResult {
            group_tag: None,
            member_outcomes: vec![MemberOutcome {
                task_id: trigger_task_id,
                task_name: task.name,
                is_group_member: false,
                group_name: None,
                result,
            }],
            successful_members: success as usize,
            total_members: 1,
            post_update_ran: false,
        });
    }

    info!(
        trigger_task_id = %trigger_task_id,
        group = ?info.group_tag,
        members = info.members.len(),
        origin = ?origin,
        "running linked group"
    );

    if info.coordinator_task_id.is_none() {
        warn!(group = ?info.group_tag, "linked group has no coordinator; running without a combined post-update");
    }

    let mut outcomes = Vec::new();
    let mut all_affected_keys = Vec::new();
    let mut successful = 0usize;

    for member in &info.members {
        let result = engine.run_suppressing_post_update(member.id).await?;
        if result.success {
            successful += 1;
        }
        all_affected_keys.extend(result.affected_keys.clone());
        outcomes.push(MemberOutcome {
            task_id: member.id,
            task_name: member.name.clone(),
            is_group_member: true,
            group_name: info.group_tag.clone(),
            result,
        });
    }

    let mut post_update_ran = false;
    if let Some(coordinator_id) = info.coordinator_task_id {
        if !all_affected_keys.is_empty() {
            if let Some(coordinator) = repo.get_task_by_id(coordinator_id).await? {
                if let Some(query_template) = &coordinator.post_update_query {
                    let post_key = coordinator
                        .post_update_mapping
                        .0
                        .table_key
                        .clone()
                        .or_else(|| coordinator.validation_rules.0.existence_key.first().cloned())
                        .unwrap_or_default();

                    match supervisor.acquire(ServerKey::A).await {
                        Ok(mut conn_a) => {
                            engine::run_post_update(&mut conn_a, query_template, &post_key, &all_affected_keys, supervisor)
                                .await;
                            supervisor.release(ServerKey::A, conn_a);
                            post_update_ran = true;
                        }
                        Err(e) => {
                            warn!(error = %e, "could not acquire A for group coordinator post-update");
                        }
                    }
                }
            }
        }
    }

    let group_execution_id = Uuid::new_v4();
    let executed_at = chrono::Utc::now();
    for outcome in &outcomes {
        if let Err(e) = repo
            .record_group_execution(outcome.task_id, group_execution_id, executed_at)
            .await
        {
            warn!(task_id = %outcome.task_id, error = %e, "failed to record group execution metadata");
        }
    }

    Ok(GroupExecutionResult {
        group_tag: info.group_tag,
        total_members: outcomes.len(),
        successful_members: successful,
        member_outcomes: outcomes,
        post_update_ran,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::fake::FakeTaskRepository;
    use xfer_db::models::TransferType;

    fn sample_task(id: Uuid, order: i32, group: Option<&str>) -> TaskDefinition {
        TaskDefinition {
            id,
            name: format!("task_{order}"),
            active: true,
            query: "SELECT * FROM src".to_string(),
            parameters: sqlx::types::Json(Vec::new()),
            validation_rules: sqlx::types::Json(Default::default()),
            clear_before_insert: false,
            post_update_query: None,
            post_update_mapping: sqlx::types::Json(Default::default()),
            transfer_type: TransferType::Up,
            linked_group: group.map(|g| g.to_string()),
            linked_tasks: sqlx::types::Json(Vec::new()),
            linked_execution_order: order,
            last_group_execution_id: None,
            last_group_execution: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn linking_info_for_unlinked_task_has_no_links() {
        let repo = FakeTaskRepository::new();
        let id = Uuid::new_v4();
        repo.insert_task(sample_task(id, 0, None));

        let info = linking_info_for(&repo, id).await.unwrap();
        assert!(!info.has_links);
    }

    #[tokio::test]
    async fn linking_info_for_group_orders_by_execution_order() {
        let repo = FakeTaskRepository::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        repo.insert_task(sample_task(a, 2, Some("G")));
        repo.insert_task(sample_task(b, 1, Some("G")));

        let info = linking_info_for(&repo, a).await.unwrap();
        assert!(info.has_links);
        assert_eq!(info.members[0].id, b);
        assert_eq!(info.members[1].id, a);
    }
}
