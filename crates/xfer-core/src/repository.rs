//! Abstract read/write of task definitions and per-execution records.
//!
//! The trait is object-safe (`async-trait`, `Send + Sync`), so the engine
//! can be generic over `Arc<dyn TaskRepository>` without knowing the
//! backing store. `PgTaskRepository` is the `xfer-db`-backed
//! implementation; `FakeTaskRepository` is an in-memory stand-in for
//! tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use xfer_db::models::{ExecutionStatus, TaskDefinition};
use xfer_db::queries::executions::{self, ExecutionSummary};
use xfer_db::queries::tasks as task_db;

/// Contract the Transfer Engine, Scheduler, and Linked Group Coordinator
/// use to read task definitions and record execution outcomes. Writes are
/// best-effort idempotent: repeating the same terminal write must leave
/// the record equivalent.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_task_by_id(&self, task_id: Uuid) -> Result<Option<TaskDefinition>>;

    /// Every active task definition -- the set the scheduler considers.
    async fn get_active_auto_or_both(&self) -> Result<Vec<TaskDefinition>>;

    /// Create a new execution row for `task_id`, returning its id. The
    /// engine calls this once, at the start of a run.
    async fn start_execution(&self, task_id: Uuid) -> Result<Uuid>;

    /// Update the current execution's status and progress.
    async fn update_status(&self, task_id: Uuid, status: ExecutionStatus, progress: i32) -> Result<()>;

    /// Persist the final summary for the current execution.
    async fn append_execution(&self, task_id: Uuid, summary: ExecutionSummary) -> Result<()>;

    /// Members of a linked group, ordered by `linkedExecutionOrder`.
    async fn find_group_members(&self, group_tag: &str) -> Result<Vec<TaskDefinition>>;

    /// IDs a task lists as explicitly linked.
    async fn find_linked(&self, task_id: Uuid) -> Result<Vec<Uuid>>;

    /// Stamp `task_id`'s row with the group execution it just took part in.
    /// Called for every member of a linked group once the group run
    /// finishes, not only the coordinator.
    async fn record_group_execution(
        &self,
        task_id: Uuid,
        group_execution_id: Uuid,
        executed_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()>;
}

// Compile-time assertion: TaskRepository must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskRepository) {}
};

/// Postgres-backed implementation, delegating to `xfer-db::queries`.
pub struct PgTaskRepository {
    pool: PgPool,
    /// task_id -> the execution row currently being written. Populated by
    /// `start_execution`, consulted by `update_status`/`append_execution`.
    current_execution: Mutex<HashMap<Uuid, Uuid>>,
}

impl PgTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            current_execution: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn get_task_by_id(&self, task_id: Uuid) -> Result<Option<TaskDefinition>> {
        task_db::get_task_by_id(&self.pool, task_id).await
    }

    async fn get_active_auto_or_both(&self) -> Result<Vec<TaskDefinition>> {
        task_db::get_active_auto_or_both(&self.pool).await
    }

    async fn start_execution(&self, task_id: Uuid) -> Result<Uuid> {
        let execution = executions::append_execution(&self.pool, task_id).await?;
        self.current_execution
            .lock()
            .unwrap()
            .insert(task_id, execution.id);
        Ok(execution.id)
    }

    async fn update_status(&self, task_id: Uuid, status: ExecutionStatus, progress: i32) -> Result<()> {
        let execution_id = {
            let map = self.current_execution.lock().unwrap();
            map.get(&task_id).copied()
        };
        if let Some(execution_id) = execution_id {
            executions::update_status(&self.pool, execution_id, status, progress).await?;
        }
        Ok(())
    }

    async fn append_execution(&self, task_id: Uuid, summary: ExecutionSummary) -> Result<()> {
        let execution_id = {
            let mut map = self.current_execution.lock().unwrap();
            map.remove(&task_id)
        };
        if let Some(execution_id) = execution_id {
            executions::finish_execution(&self.pool, execution_id, &summary).await?;
        }
        Ok(())
    }

    async fn find_group_members(&self, group_tag: &str) -> Result<Vec<TaskDefinition>> {
        task_db::find_group_members(&self.pool, group_tag).await
    }

    async fn find_linked(&self, task_id: Uuid) -> Result<Vec<Uuid>> {
        task_db::find_linked(&self.pool, task_id).await
    }

    async fn record_group_execution(
        &self,
        task_id: Uuid,
        group_execution_id: Uuid,
        executed_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        task_db::record_group_execution(&self.pool, task_id, group_execution_id, executed_at)
            .await?;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::RwLock;

    /// In-memory repository for unit tests exercising the engine without a
    /// database.
    #[derive(Default)]
    pub struct FakeTaskRepository {
        pub tasks: RwLock<HashMap<Uuid, TaskDefinition>>,
        pub statuses: RwLock<HashMap<Uuid, (ExecutionStatus, i32)>>,
        pub summaries: RwLock<Vec<(Uuid, ExecutionSummary)>>,
    }

    impl FakeTaskRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_task(&self, task: TaskDefinition) {
            self.tasks.write().unwrap().insert(task.id, task);
        }
    }

    #[async_trait]
    impl TaskRepository for FakeTaskRepository {
        async fn get_task_by_id(&self, task_id: Uuid) -> Result<Option<TaskDefinition>> {
            Ok(self.tasks.read().unwrap().get(&task_id).cloned())
        }

        async fn get_active_auto_or_both(&self) -> Result<Vec<TaskDefinition>> {
            Ok(self
                .tasks
                .read()
                .unwrap()
                .values()
                .filter(|t| t.active)
                .cloned()
                .collect())
        }

        async fn start_execution(&self, task_id: Uuid) -> Result<Uuid> {
            self.statuses
                .write()
                .unwrap()
                .insert(task_id, (ExecutionStatus::Running, 0));
            Ok(Uuid::new_v4())
        }

        async fn update_status(
            &self,
            task_id: Uuid,
            status: ExecutionStatus,
            progress: i32,
        ) -> Result<()> {
            self.statuses
                .write()
                .unwrap()
                .insert(task_id, (status, progress));
            Ok(())
        }

        async fn append_execution(&self, task_id: Uuid, summary: ExecutionSummary) -> Result<()> {
            self.summaries.write().unwrap().push((task_id, summary));
            Ok(())
        }

        async fn find_group_members(&self, group_tag: &str) -> Result<Vec<TaskDefinition>> {
            let mut members: Vec<TaskDefinition> = self
                .tasks
                .read()
                .unwrap()
                .values()
                .filter(|t| t.linked_group.as_deref() == Some(group_tag))
                .cloned()
                .collect();
            members.sort_by_key(|t| t.linked_execution_order);
            Ok(members)
        }

        async fn find_linked(&self, task_id: Uuid) -> Result<Vec<Uuid>> {
            Ok(self
                .tasks
                .read()
                .unwrap()
                .get(&task_id)
                .map(|t| t.linked_tasks.0.clone())
                .unwrap_or_default())
        }

        async fn record_group_execution(
            &self,
            task_id: Uuid,
            group_execution_id: Uuid,
            executed_at: chrono::DateTime<chrono::Utc>,
        ) -> Result<()> {
            if let Some(task) = self.tasks.write().unwrap().get_mut(&task_id) {
                task.last_group_execution_id = Some(group_execution_id);
                task.last_group_execution = Some(executed_at);
            }
            Ok(())
        }
    }

    #[test]
    fn repository_is_object_safe() {
        let repo: Box<dyn TaskRepository> = Box::new(FakeTaskRepository::new());
        assert!(futures::executor::block_on(repo.get_active_auto_or_both())
            .unwrap()
            .is_empty());
    }
}
