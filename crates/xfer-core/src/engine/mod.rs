//! The Transfer Engine: one invocation moves one task's recordset from
//! server A to server B.
//!
//! Mirrors the step-numbered, heavily-`tracing`'d shape of the agent
//! lifecycle runner: a fixed sequence of phases, each phase's failure
//! mapped to a terminal outcome, cancellation polled at every suspension
//! point.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use xfer_db::models::{ExecutionStatus, TaskDefinition};
use xfer_db::queries::executions::ExecutionSummary;

use crate::cancellation::CancellationRegistry;
use crate::gateway::{self, GatewayConnection, GatewayError};
use crate::health::{ErrorKind, HealthMonitor};
use crate::progress::SharedProgressBus;
use crate::repository::TaskRepository;
use crate::supervisor::{ConnectionSupervisor, ServerKey};

const MAX_DUPLICATES_REPORTED: usize = 100;

/// Tunable knobs, defaulting to the values named in the external
/// configuration surface.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub insert_sub_batch: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            insert_sub_batch: 50,
            max_retries: 3,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// The result object returned from every engine invocation, successful or
/// not. Callers must not rely on anything beyond these fields.
#[derive(Debug, Clone, Default)]
pub struct TransferResult {
    pub success: bool,
    pub rows: i64,
    pub inserted: i64,
    pub duplicates: i64,
    pub errors: i64,
    pub initial_count: i64,
    pub final_count: i64,
    pub affected_keys: Vec<String>,
    pub reported_duplicates: Vec<String>,
    pub has_more_duplicates: bool,
    pub total_duplicates: i64,
    pub message: String,
    pub error_detail: Option<String>,
}

/// Drives a single (task, execution) pair through
/// `Starting → Connecting → Snapshotting → Extracting → Preparing → Writing
/// → PostUpdating? → Terminal`.
pub struct TransferEngine {
    repo: Arc<dyn TaskRepository>,
    supervisor: Arc<ConnectionSupervisor>,
    progress: SharedProgressBus,
    cancellation: Arc<CancellationRegistry>,
    config: EngineConfig,
    /// Out-of-band error reporting for the periodic probe; `None` in tests
    /// that don't stand up a monitor.
    health: Option<Arc<HealthMonitor>>,
}

impl TransferEngine {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        supervisor: Arc<ConnectionSupervisor>,
        progress: SharedProgressBus,
        cancellation: Arc<CancellationRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            supervisor,
            progress,
            cancellation,
            config,
            health: None,
        }
    }

    /// Attach a Health Monitor so connection-class failures hit during a run
    /// are reported to it via `registerError`, not just its own probe loop.
    pub fn with_health_monitor(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    async fn report_connection_error(&self, err: &str) {
        if let Some(health) = &self.health {
            health.register_error(ErrorKind::Connection, err).await;
        }
    }

    /// Run `task_id` to completion, honoring its own `postUpdateQuery`.
    pub async fn run(&self, task_id: Uuid) -> Result<TransferResult> {
        self.run_with_options(task_id, false).await
    }

    /// Run `task_id` as a member of a linked group: its own
    /// `postUpdateQuery` is suppressed (the coordinator runs a combined
    /// one afterwards) but `affectedKeys` are still collected.
    pub async fn run_suppressing_post_update(&self, task_id: Uuid) -> Result<TransferResult> {
        self.run_with_options(task_id, true).await
    }

    async fn run_with_options(&self, task_id: Uuid, suppress_post_update: bool) -> Result<TransferResult> {
        let task = self
            .repo
            .get_task_by_id(task_id)
            .await?
            .with_context(|| format!("no task definition for {task_id}"))?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.execute(&task, suppress_post_update).await {
                Ok(result) => return Ok(result),
                Err(detail) => {
                    if attempt >= self.config.max_retries {
                        warn!(task_id = %task_id, attempt, "engine body exhausted retries");
                        self.repo
                            .update_status(task_id, ExecutionStatus::Failed, -1)
                            .await
                            .ok();
                        return Ok(TransferResult {
                            success: false,
                            message: "failed".to_string(),
                            error_detail: Some(detail),
                            ..Default::default()
                        });
                    }
                    warn!(task_id = %task_id, attempt, error = %detail, "transient failure, retrying whole execution");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
            }
        }
    }

    /// One attempt at the full state machine. `Err` means the failure was
    /// transient (connection-class) and the whole attempt should be
    /// retried by the caller; `Ok` is always a terminal, reportable
    /// result (success, permanent failure, or cancellation).
    async fn execute(&self, task: &TaskDefinition, suppress_post_update: bool) -> Result<TransferResult, String> {
        // 1. Starting.
        self.repo
            .start_execution(task.id)
            .await
            .map_err(|e| e.to_string())?;
        self.repo
            .update_status(task.id, ExecutionStatus::Running, 0)
            .await
            .ok();
        let token = CancellationToken::new();
        self.cancellation
            .register(task.id, token.clone(), serde_json::json!({"task_name": task.name}));
        self.progress.publish(task.id, 0, None);

        if token.is_cancelled() {
            return Ok(self.finish_cancelled(task).await);
        }

        // 2. Connecting.
        let mut conn_a = match self.supervisor.acquire(ServerKey::A).await {
            Ok(conn) => conn,
            Err(e) => {
                self.report_connection_error(&e.to_string()).await;
                return self.finish_connection_failure(task, e).await;
            }
        };
        let mut conn_b = match self.supervisor.acquire(ServerKey::B).await {
            Ok(conn) => conn,
            Err(e) => {
                self.supervisor.release(ServerKey::A, conn_a);
                self.report_connection_error(&e.to_string()).await;
                return self.finish_connection_failure(task, e).await;
            }
        };

        let result = self
            .run_body(task, suppress_post_update, &token, &mut conn_a, &mut conn_b)
            .await;

        self.supervisor.release(ServerKey::A, conn_a);
        self.supervisor.release(ServerKey::B, conn_b);
        // `Err` means the failure was transient and `run_with_options` is
        // about to retry the whole attempt; only mark the registry entry
        // terminal once the outcome is actually final, so a cancel request
        // arriving during the retry backoff still lands.
        if result.is_ok() {
            self.cancellation.complete(task.id);
        }
        result
    }

    /// Snapshotting through Terminal, with both connections already
    /// acquired. Returns `Err(detail)` only for connection-class failures
    /// that should bubble up to the outer retry wrapper.
    async fn run_body(
        &self,
        task: &TaskDefinition,
        suppress_post_update: bool,
        token: &CancellationToken,
        conn_a: &mut GatewayConnection,
        conn_b: &mut GatewayConnection,
    ) -> Result<TransferResult, String> {
        // 3. Snapshotting.
        let initial_count = match gateway::query(
            conn_b,
            &format!("SELECT COUNT(*) FROM dbo.[{}]", task.name),
            &[],
        )
        .await
        {
            Ok(r) => r
                .rows
                .first()
                .and_then(|row| row.get(0))
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "snapshot count failed, continuing with 0");
                0
            }
        };

        if task.clear_before_insert {
            match gateway::clear_table(conn_b, &task.name).await {
                Ok(_) => {}
                Err(e) if e.is_missing_table() => {
                    warn!(task_id = %task.id, "clearBeforeInsert: destination table missing");
                }
                Err(e) => {
                    return Ok(self
                        .finish_failed(task, format!("truncate failed: {e}"))
                        .await);
                }
            }
        }

        // 4. Extracting.
        let (where_clause, bindings) = gateway::build_where_clause(&task.parameters.0);
        let sql = if where_clause.is_empty() {
            task.query.clone()
        } else {
            format!("{} WHERE {}", task.query, where_clause)
        };
        let params: Vec<(&str, serde_json::Value)> =
            bindings.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();

        let all_rows: Vec<serde_json::Map<String, serde_json::Value>> =
            match gateway::stream_query(conn_a, &sql, &params).await {
                Ok(rows) => rows.into_iter().map(|r| r.into_json_map()).collect(),
                Err(e) if e.is_transient() => {
                    self.report_connection_error(&e.to_string()).await;
                    return Err(e.to_string());
                }
                Err(e) => return Ok(self.finish_failed(task, e.to_string()).await),
            };

        let total_rows = all_rows.len() as i64;
        if all_rows.is_empty() {
            return Ok(self.finish_success(task, 0, 0, 0, 0, initial_count, Vec::new()).await);
        }

        // 5. Preparing.
        let merge_keys = union_unique(
            &task.validation_rules.0.existence_key,
            &task.validation_rules.0.required_fields,
        );
        if merge_keys.is_empty() {
            return Ok(self
                .finish_failed(task, "no merge keys configured".to_string())
                .await);
        }

        let mut existing_set: HashSet<String> = HashSet::new();
        if initial_count > 0 {
            match preload_existing_set(conn_b, &task.name, &merge_keys).await {
                Ok(set) => existing_set = set,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "pre-load of existing keys failed, relying on unique violations");
                }
            }
        }

        let column_types = match gateway::get_column_types(conn_b, &task.name).await {
            Ok(map) => map,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "failed to fetch destination column types, inserts will fall back to value-type inference");
                HashMap::new()
            }
        };

        // 6. Writing.
        let mut column_lengths: HashMap<String, i32> = HashMap::new();
        let mut inserted = 0i64;
        let mut duplicates = 0i64;
        let mut errors = 0i64;
        let mut affected_keys = Vec::new();
        let mut reported_duplicates = Vec::new();
        let mut processed = 0i64;
        let mut last_published = 0i32;

        let tracks_affected_keys = suppress_post_update || task.post_update_query.is_some();
        let existence_key_col = task.validation_rules.0.existence_key.first().cloned();

        for batch in all_rows.chunks(self.config.batch_size) {
            if token.is_cancelled() {
                return Ok(self.finish_cancelled(task).await);
            }

            if let Err(e) = conn_b.ping().await {
                if !e.is_transient() {
                    return Ok(self.finish_failed(task, e.to_string()).await);
                }
                self.report_connection_error(&e.to_string()).await;
                // Reconnect and re-enter this batch rather than bubbling up
                // to the outer retry wrapper, which would restart the whole
                // execution and throw away `existing_set`/`affected_keys`/
                // `inserted` accumulated so far.
                match self.supervisor.acquire(ServerKey::B).await {
                    Ok(fresh) => {
                        let stale = std::mem::replace(conn_b, fresh);
                        self.supervisor.release(ServerKey::B, stale);
                    }
                    Err(e2) => return Err(e2.to_string()),
                }
            }

            for sub_batch in batch.chunks(self.config.insert_sub_batch) {
                if token.is_cancelled() {
                    return Ok(self.finish_cancelled(task).await);
                }

                for raw_row in sub_batch {
                    let mut row = gateway::validate_record(raw_row);
                    truncate_strings(conn_b, &task.name, &mut row, &mut column_lengths).await;

                    if tracks_affected_keys {
                        if let Some(col) = &existence_key_col {
                            if let Some(value) = row.get(col) {
                                if !value.is_null() {
                                    affected_keys.push(value_to_key_string(value));
                                }
                            }
                        }
                    }

                    let signature = encode_merge_key(&row, &merge_keys);
                    if existing_set.contains(&signature) {
                        duplicates += 1;
                        if reported_duplicates.len() < MAX_DUPLICATES_REPORTED {
                            reported_duplicates.push(signature);
                        }
                        processed += 1;
                        continue;
                    }

                    match gateway::insert_typed(conn_b, &task.name, &row, &column_types, &column_lengths).await {
                        Ok(_) => {
                            inserted += 1;
                            existing_set.insert(signature);
                        }
                        Err(e) if e.is_duplicate() => {
                            duplicates += 1;
                            if reported_duplicates.len() < MAX_DUPLICATES_REPORTED {
                                reported_duplicates.push(signature);
                            }
                        }
                        Err(e) if e.is_transient() => {
                            self.report_connection_error(&e.to_string()).await;
                            match self.supervisor.acquire(ServerKey::B).await {
                                Ok(new_conn) => {
                                    let old = std::mem::replace(conn_b, new_conn);
                                    self.supervisor.release(ServerKey::B, old);
                                    match gateway::insert_typed(conn_b, &task.name, &row, &column_types, &column_lengths).await {
                                        Ok(_) => {
                                            inserted += 1;
                                            existing_set.insert(signature);
                                        }
                                        Err(e2) => return Err(e2.to_string()),
                                    }
                                }
                                Err(e2) => return Err(e2.to_string()),
                            }
                        }
                        Err(e) => {
                            errors += 1;
                            return Ok(self.finish_failed(task, e.to_string()).await);
                        }
                    }

                    processed += 1;
                }
            }

            let progress = ((processed as f64 / total_rows as f64) * 100.0).round() as i32;
            if progress == 100 || progress - last_published >= 5 {
                self.progress.publish(task.id, progress, None);
                last_published = progress;
                self.repo
                    .update_status(task.id, ExecutionStatus::Running, progress)
                    .await
                    .ok();
            }
        }

        // 7. PostUpdating.
        if !suppress_post_update {
            if let Some(query_template) = &task.post_update_query {
                if !affected_keys.is_empty() {
                    let post_key = task
                        .post_update_mapping
                        .0
                        .table_key
                        .clone()
                        .or_else(|| existence_key_col.clone())
                        .unwrap_or_default();
                    run_post_update(conn_a, query_template, &post_key, &affected_keys, &self.supervisor).await;
                }
            }
        }

        Ok(self
            .finish_success(task, total_rows, inserted, duplicates, errors, initial_count, affected_keys)
            .await
            .with_reported_duplicates(reported_duplicates))
    }

    async fn finish_success(
        &self,
        task: &TaskDefinition,
        rows: i64,
        inserted: i64,
        duplicates: i64,
        errors: i64,
        initial_count: i64,
        affected_keys: Vec<String>,
    ) -> TransferResult {
        self.progress.publish(task.id, 100, None);
        let final_count = initial_count + inserted;
        let summary = ExecutionSummary {
            status: ExecutionStatus::Completed,
            rows,
            inserted,
            duplicates,
            errors,
            initial_count,
            final_count,
            affected_keys: affected_keys.clone(),
            message: Some("completed".to_string()),
            error_detail: None,
        };
        self.repo.append_execution(task.id, summary).await.ok();

        TransferResult {
            success: true,
            rows,
            inserted,
            duplicates,
            errors,
            initial_count,
            final_count,
            affected_keys,
            reported_duplicates: Vec::new(),
            has_more_duplicates: false,
            total_duplicates: duplicates,
            message: "completed".to_string(),
            error_detail: None,
        }
    }

    async fn finish_failed(&self, task: &TaskDefinition, detail: String) -> TransferResult {
        self.progress.publish(task.id, -1, Some(detail.clone()));
        let summary = ExecutionSummary {
            status: ExecutionStatus::Failed,
            message: Some("failed".to_string()),
            error_detail: Some(detail.clone()),
            ..Default::default()
        };
        self.repo.append_execution(task.id, summary).await.ok();

        TransferResult {
            success: false,
            message: "failed".to_string(),
            error_detail: Some(detail),
            ..Default::default()
        }
    }

    async fn finish_cancelled(&self, task: &TaskDefinition) -> TransferResult {
        self.progress.publish(task.id, -1, Some("cancelled".to_string()));
        let summary = ExecutionSummary {
            status: ExecutionStatus::Cancelled,
            message: Some("cancelled".to_string()),
            ..Default::default()
        };
        self.repo.append_execution(task.id, summary).await.ok();

        TransferResult {
            success: false,
            message: "cancelled".to_string(),
            ..Default::default()
        }
    }

    async fn finish_connection_failure(
        &self,
        task: &TaskDefinition,
        error: GatewayError,
    ) -> Result<TransferResult, String> {
        if error.is_transient() {
            return Err(error.to_string());
        }
        Ok(self.finish_failed(task, error.to_string()).await)
    }
}

impl TransferResult {
    fn with_reported_duplicates(mut self, reported: Vec<String>) -> Self {
        self.has_more_duplicates = self.total_duplicates > reported.len() as i64;
        self.reported_duplicates = reported;
        self
    }
}

fn union_unique(a: &[String], b: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for field in a.iter().chain(b.iter()) {
        if seen.insert(field.clone()) {
            out.push(field.clone());
        }
    }
    out
}

fn value_to_key_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

fn encode_merge_key(row: &serde_json::Map<String, serde_json::Value>, keys: &[String]) -> String {
    keys.iter()
        .map(|k| {
            let value = row.get(k).unwrap_or(&serde_json::Value::Null);
            format!("{}:{}", k, value_to_key_string(value))
        })
        .collect::<Vec<_>>()
        .join("|")
}

async fn preload_existing_set(
    conn: &mut GatewayConnection,
    table: &str,
    keys: &[String],
) -> Result<HashSet<String>, GatewayError> {
    let column_list = keys
        .iter()
        .map(|k| format!("[{k}]"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT DISTINCT {column_list} FROM dbo.[{table}]");
    let result = gateway::query(conn, &sql, &[]).await?;

    let mut set = HashSet::new();
    for row in &result.rows {
        let parts: Vec<String> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| format!("{}:{}", k, value_to_key_string(row.get(i).unwrap_or(&serde_json::Value::Null))))
            .collect();
        set.insert(parts.join("|"));
    }
    Ok(set)
}

async fn truncate_strings(
    conn: &mut GatewayConnection,
    table: &str,
    row: &mut serde_json::Map<String, serde_json::Value>,
    cache: &mut HashMap<String, i32>,
) {
    let keys: Vec<String> = row.keys().cloned().collect();
    for key in keys {
        let needs_lookup = !cache.contains_key(&key);
        if needs_lookup {
            match gateway::get_column_max_length(conn, table, &key).await {
                Ok(len) => {
                    cache.insert(key.clone(), len);
                }
                Err(_) => {
                    cache.insert(key.clone(), 0);
                }
            }
        }
        let max_len = *cache.get(&key).unwrap_or(&0);
        if max_len > 0 {
            if let Some(serde_json::Value::String(s)) = row.get(&key) {
                if s.chars().count() as i32 > max_len {
                    let truncated: String = s.chars().take(max_len as usize).collect();
                    row.insert(key, serde_json::Value::String(truncated));
                }
            }
        }
    }
}

/// Run a coordinator's `postUpdateQuery` against A in windows of 500,
/// reconnecting once per window on a transient failure. Shared with the
/// Linked Group Coordinator, which runs this once after all members finish
/// instead of once per member.
pub(crate) async fn run_post_update(
    conn_a: &mut GatewayConnection,
    query_template: &str,
    post_key: &str,
    affected_keys: &[String],
    supervisor: &ConnectionSupervisor,
) {
    for window in affected_keys.chunks(500) {
        let stripped: Vec<String> = window
            .iter()
            .map(|k| k.strip_prefix("CN").unwrap_or(k).to_string())
            .collect();

        let placeholders: Vec<String> = stripped.iter().enumerate().map(|(i, _)| format!("@k{i}")).collect();
        let sql = format!("{query_template} WHERE {post_key} IN ({})", placeholders.join(", "));
        let params: Vec<(String, serde_json::Value)> = stripped
            .iter()
            .enumerate()
            .map(|(i, k)| (format!("k{i}"), serde_json::json!(k)))
            .collect();
        let param_refs: Vec<(&str, serde_json::Value)> =
            params.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();

        match gateway::query(conn_a, &sql, &param_refs).await {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                info!("post-update window hit a transient error, retrying once after reconnect");
                match supervisor.acquire(ServerKey::A).await {
                    Ok(mut fresh) => {
                        let retry = gateway::query(&mut fresh, &sql, &param_refs).await;
                        supervisor.release(ServerKey::A, fresh);
                        if let Err(e2) = retry {
                            warn!(error = %e2, "post-update window failed after retry, skipping");
                        }
                    }
                    Err(e2) => warn!(error = %e2, "could not reacquire A for post-update retry"),
                }
            }
            Err(e) => warn!(error = %e, "post-update window failed, skipping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_unique_dedups_preserving_order() {
        let a = vec!["id".to_string(), "region".to_string()];
        let b = vec!["region".to_string(), "name".to_string()];
        assert_eq!(union_unique(&a, &b), vec!["id", "region", "name"]);
    }

    #[test]
    fn encode_merge_key_uses_null_literal() {
        let mut row = serde_json::Map::new();
        row.insert("id".to_string(), serde_json::json!("A"));
        let sig = encode_merge_key(&row, &["id".to_string(), "region".to_string()]);
        assert_eq!(sig, "id:A|region:NULL");
    }

    #[test]
    fn value_to_key_string_handles_null() {
        assert_eq!(value_to_key_string(&serde_json::Value::Null), "NULL");
        assert_eq!(value_to_key_string(&serde_json::json!("x")), "x");
    }

    #[test]
    fn with_reported_duplicates_sets_has_more() {
        let result = TransferResult {
            total_duplicates: 150,
            ..Default::default()
        }
        .with_reported_duplicates(vec!["a".to_string(); 100]);
        assert!(result.has_more_duplicates);
        assert_eq!(result.reported_duplicates.len(), 100);
    }
}
