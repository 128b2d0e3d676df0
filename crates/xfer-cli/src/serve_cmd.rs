//! `xfer serve`: the one long-running process that owns the live transfer
//! state (connection pools, the daily scheduler timer, in-flight
//! cancellation tokens, the progress bus) and exposes it over HTTP.
//!
//! Every other runtime-action subcommand (`trigger`, `cancel`, `schedule
//! status|enable|disable`) is a thin [`crate::client`] against this
//! process; only `task`/`init`/`db-init` talk to Postgres directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use xfer_core::cancellation::{self, CancellationRegistry};
use xfer_core::engine::TransferEngine;
use xfer_core::health::HealthMonitor;
use xfer_core::linking::{self, ExecutionOrigin};
use xfer_core::progress::SharedProgressBus;
use xfer_core::repository::TaskRepository;
use xfer_core::scheduler::Scheduler;
use xfer_core::supervisor::ConnectionSupervisor;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ServeState {
    pub repo: Arc<dyn TaskRepository>,
    pub engine: Arc<TransferEngine>,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub scheduler: Arc<Scheduler>,
    pub cancellation: Arc<CancellationRegistry>,
    pub progress: SharedProgressBus,
    pub health: Arc<HealthMonitor>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TaskSummaryResponse {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
    pub transfer_type: String,
    pub linked_group: Option<String>,
}

impl From<xfer_db::models::TaskDefinition> for TaskSummaryResponse {
    fn from(t: xfer_db::models::TaskDefinition) -> Self {
        Self {
            id: t.id,
            name: t.name,
            active: t.active,
            transfer_type: t.transfer_type.to_string(),
            linked_group: t.linked_group,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub task_id: Uuid,
    pub success: bool,
    pub rows: i64,
    pub inserted: i64,
    pub duplicates: i64,
    pub errors: i64,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub task_id: Uuid,
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct ScheduleStatusResponse {
    pub enabled: bool,
    pub active: bool,
    pub running: bool,
    pub hour: Option<String>,
    pub next_execution: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<xfer_core::scheduler::SchedulerStatus> for ScheduleStatusResponse {
    fn from(s: xfer_core::scheduler::SchedulerStatus) -> Self {
        Self {
            enabled: s.enabled,
            active: s.active,
            running: s.running,
            hour: s.hour,
            next_execution: s.next_execution,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScheduleEnableRequest {
    pub hour: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: ServeState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}/trigger", post(trigger_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/progress", get(task_progress))
        .route("/api/schedule", get(schedule_status))
        .route("/api/schedule/enable", post(schedule_enable))
        .route("/api/schedule/disable", post(schedule_disable))
        .route("/api/schedule/trigger", post(schedule_trigger))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: ServeState, bind: &str, port: u16) -> Result<()> {
    let health_handle = state.health.spawn();
    let cleanup_handle = state
        .cancellation
        .spawn_cleanup(cancellation::DEFAULT_SWEEP_INTERVAL, cancellation::DEFAULT_MAX_AGE);
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("xfer serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    health_handle.abort();
    cleanup_handle.abort();
    tracing::info!("xfer serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> impl IntoResponse {
    Html(
        "<!DOCTYPE html>\
<html><head><title>xfer</title></head><body>\
<h1>xfer serve</h1>\
<p><a href=\"/api/tasks\">/api/tasks</a> | <a href=\"/api/schedule\">/api/schedule</a></p>\
</body></html>",
    )
}

async fn list_tasks(State(state): State<ServeState>) -> Result<axum::response::Response, AppError> {
    let tasks = state
        .repo
        .get_active_auto_or_both()
        .await
        .map_err(AppError::internal)?;

    let results: Vec<TaskSummaryResponse> = tasks.into_iter().map(Into::into).collect();
    Ok(Json(results).into_response())
}

async fn trigger_task(
    State(state): State<ServeState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let task = state
        .repo
        .get_task_by_id(id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    let result = if task.linked_group.is_some() {
        let group_result = linking::execute_group(
            &state.repo,
            state.engine.as_ref(),
            &state.supervisor,
            id,
            ExecutionOrigin::Manual,
        )
        .await
        .map_err(AppError::internal)?;

        TriggerResponse {
            task_id: id,
            success: group_result.success(),
            rows: 0,
            inserted: 0,
            duplicates: 0,
            errors: 0,
            message: format!(
                "{}/{} group members succeeded",
                group_result.successful_members, group_result.total_members
            ),
        }
    } else {
        let result = state.engine.run(id).await.map_err(AppError::internal)?;
        TriggerResponse {
            task_id: id,
            success: result.success,
            rows: result.rows,
            inserted: result.inserted,
            duplicates: result.duplicates,
            errors: result.errors,
            message: result.message,
        }
    };

    Ok(Json(result).into_response())
}

async fn cancel_task(
    State(state): State<ServeState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let cancelled = state.cancellation.cancel(id);
    Ok(Json(CancelResponse {
        task_id: id,
        cancelled,
    })
    .into_response())
}

async fn task_progress(
    State(state): State<ServeState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, AppError> {
    let mut subscription = state
        .progress
        .subscribe(id)
        .ok_or_else(|| AppError::not_found(format!("no progress recorded for task {id} yet")))?;

    let event_stream = stream! {
        loop {
            match subscription.recv().await {
                Some(event) => {
                    let terminal = event.is_terminal();
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().data(data));
                    if terminal {
                        break;
                    }
                }
                None => break,
            }
        }
    };

    Ok(Sse::new(event_stream).keep_alive(
        axum::response::sse::KeepAlive::new().interval(Duration::from_secs(15)),
    ))
}

async fn schedule_status(State(state): State<ServeState>) -> impl IntoResponse {
    Json(ScheduleStatusResponse::from(state.scheduler.status()))
}

async fn schedule_enable(
    State(state): State<ServeState>,
    Json(req): Json<ScheduleEnableRequest>,
) -> Result<axum::response::Response, AppError> {
    state
        .scheduler
        .set_enabled(true, &req.hour)
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    Ok(Json(ScheduleStatusResponse::from(state.scheduler.status())).into_response())
}

async fn schedule_disable(State(state): State<ServeState>) -> Result<axum::response::Response, AppError> {
    state
        .scheduler
        .set_enabled(false, "00:00")
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    Ok(Json(ScheduleStatusResponse::from(state.scheduler.status())).into_response())
}

async fn schedule_trigger(State(state): State<ServeState>) -> Result<axum::response::Response, AppError> {
    state
        .scheduler
        .trigger()
        .await
        .map_err(|e| AppError::conflict(e.to_string()))?;
    Ok(Json(ScheduleStatusResponse::from(state.scheduler.status())).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use xfer_core::cancellation::CancellationRegistry;
    use xfer_core::engine::{EngineConfig, TransferEngine};
    use xfer_core::health::{HealthConfig, HealthMonitor};
    use xfer_core::notify::LoggingNotificationSink;
    use xfer_core::progress::SharedProgressBus;
    use xfer_core::repository::fake::FakeTaskRepository;
    use xfer_core::scheduler::{Scheduler, SchedulerConfig};
    use xfer_core::supervisor::ConnectionSupervisor;
    use xfer_db::models::{TaskDefinition, TransferType};

    use super::*;

    fn make_task(name: &str) -> TaskDefinition {
        TaskDefinition {
            id: Uuid::new_v4(),
            name: name.to_string(),
            active: true,
            query: "SELECT 1".to_string(),
            parameters: sqlx::types::Json(Vec::new()),
            validation_rules: sqlx::types::Json(Default::default()),
            clear_before_insert: false,
            post_update_query: None,
            post_update_mapping: sqlx::types::Json(Default::default()),
            transfer_type: TransferType::Up,
            linked_group: None,
            linked_tasks: sqlx::types::Json(Vec::new()),
            linked_execution_order: 0,
            last_group_execution_id: None,
            last_group_execution: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn make_state() -> (ServeState, Uuid) {
        let repo = Arc::new(FakeTaskRepository::new());
        let task = make_task("fixture-task");
        let task_id = task.id;
        repo.insert_task(task);
        let repo: Arc<dyn TaskRepository> = repo;

        let config_a = tiberius::Config::new();
        let config_b = tiberius::Config::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(config_a, config_b));
        let progress = SharedProgressBus::new();
        let cancellation = Arc::new(CancellationRegistry::new());

        let health = HealthMonitor::new(
            Arc::clone(&repo),
            Arc::clone(&supervisor),
            HealthConfig::default(),
        );

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

        let scheduler = Scheduler::new(
            Arc::clone(&repo),
            Arc::clone(&engine),
            Arc::clone(&supervisor),
            Arc::new(LoggingNotificationSink),
            SchedulerConfig::default(),
        );

        (
            ServeState {
                repo,
                engine,
                supervisor,
                scheduler,
                cancellation,
                progress,
                health,
            },
            task_id,
        )
    }

    async fn send(state: ServeState, method: &str, uri: &str) -> axum::response::Response {
        let app = super::build_router(state);
        app.oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_index_returns_html() {
        let (state, _) = make_state();
        let resp = send(state, "GET", "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_tasks_returns_fixture() {
        let (state, task_id) = make_state();
        let resp = send(state, "GET", "/api/tasks").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let arr = json.as_array().expect("response should be an array");
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["id"], task_id.to_string());
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_returns_false() {
        let (state, _) = make_state();
        let random_id = Uuid::new_v4();
        let resp = send(state, "POST", &format!("/api/tasks/{random_id}/cancel")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["cancelled"], false);
    }

    #[tokio::test]
    async fn test_trigger_unknown_task_not_found() {
        let (state, _) = make_state();
        let random_id = Uuid::new_v4();
        let resp = send(state, "POST", &format!("/api/tasks/{random_id}/trigger")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_schedule_status_starts_disabled() {
        let (state, _) = make_state();
        let resp = send(state, "GET", "/api/schedule").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["enabled"], false);
    }

    #[tokio::test]
    async fn test_progress_endpoint_404_before_any_publish() {
        let (state, task_id) = make_state();
        let resp = send(state, "GET", &format!("/api/tasks/{task_id}/progress")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
