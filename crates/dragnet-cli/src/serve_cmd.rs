//! The `serve` command: assemble the control plane and expose the admin
//! API.
//!
//! Worker nodes interact through two narrow endpoints (`POST
//! /api/nodes/heartbeat`, `POST /api/reports`) plus the pub/sub bus for
//! assignments; everything else is operator surface.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use dragnet_core::bus::{InProcessBus, PubSub, TaskReport};
use dragnet_core::cron::{CronScheduler, NewScheduleRule, ScheduleRuleUpdate, TaskSubmitter};
use dragnet_core::dispatch::{Dispatcher, NewTask};
use dragnet_core::error::OrchestrateError;
use dragnet_core::events::event_pipeline;
use dragnet_core::executor::ExecutorDescriptor;
use dragnet_core::nodes::{Heartbeat, NodeRegistry, monitor};
use dragnet_core::queue::{QueueManager, sync as queue_sync};
use dragnet_store::{
    MemoryStore, SortOrder, Store, StoreError, TaskFilter, TaskStatus, TaskType,
};

use crate::config::DragnetConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<OrchestrateError> for AppError {
    fn from(err: OrchestrateError) -> Self {
        let status = match &err {
            OrchestrateError::Validation(_)
            | OrchestrateError::QueueMissing(_)
            | OrchestrateError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            OrchestrateError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            OrchestrateError::QueueFull { .. } | OrchestrateError::CapacityExhausted { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: format!("{err}"),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::from(OrchestrateError::Store(err))
    }
}

// ---------------------------------------------------------------------------
// State and assembly
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    cron: Arc<CronScheduler>,
    nodes: Arc<NodeRegistry>,
    queues: Arc<QueueManager>,
}

/// Build the full control plane and serve the admin API until ctrl-c.
pub async fn run(config: DragnetConfig) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (events, drain) = event_pipeline(store.clone(), config.events.clone());
    let shutdown = CancellationToken::new();
    tokio::spawn(drain.run(shutdown.clone()));

    let queues = Arc::new(QueueManager::new(store.clone(), events.clone()));
    // The standard queue topology, one queue per task type.
    for task_type in TaskType::ALL {
        let descriptor = ExecutorDescriptor::for_type(task_type);
        queues
            .create_queue(
                &descriptor.queue_name,
                task_type,
                descriptor.queue_priority,
                0,
            )
            .await?;
    }

    let nodes = Arc::new(NodeRegistry::new());
    let bus: Arc<dyn PubSub> = Arc::new(InProcessBus::new());
    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::clone(&queues),
        Arc::clone(&nodes),
        bus,
        events,
        config.dispatcher.clone(),
    );
    dispatcher.start().await?;

    tokio::spawn(queue_sync::run(
        Arc::clone(&queues),
        config.queue_sync.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(monitor::run(
        Arc::clone(&nodes),
        config.node_monitor.clone(),
        shutdown.clone(),
    ));

    let cron = CronScheduler::new(
        store.clone(),
        dispatcher.clone() as Arc<dyn TaskSubmitter>,
        config.cron.clone(),
    );
    cron.load().await?;
    cron.start();

    let state = AppState {
        store,
        dispatcher: dispatcher.clone(),
        cron: cron.clone(),
        nodes,
        queues,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "admin API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("admin API server failed")?;

    cron.shutdown();
    dispatcher.shutdown();
    shutdown.cancel();
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/tasks", post(submit_task).get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/progress", get(get_progress))
        .route("/api/tasks/{id}/events", get(get_task_events))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/resubmit", post(resubmit_task))
        .route("/api/running", get(list_running))
        .route("/api/queues", get(list_queues))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/heartbeat", post(ingest_heartbeat))
        .route("/api/reports", post(ingest_report))
        .route("/api/schedules", post(create_schedule).get(list_schedules))
        .route("/api/schedules/stats", get(schedule_stats))
        .route(
            "/api/schedules/{id}",
            axum::routing::put(update_schedule).delete(delete_schedule),
        )
        .route("/api/schedules/{id}/trigger", post(trigger_schedule))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn submit_task(
    State(state): State<AppState>,
    Json(new_task): Json<NewTask>,
) -> Result<impl IntoResponse, AppError> {
    let task = state.dispatcher.submit_task(new_task).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<String>,
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    50
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, AppError> {
    let mut filter = TaskFilter::default();
    if let Some(status) = &query.status {
        let status = TaskStatus::from_str(status)
            .map_err(|e| AppError::bad_request(e.to_string()))?;
        filter.status = Some(status);
    }
    let page = state
        .store
        .list_tasks(&filter, query.page, query.page_size, SortOrder::CreatedDesc)
        .await?;
    Ok(Json(serde_json::json!({
        "tasks": page.tasks,
        "total": page.total,
        "page": page.page,
        "page_size": page.page_size,
    })))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task = state.dispatcher.task_status(id).await?;
    let result = state.store.find_result_by_task(id).await?;
    Ok(Json(serde_json::json!({ "task": task, "result": result })))
}

async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let (status, progress) = state.dispatcher.task_progress(id).await?;
    Ok(Json(
        serde_json::json!({ "status": status, "progress": progress }),
    ))
}

async fn get_task_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let events = state.store.list_task_events(id).await?;
    Ok(Json(events))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.dispatcher.cancel_task(id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn resubmit_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task = state.dispatcher.resubmit_task(id).await?;
    Ok(Json(task))
}

async fn list_running(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let running = state.dispatcher.list_running().await?;
    Ok(Json(running))
}

async fn list_queues(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.queues.stats().await))
}

async fn list_nodes(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.nodes.list().await))
}

async fn ingest_heartbeat(
    State(state): State<AppState>,
    Json(heartbeat): Json<Heartbeat>,
) -> Result<impl IntoResponse, AppError> {
    state.nodes.ingest_heartbeat(heartbeat).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn ingest_report(
    State(state): State<AppState>,
    Json(report): Json<TaskReport>,
) -> Result<impl IntoResponse, AppError> {
    state.dispatcher.ingest_report(report).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(new_rule): Json<NewScheduleRule>,
) -> Result<impl IntoResponse, AppError> {
    let rule = state.cron.create_rule(new_rule).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn list_schedules(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.cron.list_rules().await?))
}

async fn schedule_stats(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.cron.stats().await?))
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<ScheduleRuleUpdate>,
) -> Result<impl IntoResponse, AppError> {
    let rule = state.cron.update_rule(id, update).await?;
    Ok(Json(rule))
}

async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.cron.delete_rule(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn trigger_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task = state.cron.trigger_now(id).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
