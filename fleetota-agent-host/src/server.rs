//! Agent HTTP surface used by the kernel's push transport
//!
//! - `GET /` identity
//! - `GET /health` live [`HealthReport`](fleetota_core::HealthReport)
//! - `POST /agent/update` runs the pipeline, answers a `DispatchResponse`
//! - `POST /agent/rollback` answers a `RollbackResponse`
//! - `GET /agent/services` `systemctl is-active` of the configured units
//! - `GET /agent/logs/{service}?lines=N` journal tail of one unit
//!
//! An update keeps running when the caller disconnects; the pipeline is told
//! so and keeps the backup for a later rollback.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use fleetota_core::{DispatchRequest, DispatchResponse, HealthReport, RollbackRequest, RollbackResponse};

use crate::execution::CommandRunner;
use crate::health::{self, HealthGate};
use crate::pipeline::{self, UpdatePipeline};

const DEFAULT_LOG_LINES: usize = 50;
const MAX_LOG_LINES: usize = 1000;

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

#[derive(Clone)]
pub struct AgentState {
    pub node_id: String,
    pub pipeline: Arc<UpdatePipeline>,
    pub gate: Arc<dyn HealthGate>,
    pub runner: Arc<dyn CommandRunner>,
    /// Units reported by `/agent/services`
    pub services: Vec<String>,
}

pub fn build_router(state: AgentState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/agent/update", post(update))
        .route("/agent/rollback", post(rollback))
        .route("/agent/services", get(services))
        .route("/agent/logs/{service}", get(service_logs))
        .with_state(state)
}

async fn root(State(state): State<AgentState>) -> Json<Value> {
    Json(json!({
        "message": "FleetOTA node agent",
        "node_id": state.node_id,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health(State(state): State<AgentState>) -> Json<HealthReport> {
    Json(state.gate.check().await)
}

/// Sets the flag if dropped before the response is ready
struct CallerGuard {
    gone: Arc<AtomicBool>,
    answered: bool,
}

impl Drop for CallerGuard {
    fn drop(&mut self) {
        if !self.answered {
            self.gone.store(true, Ordering::SeqCst);
        }
    }
}

async fn update(
    State(state): State<AgentState>,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<DispatchResponse>, ApiError> {
    pipeline::validate_job_id(&request.job_id).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    info!(job_id = %request.job_id, "Received update request over HTTP");

    let mut guard = CallerGuard { gone: Arc::new(AtomicBool::new(false)), answered: false };
    let gone = guard.gone.clone();
    let pipeline = state.pipeline.clone();
    let job_id = request.job_id.clone();
    let run = tokio::spawn(async move { pipeline.install_watched(&request, &gone).await });

    let outcome = run.await.map_err(|e| {
        error!(job_id = %job_id, "update task failed: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("update task failed: {e}"))
    })?;
    guard.answered = true;
    Ok(Json(DispatchResponse::from(outcome)))
}

async fn rollback(State(state): State<AgentState>, Json(request): Json<RollbackRequest>) -> Json<RollbackResponse> {
    info!(job_id = %request.job_id, "Received rollback request over HTTP");
    Json(state.pipeline.rollback(&request.job_id).await)
}

async fn services(State(state): State<AgentState>) -> Json<Value> {
    let status = health::check_services(state.runner.as_ref(), &state.services).await;
    Json(json!({ "services": status }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

/// Unit names as systemd accepts them; never an option
fn valid_unit_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':'))
}

async fn service_logs(
    State(state): State<AgentState>,
    Path(service): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    if !valid_unit_name(&service) {
        return Err(api_error(StatusCode::BAD_REQUEST, format!("invalid service name {service:?}")));
    }
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES).clamp(1, MAX_LOG_LINES);

    let args = vec![
        "-u".to_string(),
        service.clone(),
        "-n".to_string(),
        lines.to_string(),
        "--no-pager".to_string(),
    ];
    match state.runner.run("journalctl", &args).await {
        Ok(out) if out.success => Ok(Json(json!({ "service": service, "logs": out.stdout }))),
        Ok(out) => {
            warn!("journalctl for {} failed: {}", service, out.failure_reason());
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, out.failure_reason()))
        }
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}
