/**
 * API REST FLEETOTA - Serveur HTTP du coordinateur
 *
 * RÔLE :
 * Expose la soumission et le suivi des jobs de mise à jour, l'inventaire des
 * nœuds et le service des images firmware.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key
 * - Routes : /health, /system/health, /nodes, /updates, /firmware, /health-checks
 * - POST /updates répond 202 + job_id immédiatement, l'exécution suit en tâche de fond
 * - GET /firmware/{name}?block=<option> : transfert par blocs (en-têtes x-block / x-content-size)
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - Clé absente côté kernel → accès refusé
 */

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{error, warn};

use fleetota_core::transfer::{BlockOption, Served};
use fleetota_core::wire::NodeRegistration;
use fleetota_core::{HealthReport, JobView, NodeRecord, NodeStatus, NodeUpdateStatus, UpdateRequest};

use crate::firmware::{FirmwareCatalog, FirmwareEntry, FirmwareError};
use crate::health::{HealthTracker, KernelHealth};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::registry::{FileNodeRegistry, NodeRegistry, RegistryError};
use crate::store::{HealthCheckLog, HealthCheckRecord};

pub const BLOCK_HEADER: &str = "x-block";
pub const CONTENT_SIZE_HEADER: &str = "x-content-size";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub registry: Arc<FileNodeRegistry>,
    pub firmware: Arc<FirmwareCatalog>,
    pub health_tracker: HealthTracker,
    pub health_checks: Arc<HealthCheckLog>,
    /// FLEETOTA_API_KEY ; None → toutes les routes protégées renvoient 401
    pub api_key: Option<String>,
    pub node_timeout_secs: u64,
}

#[derive(serde::Serialize)]
struct NodeView {
    node_id: String,
    hostname: String,
    address: String,
    status: NodeStatus,
    last_seen: String, // format RFC3339 pour l'API
    stale: bool,
    stale_for_seconds: i64,
    services: Vec<String>,
    drivers: Vec<String>,
    system_info: HashMap<String, Value>,
}

fn to_view(node: NodeRecord, timeout_secs: u64) -> NodeView {
    let age = (OffsetDateTime::now_utc() - node.last_seen).whole_seconds().max(0);
    NodeView {
        last_seen: node.last_seen.format(&Rfc3339).unwrap_or_default(),
        stale: age > timeout_secs as i64,
        stale_for_seconds: age,
        node_id: node.node_id,
        hostname: node.hostname,
        address: node.address,
        status: node.status,
        services: node.services,
        drivers: node.drivers,
        system_info: node.system_info,
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("SECURITY: FLEETOTA_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "rejected request with missing or wrong API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/nodes", get(list_nodes))
        .route("/nodes/register", post(register_node))
        .route("/nodes/{id}", get(get_node))
        .route("/nodes/{id}/status", post(set_node_status))
        .route("/updates", get(list_updates).post(submit_update))
        .route("/updates/{id}", get(get_update))
        .route("/updates/{id}/nodes", get(get_update_nodes))
        .route("/firmware", get(list_firmware))
        .route("/firmware/{name}", get(get_firmware))
        .route("/health-checks", get(list_health_checks).post(report_health_check))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, msg: impl ToString) -> ApiError {
    (status, Json(json!({ "error": msg.to_string() })))
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        let status = match &e {
            OrchestratorError::Validation(_) | OrchestratorError::NoTargetsAvailable => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Store(_) | OrchestratorError::Registry(_) => {
                error!("orchestrator error: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        api_error(status, e)
    }
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let nodes = app.registry.list_nodes().await;
    let jobs = app.orchestrator.list_jobs().await.unwrap_or_default();
    Json(app.health_tracker.get_health(&nodes, &jobs))
}

// GET /nodes
async fn list_nodes(State(app): State<AppState>) -> Json<Vec<NodeView>> {
    let nodes = app.registry.list_nodes().await;
    Json(nodes.into_iter().map(|n| to_view(n, app.node_timeout_secs)).collect())
}

// GET /nodes/{id}
async fn get_node(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<NodeView>, StatusCode> {
    let node = app.registry.get_node(&id).await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(to_view(node, app.node_timeout_secs)))
}

// POST /nodes/register
async fn register_node(
    State(app): State<AppState>,
    Json(msg): Json<NodeRegistration>,
) -> Result<Json<NodeRecord>, ApiError> {
    if msg.node_id.trim().is_empty() || msg.address.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "node_id and address are required"));
    }
    Ok(Json(app.registry.register(msg).await))
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: NodeStatus,
}

// POST /nodes/{id}/status
async fn set_node_status(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Value>, ApiError> {
    match app.registry.set_status(&id, body.status).await {
        Ok(()) => Ok(Json(json!({ "node_id": id, "status": body.status }))),
        Err(e @ RegistryError::NotFound(_)) => Err(api_error(StatusCode::NOT_FOUND, e)),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

// POST /updates → 202
async fn submit_update(
    State(app): State<AppState>,
    Json(request): Json<UpdateRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let job_id = app.orchestrator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id, "status": "pending" }))))
}

// GET /updates
async fn list_updates(State(app): State<AppState>) -> Result<Json<Vec<JobView>>, ApiError> {
    Ok(Json(app.orchestrator.list_jobs().await?))
}

// GET /updates/{id}
async fn get_update(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<JobView>, ApiError> {
    Ok(Json(app.orchestrator.get_status(&id).await?))
}

// GET /updates/{id}/nodes
async fn get_update_nodes(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<NodeUpdateStatus>>, ApiError> {
    Ok(Json(app.orchestrator.node_statuses(&id).await?))
}

// GET /firmware
async fn list_firmware(State(app): State<AppState>) -> Result<Json<Vec<FirmwareEntry>>, ApiError> {
    app.firmware
        .list()
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
}

#[derive(Debug, Deserialize)]
struct BlockQuery {
    block: Option<u32>,
}

// GET /firmware/{name}?block=<encoded option>
async fn get_firmware(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<BlockQuery>,
) -> Result<Response, ApiError> {
    let requested = query
        .block
        .map(BlockOption::decode)
        .transpose()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;

    let served = app.firmware.serve(&name, requested).await.map_err(|e| match e {
        FirmwareError::NotFound(_) => api_error(StatusCode::NOT_FOUND, e),
        FirmwareError::InvalidName(_) | FirmwareError::Transfer(_) => api_error(StatusCode::BAD_REQUEST, e),
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other),
    })?;

    let response = match served {
        Served::Whole(payload) => (
            StatusCode::OK,
            [
                ("content-type", "application/octet-stream".to_string()),
                (CONTENT_SIZE_HEADER, payload.len().to_string()),
            ],
            payload,
        )
            .into_response(),
        Served::Block(block) => (
            StatusCode::OK,
            [
                ("content-type", "application/octet-stream".to_string()),
                (CONTENT_SIZE_HEADER, block.total_size.to_string()),
                (BLOCK_HEADER, block.option.encode().to_string()),
            ],
            block.payload,
        )
            .into_response(),
    };
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct HealthCheckBody {
    node_id: String,
    /// Absent → heure de réception
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<OffsetDateTime>,
    report: HealthReport,
}

// POST /health-checks
async fn report_health_check(
    State(app): State<AppState>,
    Json(body): Json<HealthCheckBody>,
) -> Result<Json<Value>, ApiError> {
    if body.node_id.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "node_id is required"));
    }
    let record = HealthCheckRecord {
        node_id: body.node_id,
        timestamp: body.timestamp.unwrap_or_else(OffsetDateTime::now_utc),
        report: body.report,
    };
    app.health_checks
        .record(record)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(json!({ "message": "health check recorded" })))
}

#[derive(Debug, Deserialize)]
struct HealthCheckQuery {
    node_id: Option<String>,
    limit: Option<usize>,
}

// GET /health-checks?node_id=&limit=
async fn list_health_checks(
    State(app): State<AppState>,
    Query(query): Query<HealthCheckQuery>,
) -> Json<Vec<HealthCheckRecord>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);
    Json(app.health_checks.list(query.node_id.as_deref(), limit).await)
}
