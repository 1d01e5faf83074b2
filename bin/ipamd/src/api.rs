//! REST API for the IPAM service.
//!
//! Routes live under `/api/v1`. The API layer enforces the policy that a
//! network with active allocations cannot be deleted (`?force=true`
//! overrides for administrative teardown); the engine's cascade handles
//! the rest.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use ipam_common::{AllocationId, AllocationRequest, Error, NetworkId};
use ipam_engine::Ipam;
use ipam_store::{RaftStore, Store};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Shared state for API handlers
pub struct ApiState {
    pub ipam: Ipam,
    /// Set only in cluster mode
    pub raft: Option<Arc<RaftStore>>,
}

/// Build the API router
pub fn router(state: Arc<ApiState>) -> Router {
    let mut api = Router::new()
        .route("/networks", get(list_networks).post(create_network))
        .route("/networks/{id}", get(get_network).delete(delete_network))
        .route("/networks/{id}/stats", get(get_network_stats))
        .route("/allocations", get(list_allocations).post(allocate))
        .route("/allocations/{id}", get(get_allocation))
        .route("/allocations/{id}/release", post(release))
        .route("/audit", get(list_audit))
        .route("/health", get(health));

    if state.raft.is_some() {
        api = api
            .route("/cluster/status", get(cluster_status))
            .route("/cluster/nodes", post(add_node))
            .route("/cluster/nodes/{node_id}", delete(remove_node));
    }

    Router::new().nest("/api/v1", api).with_state(state)
}

/// Error wrapper mapping the service taxonomy onto HTTP statuses
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse_network_id(id: &str) -> ApiResult<NetworkId> {
    id.parse()
        .map_err(|_| ApiError(Error::NetworkNotFound(id.to_string())))
}

fn parse_allocation_id(id: &str) -> ApiResult<AllocationId> {
    id.parse()
        .map_err(|_| ApiError(Error::NotAllocated(id.to_string())))
}

// ---- Network endpoints ----

async fn list_networks(State(state): State<Arc<ApiState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ipam.networks()?))
}

#[derive(Deserialize)]
struct CreateNetworkRequest {
    cidr: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

async fn create_network(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateNetworkRequest>,
) -> ApiResult<impl IntoResponse> {
    let network = state
        .ipam
        .add_network(&req.cidr, &req.description, req.tags)?;
    Ok((StatusCode::CREATED, Json(network)))
}

async fn get_network(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ipam.network(parse_network_id(&id)?)?))
}

#[derive(Deserialize)]
struct DeleteNetworkParams {
    #[serde(default)]
    force: bool,
}

async fn delete_network(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(params): Query<DeleteNetworkParams>,
) -> ApiResult<Response> {
    let id = parse_network_id(&id)?;
    let active = state
        .ipam
        .allocations(id)?
        .iter()
        .filter(|a| a.is_active())
        .count();
    if active > 0 && !params.force {
        return Ok((
            StatusCode::CONFLICT,
            Json(json!({ "error": format!("network has {active} active allocations") })),
        )
            .into_response());
    }
    state.ipam.delete_network(id)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn get_network_stats(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ipam.get_network_stats(parse_network_id(&id)?)?))
}

// ---- Allocation endpoints ----

#[derive(Deserialize)]
struct ListAllocationsParams {
    #[serde(default)]
    network_id: Option<String>,
    #[serde(default)]
    all: bool,
}

async fn list_allocations(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<ListAllocationsParams>,
) -> ApiResult<impl IntoResponse> {
    let network_ids = match &params.network_id {
        Some(id) => vec![parse_network_id(id)?],
        None => state.ipam.networks()?.into_iter().map(|n| n.id).collect(),
    };
    let mut allocations = Vec::new();
    for network_id in network_ids {
        allocations.extend(
            state
                .ipam
                .allocations(network_id)?
                .into_iter()
                .filter(|a| params.all || a.is_active()),
        );
    }
    Ok(Json(allocations))
}

async fn allocate(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<AllocationRequest>,
) -> ApiResult<impl IntoResponse> {
    let allocation = state.ipam.allocate(&req)?;
    Ok((StatusCode::CREATED, Json(allocation)))
}

async fn get_allocation(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let allocation = state.ipam.store().get_allocation(&parse_allocation_id(&id)?)?;
    Ok(Json(allocation))
}

async fn release(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let allocation = state.ipam.store().get_allocation(&parse_allocation_id(&id)?)?;
    state.ipam.release(allocation.network_id, allocation.ip)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- Audit / health ----

#[derive(Deserialize)]
struct ListAuditParams {
    #[serde(default = "default_audit_limit")]
    limit: usize,
}

fn default_audit_limit() -> usize {
    100
}

async fn list_audit(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<ListAuditParams>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ipam.audit_entries(params.limit)?))
}

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "ipam",
        "cluster_mode": state.raft.is_some(),
    }))
}

// ---- Cluster endpoints ----

fn raft(state: &ApiState) -> ApiResult<&Arc<RaftStore>> {
    state
        .raft
        .as_ref()
        .ok_or_else(|| ApiError(Error::Configuration("not in cluster mode".into())))
}

async fn cluster_status(State(state): State<Arc<ApiState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(raft(&state)?.cluster_info()?))
}

#[derive(Deserialize)]
struct AddNodeRequest {
    node_id: u64,
    addr: String,
}

async fn add_node(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<AddNodeRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.node_id == 0 || req.addr.is_empty() {
        return Err(ApiError(Error::Configuration(
            "node_id and addr are required".into(),
        )));
    }
    raft(&state)?.add_member(req.node_id, &req.addr)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_node(
    State(state): State<Arc<ApiState>>,
    Path(node_id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    raft(&state)?.remove_member(node_id)?;
    Ok(StatusCode::NO_CONTENT)
}
