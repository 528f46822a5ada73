use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use fleetlink_control::{ControlError, EndpointFilter, SessionPhase};
use fleetlink_proto::{ClientKind, EndpointId};
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::*;
use crate::AppState;

const DEFAULT_PAGE_SIZE: u64 = 50;
const MAX_PAGE_SIZE: u64 = 500;

fn error_response(e: ControlError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match &e {
        ControlError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        ControlError::Conflict(_) | ControlError::AlreadyConnected(_) => {
            (StatusCode::CONFLICT, "conflict")
        }
        ControlError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        ControlError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: Some(code.to_string()),
        }),
    )
}

fn bad_request(message: String) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message,
            code: Some("bad_request".to_string()),
        }),
    )
}

fn parse_kind(raw: &str) -> Result<ClientKind, (StatusCode, Json<ErrorResponse>)> {
    raw.parse::<ClientKind>().map_err(|e| bad_request(e.to_string()))
}

/// Distribute a configuration payload
#[utoipa::path(
    post,
    path = "/api/config",
    request_body = PushConfigRequest,
    responses(
        (status = 200, description = "Broadcast delivered to connected sessions and cached", body = PushConfigResponse),
        (status = 202, description = "Addressed payload queued for routing", body = PushConfigResponse),
        (status = 400, description = "Unrecognized kind", body = ErrorResponse),
        (status = 404, description = "Target endpoint not registered", body = ErrorResponse),
        (status = 503, description = "Dispatch queue is full", body = ErrorResponse)
    ),
    tag = "config"
)]
pub async fn push_config(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PushConfigRequest>,
) -> Result<(StatusCode, Json<PushConfigResponse>), (StatusCode, Json<ErrorResponse>)> {
    match request.owner {
        ConfigOwner::Kind { kind } => {
            let kind = parse_kind(&kind)?;
            let outcome = state.distributor.update(kind, request.payload);
            info!(
                %kind,
                delivered = outcome.delivered,
                evicted = outcome.evicted,
                "Broadcast config update"
            );
            Ok((
                StatusCode::OK,
                Json(PushConfigResponse {
                    delivered: outcome.delivered,
                    evicted: outcome.evicted,
                    queued: false,
                }),
            ))
        }
        ConfigOwner::Endpoint { endpoint_id } => {
            // Reject payloads for endpoints the directory has never seen
            state
                .directory
                .get(endpoint_id)
                .await
                .map_err(error_response)?;

            if state.dispatcher.enqueue(endpoint_id, request.payload) {
                Ok((
                    StatusCode::ACCEPTED,
                    Json(PushConfigResponse {
                        delivered: 0,
                        evicted: 0,
                        queued: true,
                    }),
                ))
            } else {
                Err(error_response(ControlError::Unavailable(
                    "dispatch queue is full".to_string(),
                )))
            }
        }
    }
}

/// Get the cached configuration for a kind
#[utoipa::path(
    get,
    path = "/api/config/kind/{kind}",
    params(
        ("kind" = String, Path, description = "Client kind, e.g. agent or plugin:aws")
    ),
    responses(
        (status = 200, description = "Cached configuration", body = CachedConfig),
        (status = 400, description = "Unrecognized kind", body = ErrorResponse),
        (status = 404, description = "No configuration cached for this kind", body = ErrorResponse)
    ),
    tag = "config"
)]
pub async fn get_kind_config(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> Result<Json<CachedConfig>, (StatusCode, Json<ErrorResponse>)> {
    let kind = parse_kind(&kind)?;
    match state.distributor.cache().get_kind(kind) {
        Some(payload) => Ok(Json(CachedConfig { payload })),
        None => Err(error_response(ControlError::NotFound(format!(
            "no configuration cached for kind {}",
            kind
        )))),
    }
}

/// Get the cached addressed configuration for an endpoint
#[utoipa::path(
    get,
    path = "/api/config/endpoint/{id}",
    params(
        ("id" = i32, Path, description = "Endpoint id")
    ),
    responses(
        (status = 200, description = "Cached configuration", body = CachedConfig),
        (status = 404, description = "No configuration cached for this endpoint", body = ErrorResponse)
    ),
    tag = "config"
)]
pub async fn get_endpoint_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EndpointId>,
) -> Result<Json<CachedConfig>, (StatusCode, Json<ErrorResponse>)> {
    match state.distributor.cache().get_endpoint(id) {
        Some(payload) => Ok(Json(CachedConfig { payload })),
        None => Err(error_response(ControlError::NotFound(format!(
            "no configuration cached for endpoint {}",
            id
        )))),
    }
}

/// List registered endpoints
#[utoipa::path(
    get,
    path = "/api/endpoints",
    responses(
        (status = 200, description = "One page of the endpoint directory", body = EndpointList),
        (status = 400, description = "Unrecognized kind filter", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "endpoints"
)]
pub async fn list_endpoints(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EndpointQuery>,
) -> Result<Json<EndpointList>, (StatusCode, Json<ErrorResponse>)> {
    debug!("Listing endpoints");

    let kind = match &query.kind {
        Some(raw) => Some(parse_kind(raw)?),
        None => None,
    };
    let filter = EndpointFilter {
        kind,
        hostname: query.hostname.clone(),
    };
    let page = query.page.unwrap_or(0);
    let page_size = query
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(MAX_PAGE_SIZE);

    let result = state
        .directory
        .list(&filter, page, page_size)
        .await
        .map_err(error_response)?;

    Ok(Json(EndpointList {
        endpoints: result
            .items
            .into_iter()
            .map(|r| EndpointSummary {
                id: r.endpoint_id,
                hostname: r.hostname,
                ip: r.ip,
                kind: r.kind.to_string(),
                version: r.version,
                created_at: r.created_at,
            })
            .collect(),
        total: result.total,
        page: result.page,
        page_size: result.page_size,
    }))
}

/// Get one registered endpoint
#[utoipa::path(
    get,
    path = "/api/endpoints/{id}",
    params(
        ("id" = i32, Path, description = "Endpoint id")
    ),
    responses(
        (status = 200, description = "Endpoint information", body = EndpointSummary),
        (status = 404, description = "Endpoint not found", body = ErrorResponse)
    ),
    tag = "endpoints"
)]
pub async fn get_endpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EndpointId>,
) -> Result<Json<EndpointSummary>, (StatusCode, Json<ErrorResponse>)> {
    let r = state.directory.get(id).await.map_err(error_response)?;
    Ok(Json(EndpointSummary {
        id: r.endpoint_id,
        hostname: r.hostname,
        ip: r.ip,
        kind: r.kind.to_string(),
        version: r.version,
        created_at: r.created_at,
    }))
}

/// Deregister an endpoint
#[utoipa::path(
    delete,
    path = "/api/endpoints/{id}",
    params(
        ("id" = i32, Path, description = "Endpoint id")
    ),
    responses(
        (status = 204, description = "Endpoint deregistered (or was already gone)"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "endpoints"
)]
pub async fn delete_endpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EndpointId>,
    Query(query): Query<DeleteEndpointQuery>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let actor = query.actor.unwrap_or_else(|| "operator:api".to_string());
    state
        .handler
        .deregister(id, &actor)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Get the liveness verdict for an endpoint
#[utoipa::path(
    get,
    path = "/api/endpoints/{id}/liveness",
    params(
        ("id" = i32, Path, description = "Endpoint id")
    ),
    responses(
        (status = 200, description = "Liveness status", body = LivenessResponse),
        (status = 400, description = "Unrecognized kind", body = ErrorResponse),
        (status = 404, description = "Endpoint not found and no kind given", body = ErrorResponse)
    ),
    tag = "endpoints"
)]
pub async fn get_endpoint_liveness(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EndpointId>,
    Query(query): Query<LivenessQuery>,
) -> Result<Json<LivenessResponse>, (StatusCode, Json<ErrorResponse>)> {
    let kind = match &query.kind {
        Some(raw) => parse_kind(raw)?,
        None => state.directory.get(id).await.map_err(error_response)?.kind,
    };
    let (status, last_seen) = state.liveness.status(id, &kind);
    Ok(Json(LivenessResponse { status, last_seen }))
}

/// List currently connected sessions
#[utoipa::path(
    get,
    path = "/api/sessions",
    responses(
        (status = 200, description = "Connected sessions", body = SessionList)
    ),
    tag = "sessions"
)]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionList> {
    let sessions: Vec<SessionSummary> = state
        .registry
        .list()
        .into_iter()
        .map(|info| SessionSummary {
            endpoint_id: info.endpoint_id,
            kind: info.kind.to_string(),
            peer_addr: info.peer_addr.map(|a| a.to_string()),
            connected_at: info.connected_at,
            phase: match info.phase {
                SessionPhase::Active => "active".to_string(),
                SessionPhase::Draining => "draining".to_string(),
            },
        })
        .collect();
    let total = sessions.len();
    Json(SessionList { sessions, total })
}

/// Health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.registry.count(),
    })
}
