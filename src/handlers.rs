//! HTTP request handlers and the API error envelope.

use axum::Json;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use tracing::info;
use ulid::Ulid;

use crate::build_info;
use crate::error::GatewayError;
use crate::gateway::{GatewayDiagnostics, ToolRequest, ToolResponse};
use crate::server::AppState;
use crate::session::SessionRecord;

pub const CONNECTION_HEADER: &str = "x-connection-id";
pub const CONNECTION_ID_PREFIX: &str = "con_";

// ============================================================================
// ApiError
// ============================================================================

/// Error response envelope: `{"error": {"code": ..., "message": ...}}`.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        let code = e.code();
        Self {
            status: status_for(code),
            code,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        }));
        (self.status, body).into_response()
    }
}

/// HTTP status for a gateway error code.
fn status_for(code: &str) -> StatusCode {
    match code {
        "admission_global_capacity" | "admission_source_capacity" | "provider_rate_limited" => {
            StatusCode::TOO_MANY_REQUESTS
        }
        "unknown_connection" => StatusCode::FORBIDDEN,
        "unknown_provider" | "session_not_found" => StatusCode::NOT_FOUND,
        "circuit_open" | "scope_acquire_timeout" => StatusCode::SERVICE_UNAVAILABLE,
        "session_version_conflict" => StatusCode::CONFLICT,
        "provider_client_error" => StatusCode::BAD_REQUEST,
        "provider_server_error" | "provider_timeout" | "provider_transport_error" => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// Health & Version
// ============================================================================

pub async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[derive(Serialize)]
pub struct ReadyzResponse {
    pub status: String,
    pub active_connections: usize,
}

pub async fn readyz(State(state): State<AppState>) -> Json<ReadyzResponse> {
    Json(ReadyzResponse {
        status: "ok".to_string(),
        active_connections: state.gateway.admission().count(),
    })
}

pub async fn version() -> Json<build_info::BuildInfo> {
    Json(build_info::BuildInfo::new())
}

// ============================================================================
// Connections
// ============================================================================

#[derive(Serialize)]
pub struct ConnectResponse {
    pub connection_id: String,
}

/// POST /v1/connections
pub async fn create_connection(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<(StatusCode, Json<ConnectResponse>), ApiError> {
    let connection_id = format!("{}{}", CONNECTION_ID_PREFIX, Ulid::new());
    state
        .gateway
        .admission()
        .register(&connection_id, addr.ip())
        .map_err(GatewayError::AdmissionRejected)?;

    info!(connection_id = %connection_id, source = %addr.ip(), "Connection admitted");
    Ok((StatusCode::CREATED, Json(ConnectResponse { connection_id })))
}

/// DELETE /v1/connections/{id}
pub async fn delete_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> StatusCode {
    state.gateway.admission().unregister(&connection_id);
    StatusCode::NO_CONTENT
}

// ============================================================================
// Requests
// ============================================================================

/// POST /v1/requests
///
/// The caller's admitted connection is identified by the `x-connection-id`
/// header, never by the request body.
pub async fn submit_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<ToolRequest>,
) -> Result<Json<ToolResponse>, ApiError> {
    let connection_id = headers
        .get(CONNECTION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                "missing_connection_header",
                format!("{CONNECTION_HEADER} header is required"),
            )
        })?;
    request.connection_id = connection_id.to_string();

    let response = state.gateway.handle(request).await?;
    Ok(Json(response))
}

// ============================================================================
// Sessions & Diagnostics
// ============================================================================

#[derive(Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionRecord>,
}

/// GET /v1/sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<ListSessionsResponse> {
    Json(ListSessionsResponse {
        sessions: state.gateway.sessions().list(),
    })
}

/// GET /v1/diagnostics
pub async fn diagnostics(State(state): State<AppState>) -> Json<GatewayDiagnostics> {
    Json(state.gateway.diagnostics())
}

// ============================================================================
// Tests
// ============================================================================
