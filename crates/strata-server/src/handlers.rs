use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use uuid::Uuid;

use crate::models::CreateUserRequest;
use crate::server::AppState;
use crate::service::{ServiceError, source_label};

/// Error returned by API handlers.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed request (400).
    BadRequest(String),
    Service(ServiceError),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self::Service(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            Self::Service(err) => {
                let (status, code) = match err {
                    ServiceError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid"),
                    ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                    ServiceError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
                    e if e.is_unavailable() => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
                };
                (status, code, err.to_string())
            }
        };

        if status.is_server_error() {
            tracing::error!(status = %status.as_u16(), error = %message, "request failed");
        }

        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let ctx = state.service.request_context();
    let report = state.service.health(&ctx).await;
    let status = if report.status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

pub async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let ctx = state.service.request_context();
    let user = state.service.create_user(&ctx, req).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "User created successfully", "user": user })),
    ))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::BadRequest(format!("invalid user id: {id}")))?;
    let ctx = state.service.request_context();
    let resolved = state.service.get_user(&ctx, id).await?;
    Ok((
        StatusCode::OK,
        Json(json!({ "user": resolved.value, "source": source_label(resolved.source) })),
    ))
}

pub async fn cache_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.service.cache().metrics();
    let overall = report.overall_hit_rate();
    (
        StatusCode::OK,
        Json(json!({ "tiers": report.tiers, "overall_hit_rate": overall })),
    )
}

/// Prometheus text exposition.
pub async fn metrics() -> Response {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
