use super::{error_response, ErrorBody};
use crate::api::state::AppState;
use axum::{
    extract::Extension,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{error, warn};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct SessionCount {
    pub count: usize,
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let (Some(expected), Some(presented)) = (state.admin_token(), extract_bearer_token(headers))
    else {
        return false;
    };
    expected
        .expose_secret()
        .as_bytes()
        .ct_eq(presented.as_bytes())
        .into()
}

#[utoipa::path(
    get,
    path = "/v1/admin/sessions",
    responses(
        (status = 200, description = "Number of readable sessions", body = SessionCount),
        (status = 401, description = "Missing or wrong admin token", body = ErrorBody),
        (status = 429, description = "Too many attempts", body = super::RateLimitBody),
        (status = 500, description = "Session backend failure", body = ErrorBody)
    ),
    tag = "admin"
)]
pub async fn count_sessions(headers: HeaderMap, state: Extension<AppState>) -> Response {
    if !authorized(&state.0, &headers) {
        warn!("Rejected admin request with missing or invalid token");
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized", "UNAUTHORIZED");
    }

    match state.0.store().count().await {
        Ok(count) => Json(SessionCount { count }).into_response(),
        Err(err) => {
            error!("Failed to count sessions: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to count sessions",
                "SESSION_BACKEND_FAILED",
            )
        }
    }
}
