pub mod admin;
pub mod health;
pub mod session;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Body of every non-2xx response.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub message: String,
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RateLimitBody {
    pub message: String,
    pub code: String,
    /// Seconds until the client may retry.
    #[serde(rename = "retryAfter")]
    pub retry_after: u64,
}

pub(crate) fn error_response(status: StatusCode, message: &str, code: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            message: message.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}
