//! Session endpoints.
//!
//! These only host the pipeline: they read and write arbitrary payload fields
//! and never authenticate anyone.

use super::{error_response, ErrorBody};
use crate::{
    api::middleware::Session,
    guard::csrf::{CSRF_EXPIRES_FIELD, CSRF_TOKEN_FIELD},
    session::record::{ENCRYPTED_MARKER, SEALED_PAYLOAD_FIELD},
};
use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Keys a client may not write into its own session.
const RESERVED_KEYS: [&str; 5] = [
    "cookie",
    ENCRYPTED_MARKER,
    SEALED_PAYLOAD_FIELD,
    CSRF_TOKEN_FIELD,
    CSRF_EXPIRES_FIELD,
];

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    /// Token to echo on the next mutating request.
    pub csrf_token: Option<String>,
    pub is_new: bool,
}

impl SessionView {
    fn of(session: &Session) -> Self {
        Self {
            csrf_token: session.read(|record| record.get_str(CSRF_TOKEN_FIELD).map(str::to_string)),
            is_new: session.is_new(),
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/session",
    responses(
        (status = 200, description = "Current session with a fresh CSRF token", body = SessionView),
        (status = 500, description = "Session could not be loaded or saved", body = ErrorBody)
    ),
    tag = "session"
)]
pub async fn get_session(Extension(session): Extension<Session>) -> Json<SessionView> {
    Json(SessionView::of(&session))
}

#[utoipa::path(
    put,
    path = "/v1/session",
    request_body(content = Value, description = "Fields merged into the session payload"),
    params(
        ("x-csrf-token" = Option<String>, Header, description = "Current CSRF token, unless sent as `csrfToken` in the body")
    ),
    responses(
        (status = 200, description = "Session updated, CSRF token rotated", body = SessionView),
        (status = 400, description = "Body is not an object or writes a reserved key", body = ErrorBody),
        (status = 403, description = "CSRF validation failed", body = ErrorBody),
        (status = 429, description = "Too many attempts", body = super::RateLimitBody)
    ),
    tag = "session"
)]
pub async fn put_session(
    Extension(session): Extension<Session>,
    Json(body): Json<Value>,
) -> Response {
    let Value::Object(mut fields) = body else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Session data must be a JSON object",
            "INVALID_SESSION_DATA",
        );
    };

    // Transport field for the CSRF token, already consumed by validation.
    fields.remove(CSRF_TOKEN_FIELD);

    if let Some(key) = fields.keys().find(|key| RESERVED_KEYS.contains(&key.as_str())) {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("Session key '{key}' is reserved"),
            "RESERVED_KEY",
        );
    }

    session.update(|record| record.payload.extend(fields));
    Json(SessionView::of(&session)).into_response()
}

#[utoipa::path(
    delete,
    path = "/v1/session",
    params(
        ("x-csrf-token" = Option<String>, Header, description = "Current CSRF token")
    ),
    responses(
        (status = 204, description = "Session destroyed and cookie cleared"),
        (status = 403, description = "CSRF validation failed", body = ErrorBody),
        (status = 429, description = "Too many attempts", body = super::RateLimitBody)
    ),
    tag = "session"
)]
pub async fn delete_session(Extension(session): Extension<Session>) -> StatusCode {
    session.destroy();
    StatusCode::NO_CONTENT
}
