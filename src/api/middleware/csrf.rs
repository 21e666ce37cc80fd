use super::{internal_error, session::Session};
use crate::{
    api::{handlers::error_response, state::AppState},
    guard::csrf::{is_safe_method, CsrfError, CSRF_HEADER, CSRF_TOKEN_FIELD},
};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use serde_json::Value;
use tracing::{error, warn};

/// Largest body buffered while looking for a token field.
const MAX_TOKEN_BODY_BYTES: usize = 64 * 1024;

fn reject(err: &CsrfError) -> Response {
    if err.is_rejection() {
        warn!(code = err.code(), "Rejected request: {err}");
        error_response(StatusCode::FORBIDDEN, &err.to_string(), err.code())
    } else {
        error!("{err}");
        internal_error("Failed to generate CSRF token", err.code())
    }
}

fn with_token_header(mut response: Response, token: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(token) {
        response.headers_mut().insert(CSRF_HEADER, value);
    }
    response
}

/// Token from the request header, else from a JSON body field.
///
/// The body is buffered and put back so the handler can still read it.
async fn submitted_token(request: Request) -> Result<(Request, Option<String>), Response> {
    let from_header = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    if from_header.is_some() {
        return Ok((request, from_header));
    }

    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_TOKEN_BODY_BYTES).await.map_err(|err| {
        warn!("Failed to read request body: {err}");
        error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body too large",
            "PAYLOAD_TOO_LARGE",
        )
    })?;
    let from_body = serde_json::from_slice::<Value>(&bytes).ok().and_then(|body| {
        body.get(CSRF_TOKEN_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    Ok((Request::from_parts(parts, Body::from(bytes)), from_body))
}

/// Issue a token on safe requests, validate and rotate it on the rest.
pub(crate) async fn csrf_layer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(session) = request.extensions().get::<Session>().cloned() else {
        return reject(&CsrfError::NoSession);
    };

    if is_safe_method(request.method()) {
        return match session.update(|record| state.csrf().issue(record)) {
            Ok(token) => with_token_header(next.run(request).await, &token),
            Err(err) => reject(&err),
        };
    }

    let (request, submitted) = match submitted_token(request).await {
        Ok(found) => found,
        Err(response) => return response,
    };

    let validated = if session.is_new() {
        state.csrf().validate(None, submitted.as_deref())
    } else {
        session.update(|record| state.csrf().validate(Some(record), submitted.as_deref()))
    };

    match validated {
        Ok(token) => with_token_header(next.run(request).await, &token),
        Err(err) => reject(&err),
    }
}
