//! Request pipeline layers: rate limit, then session load/save, then CSRF.

pub(crate) mod csrf;
pub(crate) mod rate_limit;
pub(crate) mod session;

pub use rate_limit::rate_limited;
pub use session::Session;

use super::handlers::error_response;
use axum::{http::StatusCode, response::Response};

fn internal_error(message: &str, code: &str) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message, code)
}
