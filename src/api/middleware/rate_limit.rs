use super::session::session_cookie_value;
use crate::{
    api::handlers::RateLimitBody,
    guard::{RateLimitError, RateLimiter},
};
use axum::{
    extract::{Request, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    Router,
};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
    operation: &'static str,
}

/// Put `limiter` in front of every route of `router`.
///
/// `operation` names the endpoint class in logs.
pub fn rate_limited<S>(router: Router<S>, limiter: Arc<RateLimiter>, operation: &'static str) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(middleware::from_fn_with_state(
        RateLimitGuard { limiter, operation },
        enforce_rate_limit,
    ))
}

pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Identity attempts are counted against: the presented session id, else the
/// client address, else a shared bucket.
pub(crate) fn client_id(headers: &HeaderMap) -> String {
    session_cookie_value(headers)
        .or_else(|| extract_client_ip(headers))
        .unwrap_or_else(|| "unknown".to_string())
}

fn too_many_requests(err: &RateLimitError) -> Response {
    let retry_after = err.retry_after_secs();
    let body = RateLimitBody {
        message: err.to_string(),
        code: err.code().to_string(),
        retry_after,
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

async fn enforce_rate_limit(
    State(guard): State<RateLimitGuard>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_id(request.headers());
    match guard.limiter.check(&client) {
        Ok(()) => next.run(request).await,
        Err(err) => {
            let attempts = guard.limiter.status(&client).map(|status| status.attempts);
            warn!(
                operation = guard.operation,
                code = err.code(),
                attempts,
                retry_after = err.retry_after_secs(),
                "Rate limit rejected request"
            );
            too_many_requests(&err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn extract_client_ip_prefers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("1.2.3.4".to_string()));
    }

    #[test]
    fn extract_client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("9.9.9.9".to_string()));
    }

    #[test]
    fn client_id_prefers_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_id(&headers), "9.9.9.9");

        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("sealed_session=sid-1"),
        );
        assert_eq!(client_id(&headers), "sid-1");

        assert_eq!(client_id(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn rejection_carries_retry_after() {
        let err = RateLimitError::Exceeded {
            retry_after: Duration::from_secs(3600),
        };
        let response = too_many_requests(&err);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER),
            Some(&HeaderValue::from_static("3600"))
        );
    }
}
