//! HTTP surface hosting the session pipeline.

use anyhow::Result;
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{header, HeaderName, HeaderValue, Request},
    middleware::from_fn_with_state,
    response::Json,
    routing::{get, options},
    Extension, Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer,
    set_header::{SetRequestHeaderLayer, SetResponseHeaderLayer},
    trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;

pub mod handlers;
mod middleware;
mod openapi;
pub mod state;

pub use middleware::{rate_limited, Session};
pub use openapi::openapi;
pub use state::{AppState, SessionConfig};

/// Response headers set on every response unless a handler chose its own.
const SECURITY_HEADERS: [(&str, &str); 6] = [
    ("x-frame-options", "DENY"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    (
        "permissions-policy",
        "camera=(), microphone=(), geolocation=(), payment=(), usb=()",
    ),
    (
        "content-security-policy",
        "default-src 'self'; frame-ancestors 'none'; base-uri 'self'",
    ),
];

const HSTS: &str = "max-age=31536000; includeSubDomains; preload";

/// Session read, then CSRF, then the handler.
fn with_session(router: Router, state: &AppState) -> Router {
    router
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::csrf::csrf_layer,
        ))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::session::session_layer,
        ))
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(openapi())
}

/// Build the full application router.
#[must_use]
pub fn router(state: AppState) -> Router {
    let (health_routes, _) = openapi::health_routes().split_for_parts();
    let (read_routes, _) = openapi::session_read_routes().split_for_parts();
    let (write_routes, _) = openapi::session_write_routes().split_for_parts();

    let write_routes = rate_limited(
        with_session(write_routes, &state),
        state.limiters().login.clone(),
        "login",
    );

    let mut app = health_routes
        .route("/health", options(handlers::health::health))
        .route("/openapi.json", get(openapi_json))
        .merge(with_session(read_routes, &state))
        .merge(write_routes);

    if state.admin_token().is_some() {
        let (admin_routes, _) = openapi::admin_routes().split_for_parts();
        app = app.merge(rate_limited(
            admin_routes,
            state.limiters().admin.clone(),
            "admin",
        ));
    } else {
        info!("No admin token configured, admin routes disabled");
    }

    for (name, value) in SECURITY_HEADERS {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        ));
    }
    if state.session_config().cookie_secure() {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(HSTS),
        ));
    }

    app.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(Extension(state)),
    )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn serve(port: u16, state: AppState) -> Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
    }
    info!("Gracefully shutdown");
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
