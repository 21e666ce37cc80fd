use super::handlers::{admin, health, session};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

/// Routes that need no session.
pub(crate) fn health_routes() -> OpenApiRouter {
    OpenApiRouter::new().routes(routes!(health::health))
}

/// Session reads: CSRF token issued, no rate limit.
pub(crate) fn session_read_routes() -> OpenApiRouter {
    OpenApiRouter::new().routes(routes!(session::get_session))
}

/// Session writes: login limiter and CSRF validation.
pub(crate) fn session_write_routes() -> OpenApiRouter {
    OpenApiRouter::new().routes(routes!(session::put_session, session::delete_session))
}

/// Admin routes: admin limiter and bearer token.
pub(crate) fn admin_routes() -> OpenApiRouter {
    OpenApiRouter::new().routes(routes!(admin::count_sessions))
}

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let router = OpenApiRouter::with_openapi(cargo_openapi())
        .merge(health_routes())
        .merge(session_read_routes())
        .merge(session_write_routes())
        .merge(admin_routes());
    let (_router, mut openapi) = router.split_for_parts();

    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Service and backend status".to_string());

    let mut session_tag = Tag::new("session");
    session_tag.description = Some("Encrypted session, CSRF token lifecycle".to_string());

    let mut admin_tag = Tag::new("admin");
    admin_tag.description = Some("Session administration, enabled by an admin token".to_string());

    openapi.tags = Some(vec![health_tag, session_tag, admin_tag]);
    openapi
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(':').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = Some(primary.to_string());
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let doc = openapi();
        assert_eq!(doc.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(doc.info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(
            doc.info.contact.and_then(|contact| contact.name).as_deref(),
            Some("Sealed Session Developers")
        );
        assert_eq!(
            doc.info.license.map(|license| license.name).as_deref(),
            Some("BSD-3-Clause")
        );
    }

    #[test]
    fn openapi_documents_every_route() {
        let doc = openapi();
        for path in ["/health", "/v1/session", "/v1/admin/sessions"] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
        let session = &doc.paths.paths["/v1/session"];
        assert!(session.get.is_some());
        assert!(session.put.is_some());
        assert!(session.delete.is_some());
    }
}
