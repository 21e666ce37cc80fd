//! Session-bound CSRF tokens.
//!
//! Safe requests mint a fresh token into the session. Mutating requests must
//! echo the current token, which is rotated as soon as it validates so every
//! token is accepted at most once.

use super::random_token;
use crate::{clock::Clock, session::SessionRecord};
use axum::http::Method;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use subtle::ConstantTimeEq;

pub const CSRF_TOKEN_FIELD: &str = "csrfToken";
pub const CSRF_EXPIRES_FIELD: &str = "csrfExpires";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const DEFAULT_CSRF_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CsrfError {
    #[error("Session required")]
    NoSession,
    #[error("CSRF token missing")]
    Missing,
    #[error("CSRF token expired")]
    Expired,
    #[error("Invalid CSRF token")]
    Mismatch,
    #[error("failed to generate CSRF token: {0}")]
    TokenGeneration(String),
}

impl CsrfError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSession => "SESSION_REQUIRED",
            Self::Missing => "CSRF_TOKEN_MISSING",
            Self::Expired => "CSRF_TOKEN_EXPIRED",
            Self::Mismatch => "CSRF_TOKEN_INVALID",
            Self::TokenGeneration(_) => "CSRF_TOKEN_GENERATION_FAILED",
        }
    }

    /// Whether the request was refused, as opposed to the server failing.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::TokenGeneration(_))
    }
}

#[must_use]
pub fn is_safe_method(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS
}

#[derive(Debug, Clone)]
pub struct CsrfTokenManager {
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl CsrfTokenManager {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { clock, ttl }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a new token and its expiry in `session`, replacing any previous one.
    ///
    /// # Errors
    /// `CsrfError::TokenGeneration` if the OS random source fails.
    pub fn issue(&self, session: &mut SessionRecord) -> Result<String, CsrfError> {
        let token = random_token().map_err(|err| CsrfError::TokenGeneration(err.to_string()))?;
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let expires = self.clock.now_millis().saturating_add(ttl_ms);

        session.insert(CSRF_TOKEN_FIELD, token.clone());
        session.insert(CSRF_EXPIRES_FIELD, expires);
        Ok(token)
    }

    /// Check `submitted` against the session token and rotate it on success.
    ///
    /// Returns the replacement token.
    ///
    /// # Errors
    /// The first failed check, in order: no session, missing token, expired
    /// token (both fields are cleared), mismatch.
    pub fn validate(
        &self,
        session: Option<&mut SessionRecord>,
        submitted: Option<&str>,
    ) -> Result<String, CsrfError> {
        let session = session.ok_or(CsrfError::NoSession)?;

        let stored = session
            .get_str(CSRF_TOKEN_FIELD)
            .filter(|token| !token.is_empty())
            .map(str::to_owned);
        let submitted = submitted.filter(|token| !token.is_empty());
        let (Some(stored), Some(submitted)) = (stored, submitted) else {
            return Err(CsrfError::Missing);
        };

        let expires = session.get(CSRF_EXPIRES_FIELD).and_then(Value::as_i64);
        let expired = match expires {
            Some(expires) => self.clock.now_millis() > expires,
            None => true,
        };
        if expired {
            session.remove(CSRF_TOKEN_FIELD);
            session.remove(CSRF_EXPIRES_FIELD);
            return Err(CsrfError::Expired);
        }

        if !bool::from(stored.as_bytes().ct_eq(submitted.as_bytes())) {
            return Err(CsrfError::Mismatch);
        }

        self.issue(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager() -> (Arc<ManualClock>, CsrfTokenManager) {
        let clock = Arc::new(ManualClock::starting_at_epoch_secs(1_700_000_000));
        (clock.clone(), CsrfTokenManager::new(clock, DEFAULT_CSRF_TTL))
    }

    #[test]
    fn issue_stores_token_and_expiry() {
        let (_, csrf) = manager();
        let mut session = SessionRecord::default();
        let token = csrf.issue(&mut session).expect("token");

        assert_eq!(session.get_str(CSRF_TOKEN_FIELD), Some(token.as_str()));
        assert_eq!(
            session.get(CSRF_EXPIRES_FIELD).and_then(Value::as_i64),
            Some(1_700_000_000_000 + 30 * 60 * 1000)
        );

        let next = csrf.issue(&mut session).expect("token");
        assert_ne!(token, next);
    }

    #[test]
    fn valid_token_is_single_use() {
        let (_, csrf) = manager();
        let mut session = SessionRecord::default();
        let token = csrf.issue(&mut session).expect("token");

        let rotated = csrf
            .validate(Some(&mut session), Some(&token))
            .expect("first use succeeds");
        assert_ne!(rotated, token);
        assert_eq!(session.get_str(CSRF_TOKEN_FIELD), Some(rotated.as_str()));

        assert_eq!(
            csrf.validate(Some(&mut session), Some(&token)),
            Err(CsrfError::Mismatch)
        );
        assert!(csrf.validate(Some(&mut session), Some(&rotated)).is_ok());
    }

    #[test]
    fn expired_token_is_rejected_and_cleared() {
        let (clock, csrf) = manager();
        let mut session = SessionRecord::default();
        let token = csrf.issue(&mut session).expect("token");

        clock.advance(DEFAULT_CSRF_TTL);
        let still_valid = csrf
            .validate(Some(&mut session), Some(&token))
            .expect("valid at the expiry instant");

        clock.advance(DEFAULT_CSRF_TTL + Duration::from_millis(1));
        assert_eq!(
            csrf.validate(Some(&mut session), Some(&still_valid)),
            Err(CsrfError::Expired)
        );
        assert!(session.get(CSRF_TOKEN_FIELD).is_none());
        assert!(session.get(CSRF_EXPIRES_FIELD).is_none());

        assert_eq!(
            csrf.validate(Some(&mut session), Some(&still_valid)),
            Err(CsrfError::Missing)
        );
    }

    #[test]
    fn checks_run_in_order() {
        let (_, csrf) = manager();
        assert_eq!(csrf.validate(None, Some("x")), Err(CsrfError::NoSession));

        let mut session = SessionRecord::default();
        assert_eq!(
            csrf.validate(Some(&mut session), Some("x")),
            Err(CsrfError::Missing)
        );

        csrf.issue(&mut session).expect("token");
        assert_eq!(csrf.validate(Some(&mut session), None), Err(CsrfError::Missing));
        assert_eq!(
            csrf.validate(Some(&mut session), Some("")),
            Err(CsrfError::Missing)
        );

        session.remove(CSRF_EXPIRES_FIELD);
        assert_eq!(
            csrf.validate(Some(&mut session), Some("wrong")),
            Err(CsrfError::Expired)
        );
    }

    #[test]
    fn mismatch_keeps_the_current_token() {
        let (_, csrf) = manager();
        let mut session = SessionRecord::default();
        let token = csrf.issue(&mut session).expect("token");

        assert_eq!(
            csrf.validate(Some(&mut session), Some("forged")),
            Err(CsrfError::Mismatch)
        );
        assert_eq!(session.get_str(CSRF_TOKEN_FIELD), Some(token.as_str()));
    }

    #[test]
    fn error_codes() {
        assert_eq!(CsrfError::Missing.code(), "CSRF_TOKEN_MISSING");
        assert_eq!(CsrfError::Expired.code(), "CSRF_TOKEN_EXPIRED");
        assert_eq!(CsrfError::Mismatch.code(), "CSRF_TOKEN_INVALID");
        assert_eq!(CsrfError::NoSession.code(), "SESSION_REQUIRED");
        assert!(!CsrfError::TokenGeneration("rng".into()).is_rejection());
    }

    #[test]
    fn safe_methods() {
        assert!(is_safe_method(&Method::GET));
        assert!(is_safe_method(&Method::HEAD));
        assert!(is_safe_method(&Method::OPTIONS));
        assert!(!is_safe_method(&Method::POST));
        assert!(!is_safe_method(&Method::DELETE));
    }
}
