//! Session load/save around each request.
//!
//! The session is read through the encrypted store before the handler runs and
//! written back afterwards: saved when modified, touched when merely used,
//! removed when destroyed. Fresh sessions that nothing wrote to are never
//! stored and get no cookie.

use super::internal_error;
use crate::{
    api::state::{AppState, SessionConfig, SESSION_COOKIE_NAME},
    guard::random_token,
    session::{CookieMetadata, SessionError, SessionRecord},
};
use axum::{
    extract::{Request, State},
    http::{
        header::{COOKIE, SET_COOKIE},
        HeaderMap, HeaderValue,
    },
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::error;

#[derive(Debug)]
struct SessionState {
    id: String,
    record: SessionRecord,
    is_new: bool,
    modified: bool,
    destroyed: bool,
}

/// Request-scoped handle on the current session, stored in request extensions.
#[derive(Debug, Clone)]
pub struct Session(Arc<Mutex<SessionState>>);

impl Session {
    fn new(id: String, record: SessionRecord, is_new: bool) -> Self {
        Self(Arc::new(Mutex::new(SessionState {
            id,
            record,
            is_new,
            modified: false,
            destroyed: false,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True when the request did not present a live session.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.lock().is_new
    }

    pub fn read<R>(&self, f: impl FnOnce(&SessionRecord) -> R) -> R {
        f(&self.lock().record)
    }

    /// Mutate the record; the session is saved after the handler returns.
    pub fn update<R>(&self, f: impl FnOnce(&mut SessionRecord) -> R) -> R {
        let mut state = self.lock();
        state.modified = true;
        f(&mut state.record)
    }

    pub fn destroy(&self) {
        self.lock().destroyed = true;
    }
}

/// Value of the session cookie, if the request carries one.
pub(crate) fn session_cookie_value(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(COOKIE)?.to_str().ok()?;
    value.split(';').find_map(|pair| {
        let (key, val) = pair.trim().split_once('=')?;
        (key.trim() == SESSION_COOKIE_NAME && !val.trim().is_empty())
            .then(|| val.trim().to_string())
    })
}

fn session_cookie(config: &SessionConfig, sid: &str) -> Option<HeaderValue> {
    let ttl_seconds = config.ttl().as_secs();
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={sid}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
    );
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).ok()
}

fn clear_session_cookie(config: &SessionConfig) -> HeaderValue {
    let cookie = if config.cookie_secure() {
        format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0; Secure")
    } else {
        format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
    };
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static("sealed_session="))
}

pub(crate) async fn session_layer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let presented = session_cookie_value(request.headers());

    let loaded = match presented {
        Some(sid) => match state.store().get(&sid).await {
            Ok(record) => record.map(|record| (sid, record)),
            Err(err) => {
                error!("Failed to load session: {err}");
                return internal_error("Failed to load session", "SESSION_LOAD_FAILED");
            }
        },
        None => None,
    };

    let session = match loaded {
        Some((sid, record)) => Session::new(sid, record, false),
        None => match random_token() {
            Ok(sid) => {
                let now = DateTime::<Utc>::from(state.clock().now());
                let cookie = CookieMetadata::expiring_in(now, state.session_config().ttl());
                Session::new(sid, SessionRecord::new(cookie), true)
            }
            Err(err) => {
                error!("Failed to generate session id: {err}");
                return internal_error("Failed to create session", "SESSION_CREATE_FAILED");
            }
        },
    };

    request.extensions_mut().insert(session.clone());
    let mut response = next.run(request).await;

    if let Err(err) = persist(&state, &session, &mut response).await {
        error!("Failed to save session: {err}");
        return internal_error("Failed to save session", "SESSION_SAVE_FAILED");
    }
    response
}

async fn persist(
    state: &AppState,
    session: &Session,
    response: &mut Response,
) -> Result<(), SessionError> {
    let (sid, mut record, is_new, modified, destroyed) = {
        let current = session.lock();
        (
            current.id.clone(),
            current.record.clone(),
            current.is_new,
            current.modified,
            current.destroyed,
        )
    };
    let config = state.session_config();

    if destroyed {
        if !is_new {
            state.store().destroy(&sid).await?;
        }
        response
            .headers_mut()
            .append(SET_COOKIE, clear_session_cookie(config));
        return Ok(());
    }

    if !modified && is_new {
        return Ok(());
    }

    let now = DateTime::<Utc>::from(state.clock().now());
    record.cookie.refresh(now, config.ttl());
    if modified {
        state.store().set(&sid, &record, config.ttl()).await?;
    } else {
        state.store().touch(&sid, &record, config.ttl()).await?;
    }

    if let Some(cookie) = session_cookie(config, &sid) {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    Ok(())
}
