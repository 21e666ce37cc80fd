use crate::{
    clock::{Clock, SystemClock},
    guard::{csrf::DEFAULT_CSRF_TTL, CsrfTokenManager, Limiters},
    session::SessionBackend,
};
use secrecy::SecretString;
use std::{sync::Arc, time::Duration};

pub const SESSION_COOKIE_NAME: &str = "sealed_session";
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Session cookie attributes.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    ttl: Duration,
    cookie_secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_SESSION_TTL,
            cookie_secure: false,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }
}

/// Everything the pipeline needs, shared by every request.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn SessionBackend>,
    backend: Arc<dyn SessionBackend>,
    csrf: Arc<CsrfTokenManager>,
    limiters: Limiters,
    session: SessionConfig,
    admin_token: Option<Arc<SecretString>>,
    clock: Arc<dyn Clock>,
}

impl AppState {
    /// `store` serves requests; `backend` is the raw storage it wraps, used
    /// for health checks.
    #[must_use]
    pub fn new(store: Arc<dyn SessionBackend>, backend: Arc<dyn SessionBackend>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            store,
            backend,
            csrf: Arc::new(CsrfTokenManager::new(clock.clone(), DEFAULT_CSRF_TTL)),
            limiters: Limiters::with_defaults(&clock),
            session: SessionConfig::default(),
            admin_token: None,
            clock,
        }
    }

    /// Replace the clock, rebuilding the CSRF manager around it.
    ///
    /// Call before [`Self::with_limiters`]; limiters keep the clock they were
    /// built with.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.csrf = Arc::new(CsrfTokenManager::new(clock.clone(), self.csrf.ttl()));
        self.limiters = Limiters::new(
            self.limiters.login.policy(),
            self.limiters.admin.policy(),
            self.limiters.upload.policy(),
            &clock,
        );
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_csrf_ttl(mut self, ttl: Duration) -> Self {
        self.csrf = Arc::new(CsrfTokenManager::new(self.clock.clone(), ttl));
        self
    }

    #[must_use]
    pub fn with_limiters(mut self, limiters: Limiters) -> Self {
        self.limiters = limiters;
        self
    }

    #[must_use]
    pub fn with_session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Enable the admin routes, guarded by this bearer token.
    #[must_use]
    pub fn with_admin_token(mut self, token: SecretString) -> Self {
        self.admin_token = Some(Arc::new(token));
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionBackend> {
        &self.store
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn SessionBackend> {
        &self.backend
    }

    #[must_use]
    pub fn csrf(&self) -> &CsrfTokenManager {
        &self.csrf
    }

    #[must_use]
    pub fn limiters(&self) -> &Limiters {
        &self.limiters
    }

    #[must_use]
    pub fn session_config(&self) -> &SessionConfig {
        &self.session
    }

    #[must_use]
    pub fn admin_token(&self) -> Option<&SecretString> {
        self.admin_token.as_deref()
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
