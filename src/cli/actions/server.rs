use crate::{
    api::{self, AppState, SessionConfig},
    clock::{Clock, SystemClock},
    crypto::{Environment, SessionKey},
    guard::{rate_limit::DEFAULT_SWEEP_INTERVAL, Limiters, RateLimitPolicy},
    session::{EncryptedSessionStore, MemoryBackend, PgSessionBackend, SessionBackend},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// How often expired rows are deleted from the session table.
const PRUNE_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub environment: Environment,
    pub key: Arc<SessionKey>,
    pub session_ttl: Duration,
    pub cookie_secure: bool,
    pub csrf_ttl: Duration,
    pub login_limit: RateLimitPolicy,
    pub admin_limit: RateLimitPolicy,
    pub upload_limit: RateLimitPolicy,
    pub admin_token: Option<SecretString>,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the session table cannot be reached or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let backend: Arc<dyn SessionBackend> = if let Some(dsn) = &args.dsn {
        let pg = Arc::new(
            PgSessionBackend::connect(dsn)
                .await
                .context("Failed to connect to the session database")?,
        );
        pg.ensure_schema().await?;
        pg.clone().spawn_pruner(PRUNE_INTERVAL);
        info!("Sessions stored in PostgreSQL");
        pg as Arc<dyn SessionBackend>
    } else {
        if args.environment == Environment::Production {
            warn!("No DSN configured, sessions are kept in memory and lost on restart");
        }
        let memory = Arc::new(MemoryBackend::new(clock.clone()));
        memory.clone().spawn_pruner(PRUNE_INTERVAL);
        memory as Arc<dyn SessionBackend>
    };

    let store: Arc<dyn SessionBackend> =
        Arc::new(EncryptedSessionStore::new(backend.clone(), args.key));

    let limiters = Limiters::new(args.login_limit, args.admin_limit, args.upload_limit, &clock);
    limiters.spawn_sweepers(DEFAULT_SWEEP_INTERVAL);

    let mut state = AppState::new(store, backend)
        .with_clock(clock)
        .with_limiters(limiters)
        .with_csrf_ttl(args.csrf_ttl)
        .with_session_config(
            SessionConfig::default()
                .with_ttl(args.session_ttl)
                .with_cookie_secure(args.cookie_secure),
        );
    if let Some(token) = args.admin_token {
        state = state.with_admin_token(token);
    }

    if !args.cookie_secure && args.environment == Environment::Production {
        warn!("Session cookie is not marked Secure");
    }

    api::serve(args.port, state).await
}
