//! Map validated CLI arguments to an action.
//!
//! The session key is resolved here, once, and handed to the action behind an
//! `Arc`.

use crate::cli::actions::{
    server::Args,
    sessions::{self, SessionsCommand},
    Action,
};
use crate::cli::commands::{
    self, admin, limits, session, ARG_DSN, ARG_ENVIRONMENT, ARG_PORT, CMD_CLEAR, CMD_COUNT,
    CMD_LIST, CMD_PRUNE, CMD_SESSIONS,
};
use crate::crypto::{resolve_key, Environment, KeySource, SessionKey};
use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use std::sync::Arc;
use tracing::{debug, info};

fn non_empty(matches: &ArgMatches, id: &str) -> Option<String> {
    matches
        .get_one::<String>(id)
        .filter(|v| !v.trim().is_empty())
        .cloned()
}

fn session_key(
    options: &session::Options,
    environment: Environment,
) -> Result<Arc<SessionKey>> {
    let (key, source) = resolve_key(
        options.encryption_key.as_ref(),
        options.session_secret.as_ref(),
        environment,
    )
    .context("Failed to resolve the session encryption key")?;

    match source {
        KeySource::EncryptionKey => debug!("Using the configured encryption key"),
        KeySource::SessionSecret => info!("Encryption key derived from the session secret"),
        KeySource::DevelopmentFallback => info!("Using the development encryption key"),
    }

    Ok(Arc::new(key))
}

fn sessions_action(root: &ArgMatches, matches: &ArgMatches) -> Result<Action> {
    let command = match matches.subcommand_name() {
        Some(CMD_COUNT) => SessionsCommand::Count,
        Some(CMD_LIST) => SessionsCommand::List,
        Some(CMD_CLEAR) => SessionsCommand::Clear,
        Some(CMD_PRUNE) => SessionsCommand::Prune,
        other => return Err(anyhow!("unknown sessions command: {other:?}")),
    };

    let dsn = non_empty(matches, ARG_DSN)
        .or_else(|| non_empty(root, ARG_DSN))
        .context("missing required argument: --dsn")?;

    let environment = matches
        .get_one::<Environment>(ARG_ENVIRONMENT)
        .copied()
        .unwrap_or_default();
    let key = session_key(&session::Options::parse(root)?, environment)?;

    Ok(Action::Sessions(sessions::Args { dsn, key, command }))
}

/// Map validated CLI matches to an action.
///
/// # Errors
/// Returns an error if required arguments are missing or no session key can be resolved.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    if let Some((CMD_SESSIONS, sub)) = matches.subcommand() {
        return sessions_action(matches, sub);
    }

    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = non_empty(matches, ARG_DSN);
    let environment = matches
        .get_one::<Environment>(ARG_ENVIRONMENT)
        .copied()
        .unwrap_or_default();

    let session_opts = session::Options::parse(matches)?;
    let limit_opts = limits::Options::parse(matches)?;
    let key = session_key(&session_opts, environment)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        environment,
        key,
        session_ttl: session_opts.session_ttl,
        cookie_secure: session_opts.cookie_secure,
        csrf_ttl: session_opts.csrf_ttl,
        login_limit: limit_opts.login,
        admin_limit: limit_opts.admin,
        upload_limit: limit_opts.upload,
        admin_token: admin::parse(matches),
    }))
}

/// Parse `args` and map them, for callers that do not go through `start`.
///
/// # Errors
/// Returns an error on invalid arguments or when dispatch fails.
pub fn handler_from<I, T>(args: I) -> Result<Action>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = commands::new().try_get_matches_from(args)?;
    handler(&matches)
}
