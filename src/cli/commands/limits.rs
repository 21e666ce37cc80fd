use crate::guard::RateLimitPolicy;
use clap::{Arg, ArgMatches, Command};

pub const ARG_LOGIN_LIMIT: &str = "login-limit";
pub const ARG_ADMIN_LIMIT: &str = "admin-limit";
pub const ARG_UPLOAD_LIMIT: &str = "upload-limit";

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub login: RateLimitPolicy,
    pub admin: RateLimitPolicy,
    pub upload: RateLimitPolicy,
}

impl Options {
    /// Parse limiter policies from matches.
    ///
    /// # Errors
    /// Returns an error if a policy is missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let policy = |id: &str| -> anyhow::Result<RateLimitPolicy> {
            matches
                .get_one::<RateLimitPolicy>(id)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))
        };

        Ok(Self {
            login: policy(ARG_LOGIN_LIMIT)?,
            admin: policy(ARG_ADMIN_LIMIT)?,
            upload: policy(ARG_UPLOAD_LIMIT)?,
        })
    }
}

fn limit_arg(id: &'static str, env: &'static str, default: &'static str, what: &str) -> Arg {
    Arg::new(id)
        .long(id)
        .help(format!(
            "{what} limit as max_attempts/window_seconds/block_seconds"
        ))
        .env(env)
        .default_value(default)
        .value_parser(clap::value_parser!(RateLimitPolicy))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(limit_arg(
            ARG_LOGIN_LIMIT,
            "SEALED_SESSION_LOGIN_LIMIT",
            "5/900/3600",
            "Session write",
        ))
        .arg(limit_arg(
            ARG_ADMIN_LIMIT,
            "SEALED_SESSION_ADMIN_LIMIT",
            "10/600/1800",
            "Admin route",
        ))
        .arg(limit_arg(
            ARG_UPLOAD_LIMIT,
            "SEALED_SESSION_UPLOAD_LIMIT",
            "20/60/300",
            "Upload route",
        ))
}
