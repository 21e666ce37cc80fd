use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_ADMIN_TOKEN: &str = "admin-token";

/// Bearer token for the admin routes; `None` leaves them unmounted.
#[must_use]
pub fn parse(matches: &ArgMatches) -> Option<SecretString> {
    matches
        .get_one::<String>(ARG_ADMIN_TOKEN)
        .filter(|v| !v.trim().is_empty())
        .map(|v| SecretString::from(v.trim().to_string()))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_ADMIN_TOKEN)
            .long(ARG_ADMIN_TOKEN)
            .help("Bearer token for the admin routes (admin routes are disabled when unset)")
            .env("SEALED_SESSION_ADMIN_TOKEN")
            .hide_env_values(true),
    )
}
