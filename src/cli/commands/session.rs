use clap::{builder::BoolishValueParser, Arg, ArgMatches, Command};
use secrecy::SecretString;
use std::time::Duration;

pub const ARG_ENCRYPTION_KEY: &str = "encryption-key";
pub const ARG_SESSION_SECRET: &str = "session-secret";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_COOKIE_SECURE: &str = "cookie-secure";
pub const ARG_CSRF_TTL_SECONDS: &str = "csrf-ttl-seconds";

/// Key material and cookie settings.
#[derive(Debug)]
pub struct Options {
    pub encryption_key: Option<SecretString>,
    pub session_secret: Option<SecretString>,
    pub session_ttl: Duration,
    pub cookie_secure: bool,
    pub csrf_ttl: Duration,
}

impl Options {
    /// Parse session arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a TTL is zero.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        // clap passes through empty env vars as empty strings
        let get_secret = |id: &str| {
            matches
                .get_one::<String>(id)
                .filter(|v| !v.trim().is_empty())
                .map(|v| SecretString::from(v.clone()))
        };

        let seconds = |id: &str| -> anyhow::Result<Duration> {
            match matches.get_one::<u64>(id).copied() {
                Some(0) => anyhow::bail!("--{id} must be greater than zero"),
                Some(secs) => Ok(Duration::from_secs(secs)),
                None => anyhow::bail!("missing required argument: --{id}"),
            }
        };

        Ok(Self {
            encryption_key: get_secret(ARG_ENCRYPTION_KEY),
            session_secret: get_secret(ARG_SESSION_SECRET),
            session_ttl: seconds(ARG_SESSION_TTL_SECONDS)?,
            cookie_secure: matches.get_flag(ARG_COOKIE_SECURE),
            csrf_ttl: seconds(ARG_CSRF_TTL_SECONDS)?,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ENCRYPTION_KEY)
                .long(ARG_ENCRYPTION_KEY)
                .help("Session encryption key (base64 of 32 bytes, or any secret to hash)")
                .env("SEALED_SESSION_ENCRYPTION_KEY")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_SESSION_SECRET)
                .long(ARG_SESSION_SECRET)
                .help("Session secret, used for encryption when no encryption key is set")
                .env("SEALED_SESSION_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session cookie TTL in seconds")
                .env("SEALED_SESSION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_COOKIE_SECURE)
                .long(ARG_COOKIE_SECURE)
                .help("Mark the session cookie Secure and send HSTS")
                .env("SEALED_SESSION_COOKIE_SECURE")
                .action(clap::ArgAction::SetTrue)
                .value_parser(BoolishValueParser::new()),
        )
        .arg(
            Arg::new(ARG_CSRF_TTL_SECONDS)
                .long(ARG_CSRF_TTL_SECONDS)
                .help("CSRF token TTL in seconds")
                .env("SEALED_SESSION_CSRF_TTL_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(u64)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn command() -> Command {
        with_args(Command::new("test"))
    }

    const ENV: [(&str, Option<&str>); 5] = [
        ("SEALED_SESSION_ENCRYPTION_KEY", None),
        ("SEALED_SESSION_SECRET", None),
        ("SEALED_SESSION_TTL_SECONDS", None),
        ("SEALED_SESSION_COOKIE_SECURE", None),
        ("SEALED_SESSION_CSRF_TTL_SECONDS", None),
    ];

    #[test]
    fn defaults() {
        temp_env::with_vars(ENV, || {
            let matches = command().get_matches_from(["test"]);
            let options = Options::parse(&matches).expect("options");
            assert!(options.encryption_key.is_none());
            assert!(options.session_secret.is_none());
            assert_eq!(options.session_ttl, Duration::from_secs(86_400));
            assert!(!options.cookie_secure);
            assert_eq!(options.csrf_ttl, Duration::from_secs(1_800));
        });
    }

    #[test]
    fn empty_secret_counts_as_unset() {
        temp_env::with_vars(ENV, || {
            let matches =
                command().get_matches_from(["test", "--encryption-key", " ", "--session-secret", "s"]);
            let options = Options::parse(&matches).expect("options");
            assert!(options.encryption_key.is_none());
            assert_eq!(
                options.session_secret.as_ref().map(ExposeSecret::expose_secret),
                Some("s")
            );
        });
    }

    #[test]
    fn cookie_secure_from_env() {
        temp_env::with_vars(
            [
                ("SEALED_SESSION_COOKIE_SECURE", Some("true")),
                ("SEALED_SESSION_TTL_SECONDS", Some("60")),
            ],
            || {
                let matches = command().get_matches_from(["test"]);
                let options = Options::parse(&matches).expect("options");
                assert!(options.cookie_secure);
                assert_eq!(options.session_ttl, Duration::from_secs(60));
            },
        );
    }

    #[test]
    fn zero_ttl_is_rejected() {
        temp_env::with_vars(ENV, || {
            let matches = command().get_matches_from(["test", "--csrf-ttl-seconds", "0"]);
            let err = Options::parse(&matches).expect_err("zero ttl");
            assert!(err.to_string().contains("--csrf-ttl-seconds"));
        });
    }
}
