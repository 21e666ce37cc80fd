pub mod admin;
pub mod limits;
pub mod logging;
pub mod session;

use crate::crypto::Environment;
use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

pub const ARG_PORT: &str = "port";
pub const ARG_DSN: &str = "dsn";
pub const ARG_ENVIRONMENT: &str = "environment";

pub const CMD_SESSIONS: &str = "sessions";
pub const CMD_COUNT: &str = "count";
pub const CMD_LIST: &str = "list";
pub const CMD_CLEAR: &str = "clear";
pub const CMD_PRUNE: &str = "prune";

fn sessions_command() -> Command {
    Command::new(CMD_SESSIONS)
        .about("Inspect and maintain the session table (requires --dsn)")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(Command::new(CMD_COUNT).about("Count readable sessions"))
        .subcommand(
            Command::new(CMD_LIST).about("List session ids with expiry and payload keys"),
        )
        .subcommand(Command::new(CMD_CLEAR).about("Delete every session"))
        .subcommand(Command::new(CMD_PRUNE).about("Delete expired sessions"))
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("sealed-session")
        .about("Encrypted session storage with CSRF and rate limiting")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("SEALED_SESSION_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string")
                .long_help(
                    "PostgreSQL connection string for the session table. Without it sessions are kept in memory.",
                )
                .env("SEALED_SESSION_DSN")
                .global(true),
        )
        .arg(
            Arg::new(ARG_ENVIRONMENT)
                .long(ARG_ENVIRONMENT)
                .help("Deployment environment: development or production")
                .env("SEALED_SESSION_ENV")
                .default_value("production")
                .global(true)
                .value_parser(clap::value_parser!(Environment)),
        )
        .subcommand(sessions_command());

    let command = session::with_args(command);
    let command = limits::with_args(command);
    let command = admin::with_args(command);
    logging::with_args(command)
}
