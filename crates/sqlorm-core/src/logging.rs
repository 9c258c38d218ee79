//! Logging setup.
//!
//! Library code only emits [`tracing`] events; installing a subscriber is up
//! to the application. [`setup_logging`] installs the usual one, driven by
//! [`Settings`](crate::settings::Settings).

use crate::settings::Settings;

/// Installs a global tracing subscriber.
///
/// The filter comes from `settings.log_level` (any `EnvFilter` directive,
/// falling back to `info`). Debug mode logs in a pretty, human-readable
/// format with source locations; otherwise events are emitted as JSON.
/// Does nothing if a subscriber is already installed.
pub fn setup_logging(settings: &Settings) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.debug {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .try_init()
            .ok();
    } else {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .ok();
    }
}

/// Installs a compact subscriber writing to stderr, for command-line use.
/// `SQLORM_LOG_LEVEL` wins over the verbosity when set.
pub fn setup_cli_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = std::env::var("SQLORM_LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new(level_for_verbosity(verbosity)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .ok();
}

/// Maps a CLI verbosity (0, 1, 2) to a log filter.
pub const fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

/// A span grouping the events of one management command.
pub fn command_span(command: &str) -> tracing::Span {
    tracing::info_span!("command", name = command)
}
