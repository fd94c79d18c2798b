//! Environment-driven log configuration.
//!
//! The library itself only emits [`tracing`] events; embedders are free to
//! install any subscriber. [`init`] offers the stock setup:
//!
//! * `LIBSSHA_LOG_LEVEL` — verbosity, matched on the first three letters
//!   (case-insensitive) of `ERROR`, `WARNING`, `INFO`, `TRACE`, `DEBUG` or
//!   `VDEBUG`. Defaults to `INFO`.
//! * `LIBSSHA_LOG_COLORS` — `0` disables ANSI colouring.

use tracing_subscriber::filter::LevelFilter;

/// Map a `LIBSSHA_LOG_LEVEL` value to a subscriber level.
///
/// The six named tiers fold onto the subscriber's five: `TRACE` and
/// `DEBUG` both land on DEBUG, the extra-verbose `VDEBUG` on TRACE.
fn level_from_env(value: Option<&str>) -> LevelFilter {
    let Some(value) = value else {
        return LevelFilter::INFO;
    };
    let prefix: String = value.chars().take(3).collect::<String>().to_uppercase();
    match prefix.as_str() {
        "ERR" => LevelFilter::ERROR,
        "WAR" => LevelFilter::WARN,
        "INF" => LevelFilter::INFO,
        "TRA" | "DEB" => LevelFilter::DEBUG,
        "VDE" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    }
}

/// Install a formatting subscriber configured from the environment.
///
/// Does nothing if a global subscriber is already set, so it is safe to
/// call from examples and tests alike.
pub fn init() {
    let colors = std::env::var("LIBSSHA_LOG_COLORS")
        .map(|v| v != "0")
        .unwrap_or(true);
    let level = level_from_env(std::env::var("LIBSSHA_LOG_LEVEL").ok().as_deref());

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(colors)
        .with_writer(std::io::stderr)
        .try_init();
}
