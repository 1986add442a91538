use std::env;

use tracing::warn;
use tracing_subscriber::{EnvFilter, filter::ParseError, fmt};

/// Overrides `--log` when set, so units and wrappers can turn up verbosity.
pub const LOG_ENV: &str = "HOSTMAN_LOG";

const FALLBACK_LEVEL: &str = "info";

/// Directives from `$HOSTMAN_LOG` if non-empty, else the `--log` flag.
pub fn directives(flag: &str, env_value: Option<String>) -> String {
    env_value
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| flag.to_owned())
}

pub fn filter(directives: &str) -> Result<EnvFilter, ParseError> {
    EnvFilter::try_new(directives)
}

/// Logs go to stderr; stdout carries command results (pids, scripts, JSON).
pub fn install(flag: &str) {
    let directives = directives(flag, env::var(LOG_ENV).ok());
    let (env_filter, invalid) = match filter(&directives) {
        Ok(env_filter) => (env_filter, None),
        Err(err) => (EnvFilter::new(FALLBACK_LEVEL), Some(err)),
    };
    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();
    if let Some(err) = invalid {
        warn!(%directives, "invalid log filter, falling back to {FALLBACK_LEVEL}: {err}");
    }
}
