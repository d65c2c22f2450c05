//! Tracing subscriber setup
//!
//! | ENV     | format | level |
//! |---------|--------|-------|
//! | local   | pretty | debug |
//! | dev     | json   | debug |
//! | prod    | json   | info  |
//! | other   | json   | info  |
//!
//! `RUST_LOG` overrides the level when set.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

use crate::config::Environment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Output format and default level for an environment
pub fn settings_for(env: &Environment) -> (LogFormat, &'static str) {
    match env {
        Environment::Local => (LogFormat::Pretty, "debug"),
        Environment::Dev => (LogFormat::Json, "debug"),
        Environment::Prod | Environment::Other(_) => (LogFormat::Json, "info"),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(env: &Environment) -> Result<()> {
    let (format, level) = settings_for(env);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    }
    .map_err(|err| anyhow!(err))
}
