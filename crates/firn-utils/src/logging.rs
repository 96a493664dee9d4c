//! `tracing` subscriber bootstrap.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How the node formats its log stream.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive, e.g. `"info"` or `"firn_snow=debug"`.
    pub filter: String,
    /// Emit JSON lines instead of the human format.
    pub json: bool,
    /// Include the module path on each event.
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
            target: true,
        }
    }
}

/// Installs the global subscriber. Call once at process start.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init(config: &LogConfig) {
    try_init(config).expect("global tracing subscriber already installed");
}

/// Installs the global subscriber if none is present yet. Safe to call from
/// every test.
pub fn try_init(config: &LogConfig) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let filter = EnvFilter::new(config.filter.clone());
    if config.json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(config.target));
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(config.target));
        tracing::subscriber::set_global_default(subscriber)
    }
}
