//! Configuration module
//!
//! Split into focused modules in the same shape as the rest of the crate:
//! - `types`: the settings tree mirroring the recognised TOML keys
//! - `io`: TOML loading, `.env` support, environment overrides, API keys
//! - `validation`: settings bounds and API-key presence checks

mod io;
mod types;
mod validation;

pub use io::{apply_env_overrides, load_settings, load_settings_from_path, ApiKeys};
pub use types::{
    AgentsSettings, CodactSettings, CommonAgentSettings, LoggingSettings, ManagerSettings,
    ModelSettings, ReactSettings, ServiceSettings, Settings, ToolsSettings,
};
pub use validation::{validate_keys, validate_settings, KeyReport};

/// Initialise global tracing from the logging settings
///
/// Intended for the process entry point of whatever façade embeds the
/// engine; `RUST_LOG` still takes precedence over the configured level.
/// Calling it twice is a no-op.
pub fn init_logging(settings: &LoggingSettings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}
