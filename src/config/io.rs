//! Configuration I/O
//!
//! Loads the TOML settings file, then applies environment overrides for the
//! same keys. API keys come only from the environment, wrapped in
//! `SecretString` so they never appear in logs or serialised settings.

use std::path::Path;

use secrecy::SecretString;

use crate::error::{Error, Result};

use super::types::Settings;

/// API keys read from the environment
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// LiteLLM proxy master key
    pub litellm_master_key: Option<SecretString>,
    /// LiteLLM proxy base URL
    pub litellm_base_url: Option<String>,
    /// Serper search API key
    pub serper_api_key: Option<SecretString>,
    /// Jina reader/embed/rerank API key
    pub jina_api_key: Option<SecretString>,
    /// xAI live-search API key
    pub xai_api_key: Option<SecretString>,
    /// WolframAlpha app ID
    pub wolfram_alpha_app_id: Option<SecretString>,
    /// Hugging Face token for hub tool collections
    pub hf_token: Option<SecretString>,
}

impl ApiKeys {
    /// Read all keys from the environment (after `dotenvy` has run)
    pub fn from_env() -> Self {
        ApiKeys {
            litellm_master_key: secret_var("LITELLM_MASTER_KEY"),
            litellm_base_url: std::env::var("LITELLM_BASE_URL").ok(),
            serper_api_key: secret_var("SERPER_API_KEY"),
            jina_api_key: secret_var("JINA_API_KEY"),
            xai_api_key: secret_var("XAI_API_KEY"),
            wolfram_alpha_app_id: secret_var("WOLFRAM_ALPHA_APP_ID"),
            hf_token: secret_var("HF_TOKEN"),
        }
    }
}

fn secret_var(name: &str) -> Option<SecretString> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

/// Load settings from the default location
///
/// Reads `DEEPSEARCH_CONFIG` (falling back to `./config.toml` when present,
/// else defaults), then applies environment overrides.
pub fn load_settings() -> Result<Settings> {
    dotenvy::dotenv().ok();

    let mut settings = match std::env::var("DEEPSEARCH_CONFIG") {
        Ok(path) => load_settings_from_path(Path::new(&path))?,
        Err(_) => {
            let default = Path::new("config.toml");
            if default.exists() {
                load_settings_from_path(default)?
            } else {
                Settings::default()
            }
        }
    };

    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Load settings from a specific TOML file
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))
}

/// Apply environment-variable overrides for recognised TOML keys
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(host) = std::env::var("DEEPSEARCH_HOST") {
        settings.service.host = host;
    }
    if let Some(port) = parse_var("DEEPSEARCH_PORT") {
        settings.service.port = port;
    }
    if let Ok(mode) = std::env::var("DEEPSEARCH_AGENT_MODE") {
        if let Ok(kind) = mode.parse() {
            settings.service.deepsearch_agent_mode = kind;
        }
    }
    if let Ok(id) = std::env::var("DEEPSEARCH_ORCHESTRATOR_ID") {
        settings.models.orchestrator_id = id;
    }
    if let Ok(id) = std::env::var("DEEPSEARCH_SEARCH_ID") {
        settings.models.search_id = id;
    }
    if let Ok(reranker) = std::env::var("DEEPSEARCH_RERANKER_TYPE") {
        settings.models.reranker_type = if reranker.is_empty() {
            None
        } else {
            Some(reranker)
        };
    }
    if let Some(max_steps) = parse_var("DEEPSEARCH_REACT_MAX_STEPS") {
        settings.agents.react.max_steps = max_steps;
    }
    if let Some(max_steps) = parse_var("DEEPSEARCH_CODACT_MAX_STEPS") {
        settings.agents.codact.max_steps = max_steps;
    }
    if let Some(threads) = parse_var("DEEPSEARCH_MAX_TOOL_THREADS") {
        settings.agents.react.max_tool_threads = threads;
    }
    if let Ok(executor) = std::env::var("DEEPSEARCH_EXECUTOR_TYPE") {
        if let Ok(kind) = executor.parse() {
            settings.agents.codact.executor_type = kind;
        }
    }
    if let Ok(level) = std::env::var("DEEPSEARCH_LOG_LEVEL") {
        settings.logging.level = level;
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
