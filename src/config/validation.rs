//! Settings and API-key validation
//!
//! Missing mandatory keys do not abort construction: the runtime records
//! them, skips registering the dependent tools, and flips
//! `valid_api_keys=false` so façades can report degraded capability.

use tracing::warn;

use super::io::ApiKeys;
use super::types::Settings;

/// Outcome of checking the environment's API keys
#[derive(Debug, Clone, Default)]
pub struct KeyReport {
    /// Mandatory keys that are absent
    pub missing_mandatory: Vec<&'static str>,
    /// Optional keys that are absent
    pub missing_optional: Vec<&'static str>,
}

impl KeyReport {
    /// True when every mandatory key is present
    pub fn valid_api_keys(&self) -> bool {
        self.missing_mandatory.is_empty()
    }
}

/// Check which providers the environment can actually serve
///
/// `SERPER_API_KEY` and `JINA_API_KEY` are mandatory for the core search
/// tools; the rest degrade individual tools only.
pub fn validate_keys(keys: &ApiKeys) -> KeyReport {
    let mut report = KeyReport::default();

    if keys.serper_api_key.is_none() {
        report.missing_mandatory.push("SERPER_API_KEY");
    }
    if keys.jina_api_key.is_none() {
        report.missing_mandatory.push("JINA_API_KEY");
    }
    if keys.wolfram_alpha_app_id.is_none() {
        report.missing_optional.push("WOLFRAM_ALPHA_APP_ID");
    }
    if keys.xai_api_key.is_none() {
        report.missing_optional.push("XAI_API_KEY");
    }
    if keys.hf_token.is_none() {
        report.missing_optional.push("HF_TOKEN");
    }
    if keys.litellm_master_key.is_none() {
        report.missing_optional.push("LITELLM_MASTER_KEY");
    }

    for key in &report.missing_mandatory {
        warn!("Missing mandatory API key: {}; dependent tools will not be registered", key);
    }
    report
}

/// Validate settings values; returns human-readable issues
pub fn validate_settings(settings: &Settings) -> Vec<String> {
    let mut issues = Vec::new();

    if settings.agents.react.max_steps == 0 {
        issues.push("agents.react.max_steps must be at least 1".to_string());
    }
    if settings.agents.codact.max_steps == 0 {
        issues.push("agents.codact.max_steps must be at least 1".to_string());
    }
    if settings.agents.react.max_tool_threads == 0 {
        issues.push("agents.react.max_tool_threads must be at least 1".to_string());
    }
    if settings.agents.manager.max_delegation_depth == 0 {
        issues.push("agents.manager.max_delegation_depth must be at least 1".to_string());
    }
    if settings.models.orchestrator_id.is_empty() {
        issues.push("models.orchestrator_id must not be empty".to_string());
    }
    if settings.models.search_id.is_empty() {
        issues.push("models.search_id must not be empty".to_string());
    }

    issues
}
