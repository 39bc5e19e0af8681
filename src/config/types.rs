//! Configuration types
//!
//! Mirrors the recognised TOML keys: `service`, `models`, `agents.*`,
//! `tools`, `logging`. API keys never live here; they come only from the
//! environment (see `io.rs`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::agent::types::AgentKind;
use crate::sandbox::ExecutorType;

/// Top-level settings tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Service façade settings
    #[serde(default)]
    pub service: ServiceSettings,
    /// Model identifiers
    #[serde(default)]
    pub models: ModelSettings,
    /// Agent loop settings
    #[serde(default)]
    pub agents: AgentsSettings,
    /// Tool sourcing settings
    #[serde(default)]
    pub tools: ToolsSettings,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Service host/port and default agent mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Service version string
    #[serde(default = "default_version")]
    pub version: String,
    /// Default agent loop
    #[serde(default = "default_agent_mode")]
    pub deepsearch_agent_mode: AgentKind,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        ServiceSettings {
            host: default_host(),
            port: default_port(),
            version: default_version(),
            deepsearch_agent_mode: default_agent_mode(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_agent_mode() -> AgentKind {
    AgentKind::Codact
}

/// Model identifiers for the two-model router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Planning / final-answer model
    #[serde(default = "default_orchestrator_id")]
    pub orchestrator_id: String,
    /// Search / code-generation model
    #[serde(default = "default_search_id")]
    pub search_id: String,
    /// Reranker model type; empty disables reranking
    #[serde(default)]
    pub reranker_type: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        ModelSettings {
            orchestrator_id: default_orchestrator_id(),
            search_id: default_search_id(),
            reranker_type: None,
        }
    }
}

fn default_orchestrator_id() -> String {
    "openai/o4-mini".to_string()
}

fn default_search_id() -> String {
    "openai/gpt-4.1".to_string()
}

/// Settings shared by every agent loop
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CommonAgentSettings {
    /// Whether tools emit verbose progress callbacks
    #[serde(default)]
    pub verbose_tool_callbacks: bool,
}

/// ReAct loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactSettings {
    /// Step budget per run
    #[serde(default = "default_react_max_steps")]
    pub max_steps: u32,
    /// Plan every N action steps (0 disables planning)
    #[serde(default = "default_react_planning_interval")]
    pub planning_interval: u32,
    /// Worker-pool bound for parallel tool fan-out
    #[serde(default = "default_max_tool_threads")]
    pub max_tool_threads: usize,
}

impl Default for ReactSettings {
    fn default() -> Self {
        ReactSettings {
            max_steps: default_react_max_steps(),
            planning_interval: default_react_planning_interval(),
            max_tool_threads: default_max_tool_threads(),
        }
    }
}

fn default_react_max_steps() -> u32 {
    25
}

fn default_react_planning_interval() -> u32 {
    5
}

fn default_max_tool_threads() -> usize {
    4
}

/// CodeAct loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodactSettings {
    /// Step budget per run
    #[serde(default = "default_react_max_steps")]
    pub max_steps: u32,
    /// Log verbosity of the loop
    #[serde(default = "default_verbosity")]
    pub verbosity_level: u8,
    /// Plan every N action steps (0 disables planning)
    #[serde(default = "default_react_planning_interval")]
    pub planning_interval: u32,
    /// Sandbox backend selection
    #[serde(default = "default_executor_type")]
    pub executor_type: ExecutorType,
    /// Extra import names allowed in sandboxed code
    #[serde(default)]
    pub additional_authorized_imports: Vec<String>,
    /// Opaque backend parameters (image name, API region, ...)
    #[serde(default)]
    pub executor_kwargs: HashMap<String, serde_json::Value>,
    /// Ask the orchestrator for JSON-shaped thought objects
    ///
    /// Mutually exclusive with the reranker-driven grammar mode; grammar
    /// wins when both are requested.
    #[serde(default)]
    pub use_structured_outputs: bool,
}

impl Default for CodactSettings {
    fn default() -> Self {
        CodactSettings {
            max_steps: default_react_max_steps(),
            verbosity_level: default_verbosity(),
            planning_interval: default_react_planning_interval(),
            executor_type: default_executor_type(),
            additional_authorized_imports: Vec::new(),
            executor_kwargs: HashMap::new(),
            use_structured_outputs: false,
        }
    }
}

fn default_verbosity() -> u8 {
    1
}

fn default_executor_type() -> ExecutorType {
    ExecutorType::Local
}

/// Manager loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Whether the manager loop is available
    #[serde(default)]
    pub enabled: bool,
    /// Bound on nested sub-agent calls
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: u32,
    /// Sub-agents created by default for a managed team
    #[serde(default)]
    pub default_managed_agents: Vec<String>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        ManagerSettings {
            enabled: false,
            max_delegation_depth: default_max_delegation_depth(),
            default_managed_agents: Vec::new(),
        }
    }
}

fn default_max_delegation_depth() -> u32 {
    3
}

/// Per-loop agent settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsSettings {
    /// Shared settings
    #[serde(default)]
    pub common: CommonAgentSettings,
    /// ReAct loop
    #[serde(default)]
    pub react: ReactSettings,
    /// CodeAct loop
    #[serde(default)]
    pub codact: CodactSettings,
    /// Manager loop
    #[serde(default)]
    pub manager: ManagerSettings,
}

/// Tool sourcing settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsSettings {
    /// Hub collections to load tools from
    #[serde(default)]
    pub hub_collections: Vec<String>,
    /// Whether hub tools may run remote code
    #[serde(default)]
    pub trust_remote_code: bool,
    /// MCP server endpoints to bridge as tools
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    /// Per-tool configuration blobs
    #[serde(default)]
    pub specific: HashMap<String, serde_json::Value>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter directive (e.g. `info`, `deepsearch=debug`)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON-structured logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
