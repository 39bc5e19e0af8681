//! Runtime and session manager
//!
//! Owns the long-lived pieces — tool registry, model router, prompt
//! bindings, initial state — and hands out agent instances per run or per
//! session. The runtime is a value constructed at process start and passed
//! explicitly; there are no process-wide globals, and tests instantiate
//! their own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::memory::AgentState;
use crate::agent::prompts::PromptBindings;
use crate::agent::types::AgentKind;
use crate::agent::{
    AgentEvent, CodactAgent, DeepSearchAgent, ManagerAgent, ReactAgent, RunOptions, RunResult,
    SharedAgent,
};
use crate::config::{validate_keys, validate_settings, ApiKeys, KeyReport, Settings};
use crate::error::{Error, Result};
use crate::models::{LlmModel, ModelRouter};
use crate::sandbox::{ExecutorType, LocalBackend, SandboxBackend, SandboxGateway};
use crate::tools::{Tool, ToolRegistry};

pub use crate::agent::run_result::StepSummary;

/// Factory producing one agent instance
pub type AgentFactory = Arc<dyn Fn() -> Result<Box<dyn DeepSearchAgent>> + Send + Sync>;

/// A session's agent, shared behind an async lock
pub type SessionAgent = Arc<tokio::sync::Mutex<Box<dyn DeepSearchAgent>>>;

/// Capacity of the event channel handed to streaming consumers
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Long-lived owner of tools, models and session state
pub struct Runtime {
    settings: Settings,
    registry: Arc<ToolRegistry>,
    router: Arc<ModelRouter>,
    prompts: Arc<PromptBindings>,
    initial_state: AgentState,
    api_keys: ApiKeys,
    key_report: KeyReport,
    sandbox_backend: Option<Arc<dyn SandboxBackend>>,
    factories: RwLock<HashMap<AgentKind, AgentFactory>>,
    active_sessions: Mutex<HashMap<String, SessionAgent>>,
}

impl Runtime {
    /// Construct a runtime over the two model handles
    ///
    /// Fails only on malformed configuration. Missing API keys are recorded
    /// (see [`Runtime::valid_api_keys`]); they gate tool registration, not
    /// construction.
    pub fn new(
        settings: Settings,
        search_model: Arc<dyn LlmModel>,
        orchestrator_model: Arc<dyn LlmModel>,
    ) -> Result<Self> {
        let issues = validate_settings(&settings);
        if !issues.is_empty() {
            return Err(Error::Config(issues.join("; ")));
        }

        let api_keys = ApiKeys::from_env();
        let key_report = validate_keys(&api_keys);

        let router = Arc::new(ModelRouter::new(search_model, orchestrator_model));
        info!("Runtime constructed with router {}", router.id());

        Ok(Runtime {
            settings,
            registry: Arc::new(ToolRegistry::new()),
            router,
            prompts: Arc::new(PromptBindings::new()?),
            initial_state: AgentState::new(),
            api_keys,
            key_report,
            sandbox_backend: None,
            factories: RwLock::new(HashMap::new()),
            active_sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Inject a sandbox backend (docker/e2b deployments)
    pub fn with_sandbox_backend(mut self, backend: Arc<dyn SandboxBackend>) -> Self {
        self.sandbox_backend = Some(backend);
        self
    }

    /// Replace the initial-state template cloned into every run
    pub fn with_initial_state(mut self, state: AgentState) -> Self {
        self.initial_state = state;
        self
    }

    /// Whether every mandatory API key was present at construction
    pub fn valid_api_keys(&self) -> bool {
        self.key_report.valid_api_keys()
    }

    /// The key-presence report produced at construction
    pub fn key_report(&self) -> &KeyReport {
        &self.key_report
    }

    /// The shared tool registry
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// The shared model router
    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    /// The effective settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Register a tool unconditionally
    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<()> {
        self.registry.register(tool)
    }

    /// Register a tool only when its provider key is present
    ///
    /// A tool whose key is missing is skipped with a warning; loops that
    /// reference it later fail fast with `not_found` at invoke time.
    pub fn register_tool_requiring(&self, env_key: &str, tool: Arc<dyn Tool>) -> Result<bool> {
        if !self.has_key(env_key) {
            warn!(
                "Skipping tool '{}': missing API key {}",
                tool.descriptor().name,
                env_key
            );
            return Ok(false);
        }
        self.registry.register(tool)?;
        Ok(true)
    }

    fn has_key(&self, env_key: &str) -> bool {
        match env_key {
            "LITELLM_MASTER_KEY" => self.api_keys.litellm_master_key.is_some(),
            "LITELLM_BASE_URL" => self.api_keys.litellm_base_url.is_some(),
            "SERPER_API_KEY" => self.api_keys.serper_api_key.is_some(),
            "JINA_API_KEY" => self.api_keys.jina_api_key.is_some(),
            "XAI_API_KEY" => self.api_keys.xai_api_key.is_some(),
            "WOLFRAM_ALPHA_APP_ID" => self.api_keys.wolfram_alpha_app_id.is_some(),
            "HF_TOKEN" => self.api_keys.hf_token.is_some(),
            _ => false,
        }
    }

    /// Register (or override) the factory for a loop variant
    pub fn register_agent<F>(&self, kind: AgentKind, factory: F)
    where
        F: Fn() -> Result<Box<dyn DeepSearchAgent>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .expect("factory lock poisoned")
            .insert(kind, Arc::new(factory));
    }

    /// Instantiate an agent of the given kind
    ///
    /// Uses a registered factory when present, the built-in wiring
    /// otherwise. An unavailable kind is a programmer error.
    pub fn create_agent(&self, kind: AgentKind) -> Result<Box<dyn DeepSearchAgent>> {
        // Factories may recursively create child agents; take the clone out
        // of the lock before calling.
        let factory = self
            .factories
            .read()
            .expect("factory lock poisoned")
            .get(&kind)
            .cloned();
        if let Some(factory) = factory {
            return factory();
        }
        self.build_default(kind)
    }

    fn build_default(&self, kind: AgentKind) -> Result<Box<dyn DeepSearchAgent>> {
        match kind {
            AgentKind::React => Ok(Box::new(ReactAgent::new(
                Arc::clone(&self.router),
                Arc::clone(&self.registry),
                Arc::clone(&self.prompts),
                self.initial_state.clone(),
                self.settings.agents.react.clone(),
            )?)),
            AgentKind::Codact => {
                let gateway = Arc::new(SandboxGateway::new(self.resolve_backend()?));
                Ok(Box::new(CodactAgent::new(
                    Arc::clone(&self.router),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.prompts),
                    gateway,
                    self.initial_state.clone(),
                    self.settings.agents.codact.clone(),
                    self.settings.models.reranker_type.as_deref(),
                )?))
            }
            AgentKind::Manager => {
                if !self.settings.agents.manager.enabled {
                    return Err(Error::AgentNotRegistered("manager".to_string()));
                }
                let defaults = if self.settings.agents.manager.default_managed_agents.is_empty()
                {
                    vec!["react".to_string(), "codact".to_string()]
                } else {
                    self.settings.agents.manager.default_managed_agents.clone()
                };
                let mut managed: Vec<Arc<dyn crate::agent::AgentHandle>> = Vec::new();
                for name in defaults {
                    let child_kind: AgentKind = name.parse()?;
                    if child_kind == AgentKind::Manager {
                        return Err(Error::Config(
                            "a manager cannot manage another default manager".to_string(),
                        ));
                    }
                    let child = self.create_agent(child_kind)?;
                    managed.push(Arc::new(SharedAgent::new(child)));
                }
                Ok(Box::new(ManagerAgent::new(
                    Arc::clone(&self.router),
                    &self.registry,
                    Arc::clone(&self.prompts),
                    self.initial_state.clone(),
                    self.settings.agents.react.clone(),
                    &self.settings.agents.manager,
                    managed,
                )?))
            }
        }
    }

    fn resolve_backend(&self) -> Result<Arc<dyn SandboxBackend>> {
        if let Some(backend) = &self.sandbox_backend {
            return Ok(Arc::clone(backend));
        }
        match self.settings.agents.codact.executor_type {
            ExecutorType::Local => Ok(Arc::new(LocalBackend::new())),
            other => Err(Error::Config(format!(
                "executor_type '{}' requires an injected sandbox backend",
                other
            ))),
        }
    }

    /// Run a task to completion on a fresh agent
    ///
    /// The returned `RunResult` carries task-level failures in its `error`
    /// field; `Err` is reserved for programmer errors.
    pub async fn run(&self, task: &str, kind: AgentKind, opts: RunOptions) -> Result<RunResult> {
        let mut agent = self.create_agent(kind)?;
        Ok(agent.run(task, opts).await)
    }

    /// Run a task on a fresh agent, streaming events
    ///
    /// Returns the event channel and a handle resolving to the final
    /// `RunResult`. The run executes on its own task.
    pub fn run_streaming(
        &self,
        task: &str,
        kind: AgentKind,
    ) -> Result<(mpsc::Receiver<AgentEvent>, JoinHandle<RunResult>)> {
        let mut agent = self.create_agent(kind)?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = task.to_string();
        let handle = tokio::spawn(async move {
            let opts = RunOptions::streaming(tx);
            agent.run(&task, opts).await
        });
        Ok((rx, handle))
    }

    /// Get the agent bound to a session, creating it on first use
    pub fn get_or_create_agent(&self, kind: AgentKind, session_id: &str) -> Result<SessionAgent> {
        let mut sessions = self.active_sessions.lock().expect("session lock poisoned");
        if let Some(existing) = sessions.get(session_id) {
            return Ok(Arc::clone(existing));
        }
        let agent = self.create_agent(kind)?;
        let shared: SessionAgent = Arc::new(tokio::sync::Mutex::new(agent));
        sessions.insert(session_id.to_string(), Arc::clone(&shared));
        info!("Created session '{}' ({})", session_id, kind);
        Ok(shared)
    }

    /// Run a task inside a session's agent
    ///
    /// Pass `opts.reset=false` to keep memory across turns.
    pub async fn run_in_session(
        &self,
        session_id: &str,
        kind: AgentKind,
        task: &str,
        opts: RunOptions,
    ) -> Result<RunResult> {
        let agent = self.get_or_create_agent(kind, session_id)?;
        let mut agent = agent.lock().await;
        Ok(agent.run(task, opts).await)
    }

    /// Reset a session's memory (and sandbox namespace); no-op for unknown IDs
    pub async fn reset_session(&self, session_id: &str) -> Result<()> {
        let agent = {
            let sessions = self.active_sessions.lock().expect("session lock poisoned");
            sessions.get(session_id).cloned()
        };
        match agent {
            Some(agent) => agent.lock().await.reset().await,
            None => Ok(()),
        }
    }

    /// Drop a session entirely
    pub fn remove_session(&self, session_id: &str) {
        self.active_sessions
            .lock()
            .expect("session lock poisoned")
            .remove(session_id);
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.active_sessions
            .lock()
            .expect("session lock poisoned")
            .len()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("router", &self.router.id())
            .field("tools", &self.registry.count())
            .field("sessions", &self.session_count())
            .field("valid_api_keys", &self.valid_api_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::react::tests::{final_answer_message, ScriptedModel};
    use crate::agent::memory::StepKind;
    use serde_json::json;

    fn runtime_with(
        turns: Vec<std::result::Result<crate::agent::types::Message, crate::error::ModelError>>,
        mutate: impl FnOnce(&mut Settings),
    ) -> Runtime {
        let mut settings = Settings::default();
        mutate(&mut settings);
        let search = ScriptedModel::new("search-m", turns);
        let orchestrator = search.sharing("orch-m");
        Runtime::new(settings, Arc::new(search), Arc::new(orchestrator)).unwrap()
    }

    fn one_answer() -> Vec<std::result::Result<crate::agent::types::Message, crate::error::ModelError>>
    {
        vec![Ok(final_answer_message("t", "answer one", json!([])))]
    }

    #[tokio::test]
    async fn run_produces_result_on_fresh_agent() {
        let runtime = runtime_with(one_answer(), |_| {});
        let result = runtime
            .run("a task", AgentKind::React, RunOptions::default())
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.final_answer, "answer one");
        assert_eq!(result.model_info["search"], "search-m");
    }

    #[tokio::test]
    async fn disabled_manager_is_a_programmer_error() {
        let runtime = runtime_with(vec![], |_| {});
        let err = runtime
            .run("task", AgentKind::Manager, RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentNotRegistered(_)));
    }

    #[tokio::test]
    async fn enabled_manager_builds_default_children() {
        let runtime = runtime_with(one_answer(), |s| {
            s.agents.manager.enabled = true;
            s.agents.manager.default_managed_agents = vec!["react".to_string()];
        });
        let agent = runtime.create_agent(AgentKind::Manager).unwrap();
        assert_eq!(agent.kind(), AgentKind::Manager);
    }

    #[tokio::test]
    async fn invalid_settings_fail_construction() {
        let mut settings = Settings::default();
        settings.agents.react.max_steps = 0;
        let search = ScriptedModel::new("s", vec![]);
        let orchestrator = search.sharing("o");
        let err = Runtime::new(settings, Arc::new(search), Arc::new(orchestrator)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn streaming_run_delivers_events_and_result() {
        let runtime = runtime_with(one_answer(), |_| {});
        let (mut rx, handle) = runtime.run_streaming("task", AgentKind::React).unwrap();

        let mut finals = 0;
        while let Some(event) = rx.recv().await {
            if let AgentEvent::Final(result) = event {
                finals += 1;
                assert!(result.success());
            }
        }
        assert_eq!(finals, 1);
        let result = handle.await.unwrap();
        assert_eq!(result.final_answer, "answer one");
    }

    #[tokio::test]
    async fn sessions_are_idempotent_and_reusable() {
        let turns = vec![
            Ok(final_answer_message("t", "first", json!([]))),
            Ok(final_answer_message("t", "second", json!([]))),
        ];
        let runtime = runtime_with(turns, |_| {});

        let a = runtime.get_or_create_agent(AgentKind::React, "sess-1").unwrap();
        let b = runtime.get_or_create_agent(AgentKind::React, "sess-1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(runtime.session_count(), 1);

        let first = runtime
            .run_in_session("sess-1", AgentKind::React, "turn one", RunOptions::default())
            .await
            .unwrap();
        assert_eq!(first.final_answer, "first");

        // Second turn without reset keeps the first turn's steps in memory.
        let opts = RunOptions {
            reset: false,
            ..Default::default()
        };
        let second = runtime
            .run_in_session("sess-1", AgentKind::React, "turn two", opts)
            .await
            .unwrap();
        assert_eq!(second.final_answer, "second");
        let tasks = second
            .steps_by_kind(StepKind::Task)
            .len();
        assert_eq!(tasks, 2);

        runtime.reset_session("sess-1").await.unwrap();
        let agent = runtime.get_or_create_agent(AgentKind::React, "sess-1").unwrap();
        assert_eq!(agent.lock().await.memory().snapshot().len(), 1);

        runtime.remove_session("sess-1");
        assert_eq!(runtime.session_count(), 0);
    }

    #[tokio::test]
    async fn custom_factory_overrides_default() {
        let runtime = runtime_with(one_answer(), |_| {});
        let registry = Arc::clone(runtime.registry());
        let router = Arc::clone(runtime.router());
        runtime.register_agent(AgentKind::React, move || {
            Ok(Box::new(
                ReactAgent::new(
                    Arc::clone(&router),
                    Arc::clone(&registry),
                    Arc::new(PromptBindings::new()?),
                    AgentState::new(),
                    crate::config::ReactSettings {
                        max_steps: 1,
                        planning_interval: 0,
                        max_tool_threads: 1,
                    },
                )?
                .with_identity("custom", "custom agent"),
            ))
        });
        let agent = runtime.create_agent(AgentKind::React).unwrap();
        assert_eq!(agent.name(), "custom");
    }

    #[tokio::test]
    async fn missing_key_skips_tool_registration() {
        use crate::tools::{ParamSpec, ParamType, ToolContext, ToolDescriptor};
        use async_trait::async_trait;

        struct NullTool;
        #[async_trait]
        impl Tool for NullTool {
            fn descriptor(&self) -> ToolDescriptor {
                ToolDescriptor::new("xcom_deep_qa", "X.com deep Q&A")
                    .with_input("query", ParamSpec::required(ParamType::String))
            }
            async fn invoke(
                &self,
                _args: serde_json::Map<String, serde_json::Value>,
                _ctx: &ToolContext,
            ) -> std::result::Result<serde_json::Value, crate::error::ToolError> {
                Ok(json!(null))
            }
        }

        std::env::remove_var("XAI_API_KEY");
        let runtime = runtime_with(vec![], |_| {});
        let registered = runtime
            .register_tool_requiring("XAI_API_KEY", Arc::new(NullTool))
            .unwrap();
        assert!(!registered);
        assert!(!runtime.registry().contains("xcom_deep_qa"));
    }
}
