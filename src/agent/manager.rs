//! Manager loop: hierarchical orchestration over sub-agents
//!
//! A ReAct loop whose registry is augmented with agent-as-tool entries.
//! Each managed sub-agent is exposed as a tool taking a `task` string (plus
//! an optional `additional_context` map); invoking it runs the sub-agent's
//! non-streaming entry with `reset=true`. Delegation depth is bounded and
//! overflow is reported as a tool-result string, never as a failure.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{ManagerSettings, ReactSettings};
use crate::error::{Result, ToolError};
use crate::models::ModelRouter;
use crate::tools::{ParamSpec, ParamType, Tool, ToolContext, ToolDescriptor, ToolRegistry};

use super::memory::{AgentState, Memory};
use super::prompts::{ManagedAgentBinding, PromptBindings};
use super::react::ReactAgent;
use super::run_result::RunResult;
use super::types::AgentKind;
use super::{AgentHandle, DeepSearchAgent, RunOptions};

/// Advisory analysis of what a task needs
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TaskComplexity {
    /// Task mentions searching / current information
    pub requires_web_search: bool,
    /// Task mentions calculation or data analysis
    pub requires_computation: bool,
    /// Task mentions summarizing / comparing / evaluating
    pub requires_synthesis: bool,
    /// Managed agents whose names suggest a fit
    pub recommended_agents: Vec<String>,
}

impl TaskComplexity {
    /// One-line rendering for the planning prompt
    pub fn to_hint_string(&self) -> String {
        let mut hints = vec![
            format!("requires_web_search={}", self.requires_web_search),
            format!("requires_computation={}", self.requires_computation),
            format!("requires_synthesis={}", self.requires_synthesis),
        ];
        if !self.recommended_agents.is_empty() {
            hints.push(format!(
                "recommended_agents=[{}]",
                self.recommended_agents.join(", ")
            ));
        }
        hints.join(", ")
    }
}

/// Keyword classifier precomputing delegation hints for the planner
///
/// The hints are advisory, not binding: they are injected into the planning
/// prompt and the model remains free to ignore them.
pub fn analyze_task_complexity(task: &str, managed_agent_names: &[String]) -> TaskComplexity {
    let lowered = task.to_lowercase();
    let contains_any =
        |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

    let mut analysis = TaskComplexity {
        requires_web_search: contains_any(&["search", "find", "latest", "current", "news"]),
        requires_computation: contains_any(&["calculate", "compute", "analyze", "data"]),
        requires_synthesis: contains_any(&["summarize", "explain", "compare", "evaluate"]),
        recommended_agents: Vec::new(),
    };

    for name in managed_agent_names {
        let name_lower = name.to_lowercase();
        let recommended = (analysis.requires_web_search && name_lower.contains("search"))
            || (analysis.requires_computation
                && ["data", "compute", "analyst"]
                    .iter()
                    .any(|k| name_lower.contains(k)))
            || (analysis.requires_synthesis
                && ["summary", "synthesis"].iter().any(|k| name_lower.contains(k)));
        if recommended {
            analysis.recommended_agents.push(name.clone());
        }
    }

    analysis
}

/// A managed sub-agent adapted into the tool registry
pub struct SubAgentTool {
    handle: Arc<dyn AgentHandle>,
    /// Delegation depth of the owning agent's current run
    depth: Arc<AtomicU32>,
    max_delegation_depth: u32,
}

impl SubAgentTool {
    /// Adapt a handle; `depth` is shared with the owning loop
    pub fn new(
        handle: Arc<dyn AgentHandle>,
        depth: Arc<AtomicU32>,
        max_delegation_depth: u32,
    ) -> Self {
        SubAgentTool {
            handle,
            depth,
            max_delegation_depth,
        }
    }
}

#[async_trait]
impl Tool for SubAgentTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            self.handle.name(),
            format!("Delegate a task to this team member. {}", self.handle.description()),
        )
        .with_input("task", ParamSpec::required(ParamType::String))
        .with_input("additional_context", ParamSpec::optional(ParamType::Any))
        .with_output("string")
    }

    async fn invoke(
        &self,
        args: serde_json::Map<String, Value>,
        ctx: &ToolContext,
    ) -> std::result::Result<Value, ToolError> {
        let task = args
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let current = self.depth.load(Ordering::Acquire);
        let prospective = current + 1;
        if prospective > self.max_delegation_depth {
            warn!(
                "Delegation to '{}' refused at depth {} (max {})",
                self.handle.name(),
                current,
                self.max_delegation_depth
            );
            return Ok(json!(format!(
                "Maximum delegation depth ({}) reached. Cannot delegate further.",
                self.max_delegation_depth
            )));
        }

        let mut additional_state = match args.get("additional_context") {
            Some(Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        additional_state.insert("delegation_depth".to_string(), json!(prospective));

        info!(
            "Delegating to sub-agent '{}' at depth {}",
            self.handle.name(),
            prospective
        );
        match self
            .handle
            .invoke(&task, Some(additional_state), ctx.cancel.clone())
            .await
        {
            Ok(answer) => Ok(json!(answer)),
            Err(error) => Ok(json!(format!(
                "Error executing sub-agent {}: {}",
                self.handle.name(),
                error
            ))),
        }
    }
}

/// Hierarchical manager agent
pub struct ManagerAgent {
    inner: ReactAgent,
    managed_names: Vec<String>,
}

impl ManagerAgent {
    /// Create a manager over plain tools plus managed sub-agents
    ///
    /// `base_registry` supplies the manager's own tools; they are copied by
    /// reference into a fresh registry alongside one [`SubAgentTool`] per
    /// managed agent.
    pub fn new(
        router: Arc<ModelRouter>,
        base_registry: &ToolRegistry,
        prompts: Arc<PromptBindings>,
        initial_state: AgentState,
        settings: ReactSettings,
        manager_settings: &ManagerSettings,
        managed_agents: Vec<Arc<dyn AgentHandle>>,
    ) -> Result<Self> {
        let registry = Arc::new(ToolRegistry::new());
        for descriptor in base_registry.descriptors() {
            if let Some(tool) = base_registry.get(&descriptor.name) {
                registry.register(tool)?;
            }
        }

        let mut bindings = Vec::new();
        let mut managed_names = Vec::new();
        for handle in &managed_agents {
            bindings.push(ManagedAgentBinding {
                name: handle.name(),
                description: handle.description(),
            });
            managed_names.push(handle.name());
        }

        let mut inner = ReactAgent::with_kind(
            AgentKind::Manager,
            router,
            Arc::clone(&registry),
            prompts,
            initial_state,
            settings,
            &bindings,
        )?;
        inner.set_managed_agent_names(managed_names.iter().cloned().collect::<BTreeSet<_>>());

        // Sub-agent tools share the loop's delegation-depth cell; the loop
        // seeds it from its run state at start. No back-pointer to the
        // manager is ever stored, which keeps ownership acyclic.
        let depth = inner.delegation_depth_cell();
        for handle in &managed_agents {
            registry.register(Arc::new(SubAgentTool::new(
                Arc::clone(handle),
                Arc::clone(&depth),
                manager_settings.max_delegation_depth,
            )))?;
        }

        let inner = inner.with_identity(
            "DeepSearch Manager Agent",
            "Orchestrates multiple specialized agents to solve complex tasks \
             through intelligent delegation and coordination",
        );

        Ok(ManagerAgent {
            inner,
            managed_names,
        })
    }

    /// Names of the managed sub-agents
    pub fn managed_agent_names(&self) -> &[String] {
        &self.managed_names
    }
}

#[async_trait]
impl DeepSearchAgent for ManagerAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Manager
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    async fn run(&mut self, task: &str, opts: RunOptions) -> RunResult {
        let hints = analyze_task_complexity(task, &self.managed_names);
        self.inner.set_task_hints(Some(hints.to_hint_string()));
        self.inner.run(task, opts).await
    }

    fn memory(&self) -> &Memory {
        self.inner.memory()
    }

    async fn reset(&mut self) -> Result<()> {
        self.inner.reset().await
    }
}
