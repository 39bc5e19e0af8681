//! Agent loops and their shared contracts
//!
//! Three loop variants share one execution model: the tool-calling ReAct
//! loop, the code-executing CodeAct loop, and the hierarchical Manager (a
//! ReAct loop whose tools include sub-agents). All of them consume the
//! model router, the tool dispatcher, and an exclusively-owned Memory, and
//! produce a `RunResult`.

pub mod codact;
pub mod manager;
pub mod memory;
pub mod prompts;
pub mod react;
pub mod run_result;
pub mod stream;
pub mod types;

pub use codact::CodactAgent;
pub use manager::{analyze_task_complexity, ManagerAgent, SubAgentTool, TaskComplexity};
pub use react::ReactAgent;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use run_result::{RunResult, StepSummary};

use crate::error::Result;

use memory::Memory;
use types::{AgentKind, Delta};

/// Event published while a run streams
///
/// A reader sees `Delta* StepSummary` per step, then `Final` exactly once.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Incremental model output
    Delta(Delta),
    /// A completed step, projected
    StepSummary(StepSummary),
    /// The run's result; terminal
    Final(RunResult),
}

/// Per-run options
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Rebuild Memory (and the sandbox namespace) before starting
    pub reset: bool,
    /// Cooperative cancellation for the whole run
    pub cancel: CancellationToken,
    /// Event sink for streaming consumers
    pub events: Option<mpsc::Sender<AgentEvent>>,
    /// Extra state merged into the run's state before it starts
    pub additional_state: Option<serde_json::Map<String, serde_json::Value>>,
    /// Image payloads attached to the task
    pub images: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            reset: true,
            cancel: CancellationToken::new(),
            events: None,
            additional_state: None,
            images: Vec::new(),
        }
    }
}

impl RunOptions {
    /// Options with an event sink attached
    pub fn streaming(events: mpsc::Sender<AgentEvent>) -> Self {
        RunOptions {
            events: Some(events),
            ..Default::default()
        }
    }
}

/// One agent loop instance owned by a session
#[async_trait]
pub trait DeepSearchAgent: Send {
    /// Which loop variant this is
    fn kind(&self) -> AgentKind;

    /// Agent name (used as the tool name when managed)
    fn name(&self) -> &str;

    /// Agent description (shown to a managing agent)
    fn description(&self) -> &str;

    /// Execute a task to completion; never panics, never returns `Err` for
    /// task-level failures (those land in `RunResult.error`)
    async fn run(&mut self, task: &str, opts: RunOptions) -> RunResult;

    /// The run memory (for observability)
    fn memory(&self) -> &Memory;

    /// Rebuild Memory from the initial state and re-prepare any execution
    /// environment
    async fn reset(&mut self) -> Result<()>;
}

/// A sub-agent exposed to a manager as an invocable handle
///
/// Modeled as an interface rather than inheritance: a manager's tool list is
/// a union of plain tools and these handles.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Handle name; becomes the tool name in the manager's registry
    fn name(&self) -> String;

    /// Description shown to the manager's model
    fn description(&self) -> String;

    /// Run the sub-agent non-streaming with `reset=true`; returns the final
    /// answer text, or an error string on failure
    async fn invoke(
        &self,
        task: &str,
        additional_state: Option<serde_json::Map<String, serde_json::Value>>,
        cancel: CancellationToken,
    ) -> std::result::Result<String, String>;
}

/// Adapter making any boxed agent shareable as an [`AgentHandle`]
pub struct SharedAgent {
    inner: std::sync::Arc<tokio::sync::Mutex<Box<dyn DeepSearchAgent>>>,
    name: String,
    description: String,
}

impl SharedAgent {
    /// Wrap an agent for delegation
    pub fn new(agent: Box<dyn DeepSearchAgent>) -> Self {
        let name = agent.name().to_string();
        let description = agent.description().to_string();
        SharedAgent {
            inner: std::sync::Arc::new(tokio::sync::Mutex::new(agent)),
            name,
            description,
        }
    }
}

#[async_trait]
impl AgentHandle for SharedAgent {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    async fn invoke(
        &self,
        task: &str,
        additional_state: Option<serde_json::Map<String, serde_json::Value>>,
        cancel: CancellationToken,
    ) -> std::result::Result<String, String> {
        let mut agent = self.inner.lock().await;
        let opts = RunOptions {
            reset: true,
            cancel,
            additional_state,
            ..Default::default()
        };
        let result = agent.run(task, opts).await;
        match result.error {
            None => {
                if result.final_answer.is_empty() {
                    Ok("No answer generated".to_string())
                } else {
                    Ok(result.final_answer)
                }
            }
            Some(error) => Err(error),
        }
    }
}
