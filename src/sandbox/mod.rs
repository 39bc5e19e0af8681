//! Sandboxed code execution
//!
//! The CodeAct loop runs model-written Python through a pluggable backend
//! behind the [`SandboxBackend`] contract. The host side keeps the static
//! [`CodeValidator`] and the [`SandboxGateway`] that marshals tool handles
//! into the sandbox namespace; backends are black boxes. Only the local
//! child-process backend ships in-core; docker/e2b backends are provided by
//! the deployment.

mod gateway;
mod local;
mod validator;

pub use gateway::SandboxGateway;
pub use local::LocalBackend;
pub use validator::{
    merge_authorized_imports, CodeValidator, DANGEROUS_MODULES, DEFAULT_AUTHORIZED_IMPORTS,
};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SandboxError;
use crate::tools::{Tool, ToolContext};

/// Which sandbox backend a deployment runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorType {
    /// Child process on the host
    Local,
    /// Docker container
    Docker,
    /// E2B cloud sandbox
    E2b,
}

impl std::str::FromStr for ExecutorType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(ExecutorType::Local),
            "docker" => Ok(ExecutorType::Docker),
            "e2b" => Ok(ExecutorType::E2b),
            _ => Err(crate::error::Error::InvalidInput(format!(
                "Unknown executor type: {}. Supported: local, docker, e2b",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorType::Local => write!(f, "local"),
            ExecutorType::Docker => write!(f, "docker"),
            ExecutorType::E2b => write!(f, "e2b"),
        }
    }
}

/// Result of executing one code block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Value of a trailing expression, when the block ends in one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    /// State variables echoed back from the interpreter
    #[serde(default)]
    pub updated_state: serde_json::Map<String, Value>,
    /// Payload passed to `final_answer(...)` inside the block, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<Value>,
    /// Python-level error (exception traceback), if the block raised
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    /// Whether the block completed without raising
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Abstract contract over a persistent Python executor
///
/// `state` is echoed in and out of `execute` so state variables survive
/// across loop ticks. Implementations must tear the interpreter down on all
/// exit paths of `close`.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Install tool shims and the import allow-list in the interpreter
    async fn prepare(
        &self,
        namespace: HashMap<String, Arc<dyn Tool>>,
        authorized_imports: BTreeSet<String>,
    ) -> Result<(), SandboxError>;

    /// Run one code block with the given state
    async fn execute(
        &self,
        code: &str,
        state: &serde_json::Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<ExecutionOutcome, SandboxError>;

    /// Tear the backend down
    async fn close(&self) -> Result<(), SandboxError>;
}
