//! Error types for the DeepSearch orchestration engine

use thiserror::Error;

/// Result type alias using DeepSearch's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the engine
///
/// Only programmer errors (unregistered agent kinds, malformed
/// configuration) escape the public `Runtime` API as `Err`; everything else
/// is folded into `RunResult.error` or recorded as a step observation.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model/provider error
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Tool invocation error
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Sandbox error
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Run was canceled cooperatively
    #[error("Canceled")]
    Canceled,

    /// No factory registered for the requested agent kind
    #[error("Agent kind not registered: {0}")]
    AgentNotRegistered(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// What went wrong when invoking a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Arguments did not match the tool's input schema
    Schema,
    /// No tool with that name in the registry
    NotFound,
    /// Per-call deadline expired
    Timeout,
    /// The surrounding run was canceled
    Canceled,
    /// The tool itself reported a failure
    ToolError,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolErrorKind::Schema => "schema",
            ToolErrorKind::NotFound => "not_found",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::Canceled => "canceled",
            ToolErrorKind::ToolError => "tool_error",
        };
        write!(f, "{}", s)
    }
}

/// Tagged tool error recorded as an observation
///
/// The dispatcher never retries; a `ToolError` is data the loop feeds back
/// to the model, not a control-flow exception.
#[derive(Error, Debug, Clone, serde::Serialize, serde::Deserialize)]
#[error("{kind}: {message}")]
pub struct ToolError {
    /// Error category from the dispatch taxonomy
    pub kind: ToolErrorKind,
    /// Human-readable description
    pub message: String,
    /// Underlying cause, when one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ToolError {
    /// Build an error of the given kind
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        ToolError {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Schema-validation failure
    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Schema, message)
    }

    /// Unknown tool name
    pub fn not_found(name: &str) -> Self {
        Self::new(ToolErrorKind::NotFound, format!("Unknown tool: {}", name))
    }

    /// Deadline expired
    pub fn timeout(name: &str, after: std::time::Duration) -> Self {
        Self::new(
            ToolErrorKind::Timeout,
            format!("Tool '{}' timed out after {:?}", name, after),
        )
    }

    /// Cooperative cancellation
    pub fn canceled(name: &str) -> Self {
        Self::new(ToolErrorKind::Canceled, format!("Tool '{}' canceled", name))
    }

    /// Failure reported by the tool implementation
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::ToolError, message)
    }

    /// Attach an underlying cause
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// Model error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    /// Transport-level failure
    Network,
    /// The provider returned an error response
    Provider,
    /// The surrounding run was canceled
    Canceled,
}

/// Error from an LLM handle or the router
///
/// Propagated verbatim to the caller; the router performs no retry.
#[derive(Error, Debug, Clone, serde::Serialize, serde::Deserialize)]
#[error("Model error ({kind:?}): {message}")]
pub struct ModelError {
    /// Error category
    pub kind: ModelErrorKind,
    /// Provider or transport message
    pub message: String,
}

impl ModelError {
    /// Transport-level failure
    pub fn network(message: impl Into<String>) -> Self {
        ModelError {
            kind: ModelErrorKind::Network,
            message: message.into(),
        }
    }

    /// Provider-reported failure
    pub fn provider(message: impl Into<String>) -> Self {
        ModelError {
            kind: ModelErrorKind::Provider,
            message: message.into(),
        }
    }

    /// Cooperative cancellation
    pub fn canceled() -> Self {
        ModelError {
            kind: ModelErrorKind::Canceled,
            message: "canceled".to_string(),
        }
    }
}

/// Sandbox error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxErrorKind {
    /// The static validator rejected the code before execution
    UnsafeCode,
    /// The backend failed to execute
    Backend,
    /// The stdio protocol broke down
    Protocol,
    /// The backend was already closed
    Closed,
}

/// Error from the code sandbox gateway or backend
#[derive(Error, Debug, Clone, serde::Serialize, serde::Deserialize)]
#[error("Sandbox error ({kind:?}): {message}")]
pub struct SandboxError {
    /// Error category
    pub kind: SandboxErrorKind,
    /// Description
    pub message: String,
}

impl SandboxError {
    /// Static-validation rejection; the backend is never contacted
    pub fn unsafe_code(message: impl Into<String>) -> Self {
        SandboxError {
            kind: SandboxErrorKind::UnsafeCode,
            message: message.into(),
        }
    }

    /// Backend execution failure
    pub fn backend(message: impl Into<String>) -> Self {
        SandboxError {
            kind: SandboxErrorKind::Backend,
            message: message.into(),
        }
    }

    /// Wire-protocol failure between host and interpreter
    pub fn protocol(message: impl Into<String>) -> Self {
        SandboxError {
            kind: SandboxErrorKind::Protocol,
            message: message.into(),
        }
    }

    /// Use after close
    pub fn closed() -> Self {
        SandboxError {
            kind: SandboxErrorKind::Closed,
            message: "sandbox backend is closed".to_string(),
        }
    }
}
