//! # DeepSearch
//!
//! An LLM-driven deep-research agent orchestration engine built with Rust.
//!
//! ## Architecture
//!
//! The crate is the orchestration core of a deep-research system: given a
//! natural-language question it plans and executes an iterative cycle of
//! tool use (web search, URL reading, chunking, embedding, reranking,
//! symbolic computation), culminating in a cited answer.
//!
//! - **Tools** (`tools`): registry and dispatcher with schema validation,
//!   timeouts, and bounded parallel fan-out
//! - **Models** (`models`): the two-model router (search vs orchestrator)
//!   and its message classifier
//! - **Agent loops** (`agent`): tool-calling ReAct, code-executing CodeAct,
//!   and the hierarchical Manager, plus memory, streaming, prompts, and the
//!   `RunResult` value type
//! - **Sandbox** (`sandbox`): static code validation and the pluggable
//!   Python executor contract with a local child-process backend
//! - **Configuration** (`config`): TOML settings with environment overrides
//! - **Runtime** (`runtime`): the session manager tying it all together
//!
//! Concrete tool implementations, LLM SDK wrappers, and serving façades
//! (CLI/REST/MCP) are external collaborators; they plug in through the
//! `Tool`, `LlmModel`, and `SandboxBackend` traits.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use deepsearch::config::load_settings;
//! use deepsearch::runtime::Runtime;
//! use deepsearch::Result;
//!
//! # fn models() -> (Arc<dyn deepsearch::models::LlmModel>, Arc<dyn deepsearch::models::LlmModel>) { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let settings = load_settings()?;
//!     let (search, orchestrator) = models(); // your LLM SDK wrapper
//!     let runtime = Runtime::new(settings, search, orchestrator)?;
//!
//!     let result = runtime
//!         .run(
//!             "What is the population of Tokyo?",
//!             deepsearch::agent::types::AgentKind::React,
//!             Default::default(),
//!         )
//!         .await?;
//!     println!("{}", result.summary());
//!     Ok(())
//! }
//! ```

// Agent loops, memory, streaming, prompts, run results
pub mod agent;

// Configuration loading and validation
pub mod config;

// Error types
pub mod error;

// Model handles and routing
pub mod models;

// Runtime and session management
pub mod runtime;

// Sandboxed code execution
pub mod sandbox;

// Tool registry and dispatch
pub mod tools;

// Re-export commonly used items
pub use error::{Error, ModelError, Result, SandboxError, ToolError};

pub use agent::{
    AgentEvent, AgentHandle, CodactAgent, DeepSearchAgent, ManagerAgent, ReactAgent, RunOptions,
    SharedAgent,
};
pub use agent::run_result::RunResult;
pub use agent::types::{AgentKind, Delta, Message, Role, TokenUsage};
pub use models::{LlmModel, ModelRouter};
pub use runtime::Runtime;
pub use sandbox::{SandboxBackend, SandboxGateway};
pub use tools::{Tool, ToolContext, ToolDescriptor, ToolRegistry};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
