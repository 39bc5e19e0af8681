//! Tool registry and dispatch
//!
//! Concrete tool implementations (web search, URL reading, embedding,
//! reranking, symbolic computation) live outside the core; they plug in
//! through the [`Tool`] trait and are executed by the [`ToolRegistry`]
//! dispatcher with validation, timeouts, and bounded parallelism.

mod descriptor;
mod final_answer;
mod registry;

pub use descriptor::{ParamSpec, ParamType, Tool, ToolContext, ToolDescriptor};
pub use final_answer::{
    final_answer_descriptor, validate_final_answer, FinalAnswerPayload, FINAL_ANSWER_SCHEMA_MSG,
    FINAL_ANSWER_TOOL,
};
pub use registry::{Observation, ToolRegistry};
