//! Model handles and routing
//!
//! The concrete LLM SDK wrapper lives outside the core; it plugs in through
//! the [`LlmModel`] trait. The [`ModelRouter`] wraps a search handle and an
//! orchestrator handle and picks one per call using the
//! [`MessageClassifier`].

mod classifier;
mod router;

pub use classifier::{ClassifierRule, MessageClassifier, ModelChoice};
pub use router::ModelRouter;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::agent::types::{Delta, GenerationOptions, Message, TokenUsage};
use crate::error::ModelError;

/// A complete (non-streaming) model response
#[derive(Debug, Clone)]
pub struct ModelResponse {
    /// The generated assistant message
    pub message: Message,
    /// Token usage for this call
    pub usage: TokenUsage,
}

/// Abstract interface over one LLM backend
///
/// Implementations wrap whatever SDK the deployment uses; the core only
/// needs generation, streaming, and identification.
#[async_trait]
pub trait LlmModel: Send + Sync {
    /// Stable model identifier (e.g. provider/model-name)
    fn identify(&self) -> String;

    /// Generate a complete response
    async fn generate(
        &self,
        messages: &[Message],
        opts: &GenerationOptions,
    ) -> Result<ModelResponse, ModelError>;

    /// Generate a streaming response
    ///
    /// The returned channel yields [`Delta`]s and closes after the terminal
    /// delta (`finished=true`, optionally carrying authoritative usage).
    async fn generate_stream(
        &self,
        messages: &[Message],
        opts: &GenerationOptions,
    ) -> Result<mpsc::Receiver<Delta>, ModelError>;
}
