//! Two-model router
//!
//! Presents a single model interface to the loops while internally routing
//! each call to the search or orchestrator handle based on message content.
//! No retry: provider errors propagate verbatim.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::agent::types::{Delta, GenerationOptions, Message, TokenUsage};
use crate::error::ModelError;

use super::classifier::{MessageClassifier, ModelChoice};
use super::{LlmModel, ModelResponse};

/// Routes calls between a search model and an orchestrator model
pub struct ModelRouter {
    search: Arc<dyn LlmModel>,
    orchestrator: Arc<dyn LlmModel>,
    classifier: MessageClassifier,
    // Most recent call only; late updates from concurrent calls are acceptable.
    counters: Mutex<TokenUsage>,
}

impl ModelRouter {
    /// Create a router over the two handles with the standard classifier
    pub fn new(search: Arc<dyn LlmModel>, orchestrator: Arc<dyn LlmModel>) -> Self {
        ModelRouter {
            search,
            orchestrator,
            classifier: MessageClassifier::deep_search(),
            counters: Mutex::new(TokenUsage::default()),
        }
    }

    /// Replace the classifier
    pub fn with_classifier(mut self, classifier: MessageClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Combined identifier: `search_id+orchestrator_id`
    pub fn id(&self) -> String {
        format!("{}+{}", self.search.identify(), self.orchestrator.identify())
    }

    /// Model identifiers keyed by role, for result metadata
    pub fn model_info(&self) -> std::collections::HashMap<String, String> {
        let mut info = std::collections::HashMap::new();
        info.insert("search".to_string(), self.search.identify());
        info.insert("orchestrator".to_string(), self.orchestrator.identify());
        info
    }

    /// The handle the classifier selects for these messages
    pub fn route(&self, messages: &[Message]) -> (ModelChoice, &Arc<dyn LlmModel>) {
        let choice = self.classifier.classify(messages);
        let handle = match choice {
            ModelChoice::Search => &self.search,
            ModelChoice::Orchestrator => &self.orchestrator,
        };
        (choice, handle)
    }

    /// Generate a complete response through the routed handle
    pub async fn generate(
        &self,
        messages: &[Message],
        opts: &GenerationOptions,
    ) -> Result<ModelResponse, ModelError> {
        let (choice, handle) = self.route(messages);
        debug!("Routing generate to {:?} model ({})", choice, handle.identify());
        let response = handle.generate(messages, opts).await?;
        self.record_usage(response.usage);
        Ok(response)
    }

    /// Open a delta stream through the routed handle
    ///
    /// Streaming usage arrives on the terminal delta; callers report it back
    /// via [`ModelRouter::record_usage`] once the stream is drained.
    pub async fn generate_stream(
        &self,
        messages: &[Message],
        opts: &GenerationOptions,
    ) -> Result<mpsc::Receiver<Delta>, ModelError> {
        let (choice, handle) = self.route(messages);
        debug!("Routing stream to {:?} model ({})", choice, handle.identify());
        handle.generate_stream(messages, opts).await
    }

    /// Snapshot usage from the most recent call
    pub fn record_usage(&self, usage: TokenUsage) {
        *self.counters.lock().expect("router counter lock") = usage;
    }

    /// Usage of the most recent call
    pub fn token_counts(&self) -> TokenUsage {
        *self.counters.lock().expect("router counter lock")
    }
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter").field("id", &self.id()).finish()
    }
}
