//! Append-only step history and per-run state
//!
//! A run's `Memory` owns the ordered step log and the keyed state
//! scratchpad. Loops own their Memory exclusively; nothing here is
//! thread-safe by design.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::Observation;

use super::types::{ContentPart, Message, MessageContent, TokenUsage, ToolCallRequest};

/// Reserved state keys
pub mod state_keys {
    /// Deduplicated set of URLs visited so far
    pub const VISITED_URLS: &str = "visited_urls";
    /// Search queries issued so far
    pub const SEARCH_QUERIES: &str = "search_queries";
    /// Key findings indexed by topic
    pub const KEY_FINDINGS: &str = "key_findings";
    /// Current search depth
    pub const SEARCH_DEPTH: &str = "search_depth";
    /// Reranking history entries
    pub const RERANKING_HISTORY: &str = "reranking_history";
    /// Per-URL content quality scores
    pub const CONTENT_QUALITY: &str = "content_quality";
    /// Nested sub-agent call depth
    pub const DELEGATION_DEPTH: &str = "delegation_depth";
    /// Past delegations: agent, task, outcome
    pub const DELEGATION_HISTORY: &str = "delegation_history";
}

/// Timing and usage shared by every step variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMeta {
    /// When the step started
    pub started_at: DateTime<Utc>,
    /// When the step ended
    pub ended_at: Option<DateTime<Utc>>,
    /// Token usage attributed to this step
    pub token_usage: Option<TokenUsage>,
}

impl StepMeta {
    /// A step starting now
    pub fn started() -> Self {
        StepMeta {
            started_at: Utc::now(),
            ended_at: None,
            token_usage: None,
        }
    }

    /// Mark the step finished now
    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    /// Mark finished and attribute usage
    pub fn finish_with_usage(&mut self, usage: TokenUsage) {
        self.finish();
        self.token_usage = Some(usage);
    }
}

impl Default for StepMeta {
    fn default() -> Self {
        Self::started()
    }
}

/// Step kind tag for summaries and projections
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// The once-only system prompt
    SystemPrompt,
    /// The user task
    Task,
    /// A plan or plan update
    Planning,
    /// A model action with tool calls or code execution
    Action,
    /// The terminal answer
    FinalAnswer,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepKind::SystemPrompt => "system_prompt",
            StepKind::Task => "task",
            StepKind::Planning => "planning",
            StepKind::Action => "action",
            StepKind::FinalAnswer => "final_answer",
        };
        write!(f, "{}", s)
    }
}

/// One entry in the step log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// The system prompt, first and exactly once
    SystemPrompt {
        /// Timing/usage
        meta: StepMeta,
        /// Prompt text
        text: String,
    },
    /// The user query materialised at loop start
    Task {
        /// Timing/usage
        meta: StepMeta,
        /// Task text
        text: String,
        /// Optional image payloads
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
    },
    /// A plan produced at a planning interval
    Planning {
        /// Timing/usage
        meta: StepMeta,
        /// The plan text
        plan_text: String,
        /// False for the initial plan, true for updates
        is_update: bool,
    },
    /// One act/observe cycle
    Action {
        /// Timing/usage
        meta: StepMeta,
        /// Raw assistant output for this step
        model_output: String,
        /// Tool calls issued (empty for pure thought steps)
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
        /// Observations aligned with `tool_calls`
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        observations: Vec<Observation>,
        /// Step-level error (model failure, sandbox failure, ...)
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Terminal answer step
    FinalAnswer {
        /// Timing/usage
        meta: StepMeta,
        /// Validated answer payload
        payload: Value,
    },
}

impl Step {
    /// Kind tag of this step
    pub fn kind(&self) -> StepKind {
        match self {
            Step::SystemPrompt { .. } => StepKind::SystemPrompt,
            Step::Task { .. } => StepKind::Task,
            Step::Planning { .. } => StepKind::Planning,
            Step::Action { .. } => StepKind::Action,
            Step::FinalAnswer { .. } => StepKind::FinalAnswer,
        }
    }

    /// Shared meta of this step
    pub fn meta(&self) -> &StepMeta {
        match self {
            Step::SystemPrompt { meta, .. }
            | Step::Task { meta, .. }
            | Step::Planning { meta, .. }
            | Step::Action { meta, .. }
            | Step::FinalAnswer { meta, .. } => meta,
        }
    }

    /// Mutable shared meta
    pub fn meta_mut(&mut self) -> &mut StepMeta {
        match self {
            Step::SystemPrompt { meta, .. }
            | Step::Task { meta, .. }
            | Step::Planning { meta, .. }
            | Step::Action { meta, .. }
            | Step::FinalAnswer { meta, .. } => meta,
        }
    }

    /// One-line content projection for summaries
    pub fn one_line(&self) -> String {
        const LIMIT: usize = 120;
        let line = match self {
            Step::SystemPrompt { text, .. } => text.clone(),
            Step::Task { text, .. } => text.clone(),
            Step::Planning {
                plan_text,
                is_update,
                ..
            } => {
                if *is_update {
                    format!("[update] {}", plan_text)
                } else {
                    format!("[initial] {}", plan_text)
                }
            }
            Step::Action {
                model_output,
                tool_calls,
                error,
                ..
            } => {
                if let Some(e) = error {
                    format!("error: {}", e)
                } else if tool_calls.is_empty() {
                    model_output.clone()
                } else {
                    let names: Vec<&str> =
                        tool_calls.iter().map(|c| c.name.as_str()).collect();
                    format!("tools: {}", names.join(", "))
                }
            }
            Step::FinalAnswer { payload, .. } => payload
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("final answer")
                .to_string(),
        };
        let line = line.replace('\n', " ");
        let mut truncated: String = line.chars().take(LIMIT).collect();
        if truncated.len() < line.len() {
            truncated.push('…');
        }
        truncated
    }
}

/// Per-run keyed scratchpad with reserved deep-search keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    values: HashMap<String, Value>,
}

impl Default for AgentState {
    fn default() -> Self {
        let mut values = HashMap::new();
        values.insert(state_keys::VISITED_URLS.into(), Value::Array(vec![]));
        values.insert(state_keys::SEARCH_QUERIES.into(), Value::Array(vec![]));
        values.insert(
            state_keys::KEY_FINDINGS.into(),
            Value::Object(Default::default()),
        );
        values.insert(state_keys::SEARCH_DEPTH.into(), Value::from(0));
        values.insert(state_keys::RERANKING_HISTORY.into(), Value::Array(vec![]));
        values.insert(
            state_keys::CONTENT_QUALITY.into(),
            Value::Object(Default::default()),
        );
        values.insert(state_keys::DELEGATION_DEPTH.into(), Value::from(0));
        values.insert(state_keys::DELEGATION_HISTORY.into(), Value::Array(vec![]));
        AgentState { values }
    }
}

impl AgentState {
    /// Fresh state with the reserved keys initialised
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a raw value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Write a raw value; `visited_urls` is coerced back to a set
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.values.insert(key.clone(), value);
        if key == state_keys::VISITED_URLS {
            self.normalize_visited_urls();
        }
    }

    /// Merge an external key/value map (e.g. sandbox `updated_state`),
    /// re-coercing reserved collection shapes afterwards
    pub fn merge(&mut self, updates: serde_json::Map<String, Value>) {
        for (key, value) in updates {
            self.values.insert(key, value);
        }
        self.normalize_visited_urls();
    }

    /// Visited URLs as a deduplicated, ordered set
    pub fn visited_urls(&self) -> BTreeSet<String> {
        self.values
            .get(state_keys::VISITED_URLS)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record a visited URL (idempotent)
    pub fn add_visited_url(&mut self, url: impl Into<String>) {
        let mut urls = self.visited_urls();
        urls.insert(url.into());
        self.values.insert(
            state_keys::VISITED_URLS.into(),
            Value::Array(urls.into_iter().map(Value::String).collect()),
        );
    }

    /// Record an issued search query
    pub fn push_search_query(&mut self, query: impl Into<String>) {
        let entry = self
            .values
            .entry(state_keys::SEARCH_QUERIES.into())
            .or_insert_with(|| Value::Array(vec![]));
        if let Value::Array(items) = entry {
            items.push(Value::String(query.into()));
        }
    }

    /// Current delegation depth
    pub fn delegation_depth(&self) -> u32 {
        self.values
            .get(state_keys::DELEGATION_DEPTH)
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }

    /// Set the delegation depth
    pub fn set_delegation_depth(&mut self, depth: u32) {
        self.values
            .insert(state_keys::DELEGATION_DEPTH.into(), Value::from(depth));
    }

    /// Append a delegation record `{agent, task, outcome}`
    pub fn push_delegation(&mut self, agent: &str, task: &str, outcome: &str) {
        let entry = self
            .values
            .entry(state_keys::DELEGATION_HISTORY.into())
            .or_insert_with(|| Value::Array(vec![]));
        if let Value::Array(items) = entry {
            items.push(serde_json::json!({
                "agent": agent,
                "task": task,
                "outcome": outcome,
            }));
        }
    }

    /// Snapshot as a JSON object (for the sandbox state echo)
    pub fn to_object(&self) -> serde_json::Map<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // External code may re-assign visited_urls as a list with duplicates;
    // coerce back to a deduped set representation.
    fn normalize_visited_urls(&mut self) {
        if let Some(value) = self.values.get(state_keys::VISITED_URLS) {
            let urls: BTreeSet<String> = match value {
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                Value::String(s) => std::iter::once(s.clone()).collect(),
                _ => BTreeSet::new(),
            };
            self.values.insert(
                state_keys::VISITED_URLS.into(),
                Value::Array(urls.into_iter().map(Value::String).collect()),
            );
        }
    }
}

/// Derived observability counters over a step log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySummary {
    /// Total step count
    pub steps: usize,
    /// Step count per kind
    pub by_kind: BTreeMap<String, usize>,
    /// Names of tools invoked
    pub tools_used: BTreeSet<String>,
    /// Sum of input tokens across steps
    pub input_tokens: u64,
    /// Sum of output tokens across steps
    pub output_tokens: u64,
}

/// Ordered step log plus keyed state for one run
#[derive(Debug, Clone)]
pub struct Memory {
    steps: Vec<Step>,
    /// Mutable per-run scratchpad
    pub state: AgentState,
    initial_state: AgentState,
    system_prompt: String,
}

impl Memory {
    /// Create a memory seeded from a frozen initial state
    pub fn new(system_prompt: impl Into<String>, initial_state: AgentState) -> Self {
        let system_prompt = system_prompt.into();
        let mut memory = Memory {
            steps: Vec::new(),
            state: initial_state.clone(),
            initial_state,
            system_prompt: system_prompt.clone(),
        };
        memory.steps.push(Step::SystemPrompt {
            meta: StepMeta::started(),
            text: system_prompt,
        });
        memory
    }

    /// Append a step in program order
    pub fn append(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Immutable view of the step log
    pub fn snapshot(&self) -> &[Step] {
        &self.steps
    }

    /// Mutable access to the most recent step
    pub fn last_step_mut(&mut self) -> Option<&mut Step> {
        self.steps.last_mut()
    }

    /// Clear the log back to the system prompt and re-clone the initial state
    pub fn reset(&mut self) {
        self.steps.clear();
        self.steps.push(Step::SystemPrompt {
            meta: StepMeta::started(),
            text: self.system_prompt.clone(),
        });
        self.state = self.initial_state.clone();
    }

    /// The system prompt text
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Whether a final answer has been recorded
    pub fn is_terminal(&self) -> bool {
        self.steps
            .last()
            .is_some_and(|s| s.kind() == StepKind::FinalAnswer)
    }

    /// Count of Action steps so far
    pub fn action_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.kind() == StepKind::Action)
            .count()
    }

    /// Total token usage across all steps
    pub fn total_usage(&self) -> TokenUsage {
        let mut total = TokenUsage::default();
        for step in &self.steps {
            if let Some(usage) = &step.meta().token_usage {
                total.add(usage);
            }
        }
        total
    }

    /// Last assistant-visible output, used as a fallback answer on
    /// `max_steps` exhaustion
    pub fn last_model_output(&self) -> Option<&str> {
        self.steps.iter().rev().find_map(|s| match s {
            Step::Action { model_output, .. } if !model_output.is_empty() => {
                Some(model_output.as_str())
            }
            _ => None,
        })
    }

    /// Serialise the step log into model messages
    ///
    /// Observations are emitted as role `tool` messages keyed by their
    /// `tool_call_id`, so the model sees prior results on the next tick.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        for step in &self.steps {
            match step {
                Step::SystemPrompt { text, .. } => messages.push(Message::system(text.clone())),
                Step::Task { text, images, .. } => {
                    if images.is_empty() {
                        messages.push(Message::user(text.clone()));
                    } else {
                        let mut parts = vec![ContentPart::Text { text: text.clone() }];
                        parts.extend(images.iter().map(|payload| ContentPart::Image {
                            payload: payload.clone(),
                        }));
                        messages.push(Message::user(MessageContent::Parts(parts)));
                    }
                }
                Step::Planning { plan_text, .. } => {
                    messages.push(Message::assistant(plan_text.clone()));
                }
                Step::Action {
                    model_output,
                    tool_calls,
                    observations,
                    error,
                    ..
                } => {
                    if tool_calls.is_empty() {
                        if !model_output.is_empty() {
                            messages.push(Message::assistant(model_output.clone()));
                        }
                    } else {
                        messages.push(Message::assistant_with_calls(
                            model_output.clone(),
                            tool_calls.clone(),
                        ));
                        for obs in observations {
                            messages
                                .push(Message::tool(obs.call_id.clone(), obs.as_model_text()));
                        }
                    }
                    if let Some(e) = error {
                        messages.push(Message::user(format!("[step error] {}", e)));
                    }
                }
                Step::FinalAnswer { payload, .. } => {
                    messages.push(Message::assistant(payload.to_string()));
                }
            }
        }
        messages
    }

    /// Derived counters for observability
    pub fn summary(&self) -> MemorySummary {
        let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
        let mut tools_used = BTreeSet::new();
        for step in &self.steps {
            *by_kind.entry(step.kind().to_string()).or_insert(0) += 1;
            if let Step::Action { tool_calls, .. } = step {
                for call in tool_calls {
                    tools_used.insert(call.name.clone());
                }
            }
        }
        let usage = self.total_usage();
        MemorySummary {
            steps: self.steps.len(),
            by_kind,
            tools_used,
            input_tokens: usage.input,
            output_tokens: usage.output,
        }
    }
}
