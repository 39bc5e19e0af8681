//! ReAct loop
//!
//! Plan → Think → Act → Observe state machine over the model router and the
//! tool dispatcher, speaking the JSON tool-call protocol. Sibling tool calls
//! fan out through a bounded worker pool; observations keep submission
//! order. Terminates on a valid `final_answer`, step-budget exhaustion, or
//! cancellation.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ReactSettings;
use crate::error::{ModelError, Result, ToolError};
use crate::models::ModelRouter;
use crate::tools::{
    validate_final_answer, Observation, ToolContext, ToolRegistry, FINAL_ANSWER_SCHEMA_MSG,
    FINAL_ANSWER_TOOL,
};

use super::memory::{AgentState, Memory, Step, StepMeta};
use super::prompts::{ManagedAgentBinding, PromptBindings};
use super::run_result::{RunResult, StepSummary};
use super::stream::StreamAggregator;
use super::types::{AgentKind, GenerationOptions, Message, TokenUsage, ToolCallRequest};
use super::{AgentEvent, DeepSearchAgent, RunOptions};

/// Abort after this many consecutive model failures
const MAX_CONSECUTIVE_MODEL_ERRORS: u32 = 2;

/// Per-tool-call deadline
const TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// How one thinking turn ended
enum Thought {
    /// Model produced content and zero or more tool calls
    Output {
        content: String,
        calls: Vec<ToolCallRequest>,
        usage: TokenUsage,
    },
    /// Model failed
    Failed(ModelError),
}

/// Tool-calling Reason+Act agent
pub struct ReactAgent {
    name: String,
    description: String,
    kind: AgentKind,
    router: Arc<ModelRouter>,
    registry: Arc<ToolRegistry>,
    prompts: Arc<PromptBindings>,
    memory: Memory,
    settings: ReactSettings,
    /// Advisory task-analysis text injected into planning prompts
    task_hints: Option<String>,
    /// Tool names that are managed sub-agents (delegation bookkeeping)
    managed_agent_names: BTreeSet<String>,
    /// Delegation depth shared with sub-agent tools
    delegation_depth: Arc<AtomicU32>,
}

impl ReactAgent {
    /// Create a ReAct agent over the given router and registry
    pub fn new(
        router: Arc<ModelRouter>,
        registry: Arc<ToolRegistry>,
        prompts: Arc<PromptBindings>,
        initial_state: AgentState,
        settings: ReactSettings,
    ) -> Result<Self> {
        Self::with_kind(
            AgentKind::React,
            router,
            registry,
            prompts,
            initial_state,
            settings,
            &[],
        )
    }

    /// Shared constructor also used by the Manager variant
    pub(crate) fn with_kind(
        kind: AgentKind,
        router: Arc<ModelRouter>,
        registry: Arc<ToolRegistry>,
        prompts: Arc<PromptBindings>,
        initial_state: AgentState,
        settings: ReactSettings,
        managed: &[ManagedAgentBinding],
    ) -> Result<Self> {
        let system_prompt = prompts.system_prompt(
            kind,
            &registry.descriptors(),
            settings.planning_interval,
            &[],
            managed,
        )?;
        Ok(ReactAgent {
            name: format!("DeepSearch {} Agent", capitalized(kind)),
            description: format!("Agent that uses the {} architecture for deep search tasks", kind),
            kind,
            router,
            registry,
            prompts,
            memory: Memory::new(system_prompt, initial_state),
            settings,
            task_hints: None,
            managed_agent_names: BTreeSet::new(),
            delegation_depth: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Override name and description
    pub fn with_identity(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.name = name.into();
        self.description = description.into();
        self
    }

    /// Inject advisory planning hints (used by the Manager)
    pub fn set_task_hints(&mut self, hints: Option<String>) {
        self.task_hints = hints;
    }

    /// Mark tool names as managed sub-agents (used by the Manager)
    pub(crate) fn set_managed_agent_names(&mut self, names: BTreeSet<String>) {
        self.managed_agent_names = names;
    }

    /// The delegation-depth cell shared with sub-agent tools
    pub(crate) fn delegation_depth_cell(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.delegation_depth)
    }

    async fn emit(&self, opts: &RunOptions, event: AgentEvent) {
        if let Some(sink) = &opts.events {
            let _ = sink.send(event).await;
        }
    }

    async fn emit_last_step(&self, opts: &RunOptions) {
        if let Some(step) = self.memory.snapshot().last() {
            self.emit(opts, AgentEvent::StepSummary(StepSummary::from_step(step)))
                .await;
        }
    }

    /// One model call, streaming through the aggregator when an event sink
    /// is attached
    async fn call_model(&self, messages: &[Message], opts: &RunOptions) -> Thought {
        let gen_opts = GenerationOptions {
            tools_schema: Some(self.registry.function_schemas()),
            ..Default::default()
        };

        if opts.events.is_some() {
            let mut source = match self.router.generate_stream(messages, &gen_opts).await {
                Ok(rx) => rx,
                Err(e) => return Thought::Failed(e),
            };
            let mut aggregator = StreamAggregator::new();
            let drained = aggregator.drain(&mut source, opts.events.as_ref()).await;
            self.router.record_usage(aggregator.usage());
            match drained {
                Ok(()) => {
                    let content = aggregator.content().to_string();
                    let calls = ToolCallRequest::from_json_blob(&content)
                        .map(|c| vec![c])
                        .unwrap_or_default();
                    Thought::Output {
                        content,
                        calls,
                        usage: aggregator.usage(),
                    }
                }
                Err(e) => Thought::Failed(e),
            }
        } else {
            match self.router.generate(messages, &gen_opts).await {
                Ok(response) => {
                    let content = response.message.text();
                    let calls = match &response.message.tool_calls {
                        Some(calls) if !calls.is_empty() => calls.clone(),
                        _ => ToolCallRequest::from_json_blob(&content)
                            .map(|c| vec![c])
                            .unwrap_or_default(),
                    };
                    Thought::Output {
                        content,
                        calls,
                        usage: response.usage,
                    }
                }
                Err(e) => Thought::Failed(e),
            }
        }
    }

    /// Emit a Planning step when the interval says so
    async fn maybe_plan(&mut self, task: &str, opts: &RunOptions) -> Option<ModelError> {
        let interval = self.settings.planning_interval;
        if interval == 0 {
            return None;
        }
        let actions = self.memory.action_steps() as u32;
        if actions % interval != 0 {
            return None;
        }
        let planned_before = self
            .memory
            .snapshot()
            .iter()
            .any(|s| matches!(s, Step::Planning { .. }));

        let prompt_result = if planned_before {
            self.plan_update_messages(task)
        } else {
            self.plan_initial_messages(task)
        };
        let messages = match prompt_result {
            Ok(m) => m,
            Err(e) => {
                warn!("Planning prompt render failed: {}", e);
                return None;
            }
        };

        info!(
            "Planning step ({})",
            if planned_before { "update" } else { "initial" }
        );
        match self.call_model(&messages, opts).await {
            Thought::Output { content, usage, .. } => {
                let mut meta = StepMeta::started();
                meta.finish_with_usage(usage);
                self.memory.append(Step::Planning {
                    meta,
                    plan_text: content,
                    is_update: planned_before,
                });
                self.emit_last_step(opts).await;
                None
            }
            Thought::Failed(e) => Some(e),
        }
    }

    fn plan_initial_messages(&self, task: &str) -> Result<Vec<Message>> {
        let prompt = self
            .prompts
            .initial_plan(task, self.task_hints.as_deref())?;
        Ok(vec![
            Message::system(self.memory.system_prompt().to_string()),
            Message::user(prompt),
        ])
    }

    fn plan_update_messages(&self, task: &str) -> Result<Vec<Message>> {
        let remaining = self
            .settings
            .max_steps
            .saturating_sub(self.memory.action_steps() as u32);
        let mut messages = vec![
            Message::system(self.memory.system_prompt().to_string()),
            Message::user(self.prompts.update_plan_pre(task)?),
        ];
        messages.extend(self.memory.to_messages().into_iter().skip(1));
        messages.push(Message::user(self.prompts.update_plan_post(remaining)?));
        Ok(messages)
    }

    /// Record reserved-state bookkeeping for a completed call
    fn record_state(&mut self, call: &ToolCallRequest, observation: &Observation) {
        if observation.is_error() {
            if self.managed_agent_names.contains(&call.name) {
                let task = call
                    .arguments
                    .get("task")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.memory
                    .state
                    .push_delegation(&call.name, &task, "error");
            }
            return;
        }
        match call.name.as_str() {
            "search_links" | "search_fast" => {
                if let Some(query) = call.arguments.get("query").and_then(Value::as_str) {
                    self.memory.state.push_search_query(query);
                }
            }
            "read_url" => {
                if let Some(url) = call.arguments.get("url").and_then(Value::as_str) {
                    self.memory.state.add_visited_url(url);
                }
            }
            name if self.managed_agent_names.contains(name) => {
                let task = call
                    .arguments
                    .get("task")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let outcome = observation
                    .value
                    .as_ref()
                    .and_then(Value::as_str)
                    .map(|s| {
                        if s.starts_with("Maximum delegation depth")
                            || s.starts_with("Error executing sub-agent")
                        {
                            "refused"
                        } else {
                            "ok"
                        }
                    })
                    .unwrap_or("ok");
                self.memory.state.push_delegation(name, &task, outcome);
            }
            _ => {}
        }
    }

    /// Execute one Acting stage. Returns the validated final-answer payload
    /// when the model terminated the run.
    async fn act(
        &mut self,
        content: String,
        calls: Vec<ToolCallRequest>,
        usage: TokenUsage,
        opts: &RunOptions,
    ) -> Option<Value> {
        let mut meta = StepMeta::started();

        if calls.is_empty() {
            // Continued thought; log it and move on.
            debug!("Assistant thought without tool calls");
            meta.finish_with_usage(usage);
            self.memory.append(Step::Action {
                meta,
                model_output: content,
                tool_calls: vec![],
                observations: vec![],
                error: None,
            });
            self.emit_last_step(opts).await;
            return None;
        }

        let (final_calls, dispatch_calls): (Vec<_>, Vec<_>) = calls
            .iter()
            .cloned()
            .partition(|c| c.name == FINAL_ANSWER_TOOL);

        let ctx = ToolContext {
            timeout: TOOL_TIMEOUT,
            cancel: opts.cancel.clone(),
        };
        let dispatched = self
            .registry
            .invoke_many(&dispatch_calls, &ctx, self.settings.max_tool_threads)
            .await;

        for (call, observation) in dispatch_calls.iter().zip(dispatched.iter()) {
            self.record_state(call, observation);
        }

        // Validate any final_answer call locally; it is never dispatched.
        let mut finals: HashMap<String, Observation> = HashMap::new();
        let mut final_payload = None;
        for call in &final_calls {
            match validate_final_answer(&call.arguments) {
                Ok(payload) if final_payload.is_none() => {
                    final_payload = Some(payload.to_value());
                }
                Ok(_) => {}
                Err(_) => {
                    warn!("Rejected final_answer with missing fields");
                    finals.insert(
                        call.id.clone(),
                        Observation::err(
                            call,
                            ToolError::schema(FINAL_ANSWER_SCHEMA_MSG),
                            Duration::ZERO,
                        ),
                    );
                }
            }
        }

        // Reassemble observations in submission order. A valid final call
        // contributes no observation; it becomes the FinalAnswer step.
        let mut by_id: HashMap<String, Observation> = dispatch_calls
            .iter()
            .zip(dispatched)
            .map(|(c, o)| (c.id.clone(), o))
            .collect();
        by_id.extend(finals);

        let recorded_calls: Vec<ToolCallRequest> = calls
            .iter()
            .filter(|c| by_id.contains_key(&c.id))
            .cloned()
            .collect();
        let observations: Vec<Observation> = recorded_calls
            .iter()
            .map(|c| by_id.remove(&c.id).expect("observation for recorded call"))
            .collect();

        if !recorded_calls.is_empty() || final_payload.is_none() {
            meta.finish_with_usage(usage);
            self.memory.append(Step::Action {
                meta,
                model_output: content,
                tool_calls: recorded_calls,
                observations,
                error: None,
            });
            self.emit_last_step(opts).await;

            if let Some(payload) = final_payload {
                let mut terminal = StepMeta::started();
                terminal.finish();
                self.memory.append(Step::FinalAnswer {
                    meta: terminal,
                    payload: payload.clone(),
                });
                self.emit_last_step(opts).await;
                return Some(payload);
            }
            return None;
        }

        // Pure final_answer action: attribute the usage to the terminal step.
        let payload = final_payload.expect("final payload present in terminal branch");
        meta.finish_with_usage(usage);
        self.memory.append(Step::FinalAnswer {
            meta,
            payload: payload.clone(),
        });
        self.emit_last_step(opts).await;
        Some(payload)
    }

    async fn finish(
        &self,
        result: RunResult,
        opts: &RunOptions,
    ) -> RunResult {
        let result = result.with_model_info(self.router.model_info());
        self.emit(opts, AgentEvent::Final(result.clone())).await;
        info!(
            "Run finished: kind={}, success={}, steps={}, tokens={}",
            self.kind,
            result.success(),
            result.steps.len(),
            result.token_usage.total()
        );
        result
    }

    /// Drive the loop to completion
    async fn execute(&mut self, task: &str, opts: &RunOptions) -> RunResult {
        let start = Instant::now();

        if let Some(extra) = &opts.additional_state {
            self.memory.state.merge(extra.clone());
        }
        self.delegation_depth
            .store(self.memory.state.delegation_depth(), Ordering::Release);
        self.registry.seal();

        self.emit_last_step(opts).await; // system prompt
        self.memory.append(Step::Task {
            meta: StepMeta::started(),
            text: task.to_string(),
            images: opts.images.clone(),
        });
        self.emit_last_step(opts).await;

        let mut consecutive_model_errors: u32 = 0;

        loop {
            if opts.cancel.is_cancelled() {
                let result =
                    RunResult::err("canceled", "", self.kind, &self.memory, start.elapsed());
                return self.finish(result, opts).await;
            }

            if self.memory.action_steps() as u32 >= self.settings.max_steps {
                warn!("Step budget exhausted ({})", self.settings.max_steps);
                let fallback = self.memory.last_model_output().unwrap_or("").to_string();
                let result = RunResult::err(
                    "max_steps",
                    fallback,
                    self.kind,
                    &self.memory,
                    start.elapsed(),
                );
                return self.finish(result, opts).await;
            }

            if let Some(e) = self.maybe_plan(task, opts).await {
                consecutive_model_errors += 1;
                warn!("Planning model error ({}): {}", consecutive_model_errors, e);
                self.memory.append(Step::Action {
                    meta: StepMeta::started(),
                    model_output: String::new(),
                    tool_calls: vec![],
                    observations: vec![],
                    error: Some(e.to_string()),
                });
                self.emit_last_step(opts).await;
                if consecutive_model_errors >= MAX_CONSECUTIVE_MODEL_ERRORS {
                    let result = RunResult::err(
                        "model_error",
                        "",
                        self.kind,
                        &self.memory,
                        start.elapsed(),
                    );
                    return self.finish(result, opts).await;
                }
                continue;
            }

            let messages = self.memory.to_messages();
            match self.call_model(&messages, opts).await {
                Thought::Output {
                    content,
                    calls,
                    usage,
                } => {
                    consecutive_model_errors = 0;
                    if let Some(payload) = self.act(content, calls, usage, opts).await {
                        let answer = payload
                            .get("content")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let result =
                            RunResult::ok(answer, self.kind, &self.memory, start.elapsed());
                        return self.finish(result, opts).await;
                    }
                }
                Thought::Failed(e) => {
                    consecutive_model_errors += 1;
                    warn!("Model error ({}): {}", consecutive_model_errors, e);
                    self.memory.append(Step::Action {
                        meta: StepMeta::started(),
                        model_output: String::new(),
                        tool_calls: vec![],
                        observations: vec![],
                        error: Some(e.to_string()),
                    });
                    self.emit_last_step(opts).await;
                    if consecutive_model_errors >= MAX_CONSECUTIVE_MODEL_ERRORS {
                        let result = RunResult::err(
                            "model_error",
                            "",
                            self.kind,
                            &self.memory,
                            start.elapsed(),
                        );
                        return self.finish(result, opts).await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DeepSearchAgent for ReactAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&mut self, task: &str, opts: RunOptions) -> RunResult {
        if opts.reset {
            if let Err(e) = self.reset().await {
                return RunResult::err(
                    format!("reset failed: {}", e),
                    "",
                    self.kind,
                    &self.memory,
                    Duration::ZERO,
                );
            }
        }
        self.execute(task, &opts).await
    }

    fn memory(&self) -> &Memory {
        &self.memory
    }

    async fn reset(&mut self) -> Result<()> {
        self.memory.reset();
        Ok(())
    }
}

fn capitalized(kind: AgentKind) -> String {
    let s = kind.to_string();
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => s,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{LlmModel, ModelResponse};
    use crate::tools::{ParamSpec, ParamType, Tool, ToolDescriptor};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Model that replays a scripted sequence of turns. The script can be
    /// shared between two instances so routing decisions never starve the
    /// test sequence.
    pub(crate) struct ScriptedModel {
        id: &'static str,
        script: Arc<Mutex<VecDeque<std::result::Result<Message, ModelError>>>>,
    }

    impl ScriptedModel {
        pub(crate) fn new(
            id: &'static str,
            turns: Vec<std::result::Result<Message, ModelError>>,
        ) -> Self {
            ScriptedModel {
                id,
                script: Arc::new(Mutex::new(turns.into())),
            }
        }

        pub(crate) fn sharing(&self, id: &'static str) -> Self {
            ScriptedModel {
                id,
                script: Arc::clone(&self.script),
            }
        }
    }

    #[async_trait]
    impl LlmModel for ScriptedModel {
        fn identify(&self) -> String {
            self.id.to_string()
        }

        async fn generate(
            &self,
            _messages: &[Message],
            _opts: &GenerationOptions,
        ) -> std::result::Result<ModelResponse, ModelError> {
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Message::assistant("…")));
            next.map(|message| ModelResponse {
                message,
                usage: TokenUsage::new(10, 5),
            })
        }

        async fn generate_stream(
            &self,
            messages: &[Message],
            opts: &GenerationOptions,
        ) -> std::result::Result<mpsc::Receiver<super::super::types::Delta>, ModelError> {
            use super::super::types::Delta;
            let response = self.generate(messages, opts).await?;
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let _ = tx.send(Delta::content(response.message.text())).await;
                let _ = tx.send(Delta::finished_with_usage(response.usage)).await;
            });
            Ok(rx)
        }
    }

    /// Canned-value tool tracking its invocations.
    pub(crate) struct CannedTool {
        pub(crate) descriptor: ToolDescriptor,
        pub(crate) value: Value,
        pub(crate) delay: Duration,
        pub(crate) invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for CannedTool {
        fn descriptor(&self) -> ToolDescriptor {
            self.descriptor.clone()
        }

        async fn invoke(
            &self,
            _args: serde_json::Map<String, Value>,
            _ctx: &ToolContext,
        ) -> std::result::Result<Value, ToolError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.value.clone())
        }
    }

    pub(crate) fn call_message(name: &str, arguments: Value) -> Message {
        Message::assistant_with_calls(
            format!("calling {}", name),
            vec![ToolCallRequest::new(name, arguments)],
        )
    }

    pub(crate) fn final_answer_message(title: &str, content: &str, sources: Value) -> Message {
        call_message(
            FINAL_ANSWER_TOOL,
            json!({"answer": {"title": title, "content": content, "sources": sources}}),
        )
    }

    fn wolfram_registry() -> (Arc<ToolRegistry>, Arc<AtomicUsize>) {
        let registry = Arc::new(ToolRegistry::new());
        let invocations = Arc::new(AtomicUsize::new(0));
        registry
            .register(Arc::new(CannedTool {
                descriptor: ToolDescriptor::new("wolfram", "Compute with WolframAlpha")
                    .with_input("query", ParamSpec::required(ParamType::String)),
                value: json!("4"),
                delay: Duration::ZERO,
                invocations: Arc::clone(&invocations),
            }))
            .unwrap();
        (registry, invocations)
    }

    fn router_for(turns: Vec<std::result::Result<Message, ModelError>>) -> Arc<ModelRouter> {
        let search = ScriptedModel::new("search-m", turns);
        let orchestrator = search.sharing("orch-m");
        Arc::new(ModelRouter::new(Arc::new(search), Arc::new(orchestrator)))
    }

    fn settings_no_planning(max_steps: u32) -> ReactSettings {
        ReactSettings {
            max_steps,
            planning_interval: 0,
            max_tool_threads: 4,
        }
    }

    pub(crate) fn react_agent(
        turns: Vec<std::result::Result<Message, ModelError>>,
        registry: Arc<ToolRegistry>,
        settings: ReactSettings,
    ) -> ReactAgent {
        ReactAgent::new(
            router_for(turns),
            registry,
            Arc::new(PromptBindings::new().unwrap()),
            AgentState::new(),
            settings,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn single_hop_search_scenario() {
        let (registry, invocations) = wolfram_registry();
        let mut agent = react_agent(
            vec![
                Ok(call_message("wolfram", json!({"query": "2+2"}))),
                Ok(final_answer_message(
                    "Arithmetic",
                    "The answer is 4.\n\n## Sources\n",
                    json!([]),
                )),
            ],
            registry,
            settings_no_planning(5),
        );

        let result = agent.run("What is 2+2?", RunOptions::default()).await;
        assert!(result.success(), "error: {:?}", result.error);
        assert!(result.final_answer.contains('4'));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        // Exactly one Action step, whose single tool call is wolfram.
        let actions: Vec<&Step> = agent
            .memory()
            .snapshot()
            .iter()
            .filter(|s| matches!(s, Step::Action { .. }))
            .collect();
        assert_eq!(actions.len(), 1);
        if let Step::Action {
            tool_calls,
            observations,
            ..
        } = actions[0]
        {
            assert_eq!(tool_calls.len(), 1);
            assert_eq!(tool_calls[0].name, "wolfram");
            assert_eq!(tool_calls[0].arguments, json!({"query": "2+2"}));
            assert_eq!(observations.len(), 1);
            assert_eq!(observations[0].value, Some(json!("4")));
        }
    }

    #[tokio::test]
    async fn step_sequence_ordering_invariant() {
        let (registry, _) = wolfram_registry();
        let mut agent = react_agent(
            vec![
                Ok(call_message("wolfram", json!({"query": "1+1"}))),
                Ok(final_answer_message("t", "c", json!(["https://a"]))),
            ],
            registry,
            settings_no_planning(5),
        );
        agent.run("task", RunOptions::default()).await;

        let kinds: Vec<_> = agent
            .memory()
            .snapshot()
            .iter()
            .map(|s| s.kind())
            .collect();
        use crate::agent::memory::StepKind::*;
        assert_eq!(kinds[0], SystemPrompt);
        assert_eq!(kinds[1], Task);
        assert_eq!(*kinds.last().unwrap(), FinalAnswer);
        assert_eq!(kinds.iter().filter(|k| **k == FinalAnswer).count(), 1);
    }

    #[tokio::test]
    async fn two_parallel_tools_preserve_order_and_overlap() {
        let registry = Arc::new(ToolRegistry::new());
        let invocations = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(80);
        registry
            .register(Arc::new(CannedTool {
                descriptor: ToolDescriptor::new("search_links", "Web search")
                    .with_input("query", ParamSpec::required(ParamType::String)),
                value: json!(["https://example.com"]),
                delay,
                invocations: Arc::clone(&invocations),
            }))
            .unwrap();

        let tokyo = ToolCallRequest::new("search_links", json!({"query": "tokyo population"}));
        let nyc = ToolCallRequest::new("search_links", json!({"query": "new york population"}));
        let turns = vec![
            Ok(Message::assistant_with_calls(
                "searching both",
                vec![tokyo.clone(), nyc.clone()],
            )),
            Ok(final_answer_message(
                "Populations",
                "Tokyo ~37M, New York ~19M",
                json!(["https://example.com"]),
            )),
        ];
        let mut agent = react_agent(turns, registry, settings_no_planning(5));

        let start = Instant::now();
        let result = agent
            .run("populations of Tokyo and New York", RunOptions::default())
            .await;
        let elapsed = start.elapsed();

        assert!(result.success());
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        // Parallel: under the 160ms serial time.
        assert!(elapsed < delay * 2, "took {:?}", elapsed);

        if let Some(Step::Action {
            tool_calls,
            observations,
            ..
        }) = agent
            .memory()
            .snapshot()
            .iter()
            .find(|s| matches!(s, Step::Action { .. }))
        {
            assert_eq!(tool_calls[0].id, tokyo.id);
            assert_eq!(tool_calls[1].id, nyc.id);
            assert_eq!(observations[0].call_id, tokyo.id);
            assert_eq!(observations[1].call_id, nyc.id);
        } else {
            panic!("no action step");
        }

        // Both queries recorded in state.
        let queries = agent.memory().state.get("search_queries").unwrap();
        assert_eq!(queries.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_final_answer_does_not_terminate() {
        let (registry, _) = wolfram_registry();
        let mut agent = react_agent(
            vec![
                Ok(call_message(FINAL_ANSWER_TOOL, json!({"answer": {}}))),
                Ok(final_answer_message("t", "real answer", json!([]))),
            ],
            registry,
            settings_no_planning(5),
        );

        let result = agent.run("task", RunOptions::default()).await;
        assert!(result.success());
        assert_eq!(result.final_answer, "real answer");

        // First attempt recorded as an observation error, not a FinalAnswer.
        let steps = agent.memory().snapshot();
        if let Step::Action { observations, .. } = &steps[2] {
            assert!(observations[0].is_error());
            assert_eq!(
                observations[0].error.as_ref().unwrap().message,
                FINAL_ANSWER_SCHEMA_MSG
            );
        } else {
            panic!("expected action step with rejection");
        }
    }

    #[tokio::test]
    async fn max_steps_exhaustion_reports_last_output() {
        let (registry, _) = wolfram_registry();
        let mut agent = react_agent(
            vec![
                Ok(Message::assistant("thinking about it")),
                Ok(Message::assistant("still thinking")),
            ],
            registry,
            settings_no_planning(2),
        );

        let result = agent.run("task", RunOptions::default()).await;
        assert_eq!(result.error.as_deref(), Some("max_steps"));
        assert_eq!(result.final_answer, "still thinking");
    }

    #[tokio::test]
    async fn consecutive_model_errors_abort() {
        let (registry, _) = wolfram_registry();
        let mut agent = react_agent(
            vec![
                Err(ModelError::provider("boom 1")),
                Err(ModelError::provider("boom 2")),
            ],
            registry,
            settings_no_planning(10),
        );

        let result = agent.run("task", RunOptions::default()).await;
        assert_eq!(result.error.as_deref(), Some("model_error"));
    }

    #[tokio::test]
    async fn single_model_error_recovers() {
        let (registry, _) = wolfram_registry();
        let mut agent = react_agent(
            vec![
                Err(ModelError::network("blip")),
                Ok(final_answer_message("t", "after recovery", json!([]))),
            ],
            registry,
            settings_no_planning(10),
        );

        let result = agent.run("task", RunOptions::default()).await;
        assert!(result.success());
        assert_eq!(result.final_answer, "after recovery");
    }

    #[tokio::test]
    async fn cancellation_yields_partial_result() {
        let registry = Arc::new(ToolRegistry::new());
        let invocations = Arc::new(AtomicUsize::new(0));
        registry
            .register(Arc::new(CannedTool {
                descriptor: ToolDescriptor::new("slow", "Slow tool")
                    .with_input("x", ParamSpec::required(ParamType::String)),
                value: json!("done"),
                delay: Duration::from_secs(30),
                invocations: Arc::clone(&invocations),
            }))
            .unwrap();

        let mut agent = react_agent(
            vec![Ok(call_message("slow", json!({"x": "1"})))],
            registry,
            settings_no_planning(5),
        );
        let opts = RunOptions::default();
        let cancel = opts.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let start = Instant::now();
        let result = agent.run("task", opts).await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(result.error.as_deref(), Some("canceled"));
        // The one started invocation is all that ever ran.
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn planning_steps_emitted_at_interval() {
        let (registry, _) = wolfram_registry();
        let settings = ReactSettings {
            max_steps: 10,
            planning_interval: 2,
            max_tool_threads: 4,
        };
        // Tick 0: plan + action; tick 1: action; tick 2: plan + final.
        let mut agent = react_agent(
            vec![
                Ok(Message::assistant("the plan: search first")), // initial plan
                Ok(call_message("wolfram", json!({"query": "a"}))),
                Ok(call_message("wolfram", json!({"query": "b"}))),
                Ok(Message::assistant("updated plan: wrap up")), // plan update
                Ok(final_answer_message("t", "done", json!([]))),
            ],
            registry,
            settings,
        );

        let result = agent.run("task", RunOptions::default()).await;
        assert!(result.success(), "error: {:?}", result.error);

        let plans: Vec<(&str, bool)> = agent
            .memory()
            .snapshot()
            .iter()
            .filter_map(|s| match s {
                Step::Planning {
                    plan_text,
                    is_update,
                    ..
                } => Some((plan_text.as_str(), *is_update)),
                _ => None,
            })
            .collect();
        assert_eq!(plans.len(), 2);
        assert!(!plans[0].1);
        assert!(plans[1].1);
    }

    #[tokio::test]
    async fn token_totals_match_step_sum() {
        let (registry, _) = wolfram_registry();
        let mut agent = react_agent(
            vec![
                Ok(call_message("wolfram", json!({"query": "x"}))),
                Ok(final_answer_message("t", "c", json!([]))),
            ],
            registry,
            settings_no_planning(5),
        );
        let result = agent.run("task", RunOptions::default()).await;

        let step_sum: u64 = result
            .steps
            .iter()
            .filter_map(|s| s.token_usage.map(|u| u.total()))
            .sum();
        assert_eq!(result.token_usage.total(), step_sum);
        assert!(step_sum > 0);
    }

    #[tokio::test]
    async fn streaming_emits_deltas_then_summaries_then_final() {
        let (registry, _) = wolfram_registry();
        // Streaming path parses the JSON blob out of content.
        let blob = r#"{"name": "final_answer", "arguments": {"answer": {"title": "t", "content": "c", "sources": []}}}"#;
        let mut agent = react_agent(
            vec![Ok(Message::assistant(blob))],
            registry,
            settings_no_planning(5),
        );

        let (tx, mut rx) = mpsc::channel(64);
        let result = agent.run("task", RunOptions::streaming(tx)).await;
        assert!(result.success());

        let mut saw_delta = false;
        let mut saw_summary = false;
        let mut finals = 0;
        let mut after_final = 0;
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Delta(_) => saw_delta = true,
                AgentEvent::StepSummary(_) => {
                    saw_summary = true;
                    if finals > 0 {
                        after_final += 1;
                    }
                }
                AgentEvent::Final(r) => {
                    finals += 1;
                    assert!(r.success());
                }
            }
        }
        assert!(saw_delta);
        assert!(saw_summary);
        assert_eq!(finals, 1);
        assert_eq!(after_final, 0);
    }

    #[tokio::test]
    async fn unknown_tool_records_not_found_and_continues() {
        let (registry, _) = wolfram_registry();
        let mut agent = react_agent(
            vec![
                Ok(call_message("nonexistent", json!({}))),
                Ok(final_answer_message("t", "recovered", json!([]))),
            ],
            registry,
            settings_no_planning(5),
        );
        let result = agent.run("task", RunOptions::default()).await;
        assert!(result.success());
        assert_eq!(result.final_answer, "recovered");
    }
}
