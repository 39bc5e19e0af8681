//! CodeAct loop
//!
//! Same outer state machine as the ReAct loop, but the Acting stage runs a
//! model-written Python block through the sandbox gateway instead of a JSON
//! tool call. Tools are invoked from inside the code as plain callables;
//! state variables are echoed through the interpreter and merged back after
//! every block.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::CodactSettings;
use crate::error::{Error, ModelError, Result, SandboxErrorKind, ToolError};
use crate::models::ModelRouter;
use crate::sandbox::{merge_authorized_imports, SandboxGateway};
use crate::tools::{
    validate_final_answer, Observation, Tool, ToolContext, ToolRegistry,
    FINAL_ANSWER_SCHEMA_MSG, FINAL_ANSWER_TOOL,
};

use super::memory::{AgentState, Memory, Step, StepMeta};
use super::prompts::PromptBindings;
use super::run_result::{RunResult, StepSummary};
use super::stream::StreamAggregator;
use super::types::{AgentKind, GenerationOptions, Message, TokenUsage, ToolCallRequest};
use super::{AgentEvent, DeepSearchAgent, RunOptions};

/// Abort after this many consecutive model failures
const MAX_CONSECUTIVE_MODEL_ERRORS: u32 = 2;

/// Abort after this many consecutive backend failures
const MAX_CONSECUTIVE_SANDBOX_ERRORS: u32 = 3;

/// Per-block execution deadline
const EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Pseudo tool name under which code executions are logged
const CODE_TOOL: &str = "python_interpreter";

/// Extract the code block from assistant output
///
/// Prefers the `<code>…</code>` form; accepts the legacy
/// triple-backtick-python form as fallback. Returns `None` when the message
/// is free-form thinking.
pub fn extract_code(content: &str) -> Option<String> {
    if let Some(start) = content.find("<code>") {
        let body_start = start + "<code>".len();
        if let Some(len) = content[body_start..].find("</code>") {
            return Some(trim_code(&content[body_start..body_start + len]));
        }
    }
    for fence in ["```python", "```py"] {
        if let Some(start) = content.find(fence) {
            let body_start = start + fence.len();
            if let Some(len) = content[body_start..].find("```") {
                return Some(trim_code(&content[body_start..body_start + len]));
            }
        }
    }
    None
}

fn trim_code(code: &str) -> String {
    code.trim_matches('\n').trim_end().to_string()
}

enum Thought {
    Output { content: String, usage: TokenUsage },
    Failed(ModelError),
}

/// Code-executing agent
pub struct CodactAgent {
    name: String,
    description: String,
    router: Arc<ModelRouter>,
    registry: Arc<ToolRegistry>,
    prompts: Arc<PromptBindings>,
    gateway: Arc<SandboxGateway>,
    memory: Memory,
    settings: CodactSettings,
    /// JSON answer grammar; present when a reranker is configured
    grammar: Option<Value>,
    /// Effective structured-outputs flag (grammar wins when both are set)
    structured_outputs: bool,
    prepared: bool,
}

impl CodactAgent {
    /// Create a CodeAct agent over the given router, registry and sandbox
    pub fn new(
        router: Arc<ModelRouter>,
        registry: Arc<ToolRegistry>,
        prompts: Arc<PromptBindings>,
        gateway: Arc<SandboxGateway>,
        initial_state: AgentState,
        settings: CodactSettings,
        reranker_type: Option<&str>,
    ) -> Result<Self> {
        let imports: Vec<String> = merge_authorized_imports(&settings.additional_authorized_imports)
            .into_iter()
            .collect();
        let system_prompt = prompts.system_prompt(
            AgentKind::Codact,
            &registry.descriptors(),
            settings.planning_interval,
            &imports,
            &[],
        )?;

        // Structured outputs and the reranker-driven grammar are mutually
        // exclusive; grammar wins.
        let grammar = reranker_type.map(|_| {
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "content": {"type": "string"},
                    "sources": {"type": "array", "items": {"type": "string"}},
                    "confidence": {"type": "number"},
                },
                "required": ["title", "content"],
            })
        });
        let structured_outputs = settings.use_structured_outputs && grammar.is_none();
        if settings.use_structured_outputs && grammar.is_some() {
            warn!("use_structured_outputs disabled: reranker grammar takes precedence");
        }

        Ok(CodactAgent {
            name: "DeepSearch Codact Agent".to_string(),
            description: "Agent that uses the codact architecture for deep search tasks"
                .to_string(),
            router,
            registry,
            prompts,
            gateway,
            memory: Memory::new(system_prompt, initial_state),
            settings,
            grammar,
            structured_outputs,
            prepared: false,
        })
    }

    /// Override name and description
    pub fn with_identity(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.name = name.into();
        self.description = description.into();
        self
    }

    /// Whether structured outputs are effectively on
    pub fn structured_outputs(&self) -> bool {
        self.structured_outputs
    }

    /// Marshal the registry's tools into the sandbox namespace, once per run
    async fn ensure_prepared(&mut self) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        let mut namespace: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        for descriptor in self.registry.descriptors() {
            if descriptor.name == FINAL_ANSWER_TOOL {
                continue; // the harness defines final_answer natively
            }
            if let Some(tool) = self.registry.get(&descriptor.name) {
                namespace.insert(descriptor.name, tool);
            }
        }
        self.gateway
            .prepare(namespace, &self.settings.additional_authorized_imports)
            .await
            .map_err(Error::Sandbox)?;
        self.prepared = true;
        Ok(())
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

    fn generation_options(&self) -> GenerationOptions {
        let response_schema = if let Some(grammar) = &self.grammar {
            Some(grammar.clone())
        } else if self.structured_outputs {
            Some(json!({
                "type": "object",
                "properties": {
                    "thought": {"type": "string"},
                    "code": {"type": "string"},
                },
                "required": ["thought", "code"],
            }))
        } else {
            None
        };
        GenerationOptions {
            response_schema,
            ..Default::default()
        }
    }

    async fn call_model(&self, messages: &[Message], opts: &RunOptions) -> Thought {
        let gen_opts = self.generation_options();
        if opts.events.is_some() {
            let mut source = match self.router.generate_stream(messages, &gen_opts).await {
                Ok(rx) => rx,
                Err(e) => return Thought::Failed(e),
            };
            let mut aggregator = StreamAggregator::new();
            let drained = aggregator.drain(&mut source, opts.events.as_ref()).await;
            self.router.record_usage(aggregator.usage());
            match drained {
                Ok(()) => Thought::Output {
                    content: aggregator.content().to_string(),
                    usage: aggregator.usage(),
                },
                Err(e) => Thought::Failed(e),
            }
        } else {
            match self.router.generate(messages, &gen_opts).await {
                Ok(response) => Thought::Output {
                    content: response.message.text(),
                    usage: response.usage,
                },
                Err(e) => Thought::Failed(e),
            }
        }
    }

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

        let messages = if planned_before {
            let remaining = self
                .settings
                .max_steps
                .saturating_sub(self.memory.action_steps() as u32);
            let pre = self.prompts.update_plan_pre(task);
            let post = self.prompts.update_plan_post(remaining);
            match (pre, post) {
                (Ok(pre), Ok(post)) => {
                    let mut messages = vec![
                        Message::system(self.memory.system_prompt().to_string()),
                        Message::user(pre),
                    ];
                    messages.extend(self.memory.to_messages().into_iter().skip(1));
                    messages.push(Message::user(post));
                    messages
                }
                _ => return None,
            }
        } else {
            match self.prompts.initial_plan(task, None) {
                Ok(prompt) => vec![
                    Message::system(self.memory.system_prompt().to_string()),
                    Message::user(prompt),
                ],
                Err(_) => return None,
            }
        };

        info!(
            "Planning step ({})",
            if planned_before { "update" } else { "initial" }
        );
        match self.call_model(&messages, opts).await {
            Thought::Output { content, usage } => {
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

    /// Execute one code block. Returns `(final_payload, backend_failed)`.
    async fn act_on_code(
        &mut self,
        content: String,
        code: String,
        usage: TokenUsage,
        opts: &RunOptions,
    ) -> (Option<Value>, bool) {
        let call = ToolCallRequest::new(CODE_TOOL, json!({"code": code}));
        let ctx = ToolContext {
            timeout: EXEC_TIMEOUT,
            cancel: opts.cancel.clone(),
        };

        let started = Instant::now();
        let executed = self
            .gateway
            .execute(&code, &self.memory.state.to_object(), &ctx)
            .await;
        let duration = started.elapsed();

        let mut meta = StepMeta::started();
        meta.finish_with_usage(usage);

        match executed {
            Err(e) if e.kind == SandboxErrorKind::UnsafeCode => {
                warn!("Code validator rejected block: {}", e.message);
                let observation = Observation::err(
                    &call,
                    ToolError::failed(format!("unsafe_code: {}", e.message)),
                    duration,
                );
                self.memory.append(Step::Action {
                    meta,
                    model_output: content,
                    tool_calls: vec![call],
                    observations: vec![observation],
                    error: None,
                });
                self.emit_last_step(opts).await;
                (None, false)
            }
            Err(e) => {
                warn!("Sandbox backend error: {}", e);
                let observation = Observation::err(
                    &call,
                    ToolError::failed(format!("sandbox_error: {}", e.message)),
                    duration,
                );
                self.memory.append(Step::Action {
                    meta,
                    model_output: content,
                    tool_calls: vec![call],
                    observations: vec![observation],
                    error: None,
                });
                self.emit_last_step(opts).await;
                (None, true)
            }
            Ok(outcome) => {
                self.memory.state.merge(outcome.updated_state.clone());

                let mut final_payload = None;
                let observation = if let Some(raw) = &outcome.final_answer {
                    match validate_final_answer(raw) {
                        Ok(payload) => {
                            final_payload = Some(payload.to_value());
                            Observation::ok(
                                &call,
                                json!({
                                    "stdout": outcome.stdout,
                                    "stderr": outcome.stderr,
                                    "final_answer": payload.to_value(),
                                }),
                                duration,
                            )
                        }
                        Err(_) => Observation::err(
                            &call,
                            ToolError::schema(FINAL_ANSWER_SCHEMA_MSG),
                            duration,
                        ),
                    }
                } else {
                    debug!(
                        "Code block finished: stdout={}B stderr={}B error={}",
                        outcome.stdout.len(),
                        outcome.stderr.len(),
                        outcome.error.is_some()
                    );
                    Observation::ok(
                        &call,
                        json!({
                            "stdout": outcome.stdout,
                            "stderr": outcome.stderr,
                            "return_value": outcome.return_value,
                            "error": outcome.error,
                        }),
                        duration,
                    )
                };

                self.memory.append(Step::Action {
                    meta,
                    model_output: content,
                    tool_calls: vec![call],
                    observations: vec![observation],
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
                    (Some(payload), false)
                } else {
                    (None, false)
                }
            }
        }
    }

    async fn finish(&self, result: RunResult, opts: &RunOptions) -> RunResult {
        let result = result.with_model_info(self.router.model_info());
        self.emit(opts, AgentEvent::Final(result.clone())).await;
        info!(
            "Run finished: kind=codact, success={}, steps={}, tokens={}",
            result.success(),
            result.steps.len(),
            result.token_usage.total()
        );
        result
    }

    async fn execute_run(&mut self, task: &str, opts: &RunOptions) -> RunResult {
        let start = Instant::now();

        if let Err(e) = self.ensure_prepared().await {
            let result = RunResult::err(
                format!("sandbox prepare failed: {}", e),
                "",
                AgentKind::Codact,
                &self.memory,
                start.elapsed(),
            );
            return self.finish(result, opts).await;
        }

        if let Some(extra) = &opts.additional_state {
            self.memory.state.merge(extra.clone());
        }
        self.registry.seal();

        self.emit_last_step(opts).await; // system prompt
        self.memory.append(Step::Task {
            meta: StepMeta::started(),
            text: task.to_string(),
            images: opts.images.clone(),
        });
        self.emit_last_step(opts).await;

        let mut consecutive_model_errors: u32 = 0;
        let mut consecutive_sandbox_errors: u32 = 0;

        loop {
            if opts.cancel.is_cancelled() {
                let result = RunResult::err(
                    "canceled",
                    "",
                    AgentKind::Codact,
                    &self.memory,
                    start.elapsed(),
                );
                return self.finish(result, opts).await;
            }

            if self.memory.action_steps() as u32 >= self.settings.max_steps {
                warn!("Step budget exhausted ({})", self.settings.max_steps);
                let fallback = self.memory.last_model_output().unwrap_or("").to_string();
                let result = RunResult::err(
                    "max_steps",
                    fallback,
                    AgentKind::Codact,
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
                        AgentKind::Codact,
                        &self.memory,
                        start.elapsed(),
                    );
                    return self.finish(result, opts).await;
                }
                continue;
            }

            let messages = self.memory.to_messages();
            match self.call_model(&messages, opts).await {
                Thought::Output { content, usage } => {
                    consecutive_model_errors = 0;
                    match extract_code(&content) {
                        None => {
                            // Free-form thinking; no action taken.
                            let mut meta = StepMeta::started();
                            meta.finish_with_usage(usage);
                            self.memory.append(Step::Action {
                                meta,
                                model_output: content,
                                tool_calls: vec![],
                                observations: vec![],
                                error: None,
                            });
                            self.emit_last_step(opts).await;
                        }
                        Some(code) => {
                            let (payload, backend_failed) =
                                self.act_on_code(content, code, usage, opts).await;
                            if let Some(payload) = payload {
                                let answer = payload
                                    .get("content")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string();
                                let result = RunResult::ok(
                                    answer,
                                    AgentKind::Codact,
                                    &self.memory,
                                    start.elapsed(),
                                );
                                return self.finish(result, opts).await;
                            }
                            if backend_failed {
                                consecutive_sandbox_errors += 1;
                                if consecutive_sandbox_errors >= MAX_CONSECUTIVE_SANDBOX_ERRORS {
                                    let result = RunResult::err(
                                        "sandbox_unavailable",
                                        "",
                                        AgentKind::Codact,
                                        &self.memory,
                                        start.elapsed(),
                                    );
                                    return self.finish(result, opts).await;
                                }
                            } else {
                                consecutive_sandbox_errors = 0;
                            }
                        }
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
                            AgentKind::Codact,
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
impl DeepSearchAgent for CodactAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Codact
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
                    AgentKind::Codact,
                    &self.memory,
                    Duration::ZERO,
                );
            }
        }
        self.execute_run(task, &opts).await
    }

    fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Reset rebuilds Memory and re-prepares the sandbox namespace
    async fn reset(&mut self) -> Result<()> {
        self.memory.reset();
        if self.prepared {
            self.gateway.reprepare().await.map_err(Error::Sandbox)?;
        }
        Ok(())
    }
}
