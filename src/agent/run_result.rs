//! Run result value type
//!
//! Aggregates the final answer, step projections, token/time accounting and
//! error state of one run. The full Memory is never exported; steps are
//! one-line projections.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::memory::{Memory, StepKind};
use super::types::{AgentKind, TokenUsage};

/// Projection of one step: kind plus a one-line content summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    /// Step kind tag
    pub kind: StepKind,
    /// One-line content
    pub content: String,
    /// Token usage attributed to the step, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl StepSummary {
    /// Project one step
    pub fn from_step(step: &crate::agent::memory::Step) -> Self {
        StepSummary {
            kind: step.kind(),
            content: step.one_line(),
            token_usage: step.meta().token_usage,
        }
    }
}

/// Result of one agent run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// The final answer text (may be empty on failure)
    pub final_answer: String,
    /// Step projections in program order
    pub steps: Vec<StepSummary>,
    /// Aggregate token usage
    pub token_usage: TokenUsage,
    /// Wall-clock execution time
    #[serde(with = "humantime_serde")]
    pub execution_time: Duration,
    /// Error reason, `None` on success
    pub error: Option<String>,
    /// Which loop produced this result
    pub agent_kind: AgentKind,
    /// Model identifiers keyed by role
    pub model_info: HashMap<String, String>,
    /// When the run finished
    pub timestamp: DateTime<Utc>,
}

impl RunResult {
    /// Successful result
    pub fn ok(
        final_answer: impl Into<String>,
        agent_kind: AgentKind,
        memory: &Memory,
        execution_time: Duration,
    ) -> Self {
        RunResult {
            final_answer: final_answer.into(),
            steps: Self::project_steps(memory),
            token_usage: memory.total_usage(),
            execution_time,
            error: None,
            agent_kind,
            model_info: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Failed result carrying whatever steps completed
    pub fn err(
        error: impl Into<String>,
        final_answer: impl Into<String>,
        agent_kind: AgentKind,
        memory: &Memory,
        execution_time: Duration,
    ) -> Self {
        RunResult {
            final_answer: final_answer.into(),
            steps: Self::project_steps(memory),
            token_usage: memory.total_usage(),
            execution_time,
            error: Some(error.into()),
            agent_kind,
            model_info: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach model identifiers
    pub fn with_model_info(mut self, model_info: HashMap<String, String>) -> Self {
        self.model_info = model_info;
        self
    }

    /// Whether the run succeeded
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    /// Steps of a given kind
    pub fn steps_by_kind(&self, kind: StepKind) -> Vec<&StepSummary> {
        self.steps.iter().filter(|s| s.kind == kind).collect()
    }

    /// JSON form
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Short human-readable execution report
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("{} Agent Execution Summary", capitalize(&self.agent_kind.to_string())));
        lines.push("=".repeat(40));
        match &self.error {
            Some(e) => {
                lines.push("✗ Failed".to_string());
                lines.push(format!("Error: {}", e));
            }
            None => lines.push("✓ Success".to_string()),
        }
        lines.push(format!(
            "Execution Time: {:.2} seconds",
            self.execution_time.as_secs_f64()
        ));
        lines.push(format!("Total Tokens: {} tokens", self.token_usage.total()));
        lines.push(format!("Steps: {} steps", self.steps.len()));
        if self.error.is_none() && !self.final_answer.is_empty() {
            lines.push(format!("Answer: {}", self.final_answer));
        }
        if !self.model_info.is_empty() {
            let mut models: Vec<&String> = self.model_info.values().collect();
            models.sort();
            let names: Vec<&str> = models.iter().map(|s| s.as_str()).collect();
            lines.push(format!("Models: {}", names.join(", ")));
        }
        lines.join("\n")
    }

    fn project_steps(memory: &Memory) -> Vec<StepSummary> {
        memory
            .snapshot()
            .iter()
            .map(|step| StepSummary {
                kind: step.kind(),
                content: step.one_line(),
                token_usage: step.meta().token_usage,
            })
            .collect()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::memory::{AgentState, Step, StepMeta};

    fn memory_with_usage() -> Memory {
        let mut memory = Memory::new("sys", AgentState::new());
        let mut step = Step::Task {
            meta: StepMeta::started(),
            text: "the task".into(),
            images: vec![],
        };
        step.meta_mut().finish_with_usage(TokenUsage::new(12, 3));
        memory.append(step);
        memory
    }

    #[test]
    fn ok_result_success_and_token_sum() {
        let memory = memory_with_usage();
        let result = RunResult::ok("4", AgentKind::React, &memory, Duration::from_millis(1500));
        assert!(result.success());
        assert_eq!(result.token_usage.total(), 15);
        assert_eq!(result.steps.len(), 2);
    }

    #[test]
    fn err_result_keeps_partial_steps() {
        let memory = memory_with_usage();
        let result = RunResult::err(
            "canceled",
            "",
            AgentKind::Codact,
            &memory,
            Duration::from_secs(1),
        );
        assert!(!result.success());
        assert_eq!(result.error.as_deref(), Some("canceled"));
        assert_eq!(result.steps.len(), 2);
    }

    #[test]
    fn summary_mentions_status_and_counts() {
        let memory = memory_with_usage();
        let ok = RunResult::ok("42", AgentKind::React, &memory, Duration::from_secs(2));
        let report = ok.summary();
        assert!(report.contains("✓ Success"));
        assert!(report.contains("15 tokens"));
        assert!(report.contains("Answer: 42"));

        let failed = RunResult::err("max_steps", "", AgentKind::React, &memory, Duration::ZERO);
        assert!(failed.summary().contains("✗ Failed"));
        assert!(failed.summary().contains("max_steps"));
    }

    #[test]
    fn steps_by_kind_filters() {
        let memory = memory_with_usage();
        let result = RunResult::ok("x", AgentKind::Manager, &memory, Duration::ZERO);
        assert_eq!(result.steps_by_kind(StepKind::Task).len(), 1);
        assert_eq!(result.steps_by_kind(StepKind::Action).len(), 0);
    }

    #[test]
    fn serializes_to_json() {
        let memory = memory_with_usage();
        let result = RunResult::ok("x", AgentKind::React, &memory, Duration::from_secs(1));
        let json = result.to_json().unwrap();
        assert!(json.contains("\"agent_kind\": \"react\""));
        assert!(json.contains("\"final_answer\": \"x\""));
    }
}
