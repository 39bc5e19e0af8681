//! Prompt binding
//!
//! Pure data: base system templates plus deep-search extensions, merged
//! with the tool list (name, description, icon), the planning interval,
//! and the current time. Rendering is handlebars; no logic beyond
//! iteration lives in the templates.

use handlebars::Handlebars;
use serde_json::json;

use crate::error::{Error, Result};
use crate::tools::ToolDescriptor;

use super::types::AgentKind;

/// Icon shown next to a tool name in prompts and step logs
pub fn tool_icon(name: &str) -> &'static str {
    match name {
        "search_links" => "🔍",
        "search_fast" => "⚡🔍",
        "read_url" => "📄",
        "xcom_deep_qa" => "🐦",
        "github_repo_qa" => "🐙",
        "chunk_text" => "✂️",
        "embed_texts" => "🧩",
        "rerank_texts" => "🏆",
        "wolfram" => "🧮",
        "academic_retrieval" => "🎓",
        "final_answer" => "✅",
        "python_interpreter" => "🐍",
        _ => "🔧",
    }
}

const REACT_SYSTEM: &str = "\
You are DeepSearch, an expert research assistant that answers questions by \
iteratively searching the web, reading sources, and reasoning over what you find.

---
CURRENT_TIME: {{current_time}}
---

You work in Thought/Action cycles. In each cycle, either think in plain text or \
emit exactly one JSON tool call of the form:

{\"name\": \"<tool>\", \"arguments\": { ... }}

Available tools:
{{#each tools}}- {{{icon}}} {{name}}: {{{description}}}
{{/each}}
{{#if managed_agents}}
You can also delegate to managed team members by calling them like tools with a \
`task` argument:
{{#each managed_agents}}- {{name}}: {{{description}}}
{{/each}}{{/if}}
Rules:
1. Track which URLs you have already visited; never re-read a URL you have seen.
2. Do not repeat an identical tool call with identical arguments.
3. Prefer several targeted searches over one broad one; search in English.
{{#if planning_interval}}4. Every {{planning_interval}} steps you will be asked \
to update your plan; keep it current.
{{/if}}\
When you have enough evidence, call `final_answer` with \
{\"answer\": {\"title\": ..., \"content\": ..., \"sources\": [...]}} — \
`content` is Markdown and should end with a `## Sources` section mirroring \
`sources`. Never call `final_answer` with empty fields.";

const CODACT_SYSTEM: &str = "\
You are DeepSearch, an expert research assistant that solves tasks by writing \
Python code executed in a sandbox.

---
CURRENT_TIME: {{current_time}}
---

In each step, think briefly, then emit exactly one code block:

<code>
# python
...
</code>

Tools are available as plain Python callables:
{{#each tools}}- {{{icon}}} {{name}}: {{{description}}}
{{/each}}
State variables persist between steps: visited_urls, search_queries, \
key_findings, search_depth, reranking_history, content_quality. Read and \
update them to avoid repeated work.

Authorized imports: {{#each authorized_imports}}{{this}}{{#unless @last}}, \
{{/unless}}{{/each}}. Anything else will be rejected before execution.

Finish by calling:

final_answer(json.dumps({\"title\": ..., \"content\": ..., \"sources\": [...]}, \
ensure_ascii=False))

`content` is Markdown and should end with a `## Sources` section mirroring \
`sources`. Never call final_answer with empty title or content.";

const INITIAL_PLAN: &str = "\
You are a world expert at analyzing a situation to derive facts, and planning \
steps to solve complex research tasks.

---
CURRENT_TIME: {{current_time}}
---

## 1. Facts survey
Build a preparatory survey of the facts at our disposal and the ones we still \
need, under these headings:
### 1.1. Facts given in the task
### 1.2. Facts to look up
### 1.3. Facts to derive

Don't make assumptions. For each item, provide thorough reasoning.

## 2. Plan
Based on the task:

{{{task}}}
{{#if task_hints}}
Advisory task analysis: {{{task_hints}}}
{{/if}}
Develop a step-by-step high-level plan: broad search first, then read the most \
promising sources, process the information, and synthesize a cited answer.

<end_plan>";

const UPDATE_PLAN_PRE: &str = "\
You are a world expert at analyzing a situation and planning steps towards \
solving a complex research task. You have been given the following task:

---
CURRENT_TIME: {{current_time}}
---

```
{{{task}}}
```

Below you will find a history of attempts made to solve this task. Produce an \
updated facts survey, then an updated plan. If previous tries met some \
success, build on those results; if you are stalled, start a new plan from \
scratch.";

const UPDATE_PLAN_POST: &str = "\
Now write your updated facts survey, taking the above history into account:
## 1. Updated facts survey
### 1.1. Facts given in the task
### 1.2. Facts that we have learned
### 1.3. Facts still to look up
### 1.4. Facts still to derive

Then write the updated step-by-step plan:
## 2. Plan
Be strategic; focus on the most promising directions given what is already \
known. Beware that you have {{remaining_steps}} steps remaining. Only write \
the high-level plan, DO NOT DETAIL INDIVIDUAL TOOL CALLS.

<end_plan>";

const FINAL_ANSWER_PROMPT: &str = "\
Based on all the information gathered, provide a comprehensive final answer to \
the original question:

---
CURRENT_TIME: {{current_time}}
---

{{{task}}}

Answer in the SAME LANGUAGE as the original user query, draw on all relevant \
collected information, and cite specific facts and sources.";

const MANAGED_AGENT_TASK: &str = "\
You are {{name}}, a specialized member of a research team.

Your manager has assigned you this task:

{{{task}}}
{{#if additional_context}}
Additional context: {{{additional_context}}}
{{/if}}
Complete the task thoroughly and return a final answer with title, content, \
and sources; your answer is the only thing your manager will see.";

/// Renders prompt templates against the current run's context
pub struct PromptBindings {
    registry: Handlebars<'static>,
}

/// A managed sub-agent's name and description, for the manager's prompt
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagedAgentBinding {
    /// Sub-agent name
    pub name: String,
    /// Sub-agent description
    pub description: String,
}

impl PromptBindings {
    /// Compile the template set
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(false);
        for (name, template) in [
            ("react_system", REACT_SYSTEM),
            ("codact_system", CODACT_SYSTEM),
            ("initial_plan", INITIAL_PLAN),
            ("update_plan_pre", UPDATE_PLAN_PRE),
            ("update_plan_post", UPDATE_PLAN_POST),
            ("final_answer", FINAL_ANSWER_PROMPT),
            ("managed_agent_task", MANAGED_AGENT_TASK),
        ] {
            registry
                .register_template_string(name, template)
                .map_err(|e| Error::Config(format!("prompt template '{}': {}", name, e)))?;
        }
        Ok(PromptBindings { registry })
    }

    /// System prompt for a loop kind, bound to its tool set
    pub fn system_prompt(
        &self,
        kind: AgentKind,
        tools: &[ToolDescriptor],
        planning_interval: u32,
        authorized_imports: &[String],
        managed_agents: &[ManagedAgentBinding],
    ) -> Result<String> {
        let template = match kind {
            AgentKind::React | AgentKind::Manager => "react_system",
            AgentKind::Codact => "codact_system",
        };
        let tool_entries: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "icon": tool_icon(&t.name),
                })
            })
            .collect();
        self.render(
            template,
            &json!({
                "current_time": current_time(),
                "tools": tool_entries,
                "planning_interval": planning_interval,
                "authorized_imports": authorized_imports,
                "managed_agents": managed_agents,
            }),
        )
    }

    /// Prompt asking for the initial plan
    pub fn initial_plan(&self, task: &str, task_hints: Option<&str>) -> Result<String> {
        self.render(
            "initial_plan",
            &json!({
                "current_time": current_time(),
                "task": task,
                "task_hints": task_hints,
            }),
        )
    }

    /// Prompt prefix for a plan update (before the serialized history)
    pub fn update_plan_pre(&self, task: &str) -> Result<String> {
        self.render(
            "update_plan_pre",
            &json!({"current_time": current_time(), "task": task}),
        )
    }

    /// Prompt suffix for a plan update (after the serialized history)
    pub fn update_plan_post(&self, remaining_steps: u32) -> Result<String> {
        self.render(
            "update_plan_post",
            &json!({"remaining_steps": remaining_steps}),
        )
    }

    /// Prompt asking for the synthesized final answer
    pub fn final_answer(&self, task: &str) -> Result<String> {
        self.render(
            "final_answer",
            &json!({"current_time": current_time(), "task": task}),
        )
    }

    /// Task wrapper handed to a managed sub-agent
    pub fn managed_agent_task(
        &self,
        name: &str,
        task: &str,
        additional_context: Option<&str>,
    ) -> Result<String> {
        self.render(
            "managed_agent_task",
            &json!({
                "name": name,
                "task": task,
                "additional_context": additional_context,
            }),
        )
    }

    fn render(&self, name: &str, data: &serde_json::Value) -> Result<String> {
        self.registry
            .render(name, data)
            .map_err(|e| Error::Internal(format!("prompt render '{}': {}", name, e)))
    }
}

impl std::fmt::Debug for PromptBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptBindings").finish()
    }
}

fn current_time() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ParamSpec, ParamType};

    fn tools() -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor::new("search_links", "Search the web for links")
                .with_input("query", ParamSpec::required(ParamType::String)),
            ToolDescriptor::new("final_answer", "Deliver the final answer"),
        ]
    }

    #[test]
    fn react_system_prompt_lists_tools_with_icons() {
        let bindings = PromptBindings::new().unwrap();
        let prompt = bindings
            .system_prompt(AgentKind::React, &tools(), 5, &[], &[])
            .unwrap();
        assert!(prompt.contains("🔍 search_links: Search the web for links"));
        assert!(prompt.contains("✅ final_answer"));
        assert!(prompt.contains("Every 5 steps"));
        assert!(prompt.contains("CURRENT_TIME:"));
    }

    #[test]
    fn codact_system_prompt_lists_imports() {
        let bindings = PromptBindings::new().unwrap();
        let imports = vec!["json".to_string(), "re".to_string()];
        let prompt = bindings
            .system_prompt(AgentKind::Codact, &tools(), 0, &imports, &[])
            .unwrap();
        assert!(prompt.contains("<code>"));
        assert!(prompt.contains("json, re"));
    }

    #[test]
    fn manager_prompt_lists_managed_agents() {
        let bindings = PromptBindings::new().unwrap();
        let managed = vec![ManagedAgentBinding {
            name: "web_agent".into(),
            description: "Searches the web".into(),
        }];
        let prompt = bindings
            .system_prompt(AgentKind::Manager, &tools(), 7, &[], &managed)
            .unwrap();
        assert!(prompt.contains("web_agent: Searches the web"));
    }

    #[test]
    fn planning_templates_bind_task_and_budget() {
        let bindings = PromptBindings::new().unwrap();
        let initial = bindings.initial_plan("Find the GDP of France", None).unwrap();
        assert!(initial.contains("Facts survey"));
        assert!(initial.contains("Find the GDP of France"));

        let with_hints = bindings
            .initial_plan("t", Some("requires_web_search=true"))
            .unwrap();
        assert!(with_hints.contains("requires_web_search=true"));

        let post = bindings.update_plan_post(12).unwrap();
        assert!(post.contains("12 steps remaining"));
        assert!(post.contains("Updated facts survey"));
    }

    #[test]
    fn task_text_is_not_html_escaped() {
        let bindings = PromptBindings::new().unwrap();
        let prompt = bindings.initial_plan("compare <a> & <b>", None).unwrap();
        assert!(prompt.contains("compare <a> & <b>"));
    }

    #[test]
    fn unknown_tool_gets_default_icon() {
        assert_eq!(tool_icon("mystery_tool"), "🔧");
        assert_eq!(tool_icon("wolfram"), "🧮");
    }
}
