//! Type definitions for the agent module

use serde::{Deserialize, Serialize};

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing context and instructions
    System,
    /// User message
    User,
    /// Assistant (AI) response
    Assistant,
    /// Tool/function result
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// One part of a multi-part message body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContentPart {
    /// Plain text
    Text {
        /// The text payload
        text: String,
    },
    /// Image payload (URL or base64 data, opaque to the core)
    Image {
        /// The image payload
        payload: String,
    },
}

/// Message body: plain text or a list of content parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text body
    Text(String),
    /// Multi-part body (text and images)
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of the body; image parts are skipped
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// True when no text is present
    pub fn is_empty(&self) -> bool {
        self.text().trim().is_empty()
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: Role,
    /// Content of the message
    pub content: MessageContent,
    /// Tool calls requested by the assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    /// Tool call this message answers (role `tool` only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a new system message
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Message {
            role: Role::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create a new user message
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Message {
            role: Role::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Message {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create an assistant message carrying tool calls
    pub fn assistant_with_calls(
        content: impl Into<MessageContent>,
        calls: Vec<ToolCallRequest>,
    ) -> Self {
        Message {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// Create a new tool result message
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<MessageContent>) -> Self {
        Message {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Concatenated text of the message body
    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// A tool call requested by the model
///
/// `id` is unique within a step; `arguments` is the already-parsed JSON
/// argument object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique ID for this tool call
    pub id: String,
    /// Tool name
    pub name: String,
    /// Tool arguments
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    /// Create a call with a fresh v4 UUID
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        ToolCallRequest {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }

    /// Parse the ReAct wire blob `{"name": "...", "arguments": {...}}`
    /// out of assistant text. Returns `None` when no such blob is present.
    pub fn from_json_blob(content: &str) -> Option<Self> {
        // Fast path: the whole message is the blob.
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(content.trim()) {
            if let Some(call) = Self::from_value(&v) {
                return Some(call);
            }
        }

        // Otherwise scan for the first balanced JSON object containing it.
        let bytes = content.as_bytes();
        let mut start = None;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes.iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => {
                    if depth == 0 {
                        start = Some(i);
                    }
                    depth += 1;
                }
                b'}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        if let Some(s) = start {
                            if let Ok(v) =
                                serde_json::from_str::<serde_json::Value>(&content[s..=i])
                            {
                                if let Some(call) = Self::from_value(&v) {
                                    return Some(call);
                                }
                            }
                        }
                        start = None;
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn from_value(v: &serde_json::Value) -> Option<Self> {
        let name = v.get("name")?.as_str()?.to_string();
        let arguments = v.get("arguments")?.clone();
        if !arguments.is_object() {
            return None;
        }
        Some(ToolCallRequest::new(name, arguments))
    }
}

/// Token usage statistics for one model call or an aggregate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub input: u64,
    /// Tokens in the completion
    pub output: u64,
}

impl TokenUsage {
    /// Build a usage record
    pub fn new(input: u64, output: u64) -> Self {
        TokenUsage { input, output }
    }

    /// Total tokens used
    pub fn total(&self) -> u64 {
        self.input + self.output
    }

    /// Fold another usage record into this one
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
    }
}

/// Incremental piece of a streaming model response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    /// Content fragment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool-call fragment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_delta: Option<ToolCallDelta>,
    /// True on the terminal delta of a stream
    #[serde(default)]
    pub finished: bool,
    /// Authoritative usage, when the provider supplies it (terminal delta)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Error marker injected by the aggregator on stream failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Delta {
    /// A content fragment
    pub fn content(text: impl Into<String>) -> Self {
        Delta {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    /// The terminal delta of a stream
    pub fn finished() -> Self {
        Delta {
            finished: true,
            ..Default::default()
        }
    }

    /// Terminal delta carrying authoritative usage
    pub fn finished_with_usage(usage: TokenUsage) -> Self {
        Delta {
            finished: true,
            usage: Some(usage),
            ..Default::default()
        }
    }

    /// Terminal error-marked delta
    pub fn error(message: impl Into<String>) -> Self {
        Delta {
            finished: true,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Tool-call fragment in a streaming response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Index of the tool call this fragment belongs to
    pub index: u32,
    /// Tool call ID (first fragment only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Tool name (first fragment only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Argument JSON fragment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Generation options for model calls
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    /// Stop sequences
    pub stop: Option<Vec<String>>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// JSON tool schemas exposed to the model, when tool calling is wanted
    pub tools_schema: Option<serde_json::Value>,
    /// JSON response grammar, when structured output is wanted
    pub response_schema: Option<serde_json::Value>,
}

/// Which agent loop produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Tool-calling Reason+Act loop
    React,
    /// Code-executing loop
    Codact,
    /// Hierarchical manager loop
    Manager,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::React => write!(f, "react"),
            AgentKind::Codact => write!(f, "codact"),
            AgentKind::Manager => write!(f, "manager"),
        }
    }
}

impl std::str::FromStr for AgentKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "react" => Ok(AgentKind::React),
            "codact" | "codeact" => Ok(AgentKind::Codact),
            "manager" => Ok(AgentKind::Manager),
            _ => Err(crate::error::Error::InvalidInput(format!(
                "Unknown agent kind: {}. Supported: react, codact, manager",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_text_joins_parts() {
        let msg = Message::user(MessageContent::Parts(vec![
            ContentPart::Text {
                text: "first".into(),
            },
            ContentPart::Image {
                payload: "data:...".into(),
            },
            ContentPart::Text {
                text: "second".into(),
            },
        ]));
        assert_eq!(msg.text(), "first\nsecond");
    }

    #[test]
    fn tool_call_blob_whole_message() {
        let call =
            ToolCallRequest::from_json_blob(r#"{"name": "wolfram", "arguments": {"query": "2+2"}}"#)
                .unwrap();
        assert_eq!(call.name, "wolfram");
        assert_eq!(call.arguments["query"], "2+2");
    }

    #[test]
    fn tool_call_blob_embedded_in_prose() {
        let content = r#"I should compute this.
{"name": "wolfram", "arguments": {"query": "sqrt(16)"}}
Then I'll report back."#;
        let call = ToolCallRequest::from_json_blob(content).unwrap();
        assert_eq!(call.name, "wolfram");
        assert_eq!(call.arguments["query"], "sqrt(16)");
    }

    #[test]
    fn tool_call_blob_ignores_non_call_json() {
        assert!(ToolCallRequest::from_json_blob(r#"{"foo": 1}"#).is_none());
        assert!(ToolCallRequest::from_json_blob("no json here at all").is_none());
        // arguments must be an object
        assert!(
            ToolCallRequest::from_json_blob(r#"{"name": "x", "arguments": "oops"}"#).is_none()
        );
    }

    #[test]
    fn tool_call_blob_handles_braces_inside_strings() {
        let content = r#"{"name": "search_links", "arguments": {"query": "tokyo {population}"}}"#;
        let call = ToolCallRequest::from_json_blob(content).unwrap();
        assert_eq!(call.arguments["query"], "tokyo {population}");
    }

    #[test]
    fn token_usage_totals() {
        let mut usage = TokenUsage::new(10, 5);
        assert_eq!(usage.total(), 15);
        usage.add(&TokenUsage::new(20, 10));
        assert_eq!(usage.input, 30);
        assert_eq!(usage.output, 15);
        assert_eq!(usage.total(), 45);
    }

    #[test]
    fn agent_kind_parsing() {
        assert_eq!("react".parse::<AgentKind>().unwrap(), AgentKind::React);
        assert_eq!("CodeAct".parse::<AgentKind>().unwrap(), AgentKind::Codact);
        assert_eq!("manager".parse::<AgentKind>().unwrap(), AgentKind::Manager);
        assert!("other".parse::<AgentKind>().is_err());
    }

    #[test]
    fn message_serialization_matches_wire_shape() {
        let msg = Message::tool("call-1", "result text");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call-1");
        assert_eq!(json["content"], "result text");
    }
}
