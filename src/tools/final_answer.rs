//! Terminal `final_answer` tool: payload schema and validation
//!
//! `final_answer` is intercepted by the loops rather than dispatched: a
//! valid payload transitions the loop to its terminal state, an invalid one
//! is recorded as an observation error and the loop continues. Empty answers
//! are never silently accepted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;

use super::descriptor::{ParamSpec, ParamType, ToolDescriptor};

/// Name of the terminal tool
pub const FINAL_ANSWER_TOOL: &str = "final_answer";

/// Error message recorded when the payload fails validation
pub const FINAL_ANSWER_SCHEMA_MSG: &str = "final_answer requires title, content, sources";

/// Validated terminal payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalAnswerPayload {
    /// Answer title
    pub title: String,
    /// Markdown answer body
    pub content: String,
    /// Source URLs backing the answer (may be empty)
    pub sources: Vec<String>,
}

impl FinalAnswerPayload {
    /// JSON form of the payload
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "title": self.title,
            "content": self.content,
            "sources": self.sources,
        })
    }
}

/// Descriptor exposing `final_answer` in the tool schemas handed to models
pub fn final_answer_descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        FINAL_ANSWER_TOOL,
        "Deliver the final cited answer and finish the task",
    )
    .with_input("answer", ParamSpec::required(ParamType::Any))
    .with_output("string")
}

/// Validate a `final_answer` argument object
///
/// Accepts both the ReAct wire form `{"answer": {title, content, sources}}`
/// and the bare payload object used from sandboxed code. `title` and
/// `content` must be non-empty strings; `sources` must be present and an
/// array of strings, but may be empty.
pub fn validate_final_answer(arguments: &Value) -> Result<FinalAnswerPayload, ToolError> {
    let payload = match arguments.get("answer") {
        Some(inner) => inner,
        None => arguments,
    };

    // Accept a JSON-encoded payload string, as produced by
    // `final_answer(json.dumps({...}))` inside the sandbox.
    let decoded;
    let payload = match payload {
        Value::String(s) => {
            decoded = serde_json::from_str::<Value>(s)
                .map_err(|_| ToolError::schema(FINAL_ANSWER_SCHEMA_MSG))?;
            &decoded
        }
        other => other,
    };

    let obj = payload
        .as_object()
        .ok_or_else(|| ToolError::schema(FINAL_ANSWER_SCHEMA_MSG))?;

    let title = obj
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::schema(FINAL_ANSWER_SCHEMA_MSG))?;

    let content = obj
        .get("content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::schema(FINAL_ANSWER_SCHEMA_MSG))?;

    let sources = obj
        .get("sources")
        .and_then(Value::as_array)
        .ok_or_else(|| ToolError::schema(FINAL_ANSWER_SCHEMA_MSG))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| ToolError::schema(FINAL_ANSWER_SCHEMA_MSG))
        })
        .collect::<Result<Vec<String>, ToolError>>()?;

    Ok(FinalAnswerPayload {
        title: title.to_string(),
        content: content.to_string(),
        sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_wrapped_answer() {
        let payload = validate_final_answer(&json!({
            "answer": {"title": "T", "content": "C", "sources": ["https://a"]}
        }))
        .unwrap();
        assert_eq!(payload.title, "T");
        assert_eq!(payload.sources, vec!["https://a"]);
    }

    #[test]
    fn accepts_bare_payload_with_empty_sources() {
        let payload = validate_final_answer(&json!({
            "title": "hi", "content": "ok", "sources": []
        }))
        .unwrap();
        assert_eq!(payload.title, "hi");
        assert_eq!(payload.content, "ok");
        assert!(payload.sources.is_empty());
    }

    #[test]
    fn accepts_json_encoded_string_payload() {
        let inner = r#"{"title":"hi","content":"ok","sources":[]}"#;
        let payload = validate_final_answer(&json!(inner)).unwrap();
        assert_eq!(payload.title, "hi");
    }

    #[test]
    fn rejects_empty_answer_object() {
        let err = validate_final_answer(&json!({"answer": {}})).unwrap_err();
        assert_eq!(err.message, FINAL_ANSWER_SCHEMA_MSG);
    }

    #[test]
    fn rejects_blank_title_and_content() {
        assert!(validate_final_answer(&json!({
            "title": "  ", "content": "ok", "sources": []
        }))
        .is_err());
        assert!(validate_final_answer(&json!({
            "title": "t", "content": "", "sources": []
        }))
        .is_err());
    }

    #[test]
    fn rejects_missing_sources() {
        assert!(validate_final_answer(&json!({
            "title": "t", "content": "c"
        }))
        .is_err());
    }

    #[test]
    fn rejects_non_string_sources() {
        assert!(validate_final_answer(&json!({
            "title": "t", "content": "c", "sources": [1, 2]
        }))
        .is_err());
    }
}
