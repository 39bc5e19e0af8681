//! Tool descriptors, input schemas, and argument validation

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;

/// Parameter type tag for tool input schemas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// UTF-8 string
    String,
    /// Integer
    Int,
    /// Floating-point number (integers accepted)
    Float,
    /// Boolean
    Bool,
    /// Any JSON value
    Any,
    /// Homogeneous list
    List(Box<ParamType>),
}

impl ParamType {
    /// Whether `value` conforms to this type
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Int => value.is_i64() || value.is_u64(),
            ParamType::Float => value.is_number(),
            ParamType::Bool => value.is_boolean(),
            ParamType::Any => true,
            ParamType::List(inner) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|v| inner.matches(v))),
        }
    }

    /// The JSON-Schema type name for this tag
    pub fn json_schema_type(&self) -> Value {
        match self {
            ParamType::String => serde_json::json!({"type": "string"}),
            ParamType::Int => serde_json::json!({"type": "integer"}),
            ParamType::Float => serde_json::json!({"type": "number"}),
            ParamType::Bool => serde_json::json!({"type": "boolean"}),
            ParamType::Any => serde_json::json!({}),
            ParamType::List(inner) => serde_json::json!({
                "type": "array",
                "items": inner.json_schema_type(),
            }),
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamType::String => write!(f, "string"),
            ParamType::Int => write!(f, "int"),
            ParamType::Float => write!(f, "float"),
            ParamType::Bool => write!(f, "bool"),
            ParamType::Any => write!(f, "any"),
            ParamType::List(inner) => write!(f, "list<{}>", inner),
        }
    }
}

/// Schema entry for one named tool parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter type
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Whether the parameter must be supplied
    #[serde(default)]
    pub required: bool,
    /// Value substituted when an optional parameter is absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    /// A required parameter of the given type
    pub fn required(param_type: ParamType) -> Self {
        ParamSpec {
            param_type,
            required: true,
            default: None,
        }
    }

    /// An optional parameter of the given type
    pub fn optional(param_type: ParamType) -> Self {
        ParamSpec {
            param_type,
            required: false,
            default: None,
        }
    }

    /// An optional parameter with a default value
    pub fn with_default(param_type: ParamType, default: Value) -> Self {
        ParamSpec {
            param_type,
            required: false,
            default: Some(default),
        }
    }
}

/// Static description of a tool: name, purpose, and input schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool name within a registry
    pub name: String,
    /// Human description shown to the model
    pub description: String,
    /// Named parameters
    pub inputs: BTreeMap<String, ParamSpec>,
    /// Output type tag
    pub output_type: String,
}

impl ToolDescriptor {
    /// Create a descriptor with no parameters
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        ToolDescriptor {
            name: name.into(),
            description: description.into(),
            inputs: BTreeMap::new(),
            output_type: "any".to_string(),
        }
    }

    /// Add a parameter
    pub fn with_input(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.inputs.insert(name.into(), spec);
        self
    }

    /// Set the output type tag
    pub fn with_output(mut self, output_type: impl Into<String>) -> Self {
        self.output_type = output_type.into();
        self
    }

    /// Render as the JSON function-calling schema handed to models
    pub fn to_function_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for (name, spec) in &self.inputs {
            properties.insert(name.clone(), spec.param_type.json_schema_type());
            if spec.required {
                required.push(Value::String(name.clone()));
            }
        }
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                },
            },
        })
    }

    /// Validate an argument object against this schema
    ///
    /// Returns the argument map with defaults substituted. Unknown keys are
    /// passed through untouched; missing required keys and type mismatches
    /// are schema errors.
    pub fn validate_args(&self, args: &Value) -> Result<Map<String, Value>, ToolError> {
        let mut map = match args {
            Value::Object(m) => m.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(ToolError::schema(format!(
                    "arguments for '{}' must be an object, got {}",
                    self.name,
                    json_type_name(other)
                )));
            }
        };

        for (name, spec) in &self.inputs {
            match map.get(name) {
                Some(value) => {
                    if !spec.param_type.matches(value) {
                        return Err(ToolError::schema(format!(
                            "parameter '{}' of '{}' expects {}, got {}",
                            name,
                            self.name,
                            spec.param_type,
                            json_type_name(value)
                        )));
                    }
                }
                None => {
                    if let Some(default) = &spec.default {
                        map.insert(name.clone(), default.clone());
                    } else if spec.required {
                        return Err(ToolError::schema(format!(
                            "missing required parameter '{}' for '{}'",
                            name, self.name
                        )));
                    }
                }
            }
        }

        Ok(map)
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Per-call invocation context: deadline plus cancellation
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Per-call deadline enforced by the dispatcher
    pub timeout: Duration,
    /// Cooperative cancellation for the surrounding run
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Context with the given timeout and a fresh token
    pub fn with_timeout(timeout: Duration) -> Self {
        ToolContext {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Derive a context sharing this one's cancellation
    pub fn child(&self) -> Self {
        self.clone()
    }
}

impl Default for ToolContext {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(60))
    }
}

/// A named capability with a typed input schema, callable by agents
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static description of the tool
    fn descriptor(&self) -> ToolDescriptor;

    /// Execute the tool with validated arguments
    ///
    /// The returned value must be JSON-serialisable; its JSON form is echoed
    /// back to the model as the tool-call result.
    async fn invoke(
        &self,
        args: Map<String, Value>,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_descriptor() -> ToolDescriptor {
        ToolDescriptor::new("search_links", "Search the web")
            .with_input("query", ParamSpec::required(ParamType::String))
            .with_input(
                "num_results",
                ParamSpec::with_default(ParamType::Int, json!(10)),
            )
            .with_output("list<string>")
    }

    #[test]
    fn validates_and_substitutes_defaults() {
        let desc = search_descriptor();
        let args = desc.validate_args(&json!({"query": "tokyo population"})).unwrap();
        assert_eq!(args["query"], "tokyo population");
        assert_eq!(args["num_results"], 10);
    }

    #[test]
    fn rejects_missing_required() {
        let desc = search_descriptor();
        let err = desc.validate_args(&json!({"num_results": 3})).unwrap_err();
        assert_eq!(err.kind, crate::error::ToolErrorKind::Schema);
        assert!(err.message.contains("query"));
    }

    #[test]
    fn rejects_type_mismatch() {
        let desc = search_descriptor();
        let err = desc.validate_args(&json!({"query": 42})).unwrap_err();
        assert_eq!(err.kind, crate::error::ToolErrorKind::Schema);
    }

    #[test]
    fn rejects_non_object_arguments() {
        let desc = search_descriptor();
        assert!(desc.validate_args(&json!("just a string")).is_err());
        // null is treated as the empty object, so required params still fail
        assert!(desc.validate_args(&Value::Null).is_err());
    }

    #[test]
    fn list_types_match_recursively() {
        let t = ParamType::List(Box::new(ParamType::String));
        assert!(t.matches(&json!(["a", "b"])));
        assert!(!t.matches(&json!(["a", 1])));
        assert!(!t.matches(&json!("a")));
        assert_eq!(t.to_string(), "list<string>");
    }

    #[test]
    fn float_accepts_integers() {
        assert!(ParamType::Float.matches(&json!(1)));
        assert!(ParamType::Float.matches(&json!(1.5)));
        assert!(!ParamType::Int.matches(&json!(1.5)));
    }

    #[test]
    fn function_schema_shape() {
        let schema = search_descriptor().to_function_schema();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "search_links");
        assert_eq!(
            schema["function"]["parameters"]["properties"]["query"]["type"],
            "string"
        );
        assert_eq!(schema["function"]["parameters"]["required"][0], "query");
    }
}
