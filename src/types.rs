//! Core types for tool calls and conversation turns

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Outcome of a single tool invocation
///
/// Serializes as `{ok: true, result}` or `{ok: false, error}`. Sandbox-backed
/// tools also carry the lines the script logged, on success and on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool completed successfully
    pub ok: bool,
    /// Value produced by the tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message if the tool failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Captured log lines, in emission order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stdout: Vec<String>,
}

impl ToolResult {
    /// Create a successful result
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
            stdout: Vec::new(),
        }
    }

    /// Create a failed result
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.into()),
            stdout: Vec::new(),
        }
    }

    /// Attach captured output
    pub fn with_stdout(mut self, stdout: Vec<String>) -> Self {
        self.stdout = stdout;
        self
    }

    /// Captured output joined into one block
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    /// Error message, or an empty string for successful results
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or_default()
    }
}

impl From<ToolError> for ToolResult {
    fn from(err: ToolError) -> Self {
        ToolResult::failure(err.to_string())
    }
}

/// Record of a single dispatched tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Name of the tool that was called
    pub name: String,
    /// Arguments the call was dispatched with
    pub args: Value,
    /// What the tool returned
    pub response: ToolResult,
}

impl ToolCall {
    /// Create a new tool call record
    pub fn new(name: impl Into<String>, args: Value, response: ToolResult) -> Self {
        Self {
            name: name.into(),
            args,
            response,
        }
    }

    /// Whether the call succeeded
    pub fn succeeded(&self) -> bool {
        self.response.ok
    }
}

/// Model-facing description of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Author of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Function,
}

/// A function-call request emitted by the model
///
/// `args` may arrive either as structured data or as a JSON-encoded string,
/// under either `args` or `arguments`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default, alias = "arguments")]
    pub args: Value,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Arguments as structured data
    ///
    /// String arguments are parsed as JSON; anything unparsable is wrapped as
    /// `{"value": raw}` so dispatch never fails on malformed arguments.
    pub fn parsed_args(&self) -> Value {
        match &self.args {
            Value::Null => Value::Object(serde_json::Map::new()),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Value::Object(map),
                Ok(_) | Err(_) => serde_json::json!({ "value": raw }),
            },
            other => other.clone(),
        }
    }
}

/// A tool's result carried back to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

/// One part of a conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    Text(String),
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Part::FunctionCall(call) => Some(call),
            _ => None,
        }
    }
}

/// A single turn of the dialogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl ConversationTurn {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    /// A user turn with a single text part
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    /// A model turn with a single text part
    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, vec![Part::text(text)])
    }

    /// A function turn answering `name` with the serialized tool result
    pub fn function_response(name: impl Into<String>, result: &ToolResult) -> Self {
        let response = serde_json::to_value(result).unwrap_or(Value::Null);
        Self::new(
            Role::Function,
            vec![Part::FunctionResponse(FunctionResponse {
                name: name.into(),
                response,
            })],
        )
    }
}

/// Errors that can occur while running a tool
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// Bad input shape, length or character class; rejected before execution
    #[error("{0}")]
    Validation(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("{0}")]
    Execution(String),

    /// Stage 1 or stage 2 deadline of the sandbox
    #[error("Execution timed out")]
    Timeout,
}

/// Errors surfaced by a [`ModelClient`](crate::model::ModelClient)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// Credentials were rejected (HTTP 401/403)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Model request failed: {0}")]
    Transport(String),
}

impl ModelError {
    /// Classify an HTTP failure
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => ModelError::Authentication(format!("HTTP {status}: {body}")),
            _ => ModelError::Transport(format!("HTTP {status}: {body}")),
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, ModelError::Authentication(_))
    }
}

/// Errors that end a conversation run without a usable answer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("Generation cancelled")]
    Cancelled,

    #[error("Exceeded maximum tool iterations ({0}) without an answer")]
    ExceededMaxIterations(usize),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Model request failed: {0}")]
    Transport(String),
}

impl From<ModelError> for ConversationError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Authentication(msg) => ConversationError::Authentication(msg),
            ModelError::Transport(msg) => ConversationError::Transport(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_result_wire_shape() {
        let ok = serde_json::to_value(ToolResult::success(json!(3))).unwrap();
        assert_eq!(ok, json!({"ok": true, "result": 3}));

        let failed = ToolResult::failure("boom").with_stdout(vec!["a".into(), "b".into()]);
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value, json!({"ok": false, "error": "boom", "stdout": ["a", "b"]}));
        assert_eq!(failed.stdout_text(), "a\nb");
    }

    #[test]
    fn test_unknown_tool_message() {
        let result: ToolResult = ToolError::UnknownTool("nonexistent".into()).into();
        assert!(!result.ok);
        assert_eq!(result.error_message(), "Unknown tool: nonexistent");
    }

    #[test]
    fn test_part_wire_format() {
        let part: Part = serde_json::from_value(json!({
            "functionCall": {"name": "math_eval", "arguments": "{\"expression\":\"1+1\"}"}
        }))
        .unwrap();
        let call = part.as_function_call().unwrap();
        assert_eq!(call.name, "math_eval");
        assert_eq!(call.parsed_args(), json!({"expression": "1+1"}));

        let text: Part = serde_json::from_value(json!({"text": "hi"})).unwrap();
        assert_eq!(text.as_text(), Some("hi"));
    }

    #[test]
    fn test_malformed_string_args_are_wrapped() {
        let call = FunctionCall::new("run_js", json!("not json {"));
        assert_eq!(call.parsed_args(), json!({"value": "not json {"}));

        let scalar = FunctionCall::new("run_js", json!("42"));
        assert_eq!(scalar.parsed_args(), json!({"value": "42"}));

        let missing = FunctionCall::new("run_js", Value::Null);
        assert_eq!(missing.parsed_args(), json!({}));
    }

    #[test]
    fn test_model_error_classification() {
        assert!(ModelError::from_status(401, "bad key").is_authentication());
        assert!(ModelError::from_status(403, "forbidden").is_authentication());
        assert!(!ModelError::from_status(500, "oops").is_authentication());
        assert_eq!(
            ConversationError::from(ModelError::from_status(429, "slow down")),
            ConversationError::Transport("HTTP 429: slow down".into())
        );
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let turn = ConversationTurn::user("hello");
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(value, json!({"role": "user", "parts": [{"text": "hello"}]}));
    }
}
