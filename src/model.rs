//! Contract with the remote language model

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ConversationTurn, FunctionCall, ModelError, Part, ToolDeclaration};

/// One generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    pub contents: Vec<ConversationTurn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclaration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
}

/// The model's candidate answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub parts: Vec<Part>,
}

impl ModelResponse {
    pub fn new(parts: Vec<Part>) -> Self {
        Self { parts }
    }

    /// A response holding a single text part
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![Part::text(text)])
    }

    /// A response holding a single function call
    pub fn function_call(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self::new(vec![Part::FunctionCall(FunctionCall::new(name, args))])
    }

    /// First function call among the parts
    pub fn first_function_call(&self) -> Option<&FunctionCall> {
        self.parts.iter().find_map(Part::as_function_call)
    }

    /// All text parts concatenated
    pub fn joined_text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }
}

/// Sends requests to the remote model
///
/// Implementations own transport and credentials. HTTP 401/403 must surface
/// as [`ModelError::Authentication`] (see [`ModelError::from_status`]).
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_helpers() {
        let response: ModelResponse = serde_json::from_value(json!({
            "parts": [
                {"text": "Let me "},
                {"functionCall": {"name": "math_eval", "args": {"expression": "1+1"}}},
                {"text": "check."},
                {"functionCall": {"name": "run_js", "args": {}}}
            ]
        }))
        .unwrap();
        assert_eq!(response.joined_text(), "Let me check.");
        assert_eq!(response.first_function_call().unwrap().name, "math_eval");
        assert!(ModelResponse::text("hi").first_function_call().is_none());
    }

    #[test]
    fn test_request_serialization_omits_empty_fields() {
        let request = ModelRequest {
            contents: vec![ConversationTurn::user("hi")],
            tools: Vec::new(),
            system_instruction: None,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]})
        );
    }
}
