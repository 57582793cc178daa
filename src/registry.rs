//! Tool catalogue: model-facing declarations and call dispatch

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::documents::DocumentStore;
use crate::engine::elapsed_ms;
use crate::sandbox::SandboxLimits;
use crate::tools;
use crate::types::{ToolDeclaration, ToolError, ToolResult};

/// External collaborators handed to every tool handler
#[derive(Clone, Default)]
pub struct ToolContext {
    documents: Option<Arc<dyn DocumentStore>>,
}

impl ToolContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: attach the host's document store
    pub fn with_documents(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(store);
        self
    }

    /// The document store, or an error for handlers that require one
    pub fn documents(&self) -> Result<&Arc<dyn DocumentStore>, ToolError> {
        self.documents
            .as_ref()
            .ok_or_else(|| ToolError::Execution("No document store available".into()))
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("documents", &self.documents.is_some())
            .finish()
    }
}

/// Executes one tool call
///
/// Returning `Err` is equivalent to returning a failed [`ToolResult`]; the
/// registry converts it. Any `Fn(Value, ToolContext) -> impl Future` is a handler.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, context: ToolContext) -> Result<ToolResult, ToolError>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolResult, ToolError>> + Send + 'static,
{
    async fn call(&self, args: Value, context: ToolContext) -> Result<ToolResult, ToolError> {
        (self)(args, context).await
    }
}

/// JSON-Schema-like description of one argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub property_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

impl PropertySchema {
    pub fn new(property_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            property_type: property_type.into(),
            description: Some(description.into()),
            enum_values: None,
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::new("string", description)
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self::new("number", description)
    }

    pub fn object(description: impl Into<String>) -> Self {
        Self::new("object", description)
    }

    /// Builder: restrict to a fixed set of string values
    pub fn with_enum(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }
}

/// Parameter description surfaced to the model
///
/// Advisory only: [`ToolRegistry::execute`] does not enforce it, and handlers
/// validate their own arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self::object()
    }
}

impl ParameterSchema {
    /// An object schema with no properties
    pub fn object() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    /// Builder: add an optional property
    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Builder: mark a property as required
    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A registered tool
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
    handler: Arc<dyn ToolHandler>,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ParameterSchema,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(handler),
        }
    }

    pub fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.to_value(),
        }
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Name → tool mapping, built once and shared read-only across runs
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDefinition>,
    context: ToolContext,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in tools
    ///
    /// `math_eval`, `run_js`, `list_documents`, `read_document` and
    /// `write_document`. The document tools fail until a store is attached
    /// with [`with_context`](Self::with_context).
    pub fn with_builtins(limits: SandboxLimits) -> Self {
        let mut registry = Self::new();
        tools::register_builtins(&mut registry, limits);
        registry
    }

    /// Builder: set the collaborators passed to handlers
    pub fn with_context(mut self, context: ToolContext) -> Self {
        self.context = context;
        self
    }

    /// Insert a tool, replacing any tool with the same name
    pub fn register(&mut self, definition: ToolDefinition) {
        if self.tools.contains_key(&definition.name) {
            debug!(tool = %definition.name, "replacing registered tool");
        }
        self.tools.insert(definition.name.clone(), definition);
    }

    /// Register a closure or async fn as a tool
    pub fn register_fn(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ParameterSchema,
        handler: impl ToolHandler + 'static,
    ) {
        self.register(ToolDefinition::new(name, description, parameters, handler));
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// Registered tool names, sorted
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Declarations for the model, optionally restricted to `names`
    ///
    /// Sorted by name. Names that are not registered are ignored.
    pub fn declarations(&self, names: Option<&[&str]>) -> Vec<ToolDeclaration> {
        self.tools
            .values()
            .filter(|def| names.is_none_or(|allowed| allowed.contains(&def.name.as_str())))
            .map(ToolDefinition::declaration)
            .collect()
    }

    /// Run a tool by name
    ///
    /// Never fails: unknown tools, handler errors and handler panics all come
    /// back as `{ok: false, error}`.
    pub async fn execute(&self, name: &str, args: Value) -> ToolResult {
        let Some(definition) = self.tools.get(name) else {
            warn!(tool = name, "call to unknown tool");
            return ToolError::UnknownTool(name.to_string()).into();
        };

        let started = Instant::now();
        let call = definition.handler.call(args, self.context.clone());
        let result = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => err.into(),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                ToolResult::failure(format!("Tool '{name}' panicked: {message}"))
            }
        };

        debug!(
            tool = name,
            ok = result.ok,
            duration_ms = elapsed_ms(started),
            "tool executed"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn echo(args: Value, _context: ToolContext) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::success(args))
    }

    async fn always_fails(_args: Value, _context: ToolContext) -> Result<ToolResult, ToolError> {
        Err(ToolError::Execution("nope".into()))
    }

    async fn panics(_args: Value, _context: ToolContext) -> Result<ToolResult, ToolError> {
        panic!("handler exploded")
    }

    fn echo_schema() -> ParameterSchema {
        ParameterSchema::object()
            .property("text", PropertySchema::string("Text to echo"))
            .required("text")
    }

    #[test]
    fn test_registry_creation() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.declarations(None).is_empty());
    }

    #[test]
    fn test_register_overwrites_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register_fn("echo", "first", echo_schema(), echo);
        registry.register_fn("echo", "second", echo_schema(), echo);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("echo").unwrap().description, "second");
    }

    #[test]
    fn test_declarations_filter_and_shape() {
        let mut registry = ToolRegistry::new();
        registry.register_fn("echo", "Echo text", echo_schema(), echo);
        registry.register_fn("fail", "Always fails", ParameterSchema::object(), always_fails);

        let all: Vec<String> = registry.declarations(None).into_iter().map(|d| d.name).collect();
        assert_eq!(all, vec!["echo", "fail"]);

        let only = registry.declarations(Some(&["echo", "missing"]));
        assert_eq!(only.len(), 1);
        assert_eq!(
            only[0].parameters,
            json!({
                "type": "object",
                "properties": {"text": {"type": "string", "description": "Text to echo"}},
                "required": ["text"]
            })
        );
    }

    #[test]
    fn test_enum_property_serialization() {
        let schema = ParameterSchema::object().property(
            "mode",
            PropertySchema::string("Write mode").with_enum(&["replace", "append"]),
        );
        assert_eq!(
            schema.to_value()["properties"]["mode"]["enum"],
            json!(["replace", "append"])
        );
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let result = registry.execute("nonexistent", json!({})).await;
        assert_eq!(result, ToolResult::failure("Unknown tool: nonexistent"));
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_become_results() {
        let mut registry = ToolRegistry::new();
        registry.register_fn("fail", "", ParameterSchema::object(), always_fails);
        registry.register_fn("boom", "", ParameterSchema::object(), panics);

        assert_eq!(registry.execute("fail", json!({})).await.error_message(), "nope");

        let result = registry.execute("boom", json!({})).await;
        assert!(!result.ok);
        assert!(result.error_message().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_declared_round_trip_and_advisory_schema() {
        let mut registry = ToolRegistry::new();
        registry.register_fn("echo", "Echo text", echo_schema(), echo);

        let declaration = &registry.declarations(None)[0];
        let param = declaration.parameters["required"][0].as_str().unwrap();
        let mut args = serde_json::Map::new();
        args.insert(param.to_string(), json!("hi"));
        let result = registry.execute("echo", Value::Object(args)).await;
        assert_eq!(result.result, Some(json!({"text": "hi"})));

        // Required parameters are not enforced by the registry
        let result = registry.execute("echo", json!({})).await;
        assert!(result.ok);
    }

    #[tokio::test]
    async fn test_closure_handler_sees_context() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(
            "has_store",
            "",
            ParameterSchema::object(),
            |_args: Value, context: ToolContext| async move {
                Ok::<_, ToolError>(ToolResult::success(json!(context.documents().is_ok())))
            },
        );
        assert_eq!(
            registry.execute("has_store", json!({})).await.result,
            Some(json!(false))
        );
    }
}
