//! Built-in tools registered by [`ToolRegistry::with_builtins`]

use serde_json::{Value, json};

use crate::documents::WriteMode;
use crate::engine::SandboxExecutor;
use crate::math;
use crate::registry::{ParameterSchema, PropertySchema, ToolContext, ToolDefinition, ToolRegistry};
use crate::sandbox::{SandboxLimits, validate_code};
use crate::types::{ToolError, ToolResult};

pub const MATH_EVAL: &str = "math_eval";
pub const RUN_JS: &str = "run_js";
pub const LIST_DOCUMENTS: &str = "list_documents";
pub const READ_DOCUMENT: &str = "read_document";
pub const WRITE_DOCUMENT: &str = "write_document";

/// Longest document text handed back to the model, in characters
pub const MAX_READ_CHARS: usize = 20_000;

/// Register every built-in tool into `registry`
pub fn register_builtins(registry: &mut ToolRegistry, limits: SandboxLimits) {
    registry.register(math_eval_tool());
    registry.register(run_js_tool(limits));
    registry.register(list_documents_tool());
    registry.register(read_document_tool());
    registry.register(write_document_tool());
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::Validation(format!("Missing required string argument: {key}")))
}

fn optional_str<'a>(args: &'a Value, key: &str) -> Result<Option<&'a str>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ToolError::Validation(format!(
            "Argument {key} must be a string"
        ))),
    }
}

/// Integral values come back as JSON integers, non-finite ones as strings
fn number_to_json(value: f64) -> Value {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if value.is_nan() {
        json!("NaN")
    } else if value.is_infinite() {
        json!(if value > 0.0 { "Infinity" } else { "-Infinity" })
    } else if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        json!(value as i64)
    } else {
        json!(value)
    }
}

// ============================================================================
// math_eval
// ============================================================================

fn math_eval_tool() -> ToolDefinition {
    ToolDefinition::new(
        MATH_EVAL,
        "Evaluate an arithmetic expression. Supports + - * / % ^ (power), parentheses, \
         pi, e and the functions log(base, n), factorial(n), avg(...), abs, round, ceil, \
         floor, lcm(a, b), hcf(a, b), sin, cos, tan, asin, acos, atan.",
        ParameterSchema::object()
            .property(
                "expression",
                PropertySchema::string("The expression to evaluate, e.g. \"log(2, 8) + 2^10\""),
            )
            .required("expression"),
        math_eval,
    )
}

async fn math_eval(args: Value, _context: ToolContext) -> Result<ToolResult, ToolError> {
    let expression = required_str(&args, "expression")?;
    let value = math::evaluate(expression)?;
    Ok(ToolResult::success(number_to_json(value)))
}

// ============================================================================
// run_js
// ============================================================================

fn run_js_tool(limits: SandboxLimits) -> ToolDefinition {
    let description = format!(
        "Run a short Rhai script (JavaScript-like syntax) in an isolated sandbox and \
         return its final value. `input` holds the optional input value; console.log(...) \
         and print(...) output is captured. json_parse/json_stringify are available. \
         Return a closure (|| ...) to continue work after the main body. No file, network \
         or module access. Limits: {} characters, {}ms body, {}ms continuation.",
        limits.max_code_length, limits.sync_timeout_ms, limits.async_timeout_ms
    );
    let executor = SandboxExecutor::new(limits);

    ToolDefinition::new(
        RUN_JS,
        description,
        ParameterSchema::object()
            .property("code", PropertySchema::string("The Rhai script to execute"))
            .property(
                "input",
                PropertySchema::object("Optional value bound to `input` inside the script"),
            )
            .required("code"),
        move |args: Value, _context: ToolContext| run_script(executor.clone(), args),
    )
}

async fn run_script(executor: SandboxExecutor, args: Value) -> Result<ToolResult, ToolError> {
    let Some(code) = args.get("code").and_then(Value::as_str) else {
        return Err(ToolError::Validation("Code is missing or too long".into()));
    };
    validate_code(code, executor.limits())?;

    let input = args.get("input").cloned().unwrap_or(Value::Null);
    Ok(executor.run(code, input).await)
}

// ============================================================================
// Document store tools
// ============================================================================

fn list_documents_tool() -> ToolDefinition {
    ToolDefinition::new(
        LIST_DOCUMENTS,
        "List documents in the user's document store, optionally filtered by a name query.",
        ParameterSchema::object().property(
            "query",
            PropertySchema::string("Case-insensitive name filter; omit to list everything"),
        ),
        list_documents,
    )
}

async fn list_documents(args: Value, context: ToolContext) -> Result<ToolResult, ToolError> {
    let store = context.documents()?;
    let query = optional_str(&args, "query")?.unwrap_or_default();
    let documents = store
        .list_documents(query)
        .await
        .map_err(|e| ToolError::Execution(e.to_string()))?;
    let listing = serde_json::to_value(documents)
        .map_err(|e| ToolError::Execution(e.to_string()))?;
    Ok(ToolResult::success(listing))
}

fn read_document_tool() -> ToolDefinition {
    ToolDefinition::new(
        READ_DOCUMENT,
        "Read the full text of a document by its path.",
        ParameterSchema::object()
            .property(
                "path",
                PropertySchema::string("Document locator as returned by list_documents"),
            )
            .required("path"),
        read_document,
    )
}

async fn read_document(args: Value, context: ToolContext) -> Result<ToolResult, ToolError> {
    let store = context.documents()?;
    let path = required_str(&args, "path")?;
    let content = store
        .read_document(path)
        .await
        .map_err(|e| ToolError::Execution(e.to_string()))?;

    let text = if content.chars().count() > MAX_READ_CHARS {
        let truncated: String = content.chars().take(MAX_READ_CHARS).collect();
        format!("{truncated}... (truncated)")
    } else {
        content
    };
    Ok(ToolResult::success(Value::String(text)))
}

fn write_document_tool() -> ToolDefinition {
    ToolDefinition::new(
        WRITE_DOCUMENT,
        "Write text to a document, replacing its content or appending to it.",
        ParameterSchema::object()
            .property("path", PropertySchema::string("Document locator to write"))
            .property("content", PropertySchema::string("Text to write"))
            .property(
                "mode",
                PropertySchema::string("Whether to replace the document or append to it")
                    .with_enum(&["replace", "append"]),
            )
            .required("path")
            .required("content"),
        write_document,
    )
}

async fn write_document(args: Value, context: ToolContext) -> Result<ToolResult, ToolError> {
    let store = context.documents()?;
    let path = required_str(&args, "path")?;
    let content = required_str(&args, "content")?;
    let mode = match optional_str(&args, "mode")? {
        Some(mode) => mode
            .parse::<WriteMode>()
            .map_err(|e| ToolError::Validation(e.to_string()))?,
        None => WriteMode::default(),
    };
    if path.trim().is_empty() {
        return Err(ToolError::Validation("Document path is empty".into()));
    }

    store
        .write_document(path, content, mode)
        .await
        .map_err(|e| ToolError::Execution(e.to_string()))?;
    Ok(ToolResult::success(json!({
        "path": path,
        "mode": mode.as_str(),
        "bytes": content.len(),
    })))
}
