//! Rhai engine setup and two-stage sandboxed script execution

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, CorePackage, LogicPackage,
    MoreStringPackage, Package,
};
use rhai::{AST, Dynamic, Engine, EvalAltResult, FnPtr, Scope};
use serde_json::Value;
use tracing::debug;

use crate::sandbox::{SandboxLimits, validate_code};
use crate::types::{ToolError, ToolResult};

/// How many operations run between deadline checks
const DEADLINE_CHECK_INTERVAL: u64 = 64;

type SharedLines = Arc<Mutex<Vec<String>>>;

/// Log sink exposed to scripts as `console`
#[derive(Clone)]
struct Console {
    lines: SharedLines,
}

impl Console {
    fn log(&mut self, values: &[Dynamic]) {
        let line = values
            .iter()
            .map(format_log_value)
            .collect::<Vec<_>>()
            .join(" ");
        push_line(&self.lines, line);
    }
}

fn push_line(lines: &SharedLines, line: String) {
    lines
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(line);
}

fn snapshot(lines: &SharedLines) -> Vec<String> {
    lines.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn format_log_value(value: &Dynamic) -> String {
    if value.is_string() {
        value.clone().into_string().unwrap_or_default()
    } else {
        dynamic_to_json(value).to_string()
    }
}

/// Runs untrusted Rhai scripts under two independent deadlines
///
/// Every call builds a fresh engine and scope, so nothing leaks between
/// invocations. The script sees only:
///
/// - `input`: the bound input value (read-only)
/// - `console.log(...)`, `print(...)`, `debug(...)`: appended to the captured output
/// - `json_parse(text)` / `json_stringify(value)`
/// - the core language plus math, logic, string, array and map functions
///
/// Stage 1 compiles and evaluates the script with an interpreter-level deadline
/// of `sync_timeout_ms`, which preempts tight loops. If the script evaluates to
/// a closure, that closure is its deferred continuation: stage 2 runs it raced
/// against a timer of `async_timeout_ms`. Any other value is the result.
#[derive(Debug, Clone, Default)]
pub struct SandboxExecutor {
    limits: SandboxLimits,
}

impl SandboxExecutor {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Execute `code` with `input` bound in scope
    ///
    /// Never panics and never returns early without the captured output.
    pub async fn run(&self, code: &str, input: Value) -> ToolResult {
        let start_time = Instant::now();
        if let Err(err) = validate_code(code, &self.limits) {
            debug!(error = %err, "script rejected before execution");
            return err.into();
        }

        let lines: SharedLines = Arc::new(Mutex::new(Vec::new()));
        let outcome = self.execute(code.to_string(), input, Arc::clone(&lines)).await;
        let stdout = snapshot(&lines);
        let elapsed_ms = elapsed_ms(start_time);

        match outcome {
            Ok(value) => {
                debug!(elapsed_ms, lines = stdout.len(), "script completed");
                ToolResult::success(value).with_stdout(stdout)
            }
            Err(err) => {
                debug!(elapsed_ms, error = %err, "script failed");
                ToolResult::from(err).with_stdout(stdout)
            }
        }
    }

    async fn execute(
        &self,
        code: String,
        input: Value,
        lines: SharedLines,
    ) -> Result<Value, ToolError> {
        let input = rhai::serde::to_dynamic(&input)
            .map_err(|e| ToolError::Validation(format!("Invalid input: {e}")))?;
        let engine = build_engine(&self.limits, &lines);
        let limits = self.limits.clone();

        // Stage 1: body under the interpreter deadline
        let sync_timeout = limits.sync_timeout();
        let stage_one = tokio::task::spawn_blocking(move || {
            let mut engine = engine;
            arm_deadline(&mut engine, sync_timeout);

            let ast = engine
                .compile(&code)
                .map_err(|e| ToolError::Execution(format!("Script compilation failed: {e}")))?;

            let mut scope = Scope::new();
            scope.push_constant("input", input);
            scope.push("console", Console { lines });

            let value = engine
                .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
                .map_err(|e| map_eval_error(*e, &limits))?;
            Ok::<_, ToolError>((engine, ast, value, limits))
        });

        let (engine, ast, value, limits) = stage_one
            .await
            .map_err(|e| ToolError::Execution(format!("Script execution failed: {e}")))??;

        // Stage 2: a returned closure races the async deadline
        let Some(continuation) = value.clone().try_cast::<FnPtr>() else {
            return Ok(dynamic_to_json(&value));
        };
        debug!("script returned a continuation, awaiting it");

        let async_timeout = limits.async_timeout();
        let stage_two = tokio::task::spawn_blocking(move || {
            let mut engine = engine;
            arm_deadline(&mut engine, async_timeout);
            continuation
                .call::<Dynamic>(&engine, &ast, ())
                .map_err(|e| map_eval_error(*e, &limits))
        });

        match tokio::time::timeout(async_timeout, stage_two).await {
            Err(_) => Err(ToolError::Timeout),
            Ok(Err(e)) => Err(ToolError::Execution(format!("Script execution failed: {e}"))),
            Ok(Ok(result)) => result.map(|v| dynamic_to_json(&v)),
        }
    }
}

/// Milliseconds since `start`, saturating at `u64::MAX`
pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn build_engine(limits: &SandboxLimits, lines: &SharedLines) -> Engine {
    let mut engine = Engine::new_raw();

    CorePackage::new().register_into_engine(&mut engine);
    LogicPackage::new().register_into_engine(&mut engine);
    BasicMathPackage::new().register_into_engine(&mut engine);
    MoreStringPackage::new().register_into_engine(&mut engine);
    BasicArrayPackage::new().register_into_engine(&mut engine);
    BasicMapPackage::new().register_into_engine(&mut engine);

    // No module loading, no dynamic evaluation
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");
    engine.disable_symbol("import");
    engine.disable_symbol("export");

    // Apply limits
    engine.set_max_operations(limits.max_operations);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);
    engine.set_max_expr_depths(64, 64);

    let print_lines = Arc::clone(lines);
    engine.on_print(move |text| push_line(&print_lines, text.to_string()));
    let debug_lines = Arc::clone(lines);
    engine.on_debug(move |text, _source, _pos| push_line(&debug_lines, text.to_string()));

    engine.register_type_with_name::<Console>("Console");
    engine.register_fn("log", |c: &mut Console, a: Dynamic| c.log(&[a]));
    engine.register_fn("log", |c: &mut Console, a: Dynamic, b: Dynamic| c.log(&[a, b]));
    engine.register_fn("log", |c: &mut Console, a: Dynamic, b: Dynamic, d: Dynamic| {
        c.log(&[a, b, d])
    });
    engine.register_fn(
        "log",
        |c: &mut Console, a: Dynamic, b: Dynamic, d: Dynamic, e: Dynamic| c.log(&[a, b, d, e]),
    );

    engine.register_fn("json_stringify", |value: Dynamic| -> String {
        dynamic_to_json(&value).to_string()
    });
    engine.register_fn(
        "json_parse",
        |text: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
            rhai::serde::to_dynamic(value)
        },
    );

    engine
}

fn arm_deadline(engine: &mut Engine, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    engine.on_progress(move |ops| {
        if ops % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });
}

fn map_eval_error(err: EvalAltResult, limits: &SandboxLimits) -> ToolError {
    match err {
        EvalAltResult::ErrorTerminated(..) => ToolError::Timeout,
        EvalAltResult::ErrorTooManyOperations(_) => ToolError::Execution(format!(
            "Script exceeded maximum operations ({})",
            limits.max_operations
        )),
        other => ToolError::Execution(format!("Script execution failed: {other}")),
    }
}

/// Convert Rhai Dynamic to serde_json::Value
pub fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_string() {
        Value::String(value.clone().into_string().unwrap_or_default())
    } else if value.is_int() {
        Value::from(value.as_int().unwrap_or(0))
    } else if value.is_float() {
        serde_json::json!(value.as_float().unwrap_or(0.0))
    } else if value.is_bool() {
        Value::Bool(value.as_bool().unwrap_or(false))
    } else if value.is_char() {
        Value::String(value.as_char().map(String::from).unwrap_or_default())
    } else if value.is_array() {
        let arr: Vec<Dynamic> = value.clone().into_array().unwrap_or_default();
        Value::Array(arr.iter().map(dynamic_to_json).collect())
    } else if value.is_map() {
        let map: rhai::Map = value.clone().cast();
        let json_map = map
            .iter()
            .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
            .collect();
        Value::Object(json_map)
    } else if value.is_unit() {
        Value::Null
    } else {
        Value::String(format!("{:?}", value))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn executor() -> SandboxExecutor {
        SandboxExecutor::new(SandboxLimits::default())
    }

    #[tokio::test]
    async fn test_simple_script() {
        let result = executor().run("let x = 1 + 2; x", json!(null)).await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.result, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_string_interpolation() {
        let result = executor()
            .run(r#"let name = "world"; `Hello, ${name}!`"#, json!(null))
            .await;
        assert_eq!(result.result, Some(json!("Hello, world!")));
    }

    #[tokio::test]
    async fn test_input_binding_and_map_result() {
        let result = executor()
            .run(
                "let total = 0; for n in input.numbers { total += n; } #{ total: total, count: input.numbers.len() }",
                json!({"numbers": [1, 2, 3, 4]}),
            )
            .await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.result, Some(json!({"total": 10, "count": 4})));
    }

    #[tokio::test]
    async fn test_console_capture() {
        let result = executor()
            .run(
                r#"console.log("sum", 1 + 1); print("printed"); console.log(#{a: 1}); 42"#,
                json!(null),
            )
            .await;
        assert!(result.ok);
        assert_eq!(result.stdout, vec!["sum 2", "printed", r#"{"a":1}"#]);
    }

    #[tokio::test]
    async fn test_stdout_kept_on_failure() {
        let result = executor()
            .run(r#"console.log("before"); throw "boom";"#, json!(null))
            .await;
        assert!(!result.ok);
        assert!(result.error_message().contains("boom"));
        assert_eq!(result.stdout, vec!["before"]);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let result = executor()
            .run(
                r#"let v = json_parse("{\"a\": [1, 2]}"); v.a.push(3); json_stringify(v)"#,
                json!(null),
            )
            .await;
        assert_eq!(result.result, Some(json!(r#"{"a":[1,2,3]}"#)));
    }

    #[tokio::test]
    async fn test_compilation_error() {
        let result = executor()
            .run("this is not valid rhai syntax {{{{", json!(null))
            .await;
        assert!(!result.ok);
        assert!(result.error_message().starts_with("Script compilation failed"));
    }

    #[tokio::test]
    async fn test_sync_loop_hits_stage_one_deadline() {
        let limits = SandboxLimits::default()
            .with_sync_timeout_ms(50)
            .with_async_timeout_ms(5_000);
        let start = Instant::now();
        let result = SandboxExecutor::new(limits)
            .run("while(true){}", json!(null))
            .await;
        assert!(!result.ok);
        assert_eq!(result.error_message(), "Execution timed out");
        assert!(start.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_continuation_runs_in_stage_two() {
        let result = executor()
            .run("let base = 40; || base + 2", json!(null))
            .await;
        assert!(result.ok, "{:?}", result.error);
        assert_eq!(result.result, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_hanging_continuation_hits_stage_two_deadline() {
        let limits = SandboxLimits::default()
            .with_sync_timeout_ms(5_000)
            .with_async_timeout_ms(50);
        let start = Instant::now();
        let result = SandboxExecutor::new(limits)
            .run(r#"console.log("armed"); || { loop {} }"#, json!(null))
            .await;
        assert_eq!(result.error_message(), "Execution timed out");
        assert_eq!(result.stdout, vec!["armed"]);
        assert!(start.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_max_operations_limit() {
        let limits = SandboxLimits::default().with_max_operations(10);
        let result = SandboxExecutor::new(limits)
            .run("let sum = 0; for i in 0..1000 { sum += i; } sum", json!(null))
            .await;
        assert_eq!(
            result.error_message(),
            "Script exceeded maximum operations (10)"
        );
    }

    #[tokio::test]
    async fn test_no_module_or_eval_access() {
        // Bypass the denylist; the engine itself must refuse these
        for code in [r#"import "std" as s; 1"#, r#"eval("1 + 1")"#] {
            let lines: SharedLines = Arc::new(Mutex::new(Vec::new()));
            let outcome = executor().execute(code.to_string(), json!(null), lines).await;
            assert!(outcome.is_err(), "{code} should fail");
        }
    }

    #[test]
    fn test_elapsed_ms() {
        let start = Instant::now() - Duration::from_millis(250);
        let elapsed = elapsed_ms(start);
        assert!((250..60_000).contains(&elapsed), "{elapsed}");
    }

    #[test]
    fn test_dynamic_to_json() {
        let mut map = rhai::Map::new();
        map.insert("flag".into(), Dynamic::from(true));
        map.insert("items".into(), Dynamic::from_array(vec![Dynamic::from(1_i64), Dynamic::UNIT]));
        assert_eq!(
            dynamic_to_json(&Dynamic::from_map(map)),
            json!({"flag": true, "items": [1, null]})
        );
        assert_eq!(dynamic_to_json(&Dynamic::from(2.5_f64)), json!(2.5));
    }
}
