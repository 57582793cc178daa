//! The function-calling protocol loop
//!
//! One run alternates model round-trips and tool dispatches until the model
//! answers in text, the iteration budget runs out, or the caller cancels:
//!
//! ```text
//! AwaitingModel ──text──────────────▶ Done
//!      │  ▲
//!  call│  │tool result appended
//!      ▼  │
//!   DispatchTool ──failed on last iteration──▶ Fallback (no tools) ──▶ Done
//! ```
//!
//! Cancellation is observed before every model call, during it, and before
//! every dispatch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{ModelClient, ModelRequest, ModelResponse};
use crate::registry::ToolRegistry;
use crate::types::{
    ConversationError, ConversationTurn, FunctionCall, Part, Role, ToolCall, ToolDeclaration,
    ToolError, ToolResult,
};

pub const DEFAULT_MAX_ITERATIONS: usize = 6;

const DEFAULT_FALLBACK_INSTRUCTION: &str = "The tools you tried to use failed. Answer the \
     original request as well as you can without calling any tools, and briefly mention that \
     the tools were unavailable.";

/// Settings for a conversation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Model round-trips that may end in a tool call
    pub max_iterations: usize,
    /// System-level instruction sent with every request
    pub system_instruction: Option<String>,
    /// Prompt for the no-tools retry after a failure on the last iteration
    pub fallback_instruction: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            system_instruction: None,
            fallback_instruction: DEFAULT_FALLBACK_INSTRUCTION.to_string(),
        }
    }
}

impl ConversationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the iteration budget
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    /// Builder: set the system instruction
    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Builder: set the fallback prompt
    pub fn with_fallback_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.fallback_instruction = instruction.into();
        self
    }
}

/// Final answer of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationOutcome {
    /// Text for the user; never empty
    pub text: String,
    /// Every dispatched call, in order
    pub tool_calls: Vec<ToolCall>,
    /// Whether the text was synthesized or produced by the no-tools fallback
    pub degraded: bool,
}

/// Mutable state owned by a single run
struct RunState {
    contents: Vec<ConversationTurn>,
    tool_errors: Vec<String>,
    tool_calls: Vec<ToolCall>,
}

impl RunState {
    fn answer(self, text: String) -> ConversationOutcome {
        ConversationOutcome {
            text,
            tool_calls: self.tool_calls,
            degraded: false,
        }
    }

    fn degraded(self, text: String) -> ConversationOutcome {
        ConversationOutcome {
            text,
            tool_calls: self.tool_calls,
            degraded: true,
        }
    }

    /// Fold a model failure into a degraded answer once a tool has failed
    fn absorb(self, err: ConversationError) -> Result<ConversationOutcome, ConversationError> {
        match err {
            ConversationError::Cancelled => Err(err),
            _ if self.tool_errors.is_empty() => Err(err),
            _ => {
                warn!(error = %err, "model request failed after tool errors, degrading");
                let text = format!(
                    "{}\n\nThe model request also failed: {err}",
                    tool_failure_message(&self.tool_errors)
                );
                Ok(self.degraded(text))
            }
        }
    }
}

/// Drives the model ⇄ tool loop
///
/// Holds only shared, read-only collaborators; each [`run`](Self::run) keeps
/// its own turn history, error list and call trace, so one orchestrator may
/// serve concurrent runs.
pub struct ConversationOrchestrator {
    client: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    config: ConversationConfig,
}

impl ConversationOrchestrator {
    pub fn new(client: Arc<dyn ModelClient>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            client,
            registry,
            config: ConversationConfig::default(),
        }
    }

    /// Builder: replace the configuration
    pub fn with_config(mut self, config: ConversationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Turn `contents` into a final answer
    ///
    /// `allowed_tools` limits which registered tools are offered (`None` offers
    /// all). Returns an error only for cancellation, for model failures before
    /// any tool has failed, and for an exhausted budget with no tool errors.
    pub async fn run(
        &self,
        contents: Vec<ConversationTurn>,
        allowed_tools: Option<&[&str]>,
        cancel: &CancellationToken,
    ) -> Result<ConversationOutcome, ConversationError> {
        let declarations = self.registry.declarations(allowed_tools);
        let max_iterations = self.config.max_iterations;
        let mut state = RunState {
            contents,
            tool_errors: Vec::new(),
            tool_calls: Vec::new(),
        };
        let mut iteration = 0;

        while iteration < max_iterations {
            let request = self.request(state.contents.clone(), declarations.clone());
            debug!(iteration, turns = request.contents.len(), "requesting model");
            let response = match self.generate(&request, cancel).await {
                Ok(response) => response,
                Err(err) => return state.absorb(err),
            };

            let call = if declarations.is_empty() {
                None
            } else {
                response.first_function_call().cloned()
            };

            let Some(call) = call else {
                return Ok(Self::finish(state, &response));
            };

            if cancel.is_cancelled() {
                return Err(ConversationError::Cancelled);
            }

            let args = call.parsed_args();
            let result = self.dispatch(&call.name, args.clone(), &declarations).await;
            if !result.ok {
                warn!(tool = %call.name, error = result.error_message(), "tool call failed");
                state
                    .tool_errors
                    .push(format!("{}: {}", call.name, result.error_message()));
            }
            state
                .tool_calls
                .push(ToolCall::new(call.name.clone(), args, result.clone()));

            state.contents.push(model_turn(&response, &call));
            state
                .contents
                .push(ConversationTurn::function_response(&call.name, &result));

            if !result.ok && iteration + 1 == max_iterations {
                return self.fallback(state, cancel).await;
            }
            iteration += 1;
        }

        if state.tool_errors.is_empty() {
            return Err(ConversationError::ExceededMaxIterations(max_iterations));
        }
        warn!(max_iterations, "iteration budget exhausted with tool errors");
        let text = format!(
            "I stopped after {max_iterations} tool rounds without reaching an answer.\n\n{}",
            tool_failure_message(&state.tool_errors)
        );
        Ok(state.degraded(text))
    }

    fn request(
        &self,
        contents: Vec<ConversationTurn>,
        tools: Vec<ToolDeclaration>,
    ) -> ModelRequest {
        ModelRequest {
            contents,
            tools,
            system_instruction: self.config.system_instruction.clone(),
        }
    }

    async fn generate(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ConversationError> {
        if cancel.is_cancelled() {
            return Err(ConversationError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConversationError::Cancelled),
            response = self.client.generate(request) => response.map_err(ConversationError::from),
        }
    }

    async fn dispatch(
        &self,
        name: &str,
        args: serde_json::Value,
        offered: &[ToolDeclaration],
    ) -> ToolResult {
        if !offered.iter().any(|d| d.name == name) {
            return ToolError::UnknownTool(name.to_string()).into();
        }
        debug!(tool = name, "dispatching tool call");
        self.registry.execute(name, args).await
    }

    fn finish(state: RunState, response: &ModelResponse) -> ConversationOutcome {
        let text = response.joined_text();
        if !text.trim().is_empty() {
            return state.answer(text);
        }
        if !state.tool_errors.is_empty() {
            let text = tool_failure_message(&state.tool_errors);
            return state.degraded(text);
        }
        warn!("model returned neither text nor a function call");
        let raw = serde_json::to_string(response).unwrap_or_else(|e| e.to_string());
        state.degraded(raw)
    }

    /// One extra request, exempt from the iteration budget, asking for an
    /// answer without tools
    async fn fallback(
        &self,
        state: RunState,
        cancel: &CancellationToken,
    ) -> Result<ConversationOutcome, ConversationError> {
        info!(
            errors = state.tool_errors.len(),
            "tool failed on the last iteration, retrying without tools"
        );
        let mut contents = state.contents.clone();
        contents.push(ConversationTurn::user(format!(
            "{}\n\nTool errors:\n{}",
            self.config.fallback_instruction,
            bullet_list(&state.tool_errors)
        )));
        let request = self.request(contents, Vec::new());

        let response = match self.generate(&request, cancel).await {
            Ok(response) => response,
            Err(err) => return state.absorb(err),
        };

        let text = response.joined_text();
        if text.trim().is_empty() {
            let text = tool_failure_message(&state.tool_errors);
            return Ok(state.degraded(text));
        }
        let text = if text.to_lowercase().contains("tool") {
            text
        } else {
            format!(
                "Note: some tool calls failed ({}).\n\n{text}",
                state.tool_errors.join("; ")
            )
        };
        Ok(state.degraded(text))
    }
}

/// The model turn recorded in history: its text plus the one dispatched call
fn model_turn(response: &ModelResponse, call: &FunctionCall) -> ConversationTurn {
    let mut parts: Vec<Part> = response
        .parts
        .iter()
        .filter(|part| part.as_text().is_some())
        .cloned()
        .collect();
    parts.push(Part::FunctionCall(call.clone()));
    ConversationTurn::new(Role::Model, parts)
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn tool_failure_message(errors: &[String]) -> String {
    format!(
        "Sorry, I couldn't complete this request because a tool call failed.\n\nTool errors:\n{}",
        bullet_list(errors)
    )
}
