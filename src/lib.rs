//! Tool Conversation - a tool-augmented conversation engine
//!
//! Drives a multi-turn dialogue with a remote language model that may ask for
//! registered tools to be executed before it produces a final answer.
//!
//! ## Components
//!
//! - **`math`** - a closed arithmetic evaluator (no interpreter behind it)
//! - **`engine`** / **`sandbox`** - Rhai script execution with a token denylist,
//!   captured output and two independent deadlines
//! - **`registry`** / **`tools`** - the tool catalogue, model-facing declarations
//!   and the built-in `math_eval`, `run_js` and document tools
//! - **`conversation`** - the function-calling loop with error aggregation,
//!   a no-tools fallback and cancellation
//!
//! The model transport ([`ModelClient`]) and the document store
//! ([`DocumentStore`]) are supplied by the host application.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tool_conversation::{
//!     ConversationOrchestrator, ConversationTurn, SandboxLimits, ToolRegistry,
//! };
//!
//! let registry = Arc::new(ToolRegistry::with_builtins(SandboxLimits::default()));
//! let orchestrator = ConversationOrchestrator::new(Arc::new(my_client), registry);
//!
//! let outcome = orchestrator
//!     .run(
//!         vec![ConversationTurn::user("What is 2^10?")],
//!         Some(&["math_eval"]),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//!
//! println!("{}", outcome.text);
//! ```

pub mod conversation;
pub mod documents;
pub mod engine;
pub mod math;
pub mod model;
pub mod registry;
pub mod sandbox;
pub mod tools;
pub mod types;

// Re-export core types
pub use conversation::{
    ConversationConfig, ConversationOrchestrator, ConversationOutcome, DEFAULT_MAX_ITERATIONS,
};
pub use documents::{DocumentError, DocumentRef, DocumentStore, WriteMode};
pub use engine::{SandboxExecutor, dynamic_to_json};
pub use model::{ModelClient, ModelRequest, ModelResponse};
pub use registry::{
    ParameterSchema, PropertySchema, ToolContext, ToolDefinition, ToolHandler, ToolRegistry,
};
pub use sandbox::{
    DEFAULT_ASYNC_TIMEOUT_MS, DEFAULT_SYNC_TIMEOUT_MS, DENYLIST, MAX_CODE_LENGTH, SandboxLimits,
};
pub use types::{
    ConversationError, ConversationTurn, FunctionCall, FunctionResponse, ModelError, Part, Role,
    ToolCall, ToolDeclaration, ToolError, ToolResult,
};
