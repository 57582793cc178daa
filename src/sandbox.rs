//! Execution limits and pre-execution checks for sandboxed scripts

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::ToolError;

/// Default stage-1 (synchronous) deadline
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 2_000;
/// Default stage-2 (deferred continuation) deadline
pub const DEFAULT_ASYNC_TIMEOUT_MS: u64 = 3_000;
/// Longest script accepted, in characters
pub const MAX_CODE_LENGTH: usize = 4_000;

pub const QUICK_SYNC_TIMEOUT_MS: u64 = 500;
pub const QUICK_ASYNC_TIMEOUT_MS: u64 = 1_000;
pub const EXTENDED_SYNC_TIMEOUT_MS: u64 = 10_000;
pub const EXTENDED_ASYNC_TIMEOUT_MS: u64 = 20_000;

/// Identifiers that grant (or would grant, on a less restricted host) access
/// to module loading, processes, the filesystem, the network, threads,
/// dynamic code construction, timers or introspection.
pub const DENYLIST: &[&str] = &[
    "require",
    "import",
    "export",
    "eval",
    "Fn",
    "call",
    "curry",
    "process",
    "fs",
    "child_process",
    "spawn",
    "exec",
    "worker",
    "Worker",
    "thread",
    "net",
    "socket",
    "http",
    "fetch",
    "XMLHttpRequest",
    "Function",
    "globalThis",
    "global",
    "module",
    "sleep",
    "timestamp",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "Deno",
];

static DENYLIST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    let alternatives: Vec<String> = DENYLIST.iter().map(|t| regex::escape(t)).collect();
    Regex::new(&format!(r"\b({})\b", alternatives.join("|")))
        .expect("denylist pattern is valid")
});

/// Limits for safe script execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Deadline for compiling and evaluating the script body
    pub sync_timeout_ms: u64,
    /// Deadline for a returned closure to finish
    pub async_timeout_ms: u64,
    /// Maximum number of operations (0 = unlimited; the deadlines govern)
    pub max_operations: u64,
    /// Maximum string size in bytes
    pub max_string_size: usize,
    /// Maximum array size
    pub max_array_size: usize,
    /// Maximum map size
    pub max_map_size: usize,
    /// Maximum script length in characters
    pub max_code_length: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            async_timeout_ms: DEFAULT_ASYNC_TIMEOUT_MS,
            max_operations: 0,
            max_string_size: 1_000_000, // 1MB
            max_array_size: 10_000,
            max_map_size: 1_000,
            max_code_length: MAX_CODE_LENGTH,
        }
    }
}

impl SandboxLimits {
    /// Create new limits with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Tight deadlines for interactive use
    pub fn quick() -> Self {
        Self {
            sync_timeout_ms: QUICK_SYNC_TIMEOUT_MS,
            async_timeout_ms: QUICK_ASYNC_TIMEOUT_MS,
            ..Default::default()
        }
    }

    /// Generous deadlines for heavier data processing
    pub fn extended() -> Self {
        Self {
            sync_timeout_ms: EXTENDED_SYNC_TIMEOUT_MS,
            async_timeout_ms: EXTENDED_ASYNC_TIMEOUT_MS,
            max_array_size: 100_000,
            max_map_size: 10_000,
            ..Default::default()
        }
    }

    /// Builder: set the stage-1 deadline
    pub fn with_sync_timeout_ms(mut self, timeout: u64) -> Self {
        self.sync_timeout_ms = timeout;
        self
    }

    /// Builder: set the stage-2 deadline
    pub fn with_async_timeout_ms(mut self, timeout: u64) -> Self {
        self.async_timeout_ms = timeout;
        self
    }

    /// Builder: set max operations
    pub fn with_max_operations(mut self, max: u64) -> Self {
        self.max_operations = max;
        self
    }

    /// Builder: set max string size
    pub fn with_max_string_size(mut self, size: usize) -> Self {
        self.max_string_size = size;
        self
    }

    /// Builder: set max array size
    pub fn with_max_array_size(mut self, size: usize) -> Self {
        self.max_array_size = size;
        self
    }

    /// Builder: set max map size
    pub fn with_max_map_size(mut self, size: usize) -> Self {
        self.max_map_size = size;
        self
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout_ms)
    }
}

/// First denylisted token appearing as a whole word in `code`
pub fn find_blocked_token(code: &str) -> Option<&'static str> {
    let found = DENYLIST_PATTERN.find(code)?;
    DENYLIST.iter().copied().find(|t| *t == found.as_str())
}

/// Reject scripts that are empty, too long or mention a denylisted token
///
/// Runs before the script is compiled, so nothing in a rejected script is
/// ever evaluated.
pub fn validate_code(code: &str, limits: &SandboxLimits) -> Result<(), ToolError> {
    if code.trim().is_empty() || code.chars().count() > limits.max_code_length {
        return Err(ToolError::Validation("Code is missing or too long".into()));
    }
    if let Some(token) = find_blocked_token(code) {
        return Err(ToolError::Validation(format!(
            "Blocked token in code: {token}"
        )));
    }
    Ok(())
}
