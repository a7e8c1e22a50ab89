use std::time::Duration;

use thiserror::Error;

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Failures talking to a tool-provider process. Always folded into a tool
/// result; never fatal to a run.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn provider '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("provider io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("provider handshake failed: {0}")]
    Handshake(String),
    #[error("provider exited before responding{}", stderr_suffix(.stderr))]
    Exited { stderr: String },
    #[error("provider connection closed")]
    Closed,
    #[error("provider protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("tool timed out after {}ms{}", millis(.after), stderr_suffix(.stderr))]
    Timeout { after: Duration, stderr: String },
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool call cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::Transport(_) => "transport_error",
            ToolError::Timeout { .. } => "timeout",
            ToolError::Execution(_) => "execution_error",
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::Cancelled => "cancelled",
        }
    }
}

/// Upstream completion-service rejection. Fatal to the turn and the run.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Http(String),
    #[error("completion service error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("failed to decode completion response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create ledger directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("turn not found: {0}")]
    TurnNotFound(String),
    #[error("run {0} is already finalized")]
    RunFinalized(String),
    #[error("tool call {0} was already started")]
    DuplicateToolCall(String),
    #[error("tool call {0} is unknown")]
    ToolCallNotFound(String),
    #[error("tool call {0} was already completed")]
    ToolCallAlreadyCompleted(String),
    #[error("turn {0} was already completed")]
    TurnAlreadyCompleted(String),
    #[error("turn number {got} out of order, expected {expected}")]
    TurnOutOfOrder { expected: u32, got: u32 },
}

/// Turn- and run-level failures. Any of these finalizes the run as `error`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("run cancelled")]
    Cancelled,
    #[error("run panicked: {0}")]
    Panicked(String),
}

fn millis(duration: &Duration) -> u128 {
    duration.as_millis()
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("; stderr: {trimmed}")
    }
}
