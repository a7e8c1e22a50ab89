use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::agent::state::{
    MessageRole, RunStatus, ToolCallStatus, TurnStatus, TurnStopReason,
};
use crate::core::error::LedgerError;

pub struct RunStartRecord<'a> {
    pub run_id: &'a str,
    pub agent_name: &'a str,
    pub model: &'a str,
    pub turns_total: u32,
}

pub struct TurnStartRecord<'a> {
    pub turn_id: &'a str,
    pub run_id: &'a str,
    pub turn_number: u32,
    pub name: &'a str,
    pub model: &'a str,
}

pub struct MessageRecord<'a> {
    pub run_id: &'a str,
    pub turn_id: &'a str,
    pub role: MessageRole,
    pub content: &'a str,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

pub struct ToolCallStartRecord<'a> {
    pub run_id: &'a str,
    pub turn_id: &'a str,
    pub call_id: &'a str,
    pub tool_name: &'a str,
    pub input: &'a Value,
}

pub enum ToolCallOutcome<'a> {
    Success(&'a Value),
    Error(&'a str),
}

pub struct ToolCallFinishRecord<'a> {
    pub run_id: &'a str,
    pub call_id: &'a str,
    pub outcome: ToolCallOutcome<'a>,
    pub duration_ms: u64,
}

pub struct TurnFinishRecord<'a> {
    pub turn_id: &'a str,
    pub status: TurnStatus,
    pub stop_reason: TurnStopReason,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub tool_call_count: u32,
    pub error: Option<&'a str>,
}

pub struct ProgressRecord<'a> {
    pub run_id: &'a str,
    pub turns_completed: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

pub struct RunFinishRecord<'a> {
    pub run_id: &'a str,
    pub status: RunStatus,
    pub turns_completed: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub error: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRow {
    pub run_id: String,
    pub agent_name: String,
    pub status: RunStatus,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub turns_total: u32,
    pub turns_completed: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub model: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnRow {
    pub turn_id: String,
    pub run_id: String,
    pub turn_number: u32,
    pub name: String,
    pub model: String,
    pub status: TurnStatus,
    pub stop_reason: Option<TurnStopReason>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub tool_call_count: u32,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRow {
    pub id: i64,
    pub turn_id: String,
    pub role: MessageRole,
    pub content: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRow {
    pub call_id: String,
    pub turn_id: String,
    pub tool_name: String,
    pub input: Value,
    pub status: ToolCallStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnHistory {
    pub turn: TurnRow,
    pub messages: Vec<MessageRow>,
    pub tool_calls: Vec<ToolCallRow>,
}

/// Everything persisted for one run, enough to replay the chat and its tool
/// traffic turn by turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunHistory {
    pub run: RunRow,
    pub turns: Vec<TurnHistory>,
}

/// Durable Run/Turn/Message/ToolCall storage.
///
/// Implementations own the state machine: a finished run rejects every
/// further write, tool calls and turns complete at most once, and turn
/// numbers must advance by exactly one.
pub trait LedgerStore: Send + Sync {
    fn start_run(&self, record: RunStartRecord<'_>) -> Result<(), LedgerError>;
    fn start_turn(&self, record: TurnStartRecord<'_>) -> Result<(), LedgerError>;
    fn append_message(&self, record: MessageRecord<'_>) -> Result<i64, LedgerError>;
    fn start_tool_call(&self, record: ToolCallStartRecord<'_>) -> Result<(), LedgerError>;
    fn complete_tool_call(&self, record: ToolCallFinishRecord<'_>) -> Result<(), LedgerError>;
    fn complete_turn(&self, record: TurnFinishRecord<'_>) -> Result<u64, LedgerError>;
    fn record_progress(&self, record: ProgressRecord<'_>) -> Result<(), LedgerError>;
    fn finish_run(&self, record: RunFinishRecord<'_>) -> Result<(), LedgerError>;
    fn load_history(&self, run_id: &str) -> Result<RunHistory, LedgerError>;
    fn list_runs(&self, limit: usize) -> Result<Vec<RunRow>, LedgerError>;
}
