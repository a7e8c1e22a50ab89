use serde_json::Value;

use crate::core::error::{LedgerError, ToolError};
use crate::core::ports::llm::TokenUsage;
use crate::core::ports::store::{
    LedgerStore, MessageRecord, ProgressRecord, RunFinishRecord, ToolCallFinishRecord,
    ToolCallOutcome, TurnFinishRecord,
};

use super::state::{MessageRole, RunStatus, TurnStatus, TurnStopReason};

pub(super) fn append_message_ledger(
    store: &dyn LedgerStore,
    run_id: &str,
    turn_id: &str,
    role: MessageRole,
    content: &str,
    usage: Option<&TokenUsage>,
) -> Result<i64, LedgerError> {
    store.append_message(MessageRecord {
        run_id,
        turn_id,
        role,
        content,
        input_tokens: usage.map(|usage| usage.input_tokens),
        output_tokens: usage.map(|usage| usage.output_tokens),
    })
}

pub(super) fn complete_tool_call_ledger(
    store: &dyn LedgerStore,
    run_id: &str,
    call_id: &str,
    result: &Result<Value, ToolError>,
    duration_ms: u64,
) -> Result<(), LedgerError> {
    let message;
    let outcome = match result {
        Ok(output) => ToolCallOutcome::Success(output),
        Err(err) => {
            message = err.to_string();
            ToolCallOutcome::Error(&message)
        }
    };
    store.complete_tool_call(ToolCallFinishRecord {
        run_id,
        call_id,
        outcome,
        duration_ms,
    })
}

#[allow(clippy::too_many_arguments)]
pub(super) fn complete_turn_ledger(
    store: &dyn LedgerStore,
    turn_id: &str,
    stop_reason: TurnStopReason,
    usage: &TokenUsage,
    cost_usd: f64,
    tool_call_count: u32,
    error: Option<&str>,
) -> Result<u64, LedgerError> {
    let status = if error.is_some() {
        TurnStatus::Error
    } else {
        TurnStatus::Success
    };
    store.complete_turn(TurnFinishRecord {
        turn_id,
        status,
        stop_reason,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cost_usd,
        tool_call_count,
        error,
    })
}

pub(super) fn record_progress_ledger(
    store: &dyn LedgerStore,
    run_id: &str,
    turns_completed: u32,
    usage: &TokenUsage,
    cost_usd: f64,
) -> Result<(), LedgerError> {
    store.record_progress(ProgressRecord {
        run_id,
        turns_completed,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cost_usd,
    })
}

pub(super) fn finish_run_ledger(
    store: &dyn LedgerStore,
    run_id: &str,
    status: RunStatus,
    turns_completed: u32,
    usage: &TokenUsage,
    cost_usd: f64,
    error: Option<&str>,
) -> Result<(), LedgerError> {
    store.finish_run(RunFinishRecord {
        run_id,
        status,
        turns_completed,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cost_usd,
        error,
    })
}
