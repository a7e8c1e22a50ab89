use serde_json::{json, Value};

use crate::core::ports::emitter::EmitterPort;
use crate::core::ports::llm::TokenUsage;

use super::state::{RunStatus, TurnPhase, TurnStopReason};

pub(super) fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(super) fn emit_run_state(
    emitter: &dyn EmitterPort,
    run_id: &str,
    status: RunStatus,
    turns_completed: u32,
    reason: Option<&str>,
) {
    let mut payload = serde_json::Map::new();
    payload.insert("run_id".to_string(), json!(run_id));
    payload.insert("state".to_string(), json!(status.as_str()));
    payload.insert("turns_completed".to_string(), json!(turns_completed));
    payload.insert("ts".to_string(), json!(now_iso()));
    if let Some(reason) = reason {
        payload.insert("reason".to_string(), json!(reason));
    }
    emitter.emit("agent:run_state", &Value::Object(payload));
}

pub(super) fn emit_turn_phase(
    emitter: &dyn EmitterPort,
    run_id: &str,
    turn_number: u32,
    step: u32,
    phase: TurnPhase,
) {
    emitter.emit(
        "agent:turn_state",
        &json!({
            "run_id": run_id,
            "turn": turn_number,
            "step": step,
            "phase": phase.as_str(),
            "ts": now_iso(),
        }),
    );
}

pub(super) fn emit_tool_start(
    emitter: &dyn EmitterPort,
    run_id: &str,
    turn_number: u32,
    call_id: &str,
    tool: &str,
    args: &Value,
) {
    emitter.emit(
        "agent:tool_start",
        &json!({
            "run_id": run_id,
            "turn": turn_number,
            "id": call_id,
            "tool": tool,
            "args": args,
            "ts": now_iso(),
        }),
    );
}

#[allow(clippy::too_many_arguments)]
pub(super) fn emit_tool_result(
    emitter: &dyn EmitterPort,
    run_id: &str,
    turn_number: u32,
    call_id: &str,
    tool: &str,
    ok: bool,
    duration_ms: u64,
    error: Option<(&str, String)>,
) {
    let mut payload = serde_json::Map::new();
    payload.insert("run_id".to_string(), json!(run_id));
    payload.insert("turn".to_string(), json!(turn_number));
    payload.insert("id".to_string(), json!(call_id));
    payload.insert("tool".to_string(), json!(tool));
    payload.insert("ok".to_string(), json!(ok));
    payload.insert("duration_ms".to_string(), json!(duration_ms));
    payload.insert("ts".to_string(), json!(now_iso()));
    if let Some((code, message)) = error {
        payload.insert("error".to_string(), json!({ "code": code, "message": message }));
    }
    emitter.emit("agent:tool_result", &Value::Object(payload));
}

pub(super) fn emit_token_usage(
    emitter: &dyn EmitterPort,
    run_id: &str,
    turn_number: u32,
    step: u32,
    usage: &TokenUsage,
    cumulative: &TokenUsage,
    cost_usd: f64,
) {
    emitter.emit(
        "agent:token_usage",
        &json!({
            "run_id": run_id,
            "turn": turn_number,
            "step": step,
            "usage": usage,
            "cumulative_usage": cumulative,
            "cost_usd": cost_usd,
            "ts": now_iso(),
        }),
    );
}

#[allow(clippy::too_many_arguments)]
pub(super) fn emit_turn_done(
    emitter: &dyn EmitterPort,
    run_id: &str,
    turn_number: u32,
    name: &str,
    stop_reason: TurnStopReason,
    steps: u32,
    tool_calls: u32,
    usage: &TokenUsage,
) {
    emitter.emit(
        "agent:turn_done",
        &json!({
            "run_id": run_id,
            "turn": turn_number,
            "name": name,
            "stop_reason": stop_reason.as_str(),
            "steps": steps,
            "tool_calls": tool_calls,
            "usage": usage,
            "ts": now_iso(),
        }),
    );
}
