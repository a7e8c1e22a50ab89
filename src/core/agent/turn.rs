use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::error::{RunError, ToolError};
use crate::core::ports::llm::{ChatMessage, CompletionRequest, ContentBlock, Role, StopReason, TokenUsage};
use crate::core::ports::store::{ToolCallStartRecord, TurnStartRecord};
use crate::core::ports::tools::ToolFilter;

use super::events::{
    emit_token_usage, emit_tool_result, emit_tool_start, emit_turn_done, emit_turn_phase,
};
use super::ledger::{append_message_ledger, complete_tool_call_ledger, complete_turn_ledger};
use super::run::{RunContext, RunRequest};
use super::state::{MessageRole, TurnPhase, TurnStopReason};
use super::Agent;

/// One phase of a run: its own prompt, optional model override and tool
/// exposure, executed as a bounded tool-use loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TurnDefinition {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Appended to the system prompt. Only the first turn's rules reach the
    /// service, since the system prompt is sent once per run.
    #[serde(default)]
    pub rules: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    #[serde(default)]
    pub providers: Option<Vec<String>>,
    #[serde(default)]
    pub max_steps: Option<u32>,
}

impl TurnDefinition {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn tool_filter(&self) -> ToolFilter {
        ToolFilter {
            tools: self.tools.clone(),
            providers: self.providers.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub turn_id: String,
    pub turn_number: u32,
    pub name: String,
    pub model: String,
    pub stop_reason: TurnStopReason,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub response_text: String,
    pub tool_call_count: u32,
    pub steps: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
struct TurnProgress {
    usage: TokenUsage,
    cost_usd: f64,
    tool_call_count: u32,
    steps: u32,
    response_text: String,
}

struct PendingToolUse {
    id: String,
    name: String,
    input: Value,
}

pub(super) fn compose_system_prompt(system_prompt: &str, rules: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [Some(system_prompt), rules]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

fn date_block() -> ContentBlock {
    ContentBlock::text(format!(
        "Current date: {}",
        chrono::Utc::now().format("%Y-%m-%d")
    ))
}

/// Roles must alternate, so a prompt following a trailing user message (tool
/// results from a turn that hit its step limit) joins that message.
pub(super) fn seed_prompt(messages: &mut Vec<ChatMessage>, blocks: Vec<ContentBlock>) {
    match messages.last_mut() {
        Some(last) if last.role == Role::User => last.content.extend(blocks),
        _ => messages.push(ChatMessage::user(blocks)),
    }
}

fn history_blocks(content: Vec<ContentBlock>, keep_tool_uses: bool) -> Vec<ContentBlock> {
    content
        .into_iter()
        .filter(|block| match block {
            ContentBlock::Text { text } => !text.is_empty(),
            ContentBlock::ToolUse { .. } => keep_tool_uses,
            ContentBlock::ToolResult { .. } => true,
            ContentBlock::Unknown => false,
        })
        .collect()
}

/// MCP-style results carry `content: [{type: text, text}]`; anything else is
/// handed to the model as JSON.
fn tool_result_text(value: &Value) -> String {
    if let Some(parts) = value.get("content").and_then(Value::as_array) {
        let texts: Vec<&str> = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn tool_result_block(call_id: &str, result: Result<Value, ToolError>) -> ContentBlock {
    match result {
        Ok(value) => ContentBlock::ToolResult {
            tool_use_id: call_id.to_string(),
            content: tool_result_text(&value),
            is_error: false,
        },
        Err(err) => ContentBlock::ToolResult {
            tool_use_id: call_id.to_string(),
            content: err.to_string(),
            is_error: true,
        },
    }
}

impl Agent {
    /// Runs one turn against the shared run context. The conversation in
    /// `ctx.messages` is extended in place; run totals in `ctx` include every
    /// completed step even when the turn fails.
    pub(super) async fn execute_turn(
        &self,
        ctx: &mut RunContext,
        request: &RunRequest,
        turn: &TurnDefinition,
        turn_number: u32,
    ) -> Result<TurnOutcome, RunError> {
        let turn_id = uuid::Uuid::new_v4().to_string();
        let model = turn
            .model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .unwrap_or(&request.model)
            .to_string();

        self.store.start_turn(TurnStartRecord {
            turn_id: &turn_id,
            run_id: &ctx.run_id,
            turn_number,
            name: &turn.name,
            model: &model,
        })?;
        log::info!(
            "[agent] run {} turn {turn_number} ({}) on {model}",
            ctx.run_id,
            turn.name
        );

        let mut progress = TurnProgress::default();
        let result = self
            .run_steps(ctx, request, turn, turn_number, &turn_id, &model, &mut progress)
            .await;

        match result {
            Ok(stop_reason) => {
                let duration_ms = complete_turn_ledger(
                    self.store.as_ref(),
                    &turn_id,
                    stop_reason,
                    &progress.usage,
                    progress.cost_usd,
                    progress.tool_call_count,
                    None,
                )?;
                emit_turn_phase(
                    self.emitter.as_ref(),
                    &ctx.run_id,
                    turn_number,
                    progress.steps,
                    TurnPhase::Done,
                );
                emit_turn_done(
                    self.emitter.as_ref(),
                    &ctx.run_id,
                    turn_number,
                    &turn.name,
                    stop_reason,
                    progress.steps,
                    progress.tool_call_count,
                    &progress.usage,
                );
                Ok(TurnOutcome {
                    turn_id,
                    turn_number,
                    name: turn.name.clone(),
                    model,
                    stop_reason,
                    usage: progress.usage,
                    cost_usd: progress.cost_usd,
                    response_text: progress.response_text,
                    tool_call_count: progress.tool_call_count,
                    steps: progress.steps,
                    duration_ms,
                })
            }
            Err(err) => {
                let message = err.to_string();
                if let Err(ledger_err) = complete_turn_ledger(
                    self.store.as_ref(),
                    &turn_id,
                    TurnStopReason::Error,
                    &progress.usage,
                    progress.cost_usd,
                    progress.tool_call_count,
                    Some(&message),
                ) {
                    log::warn!("[agent] could not close turn {turn_id}: {ledger_err}");
                }
                emit_turn_phase(
                    self.emitter.as_ref(),
                    &ctx.run_id,
                    turn_number,
                    progress.steps,
                    TurnPhase::Failed,
                );
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        ctx: &mut RunContext,
        request: &RunRequest,
        turn: &TurnDefinition,
        turn_number: u32,
        turn_id: &str,
        model: &str,
        progress: &mut TurnProgress,
    ) -> Result<TurnStopReason, RunError> {
        let run_id = ctx.run_id.clone();
        let store = self.store.as_ref();
        let emitter = self.emitter.as_ref();
        let first_turn = turn_number == 1;

        let system = if first_turn {
            compose_system_prompt(&request.system_prompt, turn.rules.as_deref())
        } else {
            if turn.rules.is_some() {
                log::debug!("[agent] rules on turn {turn_number} are not sent after the first turn");
            }
            None
        };
        if let Some(system) = &system {
            append_message_ledger(store, &run_id, turn_id, MessageRole::System, system, None)?;
        }

        let mut prompt_blocks = Vec::with_capacity(2);
        if first_turn {
            prompt_blocks.push(date_block());
        }
        prompt_blocks.push(ContentBlock::text(turn.prompt.clone()));
        append_message_ledger(store, &run_id, turn_id, MessageRole::User, &turn.prompt, None)?;
        seed_prompt(&mut ctx.messages, prompt_blocks);

        let tools = self.tools.tool_definitions(&turn.tool_filter());
        let max_steps = turn.max_steps.unwrap_or(request.max_steps).max(1);

        for step in 1..=max_steps {
            if request.cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            if let Some(reason) = request.budget.exceeded_reason(&ctx.usage, ctx.cost_usd) {
                return Err(RunError::BudgetExceeded(reason));
            }

            progress.steps = step;
            emit_turn_phase(emitter, &run_id, turn_number, step, TurnPhase::AwaitingCompletion);

            let completion = self.completion.complete(CompletionRequest {
                model,
                system: if step == 1 { system.as_deref() } else { None },
                messages: &ctx.messages,
                tools: &tools,
                max_tokens: request.max_tokens,
            });
            let response = tokio::select! {
                response = completion => response?,
                _ = request.cancel.cancelled() => return Err(RunError::Cancelled),
            };

            let step_cost = request.pricing.cost(model, &response.usage);
            progress.usage.saturating_add_assign(&response.usage);
            progress.cost_usd += step_cost;
            ctx.usage.saturating_add_assign(&response.usage);
            ctx.cost_usd += step_cost;
            emit_token_usage(
                emitter,
                &run_id,
                turn_number,
                step,
                &response.usage,
                &ctx.usage,
                ctx.cost_usd,
            );

            let text = ChatMessage::assistant(response.content.clone()).text();
            if !text.is_empty() {
                if !progress.response_text.is_empty() {
                    progress.response_text.push('\n');
                }
                progress.response_text.push_str(&text);
            }
            append_message_ledger(
                store,
                &run_id,
                turn_id,
                MessageRole::Assistant,
                &text,
                Some(&response.usage),
            )?;

            let tool_uses: Vec<PendingToolUse> = response
                .tool_uses()
                .map(|(id, name, input)| PendingToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: input.clone(),
                })
                .collect();
            let natural_stop = response
                .stop_reason
                .as_ref()
                .is_some_and(StopReason::is_natural_completion);

            if tool_uses.is_empty() || natural_stop {
                // Unanswered tool_use blocks would poison the next request.
                let content = history_blocks(response.content, false);
                if !content.is_empty() {
                    ctx.messages.push(ChatMessage::assistant(content));
                }
                return Ok(TurnStopReason::EndTurn);
            }

            ctx.messages
                .push(ChatMessage::assistant(history_blocks(response.content, true)));
            emit_turn_phase(emitter, &run_id, turn_number, step, TurnPhase::ExecutingTools);

            let results = if request.parallel_tool_calls {
                self.execute_tools_parallel(&run_id, turn_id, turn_number, &tool_uses, &request.cancel)
                    .await?
            } else {
                self.execute_tools_sequential(&run_id, turn_id, turn_number, &tool_uses, &request.cancel)
                    .await?
            };
            progress.tool_call_count += tool_uses.len() as u32;
            ctx.messages.push(ChatMessage::user(results));
        }

        log::info!("[agent] run {run_id} turn {turn_number} stopped at step limit {max_steps}");
        Ok(TurnStopReason::StepLimit)
    }

    fn start_tool_call(
        &self,
        run_id: &str,
        turn_id: &str,
        call: &PendingToolUse,
    ) -> Result<(), RunError> {
        self.store.start_tool_call(ToolCallStartRecord {
            run_id,
            turn_id,
            call_id: &call.id,
            tool_name: &call.name,
            input: &call.input,
        })?;
        Ok(())
    }

    async fn execute_tools_sequential(
        &self,
        run_id: &str,
        turn_id: &str,
        turn_number: u32,
        calls: &[PendingToolUse],
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentBlock>, RunError> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            self.start_tool_call(run_id, turn_id, call)?;
            results.push(self.run_tool_call(run_id, turn_number, call, cancel).await?);
        }
        Ok(results)
    }

    /// Starts are recorded in block order before anything runs; completions
    /// land in the ledger in completion order. Results come back in block
    /// order regardless.
    async fn execute_tools_parallel(
        &self,
        run_id: &str,
        turn_id: &str,
        turn_number: u32,
        calls: &[PendingToolUse],
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentBlock>, RunError> {
        for call in calls {
            self.start_tool_call(run_id, turn_id, call)?;
        }
        let outcomes = join_all(
            calls
                .iter()
                .map(|call| self.run_tool_call(run_id, turn_number, call, cancel)),
        )
        .await;
        outcomes.into_iter().collect()
    }

    async fn run_tool_call(
        &self,
        run_id: &str,
        turn_number: u32,
        call: &PendingToolUse,
        cancel: &CancellationToken,
    ) -> Result<ContentBlock, RunError> {
        let emitter = self.emitter.as_ref();
        emit_tool_start(emitter, run_id, turn_number, &call.id, &call.name, &call.input);

        let started = Instant::now();
        let result = tokio::select! {
            result = self.tools.execute(&call.name, call.input.clone()) => result,
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        complete_tool_call_ledger(self.store.as_ref(), run_id, &call.id, &result, duration_ms)?;
        match &result {
            Ok(_) => {
                log::debug!("[agent] {} ok in {duration_ms}ms", call.name);
                emit_tool_result(emitter, run_id, turn_number, &call.id, &call.name, true, duration_ms, None);
            }
            Err(err) => {
                log::warn!("[agent] {} failed after {duration_ms}ms: {err}", call.name);
                emit_tool_result(
                    emitter,
                    run_id,
                    turn_number,
                    &call.id,
                    &call.name,
                    false,
                    duration_ms,
                    Some((err.code(), err.to_string())),
                );
            }
        }

        if matches!(result, Err(ToolError::Cancelled)) {
            return Err(RunError::Cancelled);
        }
        Ok(tool_result_block(&call.id, result))
    }
}
