use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use tokio_util::sync::CancellationToken;

use crate::core::error::RunError;
use crate::core::ports::llm::{ChatMessage, TokenUsage};
use crate::core::ports::store::RunStartRecord;

use super::budget::{BudgetLimits, PricingTable};
use super::events::emit_run_state;
use super::ledger::{finish_run_ledger, record_progress_ledger};
use super::pacing::{PacingConfig, TurnPacer};
use super::state::RunStatus;
use super::turn::{TurnDefinition, TurnOutcome};
use super::Agent;

pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_MAX_STEPS: u32 = 10;

/// Everything one run needs: the agent definition plus per-run policy.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub agent_name: String,
    pub system_prompt: String,
    /// Default model; a turn may override it.
    pub model: String,
    pub max_tokens: u32,
    pub max_steps: u32,
    pub parallel_tool_calls: bool,
    pub turns: Vec<TurnDefinition>,
    /// Provider groups a turn may reference.
    pub known_providers: Vec<String>,
    pub pacing: PacingConfig,
    pub budget: BudgetLimits,
    pub pricing: PricingTable,
    pub cancel: CancellationToken,
}

impl RunRequest {
    pub fn new(agent_name: impl Into<String>, model: impl Into<String>, turns: Vec<TurnDefinition>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            agent_name: agent_name.into(),
            system_prompt: String::new(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            max_steps: DEFAULT_MAX_STEPS,
            parallel_tool_calls: false,
            turns,
            known_providers: Vec::new(),
            pacing: PacingConfig::default(),
            budget: BudgetLimits::default(),
            pricing: PricingTable::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Rejects definitions that cannot run to completion: no turns, a turn
    /// without a model, or a provider group nobody configured.
    pub fn validate(&self) -> Result<(), RunError> {
        let invalid = |message: String| -> Result<(), RunError> { Err(RunError::Configuration(message)) };

        if self.agent_name.trim().is_empty() {
            return invalid("agent name is empty".to_string());
        }
        if self.turns.is_empty() {
            return invalid(format!("agent {} defines no turns", self.agent_name));
        }
        if self.max_tokens == 0 {
            return invalid("max_tokens must be positive".to_string());
        }
        if self.max_steps == 0 {
            return invalid("max_steps must be at least 1".to_string());
        }
        if let PacingConfig::TokenBucket {
            input_tokens_per_minute: 0,
        } = self.pacing
        {
            return invalid("token bucket pacing needs input_tokens_per_minute > 0".to_string());
        }

        let known: HashSet<&str> = self.known_providers.iter().map(String::as_str).collect();
        for (index, turn) in self.turns.iter().enumerate() {
            let label = format!("turn {} ({})", index + 1, turn.name);
            if turn.name.trim().is_empty() {
                return invalid(format!("turn {} has no name", index + 1));
            }
            if turn.prompt.trim().is_empty() {
                return invalid(format!("{label} has an empty prompt"));
            }
            let model = turn.model.as_deref().unwrap_or(&self.model);
            if model.trim().is_empty() {
                return invalid(format!("{label} resolves to no model"));
            }
            if turn.max_steps == Some(0) {
                return invalid(format!("{label} max_steps must be at least 1"));
            }
            for provider in turn.providers.iter().flatten() {
                if !known.contains(provider.as_str()) {
                    return invalid(format!("{label} references unknown provider {provider}"));
                }
            }
        }
        Ok(())
    }
}

/// Per-run mutable state. Owned by one `Agent::run` call and lent to each turn.
#[derive(Debug)]
pub(super) struct RunContext {
    pub(super) run_id: String,
    pub(super) messages: Vec<ChatMessage>,
    pub(super) usage: TokenUsage,
    pub(super) cost_usd: f64,
    pub(super) turns_completed: u32,
}

impl RunContext {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            messages: Vec::new(),
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            turns_completed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub turns_completed: u32,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub turns: Vec<TurnOutcome>,
    pub messages: Vec<ChatMessage>,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Agent {
    /// Executes every turn in order and finalizes the run exactly once:
    /// `success` after the last turn, `error` on the first fatal failure
    /// (with the tokens and cost spent up to that point).
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, RunError> {
        let run_id = request.run_id.clone();
        let turns_total = u32::try_from(request.turns.len()).unwrap_or(u32::MAX);

        self.store.start_run(RunStartRecord {
            run_id: &run_id,
            agent_name: &request.agent_name,
            model: &request.model,
            turns_total,
        })?;
        emit_run_state(self.emitter.as_ref(), &run_id, RunStatus::Running, 0, None);
        log::info!(
            "[agent] run {run_id} started: {} with {turns_total} turn(s)",
            request.agent_name
        );

        let mut ctx = RunContext::new(&run_id);

        let result = match request.validate() {
            Ok(()) => AssertUnwindSafe(self.run_turns(&mut ctx, &request))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(RunError::Panicked(panic_message(payload)))),
            Err(err) => Err(err),
        };

        let result = result.and_then(|turns| {
            finish_run_ledger(
                self.store.as_ref(),
                &run_id,
                RunStatus::Success,
                ctx.turns_completed,
                &ctx.usage,
                ctx.cost_usd,
                None,
            )?;
            Ok(turns)
        });

        match result {
            Ok(turns) => {
                emit_run_state(
                    self.emitter.as_ref(),
                    &run_id,
                    RunStatus::Success,
                    ctx.turns_completed,
                    None,
                );
                log::info!(
                    "[agent] run {run_id} succeeded: {} in / {} out tokens, ${:.4}",
                    ctx.usage.input_tokens,
                    ctx.usage.output_tokens,
                    ctx.cost_usd
                );
                Ok(RunOutcome {
                    run_id,
                    status: RunStatus::Success,
                    turns_completed: ctx.turns_completed,
                    usage: ctx.usage,
                    cost_usd: ctx.cost_usd,
                    turns,
                    messages: ctx.messages,
                })
            }
            Err(err) => {
                let message = err.to_string();
                log::error!("[agent] run {run_id} failed: {message}");
                if let Err(ledger_err) = finish_run_ledger(
                    self.store.as_ref(),
                    &run_id,
                    RunStatus::Error,
                    ctx.turns_completed,
                    &ctx.usage,
                    ctx.cost_usd,
                    Some(&message),
                ) {
                    log::error!("[agent] could not finalize run {run_id}: {ledger_err}");
                }
                emit_run_state(
                    self.emitter.as_ref(),
                    &run_id,
                    RunStatus::Error,
                    ctx.turns_completed,
                    Some(&message),
                );
                Err(err)
            }
        }
    }

    async fn run_turns(
        &self,
        ctx: &mut RunContext,
        request: &RunRequest,
    ) -> Result<Vec<TurnOutcome>, RunError> {
        let mut pacer = TurnPacer::new(request.pacing.clone());
        let mut outcomes = Vec::with_capacity(request.turns.len());

        for (index, turn) in request.turns.iter().enumerate() {
            let turn_number = index as u32 + 1;
            if index > 0 {
                pacer.pace(&request.cancel).await?;
            }

            let outcome = self.execute_turn(ctx, request, turn, turn_number).await?;
            pacer.record(&outcome.usage);
            ctx.turns_completed = turn_number;
            record_progress_ledger(
                self.store.as_ref(),
                &ctx.run_id,
                ctx.turns_completed,
                &ctx.usage,
                ctx.cost_usd,
            )?;
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }
}
