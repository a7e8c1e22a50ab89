use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::error::RunError;
use crate::core::ports::llm::TokenUsage;

fn default_cooldown_ms() -> u64 {
    60_000
}

/// Backpressure between consecutive turns of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PacingConfig {
    /// Sleep a fixed interval before every turn after the first.
    Fixed {
        #[serde(default = "default_cooldown_ms")]
        cooldown_ms: u64,
    },
    /// Token bucket refilled at the completion service's input-token rate.
    /// A turn starts once the previous turns' input tokens are paid back.
    TokenBucket { input_tokens_per_minute: u64 },
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig::Fixed {
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

#[derive(Debug)]
pub struct TurnPacer {
    config: PacingConfig,
    level: f64,
    refilled_at: Instant,
}

impl TurnPacer {
    pub fn new(config: PacingConfig) -> Self {
        let level = match &config {
            PacingConfig::TokenBucket {
                input_tokens_per_minute,
            } => *input_tokens_per_minute as f64,
            PacingConfig::Fixed { .. } => 0.0,
        };
        Self {
            config,
            level,
            refilled_at: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant, per_minute: u64) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        let capacity = per_minute as f64;
        self.level = (self.level + elapsed * capacity / 60.0).min(capacity);
        self.refilled_at = now;
    }

    pub fn record_at(&mut self, usage: &TokenUsage, now: Instant) {
        if let PacingConfig::TokenBucket {
            input_tokens_per_minute,
        } = self.config
        {
            self.refill(now, input_tokens_per_minute);
            self.level -= usage.input_tokens as f64;
        }
    }

    pub fn record(&mut self, usage: &TokenUsage) {
        self.record_at(usage, Instant::now());
    }

    /// Wait required before the next turn may start.
    pub fn delay_at(&mut self, now: Instant) -> Duration {
        match self.config {
            PacingConfig::Fixed { cooldown_ms } => Duration::from_millis(cooldown_ms),
            PacingConfig::TokenBucket {
                input_tokens_per_minute,
            } => {
                if input_tokens_per_minute == 0 {
                    return Duration::ZERO;
                }
                self.refill(now, input_tokens_per_minute);
                if self.level >= 0.0 {
                    return Duration::ZERO;
                }
                let per_second = input_tokens_per_minute as f64 / 60.0;
                Duration::from_secs_f64(-self.level / per_second)
            }
        }
    }

    pub async fn pace(&mut self, cancel: &CancellationToken) -> Result<(), RunError> {
        let delay = self.delay_at(Instant::now());
        if delay.is_zero() {
            return Ok(());
        }
        log::info!("[pacing] waiting {}ms before next turn", delay.as_millis());
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(RunError::Cancelled),
        }
    }
}
