use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::ports::llm::TokenUsage;

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPrice {
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_mtok
            + usage.output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

/// Charged for any model the table does not know. Priced at the top tier so
/// an unrecognized model over-reports rather than under-reports spend.
pub const DEFAULT_PRICE: ModelPrice = ModelPrice::new(15.0, 75.0);

const BUILTIN_PRICES: &[(&str, ModelPrice)] = &[
    ("claude-opus-4", ModelPrice::new(15.0, 75.0)),
    ("claude-opus-4-5", ModelPrice::new(5.0, 25.0)),
    ("claude-sonnet-4", ModelPrice::new(3.0, 15.0)),
    ("claude-3-7-sonnet", ModelPrice::new(3.0, 15.0)),
    ("claude-haiku-4-5", ModelPrice::new(1.0, 5.0)),
    ("claude-3-5-haiku", ModelPrice::new(0.8, 4.0)),
];

#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    prices: HashMap<String, ModelPrice>,
    fallback: ModelPrice,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            prices: BUILTIN_PRICES
                .iter()
                .map(|(model, price)| (model.to_string(), *price))
                .collect(),
            fallback: DEFAULT_PRICE,
        }
    }
}

impl PricingTable {
    pub fn empty() -> Self {
        Self {
            prices: HashMap::new(),
            fallback: DEFAULT_PRICE,
        }
    }

    pub fn with_overrides(mut self, overrides: &HashMap<String, ModelPrice>) -> Self {
        for (model, price) in overrides {
            self.prices.insert(model.clone(), *price);
        }
        self
    }

    /// Exact name, then the longest configured prefix, then the default tier.
    pub fn price_for(&self, model: &str) -> ModelPrice {
        if let Some(price) = self.prices.get(model) {
            return *price;
        }
        self.prices
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, price)| *price)
            .unwrap_or_else(|| {
                log::debug!("[pricing] no price for {model}, using default tier");
                self.fallback
            })
    }

    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.price_for(model).cost(usage)
    }
}

/// Run-wide ceilings. Checked before every completion call against the run's
/// cumulative usage, including the turn in progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetLimits {
    pub max_total_tokens: Option<u64>,
    pub max_cost_usd: Option<f64>,
}

impl BudgetLimits {
    pub fn exceeded_reason(&self, usage: &TokenUsage, cost_usd: f64) -> Option<String> {
        if let Some(limit) = self.max_total_tokens {
            if usage.total() >= limit {
                return Some(format!("token budget of {limit} reached ({} used)", usage.total()));
            }
        }
        if let Some(limit) = self.max_cost_usd {
            if cost_usd >= limit {
                return Some(format!("cost budget of ${limit:.4} reached (${cost_usd:.4} spent)"));
            }
        }
        None
    }
}
