pub mod budget;
mod events;
mod ledger;
pub mod pacing;
pub mod run;
pub mod state;
pub mod turn;

use std::sync::Arc;

use crate::core::ports::{
    emitter::EmitterPort, llm::CompletionPort, store::LedgerStore, tools::ToolPort,
};

pub use budget::{BudgetLimits, ModelPrice, PricingTable};
pub use pacing::{PacingConfig, TurnPacer};
pub use run::{RunOutcome, RunRequest};
pub use turn::{TurnDefinition, TurnOutcome};

pub struct Agent {
    pub(crate) completion: Arc<dyn CompletionPort>,
    pub(crate) tools: Arc<dyn ToolPort>,
    pub(crate) store: Arc<dyn LedgerStore>,
    pub(crate) emitter: Arc<dyn EmitterPort>,
}

impl Agent {
    pub fn new(
        completion: Arc<dyn CompletionPort>,
        tools: Arc<dyn ToolPort>,
        store: Arc<dyn LedgerStore>,
        emitter: Arc<dyn EmitterPort>,
    ) -> Self {
        Self {
            completion,
            tools,
            store,
            emitter,
        }
    }
}

#[cfg(test)]
mod tests;
