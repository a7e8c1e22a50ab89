use std::path::Path;

use crate::adapters::store::SqliteLedger;
use crate::core::error::DynError;
use crate::core::ports::store::LedgerStore;

pub fn show_history(db_path: &Path, run_id: &str) -> Result<(), DynError> {
    let ledger = SqliteLedger::open(db_path)?;
    let history = ledger.load_history(run_id)?;
    println!("{}", serde_json::to_string_pretty(&history)?);
    Ok(())
}

pub fn list_runs(db_path: &Path, limit: usize) -> Result<(), DynError> {
    let ledger = SqliteLedger::open(db_path)?;
    let runs = ledger.list_runs(limit)?;
    if runs.is_empty() {
        println!("no runs recorded in {}", db_path.display());
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<7}  {:<24}  {}/{} turns  {:>8} tok  ${:.4}  {}",
            run.run_id,
            run.status.as_str(),
            run.agent_name,
            run.turns_completed,
            run.turns_total,
            run.input_tokens.saturating_add(run.output_tokens),
            run.cost_usd,
            run.started_at
        );
    }
    Ok(())
}
