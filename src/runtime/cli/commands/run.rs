use std::path::Path;
use std::sync::Arc;

use crate::adapters::config::{AgentConfig, Settings};
use crate::adapters::emitter::LogEmitter;
use crate::adapters::llm::anthropic::AnthropicClient;
use crate::adapters::mcp::{connect, ToolRegistry};
use crate::adapters::store::SqliteLedger;
use crate::core::agent::Agent;
use crate::core::error::DynError;

pub async fn run_agent(settings: &Settings, db_path: &Path, agent_file: &Path) -> Result<(), DynError> {
    let config = AgentConfig::load(agent_file)?;
    let api_key = settings.anthropic_api_key().ok_or(
        "no Anthropic API key: set anthropic_api_key in ~/.relay/config.toml or ANTHROPIC_API_KEY",
    )?;
    let mut client = AnthropicClient::new(api_key)?;
    if let Some(base_url) = settings.anthropic_base_url.as_deref() {
        client = client.with_base_url(base_url);
    }

    let mut registry = ToolRegistry::new(&settings.tool_separator);
    for provider in &config.providers {
        registry.add_provider(
            &provider.name,
            connect(
                &provider.name,
                provider.to_command(),
                provider.lifecycle,
                settings.timeouts.clone(),
            ),
        );
    }
    let summary = registry.load().await;
    if !summary.failed_providers.is_empty() {
        log::warn!(
            "[cli] providers unavailable for this run: {}",
            summary.failed_providers.join(", ")
        );
    }
    log::info!("[cli] {} tool(s) loaded", summary.tools);

    let ledger = SqliteLedger::open(db_path)?;
    let agent = Agent::new(
        Arc::new(client),
        Arc::new(registry),
        Arc::new(ledger),
        Arc::new(LogEmitter::new()),
    );

    let request = config.to_run_request(settings);
    let cancel = request.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("[cli] interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    println!("run {}", request.run_id);
    let outcome = agent.run(request).await?;
    for turn in &outcome.turns {
        println!(
            "\n--- turn {} ({}, {}) ---\n{}",
            turn.turn_number,
            turn.name,
            turn.stop_reason.as_str(),
            turn.response_text
        );
    }
    println!(
        "\n{} turn(s), {} in / {} out tokens, ${:.4}",
        outcome.turns_completed, outcome.usage.input_tokens, outcome.usage.output_tokens, outcome.cost_usd
    );
    Ok(())
}
