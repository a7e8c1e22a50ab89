use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::adapters::mcp::{Lifecycle, ProviderCommand, TransportTimeouts, DEFAULT_SEPARATOR};
use crate::core::agent::run::{DEFAULT_MAX_STEPS, DEFAULT_MAX_TOKENS};
use crate::core::agent::{BudgetLimits, ModelPrice, PacingConfig, PricingTable, RunRequest, TurnDefinition};

/// Bump this when adding new fields with non-trivial defaults.
/// When a loaded config has a lower version, it is re-saved to disk
/// so that users see the new keys in their `config.toml`.
const CURRENT_CONFIG_VERSION: u32 = 1;

const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_tool_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML agent definition: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
    #[error("invalid TOML agent definition: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported agent definition format: {0} (expected .yaml, .yml or .toml)")]
    UnsupportedFormat(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub config_version: u32,
    /// Ledger database; `~/.relay/ledger.db` when unset.
    pub db_path: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: Option<String>,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_tool_separator")]
    pub tool_separator: String,
    pub timeouts: TransportTimeouts,
    /// Per-model price overrides layered over the built-in table.
    pub pricing: HashMap<String, ModelPrice>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_version: 0,
            db_path: None,
            anthropic_api_key: None,
            anthropic_base_url: None,
            default_model: default_model(),
            tool_separator: default_tool_separator(),
            timeouts: TransportTimeouts::default(),
            pricing: HashMap::new(),
        }
    }
}

impl Settings {
    fn global_config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".relay")
    }

    pub fn global_config_path() -> PathBuf {
        Self::global_config_dir().join("config.toml")
    }

    pub fn load_global() -> Self {
        Self::load_from(&Self::global_config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self {
                config_version: CURRENT_CONFIG_VERSION,
                ..Self::default()
            };
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                log::warn!(
                    "[config] Failed to read {}: {e}. Using defaults.",
                    path.display()
                );
                return Self {
                    config_version: CURRENT_CONFIG_VERSION,
                    ..Self::default()
                };
            }
        };
        let mut settings: Self = match toml::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!(
                    "[config] Failed to parse {}: {e}. Using defaults.",
                    path.display()
                );
                return Self {
                    config_version: CURRENT_CONFIG_VERSION,
                    ..Self::default()
                };
            }
        };

        // Re-save when config is from an older version so new fields
        // (with their defaults) appear in the file on disk.
        if settings.config_version < CURRENT_CONFIG_VERSION {
            settings.config_version = CURRENT_CONFIG_VERSION;
            if let Err(e) = settings.save_to(path) {
                log::warn!("[config] Failed to migrate config to v{CURRENT_CONFIG_VERSION}: {e}");
            }
        }

        settings
    }

    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.save_to(&Self::global_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        match self.db_path.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => Self::global_config_dir().join("ledger.db"),
        }
    }

    pub fn anthropic_api_key(&self) -> Option<String> {
        resolve_api_key(
            self.anthropic_api_key.as_deref(),
            std::env::var(API_KEY_ENV).ok(),
        )
    }

    pub fn pricing_table(&self) -> PricingTable {
        PricingTable::default().with_overrides(&self.pricing)
    }
}

fn resolve_api_key(configured: Option<&str>, env: Option<String>) -> Option<String> {
    configured
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .or_else(|| env.map(|key| key.trim().to_string()).filter(|key| !key.is_empty()))
}

/// One tool provider process as declared in an agent definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

impl ProviderConfig {
    pub fn to_command(&self) -> ProviderCommand {
        ProviderCommand {
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
        }
    }
}

/// An agent definition file: the ordered turns plus run policy and the tool
/// providers the turns may use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Falls back to `Settings::default_model`.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub parallel_tool_calls: bool,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub budget: BudgetLimits,
    #[serde(default)]
    pub pricing: HashMap<String, ModelPrice>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub turns: Vec<TurnDefinition>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&content),
            "toml" => Self::from_toml_str(&content),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name.clone()).collect()
    }

    /// Agent-level pricing wins over settings, which win over the built-in
    /// table.
    pub fn to_run_request(&self, settings: &Settings) -> RunRequest {
        let model = self
            .model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .unwrap_or(&settings.default_model);

        let mut request = RunRequest::new(self.name.clone(), model, self.turns.clone());
        request.system_prompt = self.system_prompt.clone();
        request.max_tokens = self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        request.max_steps = self.max_steps.unwrap_or(DEFAULT_MAX_STEPS);
        request.parallel_tool_calls = self.parallel_tool_calls;
        request.known_providers = self.provider_names();
        request.pacing = self.pacing.clone();
        request.budget = self.budget.clone();
        request.pricing = settings.pricing_table().with_overrides(&self.pricing);
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRIEF_YAML: &str = r#"
name: market-brief
system_prompt: You are a market analyst.
max_steps: 6
pacing:
  mode: token_bucket
  input_tokens_per_minute: 40000
budget:
  max_cost_usd: 0.5
providers:
  - name: prices
    command: prices-mcp
    args: ["--stdio"]
  - name: graph
    command: graph-mcp
    lifecycle: pooled
    env:
      GRAPH_URL: http://localhost:7474
turns:
  - name: gather
    prompt: Collect today's BTC price.
    providers: [prices]
    rules: Quote exact figures.
  - name: summarize
    prompt: Write a one-line summary.
    model: claude-haiku-4-5
    tools: []
"#;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("relay-config-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn yaml_definition_parses_with_defaults() {
        let config = AgentConfig::from_yaml_str(BRIEF_YAML).unwrap();
        assert_eq!(config.name, "market-brief");
        assert_eq!(config.model, None);
        assert_eq!(
            config.pacing,
            PacingConfig::TokenBucket {
                input_tokens_per_minute: 40_000
            }
        );
        assert_eq!(config.budget.max_cost_usd, Some(0.5));
        assert_eq!(config.budget.max_total_tokens, None);
        assert_eq!(config.providers[0].lifecycle, Lifecycle::SpawnPerCall);
        assert_eq!(config.providers[1].lifecycle, Lifecycle::Pooled);
        assert_eq!(config.turns.len(), 2);
        assert_eq!(config.turns[0].providers, Some(vec!["prices".to_string()]));
        assert_eq!(config.turns[1].tools, Some(Vec::new()));
        assert_eq!(config.turns[1].model.as_deref(), Some("claude-haiku-4-5"));
    }

    #[test]
    fn toml_definition_parses() {
        let config = AgentConfig::from_toml_str(
            r#"
name = "nightly"
model = "claude-opus-4-5"
parallel_tool_calls = true

[pacing]
mode = "fixed"

[[providers]]
name = "news"
command = "news-mcp"

[[turns]]
name = "scan"
prompt = "Scan headlines."
max_steps = 3
"#,
        )
        .unwrap();
        assert!(config.parallel_tool_calls);
        assert_eq!(config.pacing, PacingConfig::Fixed { cooldown_ms: 60_000 });
        assert_eq!(config.turns[0].max_steps, Some(3));
        assert_eq!(config.providers[0].to_command().command, "news-mcp");
    }

    #[test]
    fn load_picks_parser_by_extension() {
        let yaml = temp_path("brief.YML");
        std::fs::create_dir_all(yaml.parent().unwrap()).unwrap();
        std::fs::write(&yaml, BRIEF_YAML).unwrap();
        assert_eq!(AgentConfig::load(&yaml).unwrap().name, "market-brief");

        let json = yaml.with_file_name("brief.json");
        std::fs::write(&json, "{}").unwrap();
        assert!(matches!(
            AgentConfig::load(&json),
            Err(ConfigError::UnsupportedFormat(_))
        ));

        assert!(matches!(
            AgentConfig::load(&yaml.with_file_name("missing.yaml")),
            Err(ConfigError::Io { .. })
        ));
        let _ = std::fs::remove_dir_all(yaml.parent().unwrap());
    }

    #[test]
    fn run_request_layers_settings_and_agent() {
        let mut config = AgentConfig::from_yaml_str(BRIEF_YAML).unwrap();
        config
            .pricing
            .insert("claude-haiku-4-5".to_string(), ModelPrice::new(2.0, 8.0));
        let mut settings = Settings::default();
        settings
            .pricing
            .insert("claude-haiku".to_string(), ModelPrice::new(0.5, 1.0));
        settings
            .pricing
            .insert("claude-haiku-4-5".to_string(), ModelPrice::new(9.0, 9.0));

        let request = config.to_run_request(&settings);
        assert_eq!(request.agent_name, "market-brief");
        assert_eq!(request.model, "claude-sonnet-4-5");
        assert_eq!(request.max_steps, 6);
        assert_eq!(request.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(request.known_providers, vec!["prices", "graph"]);
        assert_eq!(
            request.pricing.price_for("claude-haiku-4-5"),
            ModelPrice::new(2.0, 8.0)
        );
        assert_eq!(
            request.pricing.price_for("claude-haiku-3"),
            ModelPrice::new(0.5, 1.0)
        );
        assert!(request.validate().is_ok());
    }

    #[test]
    fn configured_key_wins_over_env() {
        assert_eq!(
            resolve_api_key(Some(" sk-file "), Some("sk-env".to_string())),
            Some("sk-file".to_string())
        );
        assert_eq!(
            resolve_api_key(Some("  "), Some("sk-env".to_string())),
            Some("sk-env".to_string())
        );
        assert_eq!(resolve_api_key(None, Some(" ".to_string())), None);
    }

    #[test]
    fn old_config_is_migrated_and_resaved() {
        let path = temp_path("config.toml");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "db_path = \"/tmp/relay-test.db\"\n").unwrap();

        let settings = Settings::load_from(&path);
        assert_eq!(settings.config_version, CURRENT_CONFIG_VERSION);
        assert_eq!(settings.db_path(), PathBuf::from("/tmp/relay-test.db"));
        assert_eq!(settings.tool_separator, "__");
        assert_eq!(settings.timeouts, TransportTimeouts::default());

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("config_version = 1"));
        assert!(saved.contains("default_model"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn unparsable_config_falls_back_to_defaults() {
        let path = temp_path("config.toml");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "timeouts = [not toml").unwrap();

        let settings = Settings::load_from(&path);
        assert_eq!(settings.default_model, "claude-sonnet-4-5");
        assert!(settings.db_path().ends_with(".relay/ledger.db"));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "timeouts = [not toml"
        );
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn unreadable_config_is_left_untouched() {
        let path = temp_path("config.toml");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let original = b"db_path = \"/tmp/\xff\xfe.db\"\n".to_vec();
        std::fs::write(&path, &original).unwrap();

        let settings = Settings::load_from(&path);
        assert_eq!(settings.config_version, CURRENT_CONFIG_VERSION);
        assert_eq!(settings.db_path, None);
        assert_eq!(std::fs::read(&path).unwrap(), original);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn timeout_overrides_keep_unset_defaults() {
        let settings: Settings = toml::from_str(
            "config_version = 1\n[timeouts]\ncall_ms = 5000\nextended_markers = [\"vector\"]\n",
        )
        .unwrap();
        assert_eq!(settings.timeouts.call_ms, 5_000);
        assert_eq!(settings.timeouts.discovery_ms, 5_000);
        assert_eq!(settings.timeouts.extended_markers, vec!["vector"]);
    }
}
