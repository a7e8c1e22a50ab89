use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::transport::ToolTransport;
use crate::core::error::ToolError;
use crate::core::ports::tools::{ToolFilter, ToolPort, ToolSchema};

pub const DEFAULT_SEPARATOR: &str = "__";

#[derive(Debug, Clone)]
struct RegisteredTool {
    provider: String,
    original_name: String,
    schema: ToolSchema,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub tools: usize,
    pub failed_providers: Vec<String>,
}

/// Flat, provider-qualified catalog over every configured tool provider.
pub struct ToolRegistry {
    separator: String,
    providers: Vec<(String, Arc<dyn ToolTransport>)>,
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR)
    }
}

impl ToolRegistry {
    pub fn new(separator: &str) -> Self {
        Self {
            separator: separator.to_string(),
            providers: Vec::new(),
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn add_provider(&mut self, name: &str, transport: Arc<dyn ToolTransport>) {
        self.providers.push((name.to_string(), transport));
    }

    pub fn qualified_name(&self, provider: &str, tool: &str) -> String {
        format!("{provider}{}{tool}", self.separator)
    }

    /// Runs discovery against every provider. A provider that fails to spawn,
    /// times out or answers garbage contributes no tools; the rest load.
    pub async fn load(&mut self) -> LoadSummary {
        self.tools.clear();
        self.order.clear();

        let mut summary = LoadSummary::default();
        let providers = self.providers.clone();
        for (provider, transport) in providers {
            match transport.list_tools().await {
                Ok(tools) => {
                    log::info!("[registry] {provider}: {} tool(s)", tools.len());
                    for tool in tools {
                        self.register(&provider, tool.name, tool.description, tool.input_schema);
                    }
                }
                Err(err) => {
                    log::warn!("[registry] discovery failed for {provider}: {err}");
                    summary.failed_providers.push(provider);
                }
            }
        }

        summary.tools = self.order.len();
        summary
    }

    fn register(&mut self, provider: &str, original_name: String, description: String, input_schema: Value) {
        let qualified = self.qualified_name(provider, &original_name);
        let entry = RegisteredTool {
            provider: provider.to_string(),
            original_name,
            schema: ToolSchema {
                name: qualified.clone(),
                description,
                input_schema,
            },
        };
        match self.tools.insert(qualified.clone(), entry) {
            Some(previous) => log::warn!(
                "[registry] {qualified} from {} overwritten by {provider}",
                previous.provider
            ),
            None => self.order.push(qualified),
        }
    }

    /// Maps a qualified name back to `(provider, original_name)`.
    pub fn resolve(&self, name: &str) -> Option<(&str, &str)> {
        self.tools
            .get(name)
            .map(|tool| (tool.provider.as_str(), tool.original_name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn transport(&self, provider: &str) -> Option<&Arc<dyn ToolTransport>> {
        self.providers
            .iter()
            .rev()
            .find(|(name, _)| name == provider)
            .map(|(_, transport)| transport)
    }

    pub fn definitions(&self, filter: &ToolFilter) -> Vec<ToolSchema> {
        let registered = self.order.iter().filter_map(|name| self.tools.get(name));

        if let Some(names) = &filter.tools {
            for name in names {
                if !self.tools.contains_key(name) {
                    log::warn!("[registry] filter names unknown tool {name}");
                }
            }
            return registered
                .filter(|tool| names.contains(&tool.schema.name))
                .map(|tool| tool.schema.clone())
                .collect();
        }

        if let Some(groups) = &filter.providers {
            return registered
                .filter(|tool| groups.contains(&tool.provider))
                .map(|tool| tool.schema.clone())
                .collect();
        }

        registered.map(|tool| tool.schema.clone()).collect()
    }

    pub async fn call(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let Some(tool) = self.tools.get(name) else {
            return Err(ToolError::UnknownTool(name.to_string()));
        };
        let args = match args {
            Value::Object(_) => args,
            Value::Null => Value::Object(Map::new()),
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "expected a JSON object, got {other}"
                )))
            }
        };
        let Some(transport) = self.transport(&tool.provider) else {
            return Err(ToolError::UnknownTool(name.to_string()));
        };

        log::debug!("[registry] {name} -> {}::{}", tool.provider, tool.original_name);
        transport.call_tool(&tool.original_name, &args).await
    }
}

impl ToolPort for ToolRegistry {
    fn tool_definitions(&self, filter: &ToolFilter) -> Vec<ToolSchema> {
        self.definitions(filter)
    }

    fn execute<'a>(&'a self, name: &'a str, args: Value) -> BoxFuture<'a, Result<Value, ToolError>> {
        Box::pin(self.call(name, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mcp::protocol::ProviderTool;
    use crate::core::error::TransportError;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeTransport {
        tools: Result<Vec<&'static str>, ()>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl FakeTransport {
        fn serving(tools: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                tools: Ok(tools),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                tools: Err(()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl ToolTransport for FakeTransport {
        fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ProviderTool>, ToolError>> {
            Box::pin(async move {
                match &self.tools {
                    Ok(names) => Ok(names
                        .iter()
                        .map(|name| ProviderTool {
                            name: name.to_string(),
                            description: format!("{name} tool"),
                            input_schema: json!({ "type": "object" }),
                        })
                        .collect()),
                    Err(()) => Err(ToolError::Transport(TransportError::Closed)),
                }
            })
        }

        fn call_tool<'a>(&'a self, name: &'a str, args: &'a Value) -> BoxFuture<'a, Result<Value, ToolError>> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .expect("calls lock")
                    .push((name.to_string(), args.clone()));
                Ok(json!({ "tool": name }))
            })
        }
    }

    fn names(schemas: &[ToolSchema]) -> Vec<&str> {
        schemas.iter().map(|schema| schema.name.as_str()).collect()
    }

    #[tokio::test]
    async fn load_skips_failing_provider_and_namespaces_tools() {
        let mut registry = ToolRegistry::default();
        registry.add_provider("prices", FakeTransport::serving(vec!["quote", "history"]));
        registry.add_provider("broken", FakeTransport::broken());
        registry.add_provider("news", FakeTransport::serving(vec!["latest"]));

        let summary = registry.load().await;
        assert_eq!(summary.tools, 3);
        assert_eq!(summary.failed_providers, vec!["broken".to_string()]);
        assert_eq!(
            names(&registry.definitions(&ToolFilter::default())),
            vec!["prices__quote", "prices__history", "news__latest"]
        );
        assert_eq!(registry.resolve("news__latest"), Some(("news", "latest")));
        assert_eq!(registry.resolve("latest"), None);
    }

    #[tokio::test]
    async fn explicit_tools_win_over_provider_groups() {
        let mut registry = ToolRegistry::default();
        registry.add_provider("prices", FakeTransport::serving(vec!["quote", "history"]));
        registry.add_provider("news", FakeTransport::serving(vec!["latest"]));
        registry.load().await;

        let both = ToolFilter {
            tools: Some(vec!["prices__history".to_string()]),
            providers: Some(vec!["news".to_string()]),
        };
        assert_eq!(names(&registry.definitions(&both)), vec!["prices__history"]);

        let groups = ToolFilter {
            tools: None,
            providers: Some(vec!["news".to_string()]),
        };
        assert_eq!(names(&registry.definitions(&groups)), vec!["news__latest"]);

        let none = ToolFilter {
            tools: Some(Vec::new()),
            providers: None,
        };
        assert!(registry.definitions(&none).is_empty());
    }

    #[tokio::test]
    async fn colliding_registration_keeps_the_last_provider() {
        let first = FakeTransport::serving(vec!["b__c"]);
        let second = FakeTransport::serving(vec!["c"]);
        let mut registry = ToolRegistry::default();
        registry.add_provider("a", first.clone());
        registry.add_provider("a__b", second.clone());
        registry.load().await;

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("a__b__c"), Some(("a__b", "c")));

        registry
            .call("a__b__c", json!({}))
            .await
            .expect("call routed");
        assert!(first.calls.lock().expect("calls lock").is_empty());
        assert_eq!(second.calls.lock().expect("calls lock").len(), 1);
    }

    #[tokio::test]
    async fn call_validates_name_and_arguments() {
        let transport = FakeTransport::serving(vec!["quote"]);
        let mut registry = ToolRegistry::default();
        registry.add_provider("prices", transport.clone());
        registry.load().await;

        assert!(matches!(
            registry.call("prices__nope", json!({})).await,
            Err(ToolError::UnknownTool(_))
        ));
        assert!(matches!(
            registry.call("prices__quote", json!("BTC")).await,
            Err(ToolError::InvalidArguments(_))
        ));

        let result = registry
            .execute("prices__quote", Value::Null)
            .await
            .expect("null args become an empty object");
        assert_eq!(result, json!({ "tool": "quote" }));
        let calls = transport.calls.lock().expect("calls lock");
        assert_eq!(calls.as_slice(), &[("quote".to_string(), json!({}))]);
    }
}
