use futures::future::BoxFuture;
use serde_json::Value;

use crate::core::error::ToolError;

pub use crate::adapters::llm::ToolSchema;

/// Per-turn tool exposure. An explicit tool list wins over provider groups;
/// with neither, every loaded tool is exposed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolFilter {
    pub tools: Option<Vec<String>>,
    pub providers: Option<Vec<String>>,
}

pub trait ToolPort: Send + Sync {
    fn tool_definitions(&self, filter: &ToolFilter) -> Vec<ToolSchema>;
    fn execute<'a>(&'a self, name: &'a str, args: Value) -> BoxFuture<'a, Result<Value, ToolError>>;
}
