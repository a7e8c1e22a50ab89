use futures::future::BoxFuture;

use crate::core::error::CompletionError;

pub use crate::adapters::llm::{
    ChatMessage, CompletionResponse, ContentBlock, Role, StopReason, TokenUsage, ToolSchema,
};

#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    /// Only present on the first step of the run's first turn.
    pub system: Option<&'a str>,
    pub messages: &'a [ChatMessage],
    pub tools: &'a [ToolSchema],
    pub max_tokens: u32,
}

pub trait CompletionPort: Send + Sync {
    fn complete<'a>(
        &'a self,
        request: CompletionRequest<'a>,
    ) -> BoxFuture<'a, Result<CompletionResponse, CompletionError>>;
}
