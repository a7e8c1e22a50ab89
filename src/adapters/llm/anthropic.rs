use futures::future::BoxFuture;
use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;

use super::{ChatMessage, CompletionResponse, ContentBlock, Role, ToolSchema};
use crate::core::error::CompletionError;
use crate::core::ports::llm::{CompletionPort, CompletionRequest};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolSchema],
}

fn no_tools(tools: &&[ToolSchema]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: Vec<&'a ContentBlock>,
}

/// Uninterpreted blocks (thinking, citations) are not echoed back.
fn wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage<'_>> {
    messages
        .iter()
        .map(|message| WireMessage {
            role: message.role,
            content: message
                .content
                .iter()
                .filter(|block| !matches!(block, ContentBlock::Unknown))
                .collect(),
        })
        .filter(|message| !message.content.is_empty())
        .collect()
}

fn is_retriable(err: &CompletionError) -> bool {
    match err {
        CompletionError::Api { status, .. } => *status == 429 || *status >= 500,
        CompletionError::Http(message) => {
            let msg = message.to_ascii_lowercase();
            msg.contains("timeout")
                || msg.contains("timed out")
                || msg.contains("connect")
                || msg.contains("temporar")
        }
        CompletionError::Decode(_) => false,
    }
}

fn is_auth_error(err: &CompletionError) -> bool {
    match err {
        CompletionError::Api { status, body } => {
            *status == 401 || *status == 403 || body.to_ascii_lowercase().contains("invalid x-api-key")
        }
        _ => false,
    }
}

fn should_retry(err: &CompletionError) -> bool {
    !is_auth_error(err) && is_retriable(err)
}

fn http_error(err: reqwest::Error) -> CompletionError {
    if err.is_timeout() {
        CompletionError::Http(format!("request timed out: {err}"))
    } else if err.is_connect() {
        CompletionError::Http(format!("connect failed: {err}"))
    } else {
        CompletionError::Http(err.to_string())
    }
}

/// Non-streaming client for the Anthropic Messages API.
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    retry_delays: Vec<Duration>,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, CompletionError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(http_error)?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    async fn send_once(&self, request: &CompletionRequest<'_>) -> Result<CompletionResponse, CompletionError> {
        let body = MessagesRequest {
            model: request.model,
            max_tokens: request.max_tokens,
            system: request.system,
            messages: wire_messages(request.messages),
            tools: request.tools,
        };

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(http_error)?;

        let status = response.status();
        let text = response.text().await.map_err(http_error)?;
        if !status.is_success() {
            return Err(CompletionError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        let mut parsed: CompletionResponse =
            serde_json::from_str(&text).map_err(|e| CompletionError::Decode(e.to_string()))?;
        parsed
            .content
            .retain(|block| !matches!(block, ContentBlock::Unknown));
        Ok(parsed)
    }

    pub async fn complete_with_retries(
        &self,
        request: &CompletionRequest<'_>,
    ) -> Result<CompletionResponse, CompletionError> {
        let max_attempts = self.retry_delays.len() + 1;
        let mut attempt = 0;
        loop {
            match self.send_once(request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    attempt += 1;
                    if !should_retry(&err) || attempt >= max_attempts {
                        return Err(err);
                    }
                    let delay = self.retry_delays[attempt - 1];
                    log::warn!(
                        "[anthropic] {} attempt {attempt}/{max_attempts} failed, retrying in {}ms: {err}",
                        request.model,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

impl CompletionPort for AnthropicClient {
    fn complete<'a>(
        &'a self,
        request: CompletionRequest<'a>,
    ) -> BoxFuture<'a, Result<CompletionResponse, CompletionError>> {
        Box::pin(async move { self.complete_with_retries(&request).await })
    }
}
