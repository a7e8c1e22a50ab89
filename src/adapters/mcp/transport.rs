use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::connection::{ProviderCommand, ProviderConnection};
use super::protocol::{in_band_error, ListToolsResult, ProviderTool, ToolCallParams};
use crate::core::error::{ToolError, TransportError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportTimeouts {
    pub discovery_ms: u64,
    pub call_ms: u64,
    pub extended_call_ms: u64,
    /// Tool-name fragments marking tools with expensive warm-up.
    pub extended_markers: Vec<String>,
    pub settle_ms: u64,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            discovery_ms: 5_000,
            call_ms: 30_000,
            extended_call_ms: 60_000,
            extended_markers: vec![
                "embed".to_string(),
                "semantic".to_string(),
                "graph".to_string(),
            ],
            settle_ms: 100,
        }
    }
}

impl TransportTimeouts {
    pub fn discovery(&self) -> Duration {
        Duration::from_millis(self.discovery_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn for_tool(&self, tool_name: &str) -> Duration {
        let lowered = tool_name.to_ascii_lowercase();
        let extended = self
            .extended_markers
            .iter()
            .any(|marker| !marker.is_empty() && lowered.contains(&marker.to_ascii_lowercase()));
        if extended {
            Duration::from_millis(self.extended_call_ms.max(self.call_ms))
        } else {
            Duration::from_millis(self.call_ms)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Fresh process per list/call: isolation over latency.
    #[default]
    SpawnPerCall,
    /// One persistent process per provider: throughput, shared fate.
    Pooled,
}

pub trait ToolTransport: Send + Sync {
    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ProviderTool>, ToolError>>;
    fn call_tool<'a>(&'a self, name: &'a str, args: &'a Value) -> BoxFuture<'a, Result<Value, ToolError>>;
}

pub fn connect(
    name: &str,
    command: ProviderCommand,
    lifecycle: Lifecycle,
    timeouts: TransportTimeouts,
) -> Arc<dyn ToolTransport> {
    match lifecycle {
        Lifecycle::SpawnPerCall => Arc::new(SpawnPerCallTransport::new(name, command, timeouts)),
        Lifecycle::Pooled => Arc::new(PooledTransport::new(name, command, timeouts)),
    }
}

fn decode_tools(result: Value) -> Result<Vec<ProviderTool>, ToolError> {
    serde_json::from_value::<ListToolsResult>(result)
        .map(|list| list.tools)
        .map_err(|e| ToolError::Transport(TransportError::Protocol(format!("invalid tools/list result: {e}"))))
}

fn call_params(name: &str, args: &Value) -> Result<Value, ToolError> {
    serde_json::to_value(ToolCallParams {
        name,
        arguments: args,
    })
    .map_err(|e| ToolError::Transport(TransportError::Protocol(e.to_string())))
}

fn check_in_band(result: Value) -> Result<Value, ToolError> {
    match in_band_error(&result) {
        Some(message) => Err(ToolError::Execution(message)),
        None => Ok(result),
    }
}

pub struct SpawnPerCallTransport {
    name: String,
    command: ProviderCommand,
    timeouts: TransportTimeouts,
}

impl SpawnPerCallTransport {
    pub fn new(name: &str, command: ProviderCommand, timeouts: TransportTimeouts) -> Self {
        Self {
            name: name.to_string(),
            command,
            timeouts,
        }
    }

    /// Spawn, handshake, one request, teardown. The deadline covers the whole
    /// exchange; on expiry the process is killed.
    async fn exchange(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        let connection = ProviderConnection::spawn(&self.name, &self.command)?;

        let work = async {
            let init = connection.send_initialize().await?;
            tokio::time::sleep(self.timeouts.settle()).await;
            let call = connection.send(method, params).await?;
            let (handshake, result) =
                tokio::join!(connection.recv_handshake(init), connection.recv(call));
            handshake?;
            result
        };

        let outcome = match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                connection.kill().await;
                let err = connection.timeout_error(timeout);
                log::warn!("[{}] {method} timed out after {timeout:?}", self.name);
                return Err(err);
            }
        };

        connection.kill().await;
        outcome
    }
}

impl ToolTransport for SpawnPerCallTransport {
    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ProviderTool>, ToolError>> {
        Box::pin(async move {
            let result = self
                .exchange("tools/list", Some(json!({})), self.timeouts.discovery())
                .await?;
            decode_tools(result)
        })
    }

    fn call_tool<'a>(&'a self, name: &'a str, args: &'a Value) -> BoxFuture<'a, Result<Value, ToolError>> {
        Box::pin(async move {
            let params = call_params(name, args)?;
            let result = self
                .exchange("tools/call", Some(params), self.timeouts.for_tool(name))
                .await?;
            check_in_band(result)
        })
    }
}

/// One persistent connection per provider. Discovery runs once and is cached;
/// a connection that died (or was killed on timeout) is replaced on next use.
pub struct PooledTransport {
    name: String,
    command: ProviderCommand,
    timeouts: TransportTimeouts,
    connection: Mutex<Option<Arc<ProviderConnection>>>,
    tools: Mutex<Option<Vec<ProviderTool>>>,
}

impl PooledTransport {
    pub fn new(name: &str, command: ProviderCommand, timeouts: TransportTimeouts) -> Self {
        Self {
            name: name.to_string(),
            command,
            timeouts,
            connection: Mutex::new(None),
            tools: Mutex::new(None),
        }
    }

    /// Returns the pooled connection, spawning and handshaking a new one when
    /// needed. The handshake is bounded by `budget` as well as the discovery
    /// timeout, and its timeout error carries the new process's stderr.
    async fn live_connection(&self, budget: Duration) -> Result<Arc<ProviderConnection>, ToolError> {
        let started = tokio::time::Instant::now();
        let mut slot = tokio::time::timeout(budget, self.connection.lock())
            .await
            .map_err(|_| ToolError::Timeout {
                after: budget,
                stderr: String::new(),
            })?;
        if let Some(connection) = slot.as_ref() {
            if connection.is_alive() {
                return Ok(Arc::clone(connection));
            }
            log::info!("[{}] pooled connection is gone, respawning", self.name);
        }

        let connection = Arc::new(ProviderConnection::spawn(&self.name, &self.command)?);
        let init = connection.send_initialize().await?;
        let limit = self
            .timeouts
            .discovery()
            .min(budget.saturating_sub(started.elapsed()));
        match tokio::time::timeout(limit, connection.recv_handshake(init)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                connection.kill().await;
                return Err(err);
            }
            Err(_) => {
                connection.kill().await;
                log::warn!("[{}] handshake timed out after {limit:?}", self.name);
                return Err(connection.timeout_error(limit));
            }
        }
        tokio::time::sleep(self.timeouts.settle()).await;

        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        let started = tokio::time::Instant::now();
        let connection = self.live_connection(timeout).await?;

        let remaining = timeout.saturating_sub(started.elapsed());
        let call = connection.send(method, params).await?;
        match tokio::time::timeout(remaining, connection.recv(call)).await {
            Ok(result) => result,
            Err(_) => {
                // Shared fate: a hung provider is killed for every caller.
                connection.kill().await;
                log::warn!("[{}] {method} timed out after {timeout:?}", self.name);
                Err(connection.timeout_error(timeout))
            }
        }
    }
}

impl ToolTransport for PooledTransport {
    fn list_tools(&self) -> BoxFuture<'_, Result<Vec<ProviderTool>, ToolError>> {
        Box::pin(async move {
            let mut cached = self.tools.lock().await;
            if let Some(tools) = cached.as_ref() {
                return Ok(tools.clone());
            }
            let result = self
                .request("tools/list", Some(json!({})), self.timeouts.discovery())
                .await?;
            let tools = decode_tools(result)?;
            *cached = Some(tools.clone());
            Ok(tools)
        })
    }

    fn call_tool<'a>(&'a self, name: &'a str, args: &'a Value) -> BoxFuture<'a, Result<Value, ToolError>> {
        Box::pin(async move {
            let params = call_params(name, args)?;
            let result = self
                .request("tools/call", Some(params), self.timeouts.for_tool(name))
                .await?;
            check_in_band(result)
        })
    }
}
