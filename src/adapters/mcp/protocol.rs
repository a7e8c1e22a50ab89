use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }

    /// One wire frame: the serialized request plus its terminating newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{}\n", serde_json::to_string(self)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any incoming frame that carries a numeric id. Notifications and requests
/// from the provider have no (or a non-numeric) id and are ignored upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Decodes one line. `None` means the line is not a JSON object with a
/// numeric id: provider chatter on stdout, or a notification.
pub fn parse_response_line(line: &str) -> Option<JsonRpcResponse> {
    let value: Value = serde_json::from_str(line).ok()?;
    if !value.is_object() {
        return None;
    }
    let response: JsonRpcResponse = serde_json::from_value(value).ok()?;
    response.id.map(|_| response)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Value::Object(Default::default()),
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ToolCallParams<'a> {
    pub name: &'a str,
    pub arguments: &'a Value,
}

/// Tool definition as advertised by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ProviderTool>,
}

/// Providers that follow the MCP result envelope flag failures in-band
/// with `isError: true`; the text parts become the error message.
pub fn in_band_error(result: &Value) -> Option<String> {
    if result.get("isError").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|text| !text.trim().is_empty());
    Some(text.unwrap_or_else(|| "tool reported an error".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initialize_params_use_camel_case_keys() {
        let value = serde_json::to_value(InitializeParams::default()).expect("encode");
        assert_eq!(value["protocolVersion"], json!(PROTOCOL_VERSION));
        assert_eq!(value["capabilities"], json!({}));
        assert_eq!(value["clientInfo"]["name"], json!("relay"));
    }

    #[test]
    fn request_line_is_newline_terminated() {
        let line = JsonRpcRequest::new(2, "tools/list", None)
            .to_line()
            .expect("encode");
        assert_eq!(line, "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/list\"}\n");
    }

    #[test]
    fn non_protocol_lines_are_skipped() {
        assert!(parse_response_line("Loading weights 40%").is_none());
        assert!(parse_response_line("[1,2,3]").is_none());
        assert!(
            parse_response_line(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#)
                .is_none()
        );
        let response =
            parse_response_line(r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32000,"message":"boom"}}"#)
                .expect("response");
        assert_eq!(response.id, Some(7));
        let error = response.into_result().expect_err("error payload");
        assert_eq!(error.message, "boom");
    }

    #[test]
    fn in_band_error_collects_text_parts() {
        let result = json!({
            "isError": true,
            "content": [{ "type": "text", "text": "symbol not found" }]
        });
        assert_eq!(in_band_error(&result), Some("symbol not found".to_string()));
        assert_eq!(in_band_error(&json!({ "content": [] })), None);
    }
}
