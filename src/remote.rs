//! Remote tool variants: plain HTTP endpoints and MCP servers.
//!
//! Both present the uniform [`Tool`] surface; `invoke` performs the
//! network round-trip. Remote tools are always asynchronous - generated
//! code receives a coroutine and must `await` it.
//!
//! Remote output is additionally guarded by an estimated-token limit so
//! a misbehaving server cannot flood the model's context; see
//! [`crate::observation::check_remote_output`].

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

use crate::observation::check_remote_output;
use crate::tools::Tool;
use crate::value::Value;
use crate::{Error, Result};

/// A tool backed by a plain HTTP endpoint: keyword arguments POST as a
/// JSON body, the response body becomes the result value.
pub struct HttpTool {
    name: String,
    description: String,
    inputs: Json,
    endpoint: String,
    readonly: bool,
    client: reqwest::Client,
}

impl HttpTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        endpoint: impl Into<String>,
        inputs: Json,
    ) -> Result<Self> {
        let endpoint = endpoint.into();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(Error::invalid_input(
                "endpoint must start with http:// or https://",
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            name: name.into(),
            description: description.into(),
            inputs,
            endpoint,
            readonly: false,
            client,
        })
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(self)
    }
}

#[async_trait::async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn inputs(&self) -> Json {
        self.inputs.clone()
    }

    fn is_async(&self) -> bool {
        true
    }

    fn readonly(&self) -> bool {
        self.readonly
    }

    async fn invoke(&self, arguments: Json) -> Result<Value> {
        debug!(tool = %self.name, endpoint = %self.endpoint, "HTTP tool call");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&arguments)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout
                } else {
                    Error::Http(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::tool(format!(
                "remote tool '{}' returned {status}: {body}",
                self.name
            )));
        }

        let body: Json = response.json().await.map_err(Error::Http)?;
        check_remote_output(&body.to_string())?;
        Ok(Value::from_json(&body))
    }
}

// ----------------------------------------------------------------------
// MCP (JSON-RPC 2.0 over HTTP)
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Json>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct McpToolDescriptor {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "inputSchema")]
    input_schema: Json,
}

#[derive(Debug, Deserialize)]
struct McpToolList {
    #[serde(default)]
    tools: Vec<McpToolDescriptor>,
}

/// Connection to an MCP server; discovers its tools and wraps each one
/// as a [`McpTool`].
pub struct McpToolset {
    endpoint: String,
    client: reqwest::Client,
}

impl McpToolset {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(Error::invalid_input(
                "MCP endpoint must start with http:// or https://",
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(Error::Http)?;
        Ok(Self { endpoint, client })
    }

    async fn rpc(&self, method: &str, params: Json) -> Result<Json> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout
                } else {
                    Error::Http(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::tool(format!(
                "MCP server returned HTTP {}",
                response.status()
            )));
        }

        let parsed: JsonRpcResponse = response.json().await.map_err(Error::Http)?;
        if let Some(error) = parsed.error {
            return Err(Error::tool(format!(
                "MCP error {}: {}",
                error.code, error.message
            )));
        }
        parsed
            .result
            .ok_or_else(|| Error::tool("MCP response carried neither result nor error"))
    }

    /// `tools/list` discovery: one [`McpTool`] per remote descriptor.
    pub async fn discover(self: Arc<Self>) -> Result<Vec<Arc<dyn Tool>>> {
        let result = self.rpc("tools/list", serde_json::json!({})).await?;
        let list: McpToolList = serde_json::from_value(result)?;
        debug!(endpoint = %self.endpoint, count = list.tools.len(), "MCP tools discovered");
        Ok(list
            .tools
            .into_iter()
            .map(|descriptor| {
                Arc::new(McpTool {
                    toolset: Arc::clone(&self),
                    name: descriptor.name,
                    description: descriptor.description,
                    inputs: descriptor.input_schema,
                }) as Arc<dyn Tool>
            })
            .collect())
    }
}

/// One tool on an MCP server; `invoke` issues `tools/call`.
pub struct McpTool {
    toolset: Arc<McpToolset>,
    name: String,
    description: String,
    inputs: Json,
}

#[async_trait::async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn inputs(&self) -> Json {
        self.inputs.clone()
    }

    fn is_async(&self) -> bool {
        true
    }

    async fn invoke(&self, arguments: Json) -> Result<Value> {
        let result = self
            .toolset
            .rpc(
                "tools/call",
                serde_json::json!({
                    "name": self.name,
                    "arguments": arguments,
                }),
            )
            .await?;

        // MCP results carry a content array of typed blocks; collapse
        // text blocks into a string, pass structured content through.
        if let Some(content) = result.get("content").and_then(Json::as_array) {
            let mut text_parts = Vec::new();
            for block in content {
                if block.get("type").and_then(Json::as_str) == Some("text") {
                    if let Some(text) = block.get("text").and_then(Json::as_str) {
                        text_parts.push(text.to_string());
                    }
                }
            }
            if !text_parts.is_empty() {
                let combined = text_parts.join("\n");
                check_remote_output(&combined)?;
                return Ok(Value::Str(combined));
            }
        }
        check_remote_output(&result.to_string())?;
        Ok(Value::from_json(&result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_tool_rejects_bad_endpoint() {
        let result = HttpTool::new("t", "d", "ftp://example.com", serde_json::json!({}));
        assert!(result.is_err());
    }

    #[test]
    fn test_mcp_toolset_rejects_bad_endpoint() {
        assert!(McpToolset::new("not-a-url").is_err());
        assert!(McpToolset::new("http://localhost:9000/mcp").is_ok());
    }

    #[test]
    fn test_mcp_descriptor_parsing() {
        let list: McpToolList = serde_json::from_value(serde_json::json!({
            "tools": [
                {"name": "echo", "description": "Echo text",
                 "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}}
            ]
        }))
        .unwrap();
        assert_eq!(list.tools.len(), 1);
        assert_eq!(list.tools[0].name, "echo");
    }

    #[test]
    fn test_http_tool_is_async() {
        let tool = HttpTool::new(
            "remote.search",
            "Remote search",
            "http://localhost:8000/search",
            serde_json::json!({"query": "string"}),
        )
        .unwrap();
        assert!(tool.is_async());
        assert_eq!(tool.name(), "remote.search");
    }
}
