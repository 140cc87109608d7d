//! LLM provider contract and the OpenAI-compatible client.
//!
//! The core consumes providers through [`LlmClient`]: a non-streaming
//! `generate` and a streaming `generate_stream` over the standard
//! chat-completions protocol. Any OpenAI-compatible server works - LM
//! Studio, Ollama, llama.cpp, vLLM, or a hosted endpoint.
//!
//! # Streaming
//!
//! Responses arrive as Server-Sent Events; tool calls arrive as
//! **incremental deltas** spread across chunks:
//!
//! ```text
//! Chunk 1: { tool_calls: [{ index: 0, id: "call_1", function: { name: "search" } }] }
//! Chunk 2: { tool_calls: [{ index: 0, function: { arguments: "{\"q" } }] }
//! Chunk 3: { tool_calls: [{ index: 0, function: { arguments: "\":\"rust\"}" } }] }
//! Chunk 4: { finish_reason: "tool_calls" }
//! ```
//!
//! [`ToolCallAggregator`] accumulates the deltas and emits complete tool
//! calls only when a finish reason appears; argument JSON may split at
//! arbitrary byte positions, so it is assembled as a raw string and
//! parsed once complete.

use std::collections::HashMap;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use crate::events::Usage;
use crate::history::{ContentBlock, Message, MessageContent, MessageRole};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// A request to the provider: messages plus optional tool definitions,
/// tool choice, and stop sequences.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    /// Tool definitions in the provider's function-calling format.
    pub tools: Option<Vec<Json>>,
    pub tool_choice: Option<Json>,
    pub stop: Option<Vec<String>>,
}

impl CompletionRequest {
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Json>) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// A parsed tool call from the model.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Json,
}

/// Non-streaming completion result.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<CompletionToolCall>,
    pub usage: Option<Usage>,
}

/// One streaming event: a text token, a batch of completed tool calls,
/// or usage info at end of stream.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Token(String),
    ToolCalls(Vec<CompletionToolCall>),
    Usage(Usage),
}

/// The provider contract the core consumes.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, request: CompletionRequest) -> Result<Completion>;

    async fn generate_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<BoxStream<'static, Result<LlmEvent>>>;

    /// Model identifier, for event metadata.
    fn model(&self) -> &str;
}

// ----------------------------------------------------------------------
// Wire format
// ----------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Json>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Json,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

fn to_wire_message(message: &Message) -> WireMessage {
    let role = match message.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };
    let content = match &message.content {
        MessageContent::Text(text) => Json::String(text.clone()),
        MessageContent::Blocks(blocks) => Json::Array(
            blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => {
                        serde_json::json!({"type": "text", "text": text})
                    }
                    ContentBlock::ImageUrl { url } => {
                        serde_json::json!({"type": "image_url", "image_url": {"url": url}})
                    }
                })
                .collect(),
        ),
    };
    WireMessage {
        role,
        content,
        tool_call_id: message.tool_call_id.clone(),
        name: message.name.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct WireCompletion {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    #[serde(default)]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    /// Arguments arrive as a JSON-encoded string.
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl WireUsage {
    fn into_usage(self) -> Usage {
        Usage {
            input_tokens: self.prompt_tokens,
            output_tokens: self.completion_tokens,
            ..Usage::default()
        }
    }
}

/// Streaming chunk shapes.
#[derive(Debug, Deserialize)]
pub struct OpenAIChunk {
    #[serde(default)]
    pub choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChoice {
    pub delta: OpenAIDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenAIDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAIToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIToolCallDelta {
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<OpenAIFunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

// ----------------------------------------------------------------------
// Delta aggregation
// ----------------------------------------------------------------------

/// In-progress tool call assembled from deltas. The index keys a map so
/// interleaved deltas for multiple concurrent tool calls accumulate
/// independently.
#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Stateful accumulator turning chunk deltas into complete tool calls.
/// Buffers are cleared once a finish reason flushes them, readying the
/// aggregator for the next turn.
#[derive(Default)]
pub struct ToolCallAggregator {
    tool_calls: HashMap<u32, PartialToolCall>,
}

impl ToolCallAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk's tool-call deltas.
    pub fn accumulate(&mut self, choice: &OpenAIChoice) {
        if let Some(tool_calls) = &choice.delta.tool_calls {
            for delta in tool_calls {
                let entry = self.tool_calls.entry(delta.index).or_default();
                if let Some(id) = &delta.id {
                    entry.id = Some(id.clone());
                }
                if let Some(function) = &delta.function {
                    if let Some(name) = &function.name {
                        entry.name = Some(name.clone());
                    }
                    if let Some(arguments) = &function.arguments {
                        entry.arguments.push_str(arguments);
                    }
                }
            }
        }
    }

    /// Flush on finish: validate assembled argument JSON and emit the
    /// completed calls. Entries missing an id or name are dropped.
    pub fn finish(&mut self) -> Result<Vec<CompletionToolCall>> {
        let mut completed = Vec::new();
        let mut entries: Vec<(u32, PartialToolCall)> = self.tool_calls.drain().collect();
        entries.sort_by_key(|(index, _)| *index);
        for (_, partial) in entries {
            if let (Some(id), Some(name)) = (partial.id, partial.name) {
                let arguments: Json = if partial.arguments.is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&partial.arguments).map_err(|e| {
                        Error::stream(format!("failed to parse tool arguments: {e}"))
                    })?
                };
                completed.push(CompletionToolCall {
                    id,
                    name,
                    arguments,
                });
            }
        }
        Ok(completed)
    }
}

// ----------------------------------------------------------------------
// OpenAI-compatible client
// ----------------------------------------------------------------------

/// Client for any OpenAI-compatible chat-completions endpoint.
pub struct OpenAiClient {
    model: String,
    base_url: String,
    api_key: String,
    temperature: f32,
    max_tokens: Option<u32>,
    retry: RetryConfig,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let model = model.into();
        let base_url = base_url.into();
        if model.trim().is_empty() {
            return Err(Error::invalid_input("model cannot be empty or whitespace"));
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::invalid_input(
                "base_url must start with http:// or https://",
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            model,
            base_url,
            api_key: api_key.into(),
            temperature: 0.7,
            max_tokens: Some(4096),
            retry: RetryConfig::default(),
            client,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Result<Self> {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(Error::invalid_input(
                "temperature must be between 0.0 and 2.0",
            ));
        }
        self.temperature = temperature;
        Ok(self)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(self)
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn build_request(&self, request: &CompletionRequest, stream: bool) -> WireRequest {
        WireRequest {
            model: self.model.clone(),
            messages: request.messages.iter().map(to_wire_message).collect(),
            stream,
            max_tokens: self.max_tokens,
            temperature: Some(self.temperature),
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
            stop: request.stop.clone(),
        }
    }

    async fn post(&self, body: &WireRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
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
            return Err(Error::api(format!("API error {status}: {body}")));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, request: CompletionRequest) -> Result<Completion> {
        let wire = self.build_request(&request, false);
        // Transient network failures retry with backoff; API errors
        // (4xx/5xx with a body) surface immediately.
        let response = retry_with_backoff(self.retry.clone(), || async {
            self.post(&wire).await
        })
        .await?;

        let parsed: WireCompletion = response.json().await.map_err(Error::Http)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::api("completion response had no choices"))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let arguments: Json = if call.function.arguments.is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&call.function.arguments)
                        .unwrap_or(Json::String(call.function.arguments))
                };
                CompletionToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(Completion {
            content: choice.message.content,
            tool_calls,
            usage: parsed.usage.map(WireUsage::into_usage),
        })
    }

    async fn generate_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<BoxStream<'static, Result<LlmEvent>>> {
        let wire = self.build_request(&request, true);
        let response = self.post(&wire).await?;
        debug!(model = %self.model, "streaming completion started");

        let stream = response
            .bytes_stream()
            .eventsource()
            .scan(ToolCallAggregator::new(), |aggregator, event| {
                let item: Option<Vec<Result<LlmEvent>>> = match event {
                    Err(e) => Some(vec![Err(Error::stream(format!("SSE error: {e}")))]),
                    Ok(event) => {
                        // The protocol terminates with a [DONE] sentinel,
                        // which is not JSON.
                        if event.data.trim() == "[DONE]" {
                            Some(Vec::new())
                        } else {
                            match serde_json::from_str::<OpenAIChunk>(&event.data) {
                                Err(e) => Some(vec![Err(Error::stream(format!(
                                    "failed to parse chunk: {e}"
                                )))]),
                                Ok(chunk) => {
                                    let mut events = Vec::new();
                                    for choice in &chunk.choices {
                                        if let Some(content) = &choice.delta.content {
                                            if !content.is_empty() {
                                                events
                                                    .push(Ok(LlmEvent::Token(content.clone())));
                                            }
                                        }
                                        aggregator.accumulate(choice);
                                        if choice.finish_reason.is_some() {
                                            match aggregator.finish() {
                                                Ok(calls) if !calls.is_empty() => {
                                                    events.push(Ok(LlmEvent::ToolCalls(calls)));
                                                }
                                                Ok(_) => {}
                                                Err(e) => events.push(Err(e)),
                                            }
                                        }
                                    }
                                    if let Some(usage) = chunk.usage {
                                        events.push(Ok(LlmEvent::Usage(usage.into_usage())));
                                    }
                                    Some(events)
                                }
                            }
                        }
                    }
                };
                futures::future::ready(item)
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(stream))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choice(
        content: Option<&str>,
        tool_deltas: Option<Vec<OpenAIToolCallDelta>>,
        finish: Option<&str>,
    ) -> OpenAIChoice {
        OpenAIChoice {
            delta: OpenAIDelta {
                content: content.map(String::from),
                tool_calls: tool_deltas,
            },
            finish_reason: finish.map(String::from),
        }
    }

    #[test]
    fn test_aggregator_assembles_split_arguments() {
        let mut aggregator = ToolCallAggregator::new();
        aggregator.accumulate(&choice(
            None,
            Some(vec![OpenAIToolCallDelta {
                index: 0,
                id: Some("call_123".to_string()),
                function: Some(OpenAIFunctionDelta {
                    name: Some("get_weather".to_string()),
                    arguments: Some(r#"{"location":"#.to_string()),
                }),
            }]),
            None,
        ));
        aggregator.accumulate(&choice(
            None,
            Some(vec![OpenAIToolCallDelta {
                index: 0,
                id: None,
                function: Some(OpenAIFunctionDelta {
                    name: None,
                    arguments: Some(r#""Paris"}"#.to_string()),
                }),
            }]),
            Some("tool_calls"),
        ));

        let calls = aggregator.finish().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_123");
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments["location"], "Paris");
    }

    #[test]
    fn test_aggregator_interleaved_calls_sorted_by_index() {
        let mut aggregator = ToolCallAggregator::new();
        for (index, name) in [(1u32, "calculate"), (0u32, "search")] {
            aggregator.accumulate(&choice(
                None,
                Some(vec![OpenAIToolCallDelta {
                    index,
                    id: Some(format!("call_{index}")),
                    function: Some(OpenAIFunctionDelta {
                        name: Some(name.to_string()),
                        arguments: Some("{}".to_string()),
                    }),
                }]),
                None,
            ));
        }
        let calls = aggregator.finish().unwrap();
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[1].name, "calculate");
    }

    #[test]
    fn test_aggregator_invalid_json_is_an_error() {
        let mut aggregator = ToolCallAggregator::new();
        aggregator.accumulate(&choice(
            None,
            Some(vec![OpenAIToolCallDelta {
                index: 0,
                id: Some("call_1".to_string()),
                function: Some(OpenAIFunctionDelta {
                    name: Some("broken".to_string()),
                    arguments: Some("{not json".to_string()),
                }),
            }]),
            Some("tool_calls"),
        ));
        assert!(aggregator.finish().is_err());
    }

    #[test]
    fn test_aggregator_drops_incomplete_entries() {
        let mut aggregator = ToolCallAggregator::new();
        aggregator.accumulate(&choice(
            None,
            Some(vec![OpenAIToolCallDelta {
                index: 0,
                id: None,
                function: Some(OpenAIFunctionDelta {
                    name: None,
                    arguments: Some("{}".to_string()),
                }),
            }]),
            Some("stop"),
        ));
        assert!(aggregator.finish().unwrap().is_empty());
    }

    #[test]
    fn test_client_validation() {
        assert!(OpenAiClient::new("", "http://localhost:1234/v1", "k").is_err());
        assert!(OpenAiClient::new("m", "localhost:1234", "k").is_err());
        assert!(OpenAiClient::new("m", "http://localhost:1234/v1", "k").is_ok());
        assert!(OpenAiClient::new("m", "http://localhost:1234/v1", "k")
            .unwrap()
            .with_temperature(3.0)
            .is_err());
    }

    #[test]
    fn test_wire_message_multimodal() {
        let message = Message::user(vec![
            ContentBlock::text("look at this"),
            ContentBlock::image_url("data:image/png;base64,AA"),
        ]);
        let wire = to_wire_message(&message);
        assert_eq!(wire.role, "user");
        let blocks = wire.content.as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["image_url"]["url"], "data:image/png;base64,AA");
    }

    #[test]
    fn test_wire_message_tool_role() {
        let message = Message::tool("call_9", "result text");
        let wire = to_wire_message(&message);
        assert_eq!(wire.role, "tool");
        assert_eq!(wire.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(wire.content, Json::String("result text".to_string()));
    }

    #[test]
    fn test_wire_request_omits_empty_options() {
        let client = OpenAiClient::new("m", "http://localhost:1234/v1", "k").unwrap();
        let wire = client.build_request(
            &CompletionRequest::from_messages(vec![Message::user("hi")]),
            true,
        );
        let json = serde_json::to_value(&wire).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("stop").is_none());
        assert_eq!(json["stream"], true);
    }
}
