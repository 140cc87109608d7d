//! Shared test support: a scripted mock LLM provider.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use code_agent::llm::{Completion, CompletionRequest, LlmClient, LlmEvent};
use code_agent::{Error, Result};
use futures::stream::BoxStream;

/// A provider that replays scripted responses. Streaming responses are
/// delivered in a few token chunks to exercise accumulation; requests
/// are recorded for assertions.
pub struct MockLlm {
    responses: Mutex<VecDeque<String>>,
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockLlm {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn next_response(&self) -> Result<String> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::api("mock provider ran out of scripted responses"))
    }
}

#[async_trait::async_trait]
impl LlmClient for MockLlm {
    async fn generate(&self, request: CompletionRequest) -> Result<Completion> {
        self.requests.lock().unwrap().push(request);
        Ok(Completion {
            content: Some(self.next_response()?),
            tool_calls: Vec::new(),
            usage: None,
        })
    }

    async fn generate_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<BoxStream<'static, Result<LlmEvent>>> {
        self.requests.lock().unwrap().push(request);
        let response = self.next_response()?;

        // Split into a handful of chunks at char boundaries.
        let chars: Vec<char> = response.chars().collect();
        let chunk_size = (chars.len() / 3).max(1);
        let tokens: Vec<LlmEvent> = chars
            .chunks(chunk_size)
            .map(|c| LlmEvent::Token(c.iter().collect()))
            .collect();

        Ok(Box::pin(futures::stream::iter(
            tokens.into_iter().map(Ok).collect::<Vec<_>>(),
        )))
    }

    fn model(&self) -> &str {
        "mock-model"
    }
}

/// Wrap thought + code into the response shape the loop expects.
pub fn turn(thought: &str, code: &str) -> String {
    format!("**Thought:** {thought}\n**Code:**\n```python\n{code}\n```<end_code>")
}
