//! Streaming event bus: typed chunks emitted as the reasoning loop
//! progresses.
//!
//! Consumers treat a run of `partial = true` chunks followed by a
//! `partial = false` chunk as one message stream: partials concatenate,
//! a complete chunk supersedes the partials before it.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::mpsc;

/// What a chunk carries.
///
/// | kind | partial | meaning |
/// |------|---------|---------|
/// | `Thinking` | true | incremental model prose (pre-code) |
/// | `Text` | true | generic partial text |
/// | `StepStart` | false | a loop iteration is beginning |
/// | `CodeStart` | false | code block begins; content is the code |
/// | `ToolCall` | false | tool about to run (metadata carries args) |
/// | `ToolResponse` | false | tool returned (metadata carries name+result) |
/// | `CodeResult` | false | evaluator finished (metadata: success/error) |
/// | `Observation` | false | formatted observation prepared |
/// | `FinalAnswer` | false | final answer detected |
/// | `Completion` | false | step terminated |
/// | `Error` | false | fatal error in the loop |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Text,
    Thinking,
    StepStart,
    CodeStart,
    ToolCall,
    ToolResponse,
    CodeResult,
    Observation,
    FinalAnswer,
    Completion,
    Error,
}

/// Token usage for one API call; additive across a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    /// Cost in USD, when pricing is known; not accumulated by `add`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cost_usd: Option<f64>,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Accumulate another usage record in place. `cost_usd` is left
    /// untouched; recompute it after summing tokens.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
    }

    /// Compute cost from per-token pricing; cache reads default to 10%
    /// of the input rate, cache writes to 125%.
    pub fn calculate_cost(&self, input_cost_per_token: f64, output_cost_per_token: f64) -> f64 {
        self.input_tokens as f64 * input_cost_per_token
            + self.output_tokens as f64 * output_cost_per_token
            + self.cache_read_input_tokens as f64 * input_cost_per_token * 0.1
            + self.cache_creation_input_tokens as f64 * input_cost_per_token * 1.25
    }
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, other: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cache_creation_input_tokens: self.cache_creation_input_tokens
                + other.cache_creation_input_tokens,
            cache_read_input_tokens: self.cache_read_input_tokens + other.cache_read_input_tokens,
            cost_usd: None,
        }
    }
}

/// One streamed output chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    pub chunk_type: ChunkType,
    #[serde(default)]
    pub metadata: Json,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    /// True for an incremental token to concatenate; false for a
    /// complete message superseding prior partials.
    pub partial: bool,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model: Option<String>,
}

impl StreamChunk {
    /// A complete (non-partial) chunk.
    pub fn new(content: impl Into<String>, chunk_type: ChunkType) -> Self {
        Self {
            content: content.into(),
            chunk_type,
            metadata: Json::Null,
            timestamp: now_epoch_secs(),
            partial: false,
            uuid: uuid::Uuid::new_v4().to_string(),
            usage: None,
            model: None,
        }
    }

    /// An incremental token chunk.
    pub fn partial(content: impl Into<String>, chunk_type: ChunkType) -> Self {
        Self {
            partial: true,
            ..Self::new(content, chunk_type)
        }
    }

    pub fn with_metadata(mut self, metadata: Json) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Where the loop emits chunks. A disabled sink drops everything;
/// consumers that care call [`EventSink::channel`] and read the
/// receiver.
#[derive(Clone, Default)]
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<StreamChunk>>,
}

impl EventSink {
    /// A sink that discards all chunks.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A live sink plus its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamChunk>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Emit a chunk. Send failures (receiver dropped) are ignored - the
    /// loop's progress never depends on a listener.
    pub fn emit(&self, chunk: StreamChunk) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(chunk);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_additive_semantics() {
        let mut total = Usage::default();
        total.add(&Usage {
            input_tokens: 100,
            output_tokens: 20,
            cache_creation_input_tokens: 10,
            cache_read_input_tokens: 5,
            cost_usd: None,
        });
        total.add(&Usage {
            input_tokens: 50,
            output_tokens: 30,
            ..Usage::default()
        });
        assert_eq!(total.input_tokens, 150);
        assert_eq!(total.output_tokens, 50);
        assert_eq!(total.total_tokens(), 200);
        assert_eq!(total.cache_creation_input_tokens, 10);
    }

    #[test]
    fn test_usage_add_operator() {
        let a = Usage {
            input_tokens: 1,
            output_tokens: 2,
            ..Usage::default()
        };
        let b = Usage {
            input_tokens: 3,
            output_tokens: 4,
            ..Usage::default()
        };
        let sum = a + b;
        assert_eq!(sum.input_tokens, 4);
        assert_eq!(sum.output_tokens, 6);
    }

    #[test]
    fn test_chunk_type_serialization() {
        assert_eq!(
            serde_json::to_string(&ChunkType::CodeStart).unwrap(),
            "\"code_start\""
        );
        assert_eq!(
            serde_json::to_string(&ChunkType::FinalAnswer).unwrap(),
            "\"final_answer\""
        );
    }

    #[test]
    fn test_partial_flag() {
        let partial = StreamChunk::partial("tok", ChunkType::Thinking);
        assert!(partial.partial);
        let complete = StreamChunk::new("done", ChunkType::Completion);
        assert!(!complete.partial);
        assert_ne!(partial.uuid, complete.uuid);
    }

    #[tokio::test]
    async fn test_event_sink_channel() {
        let (sink, mut receiver) = EventSink::channel();
        assert!(sink.is_enabled());
        sink.emit(StreamChunk::new("code", ChunkType::CodeStart));
        let chunk = receiver.recv().await.unwrap();
        assert_eq!(chunk.chunk_type, ChunkType::CodeStart);
        assert_eq!(chunk.content, "code");
    }

    #[test]
    fn test_disabled_sink_does_not_panic() {
        let sink = EventSink::disabled();
        assert!(!sink.is_enabled());
        sink.emit(StreamChunk::new("ignored", ChunkType::Text));
    }
}
