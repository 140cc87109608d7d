//! # Code Agent SDK
//!
//! A streaming-first Rust SDK for code-executing AI agents over
//! OpenAI-compatible servers (LM Studio, Ollama, llama.cpp, vLLM, or
//! hosted endpoints).
//!
//! ## Overview
//!
//! The agent drives a **Thought → Code → Observation** loop: each turn
//! the model emits prose plus one Python code block ending in
//! `<end_code>`; the block runs inside a sandboxed interpreter with
//! bounded resources; its result is formatted into an observation and
//! fed back for the next turn. The loop ends when the code calls the
//! distinguished `final_answer` tool or the iteration budget runs out.
//!
//! ## Key Features
//!
//! - **Sandboxed interpreter**: a Python-subset evaluator with an
//!   operation budget, a capped print buffer, authorized imports, and
//!   first-class exceptions - no host access beyond the tools you grant
//! - **Uniform tools**: local closures, remote HTTP/MCP endpoints, and
//!   skills behind one trait, with automatic schema conversion
//! - **Permission hooks**: pre/post interceptors on every tool call
//!   (accept, deny, ask), input rewriting, and context injection
//! - **Streaming events**: typed chunks (thinking, code_start,
//!   code_result, tool_call, final_answer, …) as the loop progresses
//! - **Worker strategies**: chain-of-thought, plan-then-act, native
//!   tool-calling, and the code loop, with an LLM router and ensemble
//!   voting
//! - **Checkpointing**: per-task save/resume of loop state
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use code_agent::{CodeAgent, OpenAiClient};
//! use code_agent::toolkit::default_toolkit;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let llm = Arc::new(OpenAiClient::new(
//!         "qwen2.5-32b-instruct",
//!         "http://localhost:1234/v1",
//!         "not-needed",
//!     )?);
//!
//!     let mut agent = CodeAgent::builder()
//!         .llm(llm)
//!         .tools(default_toolkit())
//!         .build()?;
//!
//!     let response = agent.run("Compute 15*8+27.").await;
//!     println!("{}", response.answer_text());
//!     Ok(())
//! }
//! ```
//!
//! ## Streaming
//!
//! ```rust,no_run
//! # use code_agent::{CodeAgent, EventSink};
//! # async fn example(mut agent: CodeAgent) {
//! let (sink, mut events) = EventSink::channel();
//! let consumer = tokio::spawn(async move {
//!     while let Some(chunk) = events.recv().await {
//!         print!("{}", chunk.content);
//!     }
//! });
//! let response = agent.run_with_events("Summarize /tmp/report.txt", &sink).await;
//! drop(sink);
//! let _ = consumer.await;
//! # let _ = response;
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **agent**: the reasoning loop, steps, and state machine
//! - **interp**: lexer, parser, and async evaluator for the sandboxed
//!   Python subset
//! - **tools / remote / registry / toolkit / skills**: the tool surface
//! - **hooks**: the permission pipeline
//! - **observation**: observation assembly and truncation
//! - **llm**: provider contract and OpenAI-compatible client
//! - **history / events**: conversation log and stream chunks
//! - **workers**: strategy selection, routing, ensembles
//! - **config / context / retry / checkpoint**: supporting concerns

mod error;

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod events;
pub mod history;
pub mod hooks;
pub mod interp;
pub mod llm;
pub mod observation;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod skills;
pub mod toolkit;
pub mod tools;
pub mod value;
pub mod workers;

// --- Core agent API ---

pub use agent::{
    ActionStep, AgentResponse, AgentState, CodeAgent, CodeAgentBuilder, StepType, TaskInput,
};

// --- Errors ---

pub use error::{Error, Result};

// --- Configuration ---

pub use config::{get_base_url, get_model, EvaluatorConfig, LoopConfig, Provider};

// --- Interpreter ---

pub use interp::{Evaluator, Execution};

// --- Values ---

pub use value::{Exception, Value};

// --- Tools ---

pub use tools::{tool, sanitize_tool_name, FnTool, Tool, ToolBuilder, ToolNamespace};

// --- Hooks ---

pub use hooks::{
    AskPolicy, HookedDispatcher, Hooks, MatchPattern, PermissionDecision, PostToolUseEvent,
    PostToolUseResult, PreToolUseEvent, PreToolUseResult,
};

// --- Conversation & events ---

pub use events::{ChunkType, EventSink, StreamChunk, Usage};
pub use history::{ContentBlock, ConversationHistory, Message, MessageContent, MessageRole};

// --- Provider ---

pub use llm::{Completion, CompletionRequest, CompletionToolCall, LlmClient, LlmEvent, OpenAiClient};

// --- Context management ---

pub use context::{estimate_tokens, is_approaching_limit, truncate_messages};

/// Convenience module containing the most commonly used types and
/// functions. Import with `use code_agent::prelude::*;`.
pub mod prelude {
    pub use crate::{
        tool, AgentResponse, ChunkType, CodeAgent, ContentBlock, Error, EvaluatorConfig,
        EventSink, Hooks, LlmClient, LoopConfig, Message, OpenAiClient, PreToolUseResult,
        Result, StreamChunk, Tool, Value,
    };
}
