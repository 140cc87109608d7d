//! Configuration for the evaluator, the reasoning loop, and provider
//! endpoint resolution.
//!
//! All limits flow into the core as immutable config structs passed to
//! each step; there is no global mutable state. The provider helpers
//! mirror the usual local-server setups (LM Studio, Ollama, llama.cpp,
//! vLLM) with environment-variable overrides.

use std::env;
use std::str::FromStr;

use crate::interp::modules::DEFAULT_AUTHORIZED_IMPORTS;

/// Limits enforced by the sandboxed evaluator, per code block.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Abort evaluation after this many AST-node visits.
    pub max_operations: u64,
    /// Cap on accumulated `print` output; the prefix is kept, the tail
    /// silently dropped.
    pub max_print_chars: usize,
    /// Root module names `import` may resolve.
    pub authorized_imports: Vec<String>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_print_chars: 50_000,
            authorized_imports: DEFAULT_AUTHORIZED_IMPORTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl EvaluatorConfig {
    pub fn with_max_operations(mut self, max_operations: u64) -> Self {
        self.max_operations = max_operations;
        self
    }

    pub fn with_max_print_chars(mut self, max_print_chars: usize) -> Self {
        self.max_print_chars = max_print_chars;
        self
    }

    pub fn with_authorized_imports(
        mut self,
        imports: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.authorized_imports = imports.into_iter().map(Into::into).collect();
        self
    }
}

/// Limits and switches for the reasoning loop, per task.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Maximum Thought→Code→Observation iterations before the step closes
    /// as truncated.
    pub max_iterations: u32,
    /// Observation size guard in bytes; oversize observations truncate on
    /// a UTF-8 boundary and gain a tool-specific hint.
    pub max_observation_bytes: usize,
    /// Enable the "looks like a final answer" heuristic on result text
    /// (restricted to the leading bytes of the output).
    pub final_answer_heuristic: bool,
    /// Stop sequence marking the end of a code block.
    pub stop_token: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            max_observation_bytes: 400 * 1024,
            final_answer_heuristic: true,
            stop_token: "<end_code>".to_string(),
        }
    }
}

impl LoopConfig {
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_observation_bytes(mut self, bytes: usize) -> Self {
        self.max_observation_bytes = bytes;
        self
    }

    pub fn with_final_answer_heuristic(mut self, enabled: bool) -> Self {
        self.final_answer_heuristic = enabled;
        self
    }
}

// ============================================================================
// PROVIDER HELPERS
// ============================================================================

/// Supported local OpenAI-compatible server providers.
///
/// Each provider has a default base URL where its API server typically
/// runs; all of them speak the chat-completions protocol, so they are
/// interchangeable from the SDK's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// LM Studio - GUI-based local server (default port 1234)
    LMStudio,
    /// Ollama - command-line focused local server (default port 11434)
    Ollama,
    /// llama.cpp - C++ inference engine with server mode (default port 8080)
    LlamaCpp,
    /// vLLM - high-performance inference server (default port 8000)
    VLLM,
}

impl Provider {
    /// Default localhost URL including the `/v1` suffix the
    /// OpenAI-compatible API expects.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::LMStudio => "http://localhost:1234/v1",
            Provider::Ollama => "http://localhost:11434/v1",
            Provider::LlamaCpp => "http://localhost:8080/v1",
            Provider::VLLM => "http://localhost:8000/v1",
        }
    }
}

impl FromStr for Provider {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lmstudio" | "lm-studio" | "lm_studio" => Ok(Provider::LMStudio),
            "ollama" => Ok(Provider::Ollama),
            "llamacpp" | "llama-cpp" | "llama.cpp" => Ok(Provider::LlamaCpp),
            "vllm" => Ok(Provider::VLLM),
            other => Err(crate::Error::config(format!("unknown provider: {other}"))),
        }
    }
}

/// Resolve the base URL: `CODE_AGENT_BASE_URL` wins, then an explicit
/// override, then the provider default (LM Studio when unset).
pub fn get_base_url(provider: Option<Provider>, explicit: Option<&str>) -> String {
    if let Ok(from_env) = env::var("CODE_AGENT_BASE_URL") {
        if !from_env.is_empty() {
            return from_env;
        }
    }
    if let Some(explicit) = explicit {
        return explicit.to_string();
    }
    provider
        .unwrap_or(Provider::LMStudio)
        .default_base_url()
        .to_string()
}

/// Resolve the model name; with `prefer_env`, `CODE_AGENT_MODEL`
/// overrides the explicit name.
pub fn get_model(explicit: Option<&str>, prefer_env: bool) -> Option<String> {
    let from_env = env::var("CODE_AGENT_MODEL").ok().filter(|m| !m.is_empty());
    if prefer_env {
        from_env.or_else(|| explicit.map(String::from))
    } else {
        explicit.map(String::from).or(from_env)
    }
}
