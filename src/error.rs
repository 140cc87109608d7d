//! Error types for the Code Agent SDK

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the SDK
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// API error from the model server
    #[error("API error: {0}")]
    Api(String),

    /// Streaming error
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Generated code failed to tokenize or parse
    #[error("Parse error: {0}")]
    Parse(String),

    /// The sandboxed interpreter rejected or aborted the code
    /// (unauthorized import, operation budget exceeded, unsupported node,
    /// uncaught exception in user code)
    #[error("Interpreter error: {0}")]
    Interpreter(String),

    /// Tool execution error
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// A hook itself failed; the tool call is considered failed
    #[error("Hook error: {0}")]
    Hook(String),

    /// A pre-tool-use hook denied the call (or asked without consent)
    #[error("Permission denied for tool '{tool}': {reason}")]
    PermissionDenied {
        /// Name of the tool that was blocked
        tool: String,
        /// Reason reported by the hook
        reason: String,
    },

    /// Iteration budget reached before a final answer
    #[error("Iteration budget exhausted after {0} iterations")]
    BudgetExhausted(u32),

    /// Externally induced cancellation
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout error
    #[error("Request timeout")]
    Timeout,

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error
    pub fn api(msg: impl Into<String>) -> Self {
        Error::Api(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    /// Create a new interpreter error
    pub fn interpreter(msg: impl Into<String>) -> Self {
        Error::Interpreter(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new hook error
    pub fn hook(msg: impl Into<String>) -> Self {
        Error::Hook(msg.into())
    }

    /// Create a permission-denied error
    pub fn permission_denied(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::PermissionDenied {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Error::Cancelled(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Whether this error should be surfaced to the model as an observation
    /// and retried (true), or terminate the step (false).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Parse(_)
                | Error::Interpreter(_)
                | Error::Tool(_)
                | Error::Hook(_)
                | Error::PermissionDenied { .. }
        )
    }
}
