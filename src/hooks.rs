//! Permission hooks: intercept every tool invocation for policy
//! decisions, input rewriting, and context injection.
//!
//! Every tool call from the evaluator traverses the pipeline:
//!
//! 1. Each registered pre-hook whose matcher covers the tool name runs in
//!    registration order. A `deny` aborts the call and synthesizes a
//!    denial result (post-hooks do not run); `ask` behaves like deny
//!    unless an accept-ask policy is installed; `accept` may replace the
//!    effective input.
//! 2. The tool executes.
//! 3. Matching post-hooks run with the result (or error). Any
//!    `continue_execution = false` aborts the whole code block with the
//!    hook's stop reason; `additional_context` strings are collected and
//!    appended to the observation for this result.
//!
//! Matchers use fnmatch-style globs (`*` matches all tools, `file_*`
//! matches the file tools), lists of globs, or arbitrary predicates.
//!
//! # Example
//!
//! ```rust
//! use code_agent::hooks::{Hooks, PreToolUseResult};
//!
//! let hooks = Hooks::new().add_pre_tool_use("bash", |event| async move {
//!     let command = event.tool_input["command"].as_str().unwrap_or("");
//!     if command.starts_with("rm -rf") {
//!         return Ok(PreToolUseResult::deny("rm -rf commands are blocked"));
//!     }
//!     Ok(PreToolUseResult::accept())
//! });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

use futures::FutureExt;
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::tools::{Tool, ToolDispatch, ToolNamespace};
use crate::value::{ToolFuture, Value};
use crate::{Error, Result};

/// Decision from a pre-tool-use hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Accept,
    Deny,
    /// Request user permission. The host runtime must obtain consent
    /// out-of-band; without an accept-ask policy this behaves like deny.
    Ask,
}

/// Result from a pre-tool-use hook.
#[derive(Debug, Clone)]
pub struct PreToolUseResult {
    pub decision: PermissionDecision,
    pub reason: Option<String>,
    /// Replacement for the tool's keyword arguments.
    pub modified_input: Option<Json>,
    /// Message to surface when denied.
    pub message: Option<String>,
}

impl PreToolUseResult {
    pub fn accept() -> Self {
        Self {
            decision: PermissionDecision::Accept,
            reason: None,
            modified_input: None,
            message: None,
        }
    }

    pub fn accept_with_input(input: Json) -> Self {
        Self {
            modified_input: Some(input),
            ..Self::accept()
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            decision: PermissionDecision::Deny,
            message: Some(reason.clone()),
            reason: Some(reason),
            modified_input: None,
        }
    }

    pub fn ask(reason: impl Into<String>) -> Self {
        Self {
            decision: PermissionDecision::Ask,
            reason: Some(reason.into()),
            modified_input: None,
            message: None,
        }
    }
}

/// Result from a post-tool-use hook.
#[derive(Debug, Clone)]
pub struct PostToolUseResult {
    /// Extra context appended to the observation for this tool result.
    pub additional_context: Option<String>,
    pub continue_execution: bool,
    /// Reason reported when stopping execution.
    pub stop_reason: Option<String>,
}

impl Default for PostToolUseResult {
    fn default() -> Self {
        Self {
            additional_context: None,
            continue_execution: true,
            stop_reason: None,
        }
    }
}

impl PostToolUseResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_context(context: impl Into<String>) -> Self {
        Self {
            additional_context: Some(context.into()),
            ..Self::default()
        }
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            additional_context: None,
            continue_execution: false,
            stop_reason: Some(reason.into()),
        }
    }
}

/// Event fired before tool execution.
#[derive(Debug, Clone)]
pub struct PreToolUseEvent {
    pub tool_name: String,
    pub tool_input: Json,
    pub tool_use_id: String,
}

/// Event fired after tool execution.
#[derive(Debug, Clone)]
pub struct PostToolUseEvent {
    pub tool_name: String,
    pub tool_input: Json,
    pub tool_use_id: String,
    /// Result in JSON form; `None` when the tool errored.
    pub result: Option<Json>,
    pub error: Option<String>,
}

/// Matcher deciding which tools trigger a hook: a glob, a list of globs,
/// or a predicate.
#[derive(Clone)]
pub enum MatchPattern {
    Glob(String),
    Globs(Vec<String>),
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl MatchPattern {
    pub fn matches(&self, tool_name: &str) -> bool {
        match self {
            MatchPattern::Glob(pattern) => glob_match(pattern, tool_name),
            MatchPattern::Globs(patterns) => {
                patterns.iter().any(|p| glob_match(p, tool_name))
            }
            MatchPattern::Predicate(predicate) => predicate(tool_name),
        }
    }
}

impl From<&str> for MatchPattern {
    fn from(pattern: &str) -> Self {
        MatchPattern::Glob(pattern.to_string())
    }
}

impl From<String> for MatchPattern {
    fn from(pattern: String) -> Self {
        MatchPattern::Glob(pattern)
    }
}

impl From<Vec<&str>> for MatchPattern {
    fn from(patterns: Vec<&str>) -> Self {
        MatchPattern::Globs(patterns.into_iter().map(String::from).collect())
    }
}

/// fnmatch-style glob: `*` matches any run, `?` matches one character.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(pattern: &[u8], name: &[u8]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], name)
                    || (!name.is_empty() && inner(pattern, &name[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&pattern[1..], &name[1..]),
            (Some(p), Some(n)) if p == n => inner(&pattern[1..], &name[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// Type alias for pre-hook handler functions.
pub type PreToolUseHandler = Arc<
    dyn Fn(PreToolUseEvent) -> Pin<Box<dyn Future<Output = Result<PreToolUseResult>> + Send>>
        + Send
        + Sync,
>;

/// Type alias for post-hook handler functions.
pub type PostToolUseHandler = Arc<
    dyn Fn(PostToolUseEvent) -> Pin<Box<dyn Future<Output = Result<PostToolUseResult>> + Send>>
        + Send
        + Sync,
>;

struct PreHookMatcher {
    pattern: MatchPattern,
    hook: PreToolUseHandler,
}

struct PostHookMatcher {
    pattern: MatchPattern,
    hook: PostToolUseHandler,
}

/// Policy for `ask` decisions when no interactive consent channel exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AskPolicy {
    /// Treat `ask` as deny (the safe default).
    #[default]
    DenyAsk,
    /// Treat `ask` as accept (inject only when a consent flow exists
    /// upstream).
    AcceptAsk,
}

/// Container for the hook pipeline configuration.
#[derive(Clone, Default)]
pub struct Hooks {
    pre_tool_use: Vec<Arc<PreHookMatcher>>,
    post_tool_use: Vec<Arc<PostHookMatcher>>,
    ask_policy: AskPolicy,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pre-tool-use hook for tools matching the pattern.
    pub fn add_pre_tool_use<M, F, Fut>(mut self, matcher: M, hook: F) -> Self
    where
        M: Into<MatchPattern>,
        F: Fn(PreToolUseEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PreToolUseResult>> + Send + 'static,
    {
        self.pre_tool_use.push(Arc::new(PreHookMatcher {
            pattern: matcher.into(),
            hook: Arc::new(move |event| Box::pin(hook(event))),
        }));
        self
    }

    /// Add a post-tool-use hook for tools matching the pattern.
    pub fn add_post_tool_use<M, F, Fut>(mut self, matcher: M, hook: F) -> Self
    where
        M: Into<MatchPattern>,
        F: Fn(PostToolUseEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PostToolUseResult>> + Send + 'static,
    {
        self.post_tool_use.push(Arc::new(PostHookMatcher {
            pattern: matcher.into(),
            hook: Arc::new(move |event| Box::pin(hook(event))),
        }));
        self
    }

    /// Set how `ask` decisions are arbitrated.
    pub fn ask_policy(mut self, policy: AskPolicy) -> Self {
        self.ask_policy = policy;
        self
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field(
                "pre_tool_use",
                &format!("{} handlers", self.pre_tool_use.len()),
            )
            .field(
                "post_tool_use",
                &format!("{} handlers", self.post_tool_use.len()),
            )
            .field("ask_policy", &self.ask_policy)
            .finish()
    }
}

/// Record of one tool invocation within a step.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub arguments: Json,
    pub call_id: String,
    pub result: Option<Json>,
    pub error: Option<String>,
    pub denied: bool,
}

#[derive(Default)]
struct StepRecords {
    tool_calls: Vec<ToolCallRecord>,
    additional_context: Vec<String>,
}

/// [`ToolDispatch`] implementation that routes every call through the
/// hook pipeline and records per-step telemetry for the reasoning loop.
pub struct HookedDispatcher {
    namespace: Arc<RwLock<ToolNamespace>>,
    hooks: Arc<Hooks>,
    records: Arc<Mutex<StepRecords>>,
}

impl HookedDispatcher {
    pub fn new(namespace: Arc<RwLock<ToolNamespace>>, hooks: Arc<Hooks>) -> Self {
        Self {
            namespace,
            hooks,
            records: Arc::new(Mutex::new(StepRecords::default())),
        }
    }

    /// Tool calls recorded since the last drain.
    pub fn drain_tool_calls(&self) -> Vec<ToolCallRecord> {
        std::mem::take(
            &mut self
                .records
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .tool_calls,
        )
    }

    /// Post-hook context strings collected since the last drain.
    pub fn drain_additional_context(&self) -> Vec<String> {
        std::mem::take(
            &mut self
                .records
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .additional_context,
        )
    }
}

impl ToolDispatch for HookedDispatcher {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.namespace
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .lookup(name)
    }

    fn dispatch(&self, tool: Arc<dyn Tool>, arguments: Json, call_id: String) -> ToolFuture {
        let hooks = Arc::clone(&self.hooks);
        let records = Arc::clone(&self.records);

        async move {
            let tool_name = tool.name().to_string();
            let mut effective_input = arguments;

            // Pre-hooks, in registration order.
            for matcher in &hooks.pre_tool_use {
                if !matcher.pattern.matches(&tool_name) {
                    continue;
                }
                let event = PreToolUseEvent {
                    tool_name: tool_name.clone(),
                    tool_input: effective_input.clone(),
                    tool_use_id: call_id.clone(),
                };
                let decision = (matcher.hook)(event)
                    .await
                    .map_err(|e| Error::hook(e.to_string()))?;

                let denied = match decision.decision {
                    PermissionDecision::Accept => false,
                    PermissionDecision::Deny => true,
                    PermissionDecision::Ask => hooks.ask_policy == AskPolicy::DenyAsk,
                };
                if denied {
                    let reason = decision
                        .message
                        .or(decision.reason)
                        .unwrap_or_else(|| "denied by policy".to_string());
                    warn!(tool = %tool_name, %reason, "tool call denied by pre-hook");
                    records
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .tool_calls
                        .push(ToolCallRecord {
                            tool_name: tool_name.clone(),
                            arguments: effective_input.clone(),
                            call_id: call_id.clone(),
                            result: None,
                            error: Some(reason.clone()),
                            denied: true,
                        });
                    // The denial becomes an ordinary tool-result value;
                    // post-hooks are skipped for denied calls.
                    return Ok(Value::Str(format!("Permission denied: {reason}")));
                }
                if let Some(modified) = decision.modified_input {
                    debug!(tool = %tool_name, "pre-hook modified tool input");
                    effective_input = modified;
                }
            }

            // The tool itself.
            let outcome = tool.invoke(effective_input.clone()).await;
            let (result_json, error_text) = match &outcome {
                Ok(value) => (Some(value.to_json()), None),
                Err(e) => (None, Some(e.to_string())),
            };

            records
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .tool_calls
                .push(ToolCallRecord {
                    tool_name: tool_name.clone(),
                    arguments: effective_input.clone(),
                    call_id: call_id.clone(),
                    result: result_json.clone(),
                    error: error_text.clone(),
                    denied: false,
                });

            // Post-hooks, in registration order.
            for matcher in &hooks.post_tool_use {
                if !matcher.pattern.matches(&tool_name) {
                    continue;
                }
                let event = PostToolUseEvent {
                    tool_name: tool_name.clone(),
                    tool_input: effective_input.clone(),
                    tool_use_id: call_id.clone(),
                    result: result_json.clone(),
                    error: error_text.clone(),
                };
                let post = (matcher.hook)(event)
                    .await
                    .map_err(|e| Error::hook(e.to_string()))?;
                if !post.continue_execution {
                    let reason = post
                        .stop_reason
                        .unwrap_or_else(|| "stopped by post-hook".to_string());
                    warn!(tool = %tool_name, %reason, "post-hook stopped execution");
                    return Err(Error::cancelled(reason));
                }
                if let Some(context) = post.additional_context {
                    records
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .additional_context
                        .push(context);
                }
            }

            outcome
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tool;
    use serde_json::json;

    fn namespace_with_bash() -> Arc<RwLock<ToolNamespace>> {
        let mut namespace = ToolNamespace::new();
        namespace.insert(Arc::new(
            tool("bash", "Run a command")
                .param("command", "string")
                .build(|args| async move {
                    Ok(json!({"ran": args["command"].as_str().unwrap_or("")}))
                }),
        ));
        namespace.insert(Arc::new(
            tool("file_read", "Read a file")
                .param("file_path", "string")
                .readonly(true)
                .build(|_| async { Ok(json!("contents")) }),
        ));
        Arc::new(RwLock::new(namespace))
    }

    fn dispatch(
        dispatcher: &HookedDispatcher,
        name: &str,
        args: Json,
    ) -> crate::value::ToolFuture {
        let tool = dispatcher.lookup(name).unwrap();
        dispatcher.dispatch(tool, args, "call_1".to_string())
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("bash", "bash"));
        assert!(!glob_match("bash", "bash2"));
        assert!(glob_match("file_*", "file_read"));
        assert!(glob_match("file_*", "file_write"));
        assert!(!glob_match("file_*", "bash"));
        assert!(glob_match("f?le_read", "file_read"));
    }

    #[tokio::test]
    async fn test_deny_never_reaches_tool() {
        let hooks = Arc::new(Hooks::new().add_pre_tool_use("bash", |event| async move {
            let command = event.tool_input["command"].as_str().unwrap_or("");
            if command.starts_with("rm -rf") {
                return Ok(PreToolUseResult::deny("rm -rf commands are blocked"));
            }
            Ok(PreToolUseResult::accept())
        }));
        let dispatcher = HookedDispatcher::new(namespace_with_bash(), hooks);

        let result = dispatch(&dispatcher, "bash", json!({"command": "rm -rf /tmp/foo"}))
            .await
            .unwrap();
        assert_eq!(
            result.py_str(),
            "Permission denied: rm -rf commands are blocked"
        );

        let calls = dispatcher.drain_tool_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].denied);
        assert!(calls[0].result.is_none());
    }

    #[tokio::test]
    async fn test_ask_behaves_like_deny_by_default() {
        let hooks = Arc::new(Hooks::new().add_pre_tool_use("*", |_| async move {
            Ok(PreToolUseResult::ask("needs confirmation"))
        }));
        let dispatcher = HookedDispatcher::new(namespace_with_bash(), hooks);

        let result = dispatch(&dispatcher, "bash", json!({"command": "ls"}))
            .await
            .unwrap();
        assert!(result.py_str().starts_with("Permission denied"));
    }

    #[tokio::test]
    async fn test_accept_ask_policy_lets_call_through() {
        let hooks = Arc::new(
            Hooks::new()
                .add_pre_tool_use("*", |_| async move {
                    Ok(PreToolUseResult::ask("needs confirmation"))
                })
                .ask_policy(AskPolicy::AcceptAsk),
        );
        let dispatcher = HookedDispatcher::new(namespace_with_bash(), hooks);

        let result = dispatch(&dispatcher, "bash", json!({"command": "ls"}))
            .await
            .unwrap();
        assert_eq!(result.to_json()["ran"], "ls");
    }

    #[tokio::test]
    async fn test_modified_input_is_effective() {
        let hooks = Arc::new(Hooks::new().add_pre_tool_use("bash", |_| async move {
            Ok(PreToolUseResult::accept_with_input(
                json!({"command": "echo safe"}),
            ))
        }));
        let dispatcher = HookedDispatcher::new(namespace_with_bash(), hooks);

        let result = dispatch(&dispatcher, "bash", json!({"command": "anything"}))
            .await
            .unwrap();
        assert_eq!(result.to_json()["ran"], "echo safe");
    }

    #[tokio::test]
    async fn test_post_hook_context_is_collected() {
        let hooks = Arc::new(Hooks::new().add_post_tool_use("file_*", |event| async move {
            Ok(PostToolUseResult::with_context(format!(
                "audited {}",
                event.tool_name
            )))
        }));
        let dispatcher = HookedDispatcher::new(namespace_with_bash(), hooks);

        dispatch(&dispatcher, "file_read", json!({"file_path": "/tmp/x"}))
            .await
            .unwrap();
        let context = dispatcher.drain_additional_context();
        assert_eq!(context, vec!["audited file_read".to_string()]);
    }

    #[tokio::test]
    async fn test_post_hook_stop_aborts() {
        let hooks = Arc::new(Hooks::new().add_post_tool_use("*", |_| async move {
            Ok(PostToolUseResult::stop("budget exceeded"))
        }));
        let dispatcher = HookedDispatcher::new(namespace_with_bash(), hooks);

        let error = dispatch(&dispatcher, "bash", json!({"command": "ls"}))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_hooks_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        let hooks = Arc::new(
            Hooks::new()
                .add_pre_tool_use("*", move |_| {
                    let order = Arc::clone(&o1);
                    async move {
                        order.lock().unwrap().push(1);
                        Ok(PreToolUseResult::accept())
                    }
                })
                .add_pre_tool_use("bash", move |_| {
                    let order = Arc::clone(&o2);
                    async move {
                        order.lock().unwrap().push(2);
                        Ok(PreToolUseResult::accept())
                    }
                }),
        );
        let dispatcher = HookedDispatcher::new(namespace_with_bash(), hooks);
        dispatch(&dispatcher, "bash", json!({"command": "ls"}))
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_predicate_matcher() {
        let hooks = Arc::new(Hooks::new().add_pre_tool_use(
            MatchPattern::Predicate(Arc::new(|name: &str| !name.ends_with("_read"))),
            |_| async move { Ok(PreToolUseResult::deny("writes require review")) },
        ));
        let dispatcher = HookedDispatcher::new(namespace_with_bash(), hooks);

        // file_read is exempt via the predicate.
        let ok = dispatch(&dispatcher, "file_read", json!({"file_path": "x"}))
            .await
            .unwrap();
        assert_eq!(ok.py_str(), "contents");

        let denied = dispatch(&dispatcher, "bash", json!({"command": "ls"}))
            .await
            .unwrap();
        assert!(denied.py_str().starts_with("Permission denied"));
    }
}
