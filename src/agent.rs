//! The reasoning loop: Thought→Code→Observation over an LLM.
//!
//! Each iteration builds a prompt from the system message (tool listing
//! plus the fixed instruction set), prior turns, and the current turn's
//! attempts; streams a completion with the `<end_code>` stop sequence;
//! extracts the first code block; submits it to the sandboxed evaluator;
//! and feeds the formatted observation back for the next iteration. The
//! loop halts on a `final_answer` call, on a response without code, when
//! the iteration budget runs out, or on an unrecoverable error.
//!
//! Errors are part of the protocol: parse failures, interpreter limits,
//! tool errors, and hook denials all become observations the model is
//! expected to self-correct from (up to the in-turn retry budget).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::config::{EvaluatorConfig, LoopConfig};
use crate::events::{ChunkType, EventSink, StreamChunk, Usage};
use crate::history::{ContentBlock, ConversationHistory, Message, MessageContent};
use crate::hooks::{HookedDispatcher, Hooks, ToolCallRecord};
use crate::interp::{last_tool_name, Evaluator};
use crate::llm::{CompletionRequest, LlmClient, LlmEvent};
use crate::observation;
use crate::toolkit::FinalAnswerTool;
use crate::tools::{Tool, ToolDispatch, ToolNamespace, FINAL_ANSWER_TOOL_NAME};
use crate::value::Value;
use crate::{Error, Result};

/// Output prefixes the final-answer heuristic looks for (within the
/// first 200 bytes of the result text).
const FINAL_ANSWER_INDICATORS: &[&str] = &[
    "final answer:",
    "final result:",
    "final solution:",
    "the answer is:",
    "result is:",
    "solution is:",
];

/// How many bytes of the result text the heuristic inspects. Keeping the
/// window small stops a tool output that merely quotes "the answer is:"
/// deep inside a document from ending the loop.
const HEURISTIC_WINDOW_BYTES: usize = 200;

/// The terminal value of one agent step.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    /// The model's raw output for the deciding turn (thought + code).
    pub raw_response: String,
    /// The extracted answer value.
    pub answer: Value,
    /// Confidence-ish score in [0, 1].
    pub score: f64,
    /// True when the step reached a definitive end.
    pub terminated: bool,
    /// True when the step was cut short (budget, cancellation).
    pub truncated: bool,
    /// True when the answer came from `final_answer` (or an equivalent
    /// definitive signal).
    pub is_final_answer: bool,
    /// Structured diagnostics.
    pub info: Json,
    /// Short human-readable reason when the step ended without a final
    /// answer.
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn answer_text(&self) -> String {
        self.answer.py_str()
    }
}

/// Agent-level state machine.
///
/// `Idle → Planning → Executing → (Reflecting | Executing)* → Halted`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Planning,
    Executing,
    Reflecting,
    Halted,
}

/// Kind of a recorded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    Action,
    Planning,
    ToolCall,
    Observation,
}

/// Record of one reasoning turn.
#[derive(Debug, Clone)]
pub struct ActionStep {
    pub step_number: u32,
    pub step_type: StepType,
    pub input_query: Option<String>,
    pub output_content: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub is_streaming: bool,
    pub is_complete: bool,
    pub is_final_answer: bool,
    pub error: Option<String>,
    pub step_id: String,
}

impl ActionStep {
    fn new(step_number: u32, input_query: Option<String>) -> Self {
        Self {
            step_number,
            step_type: StepType::Action,
            input_query,
            output_content: String::new(),
            tool_calls: Vec::new(),
            is_streaming: true,
            is_complete: false,
            is_final_answer: false,
            error: None,
            step_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn complete(&mut self, is_final_answer: bool) {
        self.is_complete = true;
        self.is_streaming = false;
        self.is_final_answer = is_final_answer;
    }
}

/// Task input: plain text or multimodal content blocks.
#[derive(Debug, Clone)]
pub enum TaskInput {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl TaskInput {
    /// Text view for history consolidation and checkpoints.
    pub fn as_text(&self) -> String {
        match self {
            TaskInput::Text(text) => text.clone(),
            TaskInput::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<&str> for TaskInput {
    fn from(text: &str) -> Self {
        TaskInput::Text(text.to_string())
    }
}

impl From<String> for TaskInput {
    fn from(text: String) -> Self {
        TaskInput::Text(text)
    }
}

impl From<Vec<ContentBlock>> for TaskInput {
    fn from(blocks: Vec<ContentBlock>) -> Self {
        TaskInput::Blocks(blocks)
    }
}

/// Builder for [`CodeAgent`].
pub struct CodeAgentBuilder {
    llm: Option<Arc<dyn LlmClient>>,
    tools: Vec<Arc<dyn Tool>>,
    hooks: Hooks,
    loop_config: LoopConfig,
    eval_config: EvaluatorConfig,
}

impl CodeAgentBuilder {
    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = config;
        self
    }

    pub fn eval_config(mut self, config: EvaluatorConfig) -> Self {
        self.eval_config = config;
        self
    }

    pub fn build(self) -> Result<CodeAgent> {
        let llm = self.llm.ok_or_else(|| Error::config("llm is required"))?;
        let mut namespace = ToolNamespace::new();
        let mut has_final_answer = false;
        let mut tools = Vec::new();
        for tool in self.tools {
            if tool.name() == FINAL_ANSWER_TOOL_NAME {
                has_final_answer = true;
            }
            namespace.insert(Arc::clone(&tool));
            tools.push(tool);
        }
        if !has_final_answer {
            let sentinel: Arc<dyn Tool> = Arc::new(FinalAnswerTool);
            namespace.insert(Arc::clone(&sentinel));
            tools.push(sentinel);
        }
        Ok(CodeAgent {
            llm,
            tools,
            namespace: Arc::new(RwLock::new(namespace)),
            hooks: Arc::new(self.hooks),
            loop_config: self.loop_config,
            eval_config: self.eval_config,
            history: ConversationHistory::new(),
            steps: Vec::new(),
            state: AgentState::Idle,
            usage: Usage::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// A code-executing agent: LLM + tools + hooks + history + evaluator.
pub struct CodeAgent {
    llm: Arc<dyn LlmClient>,
    tools: Vec<Arc<dyn Tool>>,
    namespace: Arc<RwLock<ToolNamespace>>,
    hooks: Arc<Hooks>,
    loop_config: LoopConfig,
    eval_config: EvaluatorConfig,
    history: ConversationHistory,
    steps: Vec<ActionStep>,
    state: AgentState,
    usage: Usage,
    cancelled: Arc<AtomicBool>,
}

impl CodeAgent {
    pub fn builder() -> CodeAgentBuilder {
        CodeAgentBuilder {
            llm: None,
            tools: Vec::new(),
            hooks: Hooks::new(),
            loop_config: LoopConfig::default(),
            eval_config: EvaluatorConfig::default(),
        }
    }

    /// The agent's live tool namespace (shared with `load_tool`).
    pub fn namespace(&self) -> &Arc<RwLock<ToolNamespace>> {
        &self.namespace
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn steps(&self) -> &[ActionStep] {
        &self.steps
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Replace the session history (checkpoint rehydration).
    pub fn set_history(&mut self, history: ConversationHistory) {
        self.history = history;
    }

    /// Cumulative token usage across the session.
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Signal cancellation: the running evaluation aborts at its next
    /// operation tick and the step closes as truncated.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// A handle for cancelling from another task while `run` holds the
    /// agent mutably. Setting it has the same effect as [`cancel`](Self::cancel).
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Run a task to completion without event streaming.
    pub async fn run(&mut self, task: impl Into<TaskInput>) -> AgentResponse {
        self.run_with_events(task, &EventSink::disabled()).await
    }

    /// Run a task, emitting [`StreamChunk`]s to the sink as the loop
    /// progresses. Create a sink with [`EventSink::channel`] and consume
    /// the receiver concurrently.
    pub async fn run_with_events(
        &mut self,
        task: impl Into<TaskInput>,
        events: &EventSink,
    ) -> AgentResponse {
        let task = task.into();
        self.run_inner(task, Vec::new(), 0, events).await
    }

    /// Continue a previously checkpointed task from its saved iteration.
    pub async fn resume(
        &mut self,
        task: impl Into<TaskInput>,
        attempts: Vec<String>,
        start_iteration: u32,
        events: &EventSink,
    ) -> AgentResponse {
        self.run_inner(task.into(), attempts, start_iteration, events)
            .await
    }

    async fn run_inner(
        &mut self,
        task: TaskInput,
        mut attempts: Vec<String>,
        start_iteration: u32,
        events: &EventSink,
    ) -> AgentResponse {
        self.cancelled.store(false, Ordering::Relaxed);
        self.state = AgentState::Planning;

        let dispatcher = Arc::new(HookedDispatcher::new(
            Arc::clone(&self.namespace),
            Arc::clone(&self.hooks),
        ));
        let evaluator = Evaluator::new(
            self.eval_config.clone(),
            Arc::clone(&dispatcher) as Arc<dyn ToolDispatch>,
        )
        .with_cancellation_flag(Arc::clone(&self.cancelled));

        let mut error = String::new();
        let mut last_response = String::new();

        for iteration in start_iteration..self.loop_config.max_iterations {
            if self.cancelled.load(Ordering::Relaxed) {
                return self.finish(
                    events,
                    AgentResponse {
                        raw_response: last_response.clone(),
                        answer: Value::Str(last_response),
                        score: 0.0,
                        terminated: false,
                        truncated: true,
                        is_final_answer: false,
                        info: serde_json::json!({"cancelled": true}),
                        error: Some("cancelled".to_string()),
                    },
                );
            }

            self.state = AgentState::Executing;
            let step_number = self.steps.len() as u32 + 1;
            self.steps
                .push(ActionStep::new(step_number, Some(task.as_text())));
            events.emit(
                StreamChunk::new(
                    format!(
                        "Step {}/{}",
                        iteration + 1,
                        self.loop_config.max_iterations
                    ),
                    ChunkType::StepStart,
                )
                .with_metadata(serde_json::json!({
                    "iteration": iteration,
                    "max_iterations": self.loop_config.max_iterations,
                })),
            );

            // --- LLM turn -------------------------------------------------
            let messages = self.build_messages(&task, &error, &attempts);
            let request = CompletionRequest::from_messages(messages)
                .with_stop(vec![self.loop_config.stop_token.clone()]);

            let mut response = String::new();
            match self.llm.generate_stream(request).await {
                Err(e) => {
                    warn!(error = %e, "LLM call failed");
                    return self.finish(
                        events,
                        AgentResponse {
                            raw_response: last_response.clone(),
                            answer: Value::Str(last_response),
                            score: 0.0,
                            terminated: false,
                            truncated: true,
                            is_final_answer: false,
                            info: serde_json::json!({"llm_error": e.to_string()}),
                            error: Some(e.to_string()),
                        },
                    );
                }
                Ok(mut stream) => {
                    let mut stream_failed = None;
                    while let Some(event) = stream.next().await {
                        match event {
                            Ok(LlmEvent::Token(token)) => {
                                response.push_str(&token);
                                events.emit(
                                    StreamChunk::partial(token, ChunkType::Thinking)
                                        .with_metadata(
                                            serde_json::json!({"iteration": iteration}),
                                        )
                                        .with_model(self.llm.model()),
                                );
                            }
                            Ok(LlmEvent::Usage(usage)) => {
                                self.usage.add(&usage);
                            }
                            // Code mode requests no native tools.
                            Ok(LlmEvent::ToolCalls(_)) => {}
                            Err(e) => {
                                stream_failed = Some(e);
                                break;
                            }
                        }
                    }
                    if let Some(e) = stream_failed {
                        return self.finish(
                            events,
                            AgentResponse {
                                raw_response: response.clone(),
                                answer: Value::Str(response),
                                score: 0.0,
                                terminated: false,
                                truncated: true,
                                is_final_answer: false,
                                info: serde_json::json!({"llm_error": e.to_string()}),
                                error: Some(e.to_string()),
                            },
                        );
                    }
                }
            }

            // Re-append the stop token when the stream cut before it so
            // code-block extraction finds a terminator.
            if !response.trim_end().ends_with(&self.loop_config.stop_token) {
                response.push_str(&self.loop_config.stop_token);
            }
            last_response = response.clone();
            if let Some(step) = self.steps.last_mut() {
                step.output_content = response.clone();
            }
            attempts.push(format!(
                "**Assistant Response {}:** {response}",
                iteration + 1
            ));

            // --- Code extraction ------------------------------------------
            let code_blocks = extract_code_blocks(&response, &self.loop_config.stop_token);
            let Some(code) = code_blocks.into_iter().next() else {
                // No code: the raw text is the final answer.
                info!("no code block found, treating response as final answer");
                self.consolidate_history(&task, &response);
                return self.finish(
                    events,
                    AgentResponse {
                        raw_response: response.clone(),
                        answer: Value::Str(strip_stop_token(
                            &response,
                            &self.loop_config.stop_token,
                        )),
                        score: 0.5,
                        terminated: true,
                        truncated: false,
                        is_final_answer: true,
                        info: serde_json::json!({"no_code_found": true}),
                        error: None,
                    },
                );
            };

            events.emit(
                StreamChunk::new(code.clone(), ChunkType::CodeStart).with_metadata(
                    serde_json::json!({"iteration": iteration}),
                ),
            );
            debug!(%code, "executing code block");

            // --- Evaluation -----------------------------------------------
            let execution = evaluator.run(&code).await;
            self.record_tool_activity(&dispatcher, events);

            match execution {
                Err(e) if e.is_recoverable() => {
                    error = e.to_string();
                    events.emit(
                        StreamChunk::new(error.clone(), ChunkType::CodeResult).with_metadata(
                            serde_json::json!({"success": false, "error": error, "iteration": iteration}),
                        ),
                    );
                    attempts.push(format!("**Observation:** Error occurred:\n{error}"));
                    if let Some(step) = self.steps.last_mut() {
                        step.error = Some(error.clone());
                        step.complete(false);
                    }
                    self.state = AgentState::Reflecting;
                    continue;
                }
                Err(e) => {
                    // Cancellation / hook stop / internal failure.
                    events.emit(StreamChunk::new(e.to_string(), ChunkType::Error));
                    self.consolidate_history(&task, &response);
                    return self.finish(
                        events,
                        AgentResponse {
                            raw_response: response.clone(),
                            answer: Value::Str(response),
                            score: 0.0,
                            terminated: false,
                            truncated: true,
                            is_final_answer: false,
                            info: serde_json::json!({"aborted": e.to_string()}),
                            error: Some(e.to_string()),
                        },
                    );
                }
                Ok(execution) => {
                    if let Some(exception) = execution.error() {
                        error = exception.to_string();
                        events.emit(
                            StreamChunk::new(error.clone(), ChunkType::CodeResult).with_metadata(
                                serde_json::json!({"success": false, "error": error, "iteration": iteration}),
                            ),
                        );
                        attempts.push(format!("**Observation:** Error occurred:\n{error}"));
                        if let Some(step) = self.steps.last_mut() {
                            step.error = Some(error.clone());
                            step.complete(false);
                        }
                        self.state = AgentState::Reflecting;
                        continue;
                    }

                    // Success: build the observation.
                    let terminal_tool = last_tool_name(&code).and_then(|name| {
                        self.namespace
                            .read()
                            .unwrap_or_else(|p| p.into_inner())
                            .lookup(&name)
                    });
                    let formatted_output =
                        observation::format_output(&execution.value, terminal_tool.as_deref());
                    let mut observation_text =
                        observation::render(&execution.logs, formatted_output.as_deref());
                    for context in dispatcher.drain_additional_context() {
                        observation_text.push_str("\nContext: ");
                        observation_text.push_str(&context);
                    }
                    let observation_text = observation::truncate_output(
                        &observation_text,
                        self.loop_config.max_observation_bytes,
                        terminal_tool
                            .as_ref()
                            .map(|t| t.name())
                            .unwrap_or_default(),
                    );

                    events.emit(
                        StreamChunk::new(observation_text.clone(), ChunkType::CodeResult)
                            .with_metadata(serde_json::json!({
                                "success": true,
                                "iteration": iteration,
                                "has_logs": !execution.logs.is_empty(),
                            })),
                    );

                    if execution.is_final_answer {
                        info!(answer = %execution.value.py_str(), "final answer detected");
                        self.consolidate_history(&task, &response);
                        return self.finish(
                            events,
                            AgentResponse {
                                raw_response: response.clone(),
                                answer: execution.value,
                                score: 1.0,
                                terminated: true,
                                truncated: false,
                                is_final_answer: true,
                                info: serde_json::json!({"final_answer_detected": true}),
                                error: None,
                            },
                        );
                    }

                    // Heuristic: the output *looks* like a final answer.
                    let result_text = if execution.logs.is_empty() {
                        execution.value.py_str()
                    } else {
                        execution.logs.clone()
                    };
                    if self.loop_config.final_answer_heuristic
                        && looks_like_final_answer(&result_text)
                    {
                        self.consolidate_history(&task, &response);
                        return self.finish(
                            events,
                            AgentResponse {
                                raw_response: response.clone(),
                                answer: Value::Str(result_text),
                                score: 1.0,
                                terminated: true,
                                truncated: false,
                                is_final_answer: true,
                                info: serde_json::json!({"final_answer_heuristic": true}),
                                error: None,
                            },
                        );
                    }

                    events.emit(StreamChunk::new(
                        observation_text.clone(),
                        ChunkType::Observation,
                    ));
                    attempts.push(format!(
                        "**Observation:** Code executed successfully:\n{observation_text}"
                    ));
                    if let Some(step) = self.steps.last_mut() {
                        step.complete(false);
                    }
                    error = String::new();

                    if iteration + 1 == self.loop_config.max_iterations {
                        self.consolidate_history(&task, &result_text);
                        return self.finish(
                            events,
                            AgentResponse {
                                raw_response: response.clone(),
                                answer: Value::Str(result_text),
                                score: 0.8,
                                terminated: false,
                                truncated: true,
                                is_final_answer: false,
                                info: serde_json::json!({"max_iterations_reached": true}),
                                error: Some("iteration budget exhausted".to_string()),
                            },
                        );
                    }
                    self.state = AgentState::Reflecting;
                }
            }
        }

        // All iterations consumed by errors.
        self.consolidate_history(&task, &last_response);
        self.finish(
            events,
            AgentResponse {
                raw_response: last_response.clone(),
                answer: Value::Str(last_response),
                score: 0.3,
                terminated: false,
                truncated: true,
                is_final_answer: false,
                info: serde_json::json!({"all_iterations_failed": true}),
                error: Some("iteration budget exhausted without a final answer".to_string()),
            },
        )
    }

    /// Emit terminal chunks, mark the step, and transition to Halted.
    fn finish(&mut self, events: &EventSink, response: AgentResponse) -> AgentResponse {
        if let Some(step) = self.steps.last_mut() {
            step.complete(response.is_final_answer);
            if step.error.is_none() {
                step.error = response.error.clone();
            }
        }
        if response.is_final_answer {
            events.emit(StreamChunk::new(
                response.answer.py_str(),
                ChunkType::FinalAnswer,
            ));
        }
        events.emit(
            StreamChunk::new(String::new(), ChunkType::Completion).with_metadata(
                serde_json::json!({
                    "terminated": response.terminated,
                    "truncated": response.truncated,
                }),
            ),
        );
        self.state = AgentState::Halted;
        response
    }

    /// Move per-call telemetry from the dispatcher onto the current step
    /// and the event bus.
    fn record_tool_activity(&mut self, dispatcher: &HookedDispatcher, events: &EventSink) {
        let records = dispatcher.drain_tool_calls();
        for record in &records {
            events.emit(
                StreamChunk::new(record.tool_name.clone(), ChunkType::ToolCall).with_metadata(
                    serde_json::json!({
                        "arguments": record.arguments,
                        "call_id": record.call_id,
                    }),
                ),
            );
            events.emit(
                StreamChunk::new(record.tool_name.clone(), ChunkType::ToolResponse)
                    .with_metadata(serde_json::json!({
                        "result": record.result,
                        "error": record.error,
                        "denied": record.denied,
                    })),
            );
        }
        if let Some(step) = self.steps.last_mut() {
            step.tool_calls.extend(records);
        }
    }

    /// On success the whole turn collapses into a single user/assistant
    /// pair appended to the session history; intermediate attempts stay
    /// local to the task invocation.
    fn consolidate_history(&mut self, task: &TaskInput, outcome: &str) {
        match task {
            TaskInput::Text(text) => self.history.append(Message::user(text.clone())),
            TaskInput::Blocks(blocks) => self
                .history
                .append(Message::user(MessageContent::Blocks(blocks.clone()))),
        }
        self.history.append(Message::assistant(strip_stop_token(
            outcome,
            &self.loop_config.stop_token,
        )));
    }

    /// Compose the full message list for one iteration: system prompt,
    /// prior turns, then the current user message with task, error
    /// feedback, and this turn's attempts.
    fn build_messages(&self, task: &TaskInput, error: &str, attempts: &[String]) -> Vec<Message> {
        let mut messages = vec![Message::system(self.system_prompt())];
        messages.extend(self.history.to_list());

        let mut blocks: Vec<ContentBlock> = Vec::new();
        match task {
            TaskInput::Text(text) => {
                blocks.push(ContentBlock::text(format!("**Problem:** {text}")));
            }
            TaskInput::Blocks(task_blocks) => {
                blocks.push(ContentBlock::text("**Problem:**"));
                blocks.extend(task_blocks.iter().cloned());
            }
        }
        if !error.is_empty() {
            blocks.push(ContentBlock::text(format!(
                "\n**Previous Error:**\n{error}\n\nPlease fix the error and try again."
            )));
        }
        if !attempts.is_empty() {
            blocks.push(ContentBlock::text(format!(
                "\n**Previous attempts:**\n{}",
                attempts.join("\n")
            )));
        }
        blocks.push(ContentBlock::text(format!(
            "\nLet's start! Remember to end your code blocks with {}.",
            self.loop_config.stop_token
        )));

        messages.push(Message::user(MessageContent::Blocks(blocks)));
        messages
    }

    /// The system message: tool listing plus the fixed instruction set.
    fn system_prompt(&self) -> String {
        let mut tool_lines = Vec::new();
        for tool in &self.tools {
            let mut line = format!("- {}: {}", tool.name(), tool.description());
            if tool.readonly() {
                line.push_str(
                    " [READONLY - This tool only reads data and does not modify system state]",
                );
            }
            let inputs = tool.inputs();
            let properties = inputs
                .get("properties")
                .and_then(Json::as_object)
                .cloned()
                .or_else(|| inputs.as_object().cloned());
            if let Some(properties) = properties {
                if !properties.is_empty() {
                    let params: Vec<String> = properties
                        .iter()
                        .map(|(name, spec)| {
                            let param_type =
                                spec.get("type").and_then(Json::as_str).unwrap_or("any");
                            let description = spec
                                .get("description")
                                .and_then(Json::as_str)
                                .unwrap_or("");
                            format!("{name} ({param_type}): {description}")
                        })
                        .collect();
                    line.push_str(&format!("\n  Parameters: {}", params.join(", ")));
                }
            }
            tool_lines.push(line);
        }
        let tools_description = if tool_lines.is_empty() {
            "- print: Output information to the user".to_string()
        } else {
            tool_lines.join("\n")
        };

        format!(
            "You are an expert assistant who can solve any task using code blobs. You will be \
             given a task to solve as best you can.\n\
             To do so, you have been given access to a list of tools. Each tool is actually a \
             Python function which you can call by writing Python code.\n\n\
             You are provided with the following tools:\n{tools_description}\n\n\
             **Important Notes for Asynchronous Operations:**\n\
             - You are already in an async context - DON'T use `asyncio.run()`\n\
             - Use `await` directly at the top level in your code: `result = await async_function()`\n\
             - When calling async tools, always use `await` to get the actual result\n\n\
             **Important Notes for Tool Usage:**\n\
             - ALWAYS use keyword arguments when calling tools, never use positional arguments\n\
             - Example: `await tool_name(param1=\"value1\", param2=\"value2\")`\n\
             - All tool parameters must be explicitly named\n\n\
             Follow the Thought -> Code -> Observation pattern. Here is the format:\n\
             **Thought:** Your reasoning about what to do next\n\
             **Code:**\n\
             ```python\n\
             # Your Python code here\n\
             ```{stop}\n\n\
             **Observation:** [This will be filled automatically with the execution result]\n\n\
             Emit exactly one code block per turn, ending with {stop}. Continue the \
             Thought/Code/Observation cycle until you solve the task completely, then call \
             `final_answer(answer=...)`.",
            stop = self.loop_config.stop_token
        )
    }
}

/// Extract Python code blocks terminated by the stop token.
fn extract_code_blocks(text: &str, stop_token: &str) -> Vec<String> {
    if !text.contains(stop_token) {
        return Vec::new();
    }
    let pattern = regex::RegexBuilder::new(&format!(
        r"```(?:python|py)?[ \t]*\n(.*?){}",
        regex::escape(stop_token)
    ))
    .dot_matches_new_line(true)
    .build()
    .expect("static pattern shape");

    pattern
        .captures_iter(text)
        .filter_map(|caps| {
            let mut code = caps.get(1)?.as_str().trim().to_string();
            if let Some(stripped) = code.strip_suffix("```") {
                code = stripped.trim().to_string();
            }
            if code.is_empty() { None } else { Some(code) }
        })
        .collect()
}

fn strip_stop_token(text: &str, stop_token: &str) -> String {
    text.trim_end()
        .trim_end_matches(stop_token)
        .trim_end()
        .to_string()
}

/// The "looks like a final answer" heuristic, restricted to the leading
/// bytes of the result text.
fn looks_like_final_answer(output: &str) -> bool {
    let mut window_end = HEURISTIC_WINDOW_BYTES.min(output.len());
    while window_end > 0 && !output.is_char_boundary(window_end) {
        window_end -= 1;
    }
    let window = output[..window_end].to_lowercase();
    FINAL_ANSWER_INDICATORS
        .iter()
        .any(|indicator| window.contains(indicator))
}
