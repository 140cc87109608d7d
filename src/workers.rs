//! Worker strategies and the LLM-driven router.
//!
//! A worker is one way of attacking a task: chain-of-thought,
//! plan-then-act, native tool-calling, or the code loop. The router asks
//! the model to pick one by name via a structured-output call; on any
//! failure it falls back to chain-of-thought. Ensemble mode runs several
//! workers and reduces their answers with a result strategy.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{info, warn};

use crate::agent::{AgentResponse, CodeAgent};
use crate::config::{EvaluatorConfig, LoopConfig};
use crate::history::Message;
use crate::hooks::{HookedDispatcher, Hooks};
use crate::llm::{CompletionRequest, LlmClient};
use crate::tools::{Tool, ToolDispatch, ToolNamespace, FINAL_ANSWER_TOOL_NAME};
use crate::value::Value;
use crate::{Error, Result};

/// One strategy for executing a task.
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    /// Registry name the router selects by.
    fn name(&self) -> &str;

    /// Shown to the router when choosing.
    fn description(&self) -> String;

    async fn execute(&self, task: &str) -> Result<AgentResponse>;
}

/// Chain-of-thought: a single completion with step-by-step reasoning.
pub struct CotWorker {
    llm: Arc<dyn LlmClient>,
}

impl CotWorker {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait::async_trait]
impl Worker for CotWorker {
    fn name(&self) -> &str {
        "cot"
    }

    fn description(&self) -> String {
        "Solve the problem with step-by-step natural-language reasoning. Good for \
         analysis, explanation, and problems that need no tools."
            .to_string()
    }

    async fn execute(&self, task: &str) -> Result<AgentResponse> {
        let messages = vec![
            Message::system(
                "Think through the problem step by step, then state your final answer on \
                 the last line as `Final answer: ...`.",
            ),
            Message::user(task),
        ];
        let completion = self
            .llm
            .generate(CompletionRequest::from_messages(messages))
            .await?;
        let content = completion.content.unwrap_or_default();
        let answer = content
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix("Final answer:"))
            .map(str::trim)
            .map(String::from)
            .unwrap_or_else(|| content.clone());
        Ok(AgentResponse {
            raw_response: content,
            answer: Value::Str(answer),
            score: 0.8,
            terminated: true,
            truncated: false,
            is_final_answer: true,
            info: serde_json::json!({"worker": "cot"}),
            error: None,
        })
    }
}

/// Plan-then-act: one call to draft a plan, a second to execute it.
pub struct PlanActWorker {
    llm: Arc<dyn LlmClient>,
}

impl PlanActWorker {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait::async_trait]
impl Worker for PlanActWorker {
    fn name(&self) -> &str {
        "plan"
    }

    fn description(&self) -> String {
        "Draft a short plan first, then carry it out. Good for multi-part tasks \
         that benefit from decomposition."
            .to_string()
    }

    async fn execute(&self, task: &str) -> Result<AgentResponse> {
        let plan = self
            .llm
            .generate(CompletionRequest::from_messages(vec![
                Message::system(
                    "Write a short numbered plan (3-6 steps) for solving the task. \
                     Output only the plan.",
                ),
                Message::user(task),
            ]))
            .await?
            .content
            .unwrap_or_default();

        let completion = self
            .llm
            .generate(CompletionRequest::from_messages(vec![
                Message::system(
                    "Execute the given plan step by step and state the final answer on \
                     the last line as `Final answer: ...`.",
                ),
                Message::user(format!("**Task:** {task}\n\n**Plan:**\n{plan}")),
            ]))
            .await?;
        let content = completion.content.unwrap_or_default();
        let answer = content
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix("Final answer:"))
            .map(str::trim)
            .map(String::from)
            .unwrap_or_else(|| content.clone());
        Ok(AgentResponse {
            raw_response: content,
            answer: Value::Str(answer),
            score: 0.8,
            terminated: true,
            truncated: false,
            is_final_answer: true,
            info: serde_json::json!({"worker": "plan", "plan": plan}),
            error: None,
        })
    }
}

/// Native tool-calling: the provider's function-calling protocol, with
/// every call routed through the hook pipeline. Tool responses return to
/// the model as `{role: "tool", tool_call_id, content}` messages with
/// the full `str(result)` content.
pub struct ToolCallingWorker {
    llm: Arc<dyn LlmClient>,
    tools: Vec<Arc<dyn Tool>>,
    hooks: Arc<Hooks>,
    max_iterations: u32,
}

impl ToolCallingWorker {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Vec<Arc<dyn Tool>>, hooks: Hooks) -> Self {
        Self {
            llm,
            tools,
            hooks: Arc::new(hooks),
            max_iterations: 5,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

#[async_trait::async_trait]
impl Worker for ToolCallingWorker {
    fn name(&self) -> &str {
        "tool_calling"
    }

    fn description(&self) -> String {
        "Use the provider's native function-calling protocol. Good when tools map \
         directly onto the task and no intermediate computation is needed."
            .to_string()
    }

    async fn execute(&self, task: &str) -> Result<AgentResponse> {
        let namespace = Arc::new(RwLock::new(ToolNamespace::from_tools(
            self.tools.iter().cloned(),
        )));
        let dispatcher = HookedDispatcher::new(namespace, Arc::clone(&self.hooks));

        let tool_schemas: Vec<Json> = self.tools.iter().map(|t| t.to_openai_format()).collect();
        let mut messages = vec![
            Message::system(
                "Use the available tools to solve the task. When you have the result, \
                 call final_answer with it.",
            ),
            Message::user(task),
        ];

        let mut last_content = String::new();
        for _iteration in 0..self.max_iterations {
            let completion = self
                .llm
                .generate(
                    CompletionRequest::from_messages(messages.clone())
                        .with_tools(tool_schemas.clone()),
                )
                .await?;

            if let Some(content) = &completion.content {
                last_content = content.clone();
            }

            if completion.tool_calls.is_empty() {
                return Ok(AgentResponse {
                    raw_response: last_content.clone(),
                    answer: Value::Str(last_content),
                    score: 0.7,
                    terminated: true,
                    truncated: false,
                    is_final_answer: true,
                    info: serde_json::json!({"worker": "tool_calling"}),
                    error: None,
                });
            }

            messages.push(Message::assistant(last_content.clone()));
            for call in completion.tool_calls {
                if call.name == FINAL_ANSWER_TOOL_NAME {
                    let answer = call
                        .arguments
                        .get("answer")
                        .cloned()
                        .unwrap_or(call.arguments.clone());
                    return Ok(AgentResponse {
                        raw_response: last_content,
                        answer: Value::from_json(&answer),
                        score: 1.0,
                        terminated: true,
                        truncated: false,
                        is_final_answer: true,
                        info: serde_json::json!({"worker": "tool_calling"}),
                        error: None,
                    });
                }

                let result = match dispatcher.lookup(&call.name) {
                    Some(tool) => {
                        dispatcher
                            .dispatch(tool, call.arguments.clone(), call.id.clone())
                            .await
                    }
                    None => Err(Error::tool(format!("Tool '{}' not found", call.name))),
                };
                let content = match result {
                    Ok(value) => value.py_str(),
                    Err(e) => format!("Error: {e}"),
                };
                messages.push(Message::tool(call.id, content).with_name(call.name));
            }
        }

        Ok(AgentResponse {
            raw_response: last_content.clone(),
            answer: Value::Str(last_content),
            score: 0.4,
            terminated: false,
            truncated: true,
            is_final_answer: false,
            info: serde_json::json!({"worker": "tool_calling", "max_iterations_reached": true}),
            error: Some("tool-calling iteration budget exhausted".to_string()),
        })
    }
}

/// The code loop as a worker: builds a fresh [`CodeAgent`] per task.
pub struct CodeWorker {
    llm: Arc<dyn LlmClient>,
    tools: Vec<Arc<dyn Tool>>,
    hooks: Hooks,
    loop_config: LoopConfig,
    eval_config: EvaluatorConfig,
}

impl CodeWorker {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            llm,
            tools,
            hooks: Hooks::new(),
            loop_config: LoopConfig::default(),
            eval_config: EvaluatorConfig::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = config;
        self
    }

    pub fn with_eval_config(mut self, config: EvaluatorConfig) -> Self {
        self.eval_config = config;
        self
    }
}

#[async_trait::async_trait]
impl Worker for CodeWorker {
    fn name(&self) -> &str {
        "code"
    }

    fn description(&self) -> String {
        "Solve the task by writing and executing Python code with tool access \
         (Thought -> Code -> Observation). Good for computation, data wrangling, \
         and multi-step tool orchestration."
            .to_string()
    }

    async fn execute(&self, task: &str) -> Result<AgentResponse> {
        let mut agent = CodeAgent::builder()
            .llm(Arc::clone(&self.llm))
            .tools(self.tools.iter().cloned())
            .hooks(self.hooks.clone())
            .loop_config(self.loop_config.clone())
            .eval_config(self.eval_config.clone())
            .build()?;
        Ok(agent.run(task).await)
    }
}

/// Named worker collection the router selects from.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Vec<Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers
            .iter()
            .find(|w| w.name() == name)
            .map(Arc::clone)
    }

    pub fn workers(&self) -> &[Arc<dyn Worker>] {
        &self.workers
    }

    /// The fallback worker: `cot` when present, else the first
    /// registered.
    pub fn fallback(&self) -> Option<Arc<dyn Worker>> {
        self.get("cot").or_else(|| self.workers.first().map(Arc::clone))
    }
}

/// Structured output the router asks the model for.
#[derive(Debug, Deserialize)]
pub struct RouteDecision {
    pub name: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub recommended_llm: Option<String>,
}

/// LLM-driven worker selection: a one-shot structured-output call over
/// the filtered worker registry.
pub struct Router {
    llm: Arc<dyn LlmClient>,
}

impl Router {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Choose a worker for the input. Router failure or an unknown name
    /// falls back to chain-of-thought.
    pub async fn route(&self, task: &str, registry: &WorkerRegistry) -> Result<Arc<dyn Worker>> {
        let listing: Vec<String> = registry
            .workers()
            .iter()
            .map(|w| format!("- {}: {}", w.name(), w.description()))
            .collect();
        let prompt = format!(
            "You are choosing the best worker strategy for a task.\n\
             The available workers are:\n{}\n\n\
             Task: {task}\n\n\
             Return JSON in this exact format:\n\
             {{\"name\": \"chosen worker name\", \"score\": 0.0, \"recommended_llm\": null}}",
            listing.join("\n")
        );

        let decision = self
            .llm
            .generate(CompletionRequest::from_messages(vec![Message::user(prompt)]))
            .await
            .ok()
            .and_then(|completion| completion.content)
            .and_then(|content| parse_route_decision(&content));

        match decision {
            Some(decision) => match registry.get(&decision.name) {
                Some(worker) => {
                    info!(worker = %decision.name, score = decision.score, "router selected worker");
                    Ok(worker)
                }
                None => {
                    warn!(worker = %decision.name, "router chose unknown worker, falling back");
                    registry
                        .fallback()
                        .ok_or_else(|| Error::config("worker registry is empty"))
                }
            },
            None => {
                warn!("router produced no usable decision, falling back");
                registry
                    .fallback()
                    .ok_or_else(|| Error::config("worker registry is empty"))
            }
        }
    }
}

/// Pull the first JSON object out of the response by brace counting (the
/// model may wrap it in prose) and deserialize it.
fn parse_route_decision(content: &str) -> Option<RouteDecision> {
    let start = content.find('{')?;
    let mut depth = 0usize;
    let mut end = None;
    for (offset, c) in content[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + offset + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    serde_json::from_str(&content[start..end?]).ok()
}

// ----------------------------------------------------------------------
// Ensemble
// ----------------------------------------------------------------------

/// How to reduce multiple workers' answers to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStrategy {
    /// Most common answer; a strict majority wins outright, otherwise
    /// the most common.
    MajorityVote,
    /// Highest-scoring response.
    BestOfN,
    /// Count equivalent answers and take the largest cluster.
    SelfConsistency,
}

impl ResultStrategy {
    pub fn reduce(&self, responses: &[AgentResponse]) -> Option<AgentResponse> {
        if responses.is_empty() {
            return None;
        }
        match self {
            ResultStrategy::BestOfN => responses
                .iter()
                .max_by(|a, b| {
                    a.score
                        .partial_cmp(&b.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .cloned(),
            ResultStrategy::MajorityVote | ResultStrategy::SelfConsistency => {
                let mut counts: HashMap<String, usize> = HashMap::new();
                for response in responses {
                    *counts.entry(canonical_answer(response)).or_default() += 1;
                }
                let majority = responses.len() / 2 + 1;
                let winner = counts
                    .iter()
                    .find(|(_, count)| **count >= majority)
                    .map(|(answer, _)| answer.clone())
                    .or_else(|| {
                        counts
                            .into_iter()
                            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
                            .map(|(answer, _)| answer)
                    })?;
                responses
                    .iter()
                    .find(|r| canonical_answer(r) == winner)
                    .cloned()
            }
        }
    }
}

/// Equivalence key for vote counting.
fn canonical_answer(response: &AgentResponse) -> String {
    response.answer.py_str().trim().to_string()
}

/// Run every worker on the task concurrently and reduce the answers.
pub async fn run_ensemble(
    workers: &[Arc<dyn Worker>],
    task: &str,
    strategy: ResultStrategy,
) -> Result<AgentResponse> {
    let results =
        futures::future::join_all(workers.iter().map(|worker| worker.execute(task))).await;
    let responses: Vec<AgentResponse> = results.into_iter().filter_map(Result::ok).collect();
    strategy
        .reduce(&responses)
        .ok_or_else(|| Error::other("every ensemble worker failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(answer: &str, score: f64) -> AgentResponse {
        AgentResponse {
            raw_response: answer.to_string(),
            answer: Value::Str(answer.to_string()),
            score,
            terminated: true,
            truncated: false,
            is_final_answer: true,
            info: serde_json::json!({}),
            error: None,
        }
    }

    #[test]
    fn test_majority_vote_with_majority() {
        let responses = vec![response("42", 0.5), response("42", 0.6), response("7", 0.9)];
        let winner = ResultStrategy::MajorityVote.reduce(&responses).unwrap();
        assert_eq!(winner.answer_text(), "42");
    }

    #[test]
    fn test_majority_vote_tie_takes_most_common() {
        let responses = vec![
            response("a", 0.1),
            response("a", 0.1),
            response("b", 0.9),
            response("c", 0.9),
        ];
        let winner = ResultStrategy::MajorityVote.reduce(&responses).unwrap();
        assert_eq!(winner.answer_text(), "a");
    }

    #[test]
    fn test_best_of_n() {
        let responses = vec![response("low", 0.2), response("high", 0.95)];
        let winner = ResultStrategy::BestOfN.reduce(&responses).unwrap();
        assert_eq!(winner.answer_text(), "high");
    }

    #[test]
    fn test_self_consistency_counts_equivalent_answers() {
        let responses = vec![
            response("  42 ", 0.2),
            response("42", 0.3),
            response("41", 0.99),
        ];
        let winner = ResultStrategy::SelfConsistency.reduce(&responses).unwrap();
        assert_eq!(winner.answer_text().trim(), "42");
    }

    #[test]
    fn test_reduce_empty_is_none() {
        assert!(ResultStrategy::MajorityVote.reduce(&[]).is_none());
    }

    #[test]
    fn test_parse_route_decision_with_surrounding_prose() {
        let content = r#"I think the best choice is: {"name": "code", "score": 0.9, "recommended_llm": "fast-model"} because it needs tools."#;
        let decision = parse_route_decision(content).unwrap();
        assert_eq!(decision.name, "code");
        assert_eq!(decision.score, 0.9);
        assert_eq!(decision.recommended_llm.as_deref(), Some("fast-model"));
    }

    #[test]
    fn test_parse_route_decision_rejects_garbage() {
        assert!(parse_route_decision("no json here").is_none());
        assert!(parse_route_decision("{broken").is_none());
    }

    #[test]
    fn test_registry_fallback_prefers_cot() {
        struct Named(&'static str);
        #[async_trait::async_trait]
        impl Worker for Named {
            fn name(&self) -> &str {
                self.0
            }
            fn description(&self) -> String {
                String::new()
            }
            async fn execute(&self, _task: &str) -> Result<AgentResponse> {
                Err(Error::other("unused"))
            }
        }

        let registry = WorkerRegistry::new()
            .register(Arc::new(Named("code")))
            .register(Arc::new(Named("cot")));
        assert_eq!(registry.fallback().unwrap().name(), "cot");

        let registry = WorkerRegistry::new().register(Arc::new(Named("code")));
        assert_eq!(registry.fallback().unwrap().name(), "code");
    }
}
