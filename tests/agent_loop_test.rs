//! Reasoning-loop integration tests against a scripted provider,
//! including the canonical end-to-end scenarios: simple math, file-read
//! observation formatting, permission-denied bash, tool-error recovery,
//! budget exhaustion, and unauthorized imports.

mod common;

use std::io::Write;
use std::sync::Arc;

use code_agent::hooks::{Hooks, PreToolUseResult};
use code_agent::toolkit::{BashTool, CalculatorTool, FileReadTool};
use code_agent::tools::{tool, Tool};
use code_agent::{ChunkType, CodeAgent, EventSink, LoopConfig, Value};
use common::{turn, MockLlm};
use serde_json::json;

fn agent_with(llm: MockLlm, tools: Vec<Arc<dyn Tool>>) -> CodeAgent {
    CodeAgent::builder()
        .llm(Arc::new(llm))
        .tools(tools)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_simple_math_scenario() {
    let llm = MockLlm::new(vec![&turn(
        "I will compute the expression with the calculator, then answer.",
        "result = await calculator(expression=\"15*8+27\")\nfinal_answer(result)",
    )]);
    let mut agent = agent_with(llm, vec![Arc::new(CalculatorTool)]);

    let response = agent.run("Compute 15*8+27.").await;

    assert!(response.is_final_answer);
    assert!(response.terminated);
    assert_eq!(response.answer, Value::Int(147));
    // Exactly one tool call logged for the step.
    let step = agent.steps().last().unwrap();
    assert_eq!(step.tool_calls.len(), 1);
    assert_eq!(step.tool_calls[0].tool_name, "calculator");
}

#[tokio::test]
async fn test_file_read_observation_formatting_scenario() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "alpha\nbeta\ngamma").unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let read_code = format!("file_read(file_path='{path}')");
    let llm = MockLlm::new(vec![
        &turn("Read the file first.", &read_code),
        &turn(
            "The file has three lines: alpha, beta, gamma.",
            "final_answer(answer='The file contains alpha, beta and gamma.')",
        ),
    ]);
    let mut agent = agent_with(llm, vec![Arc::new(FileReadTool)]);

    let (sink, mut events) = EventSink::channel();
    let response = agent
        .run_with_events("Show lines 1-3 of the file", &sink)
        .await;
    drop(sink);

    assert!(response.is_final_answer);

    // The observation shown to the model carries line numbers.
    let mut saw_formatted_observation = false;
    while let Ok(chunk) = events.try_recv() {
        if chunk.chunk_type == ChunkType::Observation
            && chunk.content.contains("Output: 1 | alpha\n2 | beta\n3 | gamma")
        {
            saw_formatted_observation = true;
        }
    }
    assert!(saw_formatted_observation, "expected line-numbered observation");
}

#[tokio::test]
async fn test_permission_denied_bash_scenario() {
    let hooks = Hooks::new().add_pre_tool_use("bash", |event| async move {
        let command = event.tool_input["command"].as_str().unwrap_or("");
        if command.starts_with("rm -rf") {
            return Ok(PreToolUseResult::deny("rm -rf commands are blocked"));
        }
        Ok(PreToolUseResult::accept())
    });

    let llm = MockLlm::new(vec![
        &turn(
            "Clean the directory with rm.",
            "out = await bash(command='rm -rf /tmp/foo')\nprint(out)",
        ),
        &turn(
            "That was blocked; I will report the denial instead.",
            "final_answer(answer='Cannot delete: rm -rf is blocked by policy.')",
        ),
    ]);
    let mut agent = CodeAgent::builder()
        .llm(Arc::new(llm))
        .tool(Arc::new(BashTool::new()))
        .hooks(hooks)
        .build()
        .unwrap();

    let response = agent.run("Clean up /tmp/foo").await;

    assert!(response.is_final_answer);
    // The tool never ran; the denial reason reached the model as an
    // observation and the loop proceeded.
    let denied_calls: Vec<_> = agent
        .steps()
        .iter()
        .flat_map(|s| s.tool_calls.iter())
        .filter(|c| c.denied)
        .collect();
    assert_eq!(denied_calls.len(), 1);
    assert!(denied_calls[0]
        .error
        .as_deref()
        .unwrap()
        .contains("rm -rf commands are blocked"));
    assert!(response.answer_text().contains("blocked"));
}

#[tokio::test]
async fn test_tool_error_recovery_scenario() {
    let search: Arc<dyn Tool> = Arc::new(
        tool("search", "Search the index")
            .param("query", "string")
            .build(|args| async move {
                let query = args["query"].as_str().unwrap_or("");
                if query.len() > 1000 {
                    return Err(code_agent::Error::tool("query length exceeds 1000"));
                }
                Ok(json!([{"title": "Result", "score": 0.9, "url": "example.org"}]))
            }),
    );

    let long_query = "x".repeat(1200);
    let llm = MockLlm::new(vec![
        &turn(
            "Search with the full text.",
            &format!("results = search(query='{long_query}')\nprint(results)"),
        ),
        &turn(
            "The query was too long; shorten it.",
            "results = search(query='short query')\nfinal_answer(results)",
        ),
    ]);
    let mut agent = agent_with(llm, vec![search]);

    let response = agent.run("Find documents about x").await;

    assert!(response.is_final_answer);
    assert!(response.terminated);
    // Terminated before the iteration budget.
    assert!(agent.steps().len() < 5);
}

#[tokio::test]
async fn test_budget_exhaustion_scenario() {
    // Every turn produces valid code but never a final answer.
    let llm = MockLlm::new(vec![
        &turn("Step one.", "x = 1\nprint(x)\nx"),
        &turn("Step two.", "y = 2\nprint(y)\ny"),
    ]);
    let mut agent = CodeAgent::builder()
        .llm(Arc::new(llm))
        .loop_config(LoopConfig::default().with_max_iterations(2))
        .build()
        .unwrap();

    let (sink, mut events) = EventSink::channel();
    let response = agent.run_with_events("Keep going forever", &sink).await;
    drop(sink);

    assert!(!response.terminated);
    assert!(response.truncated);
    assert!(!response.is_final_answer);
    assert!(!response.answer_text().is_empty());

    // No final-answer chunk was emitted on the event bus.
    let mut chunk_types = Vec::new();
    while let Ok(chunk) = events.try_recv() {
        chunk_types.push(chunk.chunk_type);
    }
    assert!(!chunk_types.contains(&ChunkType::FinalAnswer));
    assert!(chunk_types.contains(&ChunkType::Completion));
}

#[tokio::test]
async fn test_unauthorized_import_scenario() {
    let llm = MockLlm::new(vec![
        &turn(
            "Use subprocess to run the command.",
            "import subprocess\nsubprocess.run(['ls'])",
        ),
        &turn(
            "Imports of subprocess are not allowed; use plain code.",
            "final_answer(answer='done without subprocess')",
        ),
    ]);
    let mut agent = agent_with(llm, vec![]);

    let response = agent.run("List the directory").await;

    assert!(response.is_final_answer);
    // The second request's attempts carry the naming of the module.
    let step = &agent.steps()[0];
    assert!(step.error.as_deref().unwrap().contains("subprocess"));
}

#[tokio::test]
async fn test_no_code_response_is_final() {
    let llm = MockLlm::new(vec!["The capital of France is Paris."]);
    let mut agent = agent_with(llm, vec![]);

    let response = agent.run("What is the capital of France?").await;

    assert!(response.terminated);
    assert!(response.is_final_answer);
    assert!(response.answer_text().contains("Paris"));
    assert_eq!(response.info["no_code_found"], true);
}

#[tokio::test]
async fn test_final_answer_heuristic_on_output() {
    let llm = MockLlm::new(vec![&turn(
        "Print the conclusion.",
        "print('The answer is: 99')",
    )]);
    let mut agent = agent_with(llm, vec![]);

    let response = agent.run("What is 99?").await;
    assert!(response.is_final_answer);
    assert_eq!(response.info["final_answer_heuristic"], true);
}

#[tokio::test]
async fn test_heuristic_can_be_disabled() {
    let llm = MockLlm::new(vec![
        &turn("Print the conclusion.", "print('The answer is: 99')"),
        &turn("Now finish.", "final_answer(99)"),
    ]);
    let mut agent = CodeAgent::builder()
        .llm(Arc::new(llm))
        .loop_config(LoopConfig::default().with_final_answer_heuristic(false))
        .build()
        .unwrap();

    let response = agent.run("What is 99?").await;
    assert_eq!(response.answer, Value::Int(99));
    assert_eq!(agent.steps().len(), 2);
}

#[tokio::test]
async fn test_parse_error_is_fed_back() {
    let llm = MockLlm::new(vec![
        &turn("Broken code.", "x = = 1"),
        &turn("Fix the syntax.", "x = 1\nfinal_answer(x)"),
    ]);
    let mut agent = agent_with(llm, vec![]);

    let response = agent.run("Set x to 1").await;
    assert!(response.is_final_answer);
    assert_eq!(response.answer, Value::Int(1));

    // The retry consumed a second turn, and the first step recorded the
    // parse error that was fed back to the model.
    assert_eq!(agent.steps().len(), 2);
    assert!(agent.steps()[0].error.as_deref().unwrap().contains("Parse error"));
}

#[tokio::test]
async fn test_history_consolidation_across_tasks() {
    let llm = MockLlm::new(vec![
        &turn("Answer directly.", "final_answer(answer='first done')"),
        &turn("Second task.", "final_answer(answer='second done')"),
    ]);
    let mut agent = agent_with(llm, vec![]);

    assert_eq!(agent.history().len(), 0);
    agent.run("task one").await;
    assert_eq!(agent.history().len(), 2);
    agent.run("task two").await;
    assert_eq!(agent.history().len(), 4);

    let messages = agent.history().to_list();
    assert_eq!(messages[0].content.as_text(), "task one");
}

#[tokio::test]
async fn test_streaming_emits_thinking_then_code_then_completion() {
    let llm = MockLlm::new(vec![&turn("Compute.", "final_answer(1 + 1)")]);
    let mut agent = agent_with(llm, vec![]);

    let (sink, mut events) = EventSink::channel();
    let response = agent.run_with_events("add one and one", &sink).await;
    drop(sink);

    assert_eq!(response.answer, Value::Int(2));

    let mut chunk_types = Vec::new();
    while let Ok(chunk) = events.try_recv() {
        if chunk.chunk_type == ChunkType::Thinking {
            assert!(chunk.partial);
        }
        chunk_types.push(chunk.chunk_type);
    }
    let position = |t: ChunkType| chunk_types.iter().position(|c| *c == t);
    assert!(position(ChunkType::StepStart) < position(ChunkType::CodeStart));
    assert!(position(ChunkType::CodeStart) < position(ChunkType::FinalAnswer));
    assert!(position(ChunkType::FinalAnswer) < position(ChunkType::Completion));
    assert!(chunk_types.contains(&ChunkType::Thinking));
}

// Multi-threaded runtime: the evaluator's spin loop must not starve the
// canceller task.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancellation_truncates_step() {
    let llm = MockLlm::new(vec![&turn("Loop forever.", "while True:\n    pass")]);
    // Effectively unlimited operation budget so cancellation is the only
    // way out of the spin loop.
    let mut agent = CodeAgent::builder()
        .llm(Arc::new(llm))
        .eval_config(code_agent::EvaluatorConfig::default().with_max_operations(u64::MAX))
        .build()
        .unwrap();

    let flag = agent.cancellation_flag();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        flag.store(true, std::sync::atomic::Ordering::Relaxed);
    });

    let response = agent.run("spin").await;
    canceller.await.unwrap();

    assert!(response.truncated);
    assert!(!response.terminated);
    assert!(!response.is_final_answer);
    assert!(response.error.is_some());
}
