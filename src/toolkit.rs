//! Built-in tools: file access, shell, calculator, and the final-answer
//! sentinel.
//!
//! File tools report recoverable problems (missing file, permission
//! denied) as result strings rather than errors, so the model sees a
//! readable observation and can adjust. `file_read` formats its output
//! with line numbers when it lands in the terminal observation slot.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::EvaluatorConfig;
use crate::interp::Evaluator;
use crate::tools::{Tool, ToolNamespace, FINAL_ANSWER_TOOL_NAME};
use crate::value::Value;
use crate::{Error, Result};

/// Read a file's contents as a string.
///
/// In code flow the result is the raw content; as a terminal observation
/// it gains zero-padded line numbers so the model can reference lines.
pub struct FileReadTool;

#[async_trait::async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> String {
        "Read the contents of a file. Returns file content as a string.".to_string()
    }

    fn inputs(&self) -> Json {
        serde_json::json!({
            "file_path": {"type": "string", "description": "Path to the file to read"},
        })
    }

    fn output_type(&self) -> &str {
        "string"
    }

    fn readonly(&self) -> bool {
        true
    }

    async fn invoke(&self, arguments: Json) -> Result<Value> {
        let path = arguments
            .get("file_path")
            .and_then(Json::as_str)
            .unwrap_or_default();
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Value::Str(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Value::Str(format!("Error: File not found: {path}")))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Ok(Value::Str(format!("Error: Permission denied: {path}")))
            }
            Err(e) => Ok(Value::Str(format!("Error reading file: {e}"))),
        }
    }

    fn format_for_observation(&self, output: &Value) -> Option<String> {
        let Value::Str(content) = output else {
            return None;
        };
        if content.starts_with("Error:") {
            return Some(content.clone());
        }
        Some(number_lines(content))
    }
}

/// Prefix each line with a zero-padded line number and ` | `.
pub fn number_lines(content: &str) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    let width = lines.len().to_string().len();
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{:0width$} | {line}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Write content to a file, creating or overwriting it.
pub struct FileWriteTool;

#[async_trait::async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> String {
        "Write content to a file. Creates the file if it doesn't exist, overwrites if it does."
            .to_string()
    }

    fn inputs(&self) -> Json {
        serde_json::json!({
            "file_path": {"type": "string", "description": "Path to the file to write"},
            "content": {"type": "string", "description": "Content to write to the file"},
        })
    }

    fn output_type(&self) -> &str {
        "string"
    }

    async fn invoke(&self, arguments: Json) -> Result<Value> {
        let path = arguments
            .get("file_path")
            .and_then(Json::as_str)
            .unwrap_or_default();
        let content = arguments
            .get("content")
            .and_then(Json::as_str)
            .unwrap_or_default();
        match tokio::fs::write(path, content).await {
            Ok(()) => Ok(Value::Str(format!(
                "Successfully wrote {} characters to {path}",
                content.chars().count()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Ok(Value::Str(format!("Error: Permission denied: {path}")))
            }
            Err(e) => Ok(Value::Str(format!("Error writing file: {e}"))),
        }
    }
}

/// Append content to the end of a file.
pub struct FileAppendTool;

#[async_trait::async_trait]
impl Tool for FileAppendTool {
    fn name(&self) -> &str {
        "file_append"
    }

    fn description(&self) -> String {
        "Append content to the end of a file. Creates the file if it doesn't exist.".to_string()
    }

    fn inputs(&self) -> Json {
        serde_json::json!({
            "file_path": {"type": "string", "description": "Path to the file to append to"},
            "content": {"type": "string", "description": "Content to append to the file"},
        })
    }

    fn output_type(&self) -> &str {
        "string"
    }

    async fn invoke(&self, arguments: Json) -> Result<Value> {
        let path = arguments
            .get("file_path")
            .and_then(Json::as_str)
            .unwrap_or_default();
        let content = arguments
            .get("content")
            .and_then(Json::as_str)
            .unwrap_or_default();
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, content.as_bytes()).await
        }
        .await;
        match result {
            Ok(()) => Ok(Value::Str(format!(
                "Successfully appended {} characters to {path}",
                content.chars().count()
            ))),
            Err(e) => Ok(Value::Str(format!("Error appending to file: {e}"))),
        }
    }
}

/// Run a shell command, capturing stdout and stderr.
pub struct BashTool {
    timeout: Duration,
}

impl BashTool {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> String {
        "Execute a shell command and return its stdout and stderr.".to_string()
    }

    fn inputs(&self) -> Json {
        serde_json::json!({
            "command": {"type": "string", "description": "Shell command to execute"},
        })
    }

    fn output_type(&self) -> &str {
        "string"
    }

    fn is_async(&self) -> bool {
        true
    }

    async fn invoke(&self, arguments: Json) -> Result<Value> {
        let command = arguments
            .get("command")
            .and_then(Json::as_str)
            .unwrap_or_default();
        if command.is_empty() {
            return Err(Error::invalid_input("command must not be empty"));
        }
        debug!(command, "bash tool call");

        let mut child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Error::tool(format!("failed to spawn shell: {e}")))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let waited = tokio::time::timeout(self.timeout, async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                pipe.read_to_string(&mut stdout).await.ok();
            }
            if let Some(pipe) = stderr_pipe.as_mut() {
                pipe.read_to_string(&mut stderr).await.ok();
            }
            let status = child.wait().await;
            (stdout, stderr, status)
        })
        .await;

        match waited {
            Err(_) => Err(Error::Timeout),
            Ok((stdout, stderr, status)) => {
                let status = status.map_err(|e| Error::tool(e.to_string()))?;
                let mut output = stdout;
                if !stderr.is_empty() {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&stderr);
                }
                if !status.success() {
                    output.push_str(&format!(
                        "\n[exit status: {}]",
                        status.code().unwrap_or(-1)
                    ));
                }
                Ok(Value::Str(output))
            }
        }
    }
}

/// Evaluate an arithmetic expression using the crate's own sandboxed
/// interpreter (no tools, tight operation budget).
pub struct CalculatorTool;

#[async_trait::async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> String {
        "Evaluate a Python-style arithmetic expression, e.g. '15*8+27' or 'sqrt(2)**2'."
            .to_string()
    }

    fn inputs(&self) -> Json {
        serde_json::json!({
            "expression": {"type": "string", "description": "Arithmetic expression to evaluate"},
        })
    }

    fn output_type(&self) -> &str {
        "number"
    }

    fn readonly(&self) -> bool {
        true
    }

    async fn invoke(&self, arguments: Json) -> Result<Value> {
        let expression = arguments
            .get("expression")
            .and_then(Json::as_str)
            .unwrap_or_default();
        let config = EvaluatorConfig::default().with_max_operations(100_000);
        let evaluator = Evaluator::new(config, Arc::new(ToolNamespace::new()));
        // `sqrt` and friends resolve through the math module.
        let code = format!("from math import sqrt, floor, ceil, log, exp\n{expression}\n");
        let execution = evaluator
            .run(&code)
            .await
            .map_err(|e| Error::tool(format!("calculator failed: {e}")))?;
        if let Some(exception) = execution.error() {
            return Err(Error::tool(format!("calculator failed: {exception}")));
        }
        Ok(execution.value)
    }
}

/// The `final_answer` sentinel. The evaluator intercepts calls before
/// dispatch; this implementation exists so the tool is listed in prompts
/// and callable through the native tool-calling worker, where it simply
/// echoes its argument.
pub struct FinalAnswerTool;

#[async_trait::async_trait]
impl Tool for FinalAnswerTool {
    fn name(&self) -> &str {
        FINAL_ANSWER_TOOL_NAME
    }

    fn description(&self) -> String {
        "Provide the final answer to the task. Calling this ends the reasoning loop."
            .to_string()
    }

    fn inputs(&self) -> Json {
        serde_json::json!({
            "answer": {"type": "string", "description": "The final answer"},
        })
    }

    fn readonly(&self) -> bool {
        true
    }

    async fn invoke(&self, arguments: Json) -> Result<Value> {
        let answer = arguments.get("answer").cloned().unwrap_or(Json::Null);
        Ok(Value::from_json(&answer))
    }
}

/// The default toolset most agents start from.
pub fn default_toolkit() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(FileReadTool),
        Arc::new(FileWriteTool),
        Arc::new(FileAppendTool),
        Arc::new(BashTool::new()),
        Arc::new(CalculatorTool),
        Arc::new(FinalAnswerTool),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[tokio::test]
    async fn test_file_read_with_line_numbers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "alpha\nbeta\ngamma").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let tool = FileReadTool;
        let output = tool.invoke(json!({"file_path": path})).await.unwrap();
        assert_eq!(output, Value::Str("alpha\nbeta\ngamma".to_string()));

        let formatted = tool.format_for_observation(&output).unwrap();
        assert_eq!(formatted, "1 | alpha\n2 | beta\n3 | gamma");
    }

    #[tokio::test]
    async fn test_file_read_missing_file() {
        let tool = FileReadTool;
        let output = tool
            .invoke(json!({"file_path": "/no/such/file.txt"}))
            .await
            .unwrap();
        assert!(output.py_str().starts_with("Error: File not found"));
        // Error strings pass through observation formatting unchanged.
        assert_eq!(tool.format_for_observation(&output).unwrap(), output.py_str());
    }

    #[test]
    fn test_number_lines_padding() {
        let content = (1..=12).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let numbered = number_lines(&content);
        assert!(numbered.starts_with("01 | line1"));
        assert!(numbered.ends_with("12 | line12"));
    }

    #[tokio::test]
    async fn test_file_write_and_append_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let path_str = path.to_str().unwrap();

        let result = FileWriteTool
            .invoke(json!({"file_path": path_str, "content": "hello"}))
            .await
            .unwrap();
        assert!(result.py_str().starts_with("Successfully wrote 5"));

        FileAppendTool
            .invoke(json!({"file_path": path_str, "content": " world"}))
            .await
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "hello world");
    }

    #[tokio::test]
    async fn test_bash_captures_output() {
        let tool = BashTool::new();
        let output = tool.invoke(json!({"command": "echo hi"})).await.unwrap();
        assert_eq!(output.py_str().trim(), "hi");
    }

    #[tokio::test]
    async fn test_bash_reports_exit_status() {
        let tool = BashTool::new();
        let output = tool.invoke(json!({"command": "exit 3"})).await.unwrap();
        assert!(output.py_str().contains("[exit status: 3]"));
    }

    #[tokio::test]
    async fn test_calculator() {
        let tool = CalculatorTool;
        let output = tool
            .invoke(json!({"expression": "15*8+27"}))
            .await
            .unwrap();
        assert_eq!(output, Value::Int(147));

        let output = tool
            .invoke(json!({"expression": "sqrt(16) + 1"}))
            .await
            .unwrap();
        assert_eq!(output, Value::Float(5.0));
    }

    #[tokio::test]
    async fn test_calculator_rejects_bad_expression() {
        let tool = CalculatorTool;
        assert!(tool.invoke(json!({"expression": "1 +* 2"})).await.is_err());
    }

    #[tokio::test]
    async fn test_final_answer_echoes() {
        let tool = FinalAnswerTool;
        let output = tool.invoke(json!({"answer": "42"})).await.unwrap();
        assert_eq!(output, Value::Str("42".to_string()));
    }
}
