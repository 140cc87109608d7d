//! Observation formatting: how tool results and print logs become the
//! text block fed back to the model after each code block.
//!
//! Layout:
//!
//! ```text
//! Logs:
//! <print output, if any>
//! Output: <terminal value, via the originating tool's formatter>
//! ```
//!
//! A global size guard truncates oversize observations on a UTF-8
//! boundary (scanning backward at most four bytes to the previous code
//! point) and appends a tool-specific hint for getting less output next
//! time. Remote (HTTP/MCP) tool output is separately guarded by an
//! estimated-token limit and rejected outright rather than truncated.

use crate::value::Value;
use crate::{Error, Result};

/// Default observation size guard: 400 KiB.
pub const MAX_OBSERVATION_BYTES: usize = 400 * 1024;

/// Estimated-token ceiling for remote tool output (1 token ≈ 4 chars).
pub const MAX_REMOTE_TOKENS: usize = 100_000;

/// Assemble observation parts from print logs and an optional formatted
/// output line. A null terminal value yields logs only - no `Output:`
/// line.
pub fn render(logs: &str, output: Option<&str>) -> String {
    let mut parts = Vec::new();
    if !logs.is_empty() {
        parts.push(format!("Logs:\n{logs}"));
    }
    if let Some(output) = output {
        parts.push(format!("Output: {output}"));
    }
    parts.join("\n")
}

/// Format a terminal value through its originating tool's
/// `format_for_observation`, falling back to stringification. `None`
/// (the value was null) means no output line at all.
pub fn format_output(value: &Value, tool: Option<&dyn crate::tools::Tool>) -> Option<String> {
    if matches!(value, Value::Null) {
        return None;
    }
    if let Some(tool) = tool {
        if let Some(formatted) = tool.format_for_observation(value) {
            return Some(formatted);
        }
    }
    Some(value.py_str())
}

/// Apply the observation size guard. Truncation lands on a UTF-8
/// boundary; the appended notice carries a tool-specific hint.
pub fn truncate_output(output: &str, max_bytes: usize, tool_name: &str) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }

    // Back up to the previous code-point boundary (at most 3 bytes for
    // any UTF-8 sequence).
    let mut cut = max_bytes;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }

    let shown_kb = cut / 1024;
    let total_kb = output.len() / 1024;
    format!(
        "{}\n\n---\nOutput truncated (showing {shown_kb}KB / {total_kb}KB)\n{}",
        &output[..cut],
        tool_hint(tool_name)
    )
}

/// Per-tool hint for obtaining less output on the next attempt.
fn tool_hint(tool_name: &str) -> &'static str {
    match tool_name {
        "bash" => "Hint: Use `| head -n N` or `| tail -n N` to limit output lines",
        "grep" => "Hint: Use a head limit, or a more precise search pattern",
        "glob" => "Hint: Use a more specific pattern to narrow matches",
        "ls" => "Hint: Avoid recursive mode, or specify a more specific subdirectory",
        "file_read" => "Hint: Use `offset` and `limit` parameters for paginated read",
        "python" => "Hint: Control print output in your code",
        _ => "Hint: Use pagination or a more specific pattern to narrow output",
    }
}

/// Guard remote tool output against flooding the context. Unlike the
/// observation guard this rejects rather than truncates, so the model
/// sees an actionable error.
pub fn check_remote_output(output: &str) -> Result<()> {
    let estimated_tokens = output.len() / 4;
    if estimated_tokens > MAX_REMOTE_TOKENS {
        return Err(Error::tool(format!(
            "remote tool output too large (approx {estimated_tokens} tokens > {MAX_REMOTE_TOKENS} limit)"
        )));
    }
    Ok(())
}

/// Render search results (a list of `{title, score, url}` maps) as a
/// ranked listing with visual score bars:
///
/// ```text
/// 1. Introduction to Rust
///    [█████████ ] 95%
///    URL: rust-lang.org
/// ```
pub fn format_search_results(results: &Value) -> String {
    let json = results.to_json();
    let Some(items) = json.as_array() else {
        return results.py_str();
    };

    let mut out = format!("Found {} results:\n\n", items.len());
    for (rank, item) in items.iter().enumerate() {
        let title = item
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown");
        let score = item.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let url = item.get("url").and_then(|v| v.as_str()).unwrap_or("");
        let bar = "█".repeat((score.clamp(0.0, 1.0) * 10.0) as usize);
        out.push_str(&format!(
            "{}. {title}\n   [{bar:<10}] {:.0}%\n   URL: {url}\n\n",
            rank + 1,
            score * 100.0,
        ));
    }
    out.trim_end().to_string()
}

/// Identity formatter for values that are already model-legible strings.
/// Idempotent: applying it to its own output changes nothing.
pub fn format_raw(output: &Value) -> String {
    output.py_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_logs_and_output() {
        let observation = render("hello\n", Some("42"));
        assert_eq!(observation, "Logs:\nhello\n\nOutput: 42");
    }

    #[test]
    fn test_render_logs_only_for_null_value() {
        let output = format_output(&Value::Null, None);
        assert!(output.is_none());
        let observation = render("computed\n", output.as_deref());
        assert_eq!(observation, "Logs:\ncomputed\n");
        assert!(!observation.contains("Output:"));
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render("", None), "");
    }

    #[test]
    fn test_truncate_under_limit_is_identity() {
        let text = "short output";
        assert_eq!(truncate_output(text, 1024, "bash"), text);
    }

    #[test]
    fn test_truncate_appends_tool_hint() {
        let text = "x".repeat(2048);
        let truncated = truncate_output(&text, 1024, "bash");
        assert!(truncated.contains("Output truncated"));
        assert!(truncated.contains("head -n"));
        assert!(truncated.starts_with(&"x".repeat(1024)));
    }

    #[test]
    fn test_truncate_respects_utf8_boundary() {
        // '€' is three bytes; force the cut into the middle of one.
        let text = "€".repeat(500);
        let truncated = truncate_output(&text, 1000, "file_read");
        // 1000 is not a multiple of 3, so the cut backs up to 999.
        assert!(truncated.starts_with(&"€".repeat(333)));
        assert!(!truncated.starts_with(&"€".repeat(334)));
    }

    #[test]
    fn test_remote_output_guard() {
        assert!(check_remote_output("small").is_ok());
        let big = "a".repeat(MAX_REMOTE_TOKENS * 4 + 8);
        assert!(check_remote_output(&big).is_err());
    }

    #[test]
    fn test_format_search_results() {
        let results = Value::from_json(&serde_json::json!([
            {"title": "Introduction to Rust", "score": 0.95, "url": "rust-lang.org"},
            {"title": "Advanced Rust", "score": 0.5, "url": "docs.rust-lang.org"},
        ]));
        let formatted = format_search_results(&results);
        assert!(formatted.starts_with("Found 2 results:"));
        assert!(formatted.contains("1. Introduction to Rust"));
        assert!(formatted.contains("95%"));
        assert!(formatted.contains("URL: rust-lang.org"));
        assert!(formatted.contains("2. Advanced Rust"));
    }

    #[test]
    fn test_format_raw_is_idempotent() {
        let value = Value::Str("already formatted".to_string());
        let once = format_raw(&value);
        let twice = format_raw(&Value::Str(once.clone()));
        assert_eq!(once, twice);
    }
}
