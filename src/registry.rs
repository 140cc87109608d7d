//! Tool registry with deferred loading and on-demand discovery.
//!
//! Large tool libraries do not serialize every schema into the prompt.
//! Instead the registry stores lightweight metadata, a search tool lets
//! the model discover what exists, and a load tool materializes a tool
//! into the agent's active namespace only when it is actually needed.
//!
//! Search strategies:
//! - **keyword** - token match scoring, 2× for name hits, 1× for
//!   description hits. Always available, fastest.
//! - **regex** - compiled pattern (falling back to a literal match on
//!   compile error), same 2/1 weighting.
//! - **bm25** - Okapi BM25 over name+description; empty corpora fall
//!   back to keyword scoring.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::Serialize;
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::tools::{sanitize_tool_name, Tool, ToolNamespace};
use crate::value::Value;
use crate::Result;

/// Lightweight tool metadata for search indexing. Only this - never the
/// full schema - is what search results return to the model.
#[derive(Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    /// Parameter names (from the schema's properties).
    pub parameters: Vec<String>,
    pub category: String,
    /// Deferred tools are searchable but not in the active namespace
    /// until loaded.
    pub defer_loading: bool,
    instance: Option<Arc<dyn Tool>>,
}

impl ToolInfo {
    fn from_tool(tool: Arc<dyn Tool>, defer_loading: bool, category: String) -> Self {
        let parameters = tool
            .inputs()
            .get("properties")
            .and_then(Json::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_else(|| {
                tool.inputs()
                    .as_object()
                    .map(|obj| obj.keys().cloned().collect())
                    .unwrap_or_default()
            });
        Self {
            name: tool.name().to_string(),
            description: tool.description(),
            parameters,
            category,
            defer_loading,
            instance: Some(tool),
        }
    }
}

/// Compact representation returned by tool search.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub parameters: Vec<String>,
    pub category: String,
}

impl ToolInfo {
    fn to_summary(&self, max_desc_length: usize) -> ToolSummary {
        let description = if self.description.len() > max_desc_length {
            let mut cut = max_desc_length;
            while cut > 0 && !self.description.is_char_boundary(cut) {
                cut -= 1;
            }
            self.description[..cut].to_string()
        } else {
            self.description.clone()
        };
        ToolSummary {
            name: self.name.clone(),
            description,
            parameters: self.parameters.clone(),
            category: self.category.clone(),
        }
    }
}

/// Search strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchStrategy {
    #[default]
    Keyword,
    Regex,
    Bm25,
}

impl SearchStrategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "regex" => SearchStrategy::Regex,
            "bm25" => SearchStrategy::Bm25,
            "keyword" => SearchStrategy::Keyword,
            other => {
                warn!(strategy = other, "unknown search strategy, using keyword");
                SearchStrategy::Keyword
            }
        }
    }
}

type ToolFactory = Box<dyn Fn() -> Arc<dyn Tool> + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    tools: HashMap<String, ToolInfo>,
    loaded: HashMap<String, Arc<dyn Tool>>,
    factories: HashMap<String, ToolFactory>,
}

/// Central tool store. Registration and loading are serialized behind a
/// mutex; reads during a step clone cheap Arcs out.
#[derive(Default)]
pub struct ToolRegistry {
    inner: Mutex<RegistryInner>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Deferred tools (the default) are searchable but
    /// must be loaded before use; pass `defer_loading = false` to make
    /// the instance immediately available.
    pub fn register(&self, tool: Arc<dyn Tool>, defer_loading: bool, category: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let name = tool.name().to_string();
        if !defer_loading {
            inner.loaded.insert(name.clone(), Arc::clone(&tool));
        }
        inner
            .tools
            .insert(name, ToolInfo::from_tool(tool, defer_loading, category.into()));
    }

    pub fn register_many(
        &self,
        tools: impl IntoIterator<Item = Arc<dyn Tool>>,
        defer_loading: bool,
        category: impl Into<String>,
    ) {
        let category = category.into();
        for tool in tools {
            self.register(tool, defer_loading, category.clone());
        }
    }

    /// Register a factory for a tool that is expensive to instantiate;
    /// the instance materializes on first load.
    pub fn register_factory(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<String>,
        category: impl Into<String>,
        factory: impl Fn() -> Arc<dyn Tool> + Send + Sync + 'static,
    ) {
        let name = name.into();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.factories.insert(name.clone(), Box::new(factory));
        inner.tools.insert(
            name.clone(),
            ToolInfo {
                name,
                description: description.into(),
                parameters,
                category: category.into(),
                defer_loading: true,
                instance: None,
            },
        );
    }

    /// Load a deferred tool into active use, materializing from a
    /// factory if needed. Returns `None` when the name is unknown.
    pub fn load_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(tool) = inner.loaded.get(name) {
            return Some(Arc::clone(tool));
        }
        if !inner.tools.contains_key(name) {
            warn!(tool = name, "tool not found in registry");
            return None;
        }
        if let Some(instance) = inner.tools.get(name).and_then(|info| info.instance.clone()) {
            inner.loaded.insert(name.to_string(), Arc::clone(&instance));
            return Some(instance);
        }
        if let Some(factory) = inner.factories.get(name) {
            let tool = factory();
            inner.loaded.insert(name.to_string(), Arc::clone(&tool));
            if let Some(info) = inner.tools.get_mut(name) {
                info.instance = Some(Arc::clone(&tool));
            }
            debug!(tool = name, "tool loaded via factory");
            return Some(tool);
        }
        warn!(tool = name, "cannot load tool: no instance or factory");
        None
    }

    pub fn loaded_tools(&self) -> Vec<Arc<dyn Tool>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.loaded.values().cloned().collect()
    }

    pub fn all_tool_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = inner.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn categories(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut categories: Vec<String> = inner
            .tools
            .values()
            .filter(|t| !t.category.is_empty())
            .map(|t| t.category.clone())
            .collect();
        categories.sort();
        categories.dedup();
        categories
    }

    /// Registry statistics (registered/loaded/deferred counts).
    pub fn stats(&self) -> Json {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let deferred = inner
            .tools
            .values()
            .filter(|t| t.defer_loading && !inner.loaded.contains_key(&t.name))
            .count();
        serde_json::json!({
            "total_registered": inner.tools.len(),
            "total_loaded": inner.loaded.len(),
            "deferred_count": deferred,
        })
    }

    /// Search the registry; results are compact summaries, never full
    /// schemas.
    pub fn search(
        &self,
        query: &str,
        strategy: SearchStrategy,
        top_k: usize,
        category: &str,
    ) -> Vec<ToolSummary> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let candidates: Vec<&ToolInfo> = inner
            .tools
            .values()
            .filter(|t| category.is_empty() || t.category == category)
            .collect();

        let ranked = match strategy {
            SearchStrategy::Keyword => keyword_search(query, &candidates),
            SearchStrategy::Regex => regex_search(query, &candidates),
            SearchStrategy::Bm25 => bm25_search(query, &candidates),
        };

        ranked
            .into_iter()
            .take(top_k)
            .map(|info| info.to_summary(200))
            .collect()
    }
}

fn keyword_search<'a>(query: &str, tools: &[&'a ToolInfo]) -> Vec<&'a ToolInfo> {
    let keywords: Vec<String> = query.to_lowercase().split_whitespace().map(String::from).collect();
    if keywords.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(i64, &ToolInfo)> = Vec::new();
    for tool in tools {
        let name_lower = tool.name.to_lowercase();
        let desc_lower = tool.description.to_lowercase();
        let mut score = 0i64;
        for keyword in &keywords {
            if name_lower.contains(keyword.as_str()) {
                score += 2;
            }
            if desc_lower.contains(keyword.as_str()) {
                score += 1;
            }
        }
        if score > 0 {
            scored.push((score, tool));
        }
    }
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
    scored.into_iter().map(|(_, t)| t).collect()
}

fn regex_search<'a>(query: &str, tools: &[&'a ToolInfo]) -> Vec<&'a ToolInfo> {
    let pattern = regex::RegexBuilder::new(query)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|e| {
            warn!(pattern = query, error = %e, "invalid regex, falling back to literal");
            regex::RegexBuilder::new(&regex::escape(query))
                .case_insensitive(true)
                .build()
                .expect("escaped pattern always compiles")
        });

    let mut scored: Vec<(i64, &ToolInfo)> = Vec::new();
    for tool in tools {
        let name_match = pattern.is_match(&tool.name);
        let desc_match = pattern.is_match(&tool.description);
        if name_match || desc_match {
            let score = if name_match { 2 } else { 0 } + if desc_match { 1 } else { 0 };
            scored.push((score, tool));
        }
    }
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
    scored.into_iter().map(|(_, t)| t).collect()
}

fn tokenize(text: &str) -> Vec<String> {
    let word = regex::Regex::new(r"\w+").expect("static pattern");
    word.find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Self-contained Okapi BM25 over name+description documents.
fn bm25_search<'a>(query: &str, tools: &[&'a ToolInfo]) -> Vec<&'a ToolInfo> {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() || tools.is_empty() {
        return keyword_search(query, tools);
    }

    const K1: f64 = 1.5;
    const B: f64 = 0.75;

    let docs: Vec<Vec<String>> = tools
        .iter()
        .map(|t| tokenize(&format!("{} {}", t.name, t.description)))
        .collect();
    let n = docs.len() as f64;
    let avg_len = docs.iter().map(Vec::len).sum::<usize>() as f64 / n;

    let mut scored: Vec<(f64, &ToolInfo)> = Vec::new();
    for (doc, tool) in docs.iter().zip(tools.iter()) {
        let mut score = 0.0;
        for token in &query_tokens {
            let term_freq = doc.iter().filter(|t| *t == token).count() as f64;
            if term_freq == 0.0 {
                continue;
            }
            let doc_freq = docs
                .iter()
                .filter(|d| d.iter().any(|t| t == token))
                .count() as f64;
            let idf = ((n - doc_freq + 0.5) / (doc_freq + 0.5) + 1.0).ln();
            let denom = term_freq + K1 * (1.0 - B + B * doc.len() as f64 / avg_len);
            score += idf * term_freq * (K1 + 1.0) / denom;
        }
        if score > 0.0 {
            scored.push((score, tool));
        }
    }
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.name.cmp(&b.1.name))
    });
    scored.into_iter().map(|(_, t)| t).collect()
}

// ----------------------------------------------------------------------
// Built-in registry tools
// ----------------------------------------------------------------------

/// `tool_search` - discover tools by query before loading them.
pub struct ToolSearchTool {
    registry: Arc<ToolRegistry>,
}

impl ToolSearchTool {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl Tool for ToolSearchTool {
    fn name(&self) -> &str {
        "tool_search"
    }

    fn description(&self) -> String {
        "Search for available tools by query. Use this to discover the right tool \
         before loading it with load_tool. Strategies: 'keyword' (default), \
         'regex', 'bm25'."
            .to_string()
    }

    fn inputs(&self) -> Json {
        serde_json::json!({
            "query": {"type": "string", "description": "Keywords or pattern to search for"},
            "strategy": {"type": "string", "description": "keyword, regex, or bm25", "nullable": true},
            "top_k": {"type": "integer", "description": "Maximum number of results", "nullable": true},
            "category": {"type": "string", "description": "Optional category filter", "nullable": true},
        })
    }

    fn output_type(&self) -> &str {
        "array"
    }

    fn readonly(&self) -> bool {
        true
    }

    async fn invoke(&self, arguments: Json) -> Result<Value> {
        let query = arguments
            .get("query")
            .and_then(Json::as_str)
            .unwrap_or_default();
        let strategy = SearchStrategy::parse(
            arguments
                .get("strategy")
                .and_then(Json::as_str)
                .unwrap_or("keyword"),
        );
        let top_k = arguments
            .get("top_k")
            .and_then(Json::as_u64)
            .unwrap_or(5) as usize;
        let category = arguments
            .get("category")
            .and_then(Json::as_str)
            .unwrap_or_default();

        let results = self.registry.search(query, strategy, top_k, category);
        Ok(Value::from_json(&serde_json::to_value(results)?))
    }
}

/// `load_tool` - materialize a discovered tool into the agent's active
/// namespace so subsequent code blocks can call it.
pub struct LoadToolTool {
    registry: Arc<ToolRegistry>,
    /// Weak back-edge to the agent's live namespace; tools must not keep
    /// the agent alive.
    namespace: Weak<RwLock<ToolNamespace>>,
}

impl LoadToolTool {
    pub fn new(registry: Arc<ToolRegistry>, namespace: &Arc<RwLock<ToolNamespace>>) -> Self {
        Self {
            registry,
            namespace: Arc::downgrade(namespace),
        }
    }

    /// A loader with no live agent attached; loads still succeed and
    /// report `added_to_agent: false`.
    pub fn detached(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            namespace: Weak::new(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for LoadToolTool {
    fn name(&self) -> &str {
        "load_tool"
    }

    fn description(&self) -> String {
        "Load a tool by name so it can be called in code. After searching with \
         tool_search, load the tools you need; once loaded, call the tool by its \
         reported function name."
            .to_string()
    }

    fn inputs(&self) -> Json {
        serde_json::json!({
            "tool_name": {"type": "string", "description": "Name of the tool to load"},
        })
    }

    fn output_type(&self) -> &str {
        "object"
    }

    async fn invoke(&self, arguments: Json) -> Result<Value> {
        let tool_name = arguments
            .get("tool_name")
            .and_then(Json::as_str)
            .unwrap_or_default();

        let Some(tool) = self.registry.load_tool(tool_name) else {
            return Ok(Value::from_json(&serde_json::json!({
                "success": false,
                "error": format!("Tool '{tool_name}' not found or could not be loaded"),
            })));
        };

        let mut added_to_agent = false;
        if let Some(namespace) = self.namespace.upgrade() {
            namespace
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .insert(Arc::clone(&tool));
            added_to_agent = true;
            debug!(tool = tool_name, "tool added to agent namespace");
        }

        let function_name = sanitize_tool_name(tool_name);
        let parameters: Vec<String> = tool
            .inputs()
            .get("properties")
            .and_then(Json::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default();

        Ok(Value::from_json(&serde_json::json!({
            "success": true,
            "tool_name": tool.name(),
            "function_name": function_name,
            "description": tool.description(),
            "parameters": parameters,
            "added_to_agent": added_to_agent,
            "message": format!(
                "Tool '{tool_name}' loaded successfully. Call it as: await {function_name}(...)"
            ),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tool;
    use serde_json::json;

    fn sample_registry() -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(
            Arc::new(
                tool("github.create_pull_request", "Create a pull request on GitHub")
                    .param("repo", "string")
                    .param("title", "string")
                    .build(|_| async { Ok(json!({})) }),
            ),
            true,
            "github",
        );
        registry.register(
            Arc::new(
                tool("slack.send_message", "Send a message to a Slack channel")
                    .param("channel", "string")
                    .build(|_| async { Ok(json!({})) }),
            ),
            true,
            "slack",
        );
        registry.register(
            Arc::new(
                tool("web_search", "Search the web for information")
                    .param("query", "string")
                    .build(|_| async { Ok(json!([])) }),
            ),
            false,
            "",
        );
        registry
    }

    #[test]
    fn test_keyword_search_weights_name_matches() {
        let registry = sample_registry();
        let results = registry.search("pull request", SearchStrategy::Keyword, 5, "");
        assert_eq!(results[0].name, "github.create_pull_request");
    }

    #[test]
    fn test_regex_search_with_invalid_pattern_falls_back() {
        let registry = sample_registry();
        // Unbalanced bracket would fail to compile; falls back to literal.
        let results = registry.search("[slack", SearchStrategy::Regex, 5, "");
        assert!(results.is_empty());

        let results = registry.search("slack.*message", SearchStrategy::Regex, 5, "");
        assert_eq!(results[0].name, "slack.send_message");
    }

    #[test]
    fn test_bm25_search_ranks_relevant_tool_first() {
        let registry = sample_registry();
        let results = registry.search("send slack message", SearchStrategy::Bm25, 5, "");
        assert!(!results.is_empty());
        assert_eq!(results[0].name, "slack.send_message");
    }

    #[test]
    fn test_category_filter() {
        let registry = sample_registry();
        let results = registry.search("message", SearchStrategy::Keyword, 5, "github");
        assert!(results.iter().all(|r| r.category == "github"));
    }

    #[test]
    fn test_deferred_vs_loaded() {
        let registry = sample_registry();
        let stats = registry.stats();
        assert_eq!(stats["total_registered"], 3);
        assert_eq!(stats["total_loaded"], 1);
        assert_eq!(stats["deferred_count"], 2);

        assert!(registry.load_tool("github.create_pull_request").is_some());
        assert_eq!(registry.stats()["total_loaded"], 2);
    }

    #[test]
    fn test_factory_loading() {
        let registry = ToolRegistry::new();
        registry.register_factory(
            "expensive",
            "An expensive tool",
            vec!["x".to_string()],
            "",
            || {
                Arc::new(
                    tool("expensive", "An expensive tool")
                        .param("x", "string")
                        .build(|_| async { Ok(json!(null)) }),
                )
            },
        );
        assert_eq!(registry.stats()["total_loaded"], 0);
        assert!(registry.load_tool("expensive").is_some());
        assert_eq!(registry.stats()["total_loaded"], 1);
        // Second load reuses the cached instance.
        assert!(registry.load_tool("expensive").is_some());
        assert_eq!(registry.stats()["total_loaded"], 1);
    }

    #[tokio::test]
    async fn test_load_tool_reports_sanitized_name() {
        let registry = sample_registry();
        let namespace = Arc::new(RwLock::new(ToolNamespace::new()));
        let loader = LoadToolTool::new(Arc::clone(&registry), &namespace);

        let result = loader
            .invoke(json!({"tool_name": "github.create_pull_request"}))
            .await
            .unwrap();
        let result = result.to_json();
        assert_eq!(result["success"], true);
        assert_eq!(result["function_name"], "github_create_pull_request");
        assert_eq!(result["added_to_agent"], true);

        // The loaded tool is now callable through the namespace alias.
        let namespace = namespace.read().unwrap();
        assert!(crate::tools::ToolDispatch::lookup(&*namespace, "github_create_pull_request").is_some());
    }

    #[tokio::test]
    async fn test_tool_search_tool_invoke() {
        let registry = sample_registry();
        let search = ToolSearchTool::new(registry);
        let result = search
            .invoke(json!({"query": "github pull request", "top_k": 2}))
            .await
            .unwrap();
        let json = result.to_json();
        let results = json.as_array().unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0]["name"], "github.create_pull_request");
    }
}
