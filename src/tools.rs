//! # Tool System
//!
//! Tools are the capabilities generated code can call. Every variant  - 
//! local closures, remote HTTP/MCP endpoints, skills - presents the same
//! surface: the [`Tool`] trait. The evaluator invokes all of them
//! identically with keyword arguments; dispatch to sync or async
//! execution happens inside the tool.
//!
//! ## Architecture
//!
//! 1. **Tool trait** - metadata (name, description, input schema,
//!    readonly flag, output type) plus an async `invoke`. A tool may also
//!    implement [`format_for_observation`](Tool::format_for_observation)
//!    to control how its result renders when it is the terminal
//!    expression of a code block.
//!
//! 2. **FnTool** - wraps an async closure over `serde_json::Value`
//!    arguments, with flexible schema conversion (simple type notation,
//!    extended property schemas, or full JSON Schema) normalized to the
//!    OpenAI function-calling format.
//!
//! 3. **ToolDispatch** - the seam between the evaluator and the tool
//!    set. The permission pipeline implements it to intercept every
//!    invocation; [`ToolNamespace`] is the plain, hook-free
//!    implementation.
//!
//! ## Handler Pattern
//!
//! Handlers are `Arc<dyn Fn(Value) -> Pin<Box<dyn Future>>>`: boxing
//! erases each closure's concrete future type so heterogeneous tools can
//! live in one registry, and `Arc` makes cloning a tool cheap and
//! thread-safe.
//!
//! ## Example
//!
//! ```rust,no_run
//! use code_agent::tools::tool;
//! use serde_json::json;
//!
//! let weather = tool("get_weather", "Get current weather for a location")
//!     .param("location", "string")
//!     .readonly(true)
//!     .build(|args| async move {
//!         let location = args["location"].as_str().unwrap_or("Unknown");
//!         Ok(json!({"location": location, "temperature": 22}))
//!     });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value as Json;

use crate::value::{ToolFuture, Value};
use crate::Result;

/// The distinguished sentinel tool; calling it terminates the reasoning
/// loop with the given answer.
pub const FINAL_ANSWER_TOOL_NAME: &str = "final_answer";

/// Type alias for tool handler functions: async closures over JSON
/// arguments, pinned and boxed for dynamic dispatch.
pub type ToolHandler =
    Arc<dyn Fn(Json) -> Pin<Box<dyn Future<Output = Result<Json>> + Send>> + Send + Sync>;

/// A named capability callable from generated code.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique identifier. Dots are permitted (`github.create_pr`); the
    /// code-visible binding uses the sanitized underscore alias.
    fn name(&self) -> &str;

    /// Human-readable description sent to the model. A method rather than
    /// a field so implementations may compute it from configuration.
    fn description(&self) -> String;

    /// Input schema: parameter name → `{type, description, nullable?}`.
    fn inputs(&self) -> Json;

    /// Semantic tag for the result: string, number, array, object, any.
    fn output_type(&self) -> &str {
        "any"
    }

    /// Pure-read tools may be waived from confirmation by hooks.
    fn readonly(&self) -> bool {
        false
    }

    /// Whether invocation performs real asynchronous work. Async tools
    /// return coroutines in code and must be awaited; sync tools resolve
    /// inline.
    fn is_async(&self) -> bool {
        false
    }

    /// Execute the tool with keyword arguments (a JSON object).
    async fn invoke(&self, arguments: Json) -> Result<Value>;

    /// Render the result for the model when this tool's call is the
    /// terminal expression of a code block. `None` means default
    /// stringification.
    fn format_for_observation(&self, _output: &Value) -> Option<String> {
        None
    }

    /// Serialize to the provider's function-calling format:
    ///
    /// ```json
    /// { "type": "function",
    ///   "function": { "name", "description", "parameters": {...} } }
    /// ```
    ///
    /// The readonly flag and category are provider-opaque and not
    /// forwarded.
    fn to_openai_format(&self) -> Json {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": self.description(),
                "parameters": convert_schema_to_openai(self.inputs()),
            }
        })
    }
}

/// Sanitize a tool name into a valid code identifier: dots and dashes
/// become underscores. `github.create-pr` → `github_create_pr`.
pub fn sanitize_tool_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// The seam between the evaluator and the tool set. Implemented by the
/// hook pipeline (every call traverses pre/post hooks) and by the plain
/// [`ToolNamespace`].
pub trait ToolDispatch: Send + Sync {
    /// Resolve a code-visible name (original or sanitized alias).
    fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>>;

    /// Begin an invocation; the returned future completes with the
    /// tool's result (or a denial/stop error from the pipeline).
    fn dispatch(&self, tool: Arc<dyn Tool>, arguments: Json, call_id: String) -> ToolFuture;
}

/// Hook-free dispatch over a name → tool map. Sanitized aliases are
/// registered alongside original names.
#[derive(Default, Clone)]
pub struct ToolNamespace {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tools(tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        let mut namespace = Self::new();
        for tool in tools {
            namespace.insert(tool);
        }
        namespace
    }

    pub fn insert(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let alias = sanitize_tool_name(&name);
        if alias != name {
            self.tools.insert(alias, Arc::clone(&tool));
        }
        self.tools.insert(name, tool);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ToolDispatch for ToolNamespace {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    fn dispatch(&self, tool: Arc<dyn Tool>, arguments: Json, _call_id: String) -> ToolFuture {
        async move { tool.invoke(arguments).await }.boxed()
    }
}

/// A tool backed by an async closure.
///
/// Immutable once built: cloning shares the handler via `Arc`, so a tool
/// can live in several registries at once without duplicating its logic.
#[derive(Clone)]
pub struct FnTool {
    name: String,
    description: String,
    input_schema: Json,
    output_type: String,
    readonly: bool,
    asynchronous: bool,
    handler: ToolHandler,
}

impl FnTool {
    /// Create a tool with flexible schema input; see
    /// [`convert_schema_to_openai`] for the accepted forms.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Json,
        handler: F,
    ) -> Self
    where
        F: Fn(Json) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Json>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: convert_schema_to_openai(input_schema),
            output_type: "any".to_string(),
            readonly: false,
            asynchronous: false,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }
}

#[async_trait::async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn inputs(&self) -> Json {
        self.input_schema.clone()
    }

    fn output_type(&self) -> &str {
        &self.output_type
    }

    fn readonly(&self) -> bool {
        self.readonly
    }

    fn is_async(&self) -> bool {
        self.asynchronous
    }

    async fn invoke(&self, arguments: Json) -> Result<Value> {
        let result = (self.handler)(arguments).await?;
        Ok(Value::from_json(&result))
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .field("readonly", &self.readonly)
            .field("asynchronous", &self.asynchronous)
            // Handler is intentionally omitted - it's not debuggable
            .finish()
    }
}

/// Builder for [`FnTool`] with a fluent API.
///
/// ```rust
/// # use code_agent::tools::tool;
/// # use serde_json::json;
/// let add = tool("add", "Add two numbers")
///     .param("a", "number")
///     .param("b", "number")
///     .build(|args| async move {
///         let a = args["a"].as_f64().unwrap_or(0.0);
///         let b = args["b"].as_f64().unwrap_or(0.0);
///         Ok(json!({"result": a + b}))
///     });
/// ```
pub struct ToolBuilder {
    name: String,
    description: String,
    schema: Json,
    output_type: String,
    readonly: bool,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({}),
            output_type: "any".to_string(),
            readonly: false,
        }
    }

    /// Replace the whole input schema. Overrides prior `.param()` calls;
    /// use one style or the other.
    pub fn schema(mut self, schema: Json) -> Self {
        self.schema = schema;
        self
    }

    /// Add a required parameter with a simple type string ("string",
    /// "number", "integer", "boolean", "array", "object").
    pub fn param(mut self, name: &str, type_str: &str) -> Self {
        if !self.schema.is_object() {
            self.schema = serde_json::json!({});
        }
        let obj = self
            .schema
            .as_object_mut()
            .expect("schema is an object after initialization");
        obj.insert(name.to_string(), Json::String(type_str.to_string()));
        self
    }

    /// Mark the tool as pure-read; hooks may waive confirmation.
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Set the semantic output tag.
    pub fn output_type(mut self, output_type: impl Into<String>) -> Self {
        self.output_type = output_type.into();
        self
    }

    /// Finalize with a synchronous-semantics handler (resolves inline in
    /// code; no `await` needed, though awaiting is harmless).
    pub fn build<F, Fut>(self, handler: F) -> FnTool
    where
        F: Fn(Json) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Json>> + Send + 'static,
    {
        let mut tool = FnTool::new(self.name, self.description, self.schema, handler);
        tool.output_type = self.output_type;
        tool.readonly = self.readonly;
        tool
    }

    /// Finalize with an asynchronous handler: calls return coroutines in
    /// generated code and must be awaited.
    pub fn build_async<F, Fut>(self, handler: F) -> FnTool
    where
        F: Fn(Json) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Json>> + Send + 'static,
    {
        let mut tool = self.build(handler);
        tool.asynchronous = true;
        tool
    }
}

/// Create a tool using the builder pattern (the recommended entry point).
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder::new(name, description)
}

/// Convert various schema formats to the JSON Schema shape the provider
/// expects.
///
/// Accepted inputs:
/// - Full JSON Schema (has `"type": "object"` and `"properties"`):
///   passed through unchanged.
/// - Simple type notation: `{"location": "string"}` - every parameter
///   becomes required.
/// - Extended property schemas: `{"limit": {"type": "integer",
///   "optional": true}}` - `optional`/`required` markers and `default`
///   values control membership in the `required` array and are stripped
///   from the emitted schema.
pub fn convert_schema_to_openai(schema: Json) -> Json {
    if let Some(obj) = schema.as_object() {
        if obj.contains_key("type") && obj.contains_key("properties") {
            return schema;
        }

        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for (param_name, param_type) in obj {
            if let Some(type_str) = param_type.as_str() {
                properties.insert(param_name.clone(), type_to_json_schema(type_str));
                required.push(param_name.clone());
            } else if param_type.is_object() {
                let mut prop = param_type.clone();
                let prop_obj = prop
                    .as_object_mut()
                    .expect("checked is_object above");

                let is_optional = prop_obj
                    .remove("optional")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let nullable = prop_obj
                    .get("nullable")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let is_required = prop_obj.remove("required").and_then(|v| v.as_bool());
                let has_default = prop_obj.contains_key("default");

                properties.insert(param_name.clone(), prop);

                if let Some(true) = is_required {
                    required.push(param_name.clone());
                } else if is_optional || nullable || is_required == Some(false) {
                    // Explicitly optional.
                } else if !has_default {
                    required.push(param_name.clone());
                }
            }
        }

        return serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });
    }

    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": [],
    })
}

/// Map a friendly type string onto its JSON Schema spelling. Unknown
/// strings default to `"string"` rather than failing tool creation.
fn type_to_json_schema(type_str: &str) -> Json {
    let json_type = match type_str {
        "string" | "str" => "string",
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" => "integer",
        "number" | "float" | "f32" | "f64" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        _ => "string",
    };
    serde_json::json!({ "type": json_type })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_to_json_schema() {
        assert_eq!(type_to_json_schema("string"), json!({"type": "string"}));
        assert_eq!(type_to_json_schema("integer"), json!({"type": "integer"}));
        assert_eq!(type_to_json_schema("number"), json!({"type": "number"}));
        assert_eq!(type_to_json_schema("bool"), json!({"type": "boolean"}));
    }

    #[test]
    fn test_convert_simple_schema() {
        let schema = json!({
            "location": "string",
            "units": "string"
        });

        let result = convert_schema_to_openai(schema);

        assert_eq!(result["type"], "object");
        assert_eq!(result["properties"]["location"]["type"], "string");
        assert_eq!(result["properties"]["units"]["type"], "string");
        let required = result["required"].as_array().unwrap();
        assert!(required.contains(&json!("location")));
        assert!(required.contains(&json!("units")));
    }

    #[test]
    fn test_convert_full_schema_passthrough() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"}
            },
            "required": ["name"]
        });

        let result = convert_schema_to_openai(schema.clone());
        assert_eq!(result, schema);
    }

    #[test]
    fn test_nullable_params_are_optional() {
        let schema = json!({
            "query": {"type": "string"},
            "limit": {"type": "integer", "nullable": true}
        });
        let result = convert_schema_to_openai(schema);
        let required = result["required"].as_array().unwrap();
        assert!(required.contains(&json!("query")));
        assert!(!required.contains(&json!("limit")));
    }

    #[tokio::test]
    async fn test_tool_creation_and_invoke() {
        let add = tool("add", "Add two numbers")
            .param("a", "number")
            .param("b", "number")
            .build(|args| async move {
                let a = args["a"].as_f64().unwrap_or(0.0);
                let b = args["b"].as_f64().unwrap_or(0.0);
                Ok(json!({"result": a + b}))
            });

        assert_eq!(add.name(), "add");
        assert!(!add.is_async());

        let result = add.invoke(json!({"a": 5.0, "b": 3.0})).await.unwrap();
        assert_eq!(result.to_json()["result"], 8.0);
    }

    #[test]
    fn test_tool_to_openai_format() {
        let search = tool("search", "Search the web")
            .param("query", "string")
            .readonly(true)
            .build(|_| async { Ok(json!({})) });

        let format = search.to_openai_format();
        assert_eq!(format["type"], "function");
        assert_eq!(format["function"]["name"], "search");
        assert_eq!(format["function"]["description"], "Search the web");
        assert!(format["function"]["parameters"].is_object());
        // readonly is provider-opaque
        assert!(format["function"].get("readonly").is_none());
    }

    #[test]
    fn test_sanitize_tool_name() {
        assert_eq!(
            sanitize_tool_name("github.create-pull-request"),
            "github_create_pull_request"
        );
        assert_eq!(sanitize_tool_name("bash"), "bash");
    }

    #[tokio::test]
    async fn test_namespace_alias_lookup() {
        let remote = tool("github.list_issues", "List issues")
            .param("repo", "string")
            .build(|_| async { Ok(json!([])) });
        let mut namespace = ToolNamespace::new();
        namespace.insert(Arc::new(remote));

        assert!(namespace.lookup("github.list_issues").is_some());
        assert!(namespace.lookup("github_list_issues").is_some());
        assert!(namespace.lookup("missing").is_none());
    }
}
