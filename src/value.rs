//! Runtime values exchanged between generated code, tools, and observations.
//!
//! [`Value`] is the universal datum of the SDK. The interpreter evaluates
//! expressions to `Value`s, tools receive and return them (via their JSON
//! forms), and the observation formatter renders them for the model.
//!
//! # Variants
//!
//! - Scalars: `Null`, `Bool`, `Int` (64-bit), `Float`, `Str`, `Bytes`
//! - Containers: `List` and `Map` (shared, mutable, insertion-ordered),
//!   `Tuple` and `Set`
//! - `Callable`: a tool, builtin, user-defined function, or bound method
//! - `Coroutine`: a pending async tool invocation, driven by `await`
//! - `Exception`: a first-class error value that `except` can catch
//! - `Opaque`: a handle to a resource a tool owns (e.g. an open session)
//!
//! # Sharing semantics
//!
//! Lists, maps, and sets follow Python aliasing rules: binding a container
//! to a second name shares the underlying storage, so mutation through one
//! name is visible through the other. Containers are therefore held behind
//! `Arc<Mutex<_>>`. The interpreter runs one evaluation at a time, so the
//! locks are uncontended.
//!
//! Equality is structural; hashing is defined on immutable variants only,
//! which is enforced by [`Value::is_hashable`] at dict-key insertion.

use std::fmt;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crate::tools::Tool;

/// Shared mutable list storage.
pub type ListRef = Arc<Mutex<Vec<Value>>>;

/// Shared mutable map storage. Entries keep insertion order; key lookup is
/// a structural-equality scan, which is the right trade at generated-code
/// scale and permits tuple keys without a Hash bound.
pub type MapRef = Arc<Mutex<Vec<(Value, Value)>>>;

/// Future produced by an async tool invocation.
pub type ToolFuture = BoxFuture<'static, crate::Result<Value>>;

/// An exception value: kind + message + optional payload.
///
/// Exceptions raised inside generated code propagate as values and can be
/// caught by `except`; uncaught ones surface as `Error::Interpreter`.
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    /// Exception class name, e.g. `TypeError`, `ValueError`, `KeyError`.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured payload attached by `raise` or a tool.
    pub payload: Option<Box<Value>>,
}

impl Exception {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            payload: None,
        }
    }

    /// Conventional kinds, used throughout the interpreter.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn name_error(message: impl Into<String>) -> Self {
        Self::new("NameError", message)
    }

    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new("KeyError", message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new("IndexError", message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new("AttributeError", message)
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new("ZeroDivisionError", message)
    }

    pub fn import_error(message: impl Into<String>) -> Self {
        Self::new("ImportError", message)
    }

    pub fn stop_iteration() -> Self {
        Self::new("StopIteration", "")
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new("RuntimeError", message)
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// A resource owned by a tool and passed opaquely through generated code.
///
/// Opaque resources may expose attributes and participate in `with` blocks
/// via [`enter`](OpaqueResource::enter) / [`exit`](OpaqueResource::exit).
/// Code never sees their internals.
pub trait OpaqueResource: Send + Sync {
    /// Type name shown in reprs and error messages.
    fn type_name(&self) -> &str;

    /// Attribute lookup from generated code. Default: no attributes.
    fn get_attr(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Context-manager entry (`with obj:`). Default: no-op.
    fn enter(&self) -> Result<(), Exception> {
        Ok(())
    }

    /// Context-manager exit. Default: no-op.
    fn exit(&self) -> Result<(), Exception> {
        Ok(())
    }
}

/// Handle wrapping an [`OpaqueResource`].
#[derive(Clone)]
pub struct OpaqueHandle(pub Arc<dyn OpaqueResource>);

impl fmt::Debug for OpaqueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object>", self.0.type_name())
    }
}

/// A pending asynchronous invocation, produced by calling an async-capable
/// tool without `await`. Awaiting drives the future to completion; a
/// coroutine can be awaited at most once.
#[derive(Clone)]
pub struct Coroutine {
    /// Name of the originating tool or function, for error messages.
    pub name: String,
    state: Arc<Mutex<CoroutineState>>,
}

enum CoroutineState {
    Pending(ToolFuture),
    /// Already resolved (user async functions evaluate eagerly).
    Ready(Value),
    Consumed,
}

impl Coroutine {
    /// Wrap a pending tool future.
    pub fn pending(name: impl Into<String>, future: ToolFuture) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(CoroutineState::Pending(future))),
        }
    }

    /// Wrap an already-computed value. `await` simply unwraps it.
    pub fn ready(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(CoroutineState::Ready(value))),
        }
    }

    /// Drive the coroutine to completion. Errors from the underlying tool
    /// surface as `ToolError` exceptions so user code can catch them.
    pub async fn resolve(&self) -> Result<Value, Exception> {
        let taken = {
            let mut guard = self
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *guard, CoroutineState::Consumed)
        };
        match taken {
            CoroutineState::Pending(future) => future.await.map_err(|e| match e {
                crate::Error::PermissionDenied { tool, reason } => Exception {
                    kind: "PermissionDenied".to_string(),
                    message: format!("tool '{tool}' was blocked: {reason}"),
                    payload: None,
                },
                crate::Error::Timeout => {
                    Exception::new("TimeoutError", format!("tool '{}' timed out", self.name))
                }
                // A post-hook stop or external cancellation must abort the
                // whole code block; the evaluator refuses to catch this kind.
                crate::Error::Cancelled(reason) => Exception::new("ExecutionStopped", reason),
                crate::Error::Hook(reason) => Exception::new("HookError", reason),
                other => Exception::new("ToolError", other.to_string()),
            }),
            CoroutineState::Ready(value) => Ok(value),
            CoroutineState::Consumed => Err(Exception::runtime_error(format!(
                "coroutine '{}' was already awaited",
                self.name
            ))),
        }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<coroutine '{}'>", self.name)
    }
}

/// Anything invocable from generated code.
#[derive(Clone)]
pub enum Callable {
    /// A registered tool, called as `tool_name(**kwargs)`.
    Tool(Arc<dyn Tool>),
    /// A frozen builtin, resolved by name in the builtin table.
    Builtin(&'static str),
    /// A function defined by the code itself (`def` / `lambda` / `async def`).
    Function(Arc<crate::interp::eval::UserFunction>),
    /// A method bound to a receiver, e.g. `xs.append`.
    BoundMethod {
        receiver: Box<Value>,
        method: String,
    },
}

impl Callable {
    /// Display name for prompts and errors.
    pub fn name(&self) -> String {
        match self {
            Callable::Tool(tool) => tool.name().to_string(),
            Callable::Builtin(name) => (*name).to_string(),
            Callable::Function(func) => func.name.clone(),
            Callable::BoundMethod { method, .. } => method.clone(),
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Tool(tool) => write!(f, "<tool {}>", tool.name()),
            Callable::Builtin(name) => write!(f, "<builtin {name}>"),
            Callable::Function(func) => write!(f, "<function {}>", func.name),
            Callable::BoundMethod { method, .. } => write!(f, "<bound method {method}>"),
        }
    }
}

/// The universal runtime datum.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(ListRef),
    Tuple(Arc<Vec<Value>>),
    Set(ListRef),
    Map(MapRef),
    Callable(Callable),
    Coroutine(Coroutine),
    Exception(Arc<Exception>),
    Opaque(OpaqueHandle),
}

impl Value {
    /// Build a list value from owned elements.
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(Mutex::new(items)))
    }

    /// Build a map value from owned entries (insertion order preserved).
    pub fn map(entries: Vec<(Value, Value)>) -> Self {
        Value::Map(Arc::new(Mutex::new(entries)))
    }

    /// Build a set value, deduplicating structurally.
    pub fn set(items: Vec<Value>) -> Self {
        let mut unique: Vec<Value> = Vec::new();
        for item in items {
            if !unique.iter().any(|v| v == &item) {
                unique.push(item);
            }
        }
        Value::Set(Arc::new(Mutex::new(unique)))
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn exception(exc: Exception) -> Self {
        Value::Exception(Arc::new(exc))
    }

    /// Python type name, used in error messages.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Map(_) => "dict",
            Value::Callable(_) => "function",
            Value::Coroutine(_) => "coroutine",
            Value::Exception(_) => "exception",
            Value::Opaque(handle) => handle.0.type_name(),
        }
    }

    /// Python truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::List(items) | Value::Set(items) => !lock(items).is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Map(entries) => !lock_map(entries).is_empty(),
            Value::Callable(_) | Value::Coroutine(_) | Value::Opaque(_) => true,
            Value::Exception(_) => true,
        }
    }

    /// Whether this value may be used as a dict key or set member.
    /// Mirrors the rule that hashing is defined on immutable variants only.
    pub fn is_hashable(&self) -> bool {
        match self {
            Value::Null
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::Str(_)
            | Value::Bytes(_) => true,
            Value::Tuple(items) => items.iter().all(Value::is_hashable),
            _ => false,
        }
    }

    /// Numeric view, if this value is an int, float, or bool.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// `str()` form: bare strings, Python spellings for the rest.
    pub fn py_str(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.py_repr(),
        }
    }

    /// `repr()` form: strings quoted, containers rendered recursively.
    pub fn py_repr(&self) -> String {
        match self {
            Value::Null => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::Bytes(b) => format!("b'{}'", String::from_utf8_lossy(b)),
            Value::List(items) => {
                let items = lock(items);
                let parts: Vec<String> = items.iter().map(Value::py_repr).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(Value::py_repr).collect();
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            Value::Set(items) => {
                let items = lock(items);
                if items.is_empty() {
                    "set()".to_string()
                } else {
                    let parts: Vec<String> = items.iter().map(Value::py_repr).collect();
                    format!("{{{}}}", parts.join(", "))
                }
            }
            Value::Map(entries) => {
                let entries = lock_map(entries);
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.py_repr(), v.py_repr()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Callable(c) => format!("{c:?}"),
            Value::Coroutine(c) => format!("{c:?}"),
            Value::Exception(exc) => exc.to_string(),
            Value::Opaque(handle) => format!("{handle:?}"),
        }
    }

    /// Convert a `serde_json::Value` (the tool wire form) into a runtime value.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::list(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::map(
                map.iter()
                    .map(|(k, v)| (Value::Str(k.clone()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to the JSON wire form tools consume. Non-representable
    /// variants (callables, coroutines, opaques) serialize to their repr.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
            Value::List(items) | Value::Set(items) => {
                serde_json::Value::Array(lock(items).iter().map(Value::to_json).collect())
            }
            Value::Tuple(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => {
                let mut object = serde_json::Map::new();
                for (k, v) in lock_map(entries).iter() {
                    object.insert(k.py_str(), v.to_json());
                }
                serde_json::Value::Object(object)
            }
            other => serde_json::Value::String(other.py_repr()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            // Numeric cross-type equality: 1 == 1.0 is True.
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => x == y,
                _ => match (a, b) {
                    (Value::List(a), Value::List(b)) | (Value::Set(a), Value::Set(b)) => {
                        if Arc::ptr_eq(a, b) {
                            return true;
                        }
                        *lock(a) == *lock(b)
                    }
                    (Value::Tuple(a), Value::Tuple(b)) => a == b,
                    (Value::Map(a), Value::Map(b)) => {
                        if Arc::ptr_eq(a, b) {
                            return true;
                        }
                        *lock_map(a) == *lock_map(b)
                    }
                    (Value::Exception(a), Value::Exception(b)) => a == b,
                    _ => false,
                },
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.py_str())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// Render a float the way Python does: integral floats keep a `.0`.
fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f == f.trunc() && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// Lock helper resilient to poisoning (a panic mid-evaluation must not
/// wedge later repr calls in error paths).
pub(crate) fn lock(list: &ListRef) -> std::sync::MutexGuard<'_, Vec<Value>> {
    list.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn lock_map(map: &MapRef) -> std::sync::MutexGuard<'_, Vec<(Value, Value)>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Look up a key in map entries by structural equality.
pub(crate) fn map_get(entries: &[(Value, Value)], key: &Value) -> Option<Value> {
    entries
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

/// Insert or replace a key, preserving first-insertion order.
pub(crate) fn map_insert(entries: &mut Vec<(Value, Value)>, key: Value, value: Value) {
    if let Some(slot) = entries.iter_mut().find(|(k, _)| *k == key) {
        slot.1 = value;
    } else {
        entries.push((key, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_equality() {
        let a = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(a, b);

        let c = Value::list(vec![Value::Int(1)]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_numeric_cross_equality() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Bool(true), Value::Int(1));
        assert_ne!(Value::Int(1), Value::Str("1".to_string()));
    }

    #[test]
    fn test_aliasing_via_shared_storage() {
        let a = Value::list(vec![Value::Int(1)]);
        let b = a.clone();
        if let Value::List(items) = &a {
            lock(items).push(Value::Int(2));
        }
        assert_eq!(b.py_repr(), "[1, 2]");
    }

    #[test]
    fn test_py_str_and_repr() {
        assert_eq!(Value::Null.py_str(), "None");
        assert_eq!(Value::Bool(true).py_str(), "True");
        assert_eq!(Value::Float(3.0).py_str(), "3.0");
        assert_eq!(Value::Str("hi".into()).py_str(), "hi");
        assert_eq!(Value::Str("hi".into()).py_repr(), "'hi'");

        let nested = Value::list(vec![Value::Str("a".into()), Value::Int(1)]);
        assert_eq!(nested.py_repr(), "['a', 1]");

        let single = Value::Tuple(Arc::new(vec![Value::Int(1)]));
        assert_eq!(single.py_repr(), "(1,)");
    }

    #[test]
    fn test_map_insertion_order() {
        let map = Value::map(vec![
            (Value::Str("b".into()), Value::Int(1)),
            (Value::Str("a".into()), Value::Int(2)),
        ]);
        assert_eq!(map.py_repr(), "{'b': 1, 'a': 2}");

        if let Value::Map(entries) = &map {
            let mut guard = lock_map(entries);
            map_insert(&mut guard, Value::Str("b".into()), Value::Int(9));
        }
        assert_eq!(map.py_repr(), "{'b': 9, 'a': 2}");
    }

    #[test]
    fn test_hashability() {
        assert!(Value::Int(1).is_hashable());
        assert!(Value::Str("k".into()).is_hashable());
        assert!(Value::Tuple(Arc::new(vec![Value::Int(1)])).is_hashable());
        assert!(!Value::list(vec![]).is_hashable());
        assert!(!Value::map(vec![]).is_hashable());
        assert!(!Value::Tuple(Arc::new(vec![Value::list(vec![])])).is_hashable());
    }

    #[test]
    fn test_json_round_trip() {
        let json = serde_json::json!({
            "name": "search",
            "count": 3,
            "score": 0.5,
            "tags": ["a", "b"],
            "nested": {"ok": true}
        });
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(!Value::list(vec![]).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::list(vec![Value::Null]).is_truthy());
    }

    #[tokio::test]
    async fn test_coroutine_single_consumption() {
        let coroutine = Coroutine::ready("demo", Value::Int(42));
        assert_eq!(coroutine.resolve().await.unwrap(), Value::Int(42));
        let err = coroutine.resolve().await.unwrap_err();
        assert_eq!(err.kind, "RuntimeError");
    }
}
