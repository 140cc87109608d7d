//! Sandbox module stubs for whitelisted imports.
//!
//! `import X` succeeds only when the root module name is in the
//! evaluator's authorized set, and resolves to a stub exposing a curated
//! member list - never the host environment. A module is resolved once
//! per evaluator and cached.

use std::sync::Arc;

use crate::value::{Callable, Exception, OpaqueHandle, OpaqueResource, Value};

/// Default authorized imports handed to new evaluators.
pub const DEFAULT_AUTHORIZED_IMPORTS: &[&str] = &["math", "json", "re"];

/// Stub module object. Attribute access resolves curated members;
/// functions dispatch through the dotted-builtin table.
struct ModuleObject {
    name: String,
    members: Vec<(&'static str, Value)>,
}

impl OpaqueResource for ModuleObject {
    fn type_name(&self) -> &str {
        "module"
    }

    fn get_attr(&self, name: &str) -> Option<Value> {
        self.members
            .iter()
            .find(|(member, _)| *member == name)
            .map(|(_, value)| value.clone())
    }
}

fn function(dotted: &'static str) -> Value {
    Value::Callable(Callable::Builtin(dotted))
}

/// Resolve a whitelisted module by root name. Returns `None` for modules
/// this sandbox does not provide (the evaluator reports those as
/// ImportError even when authorized).
pub fn resolve(name: &str) -> Option<Value> {
    let members: Vec<(&'static str, Value)> = match name {
        "math" => vec![
            ("pi", Value::Float(std::f64::consts::PI)),
            ("e", Value::Float(std::f64::consts::E)),
            ("tau", Value::Float(std::f64::consts::TAU)),
            ("inf", Value::Float(f64::INFINITY)),
            ("nan", Value::Float(f64::NAN)),
            ("sqrt", function("math.sqrt")),
            ("floor", function("math.floor")),
            ("ceil", function("math.ceil")),
            ("fabs", function("math.fabs")),
            ("exp", function("math.exp")),
            ("log", function("math.log")),
            ("log2", function("math.log2")),
            ("log10", function("math.log10")),
            ("sin", function("math.sin")),
            ("cos", function("math.cos")),
            ("tan", function("math.tan")),
            ("pow", function("math.pow")),
            ("gcd", function("math.gcd")),
            ("factorial", function("math.factorial")),
        ],
        "json" => vec![
            ("dumps", function("json.dumps")),
            ("loads", function("json.loads")),
        ],
        "re" => vec![
            ("findall", function("re.findall")),
            ("search", function("re.search")),
            ("match", function("re.match")),
            ("split", function("re.split")),
            ("sub", function("re.sub")),
            ("escape", function("re.escape")),
        ],
        _ => return None,
    };

    Some(Value::Opaque(OpaqueHandle(Arc::new(ModuleObject {
        name: name.to_string(),
        members,
    }))))
}

/// Resolve a single member for `from X import Y`.
pub fn resolve_member(module: &str, member: &str) -> Result<Value, Exception> {
    let module_value = resolve(module).ok_or_else(|| {
        Exception::import_error(format!("no sandbox module named '{module}'"))
    })?;
    match &module_value {
        Value::Opaque(handle) => handle.0.get_attr(member).ok_or_else(|| {
            Exception::import_error(format!("cannot import name '{member}' from '{module}'"))
        }),
        _ => unreachable!("modules are always opaque handles"),
    }
}

impl std::fmt::Debug for ModuleObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<module '{}'>", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_math_module_members() {
        let math = resolve("math").unwrap();
        match &math {
            Value::Opaque(handle) => {
                assert!(handle.0.get_attr("sqrt").is_some());
                assert!(handle.0.get_attr("pi").is_some());
                assert!(handle.0.get_attr("no_such_member").is_none());
            }
            other => panic!("expected opaque module, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_module() {
        assert!(resolve("subprocess").is_none());
        assert!(resolve("os").is_none());
    }

    #[test]
    fn test_resolve_member() {
        assert!(resolve_member("json", "dumps").is_ok());
        let err = resolve_member("json", "nothing").unwrap_err();
        assert_eq!(err.kind, "ImportError");
    }
}
