//! Sandboxed interpreter for a Python-subset expression language.
//!
//! Generated code is parsed into an AST ([`ast`]), validated against the
//! node whitelist (anything else fails in [`parser`] before any side
//! effect), and walked by the async [`eval::Evaluator`] under an
//! operation budget, a print-buffer cap, and an authorized-imports set.
//!
//! The module is self-contained: it knows nothing about prompts or the
//! reasoning loop, only about [`crate::value::Value`]s and the
//! [`crate::tools::ToolDispatch`] surface it calls tools through.

pub mod ast;
pub mod builtins;
pub mod eval;
pub mod lexer;
pub mod modules;
pub mod parser;

pub use eval::{Evaluator, Execution};
pub use parser::parse;

use ast::{Expr, Stmt};

/// Name of the tool called in the terminal position of a block, which
/// supplies the observation formatter. Inspects the last statement: a
/// direct call, an assignment from a call, or an awaited call.
pub fn last_tool_name(code: &str) -> Option<String> {
    let program = parse(code).ok()?;
    let last = program.body.last()?;

    let expr = match last {
        Stmt::Expr(expr) => expr,
        Stmt::Assign { value, .. } => value,
        Stmt::AnnAssign {
            value: Some(value), ..
        } => value,
        _ => return None,
    };
    call_target_name(expr)
}

fn call_target_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Await(inner) => call_target_name(inner),
        Expr::Call { func, .. } => match func.as_ref() {
            Expr::Name(name) => Some(name.clone()),
            Expr::Attribute { attr, .. } => Some(attr.clone()),
            _ => None,
        },
        _ => None,
    }
}

/// Whether a block's last statement is a bare call to the named function
/// (used by the loop to decide if `format_for_observation` applies even
/// when the call was awaited).
pub fn ends_with_call_to(code: &str, name: &str) -> bool {
    last_tool_name(code).as_deref() == Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_tool_name_direct_call() {
        assert_eq!(
            last_tool_name("x = 1\nfile_read(file_path='/tmp/a')\n").as_deref(),
            Some("file_read")
        );
    }

    #[test]
    fn test_last_tool_name_awaited_assignment() {
        assert_eq!(
            last_tool_name("result = await web_search(query='rust')\n").as_deref(),
            Some("web_search")
        );
    }

    #[test]
    fn test_last_tool_name_attribute_call() {
        assert_eq!(
            last_tool_name("client.fetch(url='x')\n").as_deref(),
            Some("fetch")
        );
    }

    #[test]
    fn test_last_tool_name_absent() {
        assert_eq!(last_tool_name("x = 1\nx + 2\n"), None);
        assert_eq!(last_tool_name("for i in range(3):\n    use(i)\n"), None);
    }
}
