//! Async tree-walking evaluator for the sandboxed Python subset.
//!
//! The evaluator walks a parsed [`Program`] left-to-right, depth-first.
//! Every node visit counts against an operation budget; `print` output is
//! collected into a capped buffer; name resolution layers local frames,
//! enclosing closures, user globals, the frozen builtin table, and the
//! tool namespace, in that order. Tool calls dispatch through a
//! [`ToolDispatch`] implementation so the permission pipeline sees every
//! invocation.
//!
//! Exceptions are values: user code raises and catches them, and an
//! uncaught exception is returned to the caller rather than tearing the
//! evaluator down. Two signals are not exceptions and cannot be caught:
//! the `final_answer` control-flow signal, and `ExecutionStopped` (a
//! post-hook abort or external cancellation).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::config::EvaluatorConfig;
use crate::interp::ast::*;
use crate::interp::builtins::{self, iter_values, py_cmp};
use crate::interp::{modules, parser};
use crate::tools::ToolDispatch;
use crate::value::{
    lock, lock_map, map_get, map_insert, Callable, Coroutine, Exception, Value,
};
use crate::{Error, Result};

/// One lexical scope: name → value. Shared so closures observe mutation.
pub type Scope = Arc<Mutex<HashMap<String, Value>>>;

/// A function defined by generated code (`def`, `async def`, `lambda`).
pub struct UserFunction {
    pub name: String,
    pub params: Params,
    pub body: FunctionBody,
    /// Defaults evaluated at definition time, aligned with `params.positional`.
    pub defaults: Vec<Option<Value>>,
    /// Captured scope chain from the definition site.
    pub closure: Vec<Scope>,
    pub is_async: bool,
    pub is_generator: bool,
}

pub enum FunctionBody {
    Block(Arc<FunctionDef>),
    Lambda(Arc<Expr>),
}

impl std::fmt::Debug for UserFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserFunction({})", self.name)
    }
}

/// Result of evaluating one code block.
#[derive(Debug)]
pub struct Execution {
    /// Value of the final expression statement (or the `final_answer`
    /// payload). An uncaught user exception arrives as `Value::Exception`.
    pub value: Value,
    /// Captured `print` output, truncated at the configured cap.
    pub logs: String,
    /// True when evaluation called the `final_answer` tool.
    pub is_final_answer: bool,
}

impl Execution {
    /// The uncaught exception, if the block ended with one.
    pub fn error(&self) -> Option<&Exception> {
        match &self.value {
            Value::Exception(exc) => Some(exc),
            _ => None,
        }
    }
}

/// Control-flow signals threaded through `Result::Err`.
enum Interrupt {
    Exception(Exception),
    FinalAnswer(Value),
    /// Budget/cancellation/unsupported-construct: aborts the block and
    /// surfaces as a crate-level error.
    Fatal(Error),
}

type EvalOut<T> = std::result::Result<T, Interrupt>;

/// Statement-level flow.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

fn exc(e: Exception) -> Interrupt {
    Interrupt::Exception(e)
}

/// Evaluation environment: a chain of scopes plus per-frame declaration
/// sets and an optional generator yield sink. Cloning is cheap (Arcs).
#[derive(Clone)]
struct Env {
    /// Scope chain; index 0 is the user-globals scope.
    scopes: Vec<Scope>,
    global_decls: Arc<Mutex<HashSet<String>>>,
    nonlocal_decls: Arc<Mutex<HashSet<String>>>,
    yield_sink: Option<Arc<Mutex<Vec<Value>>>>,
}

impl Env {
    fn frame(scopes: Vec<Scope>, yield_sink: Option<Arc<Mutex<Vec<Value>>>>) -> Self {
        Self {
            scopes,
            global_decls: Arc::new(Mutex::new(HashSet::new())),
            nonlocal_decls: Arc::new(Mutex::new(HashSet::new())),
            yield_sink,
        }
    }

    fn current(&self) -> &Scope {
        self.scopes.last().expect("scope chain is never empty")
    }

    /// A child environment sharing the chain but writing into a fresh
    /// scope (used by comprehensions so their targets do not leak).
    fn child(&self) -> Self {
        let mut scopes = self.scopes.clone();
        scopes.push(Arc::new(Mutex::new(HashMap::new())));
        Self {
            scopes,
            global_decls: Arc::clone(&self.global_decls),
            nonlocal_decls: Arc::clone(&self.nonlocal_decls),
            yield_sink: self.yield_sink.clone(),
        }
    }

    fn get(&self, name: &str) -> Option<Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.lock().unwrap_or_else(|p| p.into_inner()).get(name) {
                return Some(value.clone());
            }
        }
        None
    }

    fn set(&self, name: &str, value: Value) -> std::result::Result<(), Exception> {
        let decls = self.global_decls.lock().unwrap_or_else(|p| p.into_inner());
        if decls.contains(name) {
            self.scopes[0]
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(name.to_string(), value);
            return Ok(());
        }
        drop(decls);

        let nonlocals = self.nonlocal_decls.lock().unwrap_or_else(|p| p.into_inner());
        if nonlocals.contains(name) {
            // Nearest enclosing scope (excluding globals and the current
            // frame) that already binds the name.
            if self.scopes.len() > 1 {
                for scope in self.scopes[1..self.scopes.len() - 1].iter().rev() {
                    let mut guard = scope.lock().unwrap_or_else(|p| p.into_inner());
                    if guard.contains_key(name) {
                        guard.insert(name.to_string(), value);
                        return Ok(());
                    }
                }
            }
            return Err(Exception::new(
                "SyntaxError",
                format!("no binding for nonlocal '{name}' found"),
            ));
        }
        drop(nonlocals);

        self.current()
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), value);
        Ok(())
    }
}

/// The sandboxed evaluator. One instance serves one agent task; variables
/// persist across the task's code blocks, while the operation counter and
/// print buffer reset per block.
pub struct Evaluator {
    config: EvaluatorConfig,
    dispatcher: Arc<dyn ToolDispatch>,
    globals: Scope,
    module_cache: Mutex<HashMap<String, Value>>,
    ops: AtomicU64,
    print_buffer: Mutex<String>,
    print_truncated: AtomicBool,
    cancelled: Arc<AtomicBool>,
}

impl Evaluator {
    /// Link an externally-owned cancellation flag (e.g. the agent's) in
    /// place of the evaluator's private one.
    pub fn with_cancellation_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    pub fn new(config: EvaluatorConfig, dispatcher: Arc<dyn ToolDispatch>) -> Self {
        Self {
            config,
            dispatcher,
            globals: Arc::new(Mutex::new(HashMap::new())),
            module_cache: Mutex::new(HashMap::new()),
            ops: AtomicU64::new(0),
            print_buffer: Mutex::new(String::new()),
            print_truncated: AtomicBool::new(false),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Seed user-global variables before a run (task symbols, prior state).
    pub fn send_variables(&self, variables: impl IntoIterator<Item = (String, Value)>) {
        let mut guard = self.globals.lock().unwrap_or_else(|p| p.into_inner());
        guard.extend(variables);
    }

    /// Read a user-global back out (e.g. for checkpointing).
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.globals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    /// Share a cancellation flag; when set, evaluation aborts at the next
    /// operation tick with a cancellation error.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Whether the last run's print output hit the cap (the prefix is
    /// preserved, the tail silently dropped).
    pub fn logs_truncated(&self) -> bool {
        self.print_truncated.load(Ordering::Relaxed)
    }

    /// Evaluate one code block. Returns the terminal value, the print
    /// logs, and the final-answer flag; parse failures, limit violations,
    /// and cancellation surface as crate errors.
    pub async fn run(&self, code: &str) -> Result<Execution> {
        let program = parser::parse(code)?;
        if program.body.is_empty() {
            return Err(Error::parse("empty code block"));
        }
        self.validate_imports(&program)?;

        self.ops.store(0, Ordering::Relaxed);
        self.print_buffer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        self.print_truncated.store(false, Ordering::Relaxed);

        let env = Env::frame(vec![Arc::clone(&self.globals)], None);

        // The final expression statement supplies the block's value; a
        // trailing non-expression statement leaves it at None.
        let mut last_value = Value::Null;
        let mut outcome: EvalOut<()> = Ok(());
        for stmt in &program.body {
            let step: EvalOut<()> = match stmt {
                Stmt::Expr(expr) => self.eval_expr(expr, &env).await.map(|value| {
                    last_value = value;
                }),
                _ => {
                    last_value = Value::Null;
                    match self.exec_stmt(stmt, &env).await {
                        Ok(Flow::Normal) => Ok(()),
                        Ok(_) => Err(exc(Exception::new(
                            "SyntaxError",
                            "'break', 'continue', or 'return' outside of loop or function",
                        ))),
                        Err(interrupt) => Err(interrupt),
                    }
                }
            };
            if let Err(interrupt) = step {
                outcome = Err(interrupt);
                break;
            }
        }

        let logs = self
            .print_buffer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        match outcome {
            Ok(()) => {
                if matches!(last_value, Value::Coroutine(_)) {
                    return Err(Error::interpreter(
                        "the final expression is an un-awaited coroutine; \
                         use `await` to resolve it before returning it",
                    ));
                }
                Ok(Execution {
                    value: last_value,
                    logs,
                    is_final_answer: false,
                })
            }
            Err(Interrupt::FinalAnswer(answer)) => Ok(Execution {
                value: answer,
                logs,
                is_final_answer: true,
            }),
            Err(Interrupt::Exception(e)) if e.kind == "ExecutionStopped" => {
                Err(Error::cancelled(e.message))
            }
            Err(Interrupt::Exception(e)) => Ok(Execution {
                value: Value::exception(e),
                logs,
                is_final_answer: false,
            }),
            Err(Interrupt::Fatal(err)) => Err(err),
        }
    }

    /// Reject unauthorized imports before any statement executes.
    fn validate_imports(&self, program: &Program) -> Result<()> {
        let mut stack: Vec<&Stmt> = program.body.iter().collect();
        while let Some(stmt) = stack.pop() {
            match stmt {
                Stmt::Import(modules) => {
                    for (module, _) in modules {
                        self.check_import(module)?;
                    }
                }
                Stmt::ImportFrom { module, .. } => self.check_import(module)?,
                Stmt::If { branches, orelse } => {
                    for (_, body) in branches {
                        stack.extend(body.iter());
                    }
                    stack.extend(orelse.iter());
                }
                Stmt::While { body, .. } | Stmt::For { body, .. } | Stmt::With { body, .. } => {
                    stack.extend(body.iter());
                }
                Stmt::FunctionDef(def) => stack.extend(def.body.iter()),
                Stmt::Try {
                    body,
                    handlers,
                    orelse,
                    finally,
                } => {
                    stack.extend(body.iter());
                    for handler in handlers {
                        stack.extend(handler.body.iter());
                    }
                    stack.extend(orelse.iter());
                    stack.extend(finally.iter());
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_import(&self, module: &str) -> Result<()> {
        let root = module.split('.').next().unwrap_or(module);
        if !self.config.authorized_imports.iter().any(|m| m == root) {
            return Err(Error::interpreter(format!(
                "import of '{root}' is not authorized; allowed modules: {}",
                self.config.authorized_imports.join(", ")
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Budget, logs, terminal value
    // ------------------------------------------------------------------

    fn tick(&self) -> EvalOut<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(Interrupt::Fatal(Error::cancelled(
                "evaluation cancelled by the agent",
            )));
        }
        let count = self.ops.fetch_add(1, Ordering::Relaxed) + 1;
        if count > self.config.max_operations {
            debug!(max_operations = self.config.max_operations, "operation budget exceeded");
            return Err(Interrupt::Fatal(Error::interpreter(format!(
                "operation budget of {} exceeded; simplify the code or reduce iteration counts",
                self.config.max_operations
            ))));
        }
        Ok(())
    }

    fn write_print(&self, text: &str) {
        let mut buffer = self.print_buffer.lock().unwrap_or_else(|p| p.into_inner());
        let cap = self.config.max_print_chars;
        if buffer.len() >= cap {
            self.print_truncated.store(true, Ordering::Relaxed);
            return;
        }
        let remaining = cap - buffer.len();
        if text.len() <= remaining {
            buffer.push_str(text);
        } else {
            // Keep the prefix, drop the tail, respecting char boundaries.
            let mut cut = remaining;
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            buffer.push_str(&text[..cut]);
            self.print_truncated.store(true, Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn exec_block<'a>(&'a self, stmts: &'a [Stmt], env: &'a Env) -> BoxFuture<'a, EvalOut<Flow>> {
        async move {
            for stmt in stmts {
                match self.exec_stmt(stmt, env).await? {
                    Flow::Normal => {}
                    other => return Ok(other),
                }
            }
            Ok(Flow::Normal)
        }
        .boxed()
    }

    fn exec_stmt<'a>(&'a self, stmt: &'a Stmt, env: &'a Env) -> BoxFuture<'a, EvalOut<Flow>> {
        async move {
            self.tick()?;
            match stmt {
                Stmt::Expr(expr) => {
                    self.eval_expr(expr, env).await?;
                    Ok(Flow::Normal)
                }
                Stmt::Assign { targets, value } => {
                    let value = self.eval_expr(value, env).await?;
                    for target in targets {
                        self.assign_target(target, value.clone(), env).await?;
                    }
                    Ok(Flow::Normal)
                }
                Stmt::AugAssign { target, op, value } => {
                    let current = self.eval_expr(target, env).await?;
                    let operand = self.eval_expr(value, env).await?;
                    // In-place semantics for mutable containers: the
                    // handle stays shared, only the contents change.
                    if *op == BinOp::Add {
                        if let Value::List(items) = &current {
                            let additions = iter_values(&operand).map_err(exc)?;
                            lock(items).extend(additions);
                            return Ok(Flow::Normal);
                        }
                    }
                    let combined = binary_op(*op, &current, &operand).map_err(exc)?;
                    self.assign_target(target, combined, env).await?;
                    Ok(Flow::Normal)
                }
                Stmt::AnnAssign { target, value } => {
                    if let Some(value) = value {
                        let value = self.eval_expr(value, env).await?;
                        self.assign_target(target, value, env).await?;
                    }
                    Ok(Flow::Normal)
                }
                Stmt::If { branches, orelse } => {
                    for (condition, body) in branches {
                        if self.eval_expr(condition, env).await?.is_truthy() {
                            return self.exec_block(body, env).await;
                        }
                    }
                    self.exec_block(orelse, env).await
                }
                Stmt::While { condition, body } => {
                    loop {
                        self.tick()?;
                        if !self.eval_expr(condition, env).await?.is_truthy() {
                            break;
                        }
                        match self.exec_block(body, env).await? {
                            Flow::Break => break,
                            Flow::Continue | Flow::Normal => {}
                            other => return Ok(other),
                        }
                    }
                    Ok(Flow::Normal)
                }
                Stmt::For {
                    target, iter, body, ..
                } => {
                    let iterable = self.eval_expr(iter, env).await?;
                    let items = iter_values(&iterable).map_err(exc)?;
                    for item in items {
                        self.tick()?;
                        self.assign_target(target, item, env).await?;
                        match self.exec_block(body, env).await? {
                            Flow::Break => break,
                            Flow::Continue | Flow::Normal => {}
                            other => return Ok(other),
                        }
                    }
                    Ok(Flow::Normal)
                }
                Stmt::FunctionDef(def) => {
                    let function = self.make_function(def, env).await?;
                    env.set(&def.name, function).map_err(exc)?;
                    Ok(Flow::Normal)
                }
                Stmt::Return(expr) => {
                    let value = match expr {
                        Some(expr) => self.eval_expr(expr, env).await?,
                        None => Value::Null,
                    };
                    Ok(Flow::Return(value))
                }
                Stmt::Break => Ok(Flow::Break),
                Stmt::Continue => Ok(Flow::Continue),
                Stmt::Pass => Ok(Flow::Normal),
                Stmt::Raise(expr) => {
                    let exception = match expr {
                        None => Exception::runtime_error("re-raise outside of except block"),
                        Some(expr) => self.exception_from_expr(expr, env).await?,
                    };
                    Err(exc(exception))
                }
                Stmt::Assert { condition, message } => {
                    if !self.eval_expr(condition, env).await?.is_truthy() {
                        let text = match message {
                            Some(message) => self.eval_expr(message, env).await?.py_str(),
                            None => String::new(),
                        };
                        return Err(exc(Exception::new("AssertionError", text)));
                    }
                    Ok(Flow::Normal)
                }
                Stmt::Try {
                    body,
                    handlers,
                    orelse,
                    finally,
                } => {
                    let result = self.exec_block(body, env).await;
                    let result = match result {
                        Err(Interrupt::Exception(exception))
                            if exception.kind != "ExecutionStopped" =>
                        {
                            match find_handler(handlers, &exception) {
                                Some(handler) => {
                                    if let Some(name) = &handler.name {
                                        env.set(name, Value::exception(exception.clone()))
                                            .map_err(exc)?;
                                    }
                                    self.exec_block(&handler.body, env).await
                                }
                                None => Err(Interrupt::Exception(exception)),
                            }
                        }
                        Ok(Flow::Normal) if !orelse.is_empty() => {
                            self.exec_block(orelse, env).await
                        }
                        other => other,
                    };
                    // `finally` runs on every path; its own interrupt wins.
                    if !finally.is_empty() {
                        match self.exec_block(finally, env).await? {
                            Flow::Normal => {}
                            other => return Ok(other),
                        }
                    }
                    result
                }
                Stmt::With { items, body, .. } => {
                    let mut entered: Vec<Value> = Vec::new();
                    for (ctx_expr, alias) in items {
                        let ctx = self.eval_expr(ctx_expr, env).await?;
                        match &ctx {
                            Value::Opaque(handle) => {
                                handle.0.enter().map_err(exc)?;
                            }
                            other => {
                                return Err(exc(Exception::type_error(format!(
                                    "'{}' object does not support the context manager protocol",
                                    other.type_name()
                                ))));
                            }
                        }
                        if let Some(alias) = alias {
                            env.set(alias, ctx.clone()).map_err(exc)?;
                        }
                        entered.push(ctx);
                    }
                    let result = self.exec_block(body, env).await;
                    for ctx in entered.iter().rev() {
                        if let Value::Opaque(handle) = ctx {
                            handle.0.exit().map_err(exc)?;
                        }
                    }
                    result
                }
                Stmt::Import(imports) => {
                    for (module, alias) in imports {
                        let root = module.split('.').next().unwrap_or(module);
                        let value = self.load_module(root)?;
                        let bind_as = alias.clone().unwrap_or_else(|| root.to_string());
                        env.set(&bind_as, value).map_err(exc)?;
                    }
                    Ok(Flow::Normal)
                }
                Stmt::ImportFrom { module, names } => {
                    let root = module.split('.').next().unwrap_or(module);
                    self.load_module(root)?;
                    for (name, alias) in names {
                        let value = modules::resolve_member(root, name).map_err(exc)?;
                        let bind_as = alias.clone().unwrap_or_else(|| name.clone());
                        env.set(&bind_as, value).map_err(exc)?;
                    }
                    Ok(Flow::Normal)
                }
                Stmt::Global(names) => {
                    let mut decls = env.global_decls.lock().unwrap_or_else(|p| p.into_inner());
                    decls.extend(names.iter().cloned());
                    Ok(Flow::Normal)
                }
                Stmt::Nonlocal(names) => {
                    let mut decls = env
                        .nonlocal_decls
                        .lock()
                        .unwrap_or_else(|p| p.into_inner());
                    decls.extend(names.iter().cloned());
                    Ok(Flow::Normal)
                }
            }
        }
        .boxed()
    }

    fn load_module(&self, root: &str) -> EvalOut<Value> {
        if !self.config.authorized_imports.iter().any(|m| m == root) {
            return Err(Interrupt::Fatal(Error::interpreter(format!(
                "import of '{root}' is not authorized"
            ))));
        }
        let mut cache = self.module_cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(module) = cache.get(root) {
            return Ok(module.clone());
        }
        match modules::resolve(root) {
            Some(module) => {
                cache.insert(root.to_string(), module.clone());
                Ok(module)
            }
            None => Err(exc(Exception::import_error(format!(
                "authorized module '{root}' has no sandbox implementation"
            )))),
        }
    }

    async fn exception_from_expr(&self, expr: &Expr, env: &Env) -> EvalOut<Exception> {
        // `raise ValueError("msg")` and `raise ValueError` name exception
        // classes that are not bound values, so they are interpreted
        // structurally rather than evaluated.
        match expr {
            Expr::Name(kind) if !is_bound(env, kind) => Ok(Exception::new(kind.clone(), "")),
            Expr::Call { func, args } => {
                if let Expr::Name(kind) = func.as_ref() {
                    if !is_bound(env, kind) {
                        let mut message = String::new();
                        let mut payload = None;
                        for (i, arg) in args.iter().enumerate() {
                            if let CallArg::Positional(arg_expr) = arg {
                                let value = self.eval_expr(arg_expr, env).await?;
                                if i == 0 {
                                    message = value.py_str();
                                } else {
                                    payload = Some(Box::new(value));
                                }
                            }
                        }
                        return Ok(Exception {
                            kind: kind.clone(),
                            message,
                            payload,
                        });
                    }
                }
                let value = self.eval_expr(expr, env).await?;
                exception_from_value(value)
            }
            _ => {
                let value = self.eval_expr(expr, env).await?;
                exception_from_value(value)
            }
        }
    }

    // ------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------

    fn assign_target<'a>(
        &'a self,
        target: &'a Expr,
        value: Value,
        env: &'a Env,
    ) -> BoxFuture<'a, EvalOut<()>> {
        async move {
            match target {
                Expr::Name(name) => env.set(name, value).map_err(exc),
                Expr::Tuple(targets) | Expr::List(targets) => {
                    self.unpack(targets, value, env).await
                }
                Expr::Subscript { value: base, index } => {
                    let base = self.eval_expr(base, env).await?;
                    let index = self.eval_expr(index, env).await?;
                    match &base {
                        Value::List(items) => {
                            let mut guard = lock(items);
                            let len = guard.len() as i64;
                            let i = normalize_index(&index, len).map_err(exc)?;
                            guard[i] = value;
                            Ok(())
                        }
                        Value::Map(entries) => {
                            if !index.is_hashable() {
                                return Err(exc(Exception::type_error(format!(
                                    "unhashable type: '{}'",
                                    index.type_name()
                                ))));
                            }
                            let mut guard = lock_map(entries);
                            map_insert(&mut guard, index, value);
                            Ok(())
                        }
                        other => Err(exc(Exception::type_error(format!(
                            "'{}' object does not support item assignment",
                            other.type_name()
                        )))),
                    }
                }
                Expr::Attribute { .. } => Err(exc(Exception::type_error(
                    "attribute assignment is not supported in this environment",
                ))),
                Expr::Starred(_) => Err(exc(Exception::new(
                    "SyntaxError",
                    "starred assignment target must be in a list or tuple",
                ))),
                _ => Err(exc(Exception::new(
                    "SyntaxError",
                    "invalid assignment target",
                ))),
            }
        }
        .boxed()
    }

    /// Iterable unpacking with at most one starred target:
    /// `a, b = pair`, `[head, *rest, tail] = items`.
    async fn unpack(&self, targets: &[Expr], value: Value, env: &Env) -> EvalOut<()> {
        let items = iter_values(&value).map_err(exc)?;
        let star_pos = targets
            .iter()
            .position(|t| matches!(t, Expr::Starred(_)));

        match star_pos {
            None => {
                if items.len() != targets.len() {
                    return Err(exc(Exception::value_error(format!(
                        "expected {} values to unpack, got {}",
                        targets.len(),
                        items.len()
                    ))));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign_target(target, item, env).await?;
                }
                Ok(())
            }
            Some(star) => {
                let after = targets.len() - star - 1;
                if items.len() < star + after {
                    return Err(exc(Exception::value_error(format!(
                        "not enough values to unpack (expected at least {}, got {})",
                        star + after,
                        items.len()
                    ))));
                }
                for (target, item) in targets[..star].iter().zip(items.iter()) {
                    self.assign_target(target, item.clone(), env).await?;
                }
                let middle = items[star..items.len() - after].to_vec();
                if let Expr::Starred(inner) = &targets[star] {
                    self.assign_target(inner, Value::list(middle), env).await?;
                }
                for (target, item) in targets[star + 1..]
                    .iter()
                    .zip(items[items.len() - after..].iter())
                {
                    self.assign_target(target, item.clone(), env).await?;
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn eval_expr<'a>(&'a self, expr: &'a Expr, env: &'a Env) -> BoxFuture<'a, EvalOut<Value>> {
        async move {
            self.tick()?;
            match expr {
                Expr::Literal(literal) => Ok(literal_value(literal)),
                Expr::Name(name) => self.resolve_name(name, env),
                Expr::Tuple(items) => {
                    let values = self.eval_sequence(items, env).await?;
                    Ok(Value::Tuple(Arc::new(values)))
                }
                Expr::List(items) => {
                    let values = self.eval_sequence(items, env).await?;
                    Ok(Value::list(values))
                }
                Expr::Set(items) => {
                    let mut values = Vec::new();
                    for item in items {
                        values.push(self.eval_expr(item, env).await?);
                    }
                    Ok(Value::set(values))
                }
                Expr::Dict(entries) => {
                    let mut pairs = Vec::new();
                    for (key_expr, value_expr) in entries {
                        let key = self.eval_expr(key_expr, env).await?;
                        if !key.is_hashable() {
                            return Err(exc(Exception::type_error(format!(
                                "unhashable type: '{}'",
                                key.type_name()
                            ))));
                        }
                        let value = self.eval_expr(value_expr, env).await?;
                        pairs.push((key, value));
                    }
                    let mut entries = Vec::new();
                    for (k, v) in pairs {
                        map_insert(&mut entries, k, v);
                    }
                    Ok(Value::map(entries))
                }
                Expr::ListComp { element, generators } => {
                    let mut out = Vec::new();
                    self.run_comprehension(
                        generators,
                        0,
                        &env.child(),
                        CompProduce::Element(element),
                        &mut out,
                    )
                    .await?;
                    Ok(Value::list(out))
                }
                Expr::SetComp { element, generators } => {
                    let mut out = Vec::new();
                    self.run_comprehension(
                        generators,
                        0,
                        &env.child(),
                        CompProduce::Element(element),
                        &mut out,
                    )
                    .await?;
                    Ok(Value::set(out))
                }
                Expr::DictComp {
                    key,
                    value,
                    generators,
                } => {
                    let mut out = Vec::new();
                    self.run_comprehension(
                        generators,
                        0,
                        &env.child(),
                        CompProduce::KeyValue(key, value),
                        &mut out,
                    )
                    .await?;
                    let mut entries = Vec::new();
                    for pair in out {
                        if let Value::Tuple(kv) = pair {
                            if !kv[0].is_hashable() {
                                return Err(exc(Exception::type_error(format!(
                                    "unhashable type: '{}'",
                                    kv[0].type_name()
                                ))));
                            }
                            map_insert(&mut entries, kv[0].clone(), kv[1].clone());
                        }
                    }
                    Ok(Value::map(entries))
                }
                Expr::FString(parts) => {
                    let mut out = String::new();
                    for part in parts {
                        match part {
                            FStringPart::Literal(text) => out.push_str(text),
                            FStringPart::Expr { expr, spec, repr } => {
                                let value = self.eval_expr(expr, env).await?;
                                let rendered = if *repr {
                                    value.py_repr()
                                } else {
                                    value.py_str()
                                };
                                out.push_str(&apply_format_spec(&rendered, &value, spec.as_deref()));
                            }
                        }
                    }
                    Ok(Value::Str(out))
                }
                Expr::Unary { op, operand } => {
                    let value = self.eval_expr(operand, env).await?;
                    unary_op(*op, &value).map_err(exc)
                }
                Expr::Binary { op, left, right } => {
                    let left = self.eval_expr(left, env).await?;
                    let right = self.eval_expr(right, env).await?;
                    binary_op(*op, &left, &right).map_err(exc)
                }
                Expr::BoolOp { op, values } => {
                    // Short-circuit, returning the deciding operand like
                    // Python (`a or b` yields a when a is truthy).
                    for value_expr in &values[..values.len() - 1] {
                        let value = self.eval_expr(value_expr, env).await?;
                        let truthy = value.is_truthy();
                        let short_circuit = match op {
                            BoolOpKind::And => !truthy,
                            BoolOpKind::Or => truthy,
                        };
                        if short_circuit {
                            return Ok(value);
                        }
                    }
                    self.eval_expr(values.last().expect("bool op has operands"), env)
                        .await
                }
                Expr::Compare {
                    left,
                    ops,
                    comparators,
                } => {
                    let mut current = self.eval_expr(left, env).await?;
                    for (op, comparator) in ops.iter().zip(comparators) {
                        let next = self.eval_expr(comparator, env).await?;
                        if !compare_op(*op, &current, &next).map_err(exc)? {
                            return Ok(Value::Bool(false));
                        }
                        current = next;
                    }
                    Ok(Value::Bool(true))
                }
                Expr::Call { func, args } => self.eval_call(func, args, env).await,
                Expr::Attribute { value, attr } => {
                    let base = self.eval_expr(value, env).await?;
                    self.eval_attribute(base, attr)
                }
                Expr::Subscript { value, index } => {
                    let base = self.eval_expr(value, env).await?;
                    match index.as_ref() {
                        Expr::Slice { lower, upper, step } => {
                            let lower = self.eval_opt_index(lower, env).await?;
                            let upper = self.eval_opt_index(upper, env).await?;
                            let step = self.eval_opt_index(step, env).await?;
                            slice_value(&base, lower, upper, step).map_err(exc)
                        }
                        _ => {
                            let index = self.eval_expr(index, env).await?;
                            subscript_value(&base, &index).map_err(exc)
                        }
                    }
                }
                Expr::Slice { .. } => Err(exc(Exception::new(
                    "SyntaxError",
                    "slice is only valid inside a subscript",
                ))),
                Expr::Lambda { params, body } => {
                    let mut defaults = Vec::new();
                    for param in &params.positional {
                        match &param.default {
                            Some(default) => {
                                defaults.push(Some(self.eval_expr(default, env).await?))
                            }
                            None => defaults.push(None),
                        }
                    }
                    Ok(Value::Callable(Callable::Function(Arc::new(UserFunction {
                        name: "<lambda>".to_string(),
                        params: params.clone(),
                        body: FunctionBody::Lambda(Arc::new(body.as_ref().clone())),
                        defaults,
                        closure: env.scopes.clone(),
                        is_async: false,
                        is_generator: false,
                    }))))
                }
                Expr::IfExp {
                    condition,
                    then,
                    orelse,
                } => {
                    if self.eval_expr(condition, env).await?.is_truthy() {
                        self.eval_expr(then, env).await
                    } else {
                        self.eval_expr(orelse, env).await
                    }
                }
                Expr::Await(operand) => {
                    let value = self.eval_expr(operand, env).await?;
                    match value {
                        Value::Coroutine(coroutine) => {
                            coroutine.resolve().await.map_err(exc)
                        }
                        // Top-level `await` on an already-resolved value is
                        // tolerated: sync tools return plain values and the
                        // model is told to always await tool calls.
                        other => Ok(other),
                    }
                }
                Expr::Yield(operand) => match &env.yield_sink {
                    Some(sink) => {
                        let value = match operand {
                            Some(operand) => self.eval_expr(operand, env).await?,
                            None => Value::Null,
                        };
                        sink.lock().unwrap_or_else(|p| p.into_inner()).push(value);
                        Ok(Value::Null)
                    }
                    None => Err(exc(Exception::new(
                        "SyntaxError",
                        "'yield' outside of a function",
                    ))),
                },
                Expr::Starred(_) => Err(exc(Exception::new(
                    "SyntaxError",
                    "starred expression is only valid in calls and assignments",
                ))),
            }
        }
        .boxed()
    }

    /// Evaluate a display sequence, splicing starred elements.
    async fn eval_sequence(&self, items: &[Expr], env: &Env) -> EvalOut<Vec<Value>> {
        let mut values = Vec::new();
        for item in items {
            match item {
                Expr::Starred(inner) => {
                    let splice = self.eval_expr(inner, env).await?;
                    values.extend(iter_values(&splice).map_err(exc)?);
                }
                _ => values.push(self.eval_expr(item, env).await?),
            }
        }
        Ok(values)
    }

    async fn eval_opt_index(
        &self,
        expr: &Option<Box<Expr>>,
        env: &Env,
    ) -> EvalOut<Option<i64>> {
        match expr {
            None => Ok(None),
            Some(expr) => match self.eval_expr(expr, env).await? {
                Value::Int(i) => Ok(Some(i)),
                Value::Null => Ok(None),
                other => Err(exc(Exception::type_error(format!(
                    "slice indices must be integers, not '{}'",
                    other.type_name()
                )))),
            },
        }
    }

    fn resolve_name(&self, name: &str, env: &Env) -> EvalOut<Value> {
        // (i) local frame, (ii) enclosing frames, (iii) user globals  - 
        // all covered by the scope chain walk.
        if let Some(value) = env.get(name) {
            return Ok(value);
        }
        // (iv) frozen builtin table.
        if builtins::is_builtin(name) {
            return Ok(Value::Callable(Callable::Builtin(
                builtins::BUILTIN_NAMES
                    .iter()
                    .find(|n| **n == name)
                    .copied()
                    .unwrap_or("str"),
            )));
        }
        // (v) tool namespace (sanitized aliases included).
        if let Some(tool) = self.dispatcher.lookup(name) {
            return Ok(Value::Callable(Callable::Tool(tool)));
        }
        Err(exc(Exception::name_error(format!(
            "name '{name}' is not defined"
        ))))
    }

    fn eval_attribute(&self, base: Value, attr: &str) -> EvalOut<Value> {
        match &base {
            Value::Opaque(handle) => handle.0.get_attr(attr).ok_or_else(|| {
                exc(Exception::attribute_error(format!(
                    "'{}' object has no attribute '{attr}'",
                    handle.0.type_name()
                )))
            }),
            Value::Exception(exception) => match attr {
                "kind" => Ok(Value::Str(exception.kind.clone())),
                "message" => Ok(Value::Str(exception.message.clone())),
                "payload" => Ok(exception
                    .payload
                    .as_ref()
                    .map(|p| p.as_ref().clone())
                    .unwrap_or(Value::Null)),
                _ => Err(exc(Exception::attribute_error(format!(
                    "'exception' object has no attribute '{attr}'"
                )))),
            },
            _ => Ok(Value::Callable(Callable::BoundMethod {
                receiver: Box::new(base),
                method: attr.to_string(),
            })),
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    async fn eval_call(&self, func: &Expr, args: &[CallArg], env: &Env) -> EvalOut<Value> {
        // The final-answer sentinel short-circuits before dispatch.
        if let Expr::Name(name) = func {
            if name == crate::tools::FINAL_ANSWER_TOOL_NAME && env.get(name).is_none() {
                let (positional, keywords) = self.eval_call_args(args, env).await?;
                let answer = keywords
                    .iter()
                    .find(|(k, _)| k == "answer")
                    .map(|(_, v)| v.clone())
                    .or_else(|| positional.first().cloned())
                    .unwrap_or(Value::Null);
                return Err(Interrupt::FinalAnswer(answer));
            }
        }

        let callee = self.eval_expr(func, env).await?;
        let (positional, keywords) = self.eval_call_args(args, env).await?;

        let callable = match callee {
            Value::Callable(callable) => callable,
            other => {
                return Err(exc(Exception::type_error(format!(
                    "'{}' object is not callable",
                    other.type_name()
                ))));
            }
        };

        match callable {
            Callable::Tool(tool) => {
                if tool.name() == crate::tools::FINAL_ANSWER_TOOL_NAME {
                    let answer = keywords
                        .iter()
                        .find(|(k, _)| k == "answer")
                        .map(|(_, v)| v.clone())
                        .or_else(|| positional.first().cloned())
                        .unwrap_or(Value::Null);
                    return Err(Interrupt::FinalAnswer(answer));
                }
                if !positional.is_empty() {
                    return Err(exc(Exception::type_error(format!(
                        "tool '{}' requires keyword arguments, e.g. {}(param=value)",
                        tool.name(),
                        tool.name()
                    ))));
                }
                let mut arguments = serde_json::Map::new();
                for (key, value) in keywords {
                    arguments.insert(key, value.to_json());
                }
                let call_id = uuid::Uuid::new_v4().to_string();
                let name = tool.name().to_string();
                let future =
                    self.dispatcher
                        .dispatch(tool.clone(), serde_json::Value::Object(arguments), call_id);
                if tool.is_async() {
                    Ok(Value::Coroutine(Coroutine::pending(name, future)))
                } else {
                    // Synchronous tools resolve inline; hooks still run.
                    Coroutine::pending(name, future).resolve().await.map_err(exc)
                }
            }
            Callable::Builtin(name) => self.call_builtin(name, positional, keywords, env).await,
            Callable::Function(function) => {
                self.call_function(function, positional, keywords).await
            }
            Callable::BoundMethod { receiver, method } => {
                self.call_method(&receiver, &method, positional, keywords)
                    .await
            }
        }
    }

    async fn eval_call_args(
        &self,
        args: &[CallArg],
        env: &Env,
    ) -> EvalOut<(Vec<Value>, Vec<(String, Value)>)> {
        let mut positional = Vec::new();
        let mut keywords = Vec::new();
        for arg in args {
            match arg {
                CallArg::Positional(expr) => positional.push(self.eval_expr(expr, env).await?),
                CallArg::Keyword(name, expr) => {
                    keywords.push((name.clone(), self.eval_expr(expr, env).await?))
                }
                CallArg::Star(expr) => {
                    let splice = self.eval_expr(expr, env).await?;
                    positional.extend(iter_values(&splice).map_err(exc)?);
                }
                CallArg::DoubleStar(expr) => {
                    let mapping = self.eval_expr(expr, env).await?;
                    match &mapping {
                        Value::Map(entries) => {
                            for (key, value) in lock_map(entries).iter() {
                                keywords.push((key.py_str(), value.clone()));
                            }
                        }
                        other => {
                            return Err(exc(Exception::type_error(format!(
                                "argument after ** must be a mapping, not '{}'",
                                other.type_name()
                            ))));
                        }
                    }
                }
            }
        }
        Ok((positional, keywords))
    }

    async fn call_builtin(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        _env: &Env,
    ) -> EvalOut<Value> {
        let kwarg = |key: &str| kwargs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());

        match name {
            "print" => {
                let sep = match kwarg("sep") {
                    Some(Value::Str(s)) => s,
                    _ => " ".to_string(),
                };
                let end = match kwarg("end") {
                    Some(Value::Str(s)) => s,
                    _ => "\n".to_string(),
                };
                let text = args
                    .iter()
                    .map(Value::py_str)
                    .collect::<Vec<_>>()
                    .join(&sep);
                self.write_print(&(text + &end));
                Ok(Value::Null)
            }
            "isinstance" => {
                let value = args
                    .first()
                    .ok_or_else(|| exc(Exception::type_error("isinstance() requires two arguments")))?;
                let spec = args
                    .get(1)
                    .ok_or_else(|| exc(Exception::type_error("isinstance() requires two arguments")))?;
                isinstance_check(value, spec).map(Value::Bool).map_err(exc)
            }
            "map" => {
                let function = args
                    .first()
                    .cloned()
                    .ok_or_else(|| exc(Exception::type_error("map() requires a function")))?;
                let items = iter_values(
                    args.get(1)
                        .ok_or_else(|| exc(Exception::type_error("map() requires an iterable")))?,
                )
                .map_err(exc)?;
                let mut out = Vec::new();
                for item in items {
                    out.push(self.call_value(&function, vec![item]).await?);
                }
                Ok(Value::list(out))
            }
            "filter" => {
                let function = args
                    .first()
                    .cloned()
                    .ok_or_else(|| exc(Exception::type_error("filter() requires a function")))?;
                let items = iter_values(
                    args.get(1)
                        .ok_or_else(|| exc(Exception::type_error("filter() requires an iterable")))?,
                )
                .map_err(exc)?;
                let mut out = Vec::new();
                for item in items {
                    let keep = match &function {
                        Value::Null => item.is_truthy(),
                        _ => self.call_value(&function, vec![item.clone()]).await?.is_truthy(),
                    };
                    if keep {
                        out.push(item);
                    }
                }
                Ok(Value::list(out))
            }
            "sorted" => {
                let items = iter_values(
                    args.first()
                        .ok_or_else(|| exc(Exception::type_error("sorted() requires an iterable")))?,
                )
                .map_err(exc)?;
                let reverse = kwarg("reverse").map(|v| v.is_truthy()).unwrap_or(false);
                let mut keyed: Vec<(Value, Value)> = Vec::with_capacity(items.len());
                match kwarg("key") {
                    Some(key_fn) => {
                        for item in items {
                            let key = self.call_value(&key_fn, vec![item.clone()]).await?;
                            keyed.push((key, item));
                        }
                    }
                    None => {
                        for item in items {
                            keyed.push((item.clone(), item));
                        }
                    }
                }
                let mut failure: Option<Exception> = None;
                keyed.sort_by(|(a, _), (b, _)| match py_cmp(a, b) {
                    Ok(ordering) => ordering,
                    Err(e) => {
                        failure.get_or_insert(e);
                        std::cmp::Ordering::Equal
                    }
                });
                if let Some(e) = failure {
                    return Err(exc(e));
                }
                if reverse {
                    keyed.reverse();
                }
                Ok(Value::list(keyed.into_iter().map(|(_, v)| v).collect()))
            }
            "max" | "min" => {
                let items = if args.len() == 1 {
                    iter_values(&args[0]).map_err(exc)?
                } else {
                    args
                };
                if items.is_empty() {
                    if let Some(default) = kwarg("default") {
                        return Ok(default);
                    }
                    return Err(exc(Exception::value_error(format!(
                        "{name}() arg is an empty sequence"
                    ))));
                }
                let key_fn = kwarg("key");
                let mut best = items[0].clone();
                let mut best_key = match &key_fn {
                    Some(f) => self.call_value(f, vec![best.clone()]).await?,
                    None => best.clone(),
                };
                for item in items.into_iter().skip(1) {
                    let key = match &key_fn {
                        Some(f) => self.call_value(f, vec![item.clone()]).await?,
                        None => item.clone(),
                    };
                    let ordering = py_cmp(&key, &best_key).map_err(exc)?;
                    let better = if name == "max" {
                        ordering == std::cmp::Ordering::Greater
                    } else {
                        ordering == std::cmp::Ordering::Less
                    };
                    if better {
                        best = item;
                        best_key = key;
                    }
                }
                Ok(best)
            }
            "gather" => {
                // Concurrent resolution of multiple pending tool calls on
                // the current scheduler.
                let mut pending = Vec::new();
                for arg in &args {
                    match arg {
                        Value::Coroutine(coroutine) => pending.push(coroutine.clone()),
                        other => {
                            return Err(exc(Exception::type_error(format!(
                                "gather() expects coroutines, got '{}'",
                                other.type_name()
                            ))));
                        }
                    }
                }
                let results =
                    futures::future::join_all(pending.iter().map(|c| c.resolve())).await;
                let mut out = Vec::new();
                for result in results {
                    out.push(result.map_err(exc)?);
                }
                Ok(Value::list(out))
            }
            _ => match builtins::call_pure(name, &args) {
                Some(result) => result.map_err(exc),
                None => Err(exc(Exception::type_error(format!(
                    "{name}() got unsupported arguments"
                )))),
            },
        }
    }

    /// Invoke any callable value with positional arguments (used by
    /// `map`/`filter`/`sorted` and comprehension helpers).
    fn call_value<'a>(
        &'a self,
        callable: &'a Value,
        args: Vec<Value>,
    ) -> BoxFuture<'a, EvalOut<Value>> {
        async move {
            match callable {
                Value::Callable(Callable::Function(function)) => {
                    self.call_function(function.clone(), args, Vec::new()).await
                }
                Value::Callable(Callable::Builtin(name)) => {
                    self.call_builtin(
                        name,
                        args,
                        Vec::new(),
                        &Env::frame(vec![Arc::clone(&self.globals)], None),
                    )
                    .await
                }
                Value::Callable(Callable::BoundMethod { receiver, method }) => {
                    self.call_method(receiver, method, args, Vec::new()).await
                }
                Value::Callable(Callable::Tool(tool)) => Err(exc(Exception::type_error(format!(
                    "tool '{}' requires keyword arguments and cannot be used as a key function",
                    tool.name()
                )))),
                other => Err(exc(Exception::type_error(format!(
                    "'{}' object is not callable",
                    other.type_name()
                )))),
            }
        }
        .boxed()
    }

    async fn call_method(
        &self,
        receiver: &Value,
        method: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalOut<Value> {
        // `list.sort` may carry a key function, so the evaluator owns it.
        if let Value::List(items) = receiver {
            if method == "sort" {
                let kwarg =
                    |key: &str| kwargs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
                let snapshot = lock(items).clone();
                let sorted = self
                    .call_builtin(
                        "sorted",
                        vec![Value::list(snapshot)],
                        vec![
                            ("key".to_string(), kwarg("key").unwrap_or(Value::Null)),
                            (
                                "reverse".to_string(),
                                kwarg("reverse").unwrap_or(Value::Bool(false)),
                            ),
                        ]
                        .into_iter()
                        .filter(|(_, v)| !matches!(v, Value::Null))
                        .collect(),
                        &Env::frame(vec![Arc::clone(&self.globals)], None),
                    )
                    .await?;
                if let Value::List(sorted_items) = sorted {
                    *lock(items) = lock(&sorted_items).clone();
                }
                return Ok(Value::Null);
            }
        }

        match builtins::call_method(receiver, method, &args) {
            Some(result) => result.map_err(exc),
            None => Err(exc(Exception::attribute_error(format!(
                "'{}' object has no attribute '{method}'",
                receiver.type_name()
            )))),
        }
    }

    async fn make_function(&self, def: &Arc<FunctionDef>, env: &Env) -> EvalOut<Value> {
        let mut defaults = Vec::new();
        for param in &def.params.positional {
            match &param.default {
                Some(default) => defaults.push(Some(self.eval_expr(default, env).await?)),
                None => defaults.push(None),
            }
        }
        Ok(Value::Callable(Callable::Function(Arc::new(UserFunction {
            name: def.name.clone(),
            params: def.params.clone(),
            body: FunctionBody::Block(Arc::clone(def)),
            defaults,
            closure: env.scopes.clone(),
            is_async: def.is_async,
            is_generator: def.is_generator,
        }))))
    }

    async fn call_function(
        &self,
        function: Arc<UserFunction>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> EvalOut<Value> {
        let frame: Scope = Arc::new(Mutex::new(HashMap::new()));
        self.bind_params(&function, args, kwargs, &frame)?;

        let mut scopes = function.closure.clone();
        scopes.push(frame);

        let yield_sink = if function.is_generator {
            Some(Arc::new(Mutex::new(Vec::new())))
        } else {
            None
        };
        let env = Env::frame(scopes, yield_sink.clone());

        let result = match &function.body {
            FunctionBody::Lambda(expr) => self.eval_expr(expr, &env).await?,
            FunctionBody::Block(def) => match self.exec_block(&def.body, &env).await? {
                Flow::Return(value) => value,
                Flow::Normal => Value::Null,
                Flow::Break | Flow::Continue => {
                    return Err(exc(Exception::new(
                        "SyntaxError",
                        "'break' or 'continue' outside of loop",
                    )));
                }
            },
        };

        if let Some(sink) = yield_sink {
            // Generators buffer their yields eagerly; iteration happens
            // over the collected sequence. The operation budget bounds
            // runaway generators.
            let yielded = sink.lock().unwrap_or_else(|p| p.into_inner()).clone();
            return Ok(Value::list(yielded));
        }

        if function.is_async {
            // Async functions evaluate eagerly on the current scheduler;
            // the coroutine wrapper keeps `await f()` meaningful.
            return Ok(Value::Coroutine(Coroutine::ready(
                function.name.clone(),
                result,
            )));
        }
        Ok(result)
    }

    fn bind_params(
        &self,
        function: &UserFunction,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        frame: &Scope,
    ) -> EvalOut<()> {
        let mut frame = frame.lock().unwrap_or_else(|p| p.into_inner());
        let params = &function.params;
        let mut args = args.into_iter();
        let mut used_keywords: HashSet<String> = HashSet::new();

        for (i, param) in params.positional.iter().enumerate() {
            if let Some(value) = args.next() {
                frame.insert(param.name.clone(), value);
                continue;
            }
            if let Some((_, value)) = kwargs.iter().find(|(k, _)| *k == param.name) {
                used_keywords.insert(param.name.clone());
                frame.insert(param.name.clone(), value.clone());
                continue;
            }
            if let Some(Some(default)) = function.defaults.get(i) {
                frame.insert(param.name.clone(), default.clone());
                continue;
            }
            return Err(exc(Exception::type_error(format!(
                "{}() missing required argument: '{}'",
                function.name, param.name
            ))));
        }

        let rest: Vec<Value> = args.collect();
        match &params.vararg {
            Some(name) => {
                frame.insert(name.clone(), Value::Tuple(Arc::new(rest)));
            }
            None if !rest.is_empty() => {
                return Err(exc(Exception::type_error(format!(
                    "{}() takes {} positional arguments but more were given",
                    function.name,
                    params.positional.len()
                ))));
            }
            None => {}
        }

        let extra: Vec<(String, Value)> = kwargs
            .into_iter()
            .filter(|(k, _)| !used_keywords.contains(k))
            .collect();
        match &params.kwarg {
            Some(name) => {
                let entries = extra
                    .into_iter()
                    .map(|(k, v)| (Value::Str(k), v))
                    .collect();
                frame.insert(name.clone(), Value::map(entries));
            }
            None => {
                if let Some((unknown, _)) = extra.first() {
                    return Err(exc(Exception::type_error(format!(
                        "{}() got an unexpected keyword argument '{unknown}'",
                        function.name
                    ))));
                }
            }
        }
        Ok(())
    }

    /// Depth-first nested-generator execution for comprehensions.
    fn run_comprehension<'a>(
        &'a self,
        generators: &'a [Comprehension],
        depth: usize,
        env: &'a Env,
        produce: CompProduce<'a>,
        out: &'a mut Vec<Value>,
    ) -> BoxFuture<'a, EvalOut<()>> {
        async move {
            if depth == generators.len() {
                let value = match produce {
                    CompProduce::Element(element) => self.eval_expr(element, env).await?,
                    CompProduce::KeyValue(key, value) => {
                        let k = self.eval_expr(key, env).await?;
                        let v = self.eval_expr(value, env).await?;
                        Value::Tuple(Arc::new(vec![k, v]))
                    }
                };
                out.push(value);
                return Ok(());
            }
            let generator = &generators[depth];
            let iterable = self.eval_expr(&generator.iter, env).await?;
            let items = iter_values(&iterable).map_err(exc)?;
            'outer: for item in items {
                self.tick()?;
                self.assign_target(&generator.target, item, env).await?;
                for condition in &generator.conditions {
                    if !self.eval_expr(condition, env).await?.is_truthy() {
                        continue 'outer;
                    }
                }
                self.run_comprehension(generators, depth + 1, env, produce, out)
                    .await?;
            }
            Ok(())
        }
        .boxed()
    }
}

/// What a comprehension yields at its innermost level.
#[derive(Clone, Copy)]
enum CompProduce<'a> {
    Element(&'a Expr),
    KeyValue(&'a Expr, &'a Expr),
}

fn is_bound(env: &Env, name: &str) -> bool {
    env.get(name).is_some()
}

fn exception_from_value(value: Value) -> EvalOut<Exception> {
    match value {
        Value::Exception(exception) => Ok(exception.as_ref().clone()),
        Value::Str(message) => Ok(Exception::runtime_error(message)),
        other => Err(exc(Exception::type_error(format!(
            "exceptions must derive from BaseException, got '{}'",
            other.type_name()
        )))),
    }
}

fn find_handler<'a>(
    handlers: &'a [ExceptHandler],
    exception: &Exception,
) -> Option<&'a ExceptHandler> {
    handlers.iter().find(|handler| {
        handler.kinds.is_empty()
            || handler.kinds.iter().any(|kind| {
                kind == &exception.kind || kind == "Exception" || kind == "BaseException"
            })
    })
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::None => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Int(*i),
        Literal::Float(f) => Value::Float(*f),
        Literal::Str(s) => Value::Str(s.clone()),
        Literal::Bytes(b) => Value::Bytes(b.clone()),
    }
}

fn isinstance_check(value: &Value, spec: &Value) -> std::result::Result<bool, Exception> {
    match spec {
        Value::Tuple(specs) => {
            for spec in specs.iter() {
                if isinstance_check(value, spec)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Callable(Callable::Builtin(type_name)) => Ok(matches!(
            (*type_name, value),
            ("int", Value::Int(_))
                | ("bool", Value::Bool(_))
                | ("float", Value::Float(_))
                | ("str", Value::Str(_))
                | ("list", Value::List(_))
                | ("tuple", Value::Tuple(_))
                | ("set", Value::Set(_))
                | ("dict", Value::Map(_))
        )),
        other => Err(Exception::type_error(format!(
            "isinstance() arg 2 must be a type or tuple of types, not '{}'",
            other.type_name()
        ))),
    }
}

// ----------------------------------------------------------------------
// Operators (shared with builtins for sum/pow)
// ----------------------------------------------------------------------

pub(crate) fn numeric_add(a: &Value, b: &Value) -> std::result::Result<Value, Exception> {
    binary_op(BinOp::Add, a, b)
}

pub(crate) fn numeric_pow(a: &Value, b: &Value) -> std::result::Result<Value, Exception> {
    binary_op(BinOp::Pow, a, b)
}

fn unary_op(op: UnaryOp, value: &Value) -> std::result::Result<Value, Exception> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
        UnaryOp::Neg => match value {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Bool(b) => Ok(Value::Int(if *b { -1 } else { 0 })),
            other => Err(Exception::type_error(format!(
                "bad operand type for unary -: '{}'",
                other.type_name()
            ))),
        },
        UnaryOp::Pos => match value {
            Value::Int(_) | Value::Float(_) => Ok(value.clone()),
            Value::Bool(b) => Ok(Value::Int(if *b { 1 } else { 0 })),
            other => Err(Exception::type_error(format!(
                "bad operand type for unary +: '{}'",
                other.type_name()
            ))),
        },
        UnaryOp::Invert => match value {
            Value::Int(i) => Ok(Value::Int(!i)),
            other => Err(Exception::type_error(format!(
                "bad operand type for unary ~: '{}'",
                other.type_name()
            ))),
        },
    }
}

fn binary_op(op: BinOp, left: &Value, right: &Value) -> std::result::Result<Value, Exception> {
    use BinOp::*;

    let type_error = || {
        Exception::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))
    };

    match op {
        Add => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_add(*b)
                .map(Value::Int)
                .ok_or_else(|| Exception::new("OverflowError", "integer addition overflow")),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a.clone() + b)),
            (Value::List(a), Value::List(b)) => {
                let mut items = lock(a).clone();
                items.extend(lock(b).iter().cloned());
                Ok(Value::list(items))
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                let mut items = a.as_ref().clone();
                items.extend(b.iter().cloned());
                Ok(Value::Tuple(Arc::new(items)))
            }
            _ => match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => Ok(Value::Float(a + b)),
                _ => Err(type_error()),
            },
        },
        Sub => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_sub(*b)
                .map(Value::Int)
                .ok_or_else(|| Exception::new("OverflowError", "integer subtraction overflow")),
            _ => match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => Ok(Value::Float(a - b)),
                _ => Err(type_error()),
            },
        },
        Mul => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_mul(*b)
                .map(Value::Int)
                .ok_or_else(|| Exception::new("OverflowError", "integer multiplication overflow")),
            (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => {
                Ok(Value::Str(s.repeat((*n).max(0) as usize)))
            }
            (Value::List(items), Value::Int(n)) | (Value::Int(n), Value::List(items)) => {
                let items = lock(items).clone();
                let mut out = Vec::new();
                for _ in 0..(*n).max(0) {
                    out.extend(items.iter().cloned());
                }
                Ok(Value::list(out))
            }
            _ => match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => Ok(Value::Float(a * b)),
                _ => Err(type_error()),
            },
        },
        Div => match (left.as_number(), right.as_number()) {
            (Some(_), Some(b)) if b == 0.0 => {
                Err(Exception::zero_division("division by zero"))
            }
            (Some(a), Some(b)) => Ok(Value::Float(a / b)),
            _ => Err(type_error()),
        },
        FloorDiv => match (left, right) {
            (Value::Int(_), Value::Int(0)) => {
                Err(Exception::zero_division("integer division or modulo by zero"))
            }
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.div_euclid(*b))),
            _ => match (left.as_number(), right.as_number()) {
                (Some(_), Some(b)) if b == 0.0 => {
                    Err(Exception::zero_division("float floor division by zero"))
                }
                (Some(a), Some(b)) => Ok(Value::Float((a / b).floor())),
                _ => Err(type_error()),
            },
        },
        Mod => match (left, right) {
            (Value::Int(_), Value::Int(0)) => {
                Err(Exception::zero_division("integer division or modulo by zero"))
            }
            (Value::Int(a), Value::Int(b)) => {
                // Python's modulo takes the divisor's sign.
                let r = a % b;
                Ok(Value::Int(if r != 0 && (r < 0) != (*b < 0) {
                    r + b
                } else {
                    r
                }))
            }
            _ => match (left.as_number(), right.as_number()) {
                (Some(_), Some(b)) if b == 0.0 => {
                    Err(Exception::zero_division("float modulo by zero"))
                }
                (Some(a), Some(b)) => Ok(Value::Float(a - b * (a / b).floor())),
                _ => Err(type_error()),
            },
        },
        Pow => match (left, right) {
            (Value::Int(a), Value::Int(b)) if *b >= 0 => {
                let exp = u32::try_from(*b)
                    .map_err(|_| Exception::new("OverflowError", "exponent too large"))?;
                a.checked_pow(exp)
                    .map(Value::Int)
                    .ok_or_else(|| Exception::new("OverflowError", "integer power overflow"))
            }
            _ => match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => Ok(Value::Float(a.powf(b))),
                _ => Err(type_error()),
            },
        },
        LShift => int_op(left, right, type_error, |a, b| {
            a.checked_shl(b as u32)
                .ok_or_else(|| Exception::new("OverflowError", "shift count too large"))
        }),
        RShift => int_op(left, right, type_error, |a, b| {
            a.checked_shr(b as u32)
                .ok_or_else(|| Exception::new("OverflowError", "shift count too large"))
        }),
        BitAnd => int_op(left, right, type_error, |a, b| Ok(a & b)),
        BitOr => int_op(left, right, type_error, |a, b| Ok(a | b)),
        BitXor => int_op(left, right, type_error, |a, b| Ok(a ^ b)),
    }
}

fn int_op(
    left: &Value,
    right: &Value,
    type_error: impl Fn() -> Exception,
    f: impl Fn(i64, i64) -> std::result::Result<i64, Exception>,
) -> std::result::Result<Value, Exception> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => f(*a, *b).map(Value::Int),
        _ => Err(type_error()),
    }
}

fn compare_op(op: CmpOp, left: &Value, right: &Value) -> std::result::Result<bool, Exception> {
    match op {
        CmpOp::Eq => Ok(left == right),
        CmpOp::NotEq => Ok(left != right),
        CmpOp::Lt => Ok(py_cmp(left, right)? == std::cmp::Ordering::Less),
        CmpOp::LtE => Ok(py_cmp(left, right)? != std::cmp::Ordering::Greater),
        CmpOp::Gt => Ok(py_cmp(left, right)? == std::cmp::Ordering::Greater),
        CmpOp::GtE => Ok(py_cmp(left, right)? != std::cmp::Ordering::Less),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => contains(right, left).map(|b| !b),
        CmpOp::Is => Ok(identity_eq(left, right)),
        CmpOp::IsNot => Ok(!identity_eq(left, right)),
    }
}

fn contains(container: &Value, item: &Value) -> std::result::Result<bool, Exception> {
    match container {
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_str())),
            other => Err(Exception::type_error(format!(
                "'in <string>' requires string as left operand, not '{}'",
                other.type_name()
            ))),
        },
        Value::Map(entries) => Ok(map_get(&lock_map(entries), item).is_some()),
        _ => Ok(iter_values(container)?.iter().any(|v| v == item)),
    }
}

fn identity_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::List(a), Value::List(b)) | (Value::Set(a), Value::Set(b)) => Arc::ptr_eq(a, b),
        (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
        (Value::Null, _) | (_, Value::Null) => false,
        _ => left == right,
    }
}

fn normalize_index(index: &Value, len: i64) -> std::result::Result<usize, Exception> {
    match index {
        Value::Int(i) => {
            let i = if *i < 0 { len + i } else { *i };
            if i < 0 || i >= len {
                Err(Exception::index_error("list index out of range"))
            } else {
                Ok(i as usize)
            }
        }
        other => Err(Exception::type_error(format!(
            "indices must be integers, not '{}'",
            other.type_name()
        ))),
    }
}

fn subscript_value(base: &Value, index: &Value) -> std::result::Result<Value, Exception> {
    match base {
        Value::List(items) => {
            let guard = lock(items);
            let i = normalize_index(index, guard.len() as i64)?;
            Ok(guard[i].clone())
        }
        Value::Tuple(items) => {
            let i = normalize_index(index, items.len() as i64)?;
            Ok(items[i].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = normalize_index(index, chars.len() as i64)
                .map_err(|_| Exception::index_error("string index out of range"))?;
            Ok(Value::Str(chars[i].to_string()))
        }
        Value::Bytes(b) => {
            let i = normalize_index(index, b.len() as i64)
                .map_err(|_| Exception::index_error("index out of range"))?;
            Ok(Value::Int(b[i] as i64))
        }
        Value::Map(entries) => map_get(&lock_map(entries), index)
            .ok_or_else(|| Exception::key_error(index.py_repr())),
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn slice_value(
    base: &Value,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> std::result::Result<Value, Exception> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Exception::value_error("slice step cannot be zero"));
    }

    let slice_indices = |len: i64| -> Vec<usize> {
        // -1 is the sentinel "before index 0" stop for negative steps.
        let (default_start, default_stop) = if step > 0 { (0, len) } else { (len - 1, -1) };
        let clamp = |i: i64| -> i64 {
            let i = if i < 0 { len + i } else { i };
            if step > 0 {
                i.clamp(0, len)
            } else {
                i.clamp(-1, len - 1)
            }
        };
        let start = lower.map(clamp).unwrap_or(default_start);
        let stop = upper.map(clamp).unwrap_or(default_stop);
        let mut indices = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            if i >= 0 && i < len {
                indices.push(i as usize);
            }
            i += step;
        }
        indices
    };

    match base {
        Value::List(items) => {
            let guard = lock(items);
            let indices = slice_indices(guard.len() as i64);
            Ok(Value::list(indices.iter().map(|&i| guard[i].clone()).collect()))
        }
        Value::Tuple(items) => {
            let indices = slice_indices(items.len() as i64);
            Ok(Value::Tuple(Arc::new(
                indices.iter().map(|&i| items[i].clone()).collect(),
            )))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let indices = slice_indices(chars.len() as i64);
            Ok(Value::Str(indices.iter().map(|&i| chars[i]).collect()))
        }
        other => Err(Exception::type_error(format!(
            "'{}' object cannot be sliced",
            other.type_name()
        ))),
    }
}

/// Render an f-string interpolation with an optional format spec. A
/// pragmatic subset: width/alignment/fill, thousands separator, and
/// float precision (`.2f`, `.1%`).
fn apply_format_spec(rendered: &str, value: &Value, spec: Option<&str>) -> String {
    let Some(spec) = spec else {
        return rendered.to_string();
    };
    if spec.is_empty() {
        return rendered.to_string();
    }

    // Precision for floats: [.][digits][f|%]
    if let Some(dot) = spec.find('.') {
        let precision_part = &spec[dot + 1..];
        let (digits, kind) = precision_part.split_at(precision_part.len().saturating_sub(1));
        if let Ok(precision) = digits.parse::<usize>() {
            if let Some(number) = value.as_number() {
                return match kind {
                    "f" => format!("{number:.precision$}"),
                    "%" => format!("{:.precision$}%", number * 100.0),
                    _ => rendered.to_string(),
                };
            }
        }
    }

    // Thousands separator.
    if spec == "," {
        if let Value::Int(i) = value {
            let digits = i.abs().to_string();
            let mut grouped = String::new();
            for (count, c) in digits.chars().rev().enumerate() {
                if count > 0 && count % 3 == 0 {
                    grouped.push(',');
                }
                grouped.push(c);
            }
            let grouped: String = grouped.chars().rev().collect();
            return if *i < 0 { format!("-{grouped}") } else { grouped };
        }
    }

    // Alignment: [fill][<>^][width]
    let mut chars = spec.chars().peekable();
    let mut fill = ' ';
    let mut align = None;
    let first = chars.peek().copied();
    if let Some(first_char) = first {
        let mut rest = spec.chars().skip(1);
        if let Some(second) = rest.next() {
            if matches!(second, '<' | '>' | '^') {
                fill = first_char;
                align = Some(second);
                chars.next();
                chars.next();
            }
        }
        if align.is_none() && matches!(first_char, '<' | '>' | '^') {
            align = Some(first_char);
            chars.next();
        }
    }
    let width: usize = chars.collect::<String>().parse().unwrap_or(0);
    let len = rendered.chars().count();
    if width <= len {
        return rendered.to_string();
    }
    let pad = width - len;
    match align.unwrap_or(if value.as_number().is_some() { '>' } else { '<' }) {
        '>' => fill.to_string().repeat(pad) + rendered,
        '^' => {
            let left = pad / 2;
            fill.to_string().repeat(left) + rendered + &fill.to_string().repeat(pad - left)
        }
        _ => rendered.to_string() + &fill.to_string().repeat(pad),
    }
}
