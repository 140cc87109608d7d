//! End-to-end tests for the sandboxed interpreter: language coverage,
//! resource limits, tool dispatch, and the final-answer signal.

use std::sync::Arc;

use code_agent::tools::{tool, Tool, ToolNamespace};
use code_agent::value::Value;
use code_agent::{Error, EvaluatorConfig, Evaluator};
use serde_json::json;

fn evaluator() -> Evaluator {
    Evaluator::new(EvaluatorConfig::default(), Arc::new(ToolNamespace::new()))
}

fn evaluator_with_tools(tools: Vec<Arc<dyn Tool>>) -> Evaluator {
    Evaluator::new(
        EvaluatorConfig::default(),
        Arc::new(ToolNamespace::from_tools(tools)),
    )
}

async fn eval_value(code: &str) -> Value {
    let execution = evaluator().run(code).await.unwrap();
    assert!(
        execution.error().is_none(),
        "unexpected exception: {:?}",
        execution.error()
    );
    execution.value
}

#[tokio::test]
async fn test_arithmetic_and_precedence() {
    assert_eq!(eval_value("15*8+27\n").await, Value::Int(147));
    assert_eq!(eval_value("2**3**2\n").await, Value::Int(512));
    assert_eq!(eval_value("-2**2\n").await, Value::Int(-4));
    assert_eq!(eval_value("7 // 2\n").await, Value::Int(3));
    assert_eq!(eval_value("-7 % 3\n").await, Value::Int(2));
    assert_eq!(eval_value("7 / 2\n").await, Value::Float(3.5));
    assert_eq!(eval_value("1 << 4 | 3\n").await, Value::Int(19));
}

#[tokio::test]
async fn test_string_operations() {
    assert_eq!(
        eval_value("'ab' + 'cd'\n").await,
        Value::Str("abcd".into())
    );
    assert_eq!(eval_value("'ab' * 3\n").await, Value::Str("ababab".into()));
    assert_eq!(
        eval_value("', '.join(['a', 'b', 'c'])\n").await,
        Value::Str("a, b, c".into())
    );
    assert_eq!(
        eval_value("'Hello World'.lower().replace('world', 'rust')\n").await,
        Value::Str("hello rust".into())
    );
}

#[tokio::test]
async fn test_fstrings() {
    assert_eq!(
        eval_value("x = 3.14159\nf'pi is about {x:.2f}'\n").await,
        Value::Str("pi is about 3.14".into())
    );
    assert_eq!(
        eval_value("name = 'world'\nf'hello {name!r}'\n").await,
        Value::Str("hello 'world'".into())
    );
}

#[tokio::test]
async fn test_collections_and_slicing() {
    assert_eq!(eval_value("[1, 2, 3][-1]\n").await, Value::Int(3));
    assert_eq!(
        eval_value("xs = [0, 1, 2, 3, 4, 5]\nxs[1:5:2]\n").await.py_repr(),
        "[1, 3]"
    );
    assert_eq!(
        eval_value("'hello'[::-1]\n").await,
        Value::Str("olleh".into())
    );
    assert_eq!(
        eval_value("d = {'a': 1}\nd['b'] = 2\nd\n").await.py_repr(),
        "{'a': 1, 'b': 2}"
    );
    assert_eq!(
        eval_value("t = (1, 2)\nt + (3,)\n").await.py_repr(),
        "(1, 2, 3)"
    );
    assert_eq!(eval_value("len({1, 2, 2, 3})\n").await, Value::Int(3));
}

#[tokio::test]
async fn test_aliasing_semantics() {
    let value = eval_value("a = [1]\nb = a\nb.append(2)\na\n").await;
    assert_eq!(value.py_repr(), "[1, 2]");
}

#[tokio::test]
async fn test_control_flow() {
    let code = "\
total = 0
for i in range(10):
    if i % 2 == 0:
        continue
    if i > 7:
        break
    total += i
total
";
    assert_eq!(eval_value(code).await, Value::Int(16));

    let code = "\
n = 0
while n < 5:
    n += 1
n
";
    assert_eq!(eval_value(code).await, Value::Int(5));
}

#[tokio::test]
async fn test_functions_closures_and_defaults() {
    let code = "\
def make_counter(start=0):
    count = start
    def bump(step=1):
        nonlocal count
        count += step
        return count
    return bump

counter = make_counter(10)
counter()
counter(5)
counter()
";
    assert_eq!(eval_value(code).await, Value::Int(17));
}

#[tokio::test]
async fn test_varargs_and_kwargs() {
    let code = "\
def describe(first, *rest, **options):
    return [first, list(rest), options.get('mode', 'none')]

describe(1, 2, 3, mode='fast')
";
    assert_eq!(eval_value(code).await.py_repr(), "[1, [2, 3], 'fast']");
}

#[tokio::test]
async fn test_lambda_map_filter_sorted() {
    assert_eq!(
        eval_value("list(map(lambda x: x * 2, [1, 2, 3]))\n").await.py_repr(),
        "[2, 4, 6]"
    );
    assert_eq!(
        eval_value("list(filter(lambda x: x % 2, [1, 2, 3, 4]))\n").await.py_repr(),
        "[1, 3]"
    );
    assert_eq!(
        eval_value("sorted(['bb', 'a', 'ccc'], key=lambda s: len(s), reverse=True)\n")
            .await
            .py_repr(),
        "['ccc', 'bb', 'a']"
    );
}

#[tokio::test]
async fn test_comprehensions() {
    assert_eq!(
        eval_value("[x * x for x in range(5) if x % 2]\n").await.py_repr(),
        "[1, 9]"
    );
    assert_eq!(
        eval_value("{k: v for k, v in [('a', 1), ('b', 2)]}\n").await.py_repr(),
        "{'a': 1, 'b': 2}"
    );
    assert_eq!(
        eval_value("sum(x for x in range(5))\n").await,
        Value::Int(10)
    );
    // Comprehension targets do not leak into the enclosing scope.
    let evaluator = evaluator();
    let execution = evaluator.run("ys = [q for q in range(3)]\nq\n").await.unwrap();
    assert_eq!(execution.error().unwrap().kind, "NameError");
}

#[tokio::test]
async fn test_unpacking() {
    assert_eq!(eval_value("a, b = 1, 2\na + b\n").await, Value::Int(3));
    assert_eq!(
        eval_value("[first, *rest, last] = [1, 2, 3, 4, 5]\nrest\n").await.py_repr(),
        "[2, 3, 4]"
    );
    let evaluator = evaluator();
    let execution = evaluator.run("a, b = [1, 2, 3]\n").await.unwrap();
    assert_eq!(execution.error().unwrap().kind, "ValueError");
}

#[tokio::test]
async fn test_exceptions_are_catchable_values() {
    let code = "\
result = None
try:
    xs = [1]
    xs[10]
except IndexError as e:
    result = f'caught: {e.kind}'
finally:
    done = True
result
";
    assert_eq!(
        eval_value(code).await,
        Value::Str("caught: IndexError".into())
    );
}

#[tokio::test]
async fn test_raise_and_uncaught_exception() {
    let evaluator = evaluator();
    let execution = evaluator
        .run("raise ValueError('nope')\n")
        .await
        .unwrap();
    let exception = execution.error().unwrap();
    assert_eq!(exception.kind, "ValueError");
    assert_eq!(exception.message, "nope");
    assert!(!execution.is_final_answer);
}

#[tokio::test]
async fn test_try_else_and_reraise_propagation() {
    let code = "\
log = []
try:
    log.append('body')
except ValueError:
    log.append('handler')
else:
    log.append('else')
log
";
    assert_eq!(eval_value(code).await.py_repr(), "['body', 'else']");

    let evaluator = evaluator();
    let execution = evaluator
        .run("try:\n    raise KeyError('k')\nexcept ValueError:\n    pass\n")
        .await
        .unwrap();
    assert_eq!(execution.error().unwrap().kind, "KeyError");
}

#[tokio::test]
async fn test_generators_collect_yields() {
    let code = "\
def squares(n):
    for i in range(n):
        yield i * i

list(squares(4))
";
    assert_eq!(eval_value(code).await.py_repr(), "[0, 1, 4, 9]");
}

#[tokio::test]
async fn test_authorized_import_math() {
    assert_eq!(
        eval_value("import math\nmath.sqrt(16)\n").await,
        Value::Float(4.0)
    );
    assert_eq!(
        eval_value("from json import dumps\ndumps({'a': 1})\n").await,
        Value::Str(r#"{"a":1}"#.into())
    );
}

#[tokio::test]
async fn test_unauthorized_import_fails_before_side_effects() {
    let evaluator = evaluator();
    let error = evaluator
        .run("print('side effect')\nimport subprocess\n")
        .await
        .unwrap_err();
    match &error {
        Error::Interpreter(message) => assert!(message.contains("subprocess")),
        other => panic!("expected interpreter error, got {other:?}"),
    }
    // Pre-execution validation: nothing ran, so nothing printed.
    // (A fresh run of just the print proves the evaluator still works.)
    let execution = evaluator.run("print('ok')\n").await.unwrap();
    assert_eq!(execution.logs, "ok\n");
}

#[tokio::test]
async fn test_operation_budget_stops_infinite_loop() {
    let config = EvaluatorConfig::default().with_max_operations(10_000);
    let evaluator = Evaluator::new(config, Arc::new(ToolNamespace::new()));
    let error = evaluator.run("while True:\n    pass\n").await.unwrap_err();
    assert!(matches!(error, Error::Interpreter(_)));
    assert!(error.to_string().contains("operation budget"));
}

#[tokio::test]
async fn test_print_buffer_cap_keeps_prefix() {
    let config = EvaluatorConfig::default().with_max_print_chars(20);
    let evaluator = Evaluator::new(config, Arc::new(ToolNamespace::new()));
    let execution = evaluator
        .run("for i in range(100):\n    print('0123456789')\n")
        .await
        .unwrap();
    assert!(execution.logs.len() <= 20);
    assert!(execution.logs.starts_with("0123456789"));
    assert!(evaluator.logs_truncated());
}

#[tokio::test]
async fn test_empty_code_block_is_parse_error() {
    let evaluator = evaluator();
    assert!(matches!(
        evaluator.run("").await.unwrap_err(),
        Error::Parse(_)
    ));
    assert!(matches!(
        evaluator.run("   \n# only a comment\n").await.unwrap_err(),
        Error::Parse(_)
    ));
}

#[tokio::test]
async fn test_final_answer_from_call_depth() {
    // The sentinel surfaces with an identical payload from arbitrary
    // call depth.
    let code = "\
def level_two(x):
    final_answer(x * 2)

def level_one(x):
    level_two(x + 1)

level_one(20)
";
    let evaluator = evaluator();
    let execution = evaluator.run(code).await.unwrap();
    assert!(execution.is_final_answer);
    assert_eq!(execution.value, Value::Int(42));
}

#[tokio::test]
async fn test_final_answer_keyword_form() {
    let evaluator = evaluator();
    let execution = evaluator.run("final_answer(answer='done')\n").await.unwrap();
    assert!(execution.is_final_answer);
    assert_eq!(execution.value, Value::Str("done".into()));
}

#[tokio::test]
async fn test_sync_tool_call_and_await_leniency() {
    let add: Arc<dyn Tool> = Arc::new(
        tool("add", "Add two numbers")
            .param("a", "number")
            .param("b", "number")
            .build(|args| async move {
                Ok(json!(args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0)))
            }),
    );
    let evaluator = evaluator_with_tools(vec![add]);

    // Sync tools resolve inline; awaiting them is tolerated.
    let execution = evaluator.run("add(a=2, b=3)\n").await.unwrap();
    assert_eq!(execution.value, Value::Float(5.0));
    let execution = evaluator.run("await add(a=2, b=3)\n").await.unwrap();
    assert_eq!(execution.value, Value::Float(5.0));
}

#[tokio::test]
async fn test_async_tool_requires_await() {
    let fetch: Arc<dyn Tool> = Arc::new(
        tool("fetch", "Fetch a resource")
            .param("url", "string")
            .build_async(|args| async move {
                Ok(json!(format!("body of {}", args["url"].as_str().unwrap_or(""))))
            }),
    );
    let evaluator = evaluator_with_tools(vec![fetch]);

    let execution = evaluator
        .run("r = await fetch(url='http://x')\nr\n")
        .await
        .unwrap();
    assert_eq!(execution.value, Value::Str("body of http://x".into()));

    // Unawaited coroutine reaching the terminal position is rejected.
    let error = evaluator.run("fetch(url='http://x')\n").await.unwrap_err();
    assert!(matches!(error, Error::Interpreter(_)));
    assert!(error.to_string().contains("await"));
}

#[tokio::test]
async fn test_gather_runs_tools_concurrently() {
    let sleepy: Arc<dyn Tool> = Arc::new(
        tool("sleepy", "Sleep then echo")
            .param("ms", "integer")
            .build_async(|args| async move {
                let ms = args["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                Ok(json!(ms))
            }),
    );
    let evaluator = evaluator_with_tools(vec![sleepy]);

    let started = std::time::Instant::now();
    let execution = evaluator
        .run("results = await gather(sleepy(ms=40), sleepy(ms=40), sleepy(ms=40))\nresults\n")
        .await
        .unwrap();
    assert_eq!(execution.value.py_repr(), "[40, 40, 40]");
    // Concurrent, not sequential: well under 3 * 40ms.
    assert!(started.elapsed() < std::time::Duration::from_millis(110));
}

#[tokio::test]
async fn test_tool_positional_args_rejected() {
    let echo: Arc<dyn Tool> = Arc::new(
        tool("echo", "Echo").param("text", "string").build(|args| async move {
            Ok(args["text"].clone())
        }),
    );
    let evaluator = evaluator_with_tools(vec![echo]);
    let execution = evaluator.run("echo('hi')\n").await.unwrap();
    let exception = execution.error().unwrap();
    assert_eq!(exception.kind, "TypeError");
    assert!(exception.message.contains("keyword arguments"));
}

#[tokio::test]
async fn test_tool_error_is_catchable() {
    let flaky: Arc<dyn Tool> = Arc::new(
        tool("flaky", "Always fails")
            .param("q", "string")
            .build(|_| async move { Err::<serde_json::Value, _>(Error::tool("query too long")) }),
    );
    let evaluator = evaluator_with_tools(vec![flaky]);
    let code = "\
try:
    flaky(q='x')
    outcome = 'no error'
except ToolError as e:
    outcome = f'handled: {e.message}'
outcome
";
    let execution = evaluator.run(code).await.unwrap();
    assert_eq!(
        execution.value,
        Value::Str("handled: Tool execution error: query too long".into())
    );
}

#[tokio::test]
async fn test_dotted_tool_name_callable_via_alias() {
    let remote: Arc<dyn Tool> = Arc::new(
        tool("github.list_issues", "List issues")
            .param("repo", "string")
            .build(|_| async move { Ok(json!(["issue-1"])) }),
    );
    let evaluator = evaluator_with_tools(vec![remote]);
    let execution = evaluator
        .run("github_list_issues(repo='a/b')\n")
        .await
        .unwrap();
    assert_eq!(execution.value.py_repr(), "['issue-1']");
}

#[tokio::test]
async fn test_variables_persist_across_blocks() {
    let evaluator = evaluator();
    evaluator.run("state = {'count': 1}\n").await.unwrap();
    let execution = evaluator
        .run("state['count'] += 41\nstate['count']\n")
        .await
        .unwrap();
    assert_eq!(execution.value, Value::Int(42));
}

#[tokio::test]
async fn test_send_variables() {
    let evaluator = evaluator();
    evaluator.send_variables(vec![("seed".to_string(), Value::Int(7))]);
    assert_eq!(eval_value_on(&evaluator, "seed * 6\n").await, Value::Int(42));
}

async fn eval_value_on(evaluator: &Evaluator, code: &str) -> Value {
    evaluator.run(code).await.unwrap().value
}

#[tokio::test]
async fn test_determinism() {
    let code = "sorted([3, 1, 2]) + [len('abc')] + [x * 2 for x in range(3)]\n";
    let first = eval_value(code).await;
    let second = eval_value(code).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_async_def_and_top_level_await() {
    let code = "\
async def double(x):
    return x * 2

result = await double(21)
result
";
    assert_eq!(eval_value(code).await, Value::Int(42));
}

#[tokio::test]
async fn test_ternary_and_boolean_short_circuit() {
    assert_eq!(
        eval_value("x = 5\n'big' if x > 3 else 'small'\n").await,
        Value::Str("big".into())
    );
    // `or` returns the deciding operand, and the right side is not
    // evaluated when short-circuited.
    assert_eq!(
        eval_value("0 or 'fallback'\n").await,
        Value::Str("fallback".into())
    );
    assert_eq!(eval_value("[] and undefined_name\n").await.py_repr(), "[]");
}

#[tokio::test]
async fn test_chained_comparison() {
    assert_eq!(eval_value("1 < 2 < 3\n").await, Value::Bool(true));
    assert_eq!(eval_value("1 < 2 > 5\n").await, Value::Bool(false));
    assert_eq!(eval_value("'b' in 'abc'\n").await, Value::Bool(true));
    assert_eq!(eval_value("3 not in [1, 2]\n").await, Value::Bool(true));
    assert_eq!(eval_value("None is None\n").await, Value::Bool(true));
}

#[tokio::test]
async fn test_global_declaration() {
    let code = "\
counter = 0

def bump():
    global counter
    counter = counter + 1

bump()
bump()
counter
";
    assert_eq!(eval_value(code).await, Value::Int(2));
}

#[tokio::test]
async fn test_terminal_non_expression_yields_null() {
    let evaluator = evaluator();
    let execution = evaluator.run("x = 41\ny = x + 1\n").await.unwrap();
    assert_eq!(execution.value, Value::Null);
}
