//! Frozen builtin table and value methods for the sandboxed interpreter.
//!
//! The table is a curated subset of names for arithmetic, iteration, and
//! common containers. Builtins that must call back into user code (`map`,
//! `filter`, `sorted` with a key, `gather`) are dispatched by the
//! evaluator itself; everything here is pure.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::value::{lock, lock_map, map_get, map_insert, Exception, Value};

/// Names resolvable at layer (iv) of name resolution. Kept in sync with
/// the dispatch below; the evaluator also owns `print`, `map`, `filter`,
/// `sorted`, `max`, `min`, `gather`, and `isinstance`.
pub const BUILTIN_NAMES: &[&str] = &[
    "abs", "all", "any", "bool", "chr", "dict", "divmod", "enumerate", "filter", "float",
    "gather", "int", "isinstance", "len", "list", "map", "max", "min", "ord", "pow", "print",
    "range", "repr", "reversed", "round", "set", "sorted", "str", "sum", "tuple", "type", "zip",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

type EvalResult = Result<Value, Exception>;

/// Materialize any iterable into a vector of values. Strings iterate by
/// character, dicts by key (insertion order).
pub fn iter_values(value: &Value) -> Result<Vec<Value>, Exception> {
    match value {
        Value::List(items) | Value::Set(items) => Ok(lock(items).clone()),
        Value::Tuple(items) => Ok(items.as_ref().clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Bytes(b) => Ok(b.iter().map(|byte| Value::Int(*byte as i64)).collect()),
        Value::Map(entries) => Ok(lock_map(entries).iter().map(|(k, _)| k.clone()).collect()),
        other => Err(Exception::type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

/// Python ordering: numbers cross-compare, strings lexicographic, lists
/// and tuples element-wise. Mixed types are a TypeError, as in Python 3.
pub fn py_cmp(a: &Value, b: &Value) -> Result<Ordering, Exception> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return x.partial_cmp(&y).ok_or_else(|| {
            Exception::value_error("cannot order NaN values")
        });
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::Bytes(x), Value::Bytes(y)) => Ok(x.cmp(y)),
        (Value::List(x), Value::List(y)) => seq_cmp(&lock(x), &lock(y)),
        (Value::Tuple(x), Value::Tuple(y)) => seq_cmp(x, y),
        _ => Err(Exception::type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn seq_cmp(a: &[Value], b: &[Value]) -> Result<Ordering, Exception> {
    for (x, y) in a.iter().zip(b.iter()) {
        match py_cmp(x, y)? {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(a.len().cmp(&b.len()))
}

fn want_args(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), Exception> {
    if args.len() < min || args.len() > max {
        return Err(Exception::type_error(format!(
            "{name}() takes {min}..{max} arguments but {} were given",
            args.len()
        )));
    }
    Ok(())
}

/// Dispatch a pure builtin (or a sandbox-module function with a dotted
/// name). Returns `None` when the name is not handled here so the
/// evaluator can try its own table.
pub fn call_pure(name: &str, args: &[Value]) -> Option<EvalResult> {
    if let Some(rest) = name.strip_prefix("math.") {
        return Some(call_math(rest, args));
    }
    if let Some(rest) = name.strip_prefix("json.") {
        return Some(call_json(rest, args));
    }
    if let Some(rest) = name.strip_prefix("re.") {
        return Some(call_re(rest, args));
    }

    let result = match name {
        "abs" => {
            if let Err(e) = want_args("abs", args, 1, 1) {
                return Some(Err(e));
            }
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(i.wrapping_abs())),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(Exception::type_error(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_name()
                ))),
            }
        }
        "all" => iter_values(args.first()?).map(|vs| Value::Bool(vs.iter().all(Value::is_truthy))),
        "any" => iter_values(args.first()?).map(|vs| Value::Bool(vs.iter().any(Value::is_truthy))),
        "bool" => Ok(Value::Bool(args.first().map(Value::is_truthy).unwrap_or(false))),
        "chr" => match args.first() {
            Some(Value::Int(i)) => char::from_u32(*i as u32)
                .map(|c| Value::Str(c.to_string()))
                .ok_or_else(|| Exception::value_error("chr() arg not in range")),
            _ => Err(Exception::type_error("chr() requires an integer")),
        },
        "dict" => match args.first() {
            None => Ok(Value::map(Vec::new())),
            Some(Value::Map(entries)) => Ok(Value::map(lock_map(entries).clone())),
            Some(other) => {
                let pairs = iter_values(other).and_then(|items| {
                    items
                        .iter()
                        .map(|item| match iter_values(item)?.as_slice() {
                            [k, v] => Ok((k.clone(), v.clone())),
                            _ => Err(Exception::value_error(
                                "dictionary update sequence element is not a pair",
                            )),
                        })
                        .collect::<Result<Vec<_>, _>>()
                });
                pairs.map(Value::map)
            }
        },
        "divmod" => match (args.first(), args.get(1)) {
            (Some(Value::Int(a)), Some(Value::Int(b))) => {
                if *b == 0 {
                    Err(Exception::zero_division("integer division or modulo by zero"))
                } else {
                    Ok(Value::Tuple(Arc::new(vec![
                        Value::Int(a.div_euclid(*b)),
                        Value::Int(a.rem_euclid(*b)),
                    ])))
                }
            }
            _ => Err(Exception::type_error("divmod() requires two integers")),
        },
        "enumerate" => {
            let start = match args.get(1) {
                Some(Value::Int(i)) => *i,
                None => 0,
                _ => return Some(Err(Exception::type_error("enumerate() start must be int"))),
            };
            iter_values(args.first()?).map(|vs| {
                Value::list(
                    vs.into_iter()
                        .enumerate()
                        .map(|(i, v)| Value::Tuple(Arc::new(vec![Value::Int(start + i as i64), v])))
                        .collect(),
                )
            })
        }
        "float" => match args.first() {
            None => Ok(Value::Float(0.0)),
            Some(Value::Str(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| Exception::value_error(format!("could not convert string to float: '{s}'"))),
            Some(v) => v
                .as_number()
                .map(Value::Float)
                .ok_or_else(|| Exception::type_error("float() argument must be a string or a number")),
        },
        "int" => match args.first() {
            None => Ok(Value::Int(0)),
            Some(Value::Str(s)) => {
                let base = match args.get(1) {
                    Some(Value::Int(b)) => *b as u32,
                    _ => 10,
                };
                i64::from_str_radix(s.trim(), base)
                    .map(Value::Int)
                    .map_err(|_| {
                        Exception::value_error(format!(
                            "invalid literal for int() with base {base}: '{s}'"
                        ))
                    })
            }
            Some(Value::Float(f)) => Ok(Value::Int(f.trunc() as i64)),
            Some(Value::Int(i)) => Ok(Value::Int(*i)),
            Some(Value::Bool(b)) => Ok(Value::Int(if *b { 1 } else { 0 })),
            Some(other) => Err(Exception::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ))),
        },
        "len" => match args.first() {
            Some(Value::Str(s)) => Ok(Value::Int(s.chars().count() as i64)),
            Some(Value::Bytes(b)) => Ok(Value::Int(b.len() as i64)),
            Some(Value::List(items)) | Some(Value::Set(items)) => {
                Ok(Value::Int(lock(items).len() as i64))
            }
            Some(Value::Tuple(items)) => Ok(Value::Int(items.len() as i64)),
            Some(Value::Map(entries)) => Ok(Value::Int(lock_map(entries).len() as i64)),
            Some(other) => Err(Exception::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            ))),
            None => Err(Exception::type_error("len() takes exactly one argument")),
        },
        "list" => match args.first() {
            None => Ok(Value::list(Vec::new())),
            Some(v) => iter_values(v).map(Value::list),
        },
        "ord" => match args.first() {
            Some(Value::Str(s)) if s.chars().count() == 1 => {
                Ok(Value::Int(s.chars().next().unwrap() as i64))
            }
            _ => Err(Exception::type_error(
                "ord() expected a character",
            )),
        },
        "pow" => match (args.first(), args.get(1)) {
            (Some(a), Some(b)) => crate::interp::eval::numeric_pow(a, b),
            _ => Err(Exception::type_error("pow() requires two arguments")),
        },
        "range" => {
            let ints: Result<Vec<i64>, Exception> = args
                .iter()
                .map(|v| match v {
                    Value::Int(i) => Ok(*i),
                    other => Err(Exception::type_error(format!(
                        "'{}' object cannot be interpreted as an integer",
                        other.type_name()
                    ))),
                })
                .collect();
            match ints {
                Err(e) => Err(e),
                Ok(ints) => {
                    let (start, stop, step) = match ints.as_slice() {
                        [stop] => (0, *stop, 1),
                        [start, stop] => (*start, *stop, 1),
                        [start, stop, step] => (*start, *stop, *step),
                        _ => {
                            return Some(Err(Exception::type_error(
                                "range expected 1 to 3 arguments",
                            )))
                        }
                    };
                    if step == 0 {
                        Err(Exception::value_error("range() arg 3 must not be zero"))
                    } else {
                        let mut items = Vec::new();
                        let mut i = start;
                        while (step > 0 && i < stop) || (step < 0 && i > stop) {
                            items.push(Value::Int(i));
                            i += step;
                        }
                        Ok(Value::list(items))
                    }
                }
            }
        }
        "repr" => Ok(Value::Str(args.first()?.py_repr())),
        "reversed" => iter_values(args.first()?).map(|mut vs| {
            vs.reverse();
            Value::list(vs)
        }),
        "round" => {
            let digits = match args.get(1) {
                Some(Value::Int(d)) => *d,
                None => 0,
                _ => return Some(Err(Exception::type_error("round() ndigits must be int"))),
            };
            match args.first() {
                Some(Value::Int(i)) => Ok(Value::Int(*i)),
                Some(Value::Float(f)) => {
                    let factor = 10f64.powi(digits as i32);
                    let rounded = (f * factor).round() / factor;
                    if digits <= 0 && args.get(1).is_none() {
                        Ok(Value::Int(rounded as i64))
                    } else {
                        Ok(Value::Float(rounded))
                    }
                }
                _ => Err(Exception::type_error("round() requires a number")),
            }
        }
        "set" => match args.first() {
            None => Ok(Value::set(Vec::new())),
            Some(v) => iter_values(v).map(Value::set),
        },
        "str" => Ok(Value::Str(
            args.first().map(Value::py_str).unwrap_or_default(),
        )),
        "sum" => {
            let start = args.get(1).cloned().unwrap_or(Value::Int(0));
            match iter_values(args.first()?) {
                Err(e) => Err(e),
                Ok(vs) => {
                    let mut acc = start;
                    for v in vs {
                        acc = match crate::interp::eval::numeric_add(&acc, &v) {
                            Ok(value) => value,
                            Err(e) => return Some(Err(e)),
                        };
                    }
                    Ok(acc)
                }
            }
        }
        "tuple" => match args.first() {
            None => Ok(Value::Tuple(Arc::new(Vec::new()))),
            Some(v) => iter_values(v).map(|vs| Value::Tuple(Arc::new(vs))),
        },
        "type" => Ok(Value::Str(args.first()?.type_name().to_string())),
        "zip" => {
            let lists: Result<Vec<Vec<Value>>, Exception> = args.iter().map(iter_values).collect();
            match lists {
                Err(e) => Err(e),
                Ok(lists) => {
                    let shortest = lists.iter().map(Vec::len).min().unwrap_or(0);
                    Ok(Value::list(
                        (0..shortest)
                            .map(|i| {
                                Value::Tuple(Arc::new(
                                    lists.iter().map(|l| l[i].clone()).collect(),
                                ))
                            })
                            .collect(),
                    ))
                }
            }
        }
        _ => return None,
    };
    Some(result)
}

fn call_math(name: &str, args: &[Value]) -> EvalResult {
    let unary = |f: fn(f64) -> f64| -> EvalResult {
        args.first()
            .and_then(Value::as_number)
            .map(|x| Value::Float(f(x)))
            .ok_or_else(|| Exception::type_error(format!("math.{name}() requires a number")))
    };
    match name {
        "sqrt" => {
            let x = args
                .first()
                .and_then(Value::as_number)
                .ok_or_else(|| Exception::type_error("math.sqrt() requires a number"))?;
            if x < 0.0 {
                Err(Exception::value_error("math domain error"))
            } else {
                Ok(Value::Float(x.sqrt()))
            }
        }
        "floor" => args
            .first()
            .and_then(Value::as_number)
            .map(|x| Value::Int(x.floor() as i64))
            .ok_or_else(|| Exception::type_error("math.floor() requires a number")),
        "ceil" => args
            .first()
            .and_then(Value::as_number)
            .map(|x| Value::Int(x.ceil() as i64))
            .ok_or_else(|| Exception::type_error("math.ceil() requires a number")),
        "fabs" => unary(f64::abs),
        "exp" => unary(f64::exp),
        "log" => match (args.first().and_then(Value::as_number), args.get(1)) {
            (Some(x), None) => Ok(Value::Float(x.ln())),
            (Some(x), Some(base)) => base
                .as_number()
                .map(|b| Value::Float(x.log(b)))
                .ok_or_else(|| Exception::type_error("math.log() base must be a number")),
            _ => Err(Exception::type_error("math.log() requires a number")),
        },
        "log2" => unary(f64::log2),
        "log10" => unary(f64::log10),
        "sin" => unary(f64::sin),
        "cos" => unary(f64::cos),
        "tan" => unary(f64::tan),
        "pow" => match (args.first(), args.get(1)) {
            (Some(a), Some(b)) => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => Ok(Value::Float(x.powf(y))),
                _ => Err(Exception::type_error("math.pow() requires numbers")),
            },
            _ => Err(Exception::type_error("math.pow() requires two arguments")),
        },
        "gcd" => match (args.first(), args.get(1)) {
            (Some(Value::Int(a)), Some(Value::Int(b))) => {
                let (mut a, mut b) = (a.abs(), b.abs());
                while b != 0 {
                    (a, b) = (b, a % b);
                }
                Ok(Value::Int(a))
            }
            _ => Err(Exception::type_error("math.gcd() requires integers")),
        },
        "factorial" => match args.first() {
            Some(Value::Int(n)) if *n >= 0 => {
                let mut acc: i64 = 1;
                for i in 2..=*n {
                    acc = acc.checked_mul(i).ok_or_else(|| {
                        Exception::new("OverflowError", "factorial() result too large")
                    })?;
                }
                Ok(Value::Int(acc))
            }
            _ => Err(Exception::value_error(
                "factorial() requires a non-negative integer",
            )),
        },
        other => Err(Exception::attribute_error(format!(
            "module 'math' has no attribute '{other}'"
        ))),
    }
}

fn call_json(name: &str, args: &[Value]) -> EvalResult {
    match name {
        "dumps" => {
            let value = args
                .first()
                .ok_or_else(|| Exception::type_error("json.dumps() requires an argument"))?;
            let indent = args.get(1).and_then(Value::as_number);
            let json = value.to_json();
            let text = if indent.is_some() {
                serde_json::to_string_pretty(&json)
            } else {
                serde_json::to_string(&json)
            };
            text.map(Value::Str)
                .map_err(|e| Exception::value_error(format!("json.dumps() failed: {e}")))
        }
        "loads" => match args.first() {
            Some(Value::Str(s)) => serde_json::from_str::<serde_json::Value>(s)
                .map(|json| Value::from_json(&json))
                .map_err(|e| {
                    Exception::new("JSONDecodeError", format!("invalid JSON: {e}"))
                }),
            _ => Err(Exception::type_error("json.loads() requires a string")),
        },
        other => Err(Exception::attribute_error(format!(
            "module 'json' has no attribute '{other}'"
        ))),
    }
}

fn call_re(name: &str, args: &[Value]) -> EvalResult {
    let pattern = match args.first() {
        Some(Value::Str(p)) => p.clone(),
        _ => return Err(Exception::type_error("re pattern must be a string")),
    };
    if name == "escape" {
        return Ok(Value::Str(regex::escape(&pattern)));
    }
    let text = match args.get(1) {
        Some(Value::Str(t)) => t.clone(),
        _ if name == "sub" => String::new(),
        _ => return Err(Exception::type_error("re target must be a string")),
    };
    let compiled = regex::Regex::new(&pattern)
        .map_err(|e| Exception::value_error(format!("invalid regex: {e}")))?;
    match name {
        "findall" => Ok(Value::list(
            compiled
                .captures_iter(&text)
                .map(|caps| {
                    if caps.len() > 1 {
                        let groups: Vec<Value> = caps
                            .iter()
                            .skip(1)
                            .map(|g| Value::Str(g.map(|m| m.as_str()).unwrap_or("").to_string()))
                            .collect();
                        if groups.len() == 1 {
                            groups.into_iter().next().unwrap()
                        } else {
                            Value::Tuple(Arc::new(groups))
                        }
                    } else {
                        Value::Str(caps.get(0).map(|m| m.as_str()).unwrap_or("").to_string())
                    }
                })
                .collect(),
        )),
        "search" => Ok(compiled
            .find(&text)
            .map(|m| Value::Str(m.as_str().to_string()))
            .unwrap_or(Value::Null)),
        "match" => {
            let anchored = format!("^(?:{pattern})");
            let compiled = regex::Regex::new(&anchored)
                .map_err(|e| Exception::value_error(format!("invalid regex: {e}")))?;
            Ok(compiled
                .find(&text)
                .map(|m| Value::Str(m.as_str().to_string()))
                .unwrap_or(Value::Null))
        }
        "split" => Ok(Value::list(
            compiled
                .split(&text)
                .map(|part| Value::Str(part.to_string()))
                .collect(),
        )),
        "sub" => {
            let replacement = match args.get(1) {
                Some(Value::Str(r)) => r.clone(),
                _ => return Err(Exception::type_error("re.sub() replacement must be a string")),
            };
            let target = match args.get(2) {
                Some(Value::Str(t)) => t.clone(),
                _ => return Err(Exception::type_error("re.sub() target must be a string")),
            };
            Ok(Value::Str(
                compiled.replace_all(&target, replacement.as_str()).into_owned(),
            ))
        }
        other => Err(Exception::attribute_error(format!(
            "module 're' has no attribute '{other}'"
        ))),
    }
}

/// Pure method dispatch on receiver values (str/list/dict/set). Returns
/// `None` for methods the evaluator must handle itself (e.g. `sort` with
/// a key function).
pub fn call_method(receiver: &Value, method: &str, args: &[Value]) -> Option<EvalResult> {
    match receiver {
        Value::Str(s) => call_str_method(s, method, args),
        Value::List(items) => call_list_method(items, method, args),
        Value::Map(entries) => call_dict_method(entries, method, args),
        Value::Set(items) => call_set_method(items, method, args),
        _ => None,
    }
}

fn call_str_method(s: &str, method: &str, args: &[Value]) -> Option<EvalResult> {
    let str_arg = |i: usize| -> Result<String, Exception> {
        match args.get(i) {
            Some(Value::Str(v)) => Ok(v.clone()),
            Some(other) => Err(Exception::type_error(format!(
                "str.{method}() argument must be str, not '{}'",
                other.type_name()
            ))),
            None => Err(Exception::type_error(format!(
                "str.{method}() missing required argument"
            ))),
        }
    };

    let result = match method {
        "upper" => Ok(Value::Str(s.to_uppercase())),
        "lower" => Ok(Value::Str(s.to_lowercase())),
        "strip" => Ok(Value::Str(s.trim().to_string())),
        "lstrip" => Ok(Value::Str(s.trim_start().to_string())),
        "rstrip" => Ok(Value::Str(s.trim_end().to_string())),
        "capitalize" => {
            let mut chars = s.chars();
            Ok(Value::Str(match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }))
        }
        "title" => Ok(Value::Str(
            s.split(' ')
                .map(|word| {
                    let mut chars = word.chars();
                    match chars.next() {
                        Some(first) => {
                            first.to_uppercase().collect::<String>()
                                + &chars.as_str().to_lowercase()
                        }
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
        )),
        "split" => match args.first() {
            None | Some(Value::Null) => Ok(Value::list(
                s.split_whitespace()
                    .map(|part| Value::Str(part.to_string()))
                    .collect(),
            )),
            Some(Value::Str(sep)) => Ok(Value::list(
                s.split(sep.as_str())
                    .map(|part| Value::Str(part.to_string()))
                    .collect(),
            )),
            Some(other) => Err(Exception::type_error(format!(
                "separator must be str, not '{}'",
                other.type_name()
            ))),
        },
        "splitlines" => Ok(Value::list(
            s.lines().map(|line| Value::Str(line.to_string())).collect(),
        )),
        "join" => match args.first() {
            Some(iterable) => iter_values(iterable).and_then(|vs| {
                let parts: Result<Vec<String>, Exception> = vs
                    .iter()
                    .map(|v| match v {
                        Value::Str(part) => Ok(part.clone()),
                        other => Err(Exception::type_error(format!(
                            "sequence item: expected str instance, '{}' found",
                            other.type_name()
                        ))),
                    })
                    .collect();
                parts.map(|parts| Value::Str(parts.join(s)))
            }),
            None => Err(Exception::type_error("join() missing required argument")),
        },
        "replace" => match (str_arg(0), str_arg(1)) {
            (Ok(from), Ok(to)) => Ok(Value::Str(s.replace(&from, &to))),
            (Err(e), _) | (_, Err(e)) => Err(e),
        },
        "startswith" => str_arg(0).map(|prefix| Value::Bool(s.starts_with(&prefix))),
        "endswith" => str_arg(0).map(|suffix| Value::Bool(s.ends_with(&suffix))),
        "find" => str_arg(0).map(|needle| {
            Value::Int(
                s.find(&needle)
                    .map(|byte| s[..byte].chars().count() as i64)
                    .unwrap_or(-1),
            )
        }),
        "rfind" => str_arg(0).map(|needle| {
            Value::Int(
                s.rfind(&needle)
                    .map(|byte| s[..byte].chars().count() as i64)
                    .unwrap_or(-1),
            )
        }),
        "index" => match str_arg(0) {
            Ok(needle) => s
                .find(&needle)
                .map(|byte| Value::Int(s[..byte].chars().count() as i64))
                .ok_or_else(|| Exception::value_error("substring not found")),
            Err(e) => Err(e),
        },
        "count" => str_arg(0).map(|needle| {
            if needle.is_empty() {
                Value::Int(s.chars().count() as i64 + 1)
            } else {
                Value::Int(s.matches(&needle).count() as i64)
            }
        }),
        "zfill" => match args.first() {
            Some(Value::Int(width)) => {
                let width = *width as usize;
                let len = s.chars().count();
                if len >= width {
                    Ok(Value::Str(s.to_string()))
                } else {
                    Ok(Value::Str("0".repeat(width - len) + s))
                }
            }
            _ => Err(Exception::type_error("zfill() requires an integer")),
        },
        "isdigit" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
        )),
        "isalpha" => Ok(Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic))),
        "isalnum" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(char::is_alphanumeric),
        )),
        "isspace" => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(char::is_whitespace),
        )),
        "encode" => Ok(Value::Bytes(s.as_bytes().to_vec())),
        "format" => {
            // Positional `{}` substitution only; named fields are not
            // supported (the interpreter favors f-strings).
            let mut result = String::new();
            let mut arg_index = 0usize;
            let mut chars = s.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '{' && chars.peek() == Some(&'}') {
                    chars.next();
                    if let Some(arg) = args.get(arg_index) {
                        result.push_str(&arg.py_str());
                    }
                    arg_index += 1;
                } else {
                    result.push(c);
                }
            }
            Ok(Value::Str(result))
        }
        _ => return None,
    };
    Some(result)
}

fn call_list_method(items: &crate::value::ListRef, method: &str, args: &[Value]) -> Option<EvalResult> {
    let result = match method {
        "append" => match args.first() {
            Some(v) => {
                lock(items).push(v.clone());
                Ok(Value::Null)
            }
            None => Err(Exception::type_error("append() missing required argument")),
        },
        "extend" => match args.first() {
            Some(iterable) => iter_values(iterable).map(|vs| {
                lock(items).extend(vs);
                Value::Null
            }),
            None => Err(Exception::type_error("extend() missing required argument")),
        },
        "insert" => match (args.first(), args.get(1)) {
            (Some(Value::Int(index)), Some(v)) => {
                let mut guard = lock(items);
                let index = (*index).clamp(0, guard.len() as i64) as usize;
                guard.insert(index, v.clone());
                Ok(Value::Null)
            }
            _ => Err(Exception::type_error("insert() requires an index and a value")),
        },
        "remove" => match args.first() {
            Some(target) => {
                let mut guard = lock(items);
                match guard.iter().position(|v| v == target) {
                    Some(index) => {
                        guard.remove(index);
                        Ok(Value::Null)
                    }
                    None => Err(Exception::value_error("list.remove(x): x not in list")),
                }
            }
            None => Err(Exception::type_error("remove() missing required argument")),
        },
        "pop" => {
            let mut guard = lock(items);
            let index = match args.first() {
                Some(Value::Int(i)) => {
                    if *i < 0 {
                        guard.len() as i64 + i
                    } else {
                        *i
                    }
                }
                None => guard.len() as i64 - 1,
                _ => return Some(Err(Exception::type_error("pop() index must be int"))),
            };
            if index < 0 || index as usize >= guard.len() {
                Err(Exception::index_error("pop index out of range"))
            } else {
                Ok(guard.remove(index as usize))
            }
        }
        "clear" => {
            lock(items).clear();
            Ok(Value::Null)
        }
        "index" => match args.first() {
            Some(target) => lock(items)
                .iter()
                .position(|v| v == target)
                .map(|i| Value::Int(i as i64))
                .ok_or_else(|| Exception::value_error("value not in list")),
            None => Err(Exception::type_error("index() missing required argument")),
        },
        "count" => match args.first() {
            Some(target) => Ok(Value::Int(
                lock(items).iter().filter(|v| *v == target).count() as i64,
            )),
            None => Err(Exception::type_error("count() missing required argument")),
        },
        "reverse" => {
            lock(items).reverse();
            Ok(Value::Null)
        }
        "copy" => Ok(Value::list(lock(items).clone())),
        // `sort` may carry a key function; the evaluator owns it.
        _ => return None,
    };
    Some(result)
}

fn call_dict_method(entries: &crate::value::MapRef, method: &str, args: &[Value]) -> Option<EvalResult> {
    let result = match method {
        "get" => match args.first() {
            Some(key) => {
                let fallback = args.get(1).cloned().unwrap_or(Value::Null);
                Ok(map_get(&lock_map(entries), key).unwrap_or(fallback))
            }
            None => Err(Exception::type_error("get() missing required argument")),
        },
        "keys" => Ok(Value::list(
            lock_map(entries).iter().map(|(k, _)| k.clone()).collect(),
        )),
        "values" => Ok(Value::list(
            lock_map(entries).iter().map(|(_, v)| v.clone()).collect(),
        )),
        "items" => Ok(Value::list(
            lock_map(entries)
                .iter()
                .map(|(k, v)| Value::Tuple(Arc::new(vec![k.clone(), v.clone()])))
                .collect(),
        )),
        "pop" => match args.first() {
            Some(key) => {
                let mut guard = lock_map(entries);
                match guard.iter().position(|(k, _)| k == key) {
                    Some(index) => Ok(guard.remove(index).1),
                    None => match args.get(1) {
                        Some(fallback) => Ok(fallback.clone()),
                        None => Err(Exception::key_error(key.py_repr())),
                    },
                }
            }
            None => Err(Exception::type_error("pop() missing required argument")),
        },
        "update" => match args.first() {
            Some(Value::Map(other)) => {
                let other_entries = lock_map(other).clone();
                let mut guard = lock_map(entries);
                for (k, v) in other_entries {
                    map_insert(&mut guard, k, v);
                }
                Ok(Value::Null)
            }
            _ => Err(Exception::type_error("update() requires a dict")),
        },
        "setdefault" => match args.first() {
            Some(key) => {
                let fallback = args.get(1).cloned().unwrap_or(Value::Null);
                let mut guard = lock_map(entries);
                match map_get(&guard, key) {
                    Some(existing) => Ok(existing),
                    None => {
                        map_insert(&mut guard, key.clone(), fallback.clone());
                        Ok(fallback)
                    }
                }
            }
            None => Err(Exception::type_error("setdefault() missing required argument")),
        },
        "clear" => {
            lock_map(entries).clear();
            Ok(Value::Null)
        }
        "copy" => Ok(Value::map(lock_map(entries).clone())),
        _ => return None,
    };
    Some(result)
}

fn call_set_method(items: &crate::value::ListRef, method: &str, args: &[Value]) -> Option<EvalResult> {
    let result = match method {
        "add" => match args.first() {
            Some(v) => {
                let mut guard = lock(items);
                if !guard.iter().any(|existing| existing == v) {
                    guard.push(v.clone());
                }
                Ok(Value::Null)
            }
            None => Err(Exception::type_error("add() missing required argument")),
        },
        "remove" => match args.first() {
            Some(target) => {
                let mut guard = lock(items);
                match guard.iter().position(|v| v == target) {
                    Some(index) => {
                        guard.remove(index);
                        Ok(Value::Null)
                    }
                    None => Err(Exception::key_error(target.py_repr())),
                }
            }
            None => Err(Exception::type_error("remove() missing required argument")),
        },
        "discard" => match args.first() {
            Some(target) => {
                let mut guard = lock(items);
                if let Some(index) = guard.iter().position(|v| v == target) {
                    guard.remove(index);
                }
                Ok(Value::Null)
            }
            None => Err(Exception::type_error("discard() missing required argument")),
        },
        "union" => match args.first() {
            Some(other) => iter_values(other).map(|vs| {
                let mut combined = lock(items).clone();
                for v in vs {
                    if !combined.iter().any(|existing| existing == &v) {
                        combined.push(v);
                    }
                }
                Value::Set(Arc::new(std::sync::Mutex::new(combined)))
            }),
            None => Err(Exception::type_error("union() missing required argument")),
        },
        "intersection" => match args.first() {
            Some(other) => iter_values(other).map(|vs| {
                let guard = lock(items);
                Value::set(
                    guard
                        .iter()
                        .filter(|v| vs.iter().any(|o| o == *v))
                        .cloned()
                        .collect(),
                )
            }),
            None => Err(Exception::type_error(
                "intersection() missing required argument",
            )),
        },
        "difference" => match args.first() {
            Some(other) => iter_values(other).map(|vs| {
                let guard = lock(items);
                Value::set(
                    guard
                        .iter()
                        .filter(|v| !vs.iter().any(|o| o == *v))
                        .cloned()
                        .collect(),
                )
            }),
            None => Err(Exception::type_error(
                "difference() missing required argument",
            )),
        },
        "clear" => {
            lock(items).clear();
            Ok(Value::Null)
        }
        _ => return None,
    };
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len_and_str() {
        assert_eq!(
            call_pure("len", &[Value::Str("héllo".into())]).unwrap().unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            call_pure("str", &[Value::Int(42)]).unwrap().unwrap(),
            Value::Str("42".into())
        );
    }

    #[test]
    fn test_range() {
        let result = call_pure("range", &[Value::Int(2), Value::Int(8), Value::Int(2)])
            .unwrap()
            .unwrap();
        assert_eq!(result.py_repr(), "[2, 4, 6]");
        assert!(call_pure("range", &[Value::Int(1), Value::Int(2), Value::Int(0)])
            .unwrap()
            .is_err());
    }

    #[test]
    fn test_sum_and_zip() {
        let xs = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(call_pure("sum", &[xs.clone()]).unwrap().unwrap(), Value::Int(6));

        let ys = Value::list(vec![Value::Str("a".into()), Value::Str("b".into())]);
        let zipped = call_pure("zip", &[xs, ys]).unwrap().unwrap();
        assert_eq!(zipped.py_repr(), "[(1, 'a'), (2, 'b')]");
    }

    #[test]
    fn test_str_methods() {
        let s = Value::Str("hello world".into());
        assert_eq!(
            call_method(&s, "upper", &[]).unwrap().unwrap(),
            Value::Str("HELLO WORLD".into())
        );
        assert_eq!(
            call_method(&s, "split", &[]).unwrap().unwrap().py_repr(),
            "['hello', 'world']"
        );
        assert_eq!(
            call_method(&Value::Str(",".into()), "join", &[Value::list(vec![
                Value::Str("a".into()),
                Value::Str("b".into())
            ])])
            .unwrap()
            .unwrap(),
            Value::Str("a,b".into())
        );
    }

    #[test]
    fn test_list_methods_mutate_shared_storage() {
        let xs = Value::list(vec![Value::Int(1)]);
        let alias = xs.clone();
        call_method(&xs, "append", &[Value::Int(2)]).unwrap().unwrap();
        assert_eq!(alias.py_repr(), "[1, 2]");
    }

    #[test]
    fn test_dict_methods() {
        let d = Value::map(vec![(Value::Str("a".into()), Value::Int(1))]);
        assert_eq!(
            call_method(&d, "get", &[Value::Str("a".into())]).unwrap().unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            call_method(&d, "get", &[Value::Str("z".into()), Value::Int(9)])
                .unwrap()
                .unwrap(),
            Value::Int(9)
        );
        let missing = call_method(&d, "pop", &[Value::Str("z".into())]).unwrap();
        assert!(matches!(missing, Err(e) if e.kind == "KeyError"));
    }

    #[test]
    fn test_json_module() {
        let parsed = call_pure("json.loads", &[Value::Str(r#"{"k": [1, 2]}"#.into())])
            .unwrap()
            .unwrap();
        assert_eq!(parsed.py_repr(), "{'k': [1, 2]}");
        let dumped = call_pure("json.dumps", &[parsed]).unwrap().unwrap();
        assert_eq!(dumped, Value::Str(r#"{"k":[1,2]}"#.into()));
    }

    #[test]
    fn test_re_module() {
        let found = call_pure(
            "re.findall",
            &[Value::Str(r"\d+".into()), Value::Str("a1 b22 c333".into())],
        )
        .unwrap()
        .unwrap();
        assert_eq!(found.py_repr(), "['1', '22', '333']");

        let missing = call_pure(
            "re.search",
            &[Value::Str(r"xyz".into()), Value::Str("abc".into())],
        )
        .unwrap()
        .unwrap();
        assert_eq!(missing, Value::Null);
    }

    #[test]
    fn test_py_cmp_ordering() {
        assert_eq!(
            py_cmp(&Value::Int(1), &Value::Float(2.0)).unwrap(),
            Ordering::Less
        );
        assert!(py_cmp(&Value::Int(1), &Value::Str("a".into())).is_err());
    }
}
