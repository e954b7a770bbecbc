//! Allow-listed functions
//!
//! Three families are exposed, and nothing outside them can be invoked:
//!
//! - pure builtins callable from expressions (`len`, `min`, `round`, ...)
//! - context-aware helpers callable inside `${...}` (`has_api_key`, ...)
//! - methods on resolved values inside `${...}` (`keys`, `lower`, ...)

use crate::error::ExpressionError;
use crate::expression::placeholder::{get_nested_value, parse_path};
use crate::expression::value::{
    as_num, compare, display, eval_error, float_value, is_truthy, type_name, values_equal, Num,
};
use crate::expression::Scope;
use serde_json::Value;
use std::cmp::Ordering;
use std::path::Path;

/// Pure functions callable from expressions
pub const ALLOWED_FUNCTIONS: &[&str] = &[
    "len", "str", "int", "float", "bool", "abs", "min", "max", "sum", "round", "any", "all",
];

/// Context-aware helpers callable as `${name(args)}`
pub const CONTEXT_HELPERS: &[&str] = &["has_api_key", "has_file", "get_env", "is_defined"];

/// Names that are never callable or referenceable
pub const FORBIDDEN_NAMES: &[&str] = &[
    "exec",
    "eval",
    "compile",
    "__import__",
    "import",
    "open",
    "getattr",
    "setattr",
    "delattr",
    "globals",
    "locals",
    "vars",
    "lambda",
    "def",
    "class",
];

fn expect_args(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), ExpressionError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(eval_error(format!(
            "{name}() takes {expected} argument(s) but {} were given",
            args.len()
        )));
    }
    Ok(())
}

/// Call one of the pure builtins
pub fn call_builtin(name: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    match name {
        "len" => {
            expect_args(name, args, 1, 1)?;
            let len = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => {
                    return Err(eval_error(format!(
                        "object of type '{}' has no len()",
                        type_name(other)
                    )))
                }
            };
            Ok(Value::from(len as u64))
        }
        "str" => {
            expect_args(name, args, 0, 1)?;
            Ok(Value::String(args.first().map(display).unwrap_or_default()))
        }
        "int" => {
            expect_args(name, args, 0, 1)?;
            args.first().map(to_int).unwrap_or(Ok(Value::from(0)))
        }
        "float" => {
            expect_args(name, args, 0, 1)?;
            args.first().map(to_float).unwrap_or(Ok(Value::from(0.0)))
        }
        "bool" => {
            expect_args(name, args, 0, 1)?;
            Ok(Value::Bool(args.first().map(is_truthy).unwrap_or(false)))
        }
        "abs" => {
            expect_args(name, args, 1, 1)?;
            match as_num(&args[0]) {
                Some(Num::Int(i)) => Ok(i
                    .checked_abs()
                    .map(Value::from)
                    .unwrap_or_else(|| Value::from((i as f64).abs()))),
                Some(Num::Float(f)) => float_value(f.abs()),
                None => Err(eval_error(format!(
                    "bad operand type for abs(): '{}'",
                    type_name(&args[0])
                ))),
            }
        }
        "min" => extremum(name, args, Ordering::Less),
        "max" => extremum(name, args, Ordering::Greater),
        "sum" => {
            expect_args(name, args, 1, 2)?;
            let items = iterable(name, &args[0])?;
            let mut total = args.get(1).cloned().unwrap_or(Value::from(0));
            for item in items {
                total = crate::expression::value::add(&total, &item)?;
            }
            Ok(total)
        }
        "round" => {
            expect_args(name, args, 1, 2)?;
            round(&args[0], args.get(1))
        }
        "any" => {
            expect_args(name, args, 1, 1)?;
            Ok(Value::Bool(iterable(name, &args[0])?.iter().any(is_truthy)))
        }
        "all" => {
            expect_args(name, args, 1, 1)?;
            Ok(Value::Bool(iterable(name, &args[0])?.iter().all(is_truthy)))
        }
        other => Err(eval_error(format!("Unknown function '{other}'"))),
    }
}

fn iterable(name: &str, value: &Value) -> Result<Vec<Value>, ExpressionError> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => Ok(map.keys().cloned().map(Value::String).collect()),
        Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
        other => Err(eval_error(format!(
            "{name}(): '{}' object is not iterable",
            type_name(other)
        ))),
    }
}

fn extremum(name: &str, args: &[Value], wanted: Ordering) -> Result<Value, ExpressionError> {
    let candidates = match args {
        [] => return Err(eval_error(format!("{name}() expected at least 1 argument"))),
        [single] => iterable(name, single)?,
        many => many.to_vec(),
    };
    let mut best: Option<Value> = None;
    for candidate in candidates {
        best = Some(match best {
            None => candidate,
            Some(current) => match compare(&candidate, &current) {
                Some(ordering) if ordering == wanted => candidate,
                Some(_) => current,
                None => {
                    return Err(eval_error(format!(
                        "{name}(): cannot compare '{}' and '{}'",
                        type_name(&candidate),
                        type_name(&current)
                    )))
                }
            },
        });
    }
    best.ok_or_else(|| eval_error(format!("{name}() arg is an empty sequence")))
}

fn to_int(value: &Value) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| eval_error(format!("invalid literal for int(): '{s}'"))),
        other => match as_num(other) {
            Some(Num::Int(i)) => Ok(Value::from(i)),
            Some(Num::Float(f)) if f.is_finite() => Ok(Value::from(f.trunc() as i64)),
            _ => Err(eval_error(format!(
                "int() argument must be a string or a number, not '{}'",
                type_name(other)
            ))),
        },
    }
}

fn to_float(value: &Value) -> Result<Value, ExpressionError> {
    match value {
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| eval_error(format!("could not convert string to float: '{s}'")))
            .and_then(float_value),
        other => match as_num(other) {
            Some(num) => float_value(num.as_f64()),
            None => Err(eval_error(format!(
                "float() argument must be a string or a number, not '{}'",
                type_name(other)
            ))),
        },
    }
}

/// Round half to even; without `ndigits` the result is an integer
fn round(value: &Value, ndigits: Option<&Value>) -> Result<Value, ExpressionError> {
    let num = as_num(value).ok_or_else(|| {
        eval_error(format!(
            "type '{}' doesn't define __round__",
            type_name(value)
        ))
    })?;
    let digits = match ndigits {
        None | Some(Value::Null) => None,
        Some(d) => match as_num(d) {
            Some(Num::Int(i)) => Some(i),
            _ => return Err(eval_error("round() ndigits must be an integer")),
        },
    };

    match (num, digits) {
        (Num::Int(i), _) => Ok(Value::from(i)),
        (Num::Float(f), None) => Ok(Value::from(f.round_ties_even() as i64)),
        (Num::Float(f), Some(d)) => {
            let factor = 10f64.powi(d.clamp(-308, 308) as i32);
            float_value((f * factor).round_ties_even() / factor)
        }
    }
}

/// Call a context-aware helper; helpers see the whole scope
pub fn call_helper<S: Scope + ?Sized>(
    name: &str,
    args: &[Value],
    scope: &S,
) -> Result<Value, ExpressionError> {
    match name {
        "has_api_key" => {
            expect_args(name, args, 1, 1)?;
            let service = display(&args[0]);
            let key_var = format!("{}_API_KEY", service.to_uppercase());
            let present = [key_var.as_str(), service.as_str()]
                .iter()
                .any(|var| scope.env(var).map(|v| !v.is_empty()).unwrap_or(false));
            Ok(Value::Bool(present))
        }
        "has_file" => {
            expect_args(name, args, 1, 1)?;
            Ok(Value::Bool(Path::new(&display(&args[0])).exists()))
        }
        "get_env" => {
            expect_args(name, args, 1, 2)?;
            Ok(scope
                .env(&display(&args[0]))
                .map(Value::String)
                .or_else(|| args.get(1).cloned())
                .unwrap_or(Value::Null))
        }
        "is_defined" => {
            expect_args(name, args, 1, 1)?;
            let path = parse_path(&display(&args[0]))?;
            Ok(Value::Bool(!get_nested_value(scope, &path, None).is_null()))
        }
        other if FORBIDDEN_NAMES.contains(&other) => {
            Err(eval_error(format!("Call to '{other}' is not allowed")))
        }
        other => Err(eval_error(format!("Unknown helper function '{other}'"))),
    }
}

/// Call a method on a resolved value
pub fn call_method(receiver: &Value, method: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    let no_method = || {
        eval_error(format!(
            "'{}' object has no method '{method}'",
            type_name(receiver)
        ))
    };

    match (receiver, method) {
        (Value::Object(map), "keys") => {
            expect_args(method, args, 0, 0)?;
            Ok(Value::Array(map.keys().cloned().map(Value::String).collect()))
        }
        (Value::Object(map), "values") => {
            expect_args(method, args, 0, 0)?;
            Ok(Value::Array(map.values().cloned().collect()))
        }
        (Value::Object(map), "items") => {
            expect_args(method, args, 0, 0)?;
            Ok(Value::Array(
                map.iter()
                    .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                    .collect(),
            ))
        }
        (Value::Object(map), "get") => {
            expect_args(method, args, 1, 2)?;
            Ok(map
                .get(&display(&args[0]))
                .cloned()
                .or_else(|| args.get(1).cloned())
                .unwrap_or(Value::Null))
        }
        (Value::String(s), "lower") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "upper") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "strip") => Ok(Value::String(s.trim().to_string())),
        (Value::String(s), "isdigit") => Ok(Value::Bool(
            !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
        )),
        (Value::String(s), "startswith") => {
            expect_args(method, args, 1, 1)?;
            Ok(Value::Bool(s.starts_with(&display(&args[0]))))
        }
        (Value::String(s), "endswith") => {
            expect_args(method, args, 1, 1)?;
            Ok(Value::Bool(s.ends_with(&display(&args[0]))))
        }
        (Value::String(s), "split") => {
            expect_args(method, args, 0, 1)?;
            let parts: Vec<Value> = match args.first() {
                None | Some(Value::Null) => s.split_whitespace().map(Value::from).collect(),
                Some(sep) => {
                    let sep = display(sep);
                    if sep.is_empty() {
                        return Err(eval_error("split(): empty separator"));
                    }
                    s.split(sep.as_str()).map(Value::from).collect()
                }
            };
            Ok(Value::Array(parts))
        }
        (Value::String(s), "count") => {
            expect_args(method, args, 1, 1)?;
            let needle = display(&args[0]);
            if needle.is_empty() {
                return Ok(Value::from(s.chars().count() as u64 + 1));
            }
            Ok(Value::from(s.matches(needle.as_str()).count() as u64))
        }
        (Value::Array(items), "count") => {
            expect_args(method, args, 1, 1)?;
            Ok(Value::from(
                items.iter().filter(|item| values_equal(item, &args[0])).count() as u64,
            ))
        }
        (Value::Array(items), "index") => {
            expect_args(method, args, 1, 1)?;
            items
                .iter()
                .position(|item| values_equal(item, &args[0]))
                .map(|i| Value::from(i as u64))
                .ok_or_else(|| eval_error(format!("{} is not in list", display(&args[0]))))
        }
        _ => Err(no_method()),
    }
}
