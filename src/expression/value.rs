//! Value semantics for expression evaluation
//!
//! Expression values are plain `serde_json::Value`s so that context data,
//! action results and checkpoints share one representation. This module
//! gives them the semantics the expression language needs: truthiness,
//! textual rendering, equality with numeric normalisation, ordering and
//! arithmetic with an integer/float distinction.

use crate::error::ExpressionError;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// Build an evaluation error; the expression text is attached by the caller
pub(crate) fn eval_error(message: impl Into<String>) -> ExpressionError {
    ExpressionError::new(String::new(), message)
}

/// Numeric view of a value, keeping integers exact
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    pub fn into_value(self) -> Result<Value, ExpressionError> {
        match self {
            Num::Int(i) => Ok(Value::from(i)),
            Num::Float(f) => float_value(f),
        }
    }
}

/// Convert an f64 into a JSON value, rejecting NaN and infinities
pub fn float_value(f: f64) -> Result<Value, ExpressionError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| eval_error(format!("Result {f} is not a finite number")))
}

/// Numeric view of a value; booleans count as 0/1
pub fn as_num(value: &Value) -> Option<Num> {
    match value {
        Value::Bool(b) => Some(Num::Int(i64::from(*b))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Num::Int(i))
            } else {
                n.as_f64().map(Num::Float)
            }
        }
        _ => None,
    }
}

/// Check if the value is truthy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Short type name used in error messages
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "None",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Literal rendering: strings are quoted, booleans render as `True`/`False`
pub fn repr(value: &Value) -> String {
    match value {
        Value::String(s) => quote(s),
        other => render(other),
    }
}

/// Display rendering: strings render bare, everything else as its literal form
pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => render(other),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => render_number(n),
        Value::String(s) => quote(s),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(repr).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", quote(k), repr(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

fn render_number(n: &Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e16 => format!("{f:.1}"),
        _ => n.to_string(),
    }
}

fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

/// Equality with numeric normalisation (`1 == 1.0`, `True == 1`)
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).map(|o| values_equal(v, o)).unwrap_or(false))
        }
        _ => match (as_num(left), as_num(right)) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
            (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
            _ => left == right,
        },
    }
}

/// Ordering between two values, `None` when they are not comparable
pub fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b) {
                match compare(x, y)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        _ => match (as_num(left), as_num(right)) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => Some(a.cmp(&b)),
            (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()),
            _ => None,
        },
    }
}

fn unsupported(op: &str, left: &Value, right: &Value) -> ExpressionError {
    eval_error(format!(
        "Unsupported operand types for {op}: '{}' and '{}'",
        type_name(left),
        type_name(right)
    ))
}

fn numeric_pair(op: &str, left: &Value, right: &Value) -> Result<(Num, Num), ExpressionError> {
    match (as_num(left), as_num(right)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(unsupported(op, left, right)),
    }
}

fn int_or_float(
    a: Num,
    b: Num,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, ExpressionError> {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => match int_op(x, y) {
            Some(result) => Ok(Value::from(result)),
            None => float_value(float_op(x as f64, y as f64)),
        },
        _ => float_value(float_op(a.as_f64(), b.as_f64())),
    }
}

pub fn add(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::Array(a), Value::Array(b)) => {
            let mut joined = a.clone();
            joined.extend(b.iter().cloned());
            Ok(Value::Array(joined))
        }
        _ => {
            let (a, b) = numeric_pair("+", left, right)?;
            int_or_float(a, b, i64::checked_add, |x, y| x + y)
        }
    }
}

pub fn subtract(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    let (a, b) = numeric_pair("-", left, right)?;
    int_or_float(a, b, i64::checked_sub, |x, y| x - y)
}

/// Largest string `str * int` may produce
pub const MAX_REPEATED_LEN: usize = 10 * 1024 * 1024;

pub fn multiply(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    match (left, right) {
        (Value::String(s), Value::Number(_)) | (Value::Number(_), Value::String(s)) => {
            let times = repeat_count(if left.is_string() { right } else { left })
                .ok_or_else(|| unsupported("*", left, right))?;
            match s.len().checked_mul(times) {
                Some(size) if size <= MAX_REPEATED_LEN => Ok(Value::String(s.repeat(times))),
                _ => Err(eval_error(format!(
                    "Repeated string would exceed {MAX_REPEATED_LEN} bytes"
                ))),
            }
        }
        _ => {
            let (a, b) = numeric_pair("*", left, right)?;
            int_or_float(a, b, i64::checked_mul, |x, y| x * y)
        }
    }
}

fn repeat_count(value: &Value) -> Option<usize> {
    match as_num(value)? {
        Num::Int(i) => Some(usize::try_from(i).unwrap_or(0)),
        Num::Float(_) => None,
    }
}

/// True division, always producing a float
pub fn divide(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    let (a, b) = numeric_pair("/", left, right)?;
    if b.as_f64() == 0.0 {
        return Err(eval_error("division by zero"));
    }
    float_value(a.as_f64() / b.as_f64())
}

/// Floor division, rounding toward negative infinity
pub fn floor_divide(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    let (a, b) = numeric_pair("//", left, right)?;
    if b.as_f64() == 0.0 {
        return Err(eval_error("integer division by zero"));
    }
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => match (x.checked_div(y), x.checked_rem(y)) {
            // truncated quotient, stepped down when the signs differ
            (Some(q), Some(r)) if r != 0 && (r < 0) != (y < 0) => Ok(Value::from(q - 1)),
            (Some(q), Some(_)) => Ok(Value::from(q)),
            _ => float_value((x as f64 / y as f64).floor()),
        },
        _ => float_value((a.as_f64() / b.as_f64()).floor()),
    }
}

/// Modulo whose result takes the sign of the divisor
pub fn modulo(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    let (a, b) = numeric_pair("%", left, right)?;
    if b.as_f64() == 0.0 {
        return Err(eval_error("modulo by zero"));
    }
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => {
            let r = x.checked_rem(y).unwrap_or(0);
            Ok(Value::from(if r != 0 && (r < 0) != (y < 0) { r + y } else { r }))
        }
        _ => {
            let (x, y) = (a.as_f64(), b.as_f64());
            let r = x % y;
            float_value(if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r })
        }
    }
}

fn bitwise(
    op: &str,
    left: &Value,
    right: &Value,
    int_op: impl Fn(i64, i64) -> i64,
    bool_op: impl Fn(bool, bool) -> bool,
) -> Result<Value, ExpressionError> {
    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(bool_op(*a, *b))),
        _ => match numeric_pair(op, left, right)? {
            (Num::Int(a), Num::Int(b)) => Ok(Value::from(int_op(a, b))),
            _ => Err(unsupported(op, left, right)),
        },
    }
}

pub fn bit_and(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    bitwise("&", left, right, |a, b| a & b, |a, b| a & b)
}

pub fn bit_or(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    bitwise("|", left, right, |a, b| a | b, |a, b| a | b)
}

pub fn bit_xor(left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    bitwise("^", left, right, |a, b| a ^ b, |a, b| a ^ b)
}

pub fn negate(value: &Value) -> Result<Value, ExpressionError> {
    match as_num(value) {
        Some(Num::Int(i)) => Ok(i
            .checked_neg()
            .map(Value::from)
            .unwrap_or_else(|| Value::from(-(i as f64)))),
        Some(Num::Float(f)) => float_value(-f),
        None => Err(eval_error(format!(
            "Bad operand type for unary -: '{}'",
            type_name(value)
        ))),
    }
}

/// Subscript access; missing keys, out-of-range indices and mismatched
/// types all yield `None` rather than an error
pub fn subscript(container: &Value, key: &Value) -> Option<Value> {
    match (container, key) {
        (Value::Object(map), Value::String(k)) => map.get(k).cloned(),
        (Value::Object(map), other) => map.get(&display(other)).cloned(),
        (Value::Array(items), _) => {
            let index = match as_num(key)? {
                Num::Int(i) => i,
                Num::Float(_) => return None,
            };
            list_index(items.len(), index).map(|i| items[i].clone())
        }
        (Value::String(s), _) => {
            let index = match as_num(key)? {
                Num::Int(i) => i,
                Num::Float(_) => return None,
            };
            let chars: Vec<char> = s.chars().collect();
            list_index(chars.len(), index).map(|i| Value::String(chars[i].to_string()))
        }
        _ => None,
    }
}

/// Resolve a possibly negative index against a length
pub fn list_index(len: usize, index: i64) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        usize::try_from(resolved).ok()
    } else {
        None
    }
}

/// Convenience constructor for map values
pub fn object(entries: impl IntoIterator<Item = (String, Value)>) -> Value {
    Value::Object(entries.into_iter().collect::<Map<String, Value>>())
}
