//! `${...}` references and path resolution
//!
//! A reference body takes one of three shapes:
//!
//! - a path with an optional default: `steps.baseline.metrics.score`,
//!   `datasets[0].name`, `env.DEBUG:-false`
//! - a bound method call on a resolved path: `variables.ids.count('X')`
//! - a bare helper call: `has_api_key('OPENAI')`
//!
//! Paths are resolved leniently: a missing key, an out-of-range index or a
//! type mismatch yields the declared default (or null) rather than an error.

use crate::error::ExpressionError;
use crate::expression::functions;
use crate::expression::parser;
use crate::expression::value::{eval_error, list_index, values_equal};
use crate::expression::Scope;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;

/// One step of a path
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Key(String),
    Index(i64),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, "{key}"),
            PathSegment::Index(index) => write!(f, "[{index}]"),
        }
    }
}

/// Parsed body of a `${...}` reference
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    Path {
        path: Vec<PathSegment>,
        default: Option<Value>,
    },
    Method {
        target: Vec<PathSegment>,
        method: String,
        args: Vec<Value>,
    },
    Function {
        name: String,
        args: Vec<Value>,
    },
}

impl Reference {
    /// Parse the text between `${` and `}`
    pub fn parse(body: &str) -> Result<Self, ExpressionError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(eval_error("Empty '${}' reference"));
        }

        let (target, default) = match find_unquoted(body, ":-") {
            Some(pos) => (body[..pos].trim(), Some(parse_literal(body[pos + 2..].trim())?)),
            None => (body, None),
        };

        if target.ends_with(')') {
            if let Some(open) = find_unquoted(target, "(") {
                if default.is_some() {
                    return Err(eval_error("Defaults are not supported on calls"));
                }
                let callee = target[..open].trim();
                let args = parse_arguments(&target[open + 1..target.len() - 1])?;
                return match callee.rfind('.') {
                    Some(dot) => {
                        let method = callee[dot + 1..].trim();
                        check_member_name(method)?;
                        Ok(Reference::Method {
                            target: parse_path(&callee[..dot])?,
                            method: method.to_string(),
                            args,
                        })
                    }
                    None => {
                        check_member_name(callee)?;
                        Ok(Reference::Function {
                            name: callee.to_string(),
                            args,
                        })
                    }
                };
            }
        }

        Ok(Reference::Path {
            path: parse_path(target)?,
            default,
        })
    }

    /// Resolve the reference against a scope
    pub fn resolve<S: Scope + ?Sized>(&self, scope: &S) -> Result<Value, ExpressionError> {
        match self {
            Reference::Path { path, default } => Ok(get_nested_value(scope, path, default.as_ref())),
            Reference::Method {
                target,
                method,
                args,
            } => {
                let receiver = get_nested_value(scope, target, None);
                functions::call_method(&receiver, method, args)
            }
            Reference::Function { name, args } => functions::call_helper(name, args, scope),
        }
    }
}

/// Reject private member names in dotted access and calls
fn check_member_name(name: &str) -> Result<(), ExpressionError> {
    if name.is_empty() {
        return Err(eval_error("Empty name in reference"));
    }
    if name.starts_with('_') {
        return Err(eval_error(format!(
            "Access to private attribute '{name}' is not allowed"
        )));
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Err(eval_error(format!("Invalid name '{name}' in reference")));
    }
    Ok(())
}

/// Find `needle` outside of quotes, brackets and parentheses
fn find_unquoted(text: &str, needle: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut depth = 0i32;
    let mut escaped = false;

    for (pos, ch) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        if depth == 0 && text[pos..].starts_with(needle) {
            return Some(pos);
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '[' | '(' => depth += 1,
            ']' | ')' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Split a dotted/bracketed path into segments
pub fn parse_path(text: &str) -> Result<Vec<PathSegment>, ExpressionError> {
    let mut segments = Vec::new();
    let mut chars = text.trim().chars().peekable();
    let mut current = String::new();
    let mut after_bracket = false;

    let flush = |current: &mut String, segments: &mut Vec<PathSegment>| -> Result<(), ExpressionError> {
        if !current.is_empty() {
            check_member_name(current)?;
            segments.push(PathSegment::Key(std::mem::take(current)));
        }
        Ok(())
    };

    while let Some(ch) = chars.next() {
        match ch {
            '.' => {
                if current.is_empty() && !after_bracket {
                    return Err(eval_error(format!("Empty segment in path '{text}'")));
                }
                flush(&mut current, &mut segments)?;
                after_bracket = false;
            }
            '[' => {
                flush(&mut current, &mut segments)?;
                let mut inner = String::new();
                let mut closed = false;
                let mut quote: Option<char> = None;
                for c in chars.by_ref() {
                    match quote {
                        Some(q) if c == q => {
                            quote = None;
                            inner.push(c);
                        }
                        Some(_) => inner.push(c),
                        None if c == '\'' || c == '"' => {
                            quote = Some(c);
                            inner.push(c);
                        }
                        None if c == ']' => {
                            closed = true;
                            break;
                        }
                        None => inner.push(c),
                    }
                }
                if !closed {
                    return Err(eval_error(format!("Unclosed '[' in path '{text}'")));
                }
                segments.push(parse_bracket_segment(inner.trim())?);
                after_bracket = true;
            }
            c if c.is_whitespace() => {
                return Err(eval_error(format!("Unexpected whitespace in path '{text}'")));
            }
            c => {
                current.push(c);
                after_bracket = false;
            }
        }
    }
    flush(&mut current, &mut segments)?;

    match segments.first() {
        None => Err(eval_error("Empty path")),
        Some(PathSegment::Index(_)) => {
            Err(eval_error(format!("Path '{text}' must start with a name")))
        }
        Some(_) => Ok(segments),
    }
}

fn parse_bracket_segment(inner: &str) -> Result<PathSegment, ExpressionError> {
    if inner.len() >= 2
        && ((inner.starts_with('\'') && inner.ends_with('\''))
            || (inner.starts_with('"') && inner.ends_with('"')))
    {
        return Ok(PathSegment::Key(inner[1..inner.len() - 1].to_string()));
    }
    match inner.parse::<i64>() {
        Ok(index) => Ok(PathSegment::Index(index)),
        Err(_) if !inner.is_empty() => Ok(PathSegment::Key(inner.to_string())),
        Err(_) => Err(eval_error("Empty '[]' in path")),
    }
}

/// Walk a path through the scope.
///
/// Resolution stops early and returns the default as soon as a fetched value
/// equals it, mirroring a lookup-with-default at every level.
pub fn get_nested_value<S: Scope + ?Sized>(
    scope: &S,
    path: &[PathSegment],
    default: Option<&Value>,
) -> Value {
    let fallback = || default.cloned().unwrap_or(Value::Null);

    let Some((PathSegment::Key(root), rest)) = path.split_first() else {
        return fallback();
    };

    // Fetch `root.key` in one step unless the default could equal the root
    let shortcut = match (rest.first(), default) {
        (_, Some(Value::Object(_) | Value::Array(_))) => None,
        (Some(PathSegment::Key(key)), _) => Some(key),
        _ => None,
    };
    let (start, rest) = match shortcut {
        Some(key) => (scope.member(root, key), &rest[1..]),
        None => (scope.root(root), rest),
    };
    let mut current: Cow<'_, Value> = match start {
        Some(value) => value,
        None => return fallback(),
    };

    for segment in rest {
        if let Some(d) = default {
            if values_equal(&current, d) {
                return d.clone();
            }
        }
        let next = match current {
            Cow::Borrowed(value) => step_into(value, segment).map(Cow::Borrowed),
            Cow::Owned(value) => step_into(&value, segment).cloned().map(Cow::Owned),
        };
        match next {
            Some(value) => current = value,
            None => return fallback(),
        }
    }

    current.into_owned()
}

fn step_into<'v>(value: &'v Value, segment: &PathSegment) -> Option<&'v Value> {
    match (value, segment) {
        (Value::Object(map), PathSegment::Key(key)) => map.get(key),
        (Value::Object(map), PathSegment::Index(index)) => map.get(&index.to_string()),
        (Value::Array(items), PathSegment::Index(index)) => {
            list_index(items.len(), *index).map(|i| &items[i])
        }
        (Value::Array(items), PathSegment::Key(key)) => key
            .parse::<i64>()
            .ok()
            .and_then(|index| list_index(items.len(), index))
            .map(|i| &items[i]),
        _ => None,
    }
}

/// Parse a default or argument literal.
///
/// Quoted text, booleans, null and numbers parse as such; anything else is
/// taken as a bare string.
pub fn parse_literal(text: &str) -> Result<Value, ExpressionError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Value::String(String::new()));
    }
    match parser::parse_constant(text) {
        Ok(value) => Ok(value),
        Err(_) => Ok(Value::String(text.to_string())),
    }
}

/// Parse call arguments with quote and bracket awareness
fn parse_arguments(text: &str) -> Result<Vec<Value>, ExpressionError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let mut args = Vec::new();
    let mut rest = text;
    loop {
        match find_unquoted(rest, ",") {
            Some(pos) => {
                args.push(parse_literal(&rest[..pos])?);
                rest = &rest[pos + 1..];
            }
            None => {
                args.push(parse_literal(rest)?);
                break;
            }
        }
    }
    Ok(args)
}
