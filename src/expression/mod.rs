//! Sandboxed expression evaluation
//!
//! Expressions are tokenized, parsed into an [`ast::Expr`], checked by the
//! [`validator::ExpressionValidator`] and only then evaluated. Evaluation is
//! restricted to literals, context lookups, the allow-listed operators and
//! the allow-listed functions; there is no path from an expression to
//! arbitrary code.
//!
//! `${...}` references are part of the grammar rather than being spliced in
//! as text, so resolved values keep their types.

pub mod ast;
pub mod condition;
pub mod functions;
pub mod parser;
pub mod placeholder;
pub mod tokenizer;
pub mod validator;
pub mod value;

pub use condition::ConditionEvaluator;
pub use placeholder::{PathSegment, Reference};
pub use validator::ExpressionValidator;

use crate::error::ExpressionError;
use ast::{BinaryOp, CompareOp, Expr, LogicalOp, UnaryOp};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::cmp::Ordering;
use tokenizer::{tokenize, Token};
use value::{as_num, compare, display, eval_error, is_truthy, type_name, values_equal};

/// Root lookups for expression evaluation.
///
/// A scope answers "what is the value named `x`": the first segment of every
/// `${...}` path and every bare name in an expression goes through
/// [`Scope::root`].
pub trait Scope {
    fn root(&self, name: &str) -> Option<Cow<'_, Value>>;

    /// Second-level lookup (`root.key`). Scopes that do not store their
    /// roots as values override this to avoid materialising the whole root.
    fn member(&self, root: &str, key: &str) -> Option<Cow<'_, Value>> {
        match self.root(root)? {
            Cow::Borrowed(value) => value.get(key).map(Cow::Borrowed),
            Cow::Owned(value) => value.get(key).cloned().map(Cow::Owned),
        }
    }

    /// Environment variable lookup, read from the `env` root by default
    fn env(&self, name: &str) -> Option<String> {
        self.member("env", name).map(|value| display(&value))
    }
}

impl Scope for Map<String, Value> {
    fn root(&self, name: &str) -> Option<Cow<'_, Value>> {
        self.get(name).map(Cow::Borrowed)
    }
}

/// Evaluates expressions, `${...}` references and templates against a scope
#[derive(Debug, Clone, Default)]
pub struct ExpressionEvaluator {
    validator: ExpressionValidator,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom tree depth limit
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            validator: ExpressionValidator::with_max_depth(max_depth),
        }
    }

    /// Parse and validate without evaluating. Blank input yields `None`.
    pub fn compile(&self, expression: &str) -> Result<Option<Expr>, ExpressionError> {
        self.compile_checked(expression)
            .map_err(|e| e.in_expression(expression))
    }

    fn compile_checked(&self, expression: &str) -> Result<Option<Expr>, ExpressionError> {
        let tokens = tokenize(expression)?;
        self.validator.check_tokens(&tokens)?;
        let Some(expr) = parser::parse_expression(expression)? else {
            return Ok(None);
        };
        self.validator.validate(&expr)?;
        Ok(Some(expr))
    }

    /// Evaluate an expression. Blank input evaluates to `true`.
    ///
    /// # Examples
    ///
    /// ```
    /// use mapflow::expression::ExpressionEvaluator;
    /// use serde_json::{json, Map, Value};
    ///
    /// let scope: Map<String, Value> = json!({"x": 5}).as_object().cloned().unwrap();
    /// let evaluator = ExpressionEvaluator::new();
    /// assert_eq!(evaluator.evaluate("${x} > 0 ? 1 : 2", &scope).unwrap(), json!(1));
    /// assert_eq!(evaluator.evaluate("", &scope).unwrap(), json!(true));
    /// ```
    pub fn evaluate<S: Scope + ?Sized>(
        &self,
        expression: &str,
        scope: &S,
    ) -> Result<Value, ExpressionError> {
        match self.compile(expression)? {
            None => Ok(Value::Bool(true)),
            Some(expr) => self
                .eval(&expr, scope)
                .map_err(|e| e.in_expression(expression)),
        }
    }

    /// Evaluate an expression and coerce the result to a boolean
    pub fn evaluate_bool<S: Scope + ?Sized>(
        &self,
        expression: &str,
        scope: &S,
    ) -> Result<bool, ExpressionError> {
        self.evaluate(expression, scope).map(|v| is_truthy(&v))
    }

    /// Resolve the body of a single `${...}` reference
    pub fn resolve_reference<S: Scope + ?Sized>(
        &self,
        body: &str,
        scope: &S,
    ) -> Result<Value, ExpressionError> {
        let reference = Reference::parse(body).map_err(|e| e.in_expression(body))?;
        if let Reference::Function { name, .. } = &reference {
            if functions::FORBIDDEN_NAMES.contains(&name.as_str()) {
                return Err(ExpressionError::new(
                    body,
                    format!("Call to '{name}' is not allowed"),
                ));
            }
        }
        reference.resolve(scope).map_err(|e| e.in_expression(body))
    }

    /// Render every `${...}` in `template` in display form
    pub fn interpolate<S: Scope + ?Sized>(
        &self,
        template: &str,
        scope: &S,
    ) -> Result<String, ExpressionError> {
        let mut output = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            output.push_str(&rest[..start]);
            let after = &rest[start..];
            let (body, consumed) = tokenize_leading_placeholder(after)
                .map_err(|e| e.in_expression(template))?;
            let value = self
                .resolve_reference(&body, scope)
                .map_err(|e| ExpressionError::new(template, e.message))?;
            output.push_str(&display(&value));
            rest = &after[consumed..];
        }
        output.push_str(rest);
        Ok(output)
    }

    /// Resolve a parameter value leniently.
    ///
    /// Maps and lists are resolved element-wise. A string that is exactly one
    /// placeholder yields the typed value; otherwise a string containing
    /// `${` is evaluated as an expression, then interpolated as a template,
    /// and finally kept as the literal text.
    pub fn resolve_value<S: Scope + ?Sized>(&self, value: &Value, scope: &S) -> Value {
        match value {
            Value::String(text) if text.contains("${") => self.resolve_text(text, scope),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item, scope))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v, scope)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_text<S: Scope + ?Sized>(&self, text: &str, scope: &S) -> Value {
        let trimmed = text.trim();
        if let Ok((body, consumed)) = tokenize_leading_placeholder(trimmed) {
            if consumed == trimmed.len() {
                if let Ok(value) = self.resolve_reference(&body, scope) {
                    return value;
                }
            }
        }
        if let Ok(value) = self.evaluate(text, scope) {
            return value;
        }
        match self.interpolate(text, scope) {
            Ok(rendered) => Value::String(rendered),
            Err(e) => {
                tracing::debug!("Keeping literal value for '{}': {}", text, e.message);
                Value::String(text.to_string())
            }
        }
    }

    fn eval<S: Scope + ?Sized>(&self, expr: &Expr, scope: &S) -> Result<Value, ExpressionError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(name) => scope
                .root(name)
                .map(Cow::into_owned)
                .ok_or_else(|| eval_error(format!("Name '{name}' is not defined"))),
            Expr::Reference(reference) => reference.resolve(scope),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Dict(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    let key = match self.eval(key, scope)? {
                        Value::String(s) => s,
                        other => display(&other),
                    };
                    map.insert(key, self.eval(value, scope)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Unary(op, operand) => {
                let operand = self.eval(operand, scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!is_truthy(&operand))),
                    UnaryOp::Negate => value::negate(&operand),
                    UnaryOp::Plus => as_num(&operand)
                        .ok_or_else(|| {
                            eval_error(format!(
                                "bad operand type for unary +: '{}'",
                                type_name(&operand)
                            ))
                        })?
                        .into_value(),
                }
            }
            Expr::Binary(left, op, right) => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                match op {
                    BinaryOp::Add => value::add(&left, &right),
                    BinaryOp::Subtract => value::subtract(&left, &right),
                    BinaryOp::Multiply => value::multiply(&left, &right),
                    BinaryOp::Divide => value::divide(&left, &right),
                    BinaryOp::FloorDivide => value::floor_divide(&left, &right),
                    BinaryOp::Modulo => value::modulo(&left, &right),
                    BinaryOp::BitAnd => value::bit_and(&left, &right),
                    BinaryOp::BitOr => value::bit_or(&left, &right),
                    BinaryOp::BitXor => value::bit_xor(&left, &right),
                }
            }
            Expr::Logical(left, op, right) => {
                let left = self.eval(left, scope)?;
                match (op, is_truthy(&left)) {
                    (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(left),
                    _ => self.eval(right, scope),
                }
            }
            Expr::Compare(first, chain) => {
                let mut left = self.eval(first, scope)?;
                for (op, operand) in chain {
                    let right = self.eval(operand, scope)?;
                    if !compare_values(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                if is_truthy(&self.eval(condition, scope)?) {
                    self.eval(then, scope)
                } else {
                    self.eval(otherwise, scope)
                }
            }
            Expr::Call { function, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                functions::call_builtin(function, &args)
            }
            Expr::Attribute(target, name) => match self.eval(target, scope)? {
                Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
                other => Err(eval_error(format!(
                    "'{}' object has no attribute '{name}'",
                    type_name(&other)
                ))),
            },
            Expr::Subscript(target, key) => {
                let container = self.eval(target, scope)?;
                let key = self.eval(key, scope)?;
                Ok(value::subscript(&container, &key).unwrap_or(Value::Null))
            }
        }
    }
}

fn compare_values(op: CompareOp, left: &Value, right: &Value) -> Result<bool, ExpressionError> {
    let ordered = |accept: fn(Ordering) -> bool| {
        compare(left, right).map(accept).ok_or_else(|| {
            eval_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op.symbol(),
                type_name(left),
                type_name(right)
            ))
        })
    };
    match op {
        CompareOp::Equal => Ok(values_equal(left, right)),
        CompareOp::NotEqual => Ok(!values_equal(left, right)),
        CompareOp::Less => ordered(Ordering::is_lt),
        CompareOp::LessEqual => ordered(Ordering::is_le),
        CompareOp::Greater => ordered(Ordering::is_gt),
        CompareOp::GreaterEqual => ordered(Ordering::is_ge),
    }
}

/// Read the `${...}` at the start of `text`, returning its body and the
/// number of bytes consumed
fn tokenize_leading_placeholder(text: &str) -> Result<(String, usize), ExpressionError> {
    let inner = text
        .strip_prefix("${")
        .ok_or_else(|| eval_error("Expected '${'"))?;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (pos, ch) in inner.char_indices() {
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
        match ch {
            '\'' | '"' => quote = Some(ch),
            '{' => depth += 1,
            '}' if depth == 0 => {
                return match tokenize(&text[..pos + 3])?.as_slice() {
                    [Token::Placeholder(body)] => Ok((body.clone(), pos + 3)),
                    _ => Err(eval_error("Malformed '${...}' reference")),
                };
            }
            '}' => depth -= 1,
            _ => {}
        }
    }
    Err(eval_error("Unterminated '${' reference"))
}
