//! Safety validation for parsed expressions
//!
//! Every node is checked before evaluation. Calls are limited to the
//! builtin allow-list, private names and attributes are rejected and the
//! tree depth is bounded.

use crate::error::ExpressionError;
use crate::expression::ast::Expr;
use crate::expression::functions::{ALLOWED_FUNCTIONS, FORBIDDEN_NAMES};
use crate::expression::placeholder::Reference;
use crate::expression::tokenizer::Token;
use crate::expression::value::eval_error;

/// Default maximum tree depth
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Statement keywords that have no place in an expression
const STATEMENT_KEYWORDS: &[&str] = &[
    "import", "from", "def", "class", "lambda", "return", "yield", "global", "nonlocal", "del",
    "pass", "raise", "try", "except", "while", "for", "with", "assert", "async", "await",
];

/// Expression validator
#[derive(Debug, Clone)]
pub struct ExpressionValidator {
    max_depth: usize,
}

impl Default for ExpressionValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionValidator {
    pub fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Reject statement keywords before parsing so the error names them
    pub fn check_tokens(&self, tokens: &[Token]) -> Result<(), ExpressionError> {
        for token in tokens {
            if let Token::Identifier(name) = token {
                if STATEMENT_KEYWORDS.contains(&name.as_str()) {
                    return Err(eval_error(format!("'{name}' statements are not allowed")));
                }
            }
        }
        Ok(())
    }

    /// Validate a parsed expression
    pub fn validate(&self, expr: &Expr) -> Result<(), ExpressionError> {
        self.validate_expression(expr, 0)
    }

    fn validate_expression(&self, expr: &Expr, depth: usize) -> Result<(), ExpressionError> {
        if depth > self.max_depth {
            return Err(eval_error(format!(
                "Expression too deeply nested (max depth: {})",
                self.max_depth
            )));
        }
        let next = depth + 1;

        match expr {
            Expr::Literal(_) => Ok(()),
            Expr::Name(name) => check_name(name),
            Expr::Reference(reference) => check_reference(reference),
            Expr::List(items) => items
                .iter()
                .try_for_each(|item| self.validate_expression(item, next)),
            Expr::Dict(entries) => entries.iter().try_for_each(|(key, value)| {
                self.validate_expression(key, next)?;
                self.validate_expression(value, next)
            }),
            Expr::Unary(_, operand) => self.validate_expression(operand, next),
            Expr::Binary(left, _, right) | Expr::Logical(left, _, right) => {
                self.validate_expression(left, next)?;
                self.validate_expression(right, next)
            }
            Expr::Compare(left, chain) => {
                self.validate_expression(left, next)?;
                chain
                    .iter()
                    .try_for_each(|(_, operand)| self.validate_expression(operand, next))
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                self.validate_expression(condition, next)?;
                self.validate_expression(then, next)?;
                self.validate_expression(otherwise, next)
            }
            Expr::Call { function, args } => {
                if FORBIDDEN_NAMES.contains(&function.as_str()) {
                    return Err(eval_error(format!("Call to '{function}' is not allowed")));
                }
                if !ALLOWED_FUNCTIONS.contains(&function.as_str()) {
                    return Err(eval_error(format!("Unknown function '{function}'")));
                }
                args.iter()
                    .try_for_each(|arg| self.validate_expression(arg, next))
            }
            Expr::Attribute(target, name) => {
                if name.starts_with('_') {
                    return Err(eval_error(format!(
                        "Access to private attribute '{name}' is not allowed"
                    )));
                }
                self.validate_expression(target, next)
            }
            Expr::Subscript(target, key) => {
                self.validate_expression(target, next)?;
                self.validate_expression(key, next)
            }
        }
    }
}

fn check_name(name: &str) -> Result<(), ExpressionError> {
    if name.starts_with("__") || FORBIDDEN_NAMES.contains(&name) {
        return Err(eval_error(format!("Use of name '{name}' is not allowed")));
    }
    Ok(())
}

fn check_reference(reference: &Reference) -> Result<(), ExpressionError> {
    match reference {
        Reference::Function { name, .. } if FORBIDDEN_NAMES.contains(&name.as_str()) => {
            Err(eval_error(format!("Call to '{name}' is not allowed")))
        }
        _ => Ok(()),
    }
}
