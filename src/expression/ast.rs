//! Abstract syntax tree for the restricted expression language
//!
//! These types are data-only and separate from parsing logic.

use crate::expression::placeholder::Reference;
use serde_json::Value;

/// Parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal constant
    Literal(Value),
    /// Bare name, looked up in the context
    Name(String),
    /// `${...}` reference resolved against the context
    Reference(Reference),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    /// Short-circuiting `and` / `or`
    Logical(Box<Expr>, LogicalOp, Box<Expr>),
    /// Comparison chain: `a < b <= c`
    Compare(Box<Expr>, Vec<(CompareOp, Expr)>),
    /// `then if condition else otherwise` or `condition ? then : otherwise`
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// Call of a named function
    Call { function: String, args: Vec<Expr> },
    /// `value.name`
    Attribute(Box<Expr>, String),
    /// `value[key]`
    Subscript(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
    BitAnd,
    BitOr,
    BitXor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Equal => "==",
            CompareOp::NotEqual => "!=",
            CompareOp::Less => "<",
            CompareOp::LessEqual => "<=",
            CompareOp::Greater => ">",
            CompareOp::GreaterEqual => ">=",
        }
    }
}
