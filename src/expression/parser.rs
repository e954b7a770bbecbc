//! Recursive-descent parser for the expression language
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! ternary     := or_expr ( "?" ternary ":" ternary | "if" or_expr "else" ternary )?
//! or_expr     := and_expr ( ("or" | "||") and_expr )*
//! and_expr    := not_expr ( ("and" | "&&") not_expr )*
//! not_expr    := ("not" | "!") not_expr | comparison
//! comparison  := bit_or ( comp_op bit_or )*
//! bit_or      := bit_xor ( "|" bit_xor )*
//! bit_xor     := bit_and ( "^" bit_and )*
//! bit_and     := additive ( "&" additive )*
//! additive    := term ( ("+" | "-") term )*
//! term        := unary ( ("*" | "/" | "//" | "%") unary )*
//! unary       := ("-" | "+") unary | postfix
//! postfix     := primary ( "[" ternary "]" | "." NAME | "(" args ")" )*
//! primary     := literal | NAME | PLACEHOLDER | "(" ternary ")" | list | dict
//! ```

use crate::error::ExpressionError;
use crate::expression::ast::{BinaryOp, CompareOp, Expr, LogicalOp, UnaryOp};
use crate::expression::placeholder::Reference;
use crate::expression::tokenizer::{tokenize, Token};
use crate::expression::value::{eval_error, negate};
use serde_json::{Map, Value};

/// Limit on nested groups, calls, subscripts, unary operators and ternary
/// branches. Each level costs a full descent through the precedence chain,
/// so this keeps the deepest accepted expression well inside a 2 MiB stack.
pub const MAX_NESTING: usize = 32;

/// Longest accepted expression. Operator chains such as `a + b + ...` grow
/// the tree without recursing in the parser, so the tree depth is bounded
/// by the token count instead.
pub const MAX_TOKENS: usize = 1024;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nesting: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            nesting: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ExpressionError> {
        match self.advance() {
            Some(found) if found == token => Ok(()),
            Some(found) => Err(eval_error(format!(
                "Expected {token:?} but found {found:?}"
            ))),
            None => Err(eval_error(format!(
                "Expected {token:?} but reached end of expression"
            ))),
        }
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(eval_error("Expression is nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.nesting -= 1;
    }

    fn parse_ternary(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let result = self.parse_ternary_inner();
        self.leave();
        result
    }

    fn parse_ternary_inner(&mut self) -> Result<Expr, ExpressionError> {
        let first = self.parse_or()?;

        if self.eat(&Token::Question) {
            let then = self.parse_ternary()?;
            self.expect(Token::Colon)?;
            let otherwise = self.parse_ternary()?;
            return Ok(Expr::Conditional {
                condition: Box::new(first),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }

        if self.eat(&Token::If) {
            let condition = self.parse_or()?;
            self.expect(Token::Else)?;
            let otherwise = self.parse_ternary()?;
            return Ok(Expr::Conditional {
                condition: Box::new(condition),
                then: Box::new(first),
                otherwise: Box::new(otherwise),
            });
        }

        Ok(first)
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Logical(Box::new(left), LogicalOp::Or, Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::Logical(Box::new(left), LogicalOp::And, Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Not) {
            self.enter()?;
            let operand = self.parse_not();
            self.leave();
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand?)));
        }
        self.parse_comparison()
    }

    fn comparison_op(&self) -> Option<CompareOp> {
        match self.peek()? {
            Token::Equal => Some(CompareOp::Equal),
            Token::NotEqual => Some(CompareOp::NotEqual),
            Token::Less => Some(CompareOp::Less),
            Token::LessEqual => Some(CompareOp::LessEqual),
            Token::Greater => Some(CompareOp::Greater),
            Token::GreaterEqual => Some(CompareOp::GreaterEqual),
            _ => None,
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_bit_or()?;
        let mut chain = Vec::new();
        while let Some(op) = self.comparison_op() {
            self.pos += 1;
            chain.push((op, self.parse_bit_or()?));
        }
        if chain.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), chain))
        }
    }

    fn parse_binary_level(
        &mut self,
        operators: &[(Token, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ExpressionError>,
    ) -> Result<Expr, ExpressionError> {
        let mut left = next(self)?;
        'outer: loop {
            for (token, op) in operators {
                if self.eat(token) {
                    let right = next(self)?;
                    left = Expr::Binary(Box::new(left), *op, Box::new(right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_bit_or(&mut self) -> Result<Expr, ExpressionError> {
        self.parse_binary_level(&[(Token::Pipe, BinaryOp::BitOr)], Self::parse_bit_xor)
    }

    fn parse_bit_xor(&mut self) -> Result<Expr, ExpressionError> {
        self.parse_binary_level(&[(Token::Caret, BinaryOp::BitXor)], Self::parse_bit_and)
    }

    fn parse_bit_and(&mut self) -> Result<Expr, ExpressionError> {
        self.parse_binary_level(&[(Token::Ampersand, BinaryOp::BitAnd)], Self::parse_additive)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        self.parse_binary_level(
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Subtract)],
            Self::parse_term,
        )
    }

    fn parse_term(&mut self) -> Result<Expr, ExpressionError> {
        self.parse_binary_level(
            &[
                (Token::Star, BinaryOp::Multiply),
                (Token::DoubleSlash, BinaryOp::FloorDivide),
                (Token::Slash, BinaryOp::Divide),
                (Token::Percent, BinaryOp::Modulo),
            ],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        let op = match self.peek() {
            Some(Token::Minus) => UnaryOp::Negate,
            Some(Token::Plus) => UnaryOp::Plus,
            _ => return self.parse_postfix(),
        };
        self.pos += 1;
        self.enter()?;
        let operand = self.parse_unary();
        self.leave();
        Ok(Expr::Unary(op, Box::new(operand?)))
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::LeftBracket) {
                let key = self.parse_ternary()?;
                self.expect(Token::RightBracket)?;
                expr = Expr::Subscript(Box::new(expr), Box::new(key));
            } else if self.eat(&Token::Dot) {
                match self.advance() {
                    Some(Token::Identifier(name)) => {
                        expr = Expr::Attribute(Box::new(expr), name);
                    }
                    other => {
                        return Err(eval_error(format!(
                            "Expected attribute name after '.', found {other:?}"
                        )))
                    }
                }
            } else if self.check(&Token::LeftParen) {
                let function = match expr {
                    Expr::Name(name) => name,
                    Expr::Attribute(_, name) => {
                        return Err(eval_error(format!(
                            "Method call '{name}()' is only supported inside '${{...}}'"
                        )))
                    }
                    _ => return Err(eval_error("Only named functions can be called")),
                };
                self.pos += 1;
                let args = self.parse_sequence(Token::RightParen)?;
                expr = Expr::Call { function, args };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Comma-separated expressions up to `close`; a trailing comma is allowed
    fn parse_sequence(&mut self, close: Token) -> Result<Vec<Expr>, ExpressionError> {
        let mut items = Vec::new();
        while !self.eat(&close) {
            items.push(self.parse_ternary()?);
            if !self.eat(&Token::Comma) {
                self.expect(close)?;
                break;
            }
        }
        Ok(items)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self
            .advance()
            .ok_or_else(|| eval_error("Unexpected end of expression"))?;

        match token {
            Token::Int(i) => Ok(Expr::Literal(Value::from(i))),
            Token::Float(f) => Ok(Expr::Literal(
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| eval_error(format!("Invalid float literal {f}")))?,
            )),
            Token::String(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Boolean(b) => Ok(Expr::Literal(Value::Bool(b))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Identifier(name) => Ok(Expr::Name(name)),
            Token::Placeholder(body) => Ok(Expr::Reference(Reference::parse(&body)?)),
            Token::LeftParen => {
                let inner = self.parse_ternary()?;
                self.expect(Token::RightParen)?;
                Ok(inner)
            }
            Token::LeftBracket => Ok(Expr::List(self.parse_sequence(Token::RightBracket)?)),
            Token::LeftBrace => {
                self.enter()?;
                let entries = self.parse_dict_entries();
                self.leave();
                Ok(Expr::Dict(entries?))
            }
            other => Err(eval_error(format!("Unexpected token {other:?}"))),
        }
    }

    fn parse_dict_entries(&mut self) -> Result<Vec<(Expr, Expr)>, ExpressionError> {
        let mut entries = Vec::new();
        while !self.eat(&Token::RightBrace) {
            let key = self.parse_or()?;
            self.expect(Token::Colon)?;
            let value = self.parse_ternary()?;
            entries.push((key, value));
            if !self.eat(&Token::Comma) {
                self.expect(Token::RightBrace)?;
                break;
            }
        }
        Ok(entries)
    }
}

/// Parse an expression string into a syntax tree.
///
/// Returns `Ok(None)` for blank input.
pub fn parse_expression(input: &str) -> Result<Option<Expr>, ExpressionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Ok(None);
    }
    if tokens.len() > MAX_TOKENS {
        return Err(eval_error(format!(
            "Expression is too long ({} tokens, max {MAX_TOKENS})",
            tokens.len()
        )));
    }

    let mut parser = Parser::new(tokens);
    let expr = parser.parse_ternary()?;
    if let Some(extra) = parser.peek() {
        return Err(eval_error(format!("Unexpected token {extra:?} after expression")));
    }
    Ok(Some(expr))
}

/// Parse a constant literal: scalars, signed numbers and lists/dicts of
/// constants. Names and references are rejected.
pub fn parse_constant(input: &str) -> Result<Value, ExpressionError> {
    let expr = parse_expression(input)?.ok_or_else(|| eval_error("Empty constant"))?;
    constant_value(&expr)
}

fn constant_value(expr: &Expr) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Unary(UnaryOp::Negate, operand) => negate(&constant_value(operand)?),
        Expr::Unary(UnaryOp::Plus, operand) => match constant_value(operand)? {
            value @ Value::Number(_) => Ok(value),
            _ => Err(eval_error("Unary '+' requires a number")),
        },
        Expr::List(items) => items
            .iter()
            .map(constant_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Dict(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                let key = match constant_value(key)? {
                    Value::String(s) => s,
                    other => crate::expression::value::display(&other),
                };
                map.insert(key, constant_value(value)?);
            }
            Ok(Value::Object(map))
        }
        _ => Err(eval_error("Not a constant literal")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(input: &str) -> Expr {
        parse_expression(input).unwrap().unwrap()
    }

    #[test]
    fn test_precedence() {
        let expr = parse("1 + 2 * 3");
        assert_eq!(
            expr,
            Expr::Binary(
                Box::new(Expr::Literal(json!(1))),
                BinaryOp::Add,
                Box::new(Expr::Binary(
                    Box::new(Expr::Literal(json!(2))),
                    BinaryOp::Multiply,
                    Box::new(Expr::Literal(json!(3))),
                )),
            )
        );
    }

    #[test]
    fn test_both_ternary_forms() {
        let question = parse("${x} > 0 ? 1 : 2");
        let python = parse("1 if ${x} > 0 else 2");
        assert_eq!(question, python);
    }

    #[test]
    fn test_nested_ternary_is_right_associative() {
        match parse("a ? 1 : b ? 2 : 3") {
            Expr::Conditional { otherwise, .. } => {
                assert!(matches!(*otherwise, Expr::Conditional { .. }));
            }
            other => panic!("unexpected expression: {other:?}"),
        }
    }

    #[test]
    fn test_string_with_colon_inside_ternary() {
        match parse("flag ? 'a:b' : 'c?d'") {
            Expr::Conditional { then, otherwise, .. } => {
                assert_eq!(*then, Expr::Literal(json!("a:b")));
                assert_eq!(*otherwise, Expr::Literal(json!("c?d")));
            }
            other => panic!("unexpected expression: {other:?}"),
        }
    }

    #[test]
    fn test_comparison_chain() {
        match parse("0 < x <= 10") {
            Expr::Compare(_, chain) => assert_eq!(chain.len(), 2),
            other => panic!("unexpected expression: {other:?}"),
        }
    }

    #[test]
    fn test_calls_and_postfix() {
        assert_eq!(
            parse("len([1, 2])"),
            Expr::Call {
                function: "len".to_string(),
                args: vec![Expr::List(vec![
                    Expr::Literal(json!(1)),
                    Expr::Literal(json!(2))
                ])],
            }
        );
        assert!(matches!(parse("d['k'].name"), Expr::Attribute(_, _)));
        assert!(parse_expression("x.lower()").is_err());
        assert!(parse_expression("(1)(2)").is_err());
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse_expression("1 +").is_err());
        assert!(parse_expression("(1 + 2").is_err());
        assert!(parse_expression("1 2").is_err());
        assert!(parse_expression("a ? b").is_err());
        assert_eq!(parse_expression("   ").unwrap(), None);
    }

    fn nested(open: &str, close: &str, depth: usize) -> String {
        format!("{}1{}", open.repeat(depth), close.repeat(depth))
    }

    #[test]
    fn test_runaway_nesting_is_rejected() {
        let err = parse_expression(&nested("(", ")", 1000)).unwrap_err();
        assert!(err.message.contains("nested too deeply"));
        assert!(parse_expression(&nested("{'k': ", "}", 100)).is_err());
        assert!(parse_expression(&nested("not ", "", 100)).is_err());
    }

    #[test]
    fn test_deepest_accepted_nesting_fits_a_small_stack() {
        // the outermost ternary takes one level
        let deepest = MAX_NESTING - 1;
        let worker = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || {
                let evaluator = crate::expression::ExpressionEvaluator::new();
                let scope = Map::new();
                for (open, close) in [("(", ")"), ("[", "]"), ("abs(", ")"), ("- ", ""), ("not ", "")] {
                    let accepted = nested(open, close, deepest);
                    assert!(
                        evaluator.evaluate(&accepted, &scope).is_ok(),
                        "rejected {open:?} x {deepest}"
                    );
                    let rejected = nested(open, close, deepest + 1);
                    assert!(
                        parse_expression(&rejected).is_err(),
                        "accepted {open:?} x {}",
                        deepest + 1
                    );
                }
            })
            .unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_long_operator_chains_are_bounded() {
        let within = format!("{}1", "1 + ".repeat(300));
        let err = crate::expression::ExpressionEvaluator::new()
            .evaluate(&within, &Map::new())
            .unwrap_err();
        assert!(err.message.contains("too deeply nested"));

        let beyond = format!("{}1", "1 + ".repeat(MAX_TOKENS));
        let err = parse_expression(&beyond).unwrap_err();
        assert!(err.message.contains("too long"));
    }

    #[test]
    fn test_parse_constant() {
        assert_eq!(parse_constant("'abc'").unwrap(), json!("abc"));
        assert_eq!(parse_constant("-3").unwrap(), json!(-3));
        assert_eq!(parse_constant("[1, 'a', None]").unwrap(), json!([1, "a", null]));
        assert_eq!(parse_constant("{'k': true}").unwrap(), json!({"k": true}));
        assert!(parse_constant("abc").is_err());
        assert!(parse_constant("1 + 2").is_err());
    }
}
