//! Lexical analysis for the expression language
//!
//! Converts an expression string into tokens. `${...}` references are
//! captured whole as a single [`Token::Placeholder`] so that nothing inside a
//! reference is ever re-interpreted as expression syntax.
//!
//! The tokenizer delegates to small helpers:
//!
//! - **`parse_operator()`**: operator tokens with one character of lookahead
//! - **`parse_string()`**: quoted literals with backslash escapes
//! - **`parse_number()`**: integer and float literals
//! - **`parse_placeholder()`**: brace-balanced, quote-aware `${...}` bodies
//! - **`parse_keyword_or_identifier()`**: keywords versus names

use crate::error::ExpressionError;
use crate::expression::value::eval_error;
use std::iter::Peekable;
use std::str::Chars;

/// Token types for the lexer
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
    Identifier(String),
    Placeholder(String),

    // Keywords
    And,
    Or,
    Not,
    If,
    Else,

    // Arithmetic and bitwise operators
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    Ampersand,
    Pipe,
    Caret,

    // Comparison operators
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,

    // Punctuation
    Question,
    Colon,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
}

/// Parse operator and punctuation tokens.
///
/// Returns `Some(Token)` if the character starts an operator, `None` otherwise.
fn parse_operator(ch: char, chars: &mut Peekable<Chars>) -> Result<Option<Token>, ExpressionError> {
    let token = match ch {
        '+' => Token::Plus,
        '-' => Token::Minus,
        '*' => Token::Star,
        '%' => Token::Percent,
        '^' => Token::Caret,
        '?' => Token::Question,
        ':' => Token::Colon,
        '(' => Token::LeftParen,
        ')' => Token::RightParen,
        '[' => Token::LeftBracket,
        ']' => Token::RightBracket,
        '{' => Token::LeftBrace,
        '}' => Token::RightBrace,
        ',' => Token::Comma,
        '.' => Token::Dot,
        '/' => {
            chars.next();
            if chars.peek() == Some(&'/') {
                chars.next();
                return Ok(Some(Token::DoubleSlash));
            }
            return Ok(Some(Token::Slash));
        }
        '&' => {
            chars.next();
            if chars.peek() == Some(&'&') {
                chars.next();
                return Ok(Some(Token::And));
            }
            return Ok(Some(Token::Ampersand));
        }
        '|' => {
            chars.next();
            if chars.peek() == Some(&'|') {
                chars.next();
                return Ok(Some(Token::Or));
            }
            return Ok(Some(Token::Pipe));
        }
        '!' => {
            chars.next();
            if chars.peek() == Some(&'=') {
                chars.next();
                return Ok(Some(Token::NotEqual));
            }
            return Ok(Some(Token::Not));
        }
        '=' => {
            chars.next();
            if chars.peek() == Some(&'=') {
                chars.next();
                return Ok(Some(Token::Equal));
            }
            return Err(eval_error("Assignment is not allowed in expressions"));
        }
        '<' => {
            chars.next();
            if chars.peek() == Some(&'=') {
                chars.next();
                return Ok(Some(Token::LessEqual));
            }
            return Ok(Some(Token::Less));
        }
        '>' => {
            chars.next();
            if chars.peek() == Some(&'=') {
                chars.next();
                return Ok(Some(Token::GreaterEqual));
            }
            return Ok(Some(Token::Greater));
        }
        _ => return Ok(None),
    };
    chars.next();
    Ok(Some(token))
}

/// Parse a quoted string literal. The opening quote has been consumed.
fn parse_string(quote: char, chars: &mut Peekable<Chars>) -> Result<String, ExpressionError> {
    let mut string = String::new();
    while let Some(ch) = chars.next() {
        match ch {
            c if c == quote => return Ok(string),
            '\\' => match chars.next() {
                Some('n') => string.push('\n'),
                Some('t') => string.push('\t'),
                Some('r') => string.push('\r'),
                Some(other) => string.push(other),
                None => break,
            },
            other => string.push(other),
        }
    }
    Err(eval_error(format!("Unterminated string literal starting with {quote}")))
}

/// Parse an integer or float literal; the first digit is still in the iterator
fn parse_number(chars: &mut Peekable<Chars>) -> Result<Token, ExpressionError> {
    let mut num_str = String::new();
    let mut is_float = false;

    while let Some(&ch) = chars.peek() {
        if ch.is_ascii_digit() || ch == '_' {
            if ch != '_' {
                num_str.push(ch);
            }
            chars.next();
        } else if ch == '.' && !is_float {
            // `1.foo` is not a float; only consume the dot when a digit follows
            let mut lookahead = chars.clone();
            lookahead.next();
            if lookahead.peek().map(|c| c.is_ascii_digit()).unwrap_or(true) {
                is_float = true;
                num_str.push(ch);
                chars.next();
            } else {
                break;
            }
        } else if (ch == 'e' || ch == 'E') && !num_str.is_empty() {
            is_float = true;
            num_str.push(ch);
            chars.next();
            if let Some(&sign) = chars.peek() {
                if sign == '+' || sign == '-' {
                    num_str.push(sign);
                    chars.next();
                }
            }
        } else {
            break;
        }
    }

    if is_float {
        num_str
            .parse::<f64>()
            .map(Token::Float)
            .map_err(|_| eval_error(format!("Invalid number: {num_str}")))
    } else {
        match num_str.parse::<i64>() {
            Ok(i) => Ok(Token::Int(i)),
            Err(_) => num_str
                .parse::<f64>()
                .map(Token::Float)
                .map_err(|_| eval_error(format!("Invalid number: {num_str}"))),
        }
    }
}

/// Parse the body of a `${...}` reference. `${` has been consumed.
///
/// Braces nest and quoted sections are skipped, so defaults and call
/// arguments may contain `}` inside string literals.
fn parse_placeholder(chars: &mut Peekable<Chars>) -> Result<String, ExpressionError> {
    let mut body = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    while let Some(ch) = chars.next() {
        match quote {
            Some(q) => {
                body.push(ch);
                if ch == '\\' {
                    if let Some(escaped) = chars.next() {
                        body.push(escaped);
                    }
                } else if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    body.push(ch);
                }
                '{' => {
                    depth += 1;
                    body.push(ch);
                }
                '}' if depth == 0 => return Ok(body.trim().to_string()),
                '}' => {
                    depth -= 1;
                    body.push(ch);
                }
                other => body.push(other),
            },
        }
    }

    Err(eval_error("Unterminated '${' reference"))
}

/// Convert an identifier to a keyword token or an Identifier token
fn parse_keyword_or_identifier(ident: String) -> Token {
    match ident.as_str() {
        "True" | "true" => Token::Boolean(true),
        "False" | "false" => Token::Boolean(false),
        "None" | "null" => Token::Null,
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "if" => Token::If,
        "else" => Token::Else,
        _ => Token::Identifier(ident),
    }
}

fn parse_identifier(chars: &mut Peekable<Chars>) -> String {
    let mut ident = String::new();
    while let Some(&ch) = chars.peek() {
        if ch.is_alphanumeric() || ch == '_' {
            ident.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    ident
}

/// Tokenize an expression string into a sequence of tokens
///
/// # Examples
///
/// ```
/// use mapflow::expression::tokenizer::{tokenize, Token};
///
/// let tokens = tokenize("${x} > 0").unwrap();
/// assert_eq!(tokens[0], Token::Placeholder("x".to_string()));
/// assert_eq!(tokens[1], Token::Greater);
/// assert_eq!(tokens[2], Token::Int(0));
/// ```
pub fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }

        if ch == '$' {
            chars.next();
            if chars.next() != Some('{') {
                return Err(eval_error("Expected '{' after '$'"));
            }
            tokens.push(Token::Placeholder(parse_placeholder(&mut chars)?));
            continue;
        }

        if ch == '\'' || ch == '"' {
            chars.next();
            tokens.push(Token::String(parse_string(ch, &mut chars)?));
            continue;
        }

        if ch.is_ascii_digit() {
            tokens.push(parse_number(&mut chars)?);
            continue;
        }

        if ch.is_alphabetic() || ch == '_' {
            tokens.push(parse_keyword_or_identifier(parse_identifier(&mut chars)));
            continue;
        }

        match parse_operator(ch, &mut chars)? {
            Some(token) => tokens.push(token),
            None => return Err(eval_error(format!("Unexpected character: '{ch}'"))),
        }
    }

    Ok(tokens)
}
