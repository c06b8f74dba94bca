//! Small expression language for component properties and watch expressions.
//!
//! Supports literals (numbers, strings, `true`, `false`, `null`, `undefined`),
//! identifiers, array literals, indexing, unary `-`/`!` and the usual binary
//! arithmetic, comparison and logical operators. Evaluation never mutates the
//! scope it reads from.

use anyhow::{anyhow, bail, Result};

use crate::types::Value;

/// Read-only name resolution used during evaluation.
pub trait Scope {
    fn resolve(&self, name: &str) -> Option<Value>;
}

impl Scope for std::collections::BTreeMap<String, Value> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl Scope for std::collections::HashMap<String, Value> {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(String),
    Str(String),
    Ident(String),
    Op(&'static str),
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
}

const OPERATORS: [&str; 15] = [
    "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "!", "=",
];

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        if ch.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
            continue;
        }

        if ch.is_alphabetic() || ch == '_' || ch == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$' || chars[i] == '.')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        if ch == '"' || ch == '\'' {
            let quote = ch;
            i += 1;
            let mut text = String::new();
            loop {
                let Some(&c) = chars.get(i) else {
                    bail!("unterminated string literal");
                };
                i += 1;
                match c {
                    '\\' => {
                        let escaped = chars
                            .get(i)
                            .copied()
                            .ok_or_else(|| anyhow!("unterminated escape sequence"))?;
                        i += 1;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            '0' => '\0',
                            other => other,
                        });
                    }
                    c if c == quote => break,
                    c => text.push(c),
                }
            }
            tokens.push(Token::Str(text));
            continue;
        }

        let token = match ch {
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            _ => None,
        };
        if let Some(token) = token {
            tokens.push(token);
            i += 1;
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        let op = OPERATORS
            .iter()
            .find(|op| rest.starts_with(**op))
            .ok_or_else(|| anyhow!("unexpected character '{ch}' in expression"))?;
        if *op == "=" {
            bail!("assignment is not allowed in expressions");
        }
        tokens.push(Token::Op(*op));
        i += op.len();
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    scope: &'a dyn Scope,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => bail!("expected {expected:?}, found {token:?}"),
            None => bail!("expected {expected:?}, found end of expression"),
        }
    }

    fn binary(&mut self, min_precedence: u8) -> Result<Value> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            let precedence = precedence(op);
            if precedence == 0 || precedence < min_precedence {
                break;
            }
            self.pos += 1;
            let rhs = self.binary(precedence + 1)?;
            lhs = apply_binary(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Value> {
        match self.peek() {
            Some(Token::Op("-")) => {
                self.pos += 1;
                negate(self.unary()?)
            }
            Some(Token::Op("!")) => {
                self.pos += 1;
                Ok(Value::Boolean(!self.unary()?.is_truthy()))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Value> {
        let mut value = self.primary()?;
        while self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            let index = self.binary(1)?;
            self.expect(Token::RBracket)?;
            value = index_value(value, &index)?;
        }
        Ok(value)
    }

    fn primary(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Number(text)) => parse_number(&text),
            Some(Token::Str(text)) => Ok(Value::String(text)),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Value::Boolean(true),
                "false" => Value::Boolean(false),
                "null" => Value::Null,
                "undefined" => Value::Undefined,
                _ => self
                    .scope
                    .resolve(&name)
                    .ok_or_else(|| anyhow!("unknown identifier '{name}'"))?,
            }),
            Some(Token::LParen) => {
                let value = self.binary(1)?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.pos += 1;
                    return Ok(Value::Array(items));
                }
                loop {
                    items.push(self.binary(1)?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        other => bail!("expected ',' or ']', found {other:?}"),
                    }
                }
                Ok(Value::Array(items))
            }
            Some(token) => bail!("unexpected token {token:?}"),
            None => bail!("unexpected end of expression"),
        }
    }
}

fn precedence(op: &str) -> u8 {
    match op {
        "||" => 1,
        "&&" => 2,
        "==" | "!=" => 3,
        "<" | ">" | "<=" | ">=" => 4,
        "+" | "-" => 5,
        "*" | "/" | "%" => 6,
        _ => 0,
    }
}

fn parse_number(text: &str) -> Result<Value> {
    if text.contains('.') {
        return text
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|_| anyhow!("invalid number literal '{text}'"));
    }
    let parsed = text
        .parse::<i64>()
        .map_err(|_| anyhow!("invalid number literal '{text}'"))?;
    Ok(match i32::try_from(parsed) {
        Ok(small) => Value::Int32(small),
        Err(_) => Value::Int64(parsed),
    })
}

fn negate(value: Value) -> Result<Value> {
    Ok(match value {
        Value::Int32(v) => Value::Int32(v.wrapping_neg()),
        Value::Float(v) => Value::Float(-v),
        Value::Double(v) => Value::Double(-v),
        other => match other.as_i64() {
            Some(v) => Value::Int64(v.wrapping_neg()),
            None => bail!("cannot negate {:?}", other.kind()),
        },
    })
}

fn index_value(value: Value, index: &Value) -> Result<Value> {
    let position = index
        .as_i64()
        .ok_or_else(|| anyhow!("array index must be an integer"))?;
    match value {
        Value::Array(items) => Ok(usize::try_from(position)
            .ok()
            .and_then(|i| items.into_iter().nth(i))
            .unwrap_or(Value::Undefined)),
        Value::String(text) => Ok(usize::try_from(position)
            .ok()
            .and_then(|i| text.chars().nth(i))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Undefined)),
        other => bail!("cannot index into {:?}", other.kind()),
    }
}

fn apply_binary(op: &str, lhs: Value, rhs: Value) -> Result<Value> {
    match op {
        "&&" => return Ok(Value::Boolean(lhs.is_truthy() && rhs.is_truthy())),
        "||" => return Ok(Value::Boolean(lhs.is_truthy() || rhs.is_truthy())),
        "==" => return Ok(Value::Boolean(loosely_equal(&lhs, &rhs))),
        "!=" => return Ok(Value::Boolean(!loosely_equal(&lhs, &rhs))),
        _ => {}
    }

    if op == "+" && (lhs.as_str().is_some() || rhs.as_str().is_some()) {
        return Ok(Value::String(format!("{lhs}{rhs}")));
    }

    if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
        let both_small = matches!(lhs, Value::Int32(_)) && matches!(rhs, Value::Int32(_));
        let result = match op {
            "+" => Some(a.wrapping_add(b)),
            "-" => Some(a.wrapping_sub(b)),
            "*" => Some(a.wrapping_mul(b)),
            "/" | "%" if b == 0 => bail!("division by zero"),
            "/" => Some(a.checked_div(b).ok_or_else(|| anyhow!("integer overflow"))?),
            "%" => Some(a.checked_rem(b).ok_or_else(|| anyhow!("integer overflow"))?),
            _ => None,
        };
        if let Some(result) = result {
            return Ok(match i32::try_from(result) {
                Ok(small) if both_small => Value::Int32(small),
                _ => Value::Int64(result),
            });
        }
        return compare(op, a as f64, b as f64);
    }

    let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
        bail!(
            "operator '{op}' is not defined for {:?} and {:?}",
            lhs.kind(),
            rhs.kind()
        );
    };
    match op {
        "+" => Ok(Value::Double(a + b)),
        "-" => Ok(Value::Double(a - b)),
        "*" => Ok(Value::Double(a * b)),
        "/" => Ok(Value::Double(a / b)),
        "%" => Ok(Value::Double(a % b)),
        _ => compare(op, a, b),
    }
}

fn compare(op: &str, a: f64, b: f64) -> Result<Value> {
    Ok(Value::Boolean(match op {
        "<" => a < b,
        ">" => a > b,
        "<=" => a <= b,
        ">=" => a >= b,
        other => bail!("unsupported operator '{other}'"),
    }))
}

fn loosely_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

pub fn evaluate(source: &str, scope: &dyn Scope) -> Result<Value> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        bail!("empty expression");
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        scope,
    };
    let value = parser.binary(1)?;
    if let Some(token) = parser.peek() {
        bail!("unexpected trailing token {token:?}");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn scope() -> HashMap<String, Value> {
        HashMap::from([
            ("x".to_string(), Value::Int32(40)),
            ("name".to_string(), Value::from("flow")),
            (
                "items".to_string(),
                Value::Array(vec![Value::Int32(1), Value::Int32(2)]),
            ),
        ])
    }

    #[test]
    fn test_literals() {
        let scope = scope();
        assert_eq!(evaluate("42", &scope).expect("int"), Value::Int32(42));
        assert_eq!(evaluate("1.5", &scope).expect("double"), Value::Double(1.5));
        assert_eq!(
            evaluate("\"a\\nb\"", &scope).expect("string"),
            Value::from("a\nb")
        );
        assert_eq!(evaluate("null", &scope).expect("null"), Value::Null);
        assert_eq!(
            evaluate("[1, 'two']", &scope).expect("array"),
            Value::Array(vec![Value::Int32(1), Value::from("two")])
        );
    }

    #[test]
    fn test_arithmetic_precedence_and_identifiers() {
        let scope = scope();
        assert_eq!(evaluate("x + 2", &scope).expect("add"), Value::Int32(42));
        assert_eq!(evaluate("2 + 3 * 4", &scope).expect("mul"), Value::Int32(14));
        assert_eq!(evaluate("(2 + 3) * 4", &scope).expect("paren"), Value::Int32(20));
        assert_eq!(evaluate("-x", &scope).expect("neg"), Value::Int32(-40));
        assert_eq!(evaluate("x / 2.0", &scope).expect("div"), Value::Double(20.0));
    }

    #[test]
    fn test_string_concat_comparison_and_indexing() {
        let scope = scope();
        assert_eq!(
            evaluate("name + '-' + x", &scope).expect("concat"),
            Value::from("flow-40")
        );
        assert_eq!(evaluate("x >= 40 && !false", &scope).expect("cmp"), Value::Boolean(true));
        assert_eq!(evaluate("items[1]", &scope).expect("index"), Value::Int32(2));
        assert_eq!(evaluate("items[5]", &scope).expect("oob"), Value::Undefined);
        assert_eq!(evaluate("x == 40.0", &scope).expect("eq"), Value::Boolean(true));
    }

    #[test]
    fn test_errors() {
        let scope = scope();
        let err = evaluate("missing + 1", &scope).expect_err("unknown identifier");
        assert_eq!(err.to_string(), "unknown identifier 'missing'");

        assert!(evaluate("x = 1", &scope).is_err());
        assert!(evaluate("1 / 0", &scope).is_err());
        assert!(evaluate("", &scope).is_err());
        assert!(evaluate("(1 + 2", &scope).is_err());
        assert!(evaluate("'open", &scope).is_err());
    }

    #[test]
    fn test_integer_division_overflow_is_an_error() {
        let scope = HashMap::from([("min".to_string(), Value::Int64(i64::MIN))]);
        let err = evaluate("min / -1", &scope).expect_err("overflowing division");
        assert_eq!(err.to_string(), "integer overflow");
        assert!(evaluate("min % -1", &scope).is_err());
        assert_eq!(evaluate("min / 2", &scope).expect("half"), Value::Int64(i64::MIN / 2));
    }
}
