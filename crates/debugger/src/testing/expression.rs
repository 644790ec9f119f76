//! A small expression language for the scripted engine.
//!
//! Supports integer and string literals, variables (`$true`, `$false` and
//! `$null` included), `+ - * / %`, the dash comparison operators, `-and`,
//! `-or`, `-not`, parentheses and `[type]` casts.

use crate::engine::{EngineError, EngineErrorKind};

use super::Value;

/// Variable and type information an expression is evaluated against
pub(crate) trait Env {
    fn variable(&self, name: &str) -> Option<Value>;

    /// Member names of an enumeration type, if the type is one
    fn enum_names(&self, type_name: &str) -> Option<&[String]>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Str(String),
    Var(String),
    Type(String),
    Op(Op),
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Var(String),
    Negate(Box<Expr>),
    Not(Box<Expr>),
    Cast(String, Box<Expr>),
    Binary(Op, Box<Expr>, Box<Expr>),
}

fn parse_error(message: impl Into<String>) -> EngineError {
    EngineError::new(EngineErrorKind::Parse, message)
}

fn runtime_error(message: impl Into<String>) -> EngineError {
    EngineError::new(EngineErrorKind::Runtime, message)
}

fn unexpected(text: &str) -> EngineError {
    parse_error(format!(
        "Unexpected token '{text}' in expression or statement."
    ))
}

fn tokenize(source: &str) -> Result<Vec<(Token, String)>, EngineError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let take_while = |start: usize, pred: &dyn Fn(char) -> bool| -> usize {
        let mut end = start;
        while end < chars.len() && pred(chars[end]) {
            end += 1;
        }
        end
    };
    let text = |start: usize, end: usize| -> String { chars[start..end].iter().collect() };

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        let token = if c.is_ascii_digit() {
            i = take_while(i, &|c| c.is_ascii_digit());
            let digits = text(start, i);
            let value = digits
                .parse()
                .map_err(|_| parse_error(format!("The number '{digits}' is too large.")))?;
            Token::Int(value)
        } else if c == '\'' || c == '"' {
            let end = take_while(i + 1, &|ch| ch != c);
            if end >= chars.len() {
                return Err(parse_error(format!(
                    "The string is missing the terminator: {c}."
                )));
            }
            i = end + 1;
            Token::Str(text(start + 1, end))
        } else if c == '$' {
            i = take_while(i + 1, &|c| c.is_alphanumeric() || c == '_' || c == ':');
            if i == start + 1 {
                return Err(unexpected("$"));
            }
            Token::Var(text(start, i))
        } else if c == '[' {
            let end = take_while(i + 1, &|c| c.is_alphanumeric() || c == '.' || c == '_');
            if end >= chars.len() || chars[end] != ']' || end == i + 1 {
                return Err(parse_error("Missing ']' after type name."));
            }
            i = end + 1;
            Token::Type(text(start + 1, end))
        } else if c == '-' && i + 1 < chars.len() && chars[i + 1].is_ascii_alphabetic() {
            i = take_while(i + 1, &|c| c.is_ascii_alphabetic());
            let word = text(start, i);
            let op = match word.to_ascii_lowercase().as_str() {
                "-eq" => Op::Eq,
                "-ne" => Op::Ne,
                "-gt" => Op::Gt,
                "-ge" => Op::Ge,
                "-lt" => Op::Lt,
                "-le" => Op::Le,
                "-and" => Op::And,
                "-or" => Op::Or,
                "-not" => Op::Not,
                _ => return Err(unexpected(&word)),
            };
            Token::Op(op)
        } else {
            i += 1;
            match c {
                '+' => Token::Op(Op::Plus),
                '-' => Token::Op(Op::Minus),
                '*' => Token::Op(Op::Star),
                '/' => Token::Op(Op::Slash),
                '%' => Token::Op(Op::Percent),
                '(' => Token::LParen,
                ')' => Token::RParen,
                '=' | '!' | '<' | '>' | '&' | '|' => {
                    i = take_while(start, &|c| "=!<>&|".contains(c));
                    return Err(unexpected(&text(start, i)));
                }
                other => return Err(unexpected(&other.to_string())),
            }
        };
        tokens.push((token, text(start, i)));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, String)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<(Token, String)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_op(&self, ops: &[Op]) -> Option<Op> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => Some(*op),
            _ => None,
        }
    }

    fn operand_after(
        &mut self,
        op_text: &str,
        f: fn(&mut Self) -> Result<Expr, EngineError>,
    ) -> Result<Expr, EngineError> {
        if self.peek().is_none() {
            return Err(parse_error(format!(
                "You must provide a value expression following the '{op_text}' operator."
            )));
        }
        f(self)
    }

    fn logical(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.comparison()?;
        while let Some(op) = self.peek_op(&[Op::And, Op::Or]) {
            let (_, text) = self.next().unwrap_or((Token::Op(op), String::new()));
            let right = self.operand_after(&text, Self::comparison)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.additive()?;
        while let Some(op) = self.peek_op(&[Op::Eq, Op::Ne, Op::Gt, Op::Ge, Op::Lt, Op::Le]) {
            let (_, text) = self.next().unwrap_or((Token::Op(op), String::new()));
            let right = self.operand_after(&text, Self::additive)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.multiplicative()?;
        while let Some(op) = self.peek_op(&[Op::Plus, Op::Minus]) {
            let (_, text) = self.next().unwrap_or((Token::Op(op), String::new()));
            let right = self.operand_after(&text, Self::multiplicative)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, EngineError> {
        let mut left = self.unary()?;
        while let Some(op) = self.peek_op(&[Op::Star, Op::Slash, Op::Percent]) {
            let (_, text) = self.next().unwrap_or((Token::Op(op), String::new()));
            let right = self.operand_after(&text, Self::unary)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EngineError> {
        match self.next() {
            Some((Token::Op(Op::Minus), text)) => {
                Ok(Expr::Negate(Box::new(self.operand_after(&text, Self::unary)?)))
            }
            Some((Token::Op(Op::Not), text)) => {
                Ok(Expr::Not(Box::new(self.operand_after(&text, Self::unary)?)))
            }
            Some((Token::Type(type_name), text)) => Ok(Expr::Cast(
                type_name,
                Box::new(self.operand_after(&text, Self::unary)?),
            )),
            Some((Token::Int(i), _)) => Ok(Expr::Literal(Value::Int(i))),
            Some((Token::Str(s), _)) => Ok(Expr::Literal(Value::Str(s))),
            Some((Token::Var(name), _)) => Ok(Expr::Var(name)),
            Some((Token::LParen, _)) => {
                let inner = self.logical()?;
                match self.next() {
                    Some((Token::RParen, _)) => Ok(inner),
                    _ => Err(parse_error(
                        "Missing closing ')' in expression.",
                    )),
                }
            }
            Some((_, text)) => Err(unexpected(&text)),
            None => Err(parse_error("Missing expression.")),
        }
    }
}

pub(crate) fn parse(source: &str) -> Result<Expr, EngineError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(parse_error("Missing expression."));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.logical()?;
    match parser.next() {
        None => Ok(expr),
        Some((_, text)) => Err(unexpected(&text)),
    }
}

pub(crate) fn evaluate(expr: &Expr, env: &dyn Env) -> Result<Value, EngineError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(name) => Ok(match name.to_ascii_lowercase().as_str() {
            "$true" => Value::Bool(true),
            "$false" => Value::Bool(false),
            "$null" => Value::Null,
            _ => env.variable(name).unwrap_or(Value::Null),
        }),
        Expr::Negate(inner) => {
            let value = to_int(&evaluate(inner, env)?)?;
            Ok(Value::Int(-value))
        }
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&evaluate(inner, env)?))),
        Expr::Cast(type_name, inner) => coerce(evaluate(inner, env)?, type_name, env),
        Expr::Binary(Op::And, left, right) => Ok(Value::Bool(
            truthy(&evaluate(left, env)?) && truthy(&evaluate(right, env)?),
        )),
        Expr::Binary(Op::Or, left, right) => Ok(Value::Bool(
            truthy(&evaluate(left, env)?) || truthy(&evaluate(right, env)?),
        )),
        Expr::Binary(op, left, right) => {
            let left = evaluate(left, env)?;
            let right = evaluate(right, env)?;
            binary(*op, left, right)
        }
    }
}

fn binary(op: Op, left: Value, right: Value) -> Result<Value, EngineError> {
    match op {
        Op::Plus => match &left {
            Value::Str(s) => Ok(Value::Str(format!("{s}{}", to_text(&right)))),
            _ => arithmetic(op, &left, &right),
        },
        Op::Minus | Op::Star | Op::Slash | Op::Percent => arithmetic(op, &left, &right),
        Op::Eq => Ok(Value::Bool(equals(&left, &right))),
        Op::Ne => Ok(Value::Bool(!equals(&left, &right))),
        Op::Gt | Op::Ge | Op::Lt | Op::Le => {
            let ordering = match &left {
                Value::Str(s) => s.to_lowercase().cmp(&to_text(&right).to_lowercase()),
                _ => to_int(&left)?.cmp(&to_int(&right)?),
            };
            Ok(Value::Bool(match op {
                Op::Gt => ordering.is_gt(),
                Op::Ge => ordering.is_ge(),
                Op::Lt => ordering.is_lt(),
                _ => ordering.is_le(),
            }))
        }
        Op::And | Op::Or | Op::Not => Err(runtime_error("Unsupported operator.")),
    }
}

fn arithmetic(op: Op, left: &Value, right: &Value) -> Result<Value, EngineError> {
    let (l, r) = (to_int(left)?, to_int(right)?);
    let result = match op {
        Op::Plus => l.checked_add(r),
        Op::Minus => l.checked_sub(r),
        Op::Star => l.checked_mul(r),
        Op::Slash | Op::Percent if r == 0 => {
            return Err(runtime_error("Attempted to divide by zero."));
        }
        Op::Slash => l.checked_div(r),
        _ => l.checked_rem(r),
    };
    result
        .map(Value::Int)
        .ok_or_else(|| runtime_error("Arithmetic operation resulted in an overflow."))
}

fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, other) | (other, Value::Null) => matches!(other, Value::Null),
        (Value::Int(l), r) => to_int(r).map(|r| *l == r).unwrap_or(false),
        (Value::Bool(l), r) => *l == truthy(r),
        (l, r) => to_text(l).eq_ignore_ascii_case(&to_text(r)),
    }
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null | Value::NullString => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Str(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Enum { .. } | Value::Hashtable(_) | Value::Object { .. } | Value::Opaque { .. } => {
            true
        }
    }
}

pub(crate) fn to_text(value: &Value) -> String {
    match value {
        Value::Null | Value::NullString => String::new(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Str(s) => s.clone(),
        Value::Enum { name, .. } => name.clone(),
        Value::Array(_) => "System.Object[]".to_string(),
        Value::Hashtable(_) => "System.Collections.Hashtable".to_string(),
        Value::Object { type_name, .. } => type_name.clone(),
        Value::Opaque { display, .. } => display.clone(),
    }
}

fn to_int(value: &Value) -> Result<i64, EngineError> {
    match value {
        Value::Null => Ok(0),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Int(i) => Ok(*i),
        Value::Str(s) => s.trim().parse().map_err(|_| {
            EngineError::new(
                EngineErrorKind::Conversion,
                format!("Cannot convert value \"{s}\" to type \"System.Int32\"."),
            )
        }),
        other => Err(EngineError::new(
            EngineErrorKind::Conversion,
            format!(
                "Cannot convert value \"{}\" to type \"System.Int32\".",
                to_text(other)
            ),
        )),
    }
}

/// Convert a value to a declared type. Unknown types leave the value alone.
pub(crate) fn coerce(value: Value, type_name: &str, env: &dyn Env) -> Result<Value, EngineError> {
    match type_name.to_ascii_lowercase().as_str() {
        "int" | "int32" | "long" | "int64" => to_int(&value).map(Value::Int),
        "string" => Ok(Value::Str(to_text(&value))),
        "bool" | "boolean" => Ok(Value::Bool(truthy(&value))),
        _ => {
            let Some(names) = env.enum_names(type_name) else {
                return Ok(value);
            };
            let found = match &value {
                Value::Enum { type_name: t, name } if t == type_name => Some(name.clone()),
                Value::Int(i) => usize::try_from(*i).ok().and_then(|i| names.get(i).cloned()),
                other => {
                    let text = to_text(other);
                    names.iter().find(|n| n.eq_ignore_ascii_case(&text)).cloned()
                }
            };
            found
                .map(|name| Value::Enum {
                    type_name: type_name.to_string(),
                    name,
                })
                .ok_or_else(|| {
                    EngineError::new(
                        EngineErrorKind::Conversion,
                        format!(
                            "Cannot convert value \"{}\" to type \"{type_name}\". Specify one of the following enumerator names and try again: {}",
                            to_text(&value),
                            names.join(", ")
                        ),
                    )
                })
        }
    }
}
