//! Sandboxed rule expression language
//!
//! Rules are written in a small, closed grammar: boolean connectives,
//! comparisons, membership tests, conditionals, literal collections,
//! indexing/attribute access, and calls to a fixed set of pure builtins
//! (`len`, `any`, `all`, `set`). There is no assignment, no loops, no
//! arbitrary calls — anything outside the grammar fails to parse, so
//! rejection happens before any evaluation. Conditions are re-parsed on
//! every evaluation; nothing is cached across evaluation boundaries.
//!
//! Values are JSON values; the environment is supplied by the engine.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

/// Errors raised while lexing, parsing, or evaluating a condition
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("unexpected character {0:?}")]
    UnexpectedChar(char),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("invalid number {0:?}")]
    InvalidNumber(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),

    #[error("function {0:?} not permitted")]
    ForbiddenCall(String),

    #[error("unknown identifier {0:?}")]
    UnknownIdentifier(String),

    #[error("type error: {0}")]
    TypeError(String),
}

/// Parse and evaluate a condition against the given environment
///
/// The closed grammar is the validation boundary: a condition using any
/// construct outside it is rejected here, before evaluation, on every
/// call.
pub fn evaluate_condition(
    source: &str,
    env: &HashMap<String, Value>,
) -> Result<bool, ExprError> {
    let tokens = lex(source)?;
    let expr = Parser::new(tokens).parse()?;
    Ok(truthy(&eval(&expr, env)?))
}

// ---------------------------------------------------------------- lexer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    If,
    Else,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => name.clone(),
            Token::Str(s) => format!("'{s}'"),
            Token::Int(n) => n.to_string(),
            Token::Float(f) => f.to_string(),
            Token::True => "true".into(),
            Token::False => "false".into(),
            Token::Null => "null".into(),
            Token::And => "and".into(),
            Token::Or => "or".into(),
            Token::Not => "not".into(),
            Token::In => "in".into(),
            Token::If => "if".into(),
            Token::Else => "else".into(),
            Token::Eq => "==".into(),
            Token::Ne => "!=".into(),
            Token::Lt => "<".into(),
            Token::Le => "<=".into(),
            Token::Gt => ">".into(),
            Token::Ge => ">=".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::LBracket => "[".into(),
            Token::RBracket => "]".into(),
            Token::Comma => ",".into(),
            Token::Dot => ".".into(),
        }
    }
}

fn lex(source: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Eq);
                } else {
                    // Lone '=' would be assignment; outside the grammar.
                    return Err(ExprError::UnexpectedChar('='));
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    return Err(ExprError::UnexpectedChar('!'));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '\'' | '"' => {
                tokens.push(lex_string(&mut chars, c)?);
            }
            '0'..='9' => {
                tokens.push(lex_number(&mut chars)?);
            }
            c if c.is_alphabetic() || c == '_' => {
                tokens.push(lex_word(&mut chars));
            }
            other => return Err(ExprError::UnexpectedChar(other)),
        }
    }
    Ok(tokens)
}

fn lex_string(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    quote: char,
) -> Result<Token, ExprError> {
    chars.next(); // opening quote
    let mut value = String::new();
    loop {
        match chars.next() {
            None => return Err(ExprError::UnterminatedString),
            Some(c) if c == quote => return Ok(Token::Str(value)),
            Some('\\') => match chars.next() {
                None => return Err(ExprError::UnterminatedString),
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(other) => value.push(other),
            },
            Some(c) => value.push(c),
        }
    }
}

fn lex_number(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> Result<Token, ExprError> {
    let mut text = String::new();
    let mut is_float = false;
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            text.push(c);
            chars.next();
        } else if c == '.' && !is_float {
            // Lookahead: "1.x" with a non-digit after the dot is indexing
            // into a number, which the grammar does not have; treat the
            // dot as part of the float only when digits follow.
            let mut probe = chars.clone();
            probe.next();
            if probe.peek().is_some_and(|d| d.is_ascii_digit()) {
                is_float = true;
                text.push(c);
                chars.next();
            } else {
                break;
            }
        } else {
            break;
        }
    }
    if is_float {
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| ExprError::InvalidNumber(text))
    } else {
        text.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| ExprError::InvalidNumber(text))
    }
}

fn lex_word(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Token {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    match word.as_str() {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "in" => Token::In,
        "if" => Token::If,
        "else" => Token::Else,
        "true" | "True" => Token::True,
        "false" | "False" => Token::False,
        "null" | "None" => Token::Null,
        _ => Token::Ident(word),
    }
}

// --------------------------------------------------------------- parser

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Len,
    Any,
    All,
    Set,
}

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Ident(String),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Membership {
        negated: bool,
        needle: Box<Expr>,
        haystack: Box<Expr>,
    },
    Conditional {
        then: Box<Expr>,
        cond: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Index(Box<Expr>, Box<Expr>),
    Attribute(Box<Expr>, String),
    Call(Builtin, Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn parse(mut self) -> Result<Expr, ExprError> {
        let expr = self.parse_conditional()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(ExprError::UnexpectedToken(token.describe())),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_ahead(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Result<Token, ExprError> {
        let token = self.tokens.get(self.pos).cloned().ok_or(ExprError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        let found = self.advance()?;
        if found == token {
            Ok(())
        } else {
            Err(ExprError::UnexpectedToken(found.describe()))
        }
    }

    /// `a if cond else b`, right-associative
    fn parse_conditional(&mut self) -> Result<Expr, ExprError> {
        let expr = self.parse_or()?;
        if self.eat(&Token::If) {
            let cond = self.parse_or()?;
            self.expect(Token::Else)?;
            let otherwise = self.parse_conditional()?;
            return Ok(Expr::Conditional {
                then: Box::new(expr),
                cond: Box::new(cond),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            expr = Expr::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_not()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_not()?;
            expr = Expr::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    /// A single comparison or membership test; chaining is not supported
    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_postfix()?;

        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let rhs = self.parse_postfix()?;
            return Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)));
        }

        if self.eat(&Token::In) {
            let haystack = self.parse_postfix()?;
            return Ok(Expr::Membership {
                negated: false,
                needle: Box::new(lhs),
                haystack: Box::new(haystack),
            });
        }
        if self.peek() == Some(&Token::Not) && self.peek_ahead(1) == Some(&Token::In) {
            self.pos += 2;
            let haystack = self.parse_postfix()?;
            return Ok(Expr::Membership {
                negated: true,
                needle: Box::new(lhs),
                haystack: Box::new(haystack),
            });
        }
        Ok(lhs)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::LBracket) {
                let index = self.parse_conditional()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat(&Token::Dot) {
                match self.advance()? {
                    Token::Ident(name) => expr = Expr::Attribute(Box::new(expr), name),
                    other => return Err(ExprError::UnexpectedToken(other.describe())),
                }
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance()? {
            Token::Int(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Float(f) => Ok(Expr::Literal(Value::from(f))),
            Token::Str(s) => Ok(Expr::Literal(Value::from(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::LParen => {
                let expr = self.parse_conditional()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => {
                let items = self.parse_items(Token::RBracket)?;
                Ok(Expr::List(items))
            }
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    let builtin = match name.as_str() {
                        "len" => Builtin::Len,
                        "any" => Builtin::Any,
                        "all" => Builtin::All,
                        "set" => Builtin::Set,
                        _ => return Err(ExprError::ForbiddenCall(name)),
                    };
                    self.pos += 1;
                    let args = self.parse_items(Token::RParen)?;
                    return Ok(Expr::Call(builtin, args));
                }
                Ok(Expr::Ident(name))
            }
            other => Err(ExprError::UnexpectedToken(other.describe())),
        }
    }

    fn parse_items(&mut self, closing: Token) -> Result<Vec<Expr>, ExprError> {
        let mut items = Vec::new();
        if self.eat(&closing) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_conditional()?);
            if self.eat(&Token::Comma) {
                // Trailing comma before the closer is fine.
                if self.eat(&closing) {
                    return Ok(items);
                }
                continue;
            }
            self.expect(closing)?;
            return Ok(items);
        }
    }
}

// ------------------------------------------------------------ evaluator

fn eval(expr: &Expr, env: &HashMap<String, Value>) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => env
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownIdentifier(name.clone())),
        Expr::List(items) => {
            let values = items
                .iter()
                .map(|item| eval(item, env))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(values))
        }
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, env)?))),
        Expr::And(lhs, rhs) => {
            let left = eval(lhs, env)?;
            if !truthy(&left) {
                Ok(left)
            } else {
                eval(rhs, env)
            }
        }
        Expr::Or(lhs, rhs) => {
            let left = eval(lhs, env)?;
            if truthy(&left) {
                Ok(left)
            } else {
                eval(rhs, env)
            }
        }
        Expr::Compare(op, lhs, rhs) => {
            let left = eval(lhs, env)?;
            let right = eval(rhs, env)?;
            Ok(Value::Bool(compare(*op, &left, &right)?))
        }
        Expr::Membership {
            negated,
            needle,
            haystack,
        } => {
            let needle = eval(needle, env)?;
            let haystack = eval(haystack, env)?;
            let contained = contains(&haystack, &needle)?;
            Ok(Value::Bool(contained != *negated))
        }
        Expr::Conditional {
            then,
            cond,
            otherwise,
        } => {
            if truthy(&eval(cond, env)?) {
                eval(then, env)
            } else {
                eval(otherwise, env)
            }
        }
        Expr::Index(target, index) => {
            let target = eval(target, env)?;
            let index = eval(index, env)?;
            index_value(&target, &index)
        }
        Expr::Attribute(target, name) => {
            let target = eval(target, env)?;
            match target {
                Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
                other => Err(ExprError::TypeError(format!(
                    "cannot access attribute {name:?} on {}",
                    kind_name(&other)
                ))),
            }
        }
        Expr::Call(builtin, args) => {
            let values = args
                .iter()
                .map(|arg| eval(arg, env))
                .collect::<Result<Vec<_>, _>>()?;
            call_builtin(*builtin, values)
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Equality with numeric coercion, so `1 == 1.0` holds
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, ExprError> {
    match op {
        CmpOp::Eq => return Ok(loose_eq(left, right)),
        CmpOp::Ne => return Ok(!loose_eq(left, right)),
        _ => {}
    }
    let ordering = match (left, right) {
        (Value::Number(_), Value::Number(_)) => {
            match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => l.partial_cmp(&r),
                _ => None,
            }
        }
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    };
    let ordering = ordering.ok_or_else(|| {
        ExprError::TypeError(format!(
            "cannot order {} and {}",
            kind_name(left),
            kind_name(right)
        ))
    })?;
    Ok(match op {
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::Le => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::Ge => ordering.is_ge(),
        CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
    })
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, ExprError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| loose_eq(item, needle))),
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            other => Err(ExprError::TypeError(format!(
                "cannot search a string for {}",
                kind_name(other)
            ))),
        },
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            other => Err(ExprError::TypeError(format!(
                "cannot use {} as an object key",
                kind_name(other)
            ))),
        },
        other => Err(ExprError::TypeError(format!(
            "{} does not support membership tests",
            kind_name(other)
        ))),
    }
}

fn index_value(target: &Value, index: &Value) -> Result<Value, ExprError> {
    match (target, index) {
        (Value::Array(items), Value::Number(n)) => {
            let idx = n.as_u64().ok_or_else(|| {
                ExprError::TypeError("array index must be a non-negative integer".into())
            })?;
            Ok(items.get(idx as usize).cloned().unwrap_or(Value::Null))
        }
        (Value::Object(map), Value::String(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        (target, index) => Err(ExprError::TypeError(format!(
            "cannot index {} with {}",
            kind_name(target),
            kind_name(index)
        ))),
    }
}

fn call_builtin(builtin: Builtin, mut args: Vec<Value>) -> Result<Value, ExprError> {
    if args.len() != 1 {
        return Err(ExprError::TypeError(format!(
            "{:?} takes 1 argument, got {}",
            builtin,
            args.len()
        )));
    }
    let arg = args.remove(0);
    match builtin {
        Builtin::Len => {
            let len = match &arg {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => {
                    return Err(ExprError::TypeError(format!(
                        "len() does not apply to {}",
                        kind_name(other)
                    )))
                }
            };
            Ok(Value::from(len as u64))
        }
        Builtin::Any | Builtin::All => {
            let items = match &arg {
                Value::Array(items) => items,
                other => {
                    return Err(ExprError::TypeError(format!(
                        "{:?}() expects a list, got {}",
                        builtin,
                        kind_name(other)
                    )))
                }
            };
            let result = if builtin == Builtin::Any {
                items.iter().any(truthy)
            } else {
                items.iter().all(truthy)
            };
            Ok(Value::Bool(result))
        }
        Builtin::Set => {
            let items = match arg {
                Value::Array(items) => items,
                other => {
                    return Err(ExprError::TypeError(format!(
                        "set() expects a list, got {}",
                        kind_name(&other)
                    )))
                }
            };
            let mut deduped: Vec<Value> = Vec::new();
            for item in items {
                if !deduped.iter().any(|seen| loose_eq(seen, &item)) {
                    deduped.push(item);
                }
            }
            Ok(Value::Array(deduped))
        }
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
