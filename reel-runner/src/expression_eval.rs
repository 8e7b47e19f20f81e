use serde_json::{Number, Value};
use std::cmp::Ordering;
use thiserror::Error;
use tracing::warn;

/// Upper bound on lists produced by `range()`.
const MAX_RANGE_ITEMS: i64 = 10_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),

    #[error("Unterminated string literal")]
    UnterminatedString,

    #[error("Unexpected token: {0}")]
    UnexpectedToken(String),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Function '{0}' is not allowed")]
    UnknownFunction(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Type error: {0}")]
    Type(String),

    #[error("Invalid arguments for {0}(): {1}")]
    InvalidArguments(&'static str, String),
}

/// Normalizes an expression by replacing smart quotes and other Unicode characters
/// with their ASCII equivalents to handle copy-paste from various sources.
fn normalize_expression(expr: &str) -> String {
    expr
        // Normalize smart quotes to straight quotes
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace('`', "'")
        // Normalize Unicode spaces
        .replace(['\u{00A0}', '\u{2009}', '\u{202F}'], " ")
        .trim()
        .to_string()
}

// Helper to get a value from the variables JSON.
pub fn get_value<'a>(path: &str, variables: &'a Value) -> Option<&'a Value> {
    // Support dot notation for nested access
    if !path.contains('.') {
        return variables.get(path); // Fast path for simple keys
    }

    let mut current = variables;
    for part in path.split('.') {
        current = match current {
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            other => other.get(part)?,
        };
    }
    Some(current)
}

/// Returns the inner expression when `text` is exactly one `{{ ... }}` block.
pub fn strip_delimiters(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::Null => false,
        Value::Array(arr) => !arr.is_empty(),
        Value::Object(obj) => !obj.is_empty(),
    }
}

/// Text form used when a value is spliced into a larger string.
pub fn display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate an expression body (without `{{ }}`) against a scope object.
pub fn evaluate_value(expression: &str, scope: &Value) -> Result<Value, ExpressionError> {
    let normalized = normalize_expression(expression);
    let expr = parse(&normalized)?;
    eval(&expr, scope)
}

// Condition evaluation. Anything that fails to parse or evaluate is false.
pub fn evaluate(expression: &str, variables: &Value) -> bool {
    let body = strip_delimiters(expression).unwrap_or(expression);
    match evaluate_value(body, variables) {
        Ok(value) => is_truthy(&value),
        Err(e) => {
            warn!(
                "Could not evaluate condition '{}': {}. Defaulting to false.",
                expression, e
            );
            false
        }
    }
}

/// True when `text` parses as an expression. Used to tell literals from expressions.
pub fn is_parseable(text: &str) -> bool {
    parse(&normalize_expression(text)).is_ok()
}

// ---------------------------------------------------------------------------
// Tokenizer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

fn describe(token: &Token) -> String {
    match token {
        Token::Int(n) => n.to_string(),
        Token::Float(f) => f.to_string(),
        Token::Str(s) => format!("'{s}'"),
        Token::Ident(name) => name.clone(),
        Token::Op(op) => op.to_string(),
        Token::LParen => "(".into(),
        Token::RParen => ")".into(),
        Token::LBracket => "[".into(),
        Token::RBracket => "]".into(),
        Token::Comma => ",".into(),
        Token::Dot => ".".into(),
    }
}

const TWO_CHAR_OPS: [&str; 6] = ["==", "!=", "<=", ">=", "&&", "||"];

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let mut is_float = false;
            if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let token = match (is_float, text.parse::<i64>()) {
                (false, Ok(n)) => Token::Int(n),
                _ => Token::Float(
                    text.parse()
                        .map_err(|_| ExpressionError::UnexpectedToken(text.clone()))?,
                ),
            };
            tokens.push(token);
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(ExpressionError::UnterminatedString);
                };
                i += 1;
                match ch {
                    '\\' => {
                        let escaped = chars
                            .get(i)
                            .copied()
                            .ok_or(ExpressionError::UnterminatedString)?;
                        i += 1;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    }
                    ch if ch == quote => break,
                    ch => text.push(ch),
                }
            }
            tokens.push(Token::Str(text));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        if i + 1 < chars.len() {
            let pair: String = chars[i..i + 2].iter().collect();
            if let Some(op) = TWO_CHAR_OPS.iter().find(|op| **op == pair) {
                tokens.push(Token::Op(*op));
                i += 2;
                continue;
            }
        }

        let token = match c {
            '+' => Token::Op("+"),
            '-' => Token::Op("-"),
            '*' => Token::Op("*"),
            '/' => Token::Op("/"),
            '%' => Token::Op("%"),
            '<' => Token::Op("<"),
            '>' => Token::Op(">"),
            '!' => Token::Op("!"),
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ',' => Token::Comma,
            '.' => Token::Dot,
            other => return Err(ExpressionError::UnexpectedChar(other, i)),
        };
        tokens.push(token);
        i += 1;
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

// Binding powers, loosest first.
const BP_OR: u8 = 1;
const BP_AND: u8 = 2;
const BP_NOT: u8 = 3;
const BP_COMPARE: u8 = 4;
const BP_ADD: u8 = 5;
const BP_MUL: u8 = 6;
const BP_UNARY: u8 = 7;

fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExpressionError::UnexpectedEnd);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expression(0)?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(ExpressionError::UnexpectedToken(describe(token))),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ExpressionError::UnexpectedToken(describe(&token))),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }

    /// Returns the infix operator at the cursor, its binding power and token width.
    fn peek_infix(&self) -> Option<(BinaryOp, u8, usize)> {
        let op = match self.peek()? {
            Token::Op("||") => (BinaryOp::Or, BP_OR, 1),
            Token::Op("&&") => (BinaryOp::And, BP_AND, 1),
            Token::Ident(word) if word == "or" => (BinaryOp::Or, BP_OR, 1),
            Token::Ident(word) if word == "and" => (BinaryOp::And, BP_AND, 1),
            Token::Ident(word) if word == "in" => (BinaryOp::In, BP_COMPARE, 1),
            Token::Ident(word) if word == "not" => match self.peek_at(1) {
                Some(Token::Ident(next)) if next == "in" => (BinaryOp::NotIn, BP_COMPARE, 2),
                _ => return None,
            },
            Token::Op("==") => (BinaryOp::Eq, BP_COMPARE, 1),
            Token::Op("!=") => (BinaryOp::Ne, BP_COMPARE, 1),
            Token::Op("<") => (BinaryOp::Lt, BP_COMPARE, 1),
            Token::Op("<=") => (BinaryOp::Le, BP_COMPARE, 1),
            Token::Op(">") => (BinaryOp::Gt, BP_COMPARE, 1),
            Token::Op(">=") => (BinaryOp::Ge, BP_COMPARE, 1),
            Token::Op("+") => (BinaryOp::Add, BP_ADD, 1),
            Token::Op("-") => (BinaryOp::Sub, BP_ADD, 1),
            Token::Op("*") => (BinaryOp::Mul, BP_MUL, 1),
            Token::Op("/") => (BinaryOp::Div, BP_MUL, 1),
            Token::Op("%") => (BinaryOp::Mod, BP_MUL, 1),
            _ => return None,
        };
        Some(op)
    }

    fn expression(&mut self, min_bp: u8) -> Result<Expr, ExpressionError> {
        let mut lhs = self.prefix()?;
        while let Some((op, bp, width)) = self.peek_infix() {
            if bp < min_bp {
                break;
            }
            self.pos += width;
            let rhs = self.expression(bp + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, ExpressionError> {
        let token = self.advance().ok_or(ExpressionError::UnexpectedEnd)?;
        let expr = match token {
            Token::Int(n) => Expr::Literal(Value::from(n)),
            Token::Float(f) => Expr::Literal(float_value(f).map_err(|_| {
                ExpressionError::UnexpectedToken(f.to_string())
            })?),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::Op("-") => {
                return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.expression(BP_UNARY)?)))
            }
            Token::Op("+") => return self.expression(BP_UNARY),
            Token::Op("!") => {
                return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.expression(BP_NOT)?)))
            }
            Token::LParen => {
                let inner = self.expression(0)?;
                self.expect(Token::RParen)?;
                inner
            }
            Token::LBracket => Expr::List(self.list_items()?),
            Token::Ident(name) => match name.as_str() {
                "true" | "True" => Expr::Literal(Value::Bool(true)),
                "false" | "False" => Expr::Literal(Value::Bool(false)),
                "null" | "None" | "none" => Expr::Literal(Value::Null),
                "not" => {
                    return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.expression(BP_NOT)?)))
                }
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    Expr::Call(name.clone(), self.call_args()?)
                }
                _ => Expr::Var(name.clone()),
            },
            other => return Err(ExpressionError::UnexpectedToken(describe(&other))),
        };
        self.postfix(expr)
    }

    fn postfix(&mut self, mut expr: Expr) -> Result<Expr, ExpressionError> {
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let member = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        Some(Token::Int(n)) => n.to_string(),
                        Some(other) => return Err(ExpressionError::UnexpectedToken(describe(&other))),
                        None => return Err(ExpressionError::UnexpectedEnd),
                    };
                    expr = Expr::Member(Box::new(expr), member);
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.expression(0)?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn list_items(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        self.delimited(Token::RBracket)
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        self.delimited(Token::RParen)
    }

    fn delimited(&mut self, close: Token) -> Result<Vec<Expr>, ExpressionError> {
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(&close) {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.expression(0)?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(token) if token == close => return Ok(items),
                Some(token) => return Err(ExpressionError::UnexpectedToken(describe(&token))),
                None => return Err(ExpressionError::UnexpectedEnd),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn into_value(self) -> Result<Value, ExpressionError> {
        match self {
            Num::Int(i) => Ok(Value::from(i)),
            Num::Float(f) => float_value(f),
        }
    }
}

fn float_value(f: f64) -> Result<Value, ExpressionError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::Type(format!("non-finite number {f}")))
}

fn as_num(value: &Value) -> Option<Num> {
    let n = match value {
        Value::Number(n) => n,
        _ => return None,
    };
    match n.as_i64() {
        Some(i) => Some(Num::Int(i)),
        None => n.as_f64().map(Num::Float),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

fn eval(expr: &Expr, scope: &Value) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownVariable(name.clone())),
        Expr::Member(base, member) => {
            let base = eval(base, scope)?;
            let found = match &base {
                Value::Object(map) => map.get(member),
                Value::Array(items) => member.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            found
                .cloned()
                .ok_or_else(|| ExpressionError::UnknownVariable(member.clone()))
        }
        Expr::Index(base, index) => {
            let base = eval(base, scope)?;
            let index = eval(index, scope)?;
            index_value(&base, &index)
        }
        Expr::List(items) => items
            .iter()
            .map(|item| eval(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!is_truthy(&eval(inner, scope)?))),
        Expr::Unary(UnaryOp::Neg, inner) => {
            let value = eval(inner, scope)?;
            match as_num(&value) {
                Some(Num::Int(i)) => match i.checked_neg() {
                    Some(n) => Ok(Value::from(n)),
                    None => float_value(-(i as f64)),
                },
                Some(Num::Float(f)) => float_value(-f),
                None => Err(ExpressionError::Type(format!(
                    "cannot negate {}",
                    type_name(&value)
                ))),
            }
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            if !is_truthy(&eval(lhs, scope)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(is_truthy(&eval(rhs, scope)?)))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            if is_truthy(&eval(lhs, scope)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(is_truthy(&eval(rhs, scope)?)))
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, scope)?;
            let rhs = eval(rhs, scope)?;
            binary(*op, &lhs, &rhs)
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| eval(arg, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call_function(name, args)
        }
    }
}

fn index_value(base: &Value, index: &Value) -> Result<Value, ExpressionError> {
    let missing = || ExpressionError::UnknownVariable(format!("[{}]", display_string(index)));
    match (base, index) {
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().ok_or_else(missing),
        (Value::Array(items), _) => {
            let i = as_num(index)
                .and_then(|n| match n {
                    Num::Int(i) => Some(i),
                    Num::Float(_) => None,
                })
                .ok_or_else(|| ExpressionError::Type("list index must be an integer".into()))?;
            let len = items.len() as i64;
            let resolved = if i < 0 { len + i } else { i };
            if resolved < 0 || resolved >= len {
                return Err(missing());
            }
            Ok(items[resolved as usize].clone())
        }
        (Value::String(s), Value::Number(n)) => {
            let i = n
                .as_i64()
                .ok_or_else(|| ExpressionError::Type("string index must be an integer".into()))?;
            let len = s.chars().count() as i64;
            let resolved = if i < 0 { len + i } else { i };
            if resolved < 0 || resolved >= len {
                return Err(missing());
            }
            Ok(Value::String(
                s.chars().nth(resolved as usize).map(String::from).unwrap_or_default(),
            ))
        }
        _ => Err(ExpressionError::Type(format!(
            "cannot index {} with {}",
            type_name(base),
            type_name(index)
        ))),
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(lhs, rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(lhs, rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(lhs, rhs).ok_or_else(|| {
                ExpressionError::Type(format!(
                    "cannot compare {} with {}",
                    type_name(lhs),
                    type_name(rhs)
                ))
            })?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::In => contains(rhs, lhs).map(Value::Bool),
        BinaryOp::NotIn => contains(rhs, lhs).map(|found| Value::Bool(!found)),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, lhs, rhs)
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("logical operators short-circuit in eval"),
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExpressionError> {
    if let (Some(a), Some(b)) = (as_num(lhs), as_num(rhs)) {
        return numeric(op, a, b)?.into_value();
    }

    match (op, lhs, rhs) {
        (BinaryOp::Add, Value::String(a), b) => Ok(Value::String(format!("{a}{}", display_string(b)))),
        (BinaryOp::Add, a, Value::String(b)) => Ok(Value::String(format!("{}{b}", display_string(a)))),
        (BinaryOp::Add, Value::Array(a), Value::Array(b)) => {
            Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
        }
        _ => Err(ExpressionError::Type(format!(
            "unsupported operand types {} and {}",
            type_name(lhs),
            type_name(rhs)
        ))),
    }
}

fn numeric(op: BinaryOp, a: Num, b: Num) -> Result<Num, ExpressionError> {
    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        let exact = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div => {
                if y == 0 {
                    return Err(ExpressionError::DivisionByZero);
                }
                if x % y == 0 {
                    x.checked_div(y)
                } else {
                    None
                }
            }
            BinaryOp::Mod => {
                if y == 0 {
                    return Err(ExpressionError::DivisionByZero);
                }
                // Result takes the sign of the divisor
                x.checked_rem(y).map(|r| if r != 0 && (r < 0) != (y < 0) { r + y } else { r })
            }
            _ => None,
        };
        if let Some(n) = exact {
            return Ok(Num::Int(n));
        }
    }

    let (x, y) = (a.as_f64(), b.as_f64());
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => {
            if y == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            x / y
        }
        BinaryOp::Mod => {
            if y == 0.0 {
                return Err(ExpressionError::DivisionByZero);
            }
            x - y * (x / y).floor()
        }
        _ => return Err(ExpressionError::Type("not an arithmetic operator".into())),
    };
    Ok(Num::Float(result))
}

// Equality with the same string/bool/number coercion used for conditions.
fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(_), Value::Number(_)) => match (as_num(lhs), as_num(rhs)) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
            (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
            _ => false,
        },
        (Value::String(s), Value::Bool(b)) | (Value::Bool(b), Value::String(s)) => {
            if *b {
                s == "true" || s == "1"
            } else {
                s == "false" || s == "0"
            }
        }
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| loose_eq(x, y))
        }
        _ => lhs == rhs,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(_), Value::Number(_)) => match (as_num(lhs)?, as_num(rhs)?) {
            (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

// Evaluates membership for lists, strings and mappings.
fn contains(collection: &Value, item: &Value) -> Result<bool, ExpressionError> {
    match collection {
        Value::Array(arr) => Ok(arr.iter().any(|v| loose_eq(v, item))),
        Value::String(s) => Ok(s.contains(display_string(item).as_str())),
        Value::Object(map) => Ok(map.contains_key(display_string(item).as_str())),
        other => Err(ExpressionError::Type(format!(
            "'in' needs a list, string or mapping, got {}",
            type_name(other)
        ))),
    }
}

// ---------------------------------------------------------------------------
// Functions

fn check_arity(
    name: &'static str,
    args: &[Value],
    min: usize,
    max: usize,
) -> Result<(), ExpressionError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(ExpressionError::InvalidArguments(
            name,
            format!("expected {expected} arguments, got {}", args.len()),
        ));
    }
    Ok(())
}

fn int_arg(name: &'static str, value: &Value) -> Result<i64, ExpressionError> {
    match as_num(value) {
        Some(Num::Int(i)) => Ok(i),
        Some(Num::Float(f)) if f.fract() == 0.0 => Ok(f as i64),
        _ => Err(ExpressionError::InvalidArguments(
            name,
            format!("expected an integer, got {}", display_string(value)),
        )),
    }
}

/// Arguments of min/max/sum: either one list or the arguments themselves.
fn spread(args: Vec<Value>) -> Vec<Value> {
    match args.as_slice() {
        [Value::Array(items)] => items.clone(),
        _ => args,
    }
}

fn call_function(name: &str, args: Vec<Value>) -> Result<Value, ExpressionError> {
    match name {
        "always" => {
            check_arity("always", &args, 0, 0)?;
            Ok(Value::Bool(true))
        }
        "len" => {
            check_arity("len", &args, 1, 1)?;
            let len = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => {
                    return Err(ExpressionError::InvalidArguments(
                        "len",
                        format!("{} has no length", type_name(other)),
                    ))
                }
            };
            Ok(Value::from(len as u64))
        }
        "int" => {
            check_arity("int", &args, 1, 1)?;
            let value = match &args[0] {
                Value::Bool(b) => i64::from(*b),
                Value::Number(_) => match as_num(&args[0]) {
                    Some(Num::Int(i)) => i,
                    Some(Num::Float(f)) => f.trunc() as i64,
                    None => 0,
                },
                Value::String(s) => {
                    let s = s.trim();
                    match s.parse::<i64>() {
                        Ok(i) => i,
                        Err(_) => s.parse::<f64>().map(|f| f.trunc() as i64).map_err(|_| {
                            ExpressionError::InvalidArguments("int", format!("'{s}' is not a number"))
                        })?,
                    }
                }
                other => {
                    return Err(ExpressionError::InvalidArguments(
                        "int",
                        format!("cannot convert {}", type_name(other)),
                    ))
                }
            };
            Ok(Value::from(value))
        }
        "float" => {
            check_arity("float", &args, 1, 1)?;
            let value = match &args[0] {
                Value::Bool(b) => f64::from(u8::from(*b)),
                Value::Number(n) => n.as_f64().unwrap_or(0.0),
                Value::String(s) => s.trim().parse::<f64>().map_err(|_| {
                    ExpressionError::InvalidArguments("float", format!("'{s}' is not a number"))
                })?,
                other => {
                    return Err(ExpressionError::InvalidArguments(
                        "float",
                        format!("cannot convert {}", type_name(other)),
                    ))
                }
            };
            float_value(value)
        }
        "str" => {
            check_arity("str", &args, 1, 1)?;
            Ok(Value::String(display_string(&args[0])))
        }
        "bool" => {
            check_arity("bool", &args, 1, 1)?;
            Ok(Value::Bool(is_truthy(&args[0])))
        }
        "abs" => {
            check_arity("abs", &args, 1, 1)?;
            match as_num(&args[0]) {
                Some(Num::Int(i)) => Ok(Value::from(i.checked_abs().unwrap_or(i64::MAX))),
                Some(Num::Float(f)) => float_value(f.abs()),
                None => Err(ExpressionError::InvalidArguments(
                    "abs",
                    format!("expected a number, got {}", type_name(&args[0])),
                )),
            }
        }
        "min" | "max" => {
            let label: &'static str = if name == "min" { "min" } else { "max" };
            let items = spread(args);
            let mut best: Option<Value> = None;
            for item in items {
                best = Some(match best {
                    None => item,
                    Some(current) => {
                        let ordering = compare(&item, &current).ok_or_else(|| {
                            ExpressionError::InvalidArguments(label, "values are not comparable".into())
                        })?;
                        let better = if label == "min" {
                            ordering == Ordering::Less
                        } else {
                            ordering == Ordering::Greater
                        };
                        if better {
                            item
                        } else {
                            current
                        }
                    }
                });
            }
            best.ok_or_else(|| ExpressionError::InvalidArguments(label, "no values".into()))
        }
        "sum" => {
            let mut total = Num::Int(0);
            for item in spread(args) {
                let n = as_num(&item).ok_or_else(|| {
                    ExpressionError::InvalidArguments(
                        "sum",
                        format!("expected numbers, got {}", type_name(&item)),
                    )
                })?;
                total = numeric(BinaryOp::Add, total, n)?;
            }
            total.into_value()
        }
        "round" => {
            check_arity("round", &args, 1, 2)?;
            let value = as_num(&args[0]).ok_or_else(|| {
                ExpressionError::InvalidArguments("round", "expected a number".into())
            })?;
            let digits = match args.get(1) {
                Some(d) => int_arg("round", d)?,
                None => 0,
            };
            match (value, digits) {
                (Num::Int(i), _) => Ok(Value::from(i)),
                (Num::Float(f), 0) => Ok(Value::from(f.round() as i64)),
                (Num::Float(f), d) => {
                    let factor = 10f64.powi(d.clamp(-15, 15) as i32);
                    float_value((f * factor).round() / factor)
                }
            }
        }
        "lower" | "upper" | "trim" => {
            let label: &'static str = match name {
                "lower" => "lower",
                "upper" => "upper",
                _ => "trim",
            };
            check_arity(label, &args, 1, 1)?;
            let text = display_string(&args[0]);
            let result = match label {
                "lower" => text.to_lowercase(),
                "upper" => text.to_uppercase(),
                _ => text.trim().to_string(),
            };
            Ok(Value::String(result))
        }
        "contains" => {
            check_arity("contains", &args, 2, 2)?;
            contains(&args[0], &args[1]).map(Value::Bool)
        }
        "startsWith" | "endsWith" => {
            let label: &'static str = if name == "startsWith" { "startsWith" } else { "endsWith" };
            check_arity(label, &args, 2, 2)?;
            let text = display_string(&args[0]);
            let affix = display_string(&args[1]);
            let result = if label == "startsWith" {
                text.starts_with(&affix)
            } else {
                text.ends_with(&affix)
            };
            Ok(Value::Bool(result))
        }
        "range" => {
            check_arity("range", &args, 1, 3)?;
            let ints = args
                .iter()
                .map(|arg| int_arg("range", arg))
                .collect::<Result<Vec<_>, _>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => unreachable!("arity checked above"),
            };
            if step == 0 {
                return Err(ExpressionError::InvalidArguments("range", "step must not be zero".into()));
            }
            let count = if step > 0 {
                stop.saturating_sub(start)
                    .saturating_add(step - 1)
                    .max(0)
                    / step
            } else {
                start
                    .saturating_sub(stop)
                    .saturating_sub(step + 1)
                    .max(0)
                    / step.saturating_neg()
            };
            if count > MAX_RANGE_ITEMS {
                return Err(ExpressionError::InvalidArguments(
                    "range",
                    format!("would produce {count} items"),
                ));
            }
            Ok(Value::Array(
                (0..count).map(|i| Value::from(start + i * step)).collect(),
            ))
        }
        other => Err(ExpressionError::UnknownFunction(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value(expr: &str, scope: &Value) -> Value {
        evaluate_value(expr, scope).unwrap()
    }

    #[test]
    fn test_precedence_and_grouping() {
        let scope = json!({});
        assert_eq!(value("1 + 2 * 3", &scope), json!(7));
        assert_eq!(value("(1 + 2) * 3", &scope), json!(9));
        assert_eq!(value("10 - 4 - 3", &scope), json!(3));
        assert_eq!(value("-2 * 3", &scope), json!(-6));
    }

    #[test]
    fn test_division_keeps_integers_when_exact() {
        let scope = json!({});
        assert_eq!(value("6 / 3", &scope), json!(2));
        assert_eq!(value("7 / 2", &scope), json!(3.5));
        assert_eq!(value("-7 % 3", &scope), json!(2));
        assert_eq!(
            evaluate_value("1 / 0", &scope),
            Err(ExpressionError::DivisionByZero)
        );
    }

    #[test]
    fn test_not_binds_looser_than_comparison() {
        let scope = json!({"a": 1});
        assert_eq!(value("not a == 2", &scope), json!(true));
        assert_eq!(value("!a == 1", &scope), json!(false));
    }

    #[test]
    fn test_not_in() {
        let scope = json!({"tags": ["a", "b"]});
        assert_eq!(value("'c' not in tags", &scope), json!(true));
        assert_eq!(value("'a' in tags", &scope), json!(true));
    }

    #[test]
    fn test_tokenizer_rejects_unknown_characters() {
        assert!(matches!(
            evaluate_value("a # b", &json!({"a": 1, "b": 2})),
            Err(ExpressionError::UnexpectedChar('#', _))
        ));
        assert_eq!(
            evaluate_value("'open", &json!({})),
            Err(ExpressionError::UnterminatedString)
        );
    }

    #[test]
    fn test_range_bounds() {
        let scope = json!({});
        assert_eq!(value("range(3)", &scope), json!([0, 1, 2]));
        assert_eq!(value("range(5, 1, -2)", &scope), json!([5, 3]));
        assert_eq!(value("range(2, 2)", &scope), json!([]));
        assert!(evaluate_value("range(0, 100000)", &scope).is_err());
    }

    #[test]
    fn test_strip_delimiters() {
        assert_eq!(strip_delimiters("{{ n + 1 }}"), Some("n + 1"));
        assert_eq!(strip_delimiters("  {{x}} "), Some("x"));
        assert_eq!(strip_delimiters("a {{ x }}"), None);
        assert_eq!(strip_delimiters("{{ a }} and {{ b }}"), None);
    }
}
