//! Boolean/arithmetic expression language for rule conditions.
//!
//! Expressions are parsed once into an AST and evaluated per tick against
//! a knowledge snapshot. The grammar covers literals, identifiers, member
//! access on the `utc`/`local` clock constants, arithmetic, comparisons,
//! `AND`/`OR`/`NOT`, the `Contains` method, and the lenient comparison
//! predicates `Equal`/`GreaterThan`/`LessThan`.

use chrono::{Datelike, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rio_core::value::{Value, ValueMap};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unresolved variable: {0}")]
    Unresolved(String),

    #[error("evaluation error: {0}")]
    Eval(String),
}

/// Binary operators in precedence groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Or => "OR",
            Self::And => "AND",
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    /// `base.field`, e.g. `utc.hour`.
    Member(Box<Expr>, String),
    /// `recv.Name(args)` or a bare `Name(args)` predicate.
    Call {
        receiver: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
    },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parse an expression from text.
    pub fn parse(text: &str) -> Result<Self, ExprError> {
        let tokens = lex(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError::Syntax {
                position: parser.pos,
                message: "trailing input".to_string(),
            });
        }
        Ok(expr)
    }

    /// Evaluate against a variable snapshot.
    pub fn eval(&self, vars: &ValueMap) -> Result<Value, ExprError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Ident(name) => resolve(name, vars),
            Self::Member(base, field) => eval_member(base, field, vars),
            Self::Call {
                receiver,
                name,
                args,
            } => eval_call(receiver.as_deref(), name, args, vars),
            Self::Not(inner) => {
                let value = inner.eval(vars)?;
                Ok(Value::Bool(!truthy(&value)?))
            }
            Self::Neg(inner) => {
                let value = inner.eval(vars)?;
                value
                    .as_float()
                    .map(|f| {
                        if f.fract() == 0.0 && matches!(value, Value::Int(_)) {
                            Value::Int(-(f as i64))
                        } else {
                            Value::Float(-f)
                        }
                    })
                    .ok_or_else(|| ExprError::Eval("cannot negate non-number".to_string()))
            }
            Self::Binary(op, left, right) => {
                eval_binary(*op, &left.eval(vars)?, &right.eval(vars)?)
            }
        }
    }

    /// Evaluate and coerce to boolean.
    pub fn eval_bool(&self, vars: &ValueMap) -> Result<bool, ExprError> {
        truthy(&self.eval(vars)?)
    }
}

/// Canonical normal form, stable under parse → display → parse.
impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(Value::Str(s)) => write!(f, "'{s}'"),
            Self::Literal(value) => write!(f, "{value}"),
            Self::Ident(name) => write!(f, "{name}"),
            Self::Member(base, field) => write!(f, "{base}.{field}"),
            Self::Call {
                receiver,
                name,
                args,
            } => {
                if let Some(receiver) = receiver {
                    write!(f, "{receiver}.{name}(")?;
                } else {
                    write!(f, "{name}(")?;
                }
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Self::Not(inner) => write!(f, "NOT ({inner})"),
            Self::Neg(inner) => write!(f, "-({inner})"),
            Self::Binary(op, left, right) => {
                write!(f, "({left} {} {right})", op.symbol())
            }
        }
    }
}

fn truthy(value: &Value) -> Result<bool, ExprError> {
    value
        .as_bool()
        .ok_or_else(|| ExprError::Eval(format!("not a boolean: {value}")))
}

fn resolve(name: &str, vars: &ValueMap) -> Result<Value, ExprError> {
    vars.get(name)
        .cloned()
        .ok_or_else(|| ExprError::Unresolved(name.to_string()))
}

fn eval_member(base: &Expr, field: &str, vars: &ValueMap) -> Result<Value, ExprError> {
    // Clock constants resolve before any variable lookup.
    if let Expr::Ident(name) = base {
        match name.to_ascii_lowercase().as_str() {
            "utc" => return clock_field(&Utc::now().naive_utc(), field),
            "local" => return clock_field(&Local::now().naive_local(), field),
            _ => {}
        }
    }
    let value = base.eval(vars)?;
    match value {
        Value::Map(map) => map
            .get(field)
            .cloned()
            .ok_or_else(|| ExprError::Unresolved(format!("{field} in map"))),
        other => Err(ExprError::Eval(format!(
            "cannot access .{field} on {other}"
        ))),
    }
}

fn clock_field(now: &chrono::NaiveDateTime, field: &str) -> Result<Value, ExprError> {
    let value = match field.to_ascii_lowercase().as_str() {
        "second" => now.second() as i64,
        "minute" => now.minute() as i64,
        "hour" => now.hour() as i64,
        "dayofweek" => now.weekday().num_days_from_sunday() as i64,
        "day" => now.day() as i64,
        "month" => now.month() as i64,
        "year" => now.year() as i64,
        other => {
            return Err(ExprError::Eval(format!("unknown clock field: {other}")));
        }
    };
    Ok(Value::Int(value))
}

fn eval_call(
    receiver: Option<&Expr>,
    name: &str,
    args: &[Expr],
    vars: &ValueMap,
) -> Result<Value, ExprError> {
    match (receiver, name) {
        (Some(receiver), "Contains") => {
            let haystack = receiver.eval(vars)?;
            let needle = args
                .first()
                .ok_or_else(|| ExprError::Eval("Contains needs one argument".to_string()))?
                .eval(vars)?;
            Ok(Value::Bool(contains(&haystack, &needle)))
        }
        (None, "Equal") => lenient_compare(args, vars, |ord| ord == std::cmp::Ordering::Equal),
        (None, "GreaterThan") => {
            lenient_compare(args, vars, |ord| ord == std::cmp::Ordering::Greater)
        }
        (None, "LessThan") => lenient_compare(args, vars, |ord| ord == std::cmp::Ordering::Less),
        _ => Err(ExprError::Eval(format!("unknown function: {name}"))),
    }
}

/// Membership test: arrays compare element text, strings are treated as a
/// comma-separated list.
fn contains(haystack: &Value, needle: &Value) -> bool {
    let needle = needle.to_text();
    match haystack {
        Value::Array(items) => items.iter().any(|item| item.to_text() == needle),
        Value::Str(s) => s.split(',').any(|part| part.trim() == needle),
        _ => false,
    }
}

/// `Equal`/`GreaterThan`/`LessThan`: parse string arguments as integers
/// when possible, otherwise compare the texts.
fn lenient_compare(
    args: &[Expr],
    vars: &ValueMap,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<Value, ExprError> {
    if args.len() != 2 {
        return Err(ExprError::Eval("predicate needs two arguments".to_string()));
    }
    let a = args[0].eval(vars)?;
    let b = args[1].eval(vars)?;
    let ordering = match (a.as_int(), b.as_int()) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.to_text().cmp(&b.to_text()),
    };
    Ok(Value::Bool(accept(ordering)))
}

fn eval_binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    match op {
        BinOp::Or => Ok(Value::Bool(truthy(left)? || truthy(right)?)),
        BinOp::And => Ok(Value::Bool(truthy(left)? && truthy(right)?)),
        BinOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(left, right)?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ordering == std::cmp::Ordering::Less,
                BinOp::Le => ordering != std::cmp::Ordering::Greater,
                BinOp::Gt => ordering == std::cmp::Ordering::Greater,
                _ => ordering != std::cmp::Ordering::Less,
            }))
        }
        BinOp::Add => match (left, right) {
            (Value::Str(a), b) => Ok(Value::Str(format!("{a}{}", b.to_text()))),
            (a, Value::Str(b)) => Ok(Value::Str(format!("{}{b}", a.to_text()))),
            _ => arithmetic(left, right, |a, b| a + b),
        },
        BinOp::Sub => arithmetic(left, right, |a, b| a - b),
        BinOp::Mul => arithmetic(left, right, |a, b| a * b),
        BinOp::Div => {
            let divisor = right
                .as_float()
                .ok_or_else(|| ExprError::Eval("non-numeric divisor".to_string()))?;
            if divisor == 0.0 {
                return Err(ExprError::Eval("division by zero".to_string()));
            }
            arithmetic(left, right, |a, b| a / b)
        }
        BinOp::Mod => {
            let divisor = right
                .as_int()
                .ok_or_else(|| ExprError::Eval("non-integer modulus".to_string()))?;
            if divisor == 0 {
                return Err(ExprError::Eval("modulo by zero".to_string()));
            }
            let value = left
                .as_int()
                .ok_or_else(|| ExprError::Eval("non-integer operand".to_string()))?;
            Ok(Value::Int(value.rem_euclid(divisor)))
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_float(), right.as_float()) {
        (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
        _ => left.to_text() == right.to_text(),
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExprError> {
    match (left.as_float(), right.as_float()) {
        (Some(a), Some(b)) => a
            .partial_cmp(&b)
            .ok_or_else(|| ExprError::Eval("incomparable numbers".to_string())),
        _ => Ok(left.to_text().cmp(&right.to_text())),
    }
}

fn arithmetic(
    left: &Value,
    right: &Value,
    apply: impl Fn(f64, f64) -> f64,
) -> Result<Value, ExprError> {
    let (a, b) = match (left.as_float(), right.as_float()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(ExprError::Eval("non-numeric operand".to_string())),
    };
    let result = apply(a, b);
    if matches!((left, right), (Value::Int(_), Value::Int(_))) && result.fract() == 0.0 {
        Ok(Value::Int(result as i64))
    } else {
        Ok(Value::Float(result))
    }
}

// ---------------------------------------------------------------------------
// Lexer / parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Value),
    Text(String),
    Ident(String),
    Op(BinOp),
    Not,
    Dot,
    Comma,
    LParen,
    RParen,
}

fn lex(text: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Op(BinOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(BinOp::Sub));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(BinOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(BinOp::Div));
                i += 1;
            }
            '%' => {
                tokens.push(Token::Op(BinOp::Mod));
                i += 1;
            }
            '=' => {
                // Both `=` and `==` mean equality.
                i += if chars.get(i + 1) == Some(&'=') { 2 } else { 1 };
                tokens.push(Token::Op(BinOp::Eq));
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(BinOp::Ne));
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => match chars.get(i + 1) {
                Some('=') => {
                    tokens.push(Token::Op(BinOp::Le));
                    i += 2;
                }
                Some('>') => {
                    tokens.push(Token::Op(BinOp::Ne));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Op(BinOp::Lt));
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(BinOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(BinOp::Gt));
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j == chars.len() {
                    return Err(ExprError::Syntax {
                        position: i,
                        message: "unterminated string".to_string(),
                    });
                }
                tokens.push(Token::Text(chars[start..j].iter().collect()));
                i = j + 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A digit followed by `.` then a non-digit is member
                    // access on a number, which the grammar does not have;
                    // treat the dot as part of the number only when digits
                    // follow.
                    if chars[i] == '.'
                        && !chars.get(i + 1).map(char::is_ascii_digit).unwrap_or(false)
                    {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = if text.contains('.') {
                    Value::Float(text.parse().map_err(|_| ExprError::Syntax {
                        position: start,
                        message: format!("bad number: {text}"),
                    })?)
                } else {
                    Value::Int(text.parse().map_err(|_| ExprError::Syntax {
                        position: start,
                        message: format!("bad number: {text}"),
                    })?)
                };
                tokens.push(Token::Number(value));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.to_ascii_uppercase().as_str() {
                    "AND" => tokens.push(Token::Op(BinOp::And)),
                    "OR" => tokens.push(Token::Op(BinOp::Or)),
                    "NOT" => tokens.push(Token::Not),
                    "TRUE" => tokens.push(Token::Number(Value::Bool(true))),
                    "FALSE" => tokens.push(Token::Number(Value::Bool(false))),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(ExprError::Syntax {
                    position: i,
                    message: format!("unexpected character: {other}"),
                });
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
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

    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ExprError::Syntax {
                position: self.pos,
                message: format!("expected {token:?}"),
            })
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Op(BinOp::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::Op(BinOp::And)) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Op(op))
                if matches!(
                    op,
                    BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
                ) =>
            {
                *op
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) if matches!(op, BinOp::Add | BinOp::Sub) => *op,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) if matches!(op, BinOp::Mul | BinOp::Div | BinOp::Mod) => *op,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::Op(BinOp::Sub)) => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let name = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        _ => {
                            return Err(ExprError::Syntax {
                                position: self.pos,
                                message: "expected member name after '.'".to_string(),
                            });
                        }
                    };
                    if self.peek() == Some(&Token::LParen) {
                        let args = self.parse_args()?;
                        expr = Expr::Call {
                            receiver: Some(Box::new(expr)),
                            name,
                            args,
                        };
                    } else {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(Expr::Literal(value)),
            Some(Token::Text(text)) => Ok(Expr::Literal(Value::Str(text))),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    let args = self.parse_args()?;
                    Ok(Expr::Call {
                        receiver: None,
                        name,
                        args,
                    })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(ExprError::Syntax {
                position: self.pos,
                message: format!("unexpected token: {other:?}"),
            }),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ExprError> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                other => {
                    return Err(ExprError::Syntax {
                        position: self.pos,
                        message: format!("expected ',' or ')', got {other:?}"),
                    });
                }
            }
        }
    }
}

/// Compiled expression paired with its source, serialized as the source
/// text so rule files stay human-editable.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    source: String,
    expr: Expr,
}

impl CompiledExpr {
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        Ok(Self {
            source: source.to_string(),
            expr: Expr::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn normal_form(&self) -> String {
        self.expr.to_string()
    }

    pub fn eval_bool(&self, vars: &ValueMap) -> Result<bool, ExprError> {
        self.expr.eval_bool(vars)
    }
}

impl Serialize for CompiledExpr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for CompiledExpr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Self::compile(&source).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(entries: &[(&str, Value)]) -> ValueMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn arithmetic_and_comparison() {
        let expr = Expr::parse("gps_speed * 2 > 10").unwrap();
        assert!(expr
            .eval_bool(&vars(&[("gps_speed", Value::Float(6.0))]))
            .unwrap());
        assert!(!expr
            .eval_bool(&vars(&[("gps_speed", Value::Float(4.0))]))
            .unwrap());
    }

    #[test]
    fn logical_operators_and_parens() {
        let expr = Expr::parse("(a = 1 OR b = 1) AND NOT c").unwrap();
        let env = vars(&[
            ("a", Value::Int(0)),
            ("b", Value::Int(1)),
            ("c", Value::Bool(false)),
        ]);
        assert!(expr.eval_bool(&env).unwrap());
    }

    #[test]
    fn contains_on_comma_list_and_array() {
        let env = vars(&[
            ("addresses", Value::Str("D01, D02,D03".into())),
            ("ID", Value::Str("D02".into())),
        ]);
        let expr = Expr::parse("addresses.Contains(ID)").unwrap();
        assert!(expr.eval_bool(&env).unwrap());

        let env = vars(&[
            (
                "addresses",
                Value::Array(vec![Value::Str("a".into()), Value::Str("b".into())]),
            ),
            ("ID", Value::Str("c".into())),
        ]);
        assert!(!expr.eval_bool(&env).unwrap());
    }

    #[test]
    fn lenient_predicates_prefer_integers() {
        let env = vars(&[("level", Value::Str("10".into()))]);
        assert!(Expr::parse("GreaterThan(level, 9)")
            .unwrap()
            .eval_bool(&env)
            .unwrap());
        // String comparison would say "10" < "9"; integer parsing wins.
        assert!(!Expr::parse("LessThan(level, 9)")
            .unwrap()
            .eval_bool(&env)
            .unwrap());
        // Non-numeric strings fall back to text comparison.
        let env = vars(&[("state", Value::Str("armed".into()))]);
        assert!(Expr::parse("Equal(state, 'armed')")
            .unwrap()
            .eval_bool(&env)
            .unwrap());
    }

    #[test]
    fn clock_members_resolve() {
        let expr = Expr::parse("utc.hour >= 0 AND utc.hour <= 23").unwrap();
        assert!(expr.eval_bool(&ValueMap::new()).unwrap());
        let expr = Expr::parse("utc.dayofweek >= 0 AND utc.dayofweek <= 6").unwrap();
        assert!(expr.eval_bool(&ValueMap::new()).unwrap());
    }

    #[test]
    fn unresolved_identifier_is_an_error() {
        let expr = Expr::parse("missing > 1").unwrap();
        assert!(matches!(
            expr.eval_bool(&ValueMap::new()),
            Err(ExprError::Unresolved(_))
        ));
    }

    #[test]
    fn modulo_supports_step_conditions() {
        let expr = Expr::parse("utc.second % 1 = 0").unwrap();
        assert!(expr.eval_bool(&ValueMap::new()).unwrap());
    }

    #[test]
    fn normal_form_is_parse_stable() {
        let compiled = CompiledExpr::compile("a=1 AND (b>2 OR NOT c)").unwrap();
        let normal = compiled.normal_form();
        let reparsed = CompiledExpr::compile(&normal).unwrap();
        assert_eq!(reparsed.normal_form(), normal);
    }

    #[test]
    fn string_equality_and_concat() {
        let env = vars(&[("name", Value::Str("rio".into()))]);
        assert!(Expr::parse("name + '1' = 'rio1'")
            .unwrap()
            .eval_bool(&env)
            .unwrap());
        assert!(Expr::parse("name <> 'other'")
            .unwrap()
            .eval_bool(&env)
            .unwrap());
    }
}
