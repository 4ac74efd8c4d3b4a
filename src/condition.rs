//! Condition evaluator - sandboxed predicate expressions
//!
//! Branch and loop conditions are data, not code: they arrive in workflow
//! documents and in patches authored by agents, so they are evaluated in a
//! small sandboxed expression language over the fixed bindings
//! `{output, ctx}` with a mandatory boolean result.
//!
//! Supported syntax: literals (numbers, single/double-quoted strings,
//! `true`/`false`/`null`), dotted and indexed paths rooted at `output` or
//! `ctx`, `!`, `&&`, `||`, comparisons (`== != < <= > >=`), arithmetic
//! (`+ - * / %`), parentheses, unary minus. The `$.field` sugar normalizes
//! to `output.field` before compilation.
//!
//! Expressions compile once into an AST cached by canonical text; the cache
//! is process-wide and shared across runs.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

use crate::ir::Condition;
use crate::jsonpath::Segment;

/// Evaluation failure
///
/// Every variant surfaces as `type_error` at the boundary: the expression is
/// syntactically or semantically unusable as a predicate.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("cannot parse expression '{expression}': {reason}")]
    Parse { expression: String, reason: String },

    #[error("condition type '{0}' is not supported (only 'cel')")]
    UnsupportedConditionType(String),

    #[error("expression must evaluate to a boolean, got {got}")]
    NonBoolean { got: &'static str },

    #[error("unknown binding '{0}': expressions see only 'output' and 'ctx'")]
    UnknownBinding(String),

    #[error("type mismatch in '{op}': {detail}")]
    TypeMismatch { op: &'static str, detail: String },

    #[error("division by zero")]
    DivisionByZero,
}

// ============================================================================
// AST
// ============================================================================

/// Variable root an expression path hangs off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Output,
    Ctx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
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
    Rem,
}

impl BinOp {
    fn name(&self) -> &'static str {
        match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
        }
    }
}

/// Compiled expression tree
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path { root: Root, segments: Vec<Segment> },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary { op: BinOp, left: Box<Expr>, right: Box<Expr> },
}

// ============================================================================
// TOKENIZER
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

fn tokenize(text: &str) -> Result<Vec<Tok>, String> {
    let mut toks = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        match ch {
            c if c.is_whitespace() => {}
            '(' => toks.push(Tok::LParen),
            ')' => toks.push(Tok::RParen),
            '[' => toks.push(Tok::LBracket),
            ']' => toks.push(Tok::RBracket),
            '.' => toks.push(Tok::Dot),
            '+' => toks.push(Tok::Plus),
            '-' => toks.push(Tok::Minus),
            '*' => toks.push(Tok::Star),
            '/' => toks.push(Tok::Slash),
            '%' => toks.push(Tok::Percent),
            '!' => {
                if chars.peek().map(|(_, c)| *c) == Some('=') {
                    chars.next();
                    toks.push(Tok::Ne);
                } else {
                    toks.push(Tok::Not);
                }
            }
            '=' => {
                if chars.peek().map(|(_, c)| *c) == Some('=') {
                    chars.next();
                    toks.push(Tok::Eq);
                } else {
                    return Err(format!("stray '=' at offset {}", i));
                }
            }
            '<' => {
                if chars.peek().map(|(_, c)| *c) == Some('=') {
                    chars.next();
                    toks.push(Tok::Le);
                } else {
                    toks.push(Tok::Lt);
                }
            }
            '>' => {
                if chars.peek().map(|(_, c)| *c) == Some('=') {
                    chars.next();
                    toks.push(Tok::Ge);
                } else {
                    toks.push(Tok::Gt);
                }
            }
            '&' => {
                if chars.peek().map(|(_, c)| *c) == Some('&') {
                    chars.next();
                    toks.push(Tok::And);
                } else {
                    return Err(format!("stray '&' at offset {}", i));
                }
            }
            '|' => {
                if chars.peek().map(|(_, c)| *c) == Some('|') {
                    chars.next();
                    toks.push(Tok::Or);
                } else {
                    return Err(format!("stray '|' at offset {}", i));
                }
            }
            '\'' | '"' => {
                let quote = ch;
                let mut s = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, 'n')) => s.push('\n'),
                            Some((_, 't')) => s.push('\t'),
                            Some((_, other)) => s.push(other),
                            None => return Err("unterminated escape".to_string()),
                        },
                        other => s.push(other),
                    }
                }
                if !closed {
                    return Err("unterminated string literal".to_string());
                }
                toks.push(Tok::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut num = String::from(c);
                while let Some((_, next)) = chars.peek() {
                    if next.is_ascii_digit() {
                        num.push(*next);
                        chars.next();
                    } else if *next == '.' {
                        // consume the dot only when a digit follows, so
                        // `items.0.name` keeps its path dots
                        let mut ahead = chars.clone();
                        ahead.next();
                        match ahead.peek() {
                            Some((_, d)) if d.is_ascii_digit() => {
                                num.push('.');
                                chars.next();
                            }
                            _ => break,
                        }
                    } else {
                        break;
                    }
                }
                let parsed: f64 = num
                    .parse()
                    .map_err(|_| format!("bad number literal '{}'", num))?;
                toks.push(Tok::Number(parsed));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::from(c);
                while let Some((_, next)) = chars.peek() {
                    if next.is_alphanumeric() || *next == '_' {
                        ident.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                toks.push(Tok::Ident(ident));
            }
            other => return Err(format!("unexpected character '{}' at offset {}", other, i)),
        }
    }

    Ok(toks)
}

// ============================================================================
// PARSER (recursive descent, precedence climbing)
// ============================================================================

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, expected: &Tok) -> Result<(), String> {
        match self.next() {
            Some(ref t) if t == expected => Ok(()),
            other => Err(format!("expected {:?}, got {:?}", expected, other)),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Tok::Or) {
            self.next();
            let right = self.and_expr()?;
            left = Expr::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.equality()?;
        while self.peek() == Some(&Tok::And) {
            self.next();
            let right = self.equality()?;
            left = Expr::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, String> {
        let left = self.comparison()?;
        let op = match self.peek() {
            Some(Tok::Eq) => BinOp::Eq,
            Some(Tok::Ne) => BinOp::Ne,
            _ => return Ok(left),
        };
        self.next();
        let right = self.comparison()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(Tok::Lt) => BinOp::Lt,
            Some(Tok::Le) => BinOp::Le,
            Some(Tok::Gt) => BinOp::Gt,
            Some(Tok::Ge) => BinOp::Ge,
            _ => return Ok(left),
        };
        self.next();
        let right = self.additive()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let right = self.multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Rem,
                _ => break,
            };
            self.next();
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Tok::Not) => {
                self.next();
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Tok::Minus) => {
                self.next();
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Tok::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Tok::LParen) => {
                let inner = self.expr()?;
                self.eat(&Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::Ident(ident)) => match ident.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "output" => self.path(Root::Output),
                "ctx" => self.path(Root::Ctx),
                other => Err(format!("unknown binding '{}'", other)),
            },
            other => Err(format!("unexpected token {:?}", other)),
        }
    }

    /// Trailing `.field` / `[index]` segments after a binding root
    fn path(&mut self, root: Root) -> Result<Expr, String> {
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.next();
                    match self.next() {
                        Some(Tok::Ident(field)) => segments.push(Segment::Field(field)),
                        Some(Tok::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                            segments.push(Segment::Index(n as usize))
                        }
                        other => return Err(format!("expected field after '.', got {:?}", other)),
                    }
                }
                Some(Tok::LBracket) => {
                    self.next();
                    match self.next() {
                        Some(Tok::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                            segments.push(Segment::Index(n as usize));
                        }
                        Some(Tok::Str(key)) => segments.push(Segment::Field(key)),
                        other => return Err(format!("expected index in '[]', got {:?}", other)),
                    }
                    self.eat(&Tok::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(Expr::Path { root, segments })
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

// ============================================================================
// EVALUATION
// ============================================================================

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_bool(v: &Value, op: &'static str) -> Result<bool, EvalError> {
    v.as_bool().ok_or_else(|| EvalError::TypeMismatch {
        op,
        detail: format!("expected bool, got {}", type_name(v)),
    })
}

fn as_number(v: &Value, op: &'static str) -> Result<f64, EvalError> {
    v.as_f64().ok_or_else(|| EvalError::TypeMismatch {
        op,
        detail: format!("expected number, got {}", type_name(v)),
    })
}

fn eval(expr: &Expr, output: &Value, ctx: &Value) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),

        // Missing fields evaluate to null so equality checks against
        // absent data stay expressible; ordering on null still errors.
        Expr::Path { root, segments } => {
            let base = match root {
                Root::Output => output,
                Root::Ctx => ctx,
            };
            Ok(crate::jsonpath::extract(base, segments)
                .cloned()
                .unwrap_or(Value::Null))
        }

        Expr::Not(inner) => {
            let v = eval(inner, output, ctx)?;
            Ok(Value::Bool(!as_bool(&v, "!")?))
        }

        Expr::Neg(inner) => {
            let v = eval(inner, output, ctx)?;
            Ok(number_value(-as_number(&v, "-")?))
        }

        Expr::Binary { op, left, right } => match op {
            // Short-circuiting boolean operators
            BinOp::And => {
                let l = eval(left, output, ctx)?;
                if !as_bool(&l, "&&")? {
                    return Ok(Value::Bool(false));
                }
                let r = eval(right, output, ctx)?;
                Ok(Value::Bool(as_bool(&r, "&&")?))
            }
            BinOp::Or => {
                let l = eval(left, output, ctx)?;
                if as_bool(&l, "||")? {
                    return Ok(Value::Bool(true));
                }
                let r = eval(right, output, ctx)?;
                Ok(Value::Bool(as_bool(&r, "||")?))
            }

            BinOp::Eq | BinOp::Ne => {
                let l = eval(left, output, ctx)?;
                let r = eval(right, output, ctx)?;
                let equal = values_equal(&l, &r);
                Ok(Value::Bool(if *op == BinOp::Eq { equal } else { !equal }))
            }

            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let l = eval(left, output, ctx)?;
                let r = eval(right, output, ctx)?;
                let ordering = compare(&l, &r, op.name())?;
                let result = match op {
                    BinOp::Lt => ordering.is_lt(),
                    BinOp::Le => ordering.is_le(),
                    BinOp::Gt => ordering.is_gt(),
                    BinOp::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }

            BinOp::Add => {
                let l = eval(left, output, ctx)?;
                let r = eval(right, output, ctx)?;
                match (&l, &r) {
                    (Value::String(a), Value::String(b)) => {
                        Ok(Value::String(format!("{}{}", a, b)))
                    }
                    _ => Ok(number_value(as_number(&l, "+")? + as_number(&r, "+")?)),
                }
            }
            BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                let l = eval(left, output, ctx)?;
                let r = eval(right, output, ctx)?;
                let (a, b) = (as_number(&l, op.name())?, as_number(&r, op.name())?);
                let result = match op {
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => {
                        if b == 0.0 {
                            return Err(EvalError::DivisionByZero);
                        }
                        a / b
                    }
                    BinOp::Rem => {
                        if b == 0.0 {
                            return Err(EvalError::DivisionByZero);
                        }
                        a % b
                    }
                    _ => unreachable!(),
                };
                Ok(number_value(result))
            }
        },
    }
}

/// Deep equality with numeric coercion (1 == 1.0)
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value, op: &'static str) -> Result<std::cmp::Ordering, EvalError> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => {
            let (x, y) = (as_number(a, op)?, as_number(b, op)?);
            x.partial_cmp(&y).ok_or(EvalError::TypeMismatch {
                op,
                detail: "numbers are not comparable (NaN)".to_string(),
            })
        }
    }
}

// ============================================================================
// EVALUATOR (public API with compiled-expression cache)
// ============================================================================

/// Compiles and evaluates conditions, caching compiled ASTs by canonical
/// expression text
///
/// One evaluator per process; the cache is shared across runs and bounded
/// only by the distinct expression text in installed IRs.
#[derive(Debug, Default)]
pub struct ConditionEvaluator {
    cache: DashMap<String, Arc<Expr>>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize the `$.field` sugar to `output.field`
    fn canonicalize(expression: &str) -> String {
        let trimmed = expression.trim();
        if let Some(rest) = trimmed.strip_prefix("$.") {
            format!("output.{}", rest)
        } else if trimmed == "$" {
            "output".to_string()
        } else {
            trimmed.to_string()
        }
    }

    fn compile(&self, expression: &str) -> Result<Arc<Expr>, EvalError> {
        let canonical = Self::canonicalize(expression);
        if let Some(cached) = self.cache.get(&canonical) {
            return Ok(Arc::clone(&cached));
        }

        let toks = tokenize(&canonical).map_err(|reason| EvalError::Parse {
            expression: canonical.clone(),
            reason,
        })?;
        let mut parser = Parser { toks, pos: 0 };
        let expr = parser.expr().map_err(|reason| EvalError::Parse {
            expression: canonical.clone(),
            reason,
        })?;
        if parser.pos != parser.toks.len() {
            return Err(EvalError::Parse {
                expression: canonical,
                reason: "trailing tokens after expression".to_string(),
            });
        }

        let compiled = Arc::new(expr);
        self.cache
            .insert(canonical, Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Evaluate a condition over the completed node's output and the run
    /// context, honoring `invert`
    pub fn evaluate(
        &self,
        condition: &Condition,
        output: &Value,
        ctx: &Value,
    ) -> Result<bool, EvalError> {
        if condition.kind != "cel" {
            return Err(EvalError::UnsupportedConditionType(condition.kind.clone()));
        }
        let expr = self.compile(&condition.expression)?;
        match eval(&expr, output, ctx)? {
            Value::Bool(b) => Ok(b != condition.invert),
            other => Err(EvalError::NonBoolean {
                got: type_name(&other),
            }),
        }
    }

    /// Number of distinct compiled expressions held
    pub fn cached_expressions(&self) -> usize {
        self.cache.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
