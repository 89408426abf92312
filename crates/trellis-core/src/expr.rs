//! Expression language for CONDITIONAL edges.
//!
//! Boolean combinations of comparisons and equality over shared-memory
//! keys, with string/number/boolean/null literals. No function calls, no
//! side effects. Parsing is total: an error at graph load is fatal. An
//! evaluation error (missing key, mismatched comparison types) makes the
//! whole expression false.

use serde_json::Value;

use crate::error::{Result, TrellisError};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Key(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

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
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some('\\') => match chars.next() {
                            Some(esc) => s.push(esc),
                            None => {
                                return Err(TrellisError::Expression(
                                    "unterminated string literal".into(),
                                ))
                            }
                        },
                        Some(ch) => s.push(ch),
                        None => {
                            return Err(TrellisError::Expression(
                                "unterminated string literal".into(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Eq);
                } else {
                    return Err(TrellisError::Expression("single '=' is not an operator".into()));
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
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
            '&' => {
                chars.next();
                if chars.next() == Some('&') {
                    tokens.push(Token::And);
                } else {
                    return Err(TrellisError::Expression("expected '&&'".into()));
                }
            }
            '|' => {
                chars.next();
                if chars.next() == Some('|') {
                    tokens.push(Token::Or);
                } else {
                    return Err(TrellisError::Expression("expected '||'".into()));
                }
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut num = String::new();
                num.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let parsed: f64 = num
                    .parse()
                    .map_err(|_| TrellisError::Expression(format!("bad number '{num}'")))?;
                tokens.push(Token::Num(parsed));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&w) = chars.peek() {
                    if w.is_ascii_alphanumeric() || w == '_' || w == '.' {
                        word.push(w);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "null" | "None" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(TrellisError::Expression(format!(
                    "unexpected character '{other}'"
                )))
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

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<Expr> {
        self.or()
    }

    fn or(&mut self) -> Result<Expr> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut lhs = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let lhs = self.operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(lhs),
        };
        self.next();
        let rhs = self.operand()?;
        Ok(Expr::Cmp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn operand(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(Expr::Key(name)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(TrellisError::Expression("expected ')'".into())),
                }
            }
            other => Err(TrellisError::Expression(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

/// Parse an expression. Total: any syntactic problem is an error.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(TrellisError::Expression("empty expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(TrellisError::Expression(format!(
            "trailing tokens after position {}",
            parser.pos
        )));
    }
    Ok(expr)
}

#[derive(Debug)]
enum EvalError {
    MissingKey(String),
    TypeMismatch,
}

impl Expr {
    /// Evaluate against a shared-memory snapshot. Any evaluation error
    /// (missing key, mismatched comparison types, non-boolean result)
    /// yields `false`.
    pub fn eval(&self, memory: &serde_json::Map<String, Value>) -> bool {
        matches!(self.eval_value(memory), Ok(Value::Bool(true)))
    }

    fn eval_value(&self, memory: &serde_json::Map<String, Value>) -> std::result::Result<Value, EvalError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Key(name) => memory
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::MissingKey(name.clone())),
            Expr::Not(inner) => match inner.eval_value(memory)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                _ => Err(EvalError::TypeMismatch),
            },
            Expr::And(lhs, rhs) => {
                match (lhs.eval_value(memory)?, rhs.eval_value(memory)?) {
                    (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a && b)),
                    _ => Err(EvalError::TypeMismatch),
                }
            }
            Expr::Or(lhs, rhs) => {
                match (lhs.eval_value(memory)?, rhs.eval_value(memory)?) {
                    (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a || b)),
                    _ => Err(EvalError::TypeMismatch),
                }
            }
            Expr::Cmp { op, lhs, rhs } => {
                let l = lhs.eval_value(memory)?;
                let r = rhs.eval_value(memory)?;
                compare(*op, &l, &r).map(Value::Bool)
            }
        }
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> std::result::Result<bool, EvalError> {
    match op {
        CmpOp::Eq => Ok(values_equal(l, r)),
        CmpOp::Ne => Ok(!values_equal(l, r)),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (l, r) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                    a.partial_cmp(&b).ok_or(EvalError::TypeMismatch)?
                }
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => return Err(EvalError::TypeMismatch),
            };
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            })
        }
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().unwrap_or(f64::NAN) == b.as_f64().unwrap_or(f64::NAN)
        }
        _ => l == r,
    }
}
