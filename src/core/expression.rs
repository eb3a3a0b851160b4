//! Condition expressions
//!
//! `if:` strings are parsed once at load time into a small typed AST. Unknown
//! identifiers and functions are rejected here rather than silently evaluating
//! to false at run time.

use crate::core::error::ConfigError;
use std::collections::BTreeSet;
use std::fmt;

/// A literal value produced by evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Bool(bool),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Value::Str(s) => s,
            Value::Bool(true) => "true",
            Value::Bool(false) => "false",
        }
    }
}

/// Context identifiers an expression may reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ident {
    /// `github.event_name`
    EventName,
    /// `github.repository`
    Repository,
    /// `github.ref`
    Ref,
    /// `github.ref_name`
    RefName,
    /// `github.actor`
    Actor,
    /// `github.event.pusher.name`
    Pusher,
    /// `runner.os`
    RunnerOs,
    /// `matrix.<axis>`
    Matrix(String),
    /// `needs.<job>.result`
    NeedResult(String),
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ident::EventName => write!(f, "github.event_name"),
            Ident::Repository => write!(f, "github.repository"),
            Ident::Ref => write!(f, "github.ref"),
            Ident::RefName => write!(f, "github.ref_name"),
            Ident::Actor => write!(f, "github.actor"),
            Ident::Pusher => write!(f, "github.event.pusher.name"),
            Ident::RunnerOs => write!(f, "runner.os"),
            Ident::Matrix(axis) => write!(f, "matrix.{}", axis),
            Ident::NeedResult(job) => write!(f, "needs.{}.result", job),
        }
    }
}

/// Named predicate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    Success,
    Failure,
    Cancelled,
    Always,
    Contains,
    StartsWith,
    EndsWith,
}

impl Predicate {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "success" => Some(Predicate::Success),
            "failure" => Some(Predicate::Failure),
            "cancelled" => Some(Predicate::Cancelled),
            "always" => Some(Predicate::Always),
            "contains" => Some(Predicate::Contains),
            "startsWith" => Some(Predicate::StartsWith),
            "endsWith" => Some(Predicate::EndsWith),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            Predicate::Success | Predicate::Failure | Predicate::Cancelled | Predicate::Always => 0,
            Predicate::Contains | Predicate::StartsWith | Predicate::EndsWith => 2,
        }
    }

    /// Whether this predicate inspects upstream status
    pub fn is_status(self) -> bool {
        matches!(
            self,
            Predicate::Success | Predicate::Failure | Predicate::Cancelled | Predicate::Always
        )
    }

    fn name(self) -> &'static str {
        match self {
            Predicate::Success => "success",
            Predicate::Failure => "failure",
            Predicate::Cancelled => "cancelled",
            Predicate::Always => "always",
            Predicate::Contains => "contains",
            Predicate::StartsWith => "startsWith",
            Predicate::EndsWith => "endsWith",
        }
    }
}

/// Expression AST
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(Value),
    Reference(Ident),
    Predicate { func: Predicate, args: Vec<Expr> },
    Comparison { negated: bool, left: Box<Expr>, right: Box<Expr> },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Reference(_) => {}
            Expr::Predicate { args, .. } => args.iter().for_each(|a| a.visit(f)),
            Expr::Comparison { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
                left.visit(f);
                right.visit(f);
            }
            Expr::Not(inner) => inner.visit(f),
        }
    }
}

/// What a condition is allowed to reference
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// Human readable location used in error messages, e.g. `job 'rust'`
    pub label: String,
    /// Declared matrix axes of the enclosing job
    pub axes: BTreeSet<String>,
    /// Jobs listed in the enclosing job's `needs`
    pub needs: BTreeSet<String>,
    /// Every declared job in the pipeline
    pub jobs: BTreeSet<String>,
}

/// A parsed `if:` condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse a condition, accepting an optional `${{ ... }}` wrapper
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let trimmed = source.trim();
        let (inner, prefix) = match trimmed.strip_prefix("${{").and_then(|s| s.strip_suffix("}}")) {
            Some(inner) => (inner, "${{".len()),
            None => (trimmed, 0),
        };
        // Positions are reported relative to `source`
        let offset = source.len() - source.trim_start().len() + prefix;

        let tokens = Lexer::new(inner).tokenize().map_err(|e| ConfigError::Syntax {
            expr: source.to_string(),
            position: e.position + offset,
            message: e.message,
        })?;

        let mut parser = Parser {
            tokens,
            pos: 0,
            source,
            offset,
        };
        let expr = parser.parse_or()?;
        if parser.peek() != &Token::Eof {
            return Err(parser.error(format!("unexpected token '{}'", parser.peek())));
        }

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Whether the condition calls `success()`, `failure()`, `cancelled()` or `always()`
    pub fn uses_status(&self) -> bool {
        let mut found = false;
        self.expr.visit(&mut |e| {
            if let Expr::Predicate { func, .. } = e {
                found |= func.is_status();
            }
        });
        found
    }

    /// Check references against what the enclosing job declares
    pub fn validate(&self, scope: &Scope) -> Result<(), ConfigError> {
        let mut result = Ok(());
        self.expr.visit(&mut |e| {
            if result.is_err() {
                return;
            }
            match e {
                Expr::Reference(Ident::Matrix(axis)) if !scope.axes.contains(axis) => {
                    result = Err(ConfigError::UnknownIdentifier {
                        scope: scope.label.clone(),
                        expr: self.source.clone(),
                        ident: format!("matrix.{}", axis),
                    });
                }
                Expr::Reference(Ident::NeedResult(job)) => {
                    if !scope.jobs.contains(job) {
                        result = Err(ConfigError::UnknownIdentifier {
                            scope: scope.label.clone(),
                            expr: self.source.clone(),
                            ident: format!("needs.{}.result", job),
                        });
                    } else if !scope.needs.contains(job) {
                        result = Err(ConfigError::UndeclaredNeed {
                            scope: scope.label.clone(),
                            job: job.clone(),
                        });
                    }
                }
                _ => {}
            }
        });
        result
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    True,
    False,
    Eq,
    Ne,
    And,
    Or,
    Not,
    Dot,
    Comma,
    LParen,
    RParen,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{}", s),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

struct LexError {
    message: String,
    position: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
        }
    }

    fn tokenize(&mut self) -> Result<Vec<(usize, Token)>, LexError> {
        let mut tokens = Vec::new();
        loop {
            while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
                self.chars.next();
            }
            let Some(&(pos, ch)) = self.chars.peek() else {
                tokens.push((usize::MAX, Token::Eof));
                return Ok(tokens);
            };
            let token = match ch {
                '(' => self.single(Token::LParen),
                ')' => self.single(Token::RParen),
                ',' => self.single(Token::Comma),
                '.' => self.single(Token::Dot),
                '=' => self.pair('=', Token::Eq, pos, "expected '=='")?,
                '&' => self.pair('&', Token::And, pos, "expected '&&'")?,
                '|' => self.pair('|', Token::Or, pos, "expected '||'")?,
                '!' => {
                    self.chars.next();
                    if matches!(self.chars.peek(), Some((_, '='))) {
                        self.chars.next();
                        Token::Ne
                    } else {
                        Token::Not
                    }
                }
                '\'' | '"' => self.string(ch, pos)?,
                c if c.is_ascii_alphabetic() || c == '_' => self.identifier(),
                c => {
                    return Err(LexError {
                        message: format!("unexpected character '{}'", c),
                        position: pos,
                    })
                }
            };
            tokens.push((pos, token));
        }
    }

    fn single(&mut self, token: Token) -> Token {
        self.chars.next();
        token
    }

    fn pair(&mut self, second: char, token: Token, pos: usize, msg: &str) -> Result<Token, LexError> {
        self.chars.next();
        match self.chars.next() {
            Some((_, c)) if c == second => Ok(token),
            _ => Err(LexError {
                message: msg.to_string(),
                position: pos,
            }),
        }
    }

    fn string(&mut self, quote: char, pos: usize) -> Result<Token, LexError> {
        self.chars.next();
        let mut value = String::new();
        while let Some((_, c)) = self.chars.next() {
            if c == quote {
                // '' escapes a single quote inside a single-quoted string
                if quote == '\'' && matches!(self.chars.peek(), Some((_, '\''))) {
                    self.chars.next();
                    value.push('\'');
                    continue;
                }
                return Ok(Token::Str(value));
            }
            value.push(c);
        }
        Err(LexError {
            message: "unterminated string literal".to_string(),
            position: pos,
        })
    }

    fn identifier(&mut self) -> Token {
        let mut ident = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                ident.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        match ident.as_str() {
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Ident(ident),
        }
    }
}

struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    source: &'a str,
    offset: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: String) -> ConfigError {
        let position = self.tokens[self.pos.min(self.tokens.len() - 1)].0;
        ConfigError::Syntax {
            expr: self.source.to_string(),
            position: position.saturating_add(self.offset).min(self.source.len()),
            message,
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ConfigError> {
        if self.peek() == &token {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected '{}', found '{}'", token, self.peek())))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConfigError> {
        let mut left = self.parse_and()?;
        while self.peek() == &Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConfigError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == &Token::And {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConfigError> {
        let left = self.parse_unary()?;
        let negated = match self.peek() {
            Token::Eq => false,
            Token::Ne => true,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(Expr::Comparison {
            negated,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, ConfigError> {
        if self.peek() == &Token::Not {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ConfigError> {
        match self.advance() {
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) if self.peek() == &Token::LParen => self.parse_call(name),
            Token::Ident(name) => self.parse_reference(name),
            other => Err(self.error(format!("unexpected token '{}'", other))),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, ConfigError> {
        let func = Predicate::lookup(&name).ok_or_else(|| ConfigError::UnknownFunction {
            scope: "expression".to_string(),
            expr: self.source.to_string(),
            name: name.clone(),
        })?;
        self.expect(Token::LParen)?;

        let mut args = Vec::new();
        if self.peek() != &Token::RParen {
            loop {
                args.push(self.parse_or()?);
                if self.peek() == &Token::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;

        if args.len() != func.arity() {
            return Err(ConfigError::Arity {
                name: func.name().to_string(),
                expected: func.arity(),
                got: args.len(),
            });
        }
        Ok(Expr::Predicate { func, args })
    }

    fn parse_reference(&mut self, first: String) -> Result<Expr, ConfigError> {
        let mut parts = vec![first];
        while self.peek() == &Token::Dot {
            self.advance();
            match self.advance() {
                Token::Ident(part) => parts.push(part),
                other => return Err(self.error(format!("expected property name, found '{}'", other))),
            }
        }

        let path: Vec<&str> = parts.iter().map(String::as_str).collect();
        let ident = match path.as_slice() {
            ["github", "event_name"] => Ident::EventName,
            ["github", "repository"] => Ident::Repository,
            ["github", "ref"] => Ident::Ref,
            ["github", "ref_name"] => Ident::RefName,
            ["github", "actor"] => Ident::Actor,
            ["github", "event", "pusher", "name"] => Ident::Pusher,
            ["runner", "os"] => Ident::RunnerOs,
            ["matrix", axis] => Ident::Matrix(axis.to_string()),
            ["needs", job, "result"] => Ident::NeedResult(job.to_string()),
            _ => {
                return Err(ConfigError::UnknownIdentifier {
                    scope: "expression".to_string(),
                    expr: self.source.to_string(),
                    ident: parts.join("."),
                })
            }
        };
        Ok(Expr::Reference(ident))
    }
}
