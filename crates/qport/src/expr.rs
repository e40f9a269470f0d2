//! Expressions compute a port value from the values of other ports.
//!
//! The grammar is deliberately small:
//!
//! ```text
//! expression := literal | reference | call
//! literal    := number | "true" | "false"
//! reference  := "$" [port id]
//! call       := NAME "(" [expression ("," expression)*] ")"
//! ```
//!
//! `$id` reads the value of the port `id`, while a bare `$` reads the value
//! being transformed (the input of a write or read transform). Evaluation
//! happens synchronously and yields [`UNDEFINED`] when any input needed by
//! the result is undefined.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::{Error, ErrorKind, Result};
use crate::port::{UNDEFINED, is_undefined};

// Maximum nesting level of function calls.
const MAX_DEPTH: usize = 32;

/// Values visible to an expression while it is evaluated.
pub trait Scope {
    /// Returns the value of the port with the given identifier, or
    /// [`UNDEFINED`] if the port does not exist, is disabled, or has no
    /// value.
    fn port_value(&self, id: &str) -> f64;

    /// Returns the value bound to a bare `$`.
    fn own_value(&self) -> f64;

    /// Returns the milliseconds elapsed since boot.
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    And,
    Or,
    Not,
    Xor,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Shl,
    Shr,
    If,
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    Abs,
    Sgn,
    Min,
    Max,
    Avg,
    Floor,
    Ceil,
    Round,
    Time,
    Available,
}

impl Function {
    // Name, function, minimum arguments, maximum arguments.
    const TABLE: &'static [(&'static str, Self, usize, Option<usize>)] = &[
        ("ADD", Self::Add, 2, None),
        ("SUB", Self::Sub, 2, Some(2)),
        ("MUL", Self::Mul, 2, None),
        ("DIV", Self::Div, 2, Some(2)),
        ("MOD", Self::Mod, 2, Some(2)),
        ("POW", Self::Pow, 2, Some(2)),
        ("AND", Self::And, 2, None),
        ("OR", Self::Or, 2, None),
        ("NOT", Self::Not, 1, Some(1)),
        ("XOR", Self::Xor, 2, Some(2)),
        ("BITAND", Self::BitAnd, 2, Some(2)),
        ("BITOR", Self::BitOr, 2, Some(2)),
        ("BITXOR", Self::BitXor, 2, Some(2)),
        ("BITNOT", Self::BitNot, 1, Some(1)),
        ("SHL", Self::Shl, 2, Some(2)),
        ("SHR", Self::Shr, 2, Some(2)),
        ("IF", Self::If, 3, Some(3)),
        ("EQ", Self::Eq, 2, Some(2)),
        ("GT", Self::Gt, 2, Some(2)),
        ("GTE", Self::Gte, 2, Some(2)),
        ("LT", Self::Lt, 2, Some(2)),
        ("LTE", Self::Lte, 2, Some(2)),
        ("ABS", Self::Abs, 1, Some(1)),
        ("SGN", Self::Sgn, 1, Some(1)),
        ("MIN", Self::Min, 1, None),
        ("MAX", Self::Max, 1, None),
        ("AVG", Self::Avg, 1, None),
        ("FLOOR", Self::Floor, 1, Some(1)),
        ("CEIL", Self::Ceil, 1, Some(1)),
        ("ROUND", Self::Round, 1, Some(1)),
        ("TIME", Self::Time, 0, Some(0)),
        ("AVAILABLE", Self::Available, 1, Some(1)),
    ];

    fn lookup(name: &str) -> Option<(Self, usize, Option<usize>)> {
        Self::TABLE
            .iter()
            .find(|(n, ..)| n.eq_ignore_ascii_case(name))
            .map(|(_, function, min, max)| (*function, *min, *max))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(f64),
    Own,
    Port(String),
    Call(Function, Box<[Node]>),
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl core::fmt::Display for Expression {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.source.fmt(f)
    }
}

impl Expression {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InvalidExpression`] on syntax errors, unknown
    /// functions, or wrong argument counts.
    pub fn parse(source: &str) -> Result<Self> {
        let mut parser = Parser {
            bytes: source.as_bytes(),
            pos: 0,
        };

        let root = parser.node(0)?;
        parser.skip_whitespace();
        if parser.pos != parser.bytes.len() {
            return Err(parser.error("unexpected trailing characters"));
        }

        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Returns the source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the identifiers of all ports read by the expression,
    /// without duplicates.
    #[must_use]
    pub fn port_refs(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        collect_refs(&self.root, &mut refs);
        refs
    }

    /// Returns whether the expression reads a bare `$`.
    #[must_use]
    pub fn uses_own_value(&self) -> bool {
        uses_own(&self.root)
    }

    /// Returns whether the expression reads the clock, and so changes
    /// without any port changing.
    #[must_use]
    pub fn uses_time(&self) -> bool {
        uses_time(&self.root)
    }

    /// Evaluates the expression.
    #[must_use]
    pub fn eval(&self, scope: &dyn Scope) -> f64 {
        eval(&self.root, scope)
    }
}

fn collect_refs<'a>(node: &'a Node, refs: &mut Vec<&'a str>) {
    match node {
        Node::Port(id) => {
            if !refs.contains(&id.as_str()) {
                refs.push(id);
            }
        }
        Node::Call(_, args) => args.iter().for_each(|arg| collect_refs(arg, refs)),
        Node::Literal(_) | Node::Own => {}
    }
}

fn uses_own(node: &Node) -> bool {
    match node {
        Node::Own => true,
        Node::Call(_, args) => args.iter().any(uses_own),
        Node::Literal(_) | Node::Port(_) => false,
    }
}

fn uses_time(node: &Node) -> bool {
    match node {
        Node::Call(Function::Time, _) => true,
        Node::Call(_, args) => args.iter().any(uses_time),
        Node::Literal(_) | Node::Own | Node::Port(_) => false,
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: &str) -> Error {
        Error::new(
            ErrorKind::InvalidExpression,
            format!("{reason} at position {}", self.pos),
        )
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn take_while(&mut self, accept: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&accept) {
            self.pos += 1;
        }
        // Only ASCII bytes are accepted, so the slice is valid UTF-8.
        core::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or_default()
    }

    fn node(&mut self, depth: usize) -> Result<Node> {
        if depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }

        self.skip_whitespace();
        match self.peek() {
            Some(b'$') => {
                self.pos += 1;
                let id = self.take_while(is_id_char);
                Ok(if id.is_empty() {
                    Node::Own
                } else {
                    Node::Port(id.to_string())
                })
            }
            Some(c) if c.is_ascii_digit() || c == b'-' || c == b'+' || c == b'.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.call(depth),
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn number(&mut self) -> Result<Node> {
        let start = self.pos;
        if matches!(self.peek(), Some(b'-' | b'+')) {
            self.pos += 1;
        }
        while let Some(c) = self.peek() {
            let exponent_sign = matches!(c, b'-' | b'+')
                && matches!(self.bytes.get(self.pos - 1), Some(b'e' | b'E'));
            if c.is_ascii_digit() || c == b'.' || c == b'e' || c == b'E' || exponent_sign {
                self.pos += 1;
            } else {
                break;
            }
        }

        core::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|text| text.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .map(Node::Literal)
            .ok_or_else(|| self.error("invalid number"))
    }

    fn call(&mut self, depth: usize) -> Result<Node> {
        let name = self.take_while(|c| c.is_ascii_alphanumeric() || c == b'_');

        if name.eq_ignore_ascii_case("true") {
            return Ok(Node::Literal(1.));
        }
        if name.eq_ignore_ascii_case("false") {
            return Ok(Node::Literal(0.));
        }

        let (function, min, max) = Function::lookup(&name)
            .ok_or_else(|| self.error(&format!("unknown function `{name}`")))?;

        self.skip_whitespace();
        if self.peek() != Some(b'(') {
            return Err(self.error("expected `(`"));
        }
        self.pos += 1;

        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(b')') {
            self.pos += 1;
        } else {
            loop {
                args.push(self.node(depth + 1)?);
                self.skip_whitespace();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("expected `,` or `)`")),
                }
            }
        }

        if args.len() < min || max.is_some_and(|max| args.len() > max) {
            return Err(self.error(&format!(
                "wrong number of arguments ({}) for `{name}`",
                args.len()
            )));
        }

        Ok(Node::Call(function, args.into_boxed_slice()))
    }
}

#[inline]
const fn is_id_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'-'
}

#[inline]
fn flag(value: bool) -> f64 {
    f64::from(u8::from(value))
}

#[inline]
fn truth(value: f64) -> f64 {
    flag(value != 0.)
}

// Folds all arguments, yielding `UNDEFINED` as soon as one is undefined.
fn fold(args: &[Node], scope: &dyn Scope, init: f64, op: impl Fn(f64, f64) -> f64) -> f64 {
    let mut acc = init;
    for arg in args {
        let value = eval(arg, scope);
        if is_undefined(value) {
            return UNDEFINED;
        }
        acc = op(acc, value);
    }
    acc
}

fn eval(node: &Node, scope: &dyn Scope) -> f64 {
    let (function, args) = match node {
        Node::Literal(value) => return *value,
        Node::Own => return scope.own_value(),
        Node::Port(id) => return scope.port_value(id),
        Node::Call(function, args) => (*function, &**args),
    };

    match function {
        Function::If => {
            let condition = eval(&args[0], scope);
            if is_undefined(condition) {
                UNDEFINED
            } else if condition != 0. {
                eval(&args[1], scope)
            } else {
                eval(&args[2], scope)
            }
        }
        Function::Available => flag(!is_undefined(eval(&args[0], scope))),
        Function::Time => (scope.now_ms() / 1000) as f64,
        Function::Add => fold(args, scope, 0., |a, b| a + b),
        Function::Mul => fold(args, scope, 1., |a, b| a * b),
        Function::And => fold(args, scope, 1., |a, b| truth(a * truth(b))),
        Function::Or => fold(args, scope, 0., |a, b| truth(a + truth(b))),
        Function::Min => fold(args, scope, f64::INFINITY, f64::min),
        Function::Max => fold(args, scope, f64::NEG_INFINITY, f64::max),
        Function::Avg => fold(args, scope, 0., |a, b| a + b) / args.len() as f64,
        _ => {
            let a = eval(&args[0], scope);
            let b = args.get(1).map_or(0., |arg| eval(arg, scope));
            if is_undefined(a) || is_undefined(b) {
                return UNDEFINED;
            }
            binary(function, a, b)
        }
    }
}

fn binary(function: Function, a: f64, b: f64) -> f64 {
    let (ia, ib) = (a as i64, b as i64);
    match function {
        Function::Sub => a - b,
        Function::Div if b == 0. => UNDEFINED,
        Function::Div => a / b,
        Function::Mod if b == 0. => UNDEFINED,
        Function::Mod => libm::fmod(a, b),
        Function::Pow => libm::pow(a, b),
        Function::Not => flag(a == 0.),
        Function::Xor => flag((a != 0.) ^ (b != 0.)),
        Function::BitAnd => (ia & ib) as f64,
        Function::BitOr => (ia | ib) as f64,
        Function::BitXor => (ia ^ ib) as f64,
        Function::BitNot => (!ia) as f64,
        Function::Shl => (ia << ib.clamp(0, 63)) as f64,
        Function::Shr => (ia >> ib.clamp(0, 63)) as f64,
        Function::Eq => flag(a == b),
        Function::Gt => flag(a > b),
        Function::Gte => flag(a >= b),
        Function::Lt => flag(a < b),
        Function::Lte => flag(a <= b),
        Function::Abs => libm::fabs(a),
        Function::Sgn if a > 0. => 1.,
        Function::Sgn if a < 0. => -1.,
        Function::Sgn => 0.,
        Function::Floor => libm::floor(a),
        Function::Ceil => libm::ceil(a),
        Function::Round => libm::round(a),
        // Variadic and lazy functions are handled by `eval`.
        Function::Add
        | Function::Mul
        | Function::And
        | Function::Or
        | Function::Min
        | Function::Max
        | Function::Avg
        | Function::If
        | Function::Time
        | Function::Available => UNDEFINED,
    }
}
