//! Literal-only deserializer for caller-supplied query fragments.
//!
//! Filters, projections, positions, and the arguments of a general-search
//! call arrive as text written in Python literal syntax (the form the
//! marshal's users have always typed) or as plain JSON. This module accepts
//! exactly the literal subset of that syntax and nothing else:
//!
//! | Syntax | Result |
//! |--------|--------|
//! | `'text'`, `"text"` | [`Literal::Str`] |
//! | `1`, `-2`, `3.5`, `1e-3` | [`Literal::Int`] / [`Literal::Float`] |
//! | `True`, `False`, `true`, `false` | [`Literal::Bool`] |
//! | `None`, `null` | [`Literal::None`] |
//! | `[a, b]` | [`Literal::List`] |
//! | `(a, b)`, `(a,)` | [`Literal::Tuple`] |
//! | `{k: v}` | [`Literal::Dict`] |
//!
//! Identifiers, calls, attribute access, operators, and comprehensions are
//! rejected with a [`LiteralError`]. There is no expression fallback.
//!
//! # Example
//!
//! ```rust
//! use skyquery_core::literal::{parse_literal, Literal};
//!
//! let parsed = parse_literal("[(10.0, 20.0), ('10:00:00', '+20:00:00')]").unwrap();
//! assert!(matches!(parsed, Literal::List(ref items) if items.len() == 2));
//! assert!(parse_literal("__import__('os')").is_err());
//! ```

use std::fmt;

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Maximum nesting depth accepted by the parser.
pub const MAX_DEPTH: usize = 64;

/// A parsed literal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Literal>),
    Tuple(Vec<Literal>),
    Dict(Vec<(Literal, Literal)>),
}

/// Error raised for anything outside the literal subset.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid literal at offset {offset}: {message}")]
pub struct LiteralError {
    pub offset: usize,
    pub message: String,
}

/// Parse a complete literal. Trailing input other than whitespace is an error.
pub fn parse_literal(src: &str) -> Result<Literal, LiteralError> {
    let mut scanner = Scanner::new(src);
    let value = scanner.literal()?;
    scanner.skip_ws();
    if !scanner.at_end() {
        return Err(scanner.error("unexpected trailing input"));
    }
    Ok(value)
}

/// Parse a literal that must be a mapping and convert it to a JSON object.
pub fn parse_document(src: &str) -> Result<Map<String, Value>, LiteralError> {
    match parse_literal(src.trim())?.to_json() {
        Value::Object(map) => Ok(map),
        _ => Err(LiteralError {
            offset: 0,
            message: "expected a mapping".to_string(),
        }),
    }
}

impl Literal {
    /// Short type name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Items of a list or tuple.
    pub fn as_sequence(&self) -> Option<&[Literal]> {
        match self {
            Self::List(items) | Self::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Convert to JSON. Tuples become arrays; non-string mapping keys are
    /// rendered with [`Literal::to_display_string`].
    pub fn to_json(&self) -> Value {
        match self {
            Self::None => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::Number((*i).into()),
            Self::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::Str(s) => Value::String(s.clone()),
            Self::List(items) | Self::Tuple(items) => {
                Value::Array(items.iter().map(Literal::to_json).collect())
            }
            Self::Dict(entries) => {
                let mut map = Map::new();
                for (k, v) in entries {
                    map.insert(k.to_display_string(), v.to_json());
                }
                Value::Object(map)
            }
        }
    }

    /// Build a literal from structured JSON input.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::None,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Str(s.clone()),
            Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Dict(
                map.iter()
                    .map(|(k, v)| (Self::Str(k.clone()), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Python `str()` of the value: strings render bare, everything else
    /// uses the repr form produced by [`fmt::Display`].
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Literal {
    /// Python `repr()` of the value.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => f.write_str(&float_repr(*x)),
            Self::Str(s) => f.write_str(&string_repr(s)),
            Self::List(items) => {
                f.write_str("[")?;
                write_items(f, items)?;
                f.write_str("]")
            }
            Self::Tuple(items) => {
                f.write_str("(")?;
                write_items(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Self::Dict(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[Literal]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// Shortest round-trip float formatting in Python's layout
/// (`10.0`, `0.001`, `1e-05`, `1e+16`).
fn float_repr(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let abs = x.abs();
    if abs == 0.0 || (1e-4..1e16).contains(&abs) {
        let plain = format!("{x}");
        if plain.contains('.') {
            plain
        } else {
            format!("{plain}.0")
        }
    } else {
        let sci = format!("{x:e}");
        match sci.split_once('e') {
            Some((mantissa, exp)) => {
                let (sign, digits) = match exp.strip_prefix('-') {
                    Some(d) => ('-', d),
                    None => ('+', exp),
                };
                format!("{mantissa}e{sign}{digits:0>2}")
            }
            None => sci,
        }
    }
}

fn string_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Character cursor shared by the literal parser and the general-search
/// call parser.
pub(crate) struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    pub(crate) fn offset(&self) -> usize {
        self.pos
    }

    pub(crate) fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    pub(crate) fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    pub(crate) fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    pub(crate) fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    /// Consume `expected` after optional whitespace.
    pub(crate) fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, expected: char) -> Result<(), LiteralError> {
        if self.eat(expected) {
            Ok(())
        } else {
            match self.peek() {
                Some(found) => Err(self.error(format!("expected `{expected}`, found `{found}`"))),
                None => Err(self.error(format!("expected `{expected}`, found end of input"))),
            }
        }
    }

    pub(crate) fn error(&self, message: impl Into<String>) -> LiteralError {
        LiteralError {
            offset: self.pos,
            message: message.into(),
        }
    }

    /// Read an identifier (`[A-Za-z_][A-Za-z0-9_]*`) after optional whitespace.
    pub(crate) fn identifier(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return None,
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.bump();
        }
        Some(&self.src[start..self.pos])
    }

    /// Look ahead for `name =` (but not `==`) without consuming anything.
    pub(crate) fn peek_keyword_argument(&self) -> Option<&'a str> {
        let mut ahead = Scanner {
            src: self.src,
            pos: self.pos,
        };
        let name = ahead.identifier()?;
        ahead.skip_ws();
        if ahead.bump() != Some('=') || ahead.peek() == Some('=') {
            return None;
        }
        Some(name)
    }

    pub(crate) fn literal(&mut self) -> Result<Literal, LiteralError> {
        self.literal_at(0)
    }

    fn literal_at(&mut self, depth: usize) -> Result<Literal, LiteralError> {
        if depth > MAX_DEPTH {
            return Err(self.error("literal nested too deeply"));
        }
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some(q @ ('\'' | '"')) => {
                self.bump();
                self.string(q).map(Literal::Str)
            }
            Some('[') => {
                self.bump();
                self.sequence(']', depth).map(Literal::List)
            }
            Some('(') => {
                self.bump();
                self.tuple(depth)
            }
            Some('{') => {
                self.bump();
                self.dict(depth)
            }
            Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.') => self.number(),
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let start = self.pos;
                match self.identifier() {
                    Some("True" | "true") => Ok(Literal::Bool(true)),
                    Some("False" | "false") => Ok(Literal::Bool(false)),
                    Some("None" | "null") => Ok(Literal::None),
                    Some(other) => Err(LiteralError {
                        offset: start,
                        message: format!("expressions are not allowed: `{other}`"),
                    }),
                    None => Err(self.error("expected a literal")),
                }
            }
            Some(c) => Err(self.error(format!("unexpected character `{c}`"))),
        }
    }

    fn sequence(&mut self, close: char, depth: usize) -> Result<Vec<Literal>, LiteralError> {
        let mut items = Vec::new();
        loop {
            if self.eat(close) {
                return Ok(items);
            }
            items.push(self.literal_at(depth + 1)?);
            if self.eat(',') {
                continue;
            }
            self.expect(close)?;
            return Ok(items);
        }
    }

    fn tuple(&mut self, depth: usize) -> Result<Literal, LiteralError> {
        if self.eat(')') {
            return Ok(Literal::Tuple(Vec::new()));
        }
        let first = self.literal_at(depth + 1)?;
        if self.eat(')') {
            // Parenthesized expression, not a tuple.
            return Ok(first);
        }
        self.expect(',')?;
        let mut items = vec![first];
        items.extend(self.sequence(')', depth)?);
        Ok(Literal::Tuple(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Literal, LiteralError> {
        let mut entries = Vec::new();
        loop {
            if self.eat('}') {
                return Ok(Literal::Dict(entries));
            }
            let key_offset = self.offset();
            let key = self.literal_at(depth + 1)?;
            if matches!(key, Literal::List(_) | Literal::Dict(_)) {
                return Err(LiteralError {
                    offset: key_offset,
                    message: format!("unhashable mapping key of type {}", key.kind()),
                });
            }
            self.skip_ws();
            if matches!(self.peek(), Some(',' | '}')) {
                return Err(self.error("set literals are not supported"));
            }
            self.expect(':')?;
            let value = self.literal_at(depth + 1)?;
            entries.push((key, value));
            if self.eat(',') {
                continue;
            }
            self.expect('}')?;
            return Ok(Literal::Dict(entries));
        }
    }

    fn string(&mut self, quote: char) -> Result<String, LiteralError> {
        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("unterminated string"));
            };
            if c == quote {
                return Ok(out);
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let Some(escaped) = self.bump() else {
                return Err(self.error("unterminated string"));
            };
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                'b' => out.push('\u{8}'),
                'f' => out.push('\u{c}'),
                '\\' | '\'' | '"' | '/' => out.push(escaped),
                '\n' => {}
                'x' => out.push(self.hex_escape(2)?),
                'u' => out.push(self.hex_escape(4)?),
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
        }
    }

    fn hex_escape(&mut self, len: usize) -> Result<char, LiteralError> {
        let start = self.pos;
        let end = start + len;
        let digits = self
            .src
            .get(start..end)
            .ok_or_else(|| self.error("truncated escape sequence"))?;
        let code = u32::from_str_radix(digits, 16)
            .map_err(|_| self.error(format!("invalid escape digits `{digits}`")))?;
        self.pos = end;
        char::from_u32(code).ok_or_else(|| self.error(format!("invalid code point {code:#x}")))
    }

    fn number(&mut self) -> Result<Literal, LiteralError> {
        let start = self.pos;
        if matches!(self.peek(), Some('-' | '+')) {
            self.bump();
        }
        let mut digits = 0usize;
        let mut is_float = false;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
            digits += 1;
        }
        if self.peek() == Some('.') {
            is_float = true;
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
                digits += 1;
            }
        }
        if digits == 0 {
            return Err(LiteralError {
                offset: start,
                message: "expected a number".to_string(),
            });
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            is_float = true;
            self.bump();
            if matches!(self.peek(), Some('-' | '+')) {
                self.bump();
            }
            let exp_start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
            if self.pos == exp_start {
                return Err(self.error("missing exponent digits"));
            }
        }
        if matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            return Err(self.error("malformed number"));
        }
        let text = &self.src[start..self.pos];
        if !is_float {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Literal::Int(i));
            }
        }
        text.parse::<f64>()
            .map(Literal::Float)
            .map_err(|_| LiteralError {
                offset: start,
                message: format!("malformed number `{text}`"),
            })
    }
}
