//! Wire codec for the SpecsLab Prodigy "Remote In" protocol (v1.x)
//!
//! The protocol is ASCII and newline-delimited. Requests carry a 4-hex-digit
//! ID so replies can be correlated:
//!
//! ```text
//! ?0A1F DefineSpectrumFAT StartEnergy:400 EndEnergy:410 StepWidth:0.5
//! !0A1F OK: Samples:21 ValuesPerSample:1
//! !0A1F Error: 203 "Spectrum not validated."
//! ```
//!
//! The grammar is small and unambiguous, so parsing is a hand-written
//! tokenizer (prefix char, ID, status, key:value pairs) rather than a pile
//! of regexes.

use std::fmt;
use thiserror::Error;

/// Codec errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Reply line does not match the grammar
    #[error("malformed reply line: {line:?}")]
    Framing { line: String },

    /// Server replied with the Error form
    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },
}

/// Error-code class, taken from the high part of the server's numeric code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection-state errors (1-99, e.g. 2 "already connected")
    Connection,
    /// Command errors (100-199, e.g. 101 "unknown command")
    Command,
    /// Spectrum and acquisition errors (200-299)
    Acquisition,
    /// Analyzer-parameter errors (300-399)
    Parameter,
    /// Anything outside the documented ranges
    Unknown,
}

impl ErrorClass {
    /// Classify a server error code
    pub fn of(code: u16) -> Self {
        match code {
            1..=99 => ErrorClass::Connection,
            100..=199 => ErrorClass::Command,
            200..=299 => ErrorClass::Acquisition,
            300..=399 => ErrorClass::Parameter,
            _ => ErrorClass::Unknown,
        }
    }
}

impl ProtocolError {
    /// Error class of a `Server` error; `Unknown` for framing errors
    pub fn class(&self) -> ErrorClass {
        match self {
            ProtocolError::Server { code, .. } => ErrorClass::of(*code),
            ProtocolError::Framing { .. } => ErrorClass::Unknown,
        }
    }
}

/// Argument value in a request
///
/// Numbers are written in decimal; `Double` uses Rust's shortest round-trip
/// formatting. `Token` is for bare enum words and `Quoted` for strings that
/// must survive spaces and quotes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Double(f64),
    Bool(bool),
    Token(String),
    Quoted(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Token(v) => write!(f, "{}", v),
            Value::Quoted(v) => write!(f, "{}", quote(v)),
        }
    }
}

/// A single request, owned until its reply arrives
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u16,
    pub command: String,
    pub args: Vec<(String, Value)>,
}

impl Request {
    /// Create a request with no arguments
    pub fn new(id: u16, command: impl Into<String>) -> Self {
        Self {
            id,
            command: command.into(),
            args: Vec::new(),
        }
    }

    /// Append a `Key:Value` argument (emitted in insertion order)
    pub fn arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.push((key.into(), value));
        self
    }

    /// Format the wire line, without the trailing LF
    pub fn format(&self) -> String {
        let mut line = format!("?{:04X} {}", self.id, self.command);
        for (key, value) in &self.args {
            line.push(' ');
            line.push_str(key);
            line.push(':');
            line.push_str(&value.to_string());
        }
        line
    }
}

/// Body of a parsed reply
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    /// `OK` with zero or more outcome fields, order preserved
    Ok(Vec<(String, String)>),
    /// `Error: <code> "<message>"`
    Error { code: u16, message: String },
}

/// A parsed reply line
#[derive(Debug, Clone)]
pub struct Reply {
    pub id: u16,
    pub body: ReplyBody,
}

impl Reply {
    /// Look up an outcome field by exact key; `None` for error replies
    pub fn get(&self, key: &str) -> Option<&str> {
        match &self.body {
            ReplyBody::Ok(fields) => fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            ReplyBody::Error { .. } => None,
        }
    }
}

/// Quote a string for the wire: wrap in double quotes, escape `"` and `\`
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Undo `quote`: strip surrounding quotes and unescape
///
/// A value without surrounding quotes is returned unchanged.
pub fn unquote(s: &str) -> String {
    let inner = match s.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(inner) => inner,
        None => return s.to_string(),
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split a payload into `Key:Value` tokens, keeping quoted strings and
/// bracketed arrays intact
fn split_fields(s: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let bytes = s.as_bytes();
    let mut start = None;
    let mut in_quote = false;
    let mut escaped = false;
    let mut bracket_depth = 0usize;

    for (i, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_quote => escaped = true,
            b'"' if bracket_depth == 0 => in_quote = !in_quote,
            b'[' if !in_quote => bracket_depth += 1,
            b']' if !in_quote => bracket_depth = bracket_depth.saturating_sub(1),
            b' ' if !in_quote && bracket_depth == 0 => {
                if let Some(s0) = start.take() {
                    tokens.push(&s[s0..i]);
                }
                continue;
            }
            _ => {}
        }
        if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s0) = start {
        tokens.push(&s[s0..]);
    }
    tokens
}

/// Parse one reply line (without the trailing LF)
///
/// Only framing problems are reported as `Err`; the server's `Error` form is
/// a successfully parsed reply, so the caller can still check its ID before
/// deciding whether the error belongs to the current request.
pub fn parse_reply(line: &str) -> Result<Reply, ProtocolError> {
    let framing = || ProtocolError::Framing {
        line: line.to_string(),
    };

    let rest = line.strip_prefix('!').ok_or_else(framing)?;
    if rest.len() < 5 || !rest.is_char_boundary(4) {
        return Err(framing());
    }
    let (id_str, rest) = rest.split_at(4);
    let id = u16::from_str_radix(id_str, 16).map_err(|_| framing())?;
    let rest = rest.strip_prefix(' ').ok_or_else(framing)?;

    if let Some(payload) = rest.strip_prefix("OK") {
        let fields = match payload.strip_prefix(':') {
            Some(p) => parse_outcome_fields(p),
            None if payload.trim().is_empty() => Vec::new(),
            None => return Err(framing()),
        };
        return Ok(Reply {
            id,
            body: ReplyBody::Ok(fields),
        });
    }

    if let Some(payload) = rest.strip_prefix("Error:") {
        let payload = payload.trim_start();
        let (code_str, message_raw) = match payload.split_once(' ') {
            Some((c, m)) => (c, m.trim()),
            None => (payload, ""),
        };
        let code: u16 = code_str.parse().map_err(|_| framing())?;
        return Ok(Reply {
            id,
            body: ReplyBody::Error {
                code,
                message: unquote(message_raw),
            },
        });
    }

    Err(framing())
}

fn parse_outcome_fields(payload: &str) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    for token in split_fields(payload.trim()) {
        let Some((key, raw)) = token.split_once(':') else {
            continue;
        };
        let value = if raw.starts_with('"') {
            unquote(raw)
        } else {
            raw.to_string()
        };
        fields.push((key.to_string(), value));
    }
    fields
}

/// Parse an array value `[d1,d2,...,dK]` into doubles
///
/// Malformed elements are skipped; the caller compares the returned count
/// against what it asked for. A value without brackets is a framing error.
pub fn parse_double_array(raw: &str) -> Result<Vec<f64>, ProtocolError> {
    let inner = raw
        .trim()
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .ok_or_else(|| ProtocolError::Framing {
            line: raw.to_string(),
        })?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(inner
        .split(',')
        .filter_map(|tok| tok.trim().parse::<f64>().ok())
        .collect())
}

/// Parse an array of (optionally quoted) strings `["a","b c",d]`
pub fn parse_string_array(raw: &str) -> Result<Vec<String>, ProtocolError> {
    let inner = raw
        .trim()
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .ok_or_else(|| ProtocolError::Framing {
            line: raw.to_string(),
        })?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    // split on commas outside quotes
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quote => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quote = !in_quote;
                current.push(c);
            }
            ',' if !in_quote => {
                items.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    items.push(current);
    Ok(items
        .into_iter()
        .map(|item| unquote(item.trim()))
        .filter(|item| !item.is_empty())
        .collect())
}

/// Parse a comma-separated token list (used by `GetSpectrumParameterInfo`
/// `Values` replies, which come without brackets)
pub fn parse_value_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|tok| unquote(tok.trim()))
        .filter(|tok| !tok.is_empty())
        .collect()
}
