//! PostgreSQL server log entry parsing
//!
//! Expects the `log_line_prefix = '%p [%m] [%x] '` layout:
//!
//! ```text
//! 4711 [2024-03-01 10:00:00.123 UTC] [0] LOG:  execute <unnamed>: SELECT * FROM t WHERE id = $1
//! 4711 [2024-03-01 10:00:00.123 UTC] [0] DETAIL:  parameters: $1 = '42'
//! ```
//!
//! Every `$<n>` marker outside a quoted literal is rewritten to the canonical
//! `?` marker so that statements captured from different drivers compare equal.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::constants::{PARAMETER_DETAIL_MARKER, PLACEHOLDER_MARKER};
use crate::error::{ReplayError, Result};

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)^(\d+) \[([^\]]*)\] \[([^\]]*)\] (.*)$").expect("valid log line regex")
    })
}

fn phase_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)^[A-Z]+:\s+(?:duration: [0-9.]+ ms\s+)?(parse|bind|execute)\s[^:]*:\s?(.*)$")
            .expect("valid phase regex")
    })
}

fn other_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)^[A-Z]+:\s+(?:duration: [0-9.]+ ms\s*)?(?:statement:\s)?(.*)$")
            .expect("valid statement regex")
    })
}

/// Operation kind of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Parse,
    Bind,
    Execute,
    ParameterDetail,
    Other,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Parse => "parse",
            OpKind::Bind => "bind",
            OpKind::Execute => "execute",
            OpKind::ParameterDetail => "parameters",
            OpKind::Other => "other",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "parse" => Ok(OpKind::Parse),
            "bind" => Ok(OpKind::Bind),
            "execute" => Ok(OpKind::Execute),
            "parameters" => Ok(OpKind::ParameterDetail),
            "other" => Ok(OpKind::Other),
            _ => Err(format!("unknown entry kind: {}", s)),
        }
    }
}

/// One server log record. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub conn_id: u64,
    /// Opaque to this crate; kept for audit output only
    pub timestamp: String,
    pub tx_id: u64,
    pub kind: OpKind,
    /// Statement text with placeholders rewritten to `?`
    pub text: String,
    is_parameterized: bool,
}

impl LogEntry {
    pub fn new(conn_id: u64, timestamp: String, tx_id: u64, kind: OpKind, text: String) -> Self {
        let is_parameterized = count_placeholders(&text) > 0;
        Self {
            conn_id,
            timestamp,
            tx_id,
            kind,
            text,
            is_parameterized,
        }
    }

    /// True iff the normalized text contains a canonical placeholder
    pub fn is_parameterized(&self) -> bool {
        self.is_parameterized
    }
}

/// Parse one logical log line.
///
/// `line_no` is only used for error reporting. Embedded newlines in the
/// statement text (continuation lines already joined) are preserved.
pub fn parse_log_line(line_no: usize, line: &str) -> Result<LogEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let caps = line_regex()
        .captures(line)
        .ok_or_else(|| ReplayError::malformed(line_no, "expected `<conn> [<ts>] [<tx>] <tag>: <text>`", line))?;

    let conn_id = caps[1]
        .parse::<u64>()
        .map_err(|e| ReplayError::malformed(line_no, format!("bad connection id: {}", e), line))?;
    let timestamp = caps[2].to_string();
    let tx_id = caps[3]
        .trim()
        .parse::<u64>()
        .map_err(|e| ReplayError::malformed(line_no, format!("bad transaction id: {}", e), line))?;

    let (kind, raw_text) = classify(&caps[4]);
    let text = normalize_placeholders(raw_text.trim());

    Ok(LogEntry::new(conn_id, timestamp, tx_id, kind, text))
}

/// Split the tag/text remainder of a line into an operation kind and its text
fn classify(rest: &str) -> (OpKind, &str) {
    if let Some(caps) = phase_regex().captures(rest) {
        let kind = match caps.get(1).map(|m| m.as_str()) {
            Some("parse") => OpKind::Parse,
            Some("bind") => OpKind::Bind,
            _ => OpKind::Execute,
        };
        let text = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        return (kind, text);
    }
    if let Some(pos) = rest.find(PARAMETER_DETAIL_MARKER) {
        return (OpKind::ParameterDetail, &rest[pos + PARAMETER_DETAIL_MARKER.len()..]);
    }
    match other_regex().captures(rest).and_then(|c| c.get(1)) {
        Some(m) => (OpKind::Other, m.as_str()),
        None => (OpKind::Other, rest),
    }
}

/// Rewrite every `$<digits>` outside quoted literals/identifiers to the canonical marker
pub fn normalize_placeholders(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == '$' && chars.peek().is_some_and(|d| d.is_ascii_digit()) => {
                while chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                    chars.next();
                }
                out.push(PLACEHOLDER_MARKER);
                continue;
            }
            None => {}
        }
        out.push(c);
    }
    out
}

/// Byte offsets of canonical markers that sit outside quoted literals/identifiers
pub fn placeholder_positions(text: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut quote: Option<char> = None;
    for (i, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == PLACEHOLDER_MARKER => positions.push(i),
            None => {}
        }
    }
    positions
}

pub fn count_placeholders(text: &str) -> usize {
    placeholder_positions(text).len()
}

/// Render canonical markers back to PostgreSQL's positional `$1..$n` form
pub fn to_positional(text: &str) -> String {
    let positions = placeholder_positions(text);
    let mut out = String::with_capacity(text.len() + positions.len() * 2);
    let mut last = 0;
    for (n, pos) in positions.iter().enumerate() {
        out.push_str(&text[last..*pos]);
        out.push('$');
        out.push_str(&(n + 1).to_string());
        last = pos + PLACEHOLDER_MARKER.len_utf8();
    }
    out.push_str(&text[last..]);
    out
}

/// True when a physical line starts a new `<digits> [` record
pub fn starts_entry(line: &str) -> bool {
    let digits = line.bytes().take_while(|b| b.is_ascii_digit()).count();
    digits > 0 && line[digits..].starts_with(" [")
}

/// One logical log line with the physical lines it was assembled from
#[derive(Debug, Clone)]
pub struct LogicalLine {
    /// 1-based number of the first physical line
    pub line_no: usize,
    pub text: String,
    pub raw: Vec<String>,
}

/// Joins continuation lines onto the entry that precedes them.
///
/// With joining disabled every physical line is yielded on its own.
pub struct LogicalLines<I: Iterator> {
    lines: std::iter::Peekable<std::iter::Enumerate<I>>,
    join_continuations: bool,
}

impl<I> LogicalLines<I>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    pub fn new(lines: I, join_continuations: bool) -> Self {
        Self {
            lines: lines.enumerate().peekable(),
            join_continuations,
        }
    }
}

impl<I> Iterator for LogicalLines<I>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    type Item = std::io::Result<LogicalLine>;

    fn next(&mut self) -> Option<Self::Item> {
        let (idx, first) = self.lines.next()?;
        let first = match first {
            Ok(l) => l,
            Err(e) => return Some(Err(e)),
        };
        let mut logical = LogicalLine {
            line_no: idx + 1,
            text: first.clone(),
            raw: vec![first],
        };
        if !self.join_continuations {
            return Some(Ok(logical));
        }

        while let Some((_, Ok(next))) = self.lines.peek() {
            if starts_entry(next) {
                break;
            }
            let next = next.clone();
            self.lines.next();
            logical.text.push('\n');
            logical.text.push_str(&next);
            logical.raw.push(next);
        }
        Some(Ok(logical))
    }
}
