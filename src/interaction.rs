//! Replayable statements ("interactions") and their on-disk format
//!
//! An interaction file holds one connection's statements in replay order,
//! four lines per statement:
//!
//! ```text
//! 1                                   <- prepared flag (1/0)
//! UPDATE accounts SET balance = ? WHERE id = ?
//! 1700|23                             <- '|'-joined type OIDs, 0 = unresolved
//! 12.50|42                            <- '|'-joined values, bare `null` = SQL NULL
//! ```
//!
//! Text fields escape `\`, newlines and `|`. A literal value `null` is written
//! `\null` and an empty string `\e`, so empty lists stay empty lines.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants::{
    INTERACTIONS_EXTENSION, LINES_PER_STATEMENT, LIST_SEPARATOR, NULL_SENTINEL, PLACEHOLDER_MARKER,
};
use crate::error::ReplayError;
use crate::log_entry::{count_placeholders, LogEntry, OpKind};
use crate::process_stream::ProcessStream;

/// One statement ready for replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayableStatement {
    pub prepared: bool,
    /// Statement text with canonical `?` placeholders
    pub sql: String,
    /// Resolved type OIDs per placeholder; may be shorter than the placeholder list
    pub types: Vec<u32>,
    /// Captured values; `None` is SQL NULL
    pub params: Vec<Option<String>>,
}

impl ReplayableStatement {
    pub fn simple(sql: impl Into<String>) -> Self {
        Self {
            prepared: false,
            sql: sql.into(),
            types: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn from_entry(entry: &LogEntry) -> Self {
        Self {
            prepared: entry.is_parameterized(),
            sql: entry.text.clone(),
            types: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn placeholder_count(&self) -> usize {
        count_placeholders(&self.sql)
    }

    pub fn tx_control(&self) -> Option<TxControl> {
        TxControl::classify(&self.sql)
    }
}

/// Transaction boundary statements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxControl {
    Begin,
    Commit,
    Rollback,
}

impl TxControl {
    /// Classify by case-insensitive leading keyword.
    ///
    /// `ROLLBACK TO [SAVEPOINT]` stays inside the transaction and is not a boundary.
    pub fn classify(sql: &str) -> Option<TxControl> {
        let upper = sql.trim_start().to_ascii_uppercase();
        let mut words = upper
            .split(|c: char| c.is_whitespace() || c == ';')
            .filter(|w| !w.is_empty());
        match words.next()? {
            "BEGIN" => Some(TxControl::Begin),
            "START" if words.next() == Some("TRANSACTION") => Some(TxControl::Begin),
            "COMMIT" | "END" => Some(TxControl::Commit),
            "ROLLBACK" | "ABORT" => match words.next() {
                Some("TO") => None,
                _ => Some(TxControl::Rollback),
            },
            _ => None,
        }
    }
}

/// Fold a connection's entries into replayable statements.
///
/// `execute` entries become statements; a `parameter-detail` entry directly
/// after an `execute` supplies its values and is consumed. Simple-protocol
/// transaction boundaries (`statement: BEGIN` etc.) are kept as well; every
/// other entry is skipped.
pub fn extract_statements(entries: &[LogEntry]) -> Vec<ReplayableStatement> {
    let mut statements = Vec::new();
    let mut i = 0;

    while i < entries.len() {
        let entry = &entries[i];
        match entry.kind {
            OpKind::Execute => {
                let mut stmt = ReplayableStatement::from_entry(entry);
                if let Some(next) = entries.get(i + 1) {
                    if next.kind == OpKind::ParameterDetail {
                        stmt.params = parse_parameter_values(&next.text);
                        i += 1;
                    }
                }
                statements.push(stmt);
            }
            OpKind::Other if TxControl::classify(&entry.text).is_some() => {
                statements.push(ReplayableStatement::simple(entry.text.clone()));
            }
            _ => {}
        }
        i += 1;
    }
    statements
}

/// Extract statements from a reconstructed stream
pub fn extract_stream(stream: &ProcessStream) -> Vec<ReplayableStatement> {
    let statements = extract_statements(&stream.entries);
    debug!(
        "Connection {}: {} entries -> {} statements",
        stream.conn_id,
        stream.len(),
        statements.len()
    );
    statements
}

/// Split a normalized parameter-detail text (`? = 'a', ? = NULL`) into values.
///
/// Each token runs from one marker to the next (markers inside quotes do not
/// split). The value is the text between the token's first and last quote,
/// with `''` unescaped; a token without a quote pair is NULL.
pub fn parse_parameter_values(text: &str) -> Vec<Option<String>> {
    let mut tokens: Vec<&str> = Vec::new();
    let mut start: Option<usize> = None;
    let mut in_quote = false;

    for (i, c) in text.char_indices() {
        if c == '\'' {
            in_quote = !in_quote;
        } else if c == PLACEHOLDER_MARKER && !in_quote {
            if let Some(s) = start {
                tokens.push(&text[s..i]);
            }
            start = Some(i + c.len_utf8());
        }
    }
    if let Some(s) = start {
        tokens.push(&text[s..]);
    }

    tokens.into_iter().map(quoted_value).collect()
}

fn quoted_value(token: &str) -> Option<String> {
    let first = token.find('\'')?;
    let last = token.rfind('\'')?;
    if last <= first {
        return None;
    }
    Some(token[first + 1..last].replace("''", "'"))
}

/// Drop the first `n` statements of a connection without splitting a transaction.
///
/// If the n-th dropped statement leaves a transaction open, dropping continues
/// up to and including the statement that commits or rolls it back.
pub fn skip_leading(statements: Vec<ReplayableStatement>, n: usize) -> Vec<ReplayableStatement> {
    if n == 0 {
        return statements;
    }
    let mut open = false;
    let mut cut = statements.len();
    for (idx, stmt) in statements.iter().enumerate() {
        match stmt.tx_control() {
            Some(TxControl::Begin) => open = true,
            Some(TxControl::Commit) | Some(TxControl::Rollback) => open = false,
            None => {}
        }
        if idx + 1 >= n && !open {
            cut = idx + 1;
            break;
        }
    }
    statements.into_iter().skip(cut).collect()
}

// -----------------------------------------------------------------------------
// Interaction file codec
// -----------------------------------------------------------------------------

pub fn interactions_path(dir: &Path, conn_id: u64) -> PathBuf {
    dir.join(format!("{}.{}", conn_id, INTERACTIONS_EXTENSION))
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            LIST_SEPARATOR => {
                out.push('\\');
                out.push(LIST_SEPARATOR);
            }
            _ => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(LIST_SEPARATOR) => out.push(LIST_SEPARATOR),
            other => return Err(format!("bad escape sequence \\{:?}", other)),
        }
    }
    Ok(out)
}

fn encode_value(value: &Option<String>) -> String {
    match value {
        None => NULL_SENTINEL.to_string(),
        Some(v) if v == NULL_SENTINEL => format!("\\{}", NULL_SENTINEL),
        Some(v) if v.is_empty() => "\\e".to_string(),
        Some(v) => escape(v),
    }
}

fn decode_value(token: &str) -> std::result::Result<Option<String>, String> {
    match token {
        NULL_SENTINEL => Ok(None),
        "\\null" => Ok(Some(NULL_SENTINEL.to_string())),
        "\\e" => Ok(Some(String::new())),
        _ => unescape(token).map(Some),
    }
}

/// Split on separators that are not escaped
fn split_list(line: &str) -> Vec<&str> {
    if line.is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == LIST_SEPARATOR {
            parts.push(&line[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&line[start..]);
    parts
}

/// Render statements in the interaction file format
pub fn encode_interactions(statements: &[ReplayableStatement]) -> String {
    let mut out = String::new();
    let sep = LIST_SEPARATOR.to_string();
    for stmt in statements {
        out.push_str(if stmt.prepared { "1" } else { "0" });
        out.push('\n');
        out.push_str(&escape(&stmt.sql));
        out.push('\n');
        let types: Vec<String> = stmt.types.iter().map(|t| t.to_string()).collect();
        out.push_str(&types.join(&sep));
        out.push('\n');
        let values: Vec<String> = stmt.params.iter().map(encode_value).collect();
        out.push_str(&values.join(&sep));
        out.push('\n');
    }
    out
}

/// Parse the interaction file format; `origin` names the source in errors
pub fn decode_interactions(content: &str, origin: &str) -> std::result::Result<Vec<ReplayableStatement>, ReplayError> {
    let bad = |line: usize, reason: String| ReplayError::InteractionFormat {
        path: origin.to_string(),
        reason: format!("line {}: {}", line, reason),
    };

    let lines: Vec<&str> = content.lines().collect();
    if lines.len() % LINES_PER_STATEMENT != 0 {
        return Err(bad(
            lines.len(),
            format!("{} lines is not a multiple of {}", lines.len(), LINES_PER_STATEMENT),
        ));
    }

    let mut statements = Vec::with_capacity(lines.len() / LINES_PER_STATEMENT);
    for (idx, group) in lines.chunks(LINES_PER_STATEMENT).enumerate() {
        let base = idx * LINES_PER_STATEMENT + 1;
        let prepared = match group[0] {
            "1" => true,
            "0" => false,
            other => return Err(bad(base, format!("prepared flag must be 0 or 1, got {:?}", other))),
        };
        let sql = unescape(group[1]).map_err(|e| bad(base + 1, e))?;
        let types = split_list(group[2])
            .into_iter()
            .map(|t| t.trim().parse::<u32>().map_err(|e| bad(base + 2, format!("bad type code {:?}: {}", t, e))))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let params = split_list(group[3])
            .into_iter()
            .map(|v| decode_value(v).map_err(|e| bad(base + 3, e)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        statements.push(ReplayableStatement {
            prepared,
            sql,
            types,
            params,
        });
    }
    Ok(statements)
}

pub fn write_interactions(path: &Path, statements: &[ReplayableStatement]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    w.write_all(encode_interactions(statements).as_bytes())?;
    w.flush()?;
    Ok(())
}

pub fn read_interactions(path: &Path) -> Result<Vec<ReplayableStatement>> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(decode_interactions(&content, &path.display().to_string())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_entry::parse_log_line;

    fn entries(lines: &[&str]) -> Vec<LogEntry> {
        lines
            .iter()
            .enumerate()
            .map(|(i, l)| parse_log_line(i + 1, l).unwrap())
            .collect()
    }

    #[test]
    fn test_execute_with_parameters_consumes_detail() {
        let e = entries(&[
            "7 [t] [0] LOG:  execute <unnamed>: SELECT * FROM t WHERE a = $1 AND b = $2",
            "7 [t] [0] DETAIL:  parameters: $1 = 'x', $2 = '42'",
            "7 [t] [0] DETAIL:  parameters: $1 = 'stray'",
            "7 [t] [0] LOG:  execute <unnamed>: SELECT 1",
        ]);
        let stmts = extract_statements(&e);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].prepared);
        assert_eq!(stmts[0].params, vec![Some("x".to_string()), Some("42".to_string())]);
        assert!(!stmts[1].prepared);
        assert!(stmts[1].params.is_empty());
    }

    #[test]
    fn test_parse_and_bind_are_skipped() {
        let e = entries(&[
            "7 [t] [0] LOG:  duration: 0.1 ms  parse <unnamed>: SELECT $1",
            "7 [t] [0] LOG:  duration: 0.1 ms  bind <unnamed>: SELECT $1",
            "7 [t] [0] DETAIL:  parameters: $1 = 'a'",
            "7 [t] [0] LOG:  execute <unnamed>: SELECT $1",
            "7 [t] [0] DETAIL:  parameters: $1 = 'a'",
            "7 [t] [0] LOG:  statement: SET search_path = public",
        ]);
        let stmts = extract_statements(&e);
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].sql, "SELECT ?");
        assert_eq!(stmts[0].params, vec![Some("a".to_string())]);
    }

    #[test]
    fn test_simple_protocol_transaction_markers_kept() {
        let e = entries(&[
            "7 [t] [0] LOG:  statement: begin",
            "7 [t] [5] LOG:  execute S_1: UPDATE t SET a = 1",
            "7 [t] [5] LOG:  statement: COMMIT",
        ]);
        let stmts = extract_statements(&e);
        let sql: Vec<&str> = stmts.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(sql, vec!["begin", "UPDATE t SET a = 1", "COMMIT"]);
    }

    #[test]
    fn test_parameter_values_nulls_and_quotes() {
        let values = parse_parameter_values("? = NULL, ? = 'it''s', ? = 'why?', ? = ''");
        assert_eq!(
            values,
            vec![None, Some("it's".to_string()), Some("why?".to_string()), Some(String::new())]
        );
        assert!(parse_parameter_values("").is_empty());
    }

    #[test]
    fn test_tx_control_classification() {
        assert_eq!(TxControl::classify("BEGIN"), Some(TxControl::Begin));
        assert_eq!(TxControl::classify("  begin isolation level serializable"), Some(TxControl::Begin));
        assert_eq!(TxControl::classify("START TRANSACTION"), Some(TxControl::Begin));
        assert_eq!(TxControl::classify("commit;"), Some(TxControl::Commit));
        assert_eq!(TxControl::classify("END"), Some(TxControl::Commit));
        assert_eq!(TxControl::classify("ROLLBACK"), Some(TxControl::Rollback));
        assert_eq!(TxControl::classify("ROLLBACK TO SAVEPOINT s1"), None);
        assert_eq!(TxControl::classify("BEGINNING"), None);
        assert_eq!(TxControl::classify("SELECT 1"), None);
    }

    #[test]
    fn test_skip_leading_never_splits_transaction() {
        let stmts: Vec<ReplayableStatement> = ["SELECT 1", "BEGIN", "UPDATE t SET a = 1", "COMMIT", "SELECT 2"]
            .iter()
            .map(|s| ReplayableStatement::simple(*s))
            .collect();

        let kept = skip_leading(stmts.clone(), 1);
        assert_eq!(kept[0].sql, "BEGIN");

        // Cut would land inside the transaction: skip through COMMIT
        let kept = skip_leading(stmts.clone(), 2);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].sql, "SELECT 2");

        assert_eq!(skip_leading(stmts.clone(), 0).len(), 5);
        assert!(skip_leading(stmts, 10).is_empty());
    }

    #[test]
    fn test_codec_round_trip_edge_values() {
        let stmts = vec![
            ReplayableStatement::simple("BEGIN"),
            ReplayableStatement {
                prepared: true,
                sql: "UPDATE t\nSET a = ? -- a|b \\ c\nWHERE id = ?".to_string(),
                types: vec![25, 23],
                params: vec![Some("pipe|and\\slash\nnewline".to_string()), None],
            },
            ReplayableStatement {
                prepared: true,
                sql: "SELECT ?".to_string(),
                types: vec![],
                params: vec![Some(String::new())],
            },
            ReplayableStatement {
                prepared: true,
                sql: "SELECT ?, ?".to_string(),
                types: vec![0, 25],
                params: vec![Some("null".to_string()), Some("\\e".to_string())],
            },
        ];
        let encoded = encode_interactions(&stmts);
        assert_eq!(encoded.lines().count(), 16);
        let decoded = decode_interactions(&encoded, "mem").unwrap();
        assert_eq!(decoded, stmts);
    }

    #[test]
    fn test_decode_rejects_truncated_file() {
        let err = decode_interactions("1\nSELECT ?\n", "mem").unwrap_err();
        assert!(matches!(err, ReplayError::InteractionFormat { .. }));
        let err = decode_interactions("x\nSELECT 1\n\n\n", "mem").unwrap_err();
        assert!(err.to_string().contains("prepared flag"));
    }
}
