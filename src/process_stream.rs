//! Per-connection stream reconstruction
//!
//! Groups parsed log entries by connection id while preserving file order,
//! and persists each connection's raw lines and parsed entries for audit.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::constants::{ENTRIES_HEADER, ENTRIES_SUFFIX, RAW_LOG_SUFFIX};
use crate::log_entry::{parse_log_line, LogEntry, LogicalLines, OpKind};

/// Ordered entries (and the raw lines behind them) for one connection
#[derive(Debug, Clone, Default)]
pub struct ProcessStream {
    pub conn_id: u64,
    pub entries: Vec<LogEntry>,
    pub raw_lines: Vec<String>,
}

impl ProcessStream {
    pub fn new(conn_id: u64) -> Self {
        Self {
            conn_id,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All connection streams of one log, keyed by connection id
#[derive(Debug, Default)]
pub struct ProcessStreams {
    streams: BTreeMap<u64, ProcessStream>,
    total_entries: usize,
}

impl ProcessStreams {
    /// Append an entry to its connection's stream
    pub fn push(&mut self, entry: LogEntry, raw: Vec<String>) {
        let stream = self
            .streams
            .entry(entry.conn_id)
            .or_insert_with(|| ProcessStream::new(entry.conn_id));
        stream.entries.push(entry);
        stream.raw_lines.extend(raw);
        self.total_entries += 1;
    }

    pub fn get(&self, conn_id: u64) -> Option<&ProcessStream> {
        self.streams.get(&conn_id)
    }

    /// Streams in ascending connection id order
    pub fn iter(&self) -> impl Iterator<Item = &ProcessStream> {
        self.streams.values()
    }

    pub fn connection_count(&self) -> usize {
        self.streams.len()
    }

    pub fn total_entries(&self) -> usize {
        self.total_entries
    }

    /// Write `<conn>.raw.log` and `<conn>.entries.tsv` for every connection
    pub fn persist(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        for stream in self.streams.values() {
            write_raw_lines(&raw_log_path(dir, stream.conn_id), &stream.raw_lines)?;
            write_entries(&entries_path(dir, stream.conn_id), &stream.entries)?;
        }
        info!(
            "Persisted raw lines and entries for {} connections to {}",
            self.streams.len(),
            dir.display()
        );
        Ok(())
    }
}

pub fn raw_log_path(dir: &Path, conn_id: u64) -> PathBuf {
    dir.join(format!("{}{}", conn_id, RAW_LOG_SUFFIX))
}

pub fn entries_path(dir: &Path, conn_id: u64) -> PathBuf {
    dir.join(format!("{}{}", conn_id, ENTRIES_SUFFIX))
}

/// Open a server log for line reading (auto-detects zstd compression)
pub fn open_log(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("Failed to open log {}", path.display()))?;

    let reader: Box<dyn Read> = if path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s == "zst")
        .unwrap_or(false)
    {
        info!("Detected zstd compression");
        Box::new(zstd::stream::read::Decoder::new(file)?)
    } else {
        Box::new(file)
    };

    Ok(Box::new(BufReader::new(reader)))
}

/// Parse every logical line and group the entries by connection.
///
/// Fail-fast: the first malformed line aborts the pass and no partial
/// streams are returned. The error is a [`crate::error::ReplayError`] wrapped
/// in `anyhow` so callers can downcast it.
pub fn reconstruct<I>(lines: I, join_continuations: bool) -> Result<ProcessStreams>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    let mut streams = ProcessStreams::default();

    for logical in LogicalLines::new(lines, join_continuations) {
        let logical = logical.context("Failed to read log line")?;
        if logical.text.trim().is_empty() {
            continue;
        }
        let entry = parse_log_line(logical.line_no, &logical.text)?;
        streams.push(entry, logical.raw);
    }

    debug!(
        "Reconstructed {} entries across {} connections",
        streams.total_entries(),
        streams.connection_count()
    );
    Ok(streams)
}

/// Reconstruct streams straight from a log file
pub fn reconstruct_file(path: &Path, join_continuations: bool) -> Result<ProcessStreams> {
    info!("Parsing server log: {}", path.display());
    let reader = open_log(path)?;
    reconstruct(reader.lines(), join_continuations)
        .with_context(|| format!("Failed to ingest {}", path.display()))
}

fn write_raw_lines(path: &Path, lines: &[String]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for line in lines {
        writeln!(w, "{}", line)?;
    }
    w.flush()?;
    Ok(())
}

fn write_entries(path: &Path, entries: &[LogEntry]) -> Result<()> {
    let mut w = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    w.write_record(ENTRIES_HEADER)?;
    for e in entries {
        w.write_record([
            e.conn_id.to_string().as_str(),
            e.timestamp.as_str(),
            e.tx_id.to_string().as_str(),
            e.kind.as_str(),
            e.text.as_str(),
        ])?;
    }
    w.flush()?;
    Ok(())
}

/// Read back a persisted `<conn>.entries.tsv`
pub fn read_entries(path: &Path) -> Result<Vec<LogEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut entries = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Bad record {} in {}", idx + 2, path.display()))?;
        if record.len() < ENTRIES_HEADER.len() {
            anyhow::bail!("Record {} in {} has {} columns", idx + 2, path.display(), record.len());
        }
        let kind: OpKind = record[3].parse().map_err(anyhow::Error::msg)?;
        entries.push(LogEntry::new(
            record[0].parse().context("Failed to parse conn_id")?,
            record[1].to_string(),
            record[2].parse().context("Failed to parse tx_id")?,
            kind,
            record[4].to_string(),
        ));
    }
    Ok(entries)
}
