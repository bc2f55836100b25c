// src/constants.rs
//
// Central location for all constants used throughout sqlog-bench
// This makes tuning and maintenance easier by having all magic numbers in one place

use std::time::Duration;

// =============================================================================
// Log Capture
// =============================================================================

/// Canonical placeholder marker. Driver-specific `$<n>` markers are rewritten to this.
pub const PLACEHOLDER_MARKER: char = '?';

/// Tag marker identifying a bind-parameter detail line in a PostgreSQL log
pub const PARAMETER_DETAIL_MARKER: &str = "DETAIL:  parameters:";

/// Sentinel written to interaction files for a SQL NULL parameter value
pub const NULL_SENTINEL: &str = "null";

/// Separator between type codes / parameter values in interaction files
pub const LIST_SEPARATOR: char = '|';

/// Number of lines making up one statement in an interaction file
pub const LINES_PER_STATEMENT: usize = 4;

/// Type code meaning "not resolved" (PostgreSQL's InvalidOid)
pub const UNRESOLVED_TYPE: u32 = 0;

// =============================================================================
// Output File Naming
// =============================================================================

/// Per-connection copy of the unparsed physical log lines
pub const RAW_LOG_SUFFIX: &str = ".raw.log";

/// Per-connection parsed entries (TSV)
pub const ENTRIES_SUFFIX: &str = ".entries.tsv";

/// Per-connection replayable statements
pub const INTERACTIONS_EXTENSION: &str = "interactions";

/// Type-resolution diagnostics written next to the interaction files
pub const DIAGNOSTICS_FILE: &str = "diagnostics.tsv";

/// Header for the per-connection entries TSV
pub const ENTRIES_HEADER: [&str; 5] = ["conn_id", "timestamp", "tx_id", "kind", "text"];

// =============================================================================
// Replay Defaults
// =============================================================================

/// Maximum time to wait for every client to reach the start gate
/// User can override via config: replay.ready_timeout
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum wall time for the whole replay once the gate is released
/// User can override via config: replay.timeout
pub const DEFAULT_REPLAY_TIMEOUT: Duration = Duration::from_secs(3600);

/// Connect timeout handed to tokio-postgres for each client connection
/// User can override via config: database.connect_timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default PostgreSQL port
pub const DEFAULT_PG_PORT: u16 = 5432;

/// Upper bound for recorded statement latencies (1 hour, in microseconds)
pub const LATENCY_HIST_MAX_US: u64 = 3_600_000_000;

/// Significant digits kept by latency histograms
pub const LATENCY_HIST_SIGFIG: u8 = 3;

// =============================================================================
// Results Export
// =============================================================================

/// Header for the per-client results TSV
pub const CLIENT_RESULTS_HEADER: &str = "client_id\tsuccess\tstatements_executed\tstatements_total\trun_ms\tconnection_ms\tmean_us\tp50_us\tp99_us\tmax_us\terror";

/// Header for the aggregate summary TSV
pub const SUMMARY_HEADER: &str = "started_at\tclients\tfailed_clients\ttimed_out\twall_ms\tstatements\tp50_us\tp99_us";
