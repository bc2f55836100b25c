//! TSV export for machine-readable replay results

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::constants::{CLIENT_RESULTS_HEADER, SUMMARY_HEADER};
use crate::replay::{ClientResult, ReplayReport};

/// Writes `<base>-clients.tsv` and `<base>-summary.tsv`
pub struct TsvExporter {
    basename: String,
}

impl TsvExporter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            basename: path.as_ref().to_string_lossy().to_string(),
        }
    }

    pub fn clients_path(&self) -> PathBuf {
        PathBuf::from(format!("{}-clients.tsv", self.basename))
    }

    pub fn summary_path(&self) -> PathBuf {
        PathBuf::from(format!("{}-summary.tsv", self.basename))
    }

    /// Export the per-client table and the aggregate row
    pub fn export_report(&self, report: &ReplayReport) -> Result<()> {
        let path = self.clients_path();
        let mut f = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        writeln!(f, "{}", CLIENT_RESULTS_HEADER)?;
        for client in &report.clients {
            writeln!(f, "{}", client_row(client))?;
        }

        let path = self.summary_path();
        let mut f = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        writeln!(f, "{}", SUMMARY_HEADER)?;
        writeln!(f, "{}", summary_row(report))?;

        println!("\n✅ TSV results exported to: {}-{{clients,summary}}.tsv", self.basename);
        Ok(())
    }
}

fn client_row(c: &ClientResult) -> String {
    let lat = c.latencies.summary();
    format!(
        "{}\t{}\t{}\t{}\t{:.3}\t{:.3}\t{:.2}\t{}\t{}\t{}\t{}",
        c.client_id,
        c.success,
        c.statements_executed,
        c.statements_total,
        c.run_duration().as_secs_f64() * 1000.0,
        c.connection_duration().as_secs_f64() * 1000.0,
        lat.mean_us,
        lat.p50_us,
        lat.p99_us,
        lat.max_us,
        sanitize(c.error.as_deref().unwrap_or(""))
    )
}

fn summary_row(report: &ReplayReport) -> String {
    let lat = report.merged_latencies().summary();
    format!(
        "{}\t{}\t{}\t{}\t{:.3}\t{}\t{}\t{}",
        report.started_at.to_rfc3339(),
        report.clients.len(),
        report.failed_clients(),
        report.timed_out,
        report.wall.as_secs_f64() * 1000.0,
        report.statements_executed(),
        lat.p50_us,
        lat.p99_us
    )
}

/// Error text can carry statement values; keep one record per line
fn sanitize(text: &str) -> String {
    text.replace(['\t', '\n', '\r'], " ")
}

/// Human-readable report on stdout
pub fn print_report(report: &ReplayReport) {
    println!("\n=== Replay Results ===");
    println!(
        "{:>10}  {:>7}  {:>11}  {:>12}  {:>12}  {:>9}  {:>9}  error",
        "client", "ok", "statements", "run_ms", "conn_ms", "p50_us", "p99_us"
    );
    for c in &report.clients {
        let lat = c.latencies.summary();
        println!(
            "{:>10}  {:>7}  {:>5}/{:<5}  {:>12.3}  {:>12.3}  {:>9}  {:>9}  {}",
            c.client_id,
            c.success,
            c.statements_executed,
            c.statements_total,
            c.run_duration().as_secs_f64() * 1000.0,
            c.connection_duration().as_secs_f64() * 1000.0,
            lat.p50_us,
            lat.p99_us,
            c.error.as_deref().unwrap_or("")
        );
    }

    let lat = report.merged_latencies().summary();
    println!("\nClients: {} ({} failed)", report.clients.len(), report.failed_clients());
    println!("Statements executed: {}", report.statements_executed());
    println!("Wall time: {:.3} ms", report.wall.as_secs_f64() * 1000.0);
    println!(
        "Latency (µs): mean={:.0} p50={} p99={} max={}",
        lat.mean_us, lat.p50_us, lat.p99_us, lat.max_us
    );
    if report.timed_out {
        println!("⚠️  Replay timed out");
    }
}
