// -----------------------------------------------------------------------------
// sqlog-bench - capture a PostgreSQL server log and replay it concurrently
// -----------------------------------------------------------------------------

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use sqlog_bench::capture::{run_capture, CaptureOptions};
use sqlog_bench::catalog::{Catalog, PgCatalog};
use sqlog_bench::config::{CaptureConfig, Config, ReplayConfig};
use sqlog_bench::constants::{DEFAULT_READY_TIMEOUT, DEFAULT_REPLAY_TIMEOUT};
use sqlog_bench::replay::{load_clients, run_replay, PgBackend};
use sqlog_bench::tsv_export::{print_report, TsvExporter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Builder as RtBuilder;
use tokio_postgres::NoTls;
use tracing::{error, info};

// -----------------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------------
#[derive(Parser)]
#[command(name = "sqlog-bench", version, about = "Capture a PostgreSQL server log and replay it as concurrent clients")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// YAML configuration file (database endpoint, capture and replay settings)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a server log into per-connection interaction files
    ///
    /// The log must use log_line_prefix = '%p [%m] [%x] ' with
    /// log_statement = 'all' (or log_min_duration_statement = 0).
    ///
    /// Examples:
    ///   sqlog-bench capture --log postgresql.log --out capture/
    ///   sqlog-bench capture --log postgresql.log.zst --out capture/ --skip 100
    ///   sqlog-bench -c bench.yaml capture --no-resolve
    Capture {
        /// Server log (plain or .zst)
        #[arg(long)]
        log: Option<PathBuf>,

        /// Output directory
        #[arg(long)]
        out: Option<PathBuf>,

        /// Leading statements to drop per connection (never splits a transaction)
        #[arg(long)]
        skip: Option<usize>,

        /// Do not query the database catalog for parameter types
        #[arg(long)]
        no_resolve: bool,

        /// Treat every physical line as its own entry
        #[arg(long)]
        no_join: bool,
    },
    /// Replay interaction files, one concurrent client per captured connection
    ///
    /// Examples:
    ///   sqlog-bench replay --dir capture/
    ///   sqlog-bench replay --dir capture/ --timeout 10m --results-tsv /tmp/run1
    Replay {
        /// Directory of *.interactions files
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Wait for all clients to connect (e.g. "2m")
        #[arg(long, value_parser = humantime::parse_duration)]
        ready_timeout: Option<Duration>,

        /// Overall completion wait after the start gate opens (e.g. "1h")
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,

        /// Export results to <path>-clients.tsv and <path>-summary.tsv
        #[arg(long, value_name = "PATH")]
        results_tsv: Option<PathBuf>,
    },
}

// -----------------------------------------------------------------------------
// main
// -----------------------------------------------------------------------------
fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    // -v (1): info, -vv (2): debug, -vvv (3+): trace
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::new(format!("sqlog_bench={}", level));
    fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    let rt = RtBuilder::new_multi_thread().enable_all().build()?;
    match cli.command {
        Commands::Capture { log, out, skip, no_resolve, no_join } => {
            let mut capture = match (config.capture.clone(), &log, &out) {
                (Some(c), _, _) => c,
                (None, Some(log_path), Some(output_dir)) => CaptureConfig {
                    log_path: log_path.clone(),
                    output_dir: output_dir.clone(),
                    skip_statements: 0,
                    resolve_types: true,
                    join_continuations: true,
                },
                _ => bail!("capture needs --log and --out, or a `capture:` section in the config file"),
            };
            if let Some(l) = log {
                capture.log_path = l;
            }
            if let Some(o) = out {
                capture.output_dir = o;
            }
            if let Some(n) = skip {
                capture.skip_statements = n;
            }
            if no_resolve {
                capture.resolve_types = false;
            }
            if no_join {
                capture.join_continuations = false;
            }
            rt.block_on(capture_cmd(&config, &capture))
        }
        Commands::Replay { dir, ready_timeout, timeout, results_tsv } => {
            let mut replay = match (config.replay.clone(), &dir) {
                (Some(r), _) => r,
                (None, Some(interactions_dir)) => ReplayConfig {
                    interactions_dir: interactions_dir.clone(),
                    ready_timeout: DEFAULT_READY_TIMEOUT,
                    timeout: DEFAULT_REPLAY_TIMEOUT,
                    results_path: None,
                },
                (None, None) => bail!("replay needs --dir, or a `replay:` section in the config file"),
            };
            if let Some(d) = dir {
                replay.interactions_dir = d;
            }
            if let Some(t) = ready_timeout {
                replay.ready_timeout = t;
            }
            if let Some(t) = timeout {
                replay.timeout = t;
            }
            if results_tsv.is_some() {
                replay.results_path = results_tsv;
            }
            rt.block_on(replay_cmd(&config, &replay))
        }
    }
}

// -----------------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------------
async fn capture_cmd(config: &Config, capture: &CaptureConfig) -> Result<()> {
    let catalog: Option<Box<dyn Catalog>> = if capture.resolve_types {
        let (client, connection) = config
            .database
            .to_pg_config()
            .connect(NoTls)
            .await
            .with_context(|| format!("Failed to connect to {} for catalog lookups", config.database.host))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });
        Some(Box::new(PgCatalog::new(client)))
    } else {
        info!("Type resolution disabled; replay will use server-inferred parameter types");
        None
    };

    let options = CaptureOptions {
        log_path: capture.log_path.clone(),
        output_dir: capture.output_dir.clone(),
        skip_statements: capture.skip_statements,
        join_continuations: capture.join_continuations,
    };
    let summary = run_capture(&options, catalog).await?;

    println!("Connections      : {}", summary.connections);
    println!("Log entries      : {}", summary.entries);
    println!("Statements       : {}", summary.statements);
    println!("Skipped (warm-up): {}", summary.skipped);
    if capture.resolve_types {
        println!("Catalog queries  : {}", summary.catalog_queries);
        println!("Diagnostics      : {}", summary.diagnostics);
    }
    println!("Output           : {}", capture.output_dir.display());
    Ok(())
}

async fn replay_cmd(config: &Config, replay: &ReplayConfig) -> Result<()> {
    let clients = load_clients(&replay.interactions_dir)?;
    if clients.is_empty() {
        bail!("No interaction files found in {}", replay.interactions_dir.display());
    }

    let backend = Arc::new(PgBackend::new(config.database.to_pg_config()));
    let report = run_replay(clients, backend, &replay.options()).await;

    print_report(&report);
    if let Some(base) = &replay.results_path {
        TsvExporter::new(base).export_report(&report)?;
    }

    if report.timed_out {
        bail!("Replay timed out ({} of {} clients failed)", report.failed_clients(), report.clients.len());
    }
    Ok(())
}
