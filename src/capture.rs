//! Capture pipeline: server log -> per-connection interaction files
//!
//! 1. reconstruct per-connection streams from the log (fail-fast)
//! 2. persist raw lines and parsed entries per connection
//! 3. extract replayable statements, drop warm-up statements
//! 4. resolve parameter types (optional) and write interaction files

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::constants::DIAGNOSTICS_FILE;
use crate::interaction::{extract_stream, interactions_path, skip_leading, write_interactions};
use crate::process_stream::reconstruct_file;
use crate::type_resolver::{write_diagnostics, TypeResolver};

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub log_path: PathBuf,
    pub output_dir: PathBuf,
    pub skip_statements: usize,
    pub join_continuations: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub connections: usize,
    pub entries: usize,
    pub statements: usize,
    pub skipped: usize,
    pub diagnostics: usize,
    pub catalog_queries: usize,
}

/// Run the capture pipeline. Without a catalog every type list stays empty
/// and replay relies on server-inferred parameter types.
pub async fn run_capture(options: &CaptureOptions, catalog: Option<Box<dyn Catalog>>) -> Result<CaptureSummary> {
    std::fs::create_dir_all(&options.output_dir)
        .with_context(|| format!("Failed to create output directory {}", options.output_dir.display()))?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(format!("parsing {}", options.log_path.display()));

    let streams = match reconstruct_file(&options.log_path, options.join_continuations) {
        Ok(s) => s,
        Err(e) => {
            pb.finish_and_clear();
            return Err(e);
        }
    };
    pb.set_message(format!(
        "persisting {} entries from {} connections",
        streams.total_entries(),
        streams.connection_count()
    ));
    streams.persist(&options.output_dir)?;

    let mut resolver = catalog.map(TypeResolver::new);
    let mut summary = CaptureSummary {
        connections: streams.connection_count(),
        entries: streams.total_entries(),
        ..Default::default()
    };

    for stream in streams.iter() {
        pb.set_message(format!("connection {}", stream.conn_id));
        let extracted = extract_stream(stream);
        let before = extracted.len();
        let mut statements = skip_leading(extracted, options.skip_statements);
        summary.skipped += before - statements.len();

        if let Some(resolver) = resolver.as_mut() {
            resolver
                .resolve_all(stream.conn_id, &mut statements)
                .await
                .with_context(|| format!("Type resolution failed for connection {}", stream.conn_id))?;
        }

        write_interactions(&interactions_path(&options.output_dir, stream.conn_id), &statements)?;
        summary.statements += statements.len();
    }

    if let Some(resolver) = resolver.as_ref() {
        summary.diagnostics = resolver.diagnostics().len();
        summary.catalog_queries = resolver.cache().catalog_queries();
        write_diagnostics(&options.output_dir.join(DIAGNOSTICS_FILE), resolver.diagnostics())?;
        if summary.diagnostics > 0 {
            warn!(
                "{} type resolution diagnostics written to {}",
                summary.diagnostics,
                options.output_dir.join(DIAGNOSTICS_FILE).display()
            );
        }
    }
    pb.finish_and_clear();

    info!(
        "Captured {} statements from {} connections ({} entries, {} skipped)",
        summary.statements, summary.connections, summary.entries, summary.skipped
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::interaction::read_interactions;
    use tokio_postgres::types::Type;

    const LOG: &str = "\
11 [2024-03-01 10:00:00.000 UTC] [0] LOG:  statement: BEGIN
11 [2024-03-01 10:00:00.001 UTC] [501] LOG:  execute <unnamed>: UPDATE accounts SET balance = $1 WHERE id = $2
11 [2024-03-01 10:00:00.001 UTC] [501] DETAIL:  parameters: $1 = '10.5', $2 = '3'
12 [2024-03-01 10:00:00.002 UTC] [0] LOG:  execute <unnamed>: SELECT owner FROM accounts WHERE id = $1
12 [2024-03-01 10:00:00.002 UTC] [0] DETAIL:  parameters: $1 = '4'
11 [2024-03-01 10:00:00.003 UTC] [501] LOG:  statement: COMMIT
";

    fn options(dir: &std::path::Path, skip: usize) -> CaptureOptions {
        let log_path = dir.join("postgresql.log");
        std::fs::write(&log_path, LOG).unwrap();
        CaptureOptions {
            log_path,
            output_dir: dir.join("out"),
            skip_statements: skip,
            join_continuations: true,
        }
    }

    #[tokio::test]
    async fn test_capture_with_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), 0);
        let catalog = StaticCatalog::new().with_table(
            "accounts",
            &[("id", Type::INT8.oid()), ("owner", Type::TEXT.oid()), ("balance", Type::FLOAT8.oid())],
        );

        let summary = run_capture(&opts, Some(Box::new(catalog))).await.unwrap();
        assert_eq!(summary.connections, 2);
        assert_eq!(summary.entries, 6);
        assert_eq!(summary.statements, 4);
        assert_eq!(summary.diagnostics, 0);
        assert_eq!(summary.catalog_queries, 1);

        let c11 = read_interactions(&interactions_path(&opts.output_dir, 11)).unwrap();
        assert_eq!(c11.len(), 3);
        assert_eq!(c11[1].sql, "UPDATE accounts SET balance = ? WHERE id = ?");
        assert_eq!(c11[1].types, vec![Type::FLOAT8.oid(), Type::INT8.oid()]);
        assert_eq!(c11[1].params, vec![Some("10.5".to_string()), Some("3".to_string())]);

        assert!(opts.output_dir.join("11.raw.log").exists());
        assert!(opts.output_dir.join("12.entries.tsv").exists());
        assert!(opts.output_dir.join(DIAGNOSTICS_FILE).exists());
    }

    #[tokio::test]
    async fn test_capture_without_catalog_skips_whole_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), 1);

        let summary = run_capture(&opts, None).await.unwrap();
        assert_eq!(summary.skipped, 4);
        assert_eq!(summary.statements, 0);
        assert!(!opts.output_dir.join(DIAGNOSTICS_FILE).exists());

        let c12 = read_interactions(&interactions_path(&opts.output_dir, 12)).unwrap();
        assert!(c12.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_log_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("bad.log");
        std::fs::write(&log_path, "11 [2024-03-01] missing tx\n").unwrap();
        let opts = CaptureOptions {
            log_path,
            output_dir: dir.path().join("out"),
            skip_statements: 0,
            join_continuations: true,
        };
        let err = run_capture(&opts, None).await.unwrap_err();
        assert!(err.downcast_ref::<crate::error::ReplayError>().is_some());
    }
}
