/// Integration tests for the capture side: log -> streams -> statements -> types -> files

use anyhow::Result;
use sqlog_bench::capture::{run_capture, CaptureOptions};
use sqlog_bench::catalog::StaticCatalog;
use sqlog_bench::error::ReplayError;
use sqlog_bench::interaction::{
    extract_stream, interactions_path, read_interactions, write_interactions, ReplayableStatement,
};
use sqlog_bench::log_entry::OpKind;
use sqlog_bench::process_stream::{entries_path, read_entries, reconstruct, reconstruct_file};
use sqlog_bench::type_resolver::TypeResolver;
use std::io::BufRead;
use tokio_postgres::types::Type;

fn lines(text: &str) -> impl Iterator<Item = std::io::Result<String>> + '_ {
    text.lines().map(|l| Ok::<_, std::io::Error>(l.to_string()))
}

#[tokio::test]
async fn test_two_line_insert_resolves_to_text() -> Result<()> {
    let log = "\
7 [2024-03-01 10:00:00.000 UTC] [0] LOG:  execute <unnamed>: INSERT INTO t (a) VALUES ($1)
7 [2024-03-01 10:00:00.000 UTC] [0] DETAIL:  parameters: $1 = 'x'
";
    let streams = reconstruct(lines(log), true)?;
    let stream = streams.get(7).expect("connection 7");
    let mut statements = extract_stream(stream);

    assert_eq!(statements.len(), 1);
    assert!(statements[0].prepared);
    assert_eq!(statements[0].sql, "INSERT INTO t (a) VALUES (?)");
    assert_eq!(statements[0].params, vec![Some("x".to_string())]);

    let catalog = StaticCatalog::new().with_table("t", &[("a", Type::TEXT.oid())]);
    let mut resolver = TypeResolver::new(catalog);
    resolver.resolve_all(7, &mut statements).await?;
    assert_eq!(statements[0].types, vec![Type::TEXT.oid()]);
    assert!(resolver.diagnostics().is_empty());
    Ok(())
}

#[test]
fn test_stream_order_matches_log_order() -> Result<()> {
    let mut log = String::new();
    for i in 0..60u32 {
        let conn = [3, 1, 2][(i % 3) as usize];
        log.push_str(&format!(
            "{} [2024-03-01 10:00:{:02}.000 UTC] [0] LOG:  statement: SELECT {}\n",
            conn, i, i
        ));
    }
    let streams = reconstruct(lines(&log), true)?;
    assert_eq!(streams.connection_count(), 3);
    assert_eq!(streams.total_entries(), 60);

    for stream in streams.iter() {
        let seen: Vec<u32> = stream
            .entries
            .iter()
            .map(|e| e.text.trim_start_matches("SELECT ").parse().unwrap())
            .collect();
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(seen, sorted, "connection {} reordered", stream.conn_id);
        assert_eq!(seen.len(), 20);
    }
    Ok(())
}

#[test]
fn test_detail_consumed_once() -> Result<()> {
    let log = "\
5 [t] [0] LOG:  execute S_1: SELECT * FROM a WHERE x = $1 AND y = $2
5 [t] [0] DETAIL:  parameters: $1 = '1', $2 = NULL
5 [t] [0] DETAIL:  parameters: $1 = 'orphan'
5 [t] [0] LOG:  execute S_2: SELECT 1
";
    let streams = reconstruct(lines(log), true)?;
    let statements = extract_stream(streams.get(5).expect("connection 5"));
    assert_eq!(statements.len(), 2);
    assert_eq!(statements[0].params, vec![Some("1".to_string()), None]);
    assert_eq!(statements[1].sql, "SELECT 1");
    assert!(statements[1].params.is_empty());
    Ok(())
}

#[test]
fn test_multiline_statement_joined() -> Result<()> {
    let log = "\
4 [t] [0] LOG:  execute <unnamed>: SELECT *
\tFROM accounts
\tWHERE id = $1
4 [t] [0] DETAIL:  parameters: $1 = '9'
";
    let streams = reconstruct(lines(log), true)?;
    let stream = streams.get(4).expect("connection 4");
    assert_eq!(stream.entries.len(), 2);
    assert_eq!(stream.entries[0].kind, OpKind::Execute);
    assert_eq!(stream.entries[0].text, "SELECT *\n\tFROM accounts\n\tWHERE id = ?");
    assert_eq!(stream.raw_lines.len(), 4);

    let err = reconstruct(lines(log), false).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ReplayError>(),
        Some(ReplayError::MalformedLogLine { line: 2, .. })
    ));
    Ok(())
}

#[test]
fn test_zstd_log_and_persisted_entries() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = "2 [2024-03-01 10:00:00.000 UTC] [77] LOG:  statement: BEGIN\n\
               2 [2024-03-01 10:00:00.001 UTC] [77] LOG:  statement: COMMIT\n";
    let path = dir.path().join("postgresql.log.zst");
    std::fs::write(&path, zstd::stream::encode_all(log.as_bytes(), 3)?)?;

    let streams = reconstruct_file(&path, true)?;
    streams.persist(dir.path())?;

    let entries = read_entries(&entries_path(dir.path(), 2))?;
    assert_eq!(entries, streams.get(2).expect("connection 2").entries);
    assert_eq!(entries[0].tx_id, 77);

    let raw = std::fs::File::open(dir.path().join("2.raw.log"))?;
    assert_eq!(std::io::BufReader::new(raw).lines().count(), 2);
    Ok(())
}

#[test]
fn test_interaction_files_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let statements = vec![
        ReplayableStatement::simple("BEGIN"),
        ReplayableStatement {
            prepared: true,
            sql: "UPDATE t SET a = ?, b = ?, c = ? WHERE d = ?".to_string(),
            types: vec![Type::TEXT.oid(), 0, Type::INT4.oid()],
            params: vec![
                Some("pipe|and\nnewline".to_string()),
                None,
                Some("null".to_string()),
                Some(String::new()),
            ],
        },
        ReplayableStatement {
            prepared: true,
            sql: "SELECT ?".to_string(),
            types: Vec::new(),
            params: vec![Some("1".to_string())],
        },
        ReplayableStatement::simple("COMMIT"),
    ];
    let path = interactions_path(dir.path(), 42);
    write_interactions(&path, &statements)?;
    assert_eq!(read_interactions(&path)?, statements);

    write_interactions(&path, &[])?;
    assert!(read_interactions(&path)?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_capture_reports_diagnostics() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log_path = dir.path().join("pg.log");
    std::fs::write(
        &log_path,
        "1 [t] [0] LOG:  execute <unnamed>: SELECT * FROM t WHERE missing = $1\n\
         1 [t] [0] DETAIL:  parameters: $1 = 'x'\n",
    )?;
    let options = CaptureOptions {
        log_path,
        output_dir: dir.path().join("out"),
        skip_statements: 0,
        join_continuations: true,
    };
    let catalog = StaticCatalog::new().with_table("t", &[("a", Type::TEXT.oid())]);
    let summary = run_capture(&options, Some(Box::new(catalog))).await?;
    assert_eq!(summary.diagnostics, 1);

    let diagnostics = std::fs::read_to_string(options.output_dir.join("diagnostics.tsv"))?;
    assert!(diagnostics.contains("unresolved_parameter_type"));

    let statements = read_interactions(&interactions_path(&options.output_dir, 1))?;
    assert!(statements[0].types.is_empty());
    Ok(())
}
