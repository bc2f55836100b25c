//! Parameter type resolution
//!
//! Combines [`crate::sql_analysis`] with a [`Catalog`] to fill in the type OID
//! of every placeholder of a prepared statement. Problems are recorded as
//! diagnostics; resolution never fails because of them. Only catalog I/O
//! errors propagate.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, warn};

use crate::catalog::{Catalog, ColumnTypeCache};
use crate::constants::UNRESOLVED_TYPE;
use crate::error::ReplayError;
use crate::interaction::ReplayableStatement;
use crate::log_entry::to_positional;
use crate::sql_analysis::{analyze, ColumnRef, PlaceholderBinding, StatementKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    UnresolvedParameterType,
    ParameterCountMismatch,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticKind::UnresolvedParameterType => "unresolved_parameter_type",
            DiagnosticKind::ParameterCountMismatch => "parameter_count_mismatch",
        }
    }
}

/// A non-fatal resolution problem for one statement
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub conn_id: u64,
    /// 0-based statement position within the connection
    pub statement: usize,
    pub kind: DiagnosticKind,
    pub message: String,
    pub sql: String,
}

/// Resolves placeholder types; owns its cache for one preparation run
pub struct TypeResolver<C> {
    catalog: C,
    cache: ColumnTypeCache,
    diagnostics: Vec<Diagnostic>,
}

impl<C: Catalog> TypeResolver<C> {
    pub fn new(catalog: C) -> Self {
        Self {
            catalog,
            cache: ColumnTypeCache::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn cache(&self) -> &ColumnTypeCache {
        &self.cache
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Resolve every statement of one connection in place
    pub async fn resolve_all(&mut self, conn_id: u64, statements: &mut [ReplayableStatement]) -> Result<()> {
        for (idx, stmt) in statements.iter_mut().enumerate() {
            self.resolve(conn_id, idx, stmt).await?;
        }
        Ok(())
    }

    /// Fill `stmt.types`; trailing unresolved positions are trimmed
    pub async fn resolve(&mut self, conn_id: u64, idx: usize, stmt: &mut ReplayableStatement) -> Result<()> {
        let placeholders = stmt.placeholder_count();
        if !stmt.prepared || placeholders == 0 {
            return Ok(());
        }

        if StatementKind::detect(&stmt.sql).is_none() {
            let err = ReplayError::UnresolvedParameterType {
                index: 1,
                reason: "statement is not SELECT/INSERT/UPDATE/DELETE".to_string(),
            };
            self.report(conn_id, idx, stmt, DiagnosticKind::UnresolvedParameterType, err);
            self.check_count(conn_id, idx, stmt, 0);
            return Ok(());
        }

        let bindings = match analyze(&to_positional(&stmt.sql)) {
            Ok(b) => b,
            Err(reason) => {
                let err = ReplayError::UnresolvedParameterType { index: 1, reason };
                self.report(conn_id, idx, stmt, DiagnosticKind::UnresolvedParameterType, err);
                self.check_count(conn_id, idx, stmt, 0);
                return Ok(());
            }
        };

        let mut types = vec![UNRESOLVED_TYPE; placeholders];
        for binding in &bindings {
            if binding.index == 0 || binding.index > placeholders {
                continue;
            }
            match self.lookup(binding).await? {
                Some(oid) => types[binding.index - 1] = oid,
                None => {
                    let err = ReplayError::UnresolvedParameterType {
                        index: binding.index,
                        reason: format!("no column {} in {}", describe_column(&binding.column), binding.tables.join(", ")),
                    };
                    self.report(conn_id, idx, stmt, DiagnosticKind::UnresolvedParameterType, err);
                }
            }
        }

        for index in 1..=placeholders {
            if !bindings.iter().any(|b| b.index == index) {
                let err = ReplayError::UnresolvedParameterType {
                    index,
                    reason: "placeholder is not compared with or assigned to a column".to_string(),
                };
                self.report(conn_id, idx, stmt, DiagnosticKind::UnresolvedParameterType, err);
            }
        }

        let resolved = types.iter().filter(|t| **t != UNRESOLVED_TYPE).count();
        self.check_count(conn_id, idx, stmt, resolved);
        if resolved != placeholders {
            debug!(
                "Connection {} statement {}: incomplete parameter resolution ({}/{})",
                conn_id, idx, resolved, placeholders
            );
        }

        while types.last() == Some(&UNRESOLVED_TYPE) {
            types.pop();
        }
        stmt.types = types;
        Ok(())
    }

    /// Captured values must match the placeholder count
    fn check_count(&mut self, conn_id: u64, idx: usize, stmt: &ReplayableStatement, resolved: usize) {
        let placeholders = stmt.placeholder_count();
        if stmt.params.len() != placeholders {
            let err = ReplayError::ParameterCountMismatch {
                placeholders,
                resolved,
                captured: stmt.params.len(),
            };
            self.report(conn_id, idx, stmt, DiagnosticKind::ParameterCountMismatch, err);
        }
    }

    async fn lookup(&mut self, binding: &PlaceholderBinding) -> Result<Option<u32>> {
        for table in &binding.tables {
            let columns = self
                .cache
                .table(&self.catalog, table)
                .await
                .with_context(|| format!("Catalog lookup failed for table {}", table))?;
            let found = match &binding.column {
                ColumnRef::Named(name) => columns.type_of(name),
                ColumnRef::Position(pos) => columns.type_at(*pos),
            };
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn report(
        &mut self,
        conn_id: u64,
        idx: usize,
        stmt: &ReplayableStatement,
        kind: DiagnosticKind,
        err: ReplayError,
    ) {
        warn!("Connection {} statement {}: {}", conn_id, idx, err);
        self.diagnostics.push(Diagnostic {
            conn_id,
            statement: idx,
            kind,
            message: err.to_string(),
            sql: stmt.sql.clone(),
        });
    }
}

fn describe_column(column: &ColumnRef) -> String {
    match column {
        ColumnRef::Named(name) => name.clone(),
        ColumnRef::Position(pos) => format!("#{}", pos + 1),
    }
}

/// Persist diagnostics as TSV
pub fn write_diagnostics(path: &Path, diagnostics: &[Diagnostic]) -> Result<()> {
    let mut w = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    w.write_record(["conn_id", "statement", "kind", "message", "sql"])?;
    for d in diagnostics {
        w.write_record([
            d.conn_id.to_string().as_str(),
            d.statement.to_string().as_str(),
            d.kind.as_str(),
            d.message.as_str(),
            d.sql.as_str(),
        ])?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use tokio_postgres::types::Type;

    fn prepared(sql: &str, params: &[&str]) -> ReplayableStatement {
        ReplayableStatement {
            prepared: true,
            sql: sql.to_string(),
            types: Vec::new(),
            params: params.iter().map(|p| Some(p.to_string())).collect(),
        }
    }

    fn accounts_catalog() -> StaticCatalog {
        // Declaration order deliberately differs from statement order
        StaticCatalog::new().with_table(
            "accounts",
            &[("owner", Type::TEXT.oid()), ("id", Type::INT8.oid()), ("balance", Type::FLOAT8.oid())],
        )
    }

    #[tokio::test]
    async fn test_update_resolves_set_and_where_types() {
        let mut resolver = TypeResolver::new(accounts_catalog());
        let mut stmt = prepared("UPDATE accounts SET balance = ? WHERE id = ?", &["1.5", "7"]);
        resolver.resolve(1, 0, &mut stmt).await.unwrap();
        assert_eq!(stmt.types, vec![Type::FLOAT8.oid(), Type::INT8.oid()]);
        assert!(resolver.diagnostics().is_empty());
    }

    #[tokio::test]
    async fn test_partial_resolution_trims_and_reports() {
        let mut resolver = TypeResolver::new(accounts_catalog());
        let mut stmt = prepared("SELECT * FROM accounts WHERE id = ? AND nope = ?", &["1", "x"]);
        resolver.resolve(1, 3, &mut stmt).await.unwrap();
        assert_eq!(stmt.types, vec![Type::INT8.oid()]);
        let diags = resolver.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::UnresolvedParameterType);
        assert_eq!(diags[0].statement, 3);
    }

    #[tokio::test]
    async fn test_unresolved_middle_keeps_zero() {
        let mut resolver = TypeResolver::new(accounts_catalog());
        let mut stmt = prepared("SELECT * FROM accounts WHERE id = ? AND lower(owner) = ? AND balance > ?", &["1", "a", "2"]);
        resolver.resolve(1, 0, &mut stmt).await.unwrap();
        assert_eq!(stmt.types, vec![Type::INT8.oid(), UNRESOLVED_TYPE, Type::FLOAT8.oid()]);
    }

    #[tokio::test]
    async fn test_count_mismatch_reported() {
        let mut resolver = TypeResolver::new(accounts_catalog());
        let mut stmt = prepared("DELETE FROM accounts WHERE id = ?", &[]);
        resolver.resolve(4, 0, &mut stmt).await.unwrap();
        assert_eq!(stmt.types, vec![Type::INT8.oid()]);
        let diags = resolver.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::ParameterCountMismatch);
        assert!(diags[0].message.contains("1 resolved"), "{}", diags[0].message);
        assert!(diags[0].message.contains("0 captured"), "{}", diags[0].message);
    }

    #[tokio::test]
    async fn test_simple_statements_untouched() {
        let mut resolver = TypeResolver::new(accounts_catalog());
        let mut stmt = ReplayableStatement::simple("BEGIN");
        resolver.resolve(1, 0, &mut stmt).await.unwrap();
        assert!(stmt.types.is_empty());
        assert_eq!(resolver.cache().catalog_queries(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_statement_is_diagnostic() {
        let mut resolver = TypeResolver::new(accounts_catalog());
        let mut stmt = prepared("SELECT * FROM accounts WHERE id = ? ORDER BY", &["1"]);
        resolver.resolve(1, 0, &mut stmt).await.unwrap();
        assert!(stmt.types.is_empty());
        assert_eq!(resolver.diagnostics().len(), 1);
    }
}
