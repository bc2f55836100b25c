//! Column type catalog
//!
//! The only thing the target database must provide to type resolution is the
//! ordered list of `(column, type OID)` pairs for a table. Results are cached
//! per table; the first reference to a table loads every column at once.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio_postgres::Client;
use tracing::debug;

/// Ordered columns of one table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableColumns {
    ordered: Vec<(String, u32)>,
    by_name: HashMap<String, u32>,
}

impl TableColumns {
    pub fn new(columns: Vec<(String, u32)>) -> Self {
        let ordered: Vec<(String, u32)> = columns
            .into_iter()
            .map(|(name, oid)| (name.to_lowercase(), oid))
            .collect();
        let by_name = ordered.iter().cloned().collect();
        Self { ordered, by_name }
    }

    pub fn type_of(&self, column: &str) -> Option<u32> {
        self.by_name.get(&column.to_lowercase()).copied()
    }

    /// Type of the n-th column (0-based) in declaration order
    pub fn type_at(&self, position: usize) -> Option<u32> {
        self.ordered.get(position).map(|(_, oid)| *oid)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Source of table column types
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Columns of `table` in declaration order; empty when the table is unknown
    async fn table_columns(&self, table: &str) -> anyhow::Result<Vec<(String, u32)>>;
}

#[async_trait]
impl<C: Catalog + ?Sized> Catalog for Box<C> {
    async fn table_columns(&self, table: &str) -> anyhow::Result<Vec<(String, u32)>> {
        (**self).table_columns(table).await
    }
}

/// Catalog backed by `pg_attribute` of a live PostgreSQL database
pub struct PgCatalog {
    client: Client,
}

impl PgCatalog {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

const COLUMNS_QUERY: &str = "SELECT a.attname::text, a.atttypid \
     FROM pg_catalog.pg_attribute a \
     WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped \
     ORDER BY a.attnum";

#[async_trait]
impl Catalog for PgCatalog {
    async fn table_columns(&self, table: &str) -> anyhow::Result<Vec<(String, u32)>> {
        let rows = self.client.query(COLUMNS_QUERY, &[&table]).await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, u32>(1)))
            .collect())
    }
}

/// Fixed catalog, for offline resolution and tests
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    tables: HashMap<String, Vec<(String, u32)>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &str, columns: &[(&str, u32)]) -> Self {
        self.tables.insert(
            table.to_lowercase(),
            columns.iter().map(|(c, t)| (c.to_string(), *t)).collect(),
        );
        self
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn table_columns(&self, table: &str) -> anyhow::Result<Vec<(String, u32)>> {
        Ok(self.tables.get(&table.to_lowercase()).cloned().unwrap_or_default())
    }
}

/// Table -> column -> type cache, filled lazily from a [`Catalog`]
#[derive(Debug, Default)]
pub struct ColumnTypeCache {
    tables: HashMap<String, TableColumns>,
    catalog_queries: usize,
}

impl ColumnTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Columns of `table`, querying the catalog once on first reference
    pub async fn table<C: Catalog + ?Sized>(&mut self, catalog: &C, table: &str) -> anyhow::Result<&TableColumns> {
        let key = table.to_lowercase();
        if !self.tables.contains_key(&key) {
            let columns = catalog.table_columns(&key).await?;
            debug!("Catalog: {} has {} columns", key, columns.len());
            self.catalog_queries += 1;
            self.tables.insert(key.clone(), TableColumns::new(columns));
        }
        Ok(&self.tables[&key])
    }

    /// Cached lookup only
    pub fn get(&self, table: &str, column: &str) -> Option<u32> {
        self.tables.get(&table.to_lowercase())?.type_of(column)
    }

    pub fn cached_tables(&self) -> usize {
        self.tables.len()
    }

    /// Number of catalog round trips made so far
    pub fn catalog_queries(&self) -> usize {
        self.catalog_queries
    }
}
