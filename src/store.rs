//! Store abstraction shared by the PostgreSQL, DuckDB and in-memory backends.
//!
//! The reconciliation core only ever talks to a [`Store`]. It never opens,
//! pools or closes connections; callers lend two handles for a run.

use crate::config::StoreConfig;
use crate::duckdb_store::DuckDbStore;
use crate::error::Result;
use crate::postgres::PostgresStore;
use crate::row::{Row, RowId, TableSnapshot};
use async_trait::async_trait;

/// A relational store that can be snapshotted and written table by table.
#[async_trait]
pub trait Store: Send + Sync {
    /// Label used in logs and errors ("primary", "replica").
    fn name(&self) -> &str;

    /// Test connectivity.
    async fn ping(&self) -> Result<()>;

    /// Column names of `table` in ordinal order.
    ///
    /// Fails with a read error when the table does not exist.
    async fn columns(&self, table: &str) -> Result<Vec<String>>;

    /// Read every row currently visible in `table`, keyed by `key_column`.
    async fn snapshot(&self, table: &str, key_column: &str) -> Result<TableSnapshot>;

    /// Insert `rows`, overwriting every non-key column of rows whose key
    /// already exists. All rows carry exactly `columns`.
    async fn upsert(
        &self,
        table: &str,
        key_column: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64>;

    /// Delete rows whose key is in `ids`.
    async fn delete(&self, table: &str, key_column: &str, ids: &[RowId]) -> Result<u64>;

    /// Row count of `table`.
    async fn count(&self, table: &str) -> Result<i64>;
}

/// Open the store described by `config` under the label `name`.
pub async fn open_store(name: &str, config: &StoreConfig) -> Result<Box<dyn Store>> {
    match config {
        StoreConfig::Postgres(pg) => Ok(Box::new(PostgresStore::connect(name, pg).await?)),
        StoreConfig::DuckDb(duck) => Ok(Box::new(DuckDbStore::open(name, duck)?)),
    }
}

/// Quote an SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Comma-separated list of quoted identifiers.
pub(crate) fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `ON CONFLICT` clause that overwrites every non-key column.
///
/// Falls back to `DO NOTHING` when the key is the only column.
pub(crate) fn on_conflict_clause(key_column: &str, columns: &[String]) -> String {
    let assignments: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != key_column)
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect();

    if assignments.is_empty() {
        format!("ON CONFLICT ({}) DO NOTHING", quote_ident(key_column))
    } else {
        format!(
            "ON CONFLICT ({}) DO UPDATE SET {}",
            quote_ident(key_column),
            assignments.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("families"), "\"families\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_on_conflict_updates_non_key_columns() {
        let cols = vec!["id".to_string(), "head_name".to_string(), "zone".to_string()];
        assert_eq!(
            on_conflict_clause("id", &cols),
            "ON CONFLICT (\"id\") DO UPDATE SET \"head_name\" = EXCLUDED.\"head_name\", \"zone\" = EXCLUDED.\"zone\""
        );
    }

    #[test]
    fn test_on_conflict_key_only_table() {
        let cols = vec!["id".to_string()];
        assert_eq!(
            on_conflict_clause("id", &cols),
            "ON CONFLICT (\"id\") DO NOTHING"
        );
    }
}
