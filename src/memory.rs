//! In-process store.
//!
//! Behaves like a small relational database: tables have a fixed column list,
//! writes with unknown columns are rejected, and optional foreign keys are
//! enforced on upsert and delete. Reads and writes can be made to fail per
//! table, and every write is recorded in an operation log.

use crate::error::{Error, Result, WriteOp};
use crate::row::{Row, RowId, TableSnapshot};
use crate::store::Store;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// A recorded write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Upsert statement
    Upsert {
        /// Table name
        table: String,
        /// Rows in the statement
        rows: usize,
    },
    /// Delete statement
    Delete {
        /// Table name
        table: String,
        /// Ids in the statement
        ids: usize,
    },
}

impl Op {
    /// Table the operation touched.
    pub fn table(&self) -> &str {
        match self {
            Op::Upsert { table, .. } | Op::Delete { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone)]
struct ForeignKey {
    child: String,
    column: String,
    parent: String,
}

#[derive(Debug, Default)]
struct MemTable {
    columns: Vec<String>,
    rows: BTreeMap<RowId, Row>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, MemTable>,
    foreign_keys: Vec<ForeignKey>,
    log: Vec<Op>,
    fail_reads: HashSet<String>,
    fail_writes: HashSet<String>,
    latency: Option<Duration>,
}

/// In-memory [`Store`]. Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create (or replace) a table with the given columns.
    pub fn create_table(&self, table: &str, columns: &[&str]) -> &Self {
        self.lock().tables.insert(
            table.to_string(),
            MemTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: BTreeMap::new(),
            },
        );
        self
    }

    /// Declare that `child.column` references the key of `parent`.
    pub fn add_foreign_key(&self, child: &str, column: &str, parent: &str) -> &Self {
        self.lock().foreign_keys.push(ForeignKey {
            child: child.to_string(),
            column: column.to_string(),
            parent: parent.to_string(),
        });
        self
    }

    /// Write a row directly, bypassing constraints and the operation log.
    ///
    /// Columns the table lacks are ignored; missing columns become NULL.
    pub fn put(&self, table: &str, key_column: &str, row: Row) -> &Self {
        let mut inner = self.lock();
        if let Some(t) = inner.tables.get_mut(table) {
            if let Some(id) = row.id(key_column) {
                let full = t
                    .columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or_default()))
                    .collect();
                t.rows.insert(id, full);
            }
        }
        self
    }

    /// Remove a row directly.
    pub fn remove(&self, table: &str, id: &RowId) -> Option<Row> {
        self.lock()
            .tables
            .get_mut(table)
            .and_then(|t| t.rows.remove(id))
    }

    /// Current rows of a table in id order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Current content of a table keyed by id.
    pub fn table_content(&self, table: &str) -> BTreeMap<RowId, Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Fetch one row.
    pub fn row(&self, table: &str, id: &RowId) -> Option<Row> {
        self.lock()
            .tables
            .get(table)
            .and_then(|t| t.rows.get(id).cloned())
    }

    /// Writes recorded so far.
    pub fn ops(&self) -> Vec<Op> {
        self.lock().log.clone()
    }

    /// Forget recorded writes.
    pub fn clear_ops(&self) {
        self.lock().log.clear();
    }

    /// Make reads of `table` fail.
    pub fn fail_reads_on(&self, table: &str) -> &Self {
        self.lock().fail_reads.insert(table.to_string());
        self
    }

    /// Make writes to `table` fail.
    pub fn fail_writes_on(&self, table: &str) -> &Self {
        self.lock().fail_writes.insert(table.to_string());
        self
    }

    /// Clear injected failures.
    pub fn heal(&self) {
        let mut inner = self.lock();
        inner.fail_reads.clear();
        inner.fail_writes.clear();
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
    }

    fn check_readable(&self, inner: &Inner, table: &str) -> Result<()> {
        if inner.fail_reads.contains(table) {
            return Err(Error::read_msg(&self.name, table, "injected read failure"));
        }
        if !inner.tables.contains_key(table) {
            return Err(Error::read_msg(
                &self.name,
                table,
                format!("relation \"{}\" does not exist", table),
            ));
        }
        Ok(())
    }

    fn check_writable(&self, inner: &Inner, table: &str, op: WriteOp) -> Result<()> {
        if inner.fail_writes.contains(table) {
            return Err(Error::write_msg(&self.name, table, op, "injected write failure"));
        }
        if !inner.tables.contains_key(table) {
            return Err(Error::write_msg(
                &self.name,
                table,
                op,
                format!("relation \"{}\" does not exist", table),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        self.simulate_latency().await;
        Ok(())
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>> {
        self.simulate_latency().await;
        let inner = self.lock();
        self.check_readable(&inner, table)?;
        Ok(inner.tables[table].columns.clone())
    }

    async fn snapshot(&self, table: &str, key_column: &str) -> Result<TableSnapshot> {
        self.simulate_latency().await;
        let inner = self.lock();
        self.check_readable(&inner, table)?;
        let t = &inner.tables[table];

        TableSnapshot::from_rows(
            table,
            &self.name,
            t.columns.clone(),
            key_column,
            t.rows.values().cloned(),
        )
        .map_err(|e| Error::read_msg(&self.name, table, e.to_string()))
    }

    async fn upsert(
        &self,
        table: &str,
        key_column: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        self.check_writable(&inner, table, WriteOp::Upsert)?;

        let known: HashSet<&String> = inner.tables[table].columns.iter().collect();
        if let Some(unknown) = columns.iter().find(|c| !known.contains(c)) {
            return Err(Error::write_msg(
                &self.name,
                table,
                WriteOp::Upsert,
                format!("column \"{}\" of relation \"{}\" does not exist", unknown, table),
            ));
        }

        for fk in inner.foreign_keys.iter().filter(|fk| fk.child == table) {
            let parent = inner.tables.get(&fk.parent);
            for row in rows {
                let Some(target) = row.get(&fk.column).and_then(RowId::from_json) else {
                    continue;
                };
                if !parent.is_some_and(|p| p.rows.contains_key(&target)) {
                    return Err(Error::write_msg(
                        &self.name,
                        table,
                        WriteOp::Upsert,
                        format!(
                            "insert violates foreign key: {}.{} = {} not present in {}",
                            table, fk.column, target, fk.parent
                        ),
                    ));
                }
            }
        }

        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id(key_column).ok_or_else(|| {
                Error::write_msg(&self.name, table, WriteOp::Upsert, "row without key")
            })?;
            keyed.push((id, row));
        }

        let Some(t) = inner.tables.get_mut(table) else {
            return Ok(0);
        };
        for (id, row) in keyed {
            let mut full = t.rows.remove(&id).unwrap_or_else(|| {
                t.columns
                    .iter()
                    .map(|c| (c.clone(), serde_json::Value::Null))
                    .collect()
            });
            for c in columns {
                full.insert(c.clone(), row.get(c).cloned().unwrap_or_default());
            }
            t.rows.insert(id, full);
        }

        inner.log.push(Op::Upsert {
            table: table.to_string(),
            rows: rows.len(),
        });
        debug!("{}: upserted {} rows into {}", self.name, rows.len(), table);
        Ok(rows.len() as u64)
    }

    async fn delete(&self, table: &str, _key_column: &str, ids: &[RowId]) -> Result<u64> {
        self.simulate_latency().await;
        let mut inner = self.lock();
        self.check_writable(&inner, table, WriteOp::Delete)?;

        for fk in inner.foreign_keys.iter().filter(|fk| fk.parent == table) {
            let Some(child) = inner.tables.get(&fk.child) else {
                continue;
            };
            for id in ids {
                let referenced = child.rows.values().any(|r| {
                    r.get(&fk.column).and_then(RowId::from_json).as_ref() == Some(id)
                });
                if referenced {
                    return Err(Error::write_msg(
                        &self.name,
                        table,
                        WriteOp::Delete,
                        format!(
                            "delete violates foreign key: {} {} still referenced by {}.{}",
                            table, id, fk.child, fk.column
                        ),
                    ));
                }
            }
        }

        let Some(t) = inner.tables.get_mut(table) else {
            return Ok(0);
        };
        let removed = ids.iter().filter(|id| t.rows.remove(*id).is_some()).count();

        inner.log.push(Op::Delete {
            table: table.to_string(),
            ids: ids.len(),
        });
        debug!("{}: deleted {} rows from {}", self.name, removed, table);
        Ok(removed as u64)
    }

    async fn count(&self, table: &str) -> Result<i64> {
        self.simulate_latency().await;
        let inner = self.lock();
        self.check_readable(&inner, table)?;
        Ok(inner.tables[table].rows.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn families() -> MemoryStore {
        let store = MemoryStore::new("replica");
        store.create_table("families", &["id", "head_name"]);
        store
    }

    #[test]
    fn test_upsert_overwrites_existing_row() {
        let store = families();
        store.put("families", "id", Row::new().with("id", 2).with("head_name", "OLD"));

        let cols = vec!["id".to_string(), "head_name".to_string()];
        let rows = vec![Row::new().with("id", 2).with("head_name", "NEW")];
        let written = tokio_test::block_on(store.upsert("families", "id", &cols, &rows)).unwrap();

        assert_eq!(written, 1);
        assert_eq!(
            store.row("families", &RowId::Int(2)).unwrap().get("head_name"),
            Some(&json!("NEW"))
        );
        assert_eq!(
            store.ops(),
            vec![Op::Upsert {
                table: "families".into(),
                rows: 1
            }]
        );
    }

    #[test]
    fn test_upsert_rejects_unknown_column() {
        let store = families();
        let cols = vec!["id".to_string(), "photo".to_string()];
        let rows = vec![Row::new().with("id", 1).with("photo", "x.png")];
        let err = tokio_test::block_on(store.upsert("families", "id", &cols, &rows)).unwrap_err();
        assert_eq!(err.code(), "WRITE_ERROR");
    }

    #[test]
    fn test_foreign_key_blocks_parent_delete() {
        let store = families();
        store.create_table("members", &["id", "family_id"]);
        store.add_foreign_key("members", "family_id", "families");
        store.put("families", "id", Row::new().with("id", 1));
        store.put("members", "id", Row::new().with("id", 10).with("family_id", 1));

        let err = tokio_test::block_on(store.delete("families", "id", &[RowId::Int(1)])).unwrap_err();
        assert!(err.to_string().contains("still referenced"));

        tokio_test::block_on(store.delete("members", "id", &[RowId::Int(10)])).unwrap();
        tokio_test::block_on(store.delete("families", "id", &[RowId::Int(1)])).unwrap();
        assert!(store.rows("families").is_empty());
    }

    #[test]
    fn test_injected_read_failure() {
        let store = families();
        store.fail_reads_on("families");
        let err = tokio_test::block_on(store.snapshot("families", "id")).unwrap_err();
        assert_eq!(err.code(), "READ_ERROR");

        store.heal();
        assert!(tokio_test::block_on(store.snapshot("families", "id")).is_ok());
    }

    #[test]
    fn test_missing_table_is_read_error() {
        let store = MemoryStore::new("primary");
        let err = tokio_test::block_on(store.columns("anbiyam")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
