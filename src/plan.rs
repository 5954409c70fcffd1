//! Differ: turns a source and a destination snapshot into a reconciliation plan.

use crate::error::{Error, Result};
use crate::row::{Row, RowId, TableSnapshot};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

/// Writes needed to make one destination table match its source.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationPlan {
    /// Table name
    pub table: String,
    /// Column list every upserted row carries, in source ordinal order
    pub columns: Vec<String>,
    /// Every source row, in id order
    pub to_upsert: Vec<Row>,
    /// Destination ids absent from the source, in id order
    pub to_delete: Vec<RowId>,
}

impl ReconciliationPlan {
    /// Number of rows to upsert.
    pub fn upsert_count(&self) -> usize {
        self.to_upsert.len()
    }

    /// Number of ids to delete.
    pub fn delete_count(&self) -> usize {
        self.to_delete.len()
    }
}

/// Check two column lists (and an optional explicit contract) agree as sets.
///
/// With a non-empty `contract`, each side is checked against the contract;
/// otherwise the destination is checked against the source. The error names
/// the store whose columns disagree.
pub fn check_columns(
    table: &str,
    contract: &[String],
    source_store: &str,
    source: &[String],
    destination_store: &str,
    destination: &[String],
) -> Result<()> {
    let source_set: BTreeSet<&str> = source.iter().map(String::as_str).collect();
    let destination_set: BTreeSet<&str> = destination.iter().map(String::as_str).collect();

    if contract.is_empty() {
        return compare_sets(table, destination_store, &source_set, &destination_set);
    }

    let contract_set: BTreeSet<&str> = contract.iter().map(String::as_str).collect();
    compare_sets(table, source_store, &contract_set, &source_set)?;
    compare_sets(table, destination_store, &contract_set, &destination_set)
}

fn compare_sets(
    table: &str,
    store: &str,
    expected: &BTreeSet<&str>,
    actual: &BTreeSet<&str>,
) -> Result<()> {
    if expected == actual {
        return Ok(());
    }

    let missing = expected.difference(actual).map(|c| c.to_string()).collect();
    let unexpected = actual.difference(expected).map(|c| c.to_string()).collect();
    Err(Error::schema_mismatch(table, store, missing, unexpected))
}

/// Compute the plan for one table.
///
/// Every source row is upserted unconditionally; unchanged rows are rewritten.
/// Every destination id missing from the source is deleted, so an empty source
/// table empties the destination table.
pub fn diff(
    source: &TableSnapshot,
    destination: &TableSnapshot,
    contract: &[String],
) -> Result<ReconciliationPlan> {
    check_columns(
        &source.table,
        contract,
        &source.store,
        &source.columns,
        &destination.store,
        &destination.columns,
    )?;
    check_rows(source)?;
    check_rows(destination)?;

    let to_upsert: Vec<Row> = source.rows.values().cloned().collect();
    let to_delete: Vec<RowId> = destination
        .rows
        .keys()
        .filter(|id| !source.rows.contains_key(id))
        .cloned()
        .collect();

    debug!(
        "Planned {}: {} upserts, {} deletes",
        source.table,
        to_upsert.len(),
        to_delete.len()
    );

    Ok(ReconciliationPlan {
        table: source.table.clone(),
        columns: source.columns.clone(),
        to_upsert,
        to_delete,
    })
}

/// Every row must carry exactly the snapshot's columns.
fn check_rows(snapshot: &TableSnapshot) -> Result<()> {
    let expected = snapshot.column_set();
    for row in snapshot.rows.values() {
        let actual: BTreeSet<&str> = row.columns().collect();
        if actual != expected {
            return compare_sets(&snapshot.table, &snapshot.store, &expected, &actual);
        }
    }
    Ok(())
}
