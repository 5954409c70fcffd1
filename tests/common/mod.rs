//! Shared fixtures: the parish membership schema on in-memory stores.

#![allow(dead_code)]

use parish_sync::{MemoryStore, ReconcileOptions, Row, TableSpec};
use std::time::Duration;

pub fn tables() -> Vec<TableSpec> {
    vec![
        TableSpec::new("users"),
        TableSpec::new("families"),
        TableSpec::new("members").depends_on(["families"]),
        TableSpec::new("anbiyam"),
    ]
}

pub fn options() -> ReconcileOptions {
    ReconcileOptions {
        statement_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Empty store with the four tables and `members.family_id -> families`.
pub fn parish_store(name: &str) -> MemoryStore {
    let store = MemoryStore::new(name);
    store
        .create_table("users", &["id", "email", "role"])
        .create_table("families", &["id", "head_name", "zone"])
        .create_table("members", &["id", "family_id", "name"])
        .create_table("anbiyam", &["id", "name"])
        .add_foreign_key("members", "family_id", "families");
    store
}

pub fn user(id: i64, email: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("email", email)
        .with("role", "staff")
}

pub fn family(id: i64, head: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("head_name", head)
        .with("zone", "north")
}

pub fn member(id: i64, family_id: i64, name: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("family_id", family_id)
        .with("name", name)
}

pub fn anbiyam(id: i64, name: &str) -> Row {
    Row::new().with("id", id).with("name", name)
}

/// True when both stores hold identical content in every table.
pub fn same_content(a: &MemoryStore, b: &MemoryStore) -> bool {
    ["users", "families", "members", "anbiyam"]
        .iter()
        .all(|t| a.table_content(t) == b.table_content(t))
}
