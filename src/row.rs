//! Row and snapshot model.
//!
//! A [`TableSnapshot`] is the full content of one table as seen by one store at
//! read time. Rows are matched across stores only by their key column value.
//!
//! The key column holds a store-local, sequence-assigned id. Matching rows from
//! two independently-writable stores by that id assumes both sequences agree;
//! rows created on both sides while offline can collide on the same id and
//! overwrite each other. The human-facing record codes are not used for
//! matching.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Key value identifying a row within one table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum RowId {
    /// Integer key (serial/bigserial columns)
    Int(i64),
    /// Text key (uuid, varchar)
    Text(String),
}

impl RowId {
    /// Derive an id from a JSON column value. NULL, fractional numbers,
    /// booleans and composite values are not valid keys.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Number(n) => n.as_i64().map(RowId::Int),
            JsonValue::String(s) => Some(RowId::Text(s.clone())),
            _ => None,
        }
    }

    /// JSON representation for binding into statements.
    pub fn to_json(&self) -> JsonValue {
        match self {
            RowId::Int(i) => JsonValue::Number((*i).into()),
            RowId::Text(s) => JsonValue::String(s.clone()),
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowId::Int(i) => write!(f, "{}", i),
            RowId::Text(s) => write!(f, "{}", s),
        }
    }
}

// Untagged derive cannot see numbers when serde_json keeps arbitrary precision.
impl<'de> Deserialize<'de> for RowId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        RowId::from_json(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid row id: {}", value)))
    }
}

impl From<i64> for RowId {
    fn from(v: i64) -> Self {
        RowId::Int(v)
    }
}

impl From<&str> for RowId {
    fn from(v: &str) -> Self {
        RowId::Text(v.to_string())
    }
}

static NULL: JsonValue = JsonValue::Null;

/// One row: column name to value, in column-name order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, JsonValue>);

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    /// Set a column value.
    pub fn insert(&mut self, column: impl Into<String>, value: JsonValue) {
        self.0.insert(column.into(), value);
    }

    /// Get a column value.
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.0.get(column)
    }

    /// Key of this row, if the key column holds a valid id.
    pub fn id(&self, key_column: &str) -> Option<RowId> {
        self.0.get(key_column).and_then(RowId::from_json)
    }

    /// Column names present in this row.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    /// Value for each of `columns`, NULL when absent.
    pub fn values_for<'a>(&'a self, columns: &'a [String]) -> impl Iterator<Item = &'a JsonValue> {
        columns
            .iter()
            .map(|c| self.0.get(c).unwrap_or(&NULL))
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convert into a JSON object.
    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.0.into_iter().collect())
    }

    /// Build a row from a JSON object; other JSON values yield `None`.
    pub fn from_json(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) => Some(Self(map.into_iter().collect())),
            _ => None,
        }
    }
}

impl FromIterator<(String, JsonValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Why rows could not be assembled into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotDefect {
    /// A row's key column is NULL or not an integer/string
    InvalidKey {
        /// Position of the row in read order
        position: usize,
    },
    /// Two rows share a key
    DuplicateKey(RowId),
}

impl fmt::Display for SnapshotDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotDefect::InvalidKey { position } => {
                write!(f, "row {} has a missing or non-scalar key", position)
            }
            SnapshotDefect::DuplicateKey(id) => write!(f, "duplicate key {}", id),
        }
    }
}

/// Full content of one table from one store.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    /// Table name
    pub table: String,
    /// Label of the store this was read from
    pub store: String,
    /// Column names in the store's ordinal order
    pub columns: Vec<String>,
    /// Rows keyed by id
    pub rows: BTreeMap<RowId, Row>,
}

impl TableSnapshot {
    /// Assemble a snapshot, keying every row by `key_column`.
    pub fn from_rows(
        table: impl Into<String>,
        store: impl Into<String>,
        columns: Vec<String>,
        key_column: &str,
        rows: impl IntoIterator<Item = Row>,
    ) -> std::result::Result<Self, SnapshotDefect> {
        let mut keyed = BTreeMap::new();
        for (position, row) in rows.into_iter().enumerate() {
            let id = row
                .id(key_column)
                .ok_or(SnapshotDefect::InvalidKey { position })?;
            if keyed.contains_key(&id) {
                return Err(SnapshotDefect::DuplicateKey(id));
            }
            keyed.insert(id, row);
        }

        Ok(Self {
            table: table.into(),
            store: store.into(),
            columns,
            rows: keyed,
        })
    }

    /// Set of column names.
    pub fn column_set(&self) -> BTreeSet<&str> {
        self.columns.iter().map(|c| c.as_str()).collect()
    }

    /// Ids present in this snapshot.
    pub fn ids(&self) -> impl Iterator<Item = &RowId> {
        self.rows.keys()
    }

    /// Row count.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
