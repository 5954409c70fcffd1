//! DuckDB store for the offline replica.
//!
//! DuckDB calls are synchronous, so every store call runs on tokio's blocking
//! pool. Dropping the call's future (a statement timeout does this) interrupts
//! the statement in flight and stops the row loop of a snapshot.
//!
//! Values are converted per column type so that a row read here and written
//! back, or written to PostgreSQL, keeps its value: BLOBs travel as `\x` hex
//! text (PostgreSQL's bytea format), DECIMALs as exact JSON numbers, times and
//! timestamps as ISO text.

use crate::config::DuckDbConfig;
use crate::error::{Error, Result, WriteOp};
use crate::row::{Row, RowId, TableSnapshot};
use crate::store::{Store, column_list, on_conflict_clause, quote_ident};
use async_trait::async_trait;
use duckdb::types::{TimeUnit, Value};
use duckdb::{Connection, InterruptHandle};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument, warn};

/// How values of a column are converted to and from JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Plain,
    Blob,
    Decimal,
    Timestamp,
    TimestampTz,
    Unsupported,
}

impl ColumnKind {
    /// Classify an `information_schema.columns.data_type` string.
    fn from_data_type(data_type: &str) -> Self {
        let t = data_type.trim().to_ascii_uppercase();
        if t.ends_with(']')
            || t.starts_with("STRUCT")
            || t.starts_with("MAP")
            || t.starts_with("UNION")
            || t == "TIME WITH TIME ZONE"
            || t == "BIT"
        {
            ColumnKind::Unsupported
        } else if t == "BLOB" || t == "BYTEA" || t == "VARBINARY" {
            ColumnKind::Blob
        } else if t.starts_with("DECIMAL") || t.starts_with("NUMERIC") {
            ColumnKind::Decimal
        } else if t == "TIMESTAMP WITH TIME ZONE" || t == "TIMESTAMPTZ" {
            ColumnKind::TimestampTz
        } else if t.starts_with("TIMESTAMP") {
            ColumnKind::Timestamp
        } else {
            ColumnKind::Plain
        }
    }
}

#[derive(Debug, Clone)]
struct ColumnInfo {
    name: String,
    data_type: String,
    kind: ColumnKind,
}

/// Store backed by an embedded DuckDB database.
pub struct DuckDbStore {
    name: String,
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl DuckDbStore {
    /// Open (or create) the database file named in `config`.
    #[instrument(skip(config), fields(path = %config.path))]
    pub fn open(name: &str, config: &DuckDbConfig) -> Result<Self> {
        info!("Opening DuckDB replica...");

        let conn = if config.path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(&config.path)
        }
        .map_err(|e| Error::connection(name, "Failed to open database", e))?;

        info!("Opened DuckDB database: {}", config.path);
        Ok(Self {
            name: name.to_string(),
            interrupt: conn.interrupt_handle(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(name: &str) -> Result<Self> {
        Self::open(
            name,
            &DuckDbConfig {
                path: ":memory:".into(),
            },
        )
    }

    /// Execute batch SQL (schema setup, fixtures).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute_batch(sql)
            .map_err(|e| Error::write(&self.name, "", WriteOp::Upsert, "Execute batch failed", e))
    }

    /// Run `op` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &AtomicBool) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let call = Arc::new(CallState::default());
        let guard = CancelOnDrop {
            interrupt: Arc::clone(&self.interrupt),
            call: Arc::clone(&call),
            armed: true,
        };

        let task = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let result = op(&conn, &call.cancelled);

            *call.finished.lock().unwrap_or_else(PoisonError::into_inner) = true;
            if call.cancelled.load(Ordering::Acquire) {
                // An interrupt that landed after the last statement is still
                // pending on the connection; spend it here.
                let _ = conn.execute_batch("SELECT 1");
            }
            result
        });
        let outcome = task.await;
        guard.disarm();

        match outcome {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(Error::connection(&self.name, "DuckDB task cancelled", e)),
        }
    }
}

#[derive(Default)]
struct CallState {
    finished: Mutex<bool>,
    cancelled: AtomicBool,
}

/// Interrupts the running statement when a call is abandoned mid-flight.
struct CancelOnDrop {
    interrupt: Arc<InterruptHandle>,
    call: Arc<CallState>,
    armed: bool,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let finished = self.call.finished.lock().unwrap_or_else(PoisonError::into_inner);
        if !*finished {
            self.call.cancelled.store(true, Ordering::Release);
            self.interrupt.interrupt();
            warn!("DuckDB call abandoned; interrupting statement");
        }
    }
}

fn table_columns(conn: &Connection, table: &str) -> duckdb::Result<Vec<ColumnInfo>> {
    let query = "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = ? \
                 ORDER BY ordinal_position";

    let mut stmt = conn.prepare(query)?;
    let rows = stmt.query_map(duckdb::params![table], |row| {
        let name: String = row.get(0)?;
        let data_type: String = row.get(1)?;
        Ok(ColumnInfo {
            kind: ColumnKind::from_data_type(&data_type),
            name,
            data_type,
        })
    })?;
    rows.collect()
}

/// Columns of an existing table whose types this store can carry.
fn readable_columns(conn: &Connection, store: &str, table: &str) -> Result<Vec<ColumnInfo>> {
    let columns = table_columns(conn, table)
        .map_err(|e| Error::read(store, table, "Column introspection failed", e))?;

    if columns.is_empty() {
        return Err(Error::read_msg(
            store,
            table,
            "table does not exist or has no columns",
        ));
    }
    if let Some(c) = columns.iter().find(|c| c.kind == ColumnKind::Unsupported) {
        return Err(Error::read_msg(
            store,
            table,
            format!("column {} has unsupported type {}", c.name, c.data_type),
        ));
    }
    Ok(columns)
}

#[async_trait]
impl Store for DuckDbStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        let store = self.name.clone();
        self.blocking(move |conn, _| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))
                .map_err(|e| Error::read(&store, "", "Ping failed", e))?;
            Ok(())
        })
        .await
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>> {
        let (store, table) = (self.name.clone(), table.to_string());
        self.blocking(move |conn, _| {
            let columns = readable_columns(conn, &store, &table)?;
            Ok(columns.into_iter().map(|c| c.name).collect())
        })
        .await
    }

    #[instrument(skip(self), fields(store = %self.name))]
    async fn snapshot(&self, table: &str, key_column: &str) -> Result<TableSnapshot> {
        let (store, table) = (self.name.clone(), table.to_string());
        let key_column = key_column.to_string();

        self.blocking(move |conn, cancelled| {
            let columns = readable_columns(conn, &store, &table)?;
            let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

            let query = format!("SELECT {} FROM {}", column_list(&names), quote_ident(&table));
            debug!("Executing query: {}", query);

            let mut stmt = conn
                .prepare(&query)
                .map_err(|e| Error::read(&store, &table, "Prepare snapshot failed", e))?;
            let mut rows = stmt
                .query([])
                .map_err(|e| Error::read(&store, &table, "Snapshot query failed", e))?;

            let mut parsed = Vec::new();
            while let Some(row) = rows
                .next()
                .map_err(|e| Error::read(&store, &table, "Snapshot fetch failed", e))?
            {
                if cancelled.load(Ordering::Acquire) {
                    return Err(Error::read_msg(&store, &table, "snapshot cancelled"));
                }

                let mut out = Row::new();
                for (i, column) in columns.iter().enumerate() {
                    let value: Value = row
                        .get(i)
                        .map_err(|e| Error::read(&store, &table, "Undecodable value", e))?;
                    let json = duck_to_json(value, column.kind).map_err(|msg| {
                        Error::read_msg(&store, &table, format!("column {}: {}", column.name, msg))
                    })?;
                    out.insert(column.name.clone(), json);
                }
                parsed.push(out);
            }

            debug!("Fetched {} rows from {}", parsed.len(), table);
            TableSnapshot::from_rows(&table, &store, names, &key_column, parsed)
                .map_err(|e| Error::read_msg(&store, &table, e.to_string()))
        })
        .await
    }

    #[instrument(skip(self, columns, rows), fields(store = %self.name, count = rows.len()))]
    async fn upsert(
        &self,
        table: &str,
        key_column: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let (store, table) = (self.name.clone(), table.to_string());
        let (key_column, columns) = (key_column.to_string(), columns.to_vec());
        let rows = rows.to_vec();

        self.blocking(move |conn, _| {
            let write_err = |msg: &str, e: duckdb::Error| {
                Error::write(&store, &table, WriteOp::Upsert, msg, e)
            };

            let known = table_columns(conn, &table)
                .map_err(|e| write_err("Column introspection failed", e))?;
            let kinds: Vec<ColumnKind> = columns
                .iter()
                .map(|c| {
                    known
                        .iter()
                        .find(|k| &k.name == c)
                        .map_or(ColumnKind::Plain, |k| k.kind)
                })
                .collect();

            // Build bulk VALUES clause for all rows
            let tuple = format!("({})", vec!["?"; columns.len()].join(", "));
            let query = format!(
                "INSERT INTO {} ({}) VALUES {} {}",
                quote_ident(&table),
                column_list(&columns),
                vec![tuple.as_str(); rows.len()].join(", "),
                on_conflict_clause(&key_column, &columns)
            );

            let mut params: Vec<Value> = Vec::with_capacity(rows.len() * columns.len());
            for row in &rows {
                for ((value, column), kind) in row.values_for(&columns).zip(&columns).zip(&kinds) {
                    let bound = json_to_duck(value, *kind).map_err(|msg| {
                        Error::write_msg(
                            &store,
                            &table,
                            WriteOp::Upsert,
                            format!("column {}: {}", column, msg),
                        )
                    })?;
                    params.push(bound);
                }
            }

            let affected = conn
                .execute(&query, duckdb::params_from_iter(params.iter()))
                .map_err(|e| write_err("Bulk upsert failed", e))?;

            debug!("Bulk upserted {} rows to {}", affected, table);
            Ok(affected as u64)
        })
        .await
    }

    #[instrument(skip(self, ids), fields(store = %self.name, count = ids.len()))]
    async fn delete(&self, table: &str, key_column: &str, ids: &[RowId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let query = format!(
            "DELETE FROM {} WHERE {} IN ({})",
            quote_ident(table),
            quote_ident(key_column),
            vec!["?"; ids.len()].join(", ")
        );
        let params: Vec<Value> = ids
            .iter()
            .map(|id| match id {
                RowId::Int(i) => Value::BigInt(*i),
                RowId::Text(s) => Value::Text(s.clone()),
            })
            .collect();
        let (store, table) = (self.name.clone(), table.to_string());

        self.blocking(move |conn, _| {
            let affected = conn
                .execute(&query, duckdb::params_from_iter(params.iter()))
                .map_err(|e| Error::write(&store, &table, WriteOp::Delete, "Delete failed", e))?;

            debug!("Deleted {} rows from {}", affected, table);
            Ok(affected as u64)
        })
        .await
    }

    async fn count(&self, table: &str) -> Result<i64> {
        let query = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let (store, table) = (self.name.clone(), table.to_string());

        self.blocking(move |conn, _| {
            conn.query_row(&query, [], |row| row.get(0))
                .map_err(|e| Error::read(&store, &table, "Count failed", e))
        })
        .await
    }
}

fn micros(unit: TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v.saturating_mul(1_000_000),
        TimeUnit::Millisecond => v.saturating_mul(1_000),
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

/// Convert a DuckDB value into JSON, matching what PostgreSQL's
/// `row_to_json` produces for the same column types.
fn duck_to_json(value: Value, kind: ColumnKind) -> std::result::Result<JsonValue, String> {
    let json = match value {
        Value::Null => JsonValue::Null,
        Value::Boolean(b) => JsonValue::Bool(b),
        Value::TinyInt(n) => n.into(),
        Value::SmallInt(n) => n.into(),
        Value::Int(n) => n.into(),
        Value::BigInt(n) => n.into(),
        Value::UTinyInt(n) => n.into(),
        Value::USmallInt(n) => n.into(),
        Value::UInt(n) => n.into(),
        Value::UBigInt(n) => n.into(),
        Value::HugeInt(n) => n
            .to_string()
            .parse::<serde_json::Number>()
            .map(JsonValue::Number)
            .map_err(|e| e.to_string())?,
        Value::Float(f) => float_to_json(f as f64),
        Value::Double(f) => float_to_json(f),
        Value::Decimal(d) => d
            .to_string()
            .parse::<serde_json::Number>()
            .map(JsonValue::Number)
            .map_err(|e| format!("decimal {}: {}", d, e))?,
        Value::Text(s) => JsonValue::String(s),
        Value::Enum(s) => JsonValue::String(s),
        Value::Blob(b) => JsonValue::String(format!("\\x{}", hex::encode(b))),
        Value::Date32(days) => chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days as i64)))
            .map(|d| JsonValue::String(d.format("%Y-%m-%d").to_string()))
            .ok_or_else(|| format!("date out of range: {} days", days))?,
        Value::Time64(unit, v) => {
            let us = micros(unit, v);
            let secs = u32::try_from(us.div_euclid(1_000_000))
                .map_err(|_| format!("time out of range: {}us", us))?;
            let nanos = (us.rem_euclid(1_000_000) * 1_000) as u32;
            chrono::NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
                .map(|t| JsonValue::String(trim_fraction(t.format("%H:%M:%S%.6f").to_string())))
                .ok_or_else(|| format!("time out of range: {}us", us))?
        }
        Value::Timestamp(unit, v) => {
            let us = micros(unit, v);
            let dt = chrono::DateTime::from_timestamp_micros(us)
                .ok_or_else(|| format!("timestamp out of range: {}us", us))?;
            let text = trim_fraction(dt.naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string());
            if kind == ColumnKind::TimestampTz {
                JsonValue::String(format!("{}+00:00", text))
            } else {
                JsonValue::String(text)
            }
        }
        Value::Interval {
            months,
            days,
            nanos,
        } => JsonValue::String(format!(
            "{} months {} days {} microseconds",
            months,
            days,
            nanos / 1_000
        )),
        other => return Err(format!("unsupported value {:?}", other)),
    };
    Ok(json)
}

/// Drop trailing zeros of fractional seconds, as PostgreSQL prints them.
fn trim_fraction(mut text: String) -> String {
    if text.contains('.') {
        let kept = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(kept);
    }
    text
}

fn float_to_json(f: f64) -> JsonValue {
    serde_json::Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

/// Convert a JSON value into a bindable DuckDB value; the column type does
/// the final cast from text.
fn json_to_duck(value: &JsonValue, kind: ColumnKind) -> std::result::Result<Value, String> {
    let bound = match (value, kind) {
        (JsonValue::Null, _) => Value::Null,
        (JsonValue::String(s), ColumnKind::Blob) => {
            let digits = s
                .strip_prefix("\\x")
                .ok_or_else(|| "expected \\x hex text for a BLOB".to_string())?;
            Value::Blob(hex::decode(digits).map_err(|e| e.to_string())?)
        }
        // Exact digits; going through f64 would round.
        (JsonValue::Number(n), ColumnKind::Decimal) => Value::Text(n.to_string()),
        (JsonValue::Bool(b), _) => Value::Boolean(*b),
        (JsonValue::Number(n), _) => {
            if let Some(i) = n.as_i64() {
                Value::BigInt(i)
            } else if let Some(u) = n.as_u64() {
                Value::UBigInt(u)
            } else {
                Value::Double(n.as_f64().ok_or_else(|| format!("number {} out of range", n))?)
            }
        }
        (JsonValue::String(s), _) => Value::Text(s.clone()),
        (JsonValue::Array(_) | JsonValue::Object(_), _) => Value::Text(value.to_string()),
    };
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn families() -> DuckDbStore {
        let store = DuckDbStore::open_in_memory("replica").unwrap();
        store
            .execute_batch(
                "CREATE TABLE families (
                    id INTEGER PRIMARY KEY,
                    head_name VARCHAR,
                    active BOOLEAN,
                    registered DATE
                );
                INSERT INTO families VALUES (2, 'OLD', true, DATE '2023-06-01'), (4, 'Y', false, NULL);",
            )
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_columns_in_ordinal_order() {
        let store = families();
        assert_eq!(
            store.columns("families").await.unwrap(),
            vec!["id", "head_name", "active", "registered"]
        );
        assert_eq!(store.columns("missing").await.unwrap_err().code(), "READ_ERROR");
    }

    #[tokio::test]
    async fn test_unsupported_column_type_is_read_error() {
        let store = DuckDbStore::open_in_memory("replica").unwrap();
        store
            .execute_batch("CREATE TABLE sacraments (id INTEGER PRIMARY KEY, godparents VARCHAR[]);")
            .unwrap();

        let err = store.columns("sacraments").await.unwrap_err();
        assert_eq!(err.code(), "READ_ERROR");
        assert!(err.to_string().contains("godparents"));
    }

    #[tokio::test]
    async fn test_snapshot_converts_values() {
        let store = families();
        let snap = store.snapshot("families", "id").await.unwrap();

        assert_eq!(snap.len(), 2);
        let row = &snap.rows[&RowId::Int(2)];
        assert_eq!(row.get("head_name"), Some(&json!("OLD")));
        assert_eq!(row.get("active"), Some(&json!(true)));
        assert_eq!(row.get("registered"), Some(&json!("2023-06-01")));
        assert_eq!(snap.rows[&RowId::Int(4)].get("registered"), Some(&JsonValue::Null));
    }

    #[tokio::test]
    async fn test_upsert_inserts_and_overwrites() {
        let store = families();
        let columns: Vec<String> = ["id", "head_name", "active", "registered"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        let rows = vec![
            Row::new()
                .with("id", 1)
                .with("head_name", "X")
                .with("active", true)
                .with("registered", "2024-01-15"),
            Row::new()
                .with("id", 2)
                .with("head_name", "NEW")
                .with("active", false)
                .with("registered", JsonValue::Null),
        ];

        store.upsert("families", "id", &columns, &rows).await.unwrap();

        let snap = store.snapshot("families", "id").await.unwrap();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.rows[&RowId::Int(2)], rows[1]);
        assert_eq!(snap.rows[&RowId::Int(1)], rows[0]);
    }

    #[tokio::test]
    async fn test_delete_by_key() {
        let store = families();
        let removed = store
            .delete("families", "id", &[RowId::Int(4), RowId::Int(99)])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count("families").await.unwrap(), 1);
    }

    #[test]
    fn test_column_kinds() {
        assert_eq!(ColumnKind::from_data_type("BLOB"), ColumnKind::Blob);
        assert_eq!(ColumnKind::from_data_type("DECIMAL(18,2)"), ColumnKind::Decimal);
        assert_eq!(ColumnKind::from_data_type("TIMESTAMP"), ColumnKind::Timestamp);
        assert_eq!(
            ColumnKind::from_data_type("TIMESTAMP WITH TIME ZONE"),
            ColumnKind::TimestampTz
        );
        assert_eq!(ColumnKind::from_data_type("TIME"), ColumnKind::Plain);
        assert_eq!(ColumnKind::from_data_type("INTEGER[]"), ColumnKind::Unsupported);
        assert_eq!(
            ColumnKind::from_data_type("STRUCT(a INTEGER)"),
            ColumnKind::Unsupported
        );
    }

    #[test]
    fn test_json_to_duck() {
        assert_eq!(json_to_duck(&JsonValue::Null, ColumnKind::Plain), Ok(Value::Null));
        assert_eq!(json_to_duck(&json!(42), ColumnKind::Plain), Ok(Value::BigInt(42)));
        assert_eq!(json_to_duck(&json!(1.5), ColumnKind::Plain), Ok(Value::Double(1.5)));
        assert_eq!(
            json_to_duck(&json!({"a": 1}), ColumnKind::Plain),
            Ok(Value::Text(r#"{"a":1}"#.into()))
        );
        assert_eq!(
            json_to_duck(&json!("\\x0102ff"), ColumnKind::Blob),
            Ok(Value::Blob(vec![1, 2, 255]))
        );
        assert!(json_to_duck(&json!("AQI="), ColumnKind::Blob).is_err());
    }

    #[test]
    fn test_decimal_keeps_digits() {
        let n: JsonValue = serde_json::from_str("12345678901234567.89").unwrap();
        assert_eq!(
            json_to_duck(&n, ColumnKind::Decimal),
            Ok(Value::Text("12345678901234567.89".into()))
        );
    }

    #[test]
    fn test_duck_temporal_to_json() {
        let ts = duck_to_json(Value::Timestamp(TimeUnit::Second, 86_400), ColumnKind::Timestamp);
        assert_eq!(ts, Ok(json!("1970-01-02T00:00:00")));

        let tz = duck_to_json(
            Value::Timestamp(TimeUnit::Second, 86_400),
            ColumnKind::TimestampTz,
        );
        assert_eq!(tz, Ok(json!("1970-01-02T00:00:00+00:00")));

        let time = duck_to_json(
            Value::Time64(TimeUnit::Microsecond, 25_200_000_000),
            ColumnKind::Plain,
        );
        assert_eq!(time, Ok(json!("07:00:00")));

        let fraction = duck_to_json(
            Value::Timestamp(TimeUnit::Millisecond, 86_400_250),
            ColumnKind::Timestamp,
        );
        assert_eq!(fraction, Ok(json!("1970-01-02T00:00:00.25")));
    }

    #[test]
    fn test_blob_to_hex_text() {
        assert_eq!(
            duck_to_json(Value::Blob(vec![1, 2]), ColumnKind::Blob),
            Ok(json!("\\x0102"))
        );
    }
}
