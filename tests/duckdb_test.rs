//! Reconciliation between real DuckDB databases.

use parish_sync::config::DuckDbConfig;
use parish_sync::{
    DuckDbStore, ReconcileOptions, RowId, Store, SyncConfig, SyncService, TableSpec, reconcile,
};
use serde_json::json;

const SCHEMA: &str = r#"
    CREATE TABLE families (id INTEGER PRIMARY KEY, head_name VARCHAR, registered DATE);
    CREATE TABLE members (
        id INTEGER PRIMARY KEY,
        family_id INTEGER,
        name VARCHAR,
        active BOOLEAN
    );
"#;

fn tables() -> Vec<TableSpec> {
    vec![
        TableSpec::new("families"),
        TableSpec::new("members").depends_on(["families"]),
    ]
}

fn store(name: &str, seed: &str) -> DuckDbStore {
    let store = DuckDbStore::open_in_memory(name).unwrap();
    store.execute_batch(SCHEMA).unwrap();
    if !seed.trim().is_empty() {
        store.execute_batch(seed).unwrap();
    }
    store
}

#[tokio::test]
async fn test_push_between_duckdb_stores() {
    let replica = store(
        "replica",
        r#"
        INSERT INTO families VALUES (1, 'X', '2024-01-15'), (2, 'NEW', NULL), (3, 'A', NULL);
        INSERT INTO members VALUES (10, 1, 'Anna', true), (20, 2, 'Ravi', false);
        "#,
    );
    let primary = store(
        "primary",
        r#"
        INSERT INTO families VALUES (2, 'OLD', NULL), (3, 'A', NULL), (4, 'Y', NULL);
        INSERT INTO members VALUES (40, 4, 'Paul', true);
        "#,
    );

    let report = reconcile(&replica, &primary, &tables(), &ReconcileOptions::default())
        .await
        .unwrap();
    assert_eq!(report.total_deleted(), 2);

    let families = primary.snapshot("families", "id").await.unwrap();
    let ids: Vec<&RowId> = families.ids().collect();
    assert_eq!(ids, vec![&RowId::Int(1), &RowId::Int(2), &RowId::Int(3)]);
    assert_eq!(families.rows[&RowId::Int(2)].get("head_name"), Some(&json!("NEW")));
    assert_eq!(
        families.rows[&RowId::Int(1)].get("registered"),
        Some(&json!("2024-01-15"))
    );

    let members = primary.snapshot("members", "id").await.unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members.rows[&RowId::Int(20)].get("active"), Some(&json!(false)));
}

#[tokio::test]
async fn test_duckdb_schema_mismatch() {
    let replica = store("replica", "ALTER TABLE families ADD COLUMN photo VARCHAR;");
    let primary = store("primary", "");

    let err = reconcile(&replica, &primary, &tables(), &ReconcileOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SCHEMA_MISMATCH");
    assert_eq!(err.table(), Some("families"));
}

#[tokio::test]
async fn test_service_from_config_files() {
    let dir = tempfile::tempdir().unwrap();
    let primary_path = dir.path().join("primary.duckdb");
    let replica_path = dir.path().join("replica.duckdb");

    {
        let open = |path: &std::path::Path| {
            DuckDbStore::open(
                "setup",
                &DuckDbConfig {
                    path: path.to_string_lossy().into_owned(),
                },
            )
            .unwrap()
        };
        let primary = open(&primary_path);
        primary.execute_batch(SCHEMA).unwrap();
        primary
            .execute_batch("INSERT INTO families VALUES (7, 'Cloud', NULL);")
            .unwrap();
        let replica = open(&replica_path);
        replica.execute_batch(SCHEMA).unwrap();
    }

    let toml = format!(
        r#"
        [primary]
        kind = "duckdb"
        path = "{}"

        [replica]
        kind = "duckdb"
        path = "{}"

        [[tables]]
        name = "families"

        [[tables]]
        name = "members"
        depends_on = ["families"]
        "#,
        primary_path.display(),
        replica_path.display()
    );
    let config = SyncConfig::from_toml(&toml).unwrap();

    let service = SyncService::connect(&config).await.unwrap();
    let report = service.pull().await.unwrap();
    assert_eq!(report.total_upserted(), 1);

    let status = service.status().await.unwrap();
    assert_eq!(status[0].primary_rows, 1);
    assert_eq!(status[0].replica_rows, 1);
}

const RECORDS: &str = r#"
    CREATE TABLE records (
        id INTEGER PRIMARY KEY,
        certificate BLOB,
        mass_time TIME,
        baptised_at TIMESTAMP,
        offering DECIMAL(20,2)
    );
"#;

fn records_store(name: &str, seed: &str) -> DuckDbStore {
    let store = DuckDbStore::open_in_memory(name).unwrap();
    store.execute_batch(RECORDS).unwrap();
    if !seed.trim().is_empty() {
        store.execute_batch(seed).unwrap();
    }
    store
}

#[tokio::test]
async fn test_typed_columns_converge_and_stay_converged() {
    let replica = records_store(
        "replica",
        r#"
        INSERT INTO records VALUES
            (1, '\x01\x02\xFF'::BLOB, TIME '07:00:00', TIMESTAMP '2024-03-31 09:30:15.25', 12345678901234567.89),
            (2, NULL, TIME '18:45:30.5', NULL, 0.10);
        "#,
    );
    let primary = records_store(
        "primary",
        "INSERT INTO records VALUES (2, '\\x00'::BLOB, TIME '06:00:00', NULL, 5.00), (3, NULL, NULL, NULL, NULL);",
    );
    let specs = vec![TableSpec::new("records")];
    let options = ReconcileOptions::default();

    reconcile(&replica, &primary, &specs, &options).await.unwrap();

    let source = replica.snapshot("records", "id").await.unwrap();
    let destination = primary.snapshot("records", "id").await.unwrap();
    assert_eq!(source.rows, destination.rows);

    let first = &destination.rows[&RowId::Int(1)];
    assert_eq!(first.get("certificate"), Some(&json!("\\x0102ff")));
    assert_eq!(first.get("mass_time"), Some(&json!("07:00:00")));
    assert_eq!(first.get("baptised_at"), Some(&json!("2024-03-31T09:30:15.25")));
    assert_eq!(
        first.get("offering").map(|v| v.to_string()),
        Some("12345678901234567.89".to_string())
    );

    let again = reconcile(&replica, &primary, &specs, &options).await.unwrap();
    assert_eq!(again.total_upserted(), 0);
    assert_eq!(again.total_deleted(), 0);
}

#[tokio::test]
async fn test_unsupported_column_type_stops_before_writes() {
    let replica = records_store("replica", "ALTER TABLE records ADD COLUMN tags VARCHAR[];");
    let primary = records_store("primary", "ALTER TABLE records ADD COLUMN tags VARCHAR[];");
    replica
        .execute_batch("INSERT INTO records (id, tags) VALUES (1, ['a']);")
        .unwrap();

    let err = reconcile(
        &replica,
        &primary,
        &[TableSpec::new("records")],
        &ReconcileOptions::default(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), "READ_ERROR");
    assert!(err.to_string().contains("tags"));
    assert_eq!(primary.count("records").await.unwrap(), 0);
}

#[tokio::test]
async fn test_slow_snapshot_times_out() {
    let replica = DuckDbStore::open_in_memory("replica").unwrap();
    let primary = DuckDbStore::open_in_memory("primary").unwrap();
    for store in [&replica, &primary] {
        store
            .execute_batch("CREATE TABLE big (id BIGINT PRIMARY KEY, label VARCHAR);")
            .unwrap();
    }
    replica
        .execute_batch("INSERT INTO big SELECT range, 'x' || range FROM range(200000);")
        .unwrap();

    let options = ReconcileOptions {
        statement_timeout: std::time::Duration::from_millis(1),
        ..ReconcileOptions::default()
    };
    let err = reconcile(&replica, &primary, &[TableSpec::new("big")], &options)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "READ_ERROR");
    assert!(err.to_string().contains("timed out"), "{err}");

    // The abandoned call releases the connection.
    assert_eq!(replica.count("big").await.unwrap(), 200000);
    assert_eq!(primary.count("big").await.unwrap(), 0);
}
