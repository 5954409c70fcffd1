//! Command-line surface.

use assert_cmd::Command;
use parish_sync::config::DuckDbConfig;
use parish_sync::{DuckDbStore, RowId, Store};
use predicates::prelude::*;
use std::path::Path;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("parish-sync").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("DATABASE_URL")
        .env_remove("PRIMARY_DATABASE_URL");
    cmd
}

fn open(path: &Path) -> DuckDbStore {
    DuckDbStore::open(
        "check",
        &DuckDbConfig {
            path: path.to_string_lossy().into_owned(),
        },
    )
    .unwrap()
}

/// Two DuckDB files with an `anbiyam` table and a config pointing at them.
fn fixture(dir: &Path) -> std::path::PathBuf {
    let primary = dir.join("primary.duckdb");
    let replica = dir.join("replica.duckdb");
    {
        let p = open(&primary);
        p.execute_batch("CREATE TABLE anbiyam (id INTEGER PRIMARY KEY, name VARCHAR);")
            .unwrap();
        p.execute_batch("INSERT INTO anbiyam VALUES (1, 'Stale');").unwrap();
        let r = open(&replica);
        r.execute_batch("CREATE TABLE anbiyam (id INTEGER PRIMARY KEY, name VARCHAR);")
            .unwrap();
        r.execute_batch("INSERT INTO anbiyam VALUES (2, 'St. Thomas'), (3, 'St. Jude');")
            .unwrap();
    }

    let config = dir.join("parish-sync.toml");
    std::fs::write(
        &config,
        format!(
            "[primary]\nkind = \"duckdb\"\npath = \"{}\"\n\n[replica]\nkind = \"duckdb\"\npath = \"{}\"\n\n[[tables]]\nname = \"anbiyam\"\n",
            primary.display(),
            replica.display()
        ),
    )
    .unwrap();
    config
}

#[test]
fn test_init_writes_sample_config() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("parish-sync.toml");

    cli()
        .args(["init", "--output"])
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));

    let content = std::fs::read_to_string(&output).unwrap();
    assert!(content.contains("[primary]"));
    assert!(parish_sync::SyncConfig::from_toml(&content).is_ok());
}

#[test]
fn test_missing_config_file_fails() {
    cli()
        .args(["--config", "/nonexistent/parish-sync.toml", "push"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn test_plan_json_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixture(dir.path());

    cli()
        .arg("--config")
        .arg(&config)
        .args(["--json", "plan", "--direction", "push"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"dry_run\": true"));

    let primary = open(&dir.path().join("primary.duckdb"));
    let rt = tokio::runtime::Runtime::new().unwrap();
    let snapshot = rt.block_on(primary.snapshot("anbiyam", "id")).unwrap();
    assert!(snapshot.rows.contains_key(&RowId::Int(1)));
}

#[test]
fn test_push_reconciles_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixture(dir.path());

    cli()
        .arg("--config")
        .arg(&config)
        .arg("push")
        .assert()
        .success()
        .stdout(predicate::str::contains("Sync complete"));

    let primary = open(&dir.path().join("primary.duckdb"));
    let rt = tokio::runtime::Runtime::new().unwrap();
    let snapshot = rt.block_on(primary.snapshot("anbiyam", "id")).unwrap();
    let ids: Vec<&RowId> = snapshot.ids().collect();
    assert_eq!(ids, vec![&RowId::Int(2), &RowId::Int(3)]);
}

#[test]
fn test_unknown_direction_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixture(dir.path());

    cli()
        .arg("--config")
        .arg(&config)
        .args(["plan", "--direction", "sideways"])
        .assert()
        .failure();
}
