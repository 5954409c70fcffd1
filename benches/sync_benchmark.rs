//! Benchmarks for parish-sync planning.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use parish_sync::plan;
use parish_sync::{MemoryStore, Row, Store, TableSnapshot};

fn family(id: i64, head: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("head_name", head)
        .with("anbiyam_id", id % 12)
        .with("active", id % 7 != 0)
        .with("registered", "2024-01-15")
}

fn snapshot(store: &str, rows: Vec<Row>) -> TableSnapshot {
    let columns = ["id", "head_name", "anbiyam_id", "active", "registered"]
        .iter()
        .map(|c| c.to_string())
        .collect();
    TableSnapshot::from_rows("families", store, columns, "id", rows).unwrap()
}

/// Diff two overlapping snapshots: a third of the ids exist only on each side.
fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");
    for size in [1_000i64, 10_000] {
        let source = snapshot("replica", (0..size).map(|i| family(i, "offline")).collect());
        let destination = snapshot(
            "primary",
            (size / 3..size + size / 3).map(|i| family(i, "cloud")).collect(),
        );

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(plan::diff(&source, &destination, &[]).unwrap()))
        });
    }
    group.finish();
}

/// Snapshot read through the in-memory store.
fn bench_memory_snapshot(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = MemoryStore::new("replica");
    store.create_table(
        "families",
        &["id", "head_name", "anbiyam_id", "active", "registered"],
    );
    for i in 0..5_000 {
        store.put("families", "id", family(i, "offline"));
    }

    c.bench_function("memory_snapshot_5000", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(store.snapshot("families", "id").await.unwrap()) })
    });
}

criterion_group!(benches, bench_diff, bench_memory_snapshot);
criterion_main!(benches);
