//! Run counters for parish-sync.
//!
//! Every run is counted twice: in the in-process [`Metrics`] exposed by the
//! status endpoint, and through the `metrics` facade so an installed recorder
//! (Prometheus or similar) picks the same numbers up.

use crate::sync::{Direction, RunReport};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector for reconciliation runs.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Runs attempted
    pub runs_total: AtomicU64,
    /// Runs that completed
    pub runs_completed: AtomicU64,
    /// Runs that failed
    pub runs_failed: AtomicU64,
    /// Push runs attempted
    pub pushes: AtomicU64,
    /// Pull runs attempted
    pub pulls: AtomicU64,
    /// Rows upserted by completed runs
    pub rows_upserted: AtomicU64,
    /// Rows deleted by completed runs
    pub rows_deleted: AtomicU64,
    /// Tables reconciled by completed runs
    pub tables_reconciled: AtomicU64,
    /// Total duration of completed runs in milliseconds
    pub run_duration_ms: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a run; `report` is `None` when it failed.
    pub fn record_run(&self, direction: Direction, report: Option<&RunReport>) {
        self.runs_total.fetch_add(1, Ordering::Relaxed);
        match direction {
            Direction::Push => self.pushes.fetch_add(1, Ordering::Relaxed),
            Direction::Pull => self.pulls.fetch_add(1, Ordering::Relaxed),
        };

        let outcome = match report {
            Some(report) => {
                let upserted = report.total_upserted() as u64;
                let deleted = report.total_deleted() as u64;

                self.runs_completed.fetch_add(1, Ordering::Relaxed);
                self.rows_upserted.fetch_add(upserted, Ordering::Relaxed);
                self.rows_deleted.fetch_add(deleted, Ordering::Relaxed);
                self.tables_reconciled
                    .fetch_add(report.tables.len() as u64, Ordering::Relaxed);
                self.run_duration_ms
                    .fetch_add(report.duration_ms, Ordering::Relaxed);

                ::metrics::counter!("parish_sync_rows_upserted_total", "direction" => direction.as_str())
                    .increment(upserted);
                ::metrics::counter!("parish_sync_rows_deleted_total", "direction" => direction.as_str())
                    .increment(deleted);
                "completed"
            }
            None => {
                self.runs_failed.fetch_add(1, Ordering::Relaxed);
                "failed"
            }
        };

        ::metrics::counter!(
            "parish_sync_runs_total",
            "direction" => direction.as_str(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Get snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_total: self.runs_total.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            pushes: self.pushes.load(Ordering::Relaxed),
            pulls: self.pulls.load(Ordering::Relaxed),
            rows_upserted: self.rows_upserted.load(Ordering::Relaxed),
            rows_deleted: self.rows_deleted.load(Ordering::Relaxed),
            tables_reconciled: self.tables_reconciled.load(Ordering::Relaxed),
            run_duration_ms: self.run_duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    /// Runs attempted
    pub runs_total: u64,
    /// Runs that completed
    pub runs_completed: u64,
    /// Runs that failed
    pub runs_failed: u64,
    /// Push runs attempted
    pub pushes: u64,
    /// Pull runs attempted
    pub pulls: u64,
    /// Rows upserted by completed runs
    pub rows_upserted: u64,
    /// Rows deleted by completed runs
    pub rows_deleted: u64,
    /// Tables reconciled by completed runs
    pub tables_reconciled: u64,
    /// Total duration of completed runs in milliseconds
    pub run_duration_ms: u64,
}

impl MetricsSnapshot {
    /// Share of runs that completed.
    pub fn success_rate(&self) -> f64 {
        if self.runs_total == 0 {
            0.0
        } else {
            self.runs_completed as f64 / self.runs_total as f64
        }
    }

    /// Average duration of a completed run.
    pub fn avg_run_duration_ms(&self) -> f64 {
        if self.runs_completed == 0 {
            0.0
        } else {
            self.run_duration_ms as f64 / self.runs_completed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::TableReport;

    fn report(upserted: usize, deleted: usize) -> RunReport {
        RunReport {
            run_id: uuid::Uuid::new_v4(),
            source: "replica".into(),
            destination: "primary".into(),
            dry_run: false,
            tables: vec![TableReport {
                table: "families".into(),
                source_rows: upserted,
                destination_rows: upserted + deleted,
                upserted,
                deleted,
                duration_ms: 40,
            }],
            duration_ms: 40,
            completed_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_run(Direction::Push, Some(&report(100, 5)));
        metrics.record_run(Direction::Pull, None);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.runs_total, 2);
        assert_eq!(snapshot.runs_completed, 1);
        assert_eq!(snapshot.runs_failed, 1);
        assert_eq!(snapshot.pushes, 1);
        assert_eq!(snapshot.pulls, 1);
        assert_eq!(snapshot.rows_upserted, 100);
        assert_eq!(snapshot.rows_deleted, 5);
        assert_eq!(snapshot.tables_reconciled, 1);
    }

    #[test]
    fn test_metrics_calculations() {
        let snapshot = MetricsSnapshot {
            runs_total: 10,
            runs_completed: 8,
            runs_failed: 2,
            run_duration_ms: 4000,
            ..Default::default()
        };

        assert!((snapshot.success_rate() - 0.8).abs() < 0.001);
        assert!((snapshot.avg_run_duration_ms() - 500.0).abs() < 0.001);
        assert_eq!(MetricsSnapshot::default().success_rate(), 0.0);
    }
}
