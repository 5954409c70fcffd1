//! Reconciliation engine: one direction-agnostic controller, exposed twice.
//!
//! A run reads each configured table from both stores, diffs the snapshots and
//! makes the destination match the source. Upserts are applied table by table
//! in configured order (parents first); deletes are held back and applied in
//! reverse order (children first) once every upsert has landed. Nothing is
//! rolled back on failure: a failed run is recovered by running it again.
//!
//! No locks are taken. A write committed by someone else between the
//! destination snapshot and this run's write to the same row is overwritten or
//! survives depending on which commits last.

use crate::config::{SyncBehaviorConfig, SyncConfig, TableSpec, validate_tables};
use crate::error::{Error, Result, WriteOp};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::plan::{self, ReconciliationPlan, check_columns};
use crate::row::{RowId, TableSnapshot};
use crate::store::{Store, open_store};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

/// Which way a run copies data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Replica (offline edits) into primary
    Push,
    /// Primary into replica
    Pull,
}

impl Direction {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
        }
    }

    /// Message reported to the caller when a run completes.
    pub fn success_message(&self) -> &'static str {
        match self {
            Direction::Push => "✅ Sync complete: added, updated & deleted records.",
            Direction::Pull => "✅ Pull complete: local copy refreshed from the cloud.",
        }
    }

    /// Message reported to the caller when a run fails. Details go to the log.
    pub fn failure_message(&self) -> &'static str {
        match self {
            Direction::Push => "❌ Sync to cloud failed",
            Direction::Pull => "❌ Pull from cloud failed",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(Direction::Push),
            "pull" => Ok(Direction::Pull),
            other => Err(Error::validation(format!(
                "unknown direction '{}', expected push or pull",
                other
            ))),
        }
    }
}

/// Lifecycle of the most recent run on a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// No run yet
    Idle,
    /// A run is in flight
    Running,
    /// Last run processed every table
    Completed,
    /// Last run stopped at its first error
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// Tunables for one run.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Rows or ids per write statement
    pub batch_size: usize,
    /// Limit for every store call
    pub statement_timeout: Duration,
    /// Independent table groups run concurrently
    pub parallel_tables: usize,
    /// Compute plans without writing
    pub dry_run: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            statement_timeout: Duration::from_secs(30),
            parallel_tables: 1,
            dry_run: false,
        }
    }
}

impl ReconcileOptions {
    /// Options from the `[sync]` config section.
    pub fn from_config(config: &SyncBehaviorConfig) -> Result<Self> {
        Ok(Self {
            batch_size: config.batch_size,
            statement_timeout: config.statement_timeout()?,
            parallel_tables: config.parallel_tables,
            dry_run: false,
        })
    }
}

/// Per-table outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReport {
    /// Table name
    pub table: String,
    /// Rows in the source snapshot
    pub source_rows: usize,
    /// Rows in the destination snapshot
    pub destination_rows: usize,
    /// Rows written (or planned, for dry runs)
    pub upserted: usize,
    /// Rows deleted (or planned, for dry runs)
    pub deleted: usize,
    /// Time spent on this table in milliseconds
    pub duration_ms: u64,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique id of this run, also attached to its log span
    pub run_id: Uuid,
    /// Source store label
    pub source: String,
    /// Destination store label
    pub destination: String,
    /// True when nothing was written
    pub dry_run: bool,
    /// Tables in configured order
    pub tables: Vec<TableReport>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Timestamp when the run completed
    pub completed_at: String,
}

impl RunReport {
    /// Rows upserted across all tables.
    pub fn total_upserted(&self) -> usize {
        self.tables.iter().map(|t| t.upserted).sum()
    }

    /// Rows deleted across all tables.
    pub fn total_deleted(&self) -> usize {
        self.tables.iter().map(|t| t.deleted).sum()
    }
}

/// Make `destination` match `source` for every table in `tables`.
///
/// Tables must be listed parents first. The first error aborts the run and is
/// returned; writes already applied stay applied.
pub async fn reconcile(
    source: &dyn Store,
    destination: &dyn Store,
    tables: &[TableSpec],
    options: &ReconcileOptions,
) -> Result<RunReport> {
    validate_tables(tables)?;

    let run_id = Uuid::new_v4();
    let span = info_span!(
        "reconcile",
        %run_id,
        source = source.name(),
        destination = destination.name(),
        dry_run = options.dry_run
    );

    async move {
        let start = Instant::now();
        info!(
            "Reconciling {} tables {} -> {}",
            tables.len(),
            source.name(),
            destination.name()
        );

        let result = run_tables(source, destination, tables, options).await;
        let reports = match result {
            Ok(reports) => reports,
            Err(e) => {
                error!(
                    code = e.code(),
                    table = e.table().unwrap_or("-"),
                    "Reconciliation failed: {}",
                    e
                );
                return Err(e);
            }
        };

        let report = RunReport {
            run_id,
            source: source.name().to_string(),
            destination: destination.name().to_string(),
            dry_run: options.dry_run,
            tables: reports,
            duration_ms: start.elapsed().as_millis() as u64,
            completed_at: chrono::Utc::now().to_rfc3339(),
        };

        info!(
            "Reconciliation completed in {}ms: {} upserted, {} deleted",
            report.duration_ms,
            report.total_upserted(),
            report.total_deleted()
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

async fn run_tables(
    source: &dyn Store,
    destination: &dyn Store,
    tables: &[TableSpec],
    options: &ReconcileOptions,
) -> Result<Vec<TableReport>> {
    preflight(source, destination, tables, options).await?;

    let groups = dependency_groups(tables, options.parallel_tables);
    let mut reports: Vec<TableReport> = if groups.len() == 1 {
        run_group(source, destination, &groups[0], options).await?
    } else {
        debug!("Running {} independent table groups", groups.len());
        // Each future owns its group so the run stays `Send`.
        let runs: Vec<_> = groups
            .into_iter()
            .map(|group| run_owned_group(source, destination, group, options))
            .collect();
        futures::stream::iter(runs)
        .buffer_unordered(options.parallel_tables)
        .try_collect::<Vec<_>>()
        .await?
        .into_iter()
        .flatten()
        .collect()
    };

    // Groups finish in any order; report in configured order.
    reports.sort_by_key(|r| tables.iter().position(|t| t.name == r.table));
    Ok(reports)
}

/// `run_group` over an owned group; a named lifetime keeps the future `Send`
/// without a higher-ranked closure.
fn run_owned_group<'a>(
    source: &'a dyn Store,
    destination: &'a dyn Store,
    group: Vec<&'a TableSpec>,
    options: &'a ReconcileOptions,
) -> impl Future<Output = Result<Vec<TableReport>>> + Send + 'a {
    async move { run_group(source, destination, &group, options).await }
}

/// Compare both stores' column sets for every table before anything is
/// written.
async fn preflight(
    source: &dyn Store,
    destination: &dyn Store,
    tables: &[TableSpec],
    options: &ReconcileOptions,
) -> Result<()> {
    for spec in tables {
        let limit = options.statement_timeout;
        let src =
            with_read_timeout(source, &spec.name, limit, source.columns(&spec.name)).await?;
        let dst = with_read_timeout(
            destination,
            &spec.name,
            limit,
            destination.columns(&spec.name),
        )
        .await?;
        check_columns(
            &spec.name,
            &spec.columns,
            source.name(),
            &src,
            destination.name(),
            &dst,
        )?;

        if !src.contains(&spec.key_column) {
            return Err(Error::schema_mismatch(
                &spec.name,
                source.name(),
                vec![spec.key_column.clone()],
                vec![],
            ));
        }
    }
    Ok(())
}

/// Split tables into groups connected by `depends_on`, each in configured
/// order. With `parallel <= 1` every table lands in one group.
pub fn dependency_groups(tables: &[TableSpec], parallel: usize) -> Vec<Vec<&TableSpec>> {
    if parallel <= 1 || tables.len() <= 1 {
        return vec![tables.iter().collect()];
    }

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let mut parent: Vec<usize> = (0..tables.len()).collect();
    for (i, table) in tables.iter().enumerate() {
        for dep in &table.depends_on {
            if let Some(j) = tables.iter().position(|t| &t.name == dep) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }
    }

    let mut groups: Vec<(usize, Vec<&TableSpec>)> = Vec::new();
    for (i, table) in tables.iter().enumerate() {
        let root = find(&mut parent, i);
        match groups.iter_mut().find(|(r, _)| *r == root) {
            Some((_, members)) => members.push(table),
            None => groups.push((root, vec![table])),
        }
    }
    groups.into_iter().map(|(_, members)| members).collect()
}

/// Upsert pass in order, then delete pass in reverse order.
async fn run_group(
    source: &dyn Store,
    destination: &dyn Store,
    group: &[&TableSpec],
    options: &ReconcileOptions,
) -> Result<Vec<TableReport>> {
    let mut reports = Vec::with_capacity(group.len());
    let mut pending_deletes: Vec<Vec<RowId>> = Vec::with_capacity(group.len());

    for spec in group {
        let start = Instant::now();
        let (source_rows, destination_rows, plan) =
            plan_table(source, destination, spec, options).await?;

        if !options.dry_run {
            apply_upserts(destination, spec, &plan, options).await?;
        }

        reports.push(TableReport {
            table: spec.name.clone(),
            source_rows,
            destination_rows,
            upserted: plan.upsert_count(),
            deleted: plan.delete_count(),
            duration_ms: start.elapsed().as_millis() as u64,
        });
        pending_deletes.push(plan.to_delete);
    }

    for (i, spec) in group.iter().enumerate().rev() {
        let start = Instant::now();
        if !options.dry_run {
            apply_deletes(destination, spec, &pending_deletes[i], options).await?;
        }
        reports[i].duration_ms += start.elapsed().as_millis() as u64;
    }

    for report in &reports {
        info!(
            table = %report.table,
            "{} {}: {} upserted, {} deleted ({}ms)",
            if options.dry_run { "Planned" } else { "Reconciled" },
            report.table,
            report.upserted,
            report.deleted,
            report.duration_ms
        );
    }

    Ok(reports)
}

/// Snapshot both sides of one table and diff them.
#[instrument(skip_all, fields(table = %spec.name))]
async fn plan_table(
    source: &dyn Store,
    destination: &dyn Store,
    spec: &TableSpec,
    options: &ReconcileOptions,
) -> Result<(usize, usize, ReconciliationPlan)> {
    let source_snapshot = read_snapshot(source, spec, options.statement_timeout).await?;
    let destination_snapshot =
        read_snapshot(destination, spec, options.statement_timeout).await?;

    let plan = plan::diff(&source_snapshot, &destination_snapshot, &spec.columns)?;
    if plan.to_upsert.is_empty() && !plan.to_delete.is_empty() {
        warn!(
            "Source table {} is empty: all {} destination rows will be deleted",
            spec.name,
            plan.delete_count()
        );
    }

    Ok((source_snapshot.len(), destination_snapshot.len(), plan))
}

/// Snapshot Reader: full read of one table from one store.
pub async fn read_snapshot(
    store: &dyn Store,
    spec: &TableSpec,
    limit: Duration,
) -> Result<TableSnapshot> {
    let snapshot = with_read_timeout(
        store,
        &spec.name,
        limit,
        store.snapshot(&spec.name, &spec.key_column),
    )
    .await?;
    debug!("Read {} rows of {} from {}", snapshot.len(), spec.name, store.name());
    Ok(snapshot)
}

/// Reconciler, upsert half: write every planned row in batches.
pub async fn apply_upserts(
    destination: &dyn Store,
    spec: &TableSpec,
    plan: &ReconciliationPlan,
    options: &ReconcileOptions,
) -> Result<()> {
    for chunk in plan.to_upsert.chunks(options.batch_size.max(1)) {
        let written = with_write_timeout(
            destination,
            &spec.name,
            WriteOp::Upsert,
            options.statement_timeout,
            destination.upsert(&spec.name, &spec.key_column, &plan.columns, chunk),
        )
        .await?;
        debug!("Upserted batch of {} into {} ({} affected)", chunk.len(), spec.name, written);
    }
    Ok(())
}

/// Reconciler, delete half: remove every planned id in batches.
pub async fn apply_deletes(
    destination: &dyn Store,
    spec: &TableSpec,
    ids: &[RowId],
    options: &ReconcileOptions,
) -> Result<()> {
    for chunk in ids.chunks(options.batch_size.max(1)) {
        let removed = with_write_timeout(
            destination,
            &spec.name,
            WriteOp::Delete,
            options.statement_timeout,
            destination.delete(&spec.name, &spec.key_column, chunk),
        )
        .await?;
        debug!("Deleted batch of {} from {} ({} affected)", chunk.len(), spec.name, removed);
    }
    Ok(())
}

async fn with_read_timeout<T>(
    store: &dyn Store,
    table: &str,
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::read_msg(
            store.name(),
            table,
            format!("timed out after {}", humantime::format_duration(limit)),
        )),
    }
}

async fn with_write_timeout<T>(
    store: &dyn Store,
    table: &str,
    operation: WriteOp,
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::write_msg(
            store.name(),
            table,
            operation,
            format!("timed out after {}", humantime::format_duration(limit)),
        )),
    }
}

/// Row counts of one table on both stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableStatus {
    /// Table name
    pub table: String,
    /// Rows on the primary store
    pub primary_rows: i64,
    /// Rows on the replica store
    pub replica_rows: i64,
}

/// Push/pull service over one primary and one replica store.
pub struct SyncService {
    primary: Box<dyn Store>,
    replica: Box<dyn Store>,
    tables: Vec<TableSpec>,
    options: ReconcileOptions,
    state: Mutex<RunState>,
    metrics: Arc<Metrics>,
}

impl SyncService {
    /// Build a service over two store handles.
    pub fn new(
        primary: Box<dyn Store>,
        replica: Box<dyn Store>,
        tables: Vec<TableSpec>,
        options: ReconcileOptions,
    ) -> Result<Self> {
        validate_tables(&tables)?;
        Ok(Self {
            primary,
            replica,
            tables,
            options,
            state: Mutex::new(RunState::Idle),
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Open both stores named in `config`.
    #[instrument(skip(config))]
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        info!("Initializing sync service...");

        let primary = open_store("primary", &config.primary).await?;
        let replica = open_store("replica", &config.replica).await?;

        Self::new(
            primary,
            replica,
            config.tables.clone(),
            ReconcileOptions::from_config(&config.sync)?,
        )
    }

    /// Copy the replica into the primary.
    pub async fn push(&self) -> Result<RunReport> {
        self.run(Direction::Push).await
    }

    /// Copy the primary into the replica.
    pub async fn pull(&self) -> Result<RunReport> {
        self.run(Direction::Pull).await
    }

    /// Run one direction.
    #[instrument(skip(self), fields(direction = %direction))]
    pub async fn run(&self, direction: Direction) -> Result<RunReport> {
        let guard = RunGuard::begin(&self.state)?;
        let (source, destination) = self.endpoints(direction);

        info!("Starting {} ({} -> {})", direction, source.name(), destination.name());
        let result = reconcile(source, destination, &self.tables, &self.options).await;

        self.metrics.record_run(direction, result.as_ref().ok());
        guard.finish(result.is_ok());
        result
    }

    /// Compute what a run would do, without writing.
    pub async fn plan(&self, direction: Direction) -> Result<RunReport> {
        let (source, destination) = self.endpoints(direction);
        let options = ReconcileOptions {
            dry_run: true,
            ..self.options.clone()
        };
        reconcile(source, destination, &self.tables, &options).await
    }

    fn endpoints(&self, direction: Direction) -> (&dyn Store, &dyn Store) {
        match direction {
            Direction::Push => (self.replica.as_ref(), self.primary.as_ref()),
            Direction::Pull => (self.primary.as_ref(), self.replica.as_ref()),
        }
    }

    /// State of the most recent run.
    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Test connectivity to both stores.
    pub async fn test_connectivity(&self) -> Result<()> {
        info!("Testing connectivity...");

        self.primary.ping().await?;
        info!("{}: OK", self.primary.name());

        self.replica.ping().await?;
        info!("{}: OK", self.replica.name());

        Ok(())
    }

    /// Row counts for every configured table on both stores.
    pub async fn status(&self) -> Result<Vec<TableStatus>> {
        let mut statuses = Vec::with_capacity(self.tables.len());
        for spec in &self.tables {
            statuses.push(TableStatus {
                table: spec.name.clone(),
                primary_rows: self.primary.count(&spec.name).await?,
                replica_rows: self.replica.count(&spec.name).await?,
            });
        }
        Ok(statuses)
    }

    /// Configured tables.
    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    /// Counters for runs on this service.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Marks the service `Running` and guarantees a terminal state even if the
/// run future is dropped.
struct RunGuard<'a> {
    state: &'a Mutex<RunState>,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn begin(state: &'a Mutex<RunState>) -> Result<Self> {
        let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == RunState::Running {
            return Err(Error::Busy);
        }
        *current = RunState::Running;
        Ok(Self {
            state,
            finished: false,
        })
    }

    fn finish(mut self, success: bool) {
        self.set(if success {
            RunState::Completed
        } else {
            RunState::Failed
        });
        self.finished = true;
    }

    fn set(&self, next: RunState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.set(RunState::Failed);
        }
    }
}
