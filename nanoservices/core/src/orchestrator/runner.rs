use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use arrow::compute;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};

use dimload_utils::error::Error;
use dimload_utils::{DimloadResult, TableData};

use crate::config::{LoadStrategy, TableMapping};
use crate::destinations::traits::TargetStore;
use crate::events::notifier::NotifyEvent;
use crate::events::trigger::TriggerMode;
use crate::metrics;
use crate::orchestrator::state::{
    PipelineStep, RunPhase, RunRecord, RunState, RunStatus, RunSummary, TableOutcome, TableStage,
};
use crate::orchestrator::window::ExtractionWindow;
use crate::orchestrator::Inner;
use crate::sources::traits::{SourceConnection, SourceQuery};
use crate::transforms::mapping::stamp_source;

/// Everything decided about a run before it is persisted.
#[derive(Debug, Clone)]
pub(crate) struct RunPlan {
    pub id: String,
    pub mode: TriggerMode,
    pub window: ExtractionWindow,
    pub strategy: LoadStrategy,
    /// Tables in load order.
    pub tables: Vec<TableMapping>,
    pub recovers: Option<String>,
    /// Recovery runs replay an old window and leave the checkpoint alone.
    pub advance_checkpoint: bool,
}

impl RunPlan {
    pub(crate) fn record(&self) -> RunRecord {
        RunRecord {
            id: self.id.clone(),
            mode: self.mode,
            status: RunStatus::Running,
            phase: RunPhase::Pending,
            window: self.window,
            load_strategy: self.strategy,
            tables: self.tables.iter().map(|t| t.target().to_string()).collect(),
            recovers: self.recovers.clone(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            watermark_after: None,
            checkpoint_error: None,
        }
    }
}

type Connections = Vec<(String, Result<Arc<dyn SourceConnection>, String>)>;

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Message of a stage error without the stage prefix the outcome already carries.
fn detail(error: &Error) -> String {
    match error {
        Error::Extraction { message, .. }
        | Error::Transformation { message, .. }
        | Error::Load { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// Drive a persisted run to a terminal status. If the ledger itself fails the
/// run is closed as failed where possible and the error is returned.
pub(crate) async fn run_to_completion(
    inner: &Inner,
    plan: RunPlan,
    record: RunRecord,
) -> DimloadResult<RunSummary> {
    let fallback = record.clone();
    match execute(inner, &plan, record).await {
        Ok(summary) => Ok(summary),
        Err(e) => {
            tracing::error!(run = %fallback.id, error = %e, "run aborted");
            let mut failed = fallback;
            failed.status = RunStatus::Failed;
            failed.phase = RunPhase::Failed;
            failed.finished_at = Some(Utc::now());
            failed.duration_ms = Some((Utc::now() - failed.started_at).num_milliseconds().max(0) as u64);
            match inner.ledger.complete_run(&failed).await {
                Ok(()) => metrics::inc_run(RunStatus::Failed.as_str()),
                Err(close) => {
                    tracing::warn!(run = %failed.id, error = %close, "could not close aborted run")
                }
            }
            let summary = match inner.ledger.query_run_summary(&failed.id).await {
                Ok(summary) => summary,
                Err(_) => RunSummary::new(failed, HashMap::new()),
            };
            notify(inner, NotifyEvent::Failed, &summary).await;
            Err(e)
        }
    }
}

async fn execute(inner: &Inner, plan: &RunPlan, mut record: RunRecord) -> DimloadResult<RunSummary> {
    let started = Instant::now();
    let mut state = RunState::new(record.id.clone(), record.tables.clone());
    tracing::info!(
        run = %record.id,
        mode = %record.mode,
        start = %plan.window.start,
        end = %plan.window.end,
        tables = plan.tables.len(),
        strategy = %plan.strategy,
        "run started"
    );
    notify(inner, NotifyEvent::Started, &RunSummary::new(record.clone(), HashMap::new())).await;

    let limit = Arc::new(Semaphore::new(inner.settings.parallelism.max(1)));

    advance(inner, &mut state, RunPhase::Extracting).await?;
    let sources = Arc::new(connect_sources(inner).await);
    let mut tasks = JoinSet::new();
    let mut order = HashMap::new();
    for (index, mapping) in plan.tables.iter().cloned().enumerate() {
        let sources = sources.clone();
        let limit = limit.clone();
        let window = plan.window;
        let handle = tasks.spawn(async move {
            let _permit = limit.acquire_owned().await;
            let started = Instant::now();
            let result = match sources.as_ref() {
                Ok(connections) => extract_table(&mapping, connections, &window).await,
                Err(message) => Err(Error::extraction(mapping.target(), message)),
            };
            (result, elapsed_ms(started))
        });
        order.insert(handle.id(), index);
    }
    let extracted = join_in_order(tasks, &order).await;

    let mut ready = Vec::new();
    for (mapping, joined) in plan.tables.iter().zip(extracted) {
        let table = mapping.target();
        let (result, duration_ms) =
            joined.unwrap_or_else(|panic| (Err(Error::extraction(table, panic)), 0));
        let outcome = TableOutcome::new(&state.id, table, PipelineStep::Extract, TableStage::Extracted)
            .duration_ms(duration_ms);
        match result {
            Ok(data) => {
                tracing::debug!(run = %state.id, table = %table, rows = data.num_rows(), "extracted");
                record_outcome(inner, &mut state, outcome.rows(data.num_rows(), data.num_rows())).await?;
                ready.push((mapping.clone(), data));
            }
            Err(e) => {
                tracing::warn!(run = %state.id, table = %table, phase = "extract", error = %e, "table failed");
                let failed = TableOutcome { stage: TableStage::Failed, ..outcome }.error(detail(&e));
                record_outcome(inner, &mut state, failed).await?;
            }
        }
    }

    advance(inner, &mut state, RunPhase::Transforming).await?;
    let mut tasks = JoinSet::new();
    let mut order = HashMap::new();
    let mut pending = Vec::with_capacity(ready.len());
    for (index, (mapping, data)) in ready.into_iter().enumerate() {
        let transformer = inner.transformer.clone();
        let limit = limit.clone();
        pending.push((mapping.clone(), data.num_rows()));
        let handle = tasks.spawn(async move {
            let _permit = limit.acquire_owned().await;
            let started = Instant::now();
            let result = transformer.transform(&mapping, data).await;
            (result, elapsed_ms(started))
        });
        order.insert(handle.id(), index);
    }
    let transformed = join_in_order(tasks, &order).await;

    let mut loadable = Vec::new();
    for ((mapping, rows_in), joined) in pending.into_iter().zip(transformed) {
        let table = mapping.target();
        let (result, duration_ms) =
            joined.unwrap_or_else(|panic| (Err(Error::transformation(table, panic)), 0));
        let outcome =
            TableOutcome::new(&state.id, table, PipelineStep::Transform, TableStage::Transformed)
                .duration_ms(duration_ms);
        match result {
            Ok(data) => {
                record_outcome(inner, &mut state, outcome.rows(rows_in, data.num_rows())).await?;
                loadable.push((mapping, data));
            }
            Err(e) => {
                tracing::warn!(run = %state.id, table = %table, phase = "transform", error = %e, "table failed");
                let failed = TableOutcome { stage: TableStage::Failed, ..outcome }
                    .rows(rows_in, 0)
                    .error(detail(&e));
                record_outcome(inner, &mut state, failed).await?;
            }
        }
    }

    advance(inner, &mut state, RunPhase::Loading).await?;
    load_tables(inner, plan.strategy, &mut state, loadable).await?;

    let status = state.derive_status();
    state.advance(status.terminal_phase())?;
    record.status = status;
    record.phase = state.phase;

    if plan.advance_checkpoint {
        advance_checkpoint(inner, &mut record).await;
    }

    record.finished_at = Some(Utc::now());
    record.duration_ms = Some(elapsed_ms(started));
    inner.ledger.complete_run(&record).await?;

    metrics::inc_run(status.as_str());
    metrics::observe_run_duration(record.mode.as_str(), elapsed_ms(started) as f64);

    let summary = inner.ledger.query_run_summary(&record.id).await?;
    tracing::info!(
        run = %record.id,
        status = %status,
        loaded = summary.tables_loaded,
        failed = summary.tables_failed,
        skipped = summary.tables_skipped,
        rows = summary.rows_loaded,
        duration_ms = record.duration_ms.unwrap_or_default(),
        "run finished"
    );
    notify(inner, NotifyEvent::for_status(status), &summary).await;
    Ok(summary)
}

/// Await every task and return its output at the index it was registered
/// under. A task that panicked yields the panic message instead.
async fn join_in_order<T: Send + 'static>(
    mut tasks: JoinSet<T>,
    order: &HashMap<Id, usize>,
) -> Vec<Result<T, String>> {
    let mut slots: Vec<Option<Result<T, String>>> = (0..order.len()).map(|_| None).collect();
    while let Some(joined) = tasks.join_next_with_id().await {
        let (id, value) = match joined {
            Ok((id, value)) => (id, Ok(value)),
            Err(e) => (e.id(), Err(panic_message(e))),
        };
        if let Some(slot) = order.get(&id).and_then(|index| slots.get_mut(*index)) {
            *slot = Some(value);
        }
    }
    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err("task finished without a result".to_string())))
        .collect()
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match message {
        Some(message) => format!("task panicked: {message}"),
        None => "task panicked".to_string(),
    }
}

async fn advance(inner: &Inner, state: &mut RunState, phase: RunPhase) -> DimloadResult<()> {
    state.advance(phase)?;
    inner.ledger.set_phase(&state.id, phase).await
}

async fn record_outcome(inner: &Inner, state: &mut RunState, outcome: TableOutcome) -> DimloadResult<()> {
    inner.ledger.record_outcome(&outcome).await?;
    metrics::inc_table_outcome(outcome.stage.as_str());
    state.record(&outcome);
    Ok(())
}

async fn notify(inner: &Inner, event: NotifyEvent, summary: &RunSummary) {
    if let Err(e) = inner.notifier.notify(event, summary).await {
        tracing::warn!(run = %summary.run.id, event = %event, error = %e, "notification failed");
    }
}

/// Connect to every candidate database once. A failed listing fails every
/// table; a failed connection fails every table that reads from it.
async fn connect_sources(inner: &Inner) -> Result<Connections, String> {
    let databases = inner.catalog.candidates().await.map_err(|e| {
        tracing::error!(error = %e, "could not list source databases");
        format!("listing source databases: {}", detail(&e))
    })?;
    if databases.is_empty() {
        return Err("no candidate source databases".to_string());
    }

    let mut connections = Vec::with_capacity(databases.len());
    for database in databases {
        let connection = inner.catalog.provider().connect(&database).await.map_err(|e| {
            tracing::warn!(database = %database, error = %e, "source connection failed");
            detail(&e)
        });
        connections.push((database, connection));
    }
    Ok(connections)
}

/// Rows of one table across all candidate databases. Any failing database
/// fails the whole table.
async fn extract_table(
    mapping: &TableMapping,
    connections: &Connections,
    window: &ExtractionWindow,
) -> DimloadResult<TableData> {
    let table = mapping.target();
    let query = SourceQuery {
        table: mapping.source_table().to_string(),
        date_column: mapping.window_column().map(String::from),
        window: *window,
        joins: mapping.joins().to_vec(),
    };

    let mut parts = Vec::with_capacity(connections.len());
    for (database, connection) in connections {
        let connection = connection
            .as_ref()
            .map_err(|e| Error::extraction(table, format!("{database}: {e}")))?;
        let data = connection
            .fetch(&query)
            .await
            .map_err(|e| Error::extraction(table, format!("{database}: {}", detail(&e))))?;
        let data = match mapping.source_db_column() {
            Some(_) => stamp_source(data, database)?,
            None => data,
        };
        parts.push(data);
    }
    merge_parts(table, parts)
}

/// Concatenate per-database parts onto the schema of the first part, matching
/// columns by name and casting where the inferred types differ.
fn merge_parts(table: &str, parts: Vec<TableData>) -> DimloadResult<TableData> {
    let mut parts = parts.into_iter();
    let first = parts
        .next()
        .ok_or_else(|| Error::extraction(table, "no candidate source databases"))?;
    let schema = first.schema().clone();
    let mut aligned = vec![first];
    for part in parts {
        aligned.push(align(table, &schema, part)?);
    }
    TableData::concat(schema, aligned)
}

fn align(table: &str, schema: &SchemaRef, part: TableData) -> DimloadResult<TableData> {
    if part.schema().fields() == schema.fields() {
        return Ok(part);
    }
    let indexes = schema
        .fields()
        .iter()
        .map(|field| {
            part.schema().index_of(field.name()).map_err(|_| {
                Error::extraction(table, format!("column '{}' missing in a source database", field.name()))
            })
        })
        .collect::<DimloadResult<Vec<_>>>()?;

    let mut batches = Vec::with_capacity(part.batches().len());
    for batch in part.batches() {
        let mut columns = Vec::with_capacity(indexes.len());
        for (field, index) in schema.fields().iter().zip(&indexes) {
            let column = batch.column(*index);
            if column.data_type() == field.data_type() {
                columns.push(column.clone());
            } else {
                columns.push(compute::cast(column, field.data_type())?);
            }
        }
        batches.push(RecordBatch::try_new(schema.clone(), columns)?);
    }
    Ok(TableData::new(schema.clone(), batches))
}

/// Load tables one by one in declared order. The strategy decides only whether
/// a failure halts the stage; remaining tables are then recorded `skipped`.
async fn load_tables(
    inner: &Inner,
    strategy: LoadStrategy,
    state: &mut RunState,
    loadable: Vec<(TableMapping, TableData)>,
) -> DimloadResult<()> {
    let target = inner
        .targets
        .connect(&inner.target_kind)
        .await
        .map_err(|e| detail(&e));
    if let Err(e) = &target {
        tracing::error!(run = %state.id, error = %e, "target store unavailable");
    }

    let mut halted_by: Option<String> = None;
    for (mapping, data) in loadable {
        let table = mapping.target();
        let rows_in = data.num_rows();

        if let Some(failed) = &halted_by {
            let skipped = TableOutcome::new(&state.id, table, PipelineStep::Load, TableStage::Skipped)
                .rows(rows_in, 0)
                .error(format!("not loaded: '{failed}' failed under {strategy}"));
            record_outcome(inner, state, skipped).await?;
            continue;
        }

        let started = Instant::now();
        let result = match &target {
            Ok(store) => load_table(store.as_ref(), table, &data).await,
            Err(message) => Err(Error::load(table, message)),
        };
        let outcome = TableOutcome::new(&state.id, table, PipelineStep::Load, TableStage::Loaded)
            .duration_ms(elapsed_ms(started));
        match result {
            Ok(written) => {
                metrics::add_rows_loaded(table, written);
                tracing::info!(run = %state.id, table = %table, rows = written, "table loaded");
                record_outcome(inner, state, outcome.rows(rows_in, written)).await?;
            }
            Err(e) => {
                tracing::error!(run = %state.id, table = %table, phase = "load", error = %e, "table failed");
                let failed = TableOutcome { stage: TableStage::Failed, ..outcome }
                    .rows(rows_in, 0)
                    .error(detail(&e));
                record_outcome(inner, state, failed).await?;
                if strategy.halts_after_failure() {
                    tracing::warn!(run = %state.id, table = %table, "halting load stage");
                    halted_by = Some(table.to_string());
                }
            }
        }
    }
    Ok(())
}

async fn load_table(target: &dyn TargetStore, table: &str, data: &TableData) -> DimloadResult<u64> {
    target
        .create_table_if_absent(table, data.schema())
        .await
        .map_err(|e| Error::load(table, detail(&e)))?;
    target
        .bulk_insert(table, data)
        .await
        .map_err(|e| Error::load(table, detail(&e)))
}

/// Move the watermark to the window end. Failures stay on the run record and
/// never undo loaded data.
async fn advance_checkpoint(inner: &Inner, record: &mut RunRecord) {
    if !inner.checkpoints.is_auto_update() {
        tracing::debug!(run = %record.id, "checkpoint auto-update disabled");
        return;
    }
    if !record.status.allows_checkpoint() {
        tracing::info!(run = %record.id, status = %record.status, "checkpoint left unchanged");
        return;
    }
    match inner.checkpoints.advance_watermark(record.window.end).await {
        Ok(date) => record.watermark_after = Some(date),
        Err(e) => {
            tracing::error!(run = %record.id, error = %e, "checkpoint advance failed");
            record.checkpoint_error = Some(e.to_string());
        }
    }
}
