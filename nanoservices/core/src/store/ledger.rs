use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use tokio::sync::Mutex;

use dimload_utils::error::Error;
use dimload_utils::DimloadResult;

use crate::orchestrator::recovery::candidate_tables;
use crate::orchestrator::state::{
    RunPhase, RunRecord, RunStatus, RunSummary, TableOutcome, TableStage,
};
use crate::orchestrator::window::ExtractionWindow;
use crate::store::db::{OutcomeRow, RunRow, Store};

/// Append-only record of runs and their per-table outcomes.
///
/// Every write goes through the shared store mutex and is committed before the
/// call returns, so a run is never reported finished ahead of its outcomes.
#[derive(Clone)]
pub struct RunLedger {
    store: Arc<Mutex<Store>>,
}

impl RunLedger {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }

    pub async fn begin_run(&self, run: &RunRecord) -> DimloadResult<()> {
        let row = run_to_row(run)?;
        self.store.lock().await.insert_run(&row)?;
        Ok(())
    }

    pub async fn set_phase(&self, run_id: &str, phase: RunPhase) -> DimloadResult<()> {
        let updated = self.store.lock().await.update_run_phase(run_id, phase.as_str())?;
        if updated == 0 {
            return Err(Error::NotFound(format!("active run '{run_id}'")));
        }
        Ok(())
    }

    pub async fn record_outcome(&self, outcome: &TableOutcome) -> DimloadResult<()> {
        let row = OutcomeRow {
            seq: 0,
            run_id: outcome.run_id.clone(),
            table_name: outcome.table.clone(),
            stage: outcome.stage.as_str().to_string(),
            phase: outcome.step.as_str().to_string(),
            rows_in: outcome.rows_in as i64,
            rows_out: outcome.rows_out as i64,
            error: outcome.error.clone(),
            duration_ms: outcome.duration_ms as i64,
            recorded_at: timestamp(outcome.recorded_at),
        };
        self.store.lock().await.insert_outcome(&row)?;
        Ok(())
    }

    /// Persist the terminal status of a run. A run can only be completed once.
    pub async fn complete_run(&self, run: &RunRecord) -> DimloadResult<()> {
        let row = run_to_row(run)?;
        let updated = self.store.lock().await.complete_run(&row)?;
        if updated == 0 {
            return Err(Error::NotFound(format!("unfinished run '{}'", run.id)));
        }
        Ok(())
    }

    /// Last recorded outcome per table.
    pub async fn latest_outcomes(&self, run_id: &str) -> DimloadResult<HashMap<String, TableOutcome>> {
        let rows = self.store.lock().await.outcomes_for(run_id)?;
        let mut latest = HashMap::new();
        for row in rows {
            let outcome = row_to_outcome(row)?;
            latest.insert(outcome.table.clone(), outcome);
        }
        Ok(latest)
    }

    pub async fn find_run(&self, run_id: &str) -> DimloadResult<Option<RunRecord>> {
        let row = self.store.lock().await.get_run(run_id)?;
        row.map(row_to_run).transpose()
    }

    pub async fn query_run_summary(&self, run_id: &str) -> DimloadResult<RunSummary> {
        let run = self
            .find_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run '{run_id}'")))?;
        let latest = self.latest_outcomes(run_id).await?;
        Ok(RunSummary::new(run, latest))
    }

    /// Tables of a run that loaded successfully but wrote no rows.
    pub async fn query_tables_with_zero_rows(&self, run_id: &str) -> DimloadResult<Vec<String>> {
        let summary = self.query_run_summary(run_id).await?;
        Ok(summary
            .outcomes
            .iter()
            .filter(|o| o.stage == TableStage::Loaded && o.rows_out == 0)
            .map(|o| o.table.clone())
            .collect())
    }

    /// Tables that recovery runs started for `run_id` have loaded, following
    /// recoveries of those recoveries.
    pub async fn recovered_tables(&self, run_id: &str) -> DimloadResult<HashSet<String>> {
        let store = self.store.lock().await;
        let mut recovered = HashSet::new();
        let mut seen = HashSet::from([run_id.to_string()]);
        let mut pending = vec![run_id.to_string()];
        while let Some(id) = pending.pop() {
            for child in store.runs_recovering(&id)? {
                if !seen.insert(child.clone()) {
                    continue;
                }
                let mut last_stage = HashMap::new();
                for row in store.outcomes_for(&child)? {
                    last_stage.insert(row.table_name, row.stage);
                }
                recovered.extend(
                    last_stage
                        .into_iter()
                        .filter(|(_, stage)| stage == TableStage::Loaded.as_str())
                        .map(|(table, _)| table),
                );
                pending.push(child);
            }
        }
        Ok(recovered)
    }

    /// Targeted tables of `run` that neither the run nor any recovery of it loaded.
    pub async fn outstanding_tables(&self, run: &RunRecord) -> DimloadResult<Vec<String>> {
        let latest = self.latest_outcomes(&run.id).await?;
        let recovered = self.recovered_tables(&run.id).await?;
        Ok(candidate_tables(&run.tables, &latest, &recovered, &[]))
    }

    /// Latest finished run that did not fully succeed and still has
    /// outstanding tables.
    pub async fn latest_unrecovered(&self) -> DimloadResult<Option<RunRecord>> {
        let rows = self.store.lock().await.runs_with_status(&[
            RunStatus::PartialSuccess.as_str(),
            RunStatus::Failed.as_str(),
        ])?;
        for row in rows {
            let run = row_to_run(row)?;
            if !self.outstanding_tables(&run).await?.is_empty() {
                return Ok(Some(run));
            }
        }
        Ok(None)
    }

    pub async fn recent_runs(&self, limit: usize) -> DimloadResult<Vec<RunRecord>> {
        let rows = self.store.lock().await.recent_runs(limit)?;
        rows.into_iter().map(row_to_run).collect()
    }

    pub async fn mark_inflight_as_failed(&self) -> DimloadResult<usize> {
        let count = self.store.lock().await.mark_inflight_as_failed(&timestamp(Utc::now()))?;
        Ok(count)
    }
}

pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> DimloadResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Configuration(format!("stored timestamp '{raw}': {e}")))
}

pub(crate) fn parse_date(raw: &str) -> DimloadResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| Error::Configuration(format!("stored date '{raw}': {e}")))
}

fn run_to_row(run: &RunRecord) -> DimloadResult<RunRow> {
    Ok(RunRow {
        id: run.id.clone(),
        mode: run.mode.as_str().to_string(),
        status: run.status.as_str().to_string(),
        phase: run.phase.as_str().to_string(),
        window_start: run.window.start.to_string(),
        window_end: run.window.end.to_string(),
        load_strategy: run.load_strategy.as_str().to_string(),
        tables: serde_json::to_string(&run.tables)?,
        recovers: run.recovers.clone(),
        started_at: timestamp(run.started_at),
        finished_at: run.finished_at.map(timestamp),
        duration_ms: run.duration_ms.map(|d| d as i64),
        watermark_after: run.watermark_after.map(|d| d.to_string()),
        checkpoint_error: run.checkpoint_error.clone(),
    })
}

fn row_to_run(row: RunRow) -> DimloadResult<RunRecord> {
    Ok(RunRecord {
        mode: row.mode.parse()?,
        status: row.status.parse()?,
        phase: row.phase.parse()?,
        window: ExtractionWindow::new(parse_date(&row.window_start)?, parse_date(&row.window_end)?)?,
        load_strategy: row.load_strategy.parse()?,
        tables: serde_json::from_str(&row.tables)?,
        recovers: row.recovers,
        started_at: parse_timestamp(&row.started_at)?,
        finished_at: row.finished_at.as_deref().map(parse_timestamp).transpose()?,
        duration_ms: row.duration_ms.map(|d| d.max(0) as u64),
        watermark_after: row.watermark_after.as_deref().map(parse_date).transpose()?,
        checkpoint_error: row.checkpoint_error,
        id: row.id,
    })
}

fn row_to_outcome(row: OutcomeRow) -> DimloadResult<TableOutcome> {
    Ok(TableOutcome {
        stage: row.stage.parse()?,
        step: row.phase.parse()?,
        rows_in: row.rows_in.max(0) as u64,
        rows_out: row.rows_out.max(0) as u64,
        duration_ms: row.duration_ms.max(0) as u64,
        recorded_at: parse_timestamp(&row.recorded_at)?,
        error: row.error,
        run_id: row.run_id,
        table: row.table_name,
    })
}
