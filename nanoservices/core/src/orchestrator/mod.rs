//! Sequences extraction, transformation and loading for one run at a time.
//!
//! A trigger computes the run window from the checkpoint watermark, persists
//! the run and then drives every configured table through the three stages.
//! Per-table failures are recorded in the ledger and never abort sibling
//! tables; only the load strategy may halt the loading stage early.
pub mod guard;
pub mod recovery;
pub(crate) mod runner;
pub mod state;
pub mod window;

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use dimload_utils::error::Error;
use dimload_utils::DimloadResult;

use crate::config::{LoadStrategy, PipelineSettings, StoreKind, TableMapping};
use crate::destinations::traits::TargetProvider;
use crate::events::notifier::Notifier;
use crate::events::trigger::TriggerMode;
use crate::sources::catalog::SourceCatalog;
use crate::store::{CheckpointInfo, CheckpointStore, RunLedger};
use crate::transforms::traits::Transformer;

use guard::{RunGuard, RunSlot};
use runner::RunPlan;

pub use recovery::{
    RecoveryCandidate, RecoveryRequest, RecoveryStatus, RunRef, RunValidation, TableIssue,
};
pub use state::{RunPhase, RunRecord, RunStatus, RunSummary, TableOutcome, TableStage};
pub use window::{compute_window, ExtractionWindow, WindowInputs};

/// Caller input for a new run. Request-level values win over configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub run_async: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub load_strategy: Option<LoadStrategy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerResponse {
    pub run_id: String,
    /// Final summary of a synchronous run. `None` for async runs; poll
    /// [`Orchestrator::run_status`] instead.
    pub summary: Option<RunSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointStatus {
    pub checkpoint: CheckpointInfo,
    /// Window a run triggered now would use, or `None` if it would be rejected.
    pub next_window: Option<ExtractionWindow>,
}

pub(crate) struct Inner {
    pub(crate) catalog: SourceCatalog,
    pub(crate) targets: Arc<dyn TargetProvider>,
    pub(crate) target_kind: StoreKind,
    pub(crate) transformer: Arc<dyn Transformer>,
    pub(crate) ledger: RunLedger,
    pub(crate) checkpoints: CheckpointStore,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) settings: PipelineSettings,
    pub(crate) tables: Vec<TableMapping>,
    pub(crate) slot: RunSlot,
}

/// Cheap to clone; clones share the run slot, ledger and checkpoint.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub(crate) fn from_inner(inner: Inner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    /// Checkpoint key this orchestrator advances.
    pub fn environment(&self) -> &str {
        self.inner.checkpoints.environment()
    }

    pub fn tables(&self) -> &[TableMapping] {
        &self.inner.tables
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    /// Id of the run currently holding the slot.
    pub fn active_run(&self) -> Option<String> {
        self.inner.slot.current()
    }

    /// Start a manual run over every configured table.
    pub async fn trigger(&self, request: TriggerRequest) -> DimloadResult<TriggerResponse> {
        self.start(request, TriggerMode::Manual).await
    }

    pub(crate) async fn start(
        &self,
        request: TriggerRequest,
        mode: TriggerMode,
    ) -> DimloadResult<TriggerResponse> {
        let strategy = request.load_strategy.unwrap_or(self.inner.settings.load_strategy);
        let run_id = uuid::Uuid::new_v4().to_string();
        let guard = self.inner.slot.acquire(&run_id)?;

        let today = Utc::now().date_naive();
        let watermark = self.inner.checkpoints.get_watermark(today).await?;
        let window = compute_window(WindowInputs {
            start_override: request.start_date,
            end_override: request.end_date,
            watermark,
            today,
            max_window_days: self.inner.settings.max_window_days,
        })?;

        let plan = RunPlan {
            id: run_id,
            mode,
            window,
            strategy,
            tables: self.inner.tables.clone(),
            recovers: None,
            advance_checkpoint: true,
        };
        self.launch(plan, guard, request.run_async).await
    }

    /// Re-run the tables of a prior run that never reached `loaded`, over that
    /// run's window. The checkpoint is left untouched.
    pub async fn recover(&self, request: RecoveryRequest) -> DimloadResult<TriggerResponse> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let guard = self.inner.slot.acquire(&run_id)?;

        let prior = self.resolve(&request.run_ref).await?;
        let latest = self.inner.ledger.latest_outcomes(&prior.id).await?;
        let recovered = self.inner.ledger.recovered_tables(&prior.id).await?;
        let candidates =
            recovery::candidate_tables(&prior.tables, &latest, &recovered, &request.skip_tables);

        let mut tables = Vec::with_capacity(candidates.len());
        for name in &candidates {
            match self.inner.tables.iter().find(|t| t.target() == name) {
                Some(mapping) => tables.push(mapping.clone()),
                None => {
                    tracing::warn!(run = %prior.id, table = %name, "recovery candidate is no longer configured")
                }
            }
        }
        if tables.is_empty() {
            return Err(Error::EmptySet(prior.id));
        }

        tracing::info!(prior = %prior.id, run = %run_id, tables = ?candidates, "starting recovery");
        let plan = RunPlan {
            id: run_id,
            mode: TriggerMode::Recovery,
            window: prior.window,
            strategy: prior.load_strategy,
            tables,
            recovers: Some(prior.id),
            advance_checkpoint: false,
        };
        self.launch(plan, guard, request.run_async).await
    }

    async fn launch(&self, plan: RunPlan, guard: RunGuard, run_async: bool) -> DimloadResult<TriggerResponse> {
        let record = plan.record();
        // Persisted before returning so an async caller can poll immediately.
        self.inner.ledger.begin_run(&record).await?;
        let run_id = record.id.clone();

        if run_async {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = runner::run_to_completion(&inner, plan, record).await {
                    tracing::error!(error = %e, "async run ended with an error");
                }
            });
            return Ok(TriggerResponse { run_id, summary: None });
        }

        let summary = runner::run_to_completion(&self.inner, plan, record).await;
        drop(guard);
        Ok(TriggerResponse { run_id, summary: Some(summary?) })
    }

    async fn resolve(&self, run_ref: &RunRef) -> DimloadResult<RunRecord> {
        match run_ref {
            RunRef::Id(id) => self
                .inner
                .ledger
                .find_run(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("run '{id}'"))),
            RunRef::Latest => self
                .inner
                .ledger
                .latest_unrecovered()
                .await?
                .ok_or_else(|| Error::NotFound("no partial or failed run left to recover".to_string())),
        }
    }

    pub async fn run_status(&self, run_id: &str) -> DimloadResult<RunSummary> {
        self.inner.ledger.query_run_summary(run_id).await
    }

    pub async fn recent_runs(&self, limit: usize) -> DimloadResult<Vec<RunRecord>> {
        self.inner.ledger.recent_runs(limit).await
    }

    /// Current watermark and the window a run triggered now would use.
    pub async fn checkpoint_status(&self) -> DimloadResult<CheckpointStatus> {
        let today = Utc::now().date_naive();
        let checkpoint = self.inner.checkpoints.checkpoint_info(today).await?;
        let next_window = compute_window(WindowInputs {
            start_override: None,
            end_override: None,
            watermark: checkpoint.effective_start,
            today,
            max_window_days: self.inner.settings.max_window_days,
        })
        .ok();
        Ok(CheckpointStatus { checkpoint, next_window })
    }

    /// Recovery candidates of the most recent non-succeeded run that still has
    /// outstanding tables, with their current row counts in the target. `None`
    /// when there is nothing to inspect.
    pub async fn recovery_status(&self) -> DimloadResult<Option<RecoveryStatus>> {
        let Some(prior) = self.inner.ledger.latest_unrecovered().await? else {
            return Ok(None);
        };
        let latest = self.inner.ledger.latest_outcomes(&prior.id).await?;
        let names = self.inner.ledger.outstanding_tables(&prior).await?;

        let target = match self.inner.targets.connect(&self.inner.target_kind).await {
            Ok(target) => Some(target),
            Err(e) => {
                tracing::warn!(error = %e, "target store unavailable for row counts");
                None
            }
        };

        let mut candidates = Vec::with_capacity(names.len());
        for table in names {
            let target_rows = match &target {
                Some(store) => store.count_rows(&table).await.unwrap_or_else(|e| {
                    tracing::warn!(table = %table, error = %e, "row count failed");
                    None
                }),
                None => None,
            };
            let outcome = latest.get(&table);
            candidates.push(RecoveryCandidate {
                last_stage: outcome.map(|o| o.stage),
                error: outcome.and_then(|o| o.error.clone()),
                table,
                target_rows,
            });
        }

        Ok(Some(RecoveryStatus {
            run_id: prior.id,
            status: prior.status,
            window: prior.window,
            candidates,
        }))
    }

    /// Per-table problems of a run, read from the ledger without touching sources.
    pub async fn validate_run(&self, run_id: &str) -> DimloadResult<RunValidation> {
        let summary = self.inner.ledger.query_run_summary(run_id).await?;
        let latest = self.inner.ledger.latest_outcomes(run_id).await?;
        Ok(RunValidation {
            run_id: summary.run.id.clone(),
            status: summary.status(),
            issues: recovery::table_issues(&summary.run.tables, &latest),
        })
    }

    /// Tables a run loaded with zero rows.
    pub async fn empty_tables(&self, run_id: &str) -> DimloadResult<Vec<String>> {
        self.inner.ledger.query_tables_with_zero_rows(run_id).await
    }

    /// Close runs a previous process left unfinished. Refused while this
    /// process has a run of its own in flight.
    pub async fn fail_interrupted_runs(&self) -> DimloadResult<usize> {
        let _guard = self.inner.slot.acquire("startup-cleanup")?;
        let closed = self.inner.ledger.mark_inflight_as_failed().await?;
        if closed > 0 {
            tracing::warn!(runs = closed, "marked interrupted runs as failed");
        }
        Ok(closed)
    }
}
