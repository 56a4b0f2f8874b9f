use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use dimload_utils::error::Error;

use crate::config::LoadStrategy;
use crate::events::trigger::TriggerMode;
use crate::orchestrator::window::ExtractionWindow;

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self { $($ty::$variant => $text),+ }
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(Error::Configuration(format!(
                        concat!("unknown ", stringify!($ty), " '{}'"), other
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Lifecycle of a run. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    Pending,
    Extracting,
    Transforming,
    Loading,
    Succeeded,
    PartialSuccess,
    Failed,
}

str_enum!(RunPhase {
    Pending => "PENDING",
    Extracting => "EXTRACTING",
    Transforming => "TRANSFORMING",
    Loading => "LOADING",
    Succeeded => "SUCCEEDED",
    PartialSuccess => "PARTIAL_SUCCESS",
    Failed => "FAILED",
});

impl RunPhase {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PartialSuccess | Self::Failed)
    }

    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Extracting),
            Self::Extracting => matches!(target, Self::Transforming),
            Self::Transforming => matches!(target, Self::Loading),
            Self::Loading => target.is_terminal(),
            Self::Succeeded | Self::PartialSuccess | Self::Failed => false,
        }
    }
}

/// Overall status of a run as persisted in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    PartialSuccess,
    Failed,
}

str_enum!(RunStatus {
    Running => "running",
    Succeeded => "succeeded",
    PartialSuccess => "partial_success",
    Failed => "failed",
});

impl RunStatus {
    /// `Succeeded` iff every targeted table loaded, `Failed` iff none did.
    pub fn derive(targeted: usize, loaded: usize) -> Self {
        if loaded == 0 {
            RunStatus::Failed
        } else if loaded >= targeted {
            RunStatus::Succeeded
        } else {
            RunStatus::PartialSuccess
        }
    }

    pub fn terminal_phase(&self) -> RunPhase {
        match self {
            RunStatus::Running => RunPhase::Loading,
            RunStatus::Succeeded => RunPhase::Succeeded,
            RunStatus::PartialSuccess => RunPhase::PartialSuccess,
            RunStatus::Failed => RunPhase::Failed,
        }
    }

    /// Statuses after which the checkpoint may advance.
    pub fn allows_checkpoint(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::PartialSuccess)
    }
}

/// Furthest point one table reached within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStage {
    Extracted,
    Transformed,
    Loaded,
    Skipped,
    Failed,
}

str_enum!(TableStage {
    Extracted => "extracted",
    Transformed => "transformed",
    Loaded => "loaded",
    Skipped => "skipped",
    Failed => "failed",
});

/// Pipeline step an outcome was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Extract,
    Transform,
    Load,
}

str_enum!(PipelineStep {
    Extract => "extract",
    Transform => "transform",
    Load => "load",
});

/// Immutable audit record of one table's progress within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableOutcome {
    pub run_id: String,
    pub table: String,
    pub stage: TableStage,
    pub step: PipelineStep,
    pub rows_in: u64,
    pub rows_out: u64,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl TableOutcome {
    pub fn new(run_id: &str, table: &str, step: PipelineStep, stage: TableStage) -> Self {
        Self {
            run_id: run_id.to_string(),
            table: table.to_string(),
            stage,
            step,
            rows_in: 0,
            rows_out: 0,
            error: None,
            duration_ms: 0,
            recorded_at: Utc::now(),
        }
    }

    pub fn rows(mut self, rows_in: u64, rows_out: u64) -> Self {
        self.rows_in = rows_in;
        self.rows_out = rows_out;
        self
    }

    pub fn error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// A persisted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub mode: TriggerMode,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub window: ExtractionWindow,
    pub load_strategy: LoadStrategy,
    /// Target tables in load order.
    pub tables: Vec<String>,
    /// Run this one recovers, for recovery runs.
    pub recovers: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub watermark_after: Option<NaiveDate>,
    pub checkpoint_error: Option<String>,
}

/// Run plus the current outcome of each of its tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: RunRecord,
    /// Last recorded outcome per table, in load order.
    pub outcomes: Vec<TableOutcome>,
    pub tables_targeted: usize,
    pub tables_loaded: usize,
    pub tables_failed: usize,
    pub tables_skipped: usize,
    pub rows_extracted: u64,
    pub rows_loaded: u64,
}

impl RunSummary {
    pub fn new(run: RunRecord, latest: HashMap<String, TableOutcome>) -> Self {
        let outcomes: Vec<TableOutcome> = run
            .tables
            .iter()
            .filter_map(|t| latest.get(t).cloned())
            .collect();
        let count = |stage: TableStage| outcomes.iter().filter(|o| o.stage == stage).count();
        let rows_loaded = outcomes
            .iter()
            .filter(|o| o.stage == TableStage::Loaded)
            .map(|o| o.rows_out)
            .sum();
        let rows_extracted = outcomes.iter().map(|o| o.rows_in).sum();

        Self {
            tables_targeted: run.tables.len(),
            tables_loaded: count(TableStage::Loaded),
            tables_failed: count(TableStage::Failed),
            tables_skipped: count(TableStage::Skipped),
            rows_extracted,
            rows_loaded,
            outcomes,
            run,
        }
    }

    pub fn outcome(&self, table: &str) -> Option<&TableOutcome> {
        self.outcomes.iter().find(|o| o.table == table)
    }

    pub fn status(&self) -> RunStatus {
        self.run.status
    }
}

/// In-memory bookkeeping for the run being executed.
#[derive(Debug)]
pub struct RunState {
    pub id: String,
    pub phase: RunPhase,
    /// Target tables in load order.
    pub tables: Vec<String>,
    pub table_stages: HashMap<String, TableStage>,
}

impl RunState {
    pub fn new(id: String, tables: Vec<String>) -> Self {
        Self {
            id,
            phase: RunPhase::Pending,
            tables,
            table_stages: HashMap::new(),
        }
    }

    pub fn advance(&mut self, next: RunPhase) -> Result<(), Error> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::Configuration(format!(
                "run {} cannot move from {} to {}",
                self.id, self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }

    pub fn record(&mut self, outcome: &TableOutcome) {
        self.table_stages.insert(outcome.table.clone(), outcome.stage);
    }

    pub fn loaded(&self) -> usize {
        self.table_stages.values().filter(|s| **s == TableStage::Loaded).count()
    }

    pub fn derive_status(&self) -> RunStatus {
        RunStatus::derive(self.tables.len(), self.loaded())
    }
}
