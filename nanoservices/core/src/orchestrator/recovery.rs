use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::orchestrator::state::{PipelineStep, RunStatus, TableOutcome, TableStage};
use crate::orchestrator::window::ExtractionWindow;

/// Which prior run a recovery refers to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunRef {
    /// The most recent run that finished `partial_success` or `failed`.
    #[default]
    Latest,
    Id(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    #[serde(default)]
    pub run_ref: RunRef,
    /// Tables left out of the recovery run, matched case-insensitively.
    #[serde(default)]
    pub skip_tables: Vec<String>,
    #[serde(default)]
    pub run_async: bool,
}

/// Targeted tables of a prior run whose last outcome is not `loaded` and that
/// no later recovery loaded, minus `skip_tables`. Keeps the prior run's load order.
pub fn candidate_tables(
    targeted: &[String],
    latest: &HashMap<String, TableOutcome>,
    recovered: &HashSet<String>,
    skip_tables: &[String],
) -> Vec<String> {
    let skip: Vec<String> = skip_tables.iter().map(|t| t.trim().to_lowercase()).collect();
    targeted
        .iter()
        .filter(|t| latest.get(*t).map(|o| o.stage) != Some(TableStage::Loaded))
        .filter(|t| !recovered.contains(*t))
        .filter(|t| !skip.contains(&t.to_lowercase()))
        .cloned()
        .collect()
}

/// A recovery candidate and what the target currently holds for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryCandidate {
    pub table: String,
    pub last_stage: Option<TableStage>,
    pub error: Option<String>,
    /// `None` when the table does not exist in the target or it was unreachable.
    pub target_rows: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStatus {
    pub run_id: String,
    pub status: RunStatus,
    pub window: ExtractionWindow,
    pub candidates: Vec<RecoveryCandidate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Failed,
    Skipped,
    EmptyLoad,
    /// Targeted but no outcome was ever recorded, e.g. the process died.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableIssue {
    pub table: String,
    pub kind: IssueKind,
    pub step: Option<PipelineStep>,
    pub message: Option<String>,
}

/// Per-table problems of a finished run, read from the ledger only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunValidation {
    pub run_id: String,
    pub status: RunStatus,
    pub issues: Vec<TableIssue>,
}

impl RunValidation {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

pub fn table_issues(targeted: &[String], latest: &HashMap<String, TableOutcome>) -> Vec<TableIssue> {
    targeted
        .iter()
        .filter_map(|table| {
            let Some(outcome) = latest.get(table) else {
                return Some(TableIssue {
                    table: table.clone(),
                    kind: IssueKind::Missing,
                    step: None,
                    message: None,
                });
            };
            let kind = match outcome.stage {
                TableStage::Failed => IssueKind::Failed,
                TableStage::Skipped => IssueKind::Skipped,
                TableStage::Loaded if outcome.rows_out == 0 => IssueKind::EmptyLoad,
                TableStage::Loaded => return None,
                // Stopped after extraction or transformation without a verdict.
                TableStage::Extracted | TableStage::Transformed => IssueKind::Missing,
            };
            Some(TableIssue {
                table: table.clone(),
                kind,
                step: Some(outcome.step),
                message: outcome.error.clone(),
            })
        })
        .collect()
}
