use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;

use dimload_utils::DimloadResult;

use crate::config::NotificationConfig;
use crate::orchestrator::state::{RunStatus, RunSummary, TableStage};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle transitions a notifier is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    Started,
    Succeeded,
    PartialSuccess,
    Failed,
}

impl NotifyEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyEvent::Started => "started",
            NotifyEvent::Succeeded => "succeeded",
            NotifyEvent::PartialSuccess => "partial_success",
            NotifyEvent::Failed => "failed",
        }
    }

    pub fn for_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Running => NotifyEvent::Started,
            RunStatus::Succeeded => NotifyEvent::Succeeded,
            RunStatus::PartialSuccess => NotifyEvent::PartialSuccess,
            RunStatus::Failed => NotifyEvent::Failed,
        }
    }
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-effort sink for run lifecycle events. Errors are logged by the caller
/// and never affect the run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotifyEvent, summary: &RunSummary) -> DimloadResult<()>;
}

/// Writes lifecycle events to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotifyEvent, summary: &RunSummary) -> DimloadResult<()> {
        match event {
            NotifyEvent::Failed => tracing::error!(
                run = %summary.run.id,
                event = %event,
                failed = summary.tables_failed,
                "run failed"
            ),
            NotifyEvent::PartialSuccess => tracing::warn!(
                run = %summary.run.id,
                event = %event,
                loaded = summary.tables_loaded,
                failed = summary.tables_failed,
                skipped = summary.tables_skipped,
                "run partially succeeded"
            ),
            _ => tracing::info!(
                run = %summary.run.id,
                event = %event,
                mode = %summary.run.mode,
                tables = summary.tables_targeted,
                rows_loaded = summary.rows_loaded,
                "run lifecycle"
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct FailedTable<'a> {
    table: &'a str,
    stage: &'a str,
    error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: NotifyEvent,
    run_id: &'a str,
    mode: &'a str,
    window_start: String,
    window_end: String,
    tables_targeted: usize,
    tables_loaded: usize,
    tables_failed: usize,
    tables_skipped: usize,
    rows_loaded: u64,
    failed_tables: Vec<FailedTable<'a>>,
}

impl<'a> WebhookPayload<'a> {
    fn new(event: NotifyEvent, summary: &'a RunSummary) -> Self {
        let failed_tables = summary
            .outcomes
            .iter()
            .filter(|o| matches!(o.stage, TableStage::Failed | TableStage::Skipped))
            .map(|o| FailedTable {
                table: &o.table,
                stage: o.stage.as_str(),
                error: o.error.as_deref(),
            })
            .collect();
        Self {
            event,
            run_id: &summary.run.id,
            mode: summary.run.mode.as_str(),
            window_start: summary.run.window.start.to_string(),
            window_end: summary.run.window.end.to_string(),
            tables_targeted: summary.tables_targeted,
            tables_loaded: summary.tables_loaded,
            tables_failed: summary.tables_failed,
            tables_skipped: summary.tables_skipped,
            rows_loaded: summary.rows_loaded,
            failed_tables,
        }
    }
}

/// Posts a JSON document per enabled lifecycle event.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: url::Url,
    switches: NotificationConfig,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> DimloadResult<Self> {
        Self::from_config(url, NotificationConfig::default())
    }

    pub fn from_config(url: &str, switches: NotificationConfig) -> DimloadResult<Self> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self { client, url: url::Url::parse(url)?, switches })
    }

    pub fn enabled(&self, event: NotifyEvent) -> bool {
        match event {
            NotifyEvent::Started => self.switches.on_start,
            NotifyEvent::Succeeded => self.switches.on_success,
            NotifyEvent::PartialSuccess => self.switches.on_partial,
            NotifyEvent::Failed => self.switches.on_failure,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: NotifyEvent, summary: &RunSummary) -> DimloadResult<()> {
        if !self.enabled(event) {
            return Ok(());
        }
        self.client
            .post(self.url.clone())
            .json(&WebhookPayload::new(event, summary))
            .send()
            .await?
            .error_for_status()?;
        tracing::debug!(run = %summary.run.id, event = %event, "webhook delivered");
        Ok(())
    }
}

/// Delivers to every sink concurrently; the first error in sink order is
/// returned after all were tried.
#[derive(Default, Clone)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, event: NotifyEvent, summary: &RunSummary) -> DimloadResult<()> {
        let results = join_all(self.sinks.iter().map(|sink| sink.notify(event, summary))).await;
        results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }
}
