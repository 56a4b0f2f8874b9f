use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;

use dimload_utils::error::Error;
use dimload_utils::DimloadResult;

use crate::builder::BuildError;
use crate::config::EtlConfig;
use crate::events::schedule::Schedule;
use crate::events::trigger::TriggerEvent;
use crate::orchestrator::{Orchestrator, TriggerRequest};

/// Runs the orchestrator on a schedule until shutdown.
pub struct DimloadFlow {
    orchestrator: Orchestrator,
    every: Option<Duration>,
    run_on_startup: bool,
}

impl DimloadFlow {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator, every: None, run_on_startup: false }
    }

    /// Build the orchestrator and schedule from a config file's contents.
    pub fn from_config(config: &EtlConfig) -> Result<Self, BuildError> {
        let mut flow = Self::new(Orchestrator::from_config(config)?);
        if let Some(schedule) = &config.schedule {
            flow = flow.every(schedule.interval()?).run_on_startup(schedule.run_on_startup);
        }
        Ok(flow)
    }

    /// Trigger a scheduled run every `interval`.
    pub fn every(mut self, interval: Duration) -> Self {
        self.every = Some(interval);
        self
    }

    pub fn run_on_startup(mut self, enabled: bool) -> Self {
        self.run_on_startup = enabled;
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> DimloadResult<()> {
        let shutdown = tokio::signal::ctrl_c();
        self.run_with_shutdown(async {
            let _ = shutdown.await;
        })
        .await
    }

    /// Run until `shutdown` resolves. In-flight runs are awaited, never aborted.
    pub async fn run_with_shutdown<F: Future>(self, shutdown: F) -> DimloadResult<()> {
        // Crash recovery
        self.orchestrator.fail_interrupted_runs().await?;

        let environment = self.orchestrator.environment().to_string();
        let mut triggers = Schedule::new(environment.clone(), self.every, self.run_on_startup).start();
        tracing::info!(environment = %environment, every = ?self.every, "scheduler started");

        let mut runs = JoinSet::new();
        let mut open = true;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = triggers.next(), if open => match event {
                    Some(event) => self.dispatch(event, &mut runs),
                    None => open = false,
                },
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "scheduled run task panicked");
                    }
                }
            }
        }

        // Stops the ticker; in-flight runs finish.
        drop(triggers);
        while let Some(joined) = runs.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "scheduled run task panicked");
            }
        }
        tracing::info!("dimload shutdown complete");
        Ok(())
    }

    fn dispatch(&self, event: TriggerEvent, runs: &mut JoinSet<()>) {
        let orchestrator = self.orchestrator.clone();
        runs.spawn(async move {
            let mode = event.mode();
            match orchestrator.start(TriggerRequest::default(), mode).await {
                Ok(response) => {
                    tracing::debug!(run = %response.run_id, trigger = ?event.trigger, "scheduled run finished")
                }
                Err(Error::AlreadyRunning(active)) => {
                    tracing::info!(active = %active, "run in progress, trigger dropped")
                }
                Err(e) => tracing::error!(error = %e, trigger = ?event.trigger, "scheduled run rejected"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use dimload_utils::TableData;

    use crate::builder::OrchestratorBuilder;
    use crate::config::{ColumnMapping, TableMapping};
    use crate::events::trigger::TriggerMode;
    use crate::sources::memory::MemorySourceProvider;

    fn orchestrator() -> Orchestrator {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(vec![1, 2]))]).unwrap();
        let mut sources = MemorySourceProvider::new();
        sources.add_table("tenant_a", "users", TableData::new(schema, vec![batch]));

        OrchestratorBuilder::new("engine-test")
            .source_provider(sources)
            .table(TableMapping::Dimension {
                target: "dim_user".into(),
                source_table: "users".into(),
                natural_key: vec!["user_id".into()],
                columns: vec![ColumnMapping { source: "id".into(), target: "user_id".into(), coerce: None }],
                incremental_column: None,
                source_db_column: None,
                joins: vec![],
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn engine_runs_on_schedule_and_shuts_down() {
        let orchestrator = orchestrator();
        let flow = DimloadFlow::new(orchestrator.clone())
            .every(Duration::from_millis(100))
            .run_on_startup(true);

        flow.run_with_shutdown(async {
            tokio::time::sleep(Duration::from_millis(450)).await;
        })
        .await
        .unwrap();

        let runs = orchestrator.recent_runs(50).await.unwrap();
        assert!(runs.len() >= 2, "expected at least 2 runs, got {}", runs.len());
        assert!(runs.iter().all(|r| r.mode == TriggerMode::Scheduled));
        assert!(runs.iter().all(|r| r.finished_at.is_some()));
        assert!(orchestrator.active_run().is_none());
    }

    #[tokio::test]
    async fn engine_without_schedule_waits_for_shutdown() {
        let orchestrator = orchestrator();
        DimloadFlow::new(orchestrator.clone())
            .run_with_shutdown(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(orchestrator.recent_runs(10).await.unwrap().is_empty());
    }
}
