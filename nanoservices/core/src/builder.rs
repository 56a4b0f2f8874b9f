use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{EtlConfig, PipelineSettings, StoreKind, TableMapping};
use crate::destinations::sqlite::LocalTargetProvider;
use crate::destinations::traits::TargetProvider;
use crate::events::notifier::{FanoutNotifier, LogNotifier, Notifier, WebhookNotifier};
use crate::orchestrator::guard::RunSlot;
use crate::orchestrator::{Inner, Orchestrator};
use crate::sources::catalog::SourceCatalog;
use crate::sources::sqlite::SqliteSourceProvider;
use crate::sources::traits::SourceProvider;
use crate::store::{CheckpointStore, RunLedger, Store};
use crate::transforms::mapping::MappingTransformer;
use crate::transforms::traits::Transformer;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("environment is required")]
    NoEnvironment,
    #[error("a source provider is required")]
    NoSource,
    #[error("at least one table mapping is required")]
    NoTables,
    #[error("invalid configuration: {0}")]
    Invalid(#[from] dimload_utils::error::Error),
    #[error("state store: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Wires an [`Orchestrator`] from its collaborators. Everything except the
/// source provider and the tables has a local default: SQLite target, mapping
/// transformer, in-memory state store and a log-only notifier.
pub struct OrchestratorBuilder {
    environment: String,
    sources: Option<Arc<dyn SourceProvider>>,
    include_keywords: Vec<String>,
    exclude_keywords: Vec<String>,
    targets: Option<Arc<dyn TargetProvider>>,
    target_kind: StoreKind,
    transformer: Option<Arc<dyn Transformer>>,
    store: Option<Store>,
    notifiers: Vec<Arc<dyn Notifier>>,
    settings: PipelineSettings,
    tables: Vec<TableMapping>,
}

impl OrchestratorBuilder {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            sources: None,
            include_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            targets: None,
            target_kind: StoreKind::Local { path: None },
            transformer: None,
            store: None,
            notifiers: Vec::new(),
            settings: PipelineSettings::default(),
            tables: Vec::new(),
        }
    }

    pub fn source_provider(mut self, provider: impl SourceProvider + 'static) -> Self {
        self.sources = Some(Arc::new(provider));
        self
    }

    pub fn include_keywords(mut self, keywords: &[String]) -> Self {
        self.include_keywords = keywords.to_vec();
        self
    }

    pub fn exclude_keywords(mut self, keywords: &[String]) -> Self {
        self.exclude_keywords = keywords.to_vec();
        self
    }

    pub fn target_provider(mut self, provider: impl TargetProvider + 'static) -> Self {
        self.targets = Some(Arc::new(provider));
        self
    }

    pub fn target(mut self, kind: StoreKind) -> Self {
        self.target_kind = kind;
        self
    }

    pub fn transformer(mut self, transformer: impl Transformer + 'static) -> Self {
        self.transformer = Some(Arc::new(transformer));
        self
    }

    /// State store holding the run ledger and checkpoint.
    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Add a notification sink. May be called repeatedly.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn table(mut self, mapping: TableMapping) -> Self {
        self.tables.push(mapping);
        self
    }

    pub fn tables(mut self, mappings: impl IntoIterator<Item = TableMapping>) -> Self {
        self.tables.extend(mappings);
        self
    }

    pub fn build(self) -> Result<Orchestrator, BuildError> {
        if self.environment.trim().is_empty() {
            return Err(BuildError::NoEnvironment);
        }
        let sources = self.sources.ok_or(BuildError::NoSource)?;
        if self.tables.is_empty() {
            return Err(BuildError::NoTables);
        }
        validate_tables(&self.tables)?;

        let store = match self.store {
            Some(store) => store,
            None => Store::in_memory()?,
        };
        let store = Arc::new(Mutex::new(store));

        let catalog = SourceCatalog::new(sources)
            .include_keywords(&self.include_keywords)
            .exclude_keywords(&self.exclude_keywords);
        let checkpoints = CheckpointStore::new(store.clone(), self.environment)
            .default_start(self.settings.default_start_date)
            .auto_update(self.settings.auto_update_checkpoint);

        let notifier: Arc<dyn Notifier> = match self.notifiers.len() {
            0 => Arc::new(LogNotifier),
            1 => self.notifiers[0].clone(),
            _ => Arc::new(
                self.notifiers
                    .into_iter()
                    .fold(FanoutNotifier::new(), |fanout, sink| fanout.with(sink)),
            ),
        };

        Ok(Orchestrator::from_inner(Inner {
            catalog,
            targets: self.targets.unwrap_or_else(|| Arc::new(LocalTargetProvider::new())),
            target_kind: self.target_kind,
            transformer: self.transformer.unwrap_or_else(|| Arc::new(MappingTransformer::new())),
            ledger: RunLedger::new(store),
            checkpoints,
            notifier,
            settings: self.settings,
            tables: self.tables,
            slot: RunSlot::new(),
        }))
    }
}

fn validate_tables(tables: &[TableMapping]) -> Result<(), BuildError> {
    let mut names = HashSet::new();
    for table in tables {
        table.validate()?;
        if !names.insert(table.target().to_ascii_lowercase()) {
            return Err(BuildError::Invalid(dimload_utils::error::Error::Configuration(format!(
                "duplicate target table '{}'",
                table.target()
            ))));
        }
    }
    Ok(())
}

impl Orchestrator {
    /// Build from a validated config: SQLite sources and target, persistent
    /// state when `state_path` is set, log notifier plus webhook if configured.
    pub fn from_config(config: &EtlConfig) -> Result<Self, BuildError> {
        config.validate()?;

        let store = match &config.state_path {
            Some(path) => Store::open(path)?,
            None => Store::in_memory()?,
        };

        let mut builder = OrchestratorBuilder::new(config.environment.clone())
            .source_provider(SqliteSourceProvider::new(config.sources.databases.clone()))
            .include_keywords(&config.sources.include_keywords)
            .exclude_keywords(&config.sources.exclude_keywords)
            .target(config.target.clone())
            .store(store)
            .settings(config.pipeline.clone())
            .tables(config.tables.iter().cloned())
            .notifier(Arc::new(LogNotifier));

        if let Some(url) = &config.notifications.webhook_url {
            let webhook = WebhookNotifier::from_config(url, config.notifications.clone())?;
            builder = builder.notifier(Arc::new(webhook));
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config, ColumnMapping};
    use crate::sources::memory::MemorySourceProvider;

    fn users() -> TableMapping {
        TableMapping::Dimension {
            target: "dim_user".into(),
            source_table: "users".into(),
            natural_key: vec!["user_id".into()],
            columns: vec![ColumnMapping { source: "id".into(), target: "user_id".into(), coerce: None }],
            incremental_column: None,
            source_db_column: None,
            joins: vec![],
        }
    }

    #[test]
    fn builder_requires_source() {
        let result = OrchestratorBuilder::new("local").table(users()).build();
        assert!(matches!(result, Err(BuildError::NoSource)));
    }

    #[test]
    fn builder_requires_tables() {
        let result = OrchestratorBuilder::new("local")
            .source_provider(MemorySourceProvider::new())
            .build();
        assert!(matches!(result, Err(BuildError::NoTables)));
    }

    #[test]
    fn builder_rejects_duplicate_targets() {
        let result = OrchestratorBuilder::new("local")
            .source_provider(MemorySourceProvider::new())
            .tables([users(), users()])
            .build();
        assert!(matches!(result, Err(BuildError::Invalid(_))));
    }

    #[tokio::test]
    async fn from_config_builds_in_memory_orchestrator() {
        let config = parse_config(
            r#"
environment: test
pipeline:
  default_start_date: 2024-01-01
sources:
  databases: {}
target:
  kind: local
tables:
  - kind: fact
    target: fact_order
    source_table: orders
    event_column: created_at
    columns:
      - { source: id, target: order_id }
"#,
        )
        .unwrap();

        let orchestrator = Orchestrator::from_config(&config).unwrap();
        assert_eq!(orchestrator.tables().len(), 1);
        assert!(orchestrator.active_run().is_none());

        let status = orchestrator.checkpoint_status().await.unwrap();
        assert_eq!(status.checkpoint.last_date, None);
        assert_eq!(status.checkpoint.effective_start.to_string(), "2024-01-01");
    }

    #[test]
    fn from_config_rejects_invalid_config() {
        let config = parse_config(
            r#"
environment: ""
sources: {}
target: { kind: local }
tables: []
"#,
        )
        .unwrap();
        assert!(matches!(Orchestrator::from_config(&config), Err(BuildError::Invalid(_))));
    }
}
