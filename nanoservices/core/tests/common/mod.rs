#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::NaiveDate;

use dimload_core::builder::OrchestratorBuilder;
use dimload_core::config::{ColumnMapping, LoadStrategy, PipelineSettings, StoreKind, TableMapping};
use dimload_core::destinations::{SqliteTarget, TargetProvider, TargetStore};
use dimload_core::events::{Notifier, NotifyEvent};
use dimload_core::orchestrator::{Orchestrator, RunSummary};
use dimload_core::sources::memory::MemorySourceProvider;
use dimload_core::transforms::{MappingTransformer, Transformer};
use dimload_utils::error::Error;
use dimload_utils::{DimloadResult, TableData};

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

pub fn people(ids: &[i64]) -> TableData {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, true),
        Field::new("name", DataType::Utf8, true),
    ]));
    let names: Vec<String> = ids.iter().map(|id| format!("name-{id}")).collect();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(ids.to_vec())),
            Arc::new(StringArray::from(names)),
        ],
    )
    .unwrap();
    TableData::new(schema, vec![batch])
}

pub fn dimension(target: &str, source_table: &str) -> TableMapping {
    TableMapping::Dimension {
        target: target.into(),
        source_table: source_table.into(),
        natural_key: vec!["key".into()],
        columns: vec![
            ColumnMapping { source: "id".into(), target: "key".into(), coerce: None },
            ColumnMapping { source: "name".into(), target: "label".into(), coerce: None },
        ],
        incremental_column: None,
        source_db_column: None,
        joins: vec![],
    }
}

/// One source database holding `a_src`, `b_src` and `c_src`.
pub fn sources() -> MemorySourceProvider {
    let mut sources = MemorySourceProvider::new();
    sources
        .add_table("tenant_acme", "a_src", people(&[1, 2, 3]))
        .add_table("tenant_acme", "b_src", people(&[4, 5]))
        .add_table("tenant_acme", "c_src", people(&[6]));
    sources
}

pub fn tables() -> Vec<TableMapping> {
    vec![dimension("A", "a_src"), dimension("B", "b_src"), dimension("C", "c_src")]
}

/// SQLite target whose inserts fail for chosen tables, optionally after a delay.
pub struct FlakyTarget {
    inner: SqliteTarget,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl FlakyTarget {
    pub fn new(failing: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteTarget::in_memory().unwrap(),
            failing: Mutex::new(failing.iter().map(|t| t.to_string()).collect()),
            delay: Mutex::new(None),
        })
    }

    /// Let loads of `table` succeed from now on.
    pub fn heal(&self, table: &str) {
        self.failing.lock().unwrap().remove(table);
    }

    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl TargetStore for FlakyTarget {
    fn kind(&self) -> &str {
        "flaky"
    }

    async fn create_table_if_absent(&self, table: &str, schema: &SchemaRef) -> DimloadResult<()> {
        self.inner.create_table_if_absent(table, schema).await
    }

    async fn bulk_insert(&self, table: &str, rows: &TableData) -> DimloadResult<u64> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(table) {
            return Err(Error::load(table, "synthetic load failure"));
        }
        self.inner.bulk_insert(table, rows).await
    }

    async fn count_rows(&self, table: &str) -> DimloadResult<Option<u64>> {
        self.inner.count_rows(table).await
    }

    async fn list_tables(&self) -> DimloadResult<Vec<String>> {
        self.inner.list_tables().await
    }
}

pub struct FlakyProvider(pub Arc<FlakyTarget>);

#[async_trait]
impl TargetProvider for FlakyProvider {
    async fn connect(&self, _kind: &StoreKind) -> DimloadResult<Arc<dyn TargetStore>> {
        Ok(self.0.clone())
    }
}

/// Keeps every lifecycle event; optionally fails each delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<(NotifyEvent, String)>>,
    pub fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().unwrap().iter().map(|(event, _)| *event).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: NotifyEvent, summary: &RunSummary) -> DimloadResult<()> {
        self.events.lock().unwrap().push((event, summary.run.id.clone()));
        if self.fail {
            return Err(Error::Configuration("notifier unreachable".into()));
        }
        Ok(())
    }
}

/// Panics while transforming one table; every other table is mapped normally.
pub struct PanickingTransformer {
    pub table: String,
    inner: MappingTransformer,
}

impl PanickingTransformer {
    pub fn on(table: &str) -> Self {
        Self { table: table.to_string(), inner: MappingTransformer::new() }
    }
}

#[async_trait]
impl Transformer for PanickingTransformer {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn transform(&self, mapping: &TableMapping, data: TableData) -> DimloadResult<TableData> {
        if mapping.target() == self.table {
            panic!("transformer bug on {}", self.table);
        }
        self.inner.transform(mapping, data).await
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub target: Arc<FlakyTarget>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn settings(strategy: LoadStrategy) -> PipelineSettings {
    PipelineSettings {
        default_start_date: Some(d(2024, 1, 1)),
        load_strategy: strategy,
        parallelism: 2,
        ..PipelineSettings::default()
    }
}

/// Orchestrator over [`sources`] and [`tables`] with the watermark at 2024-01-01.
pub fn harness(strategy: LoadStrategy, failing: &[&str]) -> Harness {
    harness_with(sources(), tables(), strategy, failing, RecordingNotifier::default())
}

pub fn harness_with(
    sources: MemorySourceProvider,
    tables: Vec<TableMapping>,
    strategy: LoadStrategy,
    failing: &[&str],
    notifier: RecordingNotifier,
) -> Harness {
    build_harness(sources, tables, strategy, failing, notifier, MappingTransformer::new())
}

/// [`harness`] with a custom transformer.
pub fn harness_transforming(
    strategy: LoadStrategy,
    transformer: impl Transformer + 'static,
) -> Harness {
    build_harness(sources(), tables(), strategy, &[], RecordingNotifier::default(), transformer)
}

fn build_harness(
    sources: MemorySourceProvider,
    tables: Vec<TableMapping>,
    strategy: LoadStrategy,
    failing: &[&str],
    notifier: RecordingNotifier,
    transformer: impl Transformer + 'static,
) -> Harness {
    dimload_core::logging::init_with_default("warn");
    let target = FlakyTarget::new(failing);
    let notifier = Arc::new(notifier);
    let orchestrator = OrchestratorBuilder::new("test")
        .source_provider(sources)
        .target_provider(FlakyProvider(target.clone()))
        .transformer(transformer)
        .notifier(notifier.clone())
        .settings(settings(strategy))
        .tables(tables)
        .build()
        .unwrap();
    Harness { orchestrator, target, notifier }
}
