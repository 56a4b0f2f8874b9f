use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arrow::array::{Array, BooleanArray, Date32Array, StringArray};
use arrow::compute;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::NaiveDate;

use dimload_utils::error::Error;
use dimload_utils::{DimloadResult, TableData};

use crate::orchestrator::window::ExtractionWindow;
use crate::sources::join::left_join;
use crate::sources::traits::{SourceConnection, SourceProvider, SourceQuery};

#[derive(Clone)]
enum MemoryTable {
    Rows(TableData),
    Broken(String),
}

type Tables = HashMap<String, MemoryTable>;

/// Source databases held in memory. Window filtering understands `Date32`
/// columns and `YYYY-MM-DD...` text columns.
#[derive(Clone, Default)]
pub struct MemorySourceProvider {
    databases: BTreeMap<String, Arc<Tables>>,
}

impl MemorySourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_database(&mut self, database: impl Into<String>) -> &mut Self {
        self.databases.entry(database.into()).or_default();
        self
    }

    pub fn add_table(
        &mut self,
        database: impl Into<String>,
        table: impl Into<String>,
        data: TableData,
    ) -> &mut Self {
        self.insert(database.into(), table.into(), MemoryTable::Rows(data));
        self
    }

    /// Every fetch of this table fails with `message`.
    pub fn fail_table(
        &mut self,
        database: impl Into<String>,
        table: impl Into<String>,
        message: impl Into<String>,
    ) -> &mut Self {
        self.insert(database.into(), table.into(), MemoryTable::Broken(message.into()));
        self
    }

    fn insert(&mut self, database: String, table: String, entry: MemoryTable) {
        let tables = self.databases.entry(database).or_default();
        Arc::make_mut(tables).insert(table, entry);
    }
}

#[async_trait]
impl SourceProvider for MemorySourceProvider {
    async fn list_databases(&self) -> DimloadResult<Vec<String>> {
        Ok(self.databases.keys().cloned().collect())
    }

    async fn connect(&self, database: &str) -> DimloadResult<Arc<dyn SourceConnection>> {
        let tables = self
            .databases
            .get(database)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("source database '{database}'")))?;
        Ok(Arc::new(MemoryConnection { name: database.to_string(), tables }))
    }
}

struct MemoryConnection {
    name: String,
    tables: Arc<Tables>,
}

#[async_trait]
impl SourceConnection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, query: &SourceQuery) -> DimloadResult<TableData> {
        let data = self.table(&query.table)?;
        let mut data = match &query.date_column {
            Some(column) => filter_window(&query.table, data, column, &query.window)?,
            None => data,
        };
        for join in &query.joins {
            let joined = self.table(&join.table)?;
            data = left_join(&query.table, data, joined, join)?;
        }
        Ok(data)
    }
}

impl MemoryConnection {
    fn table(&self, table: &str) -> DimloadResult<TableData> {
        match self.tables.get(table) {
            Some(MemoryTable::Rows(data)) => Ok(data.clone()),
            Some(MemoryTable::Broken(message)) => Err(Error::extraction(table, message)),
            None => Err(Error::extraction(
                table,
                format!("table '{table}' not found in '{}'", self.name),
            )),
        }
    }
}

fn filter_window(
    table: &str,
    data: TableData,
    column: &str,
    window: &ExtractionWindow,
) -> DimloadResult<TableData> {
    let schema = data.schema().clone();
    let index = schema
        .index_of(column)
        .map_err(|_| Error::extraction(table, format!("date column '{column}' not found")))?;

    let mut filtered = Vec::new();
    for batch in data.batches() {
        let mask = window_mask(batch, index, window)
            .ok_or_else(|| Error::extraction(table, format!("column '{column}' is not a date")))?;
        filtered.push(compute::filter_record_batch(batch, &mask)?);
    }
    Ok(TableData::new(schema, filtered))
}

fn window_mask(batch: &RecordBatch, index: usize, window: &ExtractionWindow) -> Option<BooleanArray> {
    let column = batch.column(index);
    if let Some(dates) = column.as_any().downcast_ref::<Date32Array>() {
        return Some(
            (0..dates.len())
                .map(|i| Some(!dates.is_null(i) && window.contains(dates.value_as_date(i)?)))
                .collect(),
        );
    }
    let text = column.as_any().downcast_ref::<StringArray>()?;
    Some(
        (0..text.len())
            .map(|i| {
                if text.is_null(i) {
                    return Some(false);
                }
                let day = text.value(i).get(..10)?;
                let date = NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()?;
                Some(window.contains(date))
            })
            .map(|keep| Some(keep.unwrap_or(false)))
            .collect(),
    )
}
