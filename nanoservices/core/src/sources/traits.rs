use std::sync::Arc;

use async_trait::async_trait;
use dimload_utils::{DimloadResult, TableData};

use crate::config::SourceJoin;
use crate::orchestrator::window::ExtractionWindow;

/// What to pull from one source table.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    pub table: String,
    /// Date column of `table` restricted to `[window.start, window.end)`.
    /// Full table when absent.
    pub date_column: Option<String>,
    pub window: ExtractionWindow,
    /// Left joins applied in order; joined columns are named `table.column`.
    pub joins: Vec<SourceJoin>,
}

/// A read-only row source for one database. Dialect is the implementation's concern.
#[async_trait]
pub trait SourceConnection: Send + Sync {
    /// Database identifier, for logging
    fn name(&self) -> &str;

    async fn fetch(&self, query: &SourceQuery) -> DimloadResult<TableData>;
}

/// Yields connections to the candidate source databases.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Every database the provider can reach, before keyword filtering.
    async fn list_databases(&self) -> DimloadResult<Vec<String>>;

    async fn connect(&self, database: &str) -> DimloadResult<Arc<dyn SourceConnection>>;
}
