use async_trait::async_trait;
use dimload_utils::{DimloadResult, TableData};

use crate::config::TableMapping;

/// Maps extracted rows into the target shape of one table.
#[async_trait]
pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;

    /// Transform one table. Failures are reported as `Error::Transformation`
    /// and only affect this table.
    async fn transform(&self, mapping: &TableMapping, data: TableData) -> DimloadResult<TableData>;
}
