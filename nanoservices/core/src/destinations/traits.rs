use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use async_trait::async_trait;
use dimload_utils::{DimloadResult, TableData};

use crate::config::StoreKind;

/// Write side of the analytical store.
#[async_trait]
pub trait TargetStore: Send + Sync {
    fn kind(&self) -> &str;

    async fn create_table_if_absent(&self, table: &str, schema: &SchemaRef) -> DimloadResult<()>;

    /// Insert every row of `rows`, all or nothing. Returns the rows written.
    async fn bulk_insert(&self, table: &str, rows: &TableData) -> DimloadResult<u64>;

    /// Row count, or `None` when the table does not exist.
    async fn count_rows(&self, table: &str) -> DimloadResult<Option<u64>>;

    async fn list_tables(&self) -> DimloadResult<Vec<String>>;
}

/// Yields the target store for the configured kind.
#[async_trait]
pub trait TargetProvider: Send + Sync {
    async fn connect(&self, kind: &StoreKind) -> DimloadResult<Arc<dyn TargetStore>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingTarget {
        count: AtomicU64,
    }

    #[async_trait]
    impl TargetStore for CountingTarget {
        fn kind(&self) -> &str { "counter" }
        async fn create_table_if_absent(&self, _: &str, _: &SchemaRef) -> DimloadResult<()> {
            Ok(())
        }
        async fn bulk_insert(&self, _: &str, rows: &TableData) -> DimloadResult<u64> {
            self.count.fetch_add(rows.num_rows(), Ordering::SeqCst);
            Ok(rows.num_rows())
        }
        async fn count_rows(&self, _: &str) -> DimloadResult<Option<u64>> {
            Ok(Some(self.count.load(Ordering::SeqCst)))
        }
        async fn list_tables(&self) -> DimloadResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn target_trait_works() {
        let target = CountingTarget { count: AtomicU64::new(0) };
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int32Array::from(vec![1, 2, 3]))],
        ).unwrap();

        assert_eq!(target.bulk_insert("t", &TableData::new(schema, vec![batch])).await.unwrap(), 3);
        assert_eq!(target.count_rows("t").await.unwrap(), Some(3));
        assert_eq!(target.kind(), "counter");
    }
}
