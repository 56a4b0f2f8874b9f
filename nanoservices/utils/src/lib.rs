pub mod error;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use error::Error;
use std::sync::Arc;

pub type DimloadResult<T> = Result<T, Error>;

/// Rows of one table moving between pipeline stages.
#[derive(Clone, Debug)]
pub struct TableData {
    schema: SchemaRef,
    batches: Arc<Vec<RecordBatch>>,
}

impl TableData {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        TableData { schema, batches: Arc::new(batches) }
    }

    /// A table with a known schema and no rows.
    pub fn empty(schema: SchemaRef) -> Self {
        Self::new(schema, Vec::new())
    }

    /// Build from batches that are known to be non-empty; the schema is taken
    /// from the first batch.
    pub fn from_batches(batches: Vec<RecordBatch>) -> Option<Self> {
        let schema = batches.first()?.schema();
        Some(Self::new(schema, batches))
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &Vec<RecordBatch> {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<RecordBatch> {
        Arc::try_unwrap(self.batches).unwrap_or_else(|shared| (*shared).clone())
    }

    pub fn num_rows(&self) -> u64 {
        self.batches.iter().map(|b| b.num_rows() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Concatenate several tables sharing one schema.
    pub fn concat(schema: SchemaRef, parts: Vec<TableData>) -> Result<Self, Error> {
        let mut batches = Vec::new();
        for part in parts {
            if part.schema.fields() != schema.fields() {
                return Err(Error::ArrowDataError(arrow::error::ArrowError::SchemaError(
                    format!("schema mismatch: expected {:?}, got {:?}", schema, part.schema),
                )));
            }
            batches.extend(part.into_batches());
        }
        Ok(Self::new(schema, batches))
    }
}
