use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, StringArray};
use arrow::compute::{self, CastOptions};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;

use dimload_utils::error::Error;
use dimload_utils::{DimloadResult, TableData};

use crate::config::TableMapping;
use crate::transforms::traits::Transformer;

/// Column the extractor adds to carry the originating database of each row.
pub const SOURCE_DB_FIELD: &str = "_source_db";

/// Append a constant `_source_db` column naming `database` to every batch.
pub fn stamp_source(data: TableData, database: &str) -> DimloadResult<TableData> {
    let mut fields: Vec<Field> = data.schema().fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new(SOURCE_DB_FIELD, DataType::Utf8, false));
    let schema: SchemaRef = Arc::new(Schema::new(fields));

    let mut batches = Vec::with_capacity(data.batches().len());
    for batch in data.batches() {
        let mut columns = batch.columns().to_vec();
        columns.push(Arc::new(StringArray::from(vec![database; batch.num_rows()])));
        batches.push(RecordBatch::try_new(schema.clone(), columns)?);
    }
    Ok(TableData::new(schema, batches))
}

/// Projects, coerces and renames columns as a `TableMapping` describes, then
/// drops rows with a null natural key.
#[derive(Debug, Default, Clone, Copy)]
pub struct MappingTransformer;

struct Plan {
    schema: SchemaRef,
    /// (input column index, output type) per output column
    columns: Vec<(usize, DataType)>,
    /// output column indexes that must be non-null
    required: Vec<usize>,
}

impl MappingTransformer {
    pub fn new() -> Self {
        Self
    }

    fn plan(mapping: &TableMapping, input: &Schema) -> DimloadResult<Plan> {
        let table = mapping.target();
        let mut fields = Vec::new();
        let mut columns = Vec::new();

        for column in mapping.columns() {
            let index = input.index_of(&column.source).map_err(|_| {
                Error::transformation(table, format!("source column '{}' not found", column.source))
            })?;
            let data_type = column
                .coerce
                .map(|c| c.data_type())
                .unwrap_or_else(|| input.field(index).data_type().clone());
            fields.push(Field::new(&column.target, data_type.clone(), true));
            columns.push((index, data_type));
        }

        if let Some(stamp) = mapping.source_db_column() {
            let index = input.index_of(SOURCE_DB_FIELD).map_err(|_| {
                Error::transformation(table, "rows carry no source database to stamp")
            })?;
            fields.push(Field::new(stamp, DataType::Utf8, true));
            columns.push((index, DataType::Utf8));
        }

        let required = mapping
            .required_columns()
            .iter()
            .filter_map(|key| fields.iter().position(|f| f.name() == key))
            .collect();

        Ok(Plan { schema: Arc::new(Schema::new(fields)), columns, required })
    }

    fn apply(table: &str, plan: &Plan, batch: &RecordBatch) -> DimloadResult<RecordBatch> {
        let options = CastOptions { safe: false, ..Default::default() };
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(plan.columns.len());
        for ((index, data_type), field) in plan.columns.iter().zip(plan.schema.fields()) {
            let source = batch.column(*index);
            let array = if source.data_type() == data_type {
                source.clone()
            } else {
                compute::cast_with_options(source, data_type, &options).map_err(|e| {
                    Error::transformation(table, format!("column '{}': {e}", field.name()))
                })?
            };
            arrays.push(array);
        }
        let projected = RecordBatch::try_new(plan.schema.clone(), arrays)?;

        if plan.required.is_empty() {
            return Ok(projected);
        }
        let mut keep = BooleanArray::from(vec![true; projected.num_rows()]);
        for index in &plan.required {
            let present = compute::is_not_null(projected.column(*index).as_ref())?;
            keep = compute::and(&keep, &present)?;
        }
        let dropped = keep.len() - keep.true_count();
        if dropped > 0 {
            tracing::debug!(table = %table, dropped, "dropped rows with null natural key");
        }
        Ok(compute::filter_record_batch(&projected, &keep)?)
    }
}

#[async_trait]
impl Transformer for MappingTransformer {
    fn name(&self) -> &str {
        "mapping"
    }

    async fn transform(&self, mapping: &TableMapping, data: TableData) -> DimloadResult<TableData> {
        let table = mapping.target();
        let plan = Self::plan(mapping, data.schema())?;
        let mut batches = Vec::with_capacity(data.batches().len());
        for batch in data.batches() {
            batches.push(Self::apply(table, &plan, batch)?);
        }
        Ok(TableData::new(plan.schema, batches))
    }
}
