use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, UInt32Array};
use arrow::compute;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

use dimload_utils::error::Error;
use dimload_utils::{DimloadResult, TableData};

use crate::config::SourceJoin;

/// Left-join `right` onto `left`. Every left row is kept; a left row with
/// several matches is repeated once per match. Keys are compared on their text
/// form and nulls never match. Right columns are renamed `table.column`.
pub(crate) fn left_join(
    source: &str,
    left: TableData,
    right: TableData,
    join: &SourceJoin,
) -> DimloadResult<TableData> {
    let left = compute::concat_batches(left.schema(), left.batches().iter())?;
    let right = compute::concat_batches(right.schema(), right.batches().iter())?;

    let left_keys = key_column(source, &left, &join.left)?;
    let right_keys = key_column(&join.table, &right, &join.right)?;
    let left_keys = left_keys.as_string::<i32>();
    let right_keys = right_keys.as_string::<i32>();

    let mut matches: HashMap<&str, Vec<u32>> = HashMap::new();
    for row in 0..right_keys.len() {
        if right_keys.is_valid(row) {
            matches.entry(right_keys.value(row)).or_default().push(row as u32);
        }
    }

    let mut left_rows = Vec::with_capacity(left_keys.len());
    let mut right_rows = Vec::with_capacity(left_keys.len());
    for row in 0..left_keys.len() {
        let found = left_keys
            .is_valid(row)
            .then(|| matches.get(left_keys.value(row)))
            .flatten();
        match found {
            Some(hits) => {
                for hit in hits {
                    left_rows.push(row as u32);
                    right_rows.push(Some(*hit));
                }
            }
            None => {
                left_rows.push(row as u32);
                right_rows.push(None);
            }
        }
    }
    let left_rows = UInt32Array::from(left_rows);
    let right_rows = UInt32Array::from(right_rows);

    let mut fields: Vec<Field> = left.schema().fields().iter().map(|f| f.as_ref().clone()).collect();
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(left.num_columns() + right.num_columns());
    for column in left.columns() {
        columns.push(compute::take(column.as_ref(), &left_rows, None)?);
    }
    for (field, column) in right.schema().fields().iter().zip(right.columns()) {
        fields.push(Field::new(
            format!("{}.{}", join.table, field.name()),
            field.data_type().clone(),
            true,
        ));
        columns.push(compute::take(column.as_ref(), &right_rows, None)?);
    }

    let schema = Arc::new(Schema::new(fields));
    if left_rows.is_empty() {
        return Ok(TableData::empty(schema));
    }
    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    Ok(TableData::new(schema, vec![batch]))
}

fn key_column(table: &str, batch: &RecordBatch, column: &str) -> DimloadResult<ArrayRef> {
    let index = batch
        .schema()
        .index_of(column)
        .map_err(|_| Error::extraction(table, format!("join column '{column}' not found")))?;
    Ok(compute::cast(batch.column(index), &DataType::Utf8)?)
}
