use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BinaryArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};

use dimload_utils::error::Error;
use dimload_utils::{DimloadResult, TableData};

use crate::sources::traits::{SourceConnection, SourceProvider, SourceQuery};

/// Source databases stored as SQLite files, opened read-only.
pub struct SqliteSourceProvider {
    databases: BTreeMap<String, PathBuf>,
}

impl SqliteSourceProvider {
    pub fn new(databases: BTreeMap<String, PathBuf>) -> Self {
        Self { databases }
    }
}

#[async_trait]
impl SourceProvider for SqliteSourceProvider {
    async fn list_databases(&self) -> DimloadResult<Vec<String>> {
        Ok(self.databases.keys().cloned().collect())
    }

    async fn connect(&self, database: &str) -> DimloadResult<Arc<dyn SourceConnection>> {
        let path = self
            .databases
            .get(database)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("source database '{database}'")))?;
        Ok(Arc::new(SqliteSource { name: database.to_string(), path }))
    }
}

pub struct SqliteSource {
    name: String,
    path: PathBuf,
}

#[async_trait]
impl SourceConnection for SqliteSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, query: &SourceQuery) -> DimloadResult<TableData> {
        let path = self.path.clone();
        let query = query.clone();
        let table = query.table.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            read_table(&conn, &query)
        })
        .await?
        .map_err(|e| match e {
            Error::StoreError(inner) => Error::extraction(table, inner),
            other => other,
        })
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `column` qualified by `table`, or as written when it is already `table.column`.
fn qualified(table: &str, column: &str) -> String {
    match column.split_once('.') {
        Some((owner, name)) => format!("{}.{}", quote(owner), quote(name)),
        None => format!("{}.{}", quote(table), quote(column)),
    }
}

fn table_columns(conn: &Connection, table: &str) -> DimloadResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let names = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    if names.is_empty() {
        return Err(Error::extraction(table, format!("joined table '{table}' not found")));
    }
    Ok(names)
}

/// SELECT over the primary table with every join pushed into SQLite.
fn select_sql(conn: &Connection, query: &SourceQuery) -> DimloadResult<String> {
    let primary = quote(&query.table);
    let mut select = vec![format!("{primary}.*")];
    let mut from = primary.clone();
    for join in &query.joins {
        let joined = quote(&join.table);
        for column in table_columns(conn, &join.table)? {
            select.push(format!(
                "{joined}.{} AS {}",
                quote(&column),
                quote(&format!("{}.{column}", join.table))
            ));
        }
        from.push_str(&format!(
            " LEFT JOIN {joined} ON {} = {joined}.{}",
            qualified(&query.table, &join.left),
            quote(&join.right)
        ));
    }
    Ok(format!("SELECT {} FROM {from}", select.join(", ")))
}

/// Read one table, with its joins, into a single batch, inferring column
/// types from the storage classes SQLite reports.
pub(crate) fn read_table(conn: &Connection, query: &SourceQuery) -> DimloadResult<TableData> {
    let mut sql = select_sql(conn, query)?;
    let mut params: Vec<String> = Vec::new();
    if let Some(column) = &query.date_column {
        sql.push_str(&format!(
            " WHERE {col} >= ?1 AND {col} < ?2",
            col = qualified(&query.table, column)
        ));
        params.push(query.window.start.format("%Y-%m-%d").to_string());
        params.push(query.window.end.format("%Y-%m-%d").to_string());
    }

    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = names.len();

    let mut columns: Vec<Vec<Value>> = vec![Vec::new(); width];
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    while let Some(row) = rows.next()? {
        for (i, column) in columns.iter_mut().enumerate() {
            column.push(row.get::<_, Value>(i)?);
        }
    }

    let mut fields = Vec::with_capacity(width);
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(width);
    for (name, values) in names.iter().zip(columns) {
        let (data_type, array) = build_column(values);
        fields.push(Field::new(name, data_type, true));
        arrays.push(array);
    }

    let schema = Arc::new(Schema::new(fields));
    if arrays.first().map_or(true, |a| a.is_empty()) {
        return Ok(TableData::empty(schema));
    }
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;
    Ok(TableData::new(schema, vec![batch]))
}

fn build_column(values: Vec<Value>) -> (DataType, ArrayRef) {
    let mut has_int = false;
    let mut has_real = false;
    let mut has_text = false;
    let mut has_blob = false;
    for value in &values {
        match value {
            Value::Integer(_) => has_int = true,
            Value::Real(_) => has_real = true,
            Value::Text(_) => has_text = true,
            Value::Blob(_) => has_blob = true,
            Value::Null => {}
        }
    }

    if has_blob && !(has_int || has_real || has_text) {
        let array: BinaryArray = values
            .iter()
            .map(|v| match v {
                Value::Blob(b) => Some(b.as_slice()),
                _ => None,
            })
            .collect();
        return (DataType::Binary, Arc::new(array));
    }
    if has_text || has_blob {
        let array: StringArray = values.iter().map(text_value).collect();
        return (DataType::Utf8, Arc::new(array));
    }
    if has_real {
        let array: Float64Array = values
            .iter()
            .map(|v| match v {
                Value::Integer(i) => Some(*i as f64),
                Value::Real(r) => Some(*r),
                _ => None,
            })
            .collect();
        return (DataType::Float64, Arc::new(array));
    }
    if has_int {
        let array: Int64Array = values
            .iter()
            .map(|v| match v {
                Value::Integer(i) => Some(*i),
                _ => None,
            })
            .collect();
        return (DataType::Int64, Arc::new(array));
    }
    let array: StringArray = values.iter().map(|_| None::<&str>).collect();
    (DataType::Utf8, Arc::new(array))
}

fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(r) => Some(r.to_string()),
        Value::Text(t) => Some(t.clone()),
        Value::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    }
}
