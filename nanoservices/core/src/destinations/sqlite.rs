use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Float32Array, Float64Array,
    Int16Array, Int32Array, Int64Array, Int8Array, LargeStringArray, StringArray, UInt16Array,
    UInt32Array, UInt64Array, UInt8Array,
};
use arrow::datatypes::{DataType, SchemaRef};
use arrow::util::display::array_value_to_string;
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use dimload_utils::error::Error;
use dimload_utils::{DimloadResult, TableData};

use crate::config::StoreKind;
use crate::destinations::traits::{TargetProvider, TargetStore};

/// Embedded SQLite target. Each `bulk_insert` is one transaction.
pub struct SqliteTarget {
    conn: Mutex<Connection>,
}

impl SqliteTarget {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, rusqlite::Error> {
        Ok(Self { conn: Mutex::new(Connection::open(path)?) })
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Ok(Self { conn: Mutex::new(Connection::open_in_memory()?) })
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_affinity(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Boolean
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => "INTEGER",
        DataType::Float16 | DataType::Float32 | DataType::Float64 => "REAL",
        DataType::Binary | DataType::LargeBinary => "BLOB",
        _ => "TEXT",
    }
}

macro_rules! downcast {
    ($array:expr, $ty:ty) => {
        $array.as_any().downcast_ref::<$ty>()
    };
}

fn cell(table: &str, array: &ArrayRef, row: usize) -> DimloadResult<Value> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    if let Some(unsigned) = downcast!(array, UInt64Array) {
        let raw = unsigned.value(row);
        return i64::try_from(raw)
            .map(Value::Integer)
            .map_err(|_| Error::load(table, format!("unsigned value {raw} exceeds the INTEGER range")));
    }
    let value = match array.data_type() {
        DataType::Boolean => downcast!(array, BooleanArray).map(|a| Value::Integer(a.value(row) as i64)),
        DataType::Int8 => downcast!(array, Int8Array).map(|a| Value::Integer(a.value(row).into())),
        DataType::Int16 => downcast!(array, Int16Array).map(|a| Value::Integer(a.value(row).into())),
        DataType::Int32 => downcast!(array, Int32Array).map(|a| Value::Integer(a.value(row).into())),
        DataType::Int64 => downcast!(array, Int64Array).map(|a| Value::Integer(a.value(row))),
        DataType::UInt8 => downcast!(array, UInt8Array).map(|a| Value::Integer(a.value(row).into())),
        DataType::UInt16 => downcast!(array, UInt16Array).map(|a| Value::Integer(a.value(row).into())),
        DataType::UInt32 => downcast!(array, UInt32Array).map(|a| Value::Integer(a.value(row).into())),
        DataType::Float32 => downcast!(array, Float32Array).map(|a| Value::Real(a.value(row).into())),
        DataType::Float64 => downcast!(array, Float64Array).map(|a| Value::Real(a.value(row))),
        DataType::Utf8 => downcast!(array, StringArray).map(|a| Value::Text(a.value(row).to_string())),
        DataType::LargeUtf8 => {
            downcast!(array, LargeStringArray).map(|a| Value::Text(a.value(row).to_string()))
        }
        DataType::Date32 => downcast!(array, Date32Array)
            .and_then(|a| a.value_as_date(row))
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string())),
        DataType::Binary => downcast!(array, BinaryArray).map(|a| Value::Blob(a.value(row).to_vec())),
        _ => None,
    };
    match value {
        Some(value) => Ok(value),
        None => Ok(Value::Text(array_value_to_string(array, row)?)),
    }
}

fn insert_all(conn: &mut Connection, table: &str, rows: &TableData) -> DimloadResult<u64> {
    let schema = rows.schema();
    let columns: Vec<String> = schema.fields().iter().map(|f| quote(f.name())).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(table),
        columns.join(", "),
        placeholders.join(", ")
    );

    let tx = conn.transaction()?;
    let mut written = 0u64;
    {
        let mut stmt = tx.prepare(&sql)?;
        for batch in rows.batches() {
            for row in 0..batch.num_rows() {
                let values = batch
                    .columns()
                    .iter()
                    .map(|array| cell(table, array, row))
                    .collect::<DimloadResult<Vec<_>>>()?;
                stmt.execute(rusqlite::params_from_iter(values))?;
                written += 1;
            }
        }
    }
    tx.commit()?;
    Ok(written)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

#[async_trait]
impl TargetStore for SqliteTarget {
    fn kind(&self) -> &str {
        "local"
    }

    async fn create_table_if_absent(&self, table: &str, schema: &SchemaRef) -> DimloadResult<()> {
        let columns: Vec<String> = schema
            .fields()
            .iter()
            .map(|f| format!("{} {}", quote(f.name()), column_affinity(f.data_type())))
            .collect();
        let sql = format!("CREATE TABLE IF NOT EXISTS {} ({})", quote(table), columns.join(", "));
        self.conn
            .lock()
            .await
            .execute_batch(&sql)
            .map_err(|e| Error::load(table, e))
    }

    async fn bulk_insert(&self, table: &str, rows: &TableData) -> DimloadResult<u64> {
        let mut conn = self.conn.lock().await;
        insert_all(&mut conn, table, rows).map_err(|e| match e {
            Error::Load { .. } => e,
            other => Error::load(table, other),
        })
    }

    async fn count_rows(&self, table: &str) -> DimloadResult<Option<u64>> {
        let conn = self.conn.lock().await;
        if !table_exists(&conn, table)? {
            return Ok(None);
        }
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote(table)), [], |row| row.get(0))?;
        Ok(Some(count.max(0) as u64))
    }

    async fn list_tables(&self) -> DimloadResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(names.collect::<Result<_, _>>()?)
    }
}

/// Opens SQLite targets for `kind: local`. Warehouse dialects are not
/// supported here and are rejected as configuration errors.
#[derive(Default)]
pub struct LocalTargetProvider {
    opened: Mutex<HashMap<Option<PathBuf>, Arc<SqliteTarget>>>,
}

impl LocalTargetProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TargetProvider for LocalTargetProvider {
    async fn connect(&self, kind: &StoreKind) -> DimloadResult<Arc<dyn TargetStore>> {
        let path = match kind {
            StoreKind::Local { path } => path.clone(),
            StoreKind::Warehouse { url } => {
                return Err(Error::Configuration(format!(
                    "warehouse target '{url}' is not supported by the local provider"
                )))
            }
        };

        let mut opened = self.opened.lock().await;
        if let Some(target) = opened.get(&path) {
            return Ok(target.clone());
        }
        let target = Arc::new(match &path {
            Some(p) => SqliteTarget::open(p)?,
            None => SqliteTarget::in_memory()?,
        });
        tracing::debug!(path = ?path, "opened local target store");
        opened.insert(path, target.clone());
        Ok(target)
    }
}
