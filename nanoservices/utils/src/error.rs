use arrow::error::ArrowError;
use chrono::NaiveDate;
use reqwest::Error as ReqwestError;
use rusqlite::Error as SqliteError;
use thiserror::Error;
use tokio::io::Error as TokioIoError;
use tokio::task::JoinError;
use url::ParseError;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad window, bad strategy name, invalid mapping. Raised before a run exists.
    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("Extraction Error [{table}]: {message}")]
    Extraction { table: String, message: String },

    #[error("Transformation Error [{table}]: {message}")]
    Transformation { table: String, message: String },

    #[error("Load Error [{table}]: {message}")]
    Load { table: String, message: String },

    /// Attempt to move the checkpoint watermark backwards.
    #[error("Consistency Error: watermark {stored} cannot regress to {attempted}")]
    Consistency { stored: NaiveDate, attempted: NaiveDate },

    #[error("Already Running: run {0} is active")]
    AlreadyRunning(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Empty Set: nothing to recover for run {0}")]
    EmptySet(String),

    #[error("Sqlite Error: {0}")]
    StoreError(#[from] SqliteError),

    #[error("Arrow Error: {0}")]
    ArrowDataError(#[from] ArrowError),

    #[error("Reqwest Error: {0}")]
    NotifyError(#[from] ReqwestError),

    #[error("Tokio Error: {0}")]
    TokioError(#[from] TokioIoError),

    #[error("Join Error: {0}")]
    JoinError(#[from] JoinError),

    #[error("Url Error: {0}")]
    UrlParseError(#[from] ParseError),

    #[error("Json Error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl Error {
    pub fn extraction(table: impl Into<String>, message: impl ToString) -> Self {
        Error::Extraction { table: table.into(), message: message.to_string() }
    }

    pub fn transformation(table: impl Into<String>, message: impl ToString) -> Self {
        Error::Transformation { table: table.into(), message: message.to_string() }
    }

    pub fn load(table: impl Into<String>, message: impl ToString) -> Self {
        Error::Load { table: table.into(), message: message.to_string() }
    }
}
