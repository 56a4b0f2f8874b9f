use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use dimload_utils::error::Error;
use dimload_utils::DimloadResult;

use crate::store::db::Store;
use crate::store::ledger::{parse_date, parse_timestamp, timestamp};

/// Look-back used when neither a checkpoint nor a default start date exists.
const FALLBACK_LOOKBACK_DAYS: u64 = 30;

/// Snapshot of the watermark for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointInfo {
    pub environment: String,
    /// Date stored by the last successful run, if any.
    pub last_date: Option<NaiveDate>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Start date a run triggered now would use.
    pub effective_start: NaiveDate,
    pub auto_update: bool,
}

/// Single-writer watermark for one environment. The stored date never moves
/// backwards.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<Mutex<Store>>,
    environment: String,
    default_start: Option<NaiveDate>,
    auto_update: bool,
}

impl CheckpointStore {
    pub fn new(store: Arc<Mutex<Store>>, environment: impl Into<String>) -> Self {
        Self { store, environment: environment.into(), default_start: None, auto_update: true }
    }

    pub fn default_start(mut self, date: Option<NaiveDate>) -> Self {
        self.default_start = date;
        self
    }

    pub fn auto_update(mut self, enabled: bool) -> Self {
        self.auto_update = enabled;
        self
    }

    pub fn is_auto_update(&self) -> bool {
        self.auto_update
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub async fn stored_watermark(&self) -> DimloadResult<Option<NaiveDate>> {
        let row = self.store.lock().await.get_checkpoint(&self.environment)?;
        row.map(|r| parse_date(&r.last_date)).transpose()
    }

    /// Stored watermark, else the configured default, else 30 days before `today`.
    pub async fn get_watermark(&self, today: NaiveDate) -> DimloadResult<NaiveDate> {
        if let Some(stored) = self.stored_watermark().await? {
            return Ok(stored);
        }
        Ok(self.default_start.unwrap_or_else(|| {
            today
                .checked_sub_days(Days::new(FALLBACK_LOOKBACK_DAYS))
                .unwrap_or(today)
        }))
    }

    /// Compare-and-advance in one statement. Equal dates are accepted; an
    /// earlier date is a `Consistency` error and leaves the store untouched.
    pub async fn advance_watermark(&self, new_date: NaiveDate) -> DimloadResult<NaiveDate> {
        let store = self.store.lock().await;
        let changed = store.advance_checkpoint(
            &self.environment,
            &new_date.to_string(),
            &timestamp(Utc::now()),
        )?;
        if changed == 0 {
            let stored = store
                .get_checkpoint(&self.environment)?
                .map(|r| parse_date(&r.last_date))
                .transpose()?
                .unwrap_or(new_date);
            return Err(Error::Consistency { stored, attempted: new_date });
        }
        tracing::info!(environment = %self.environment, watermark = %new_date, "checkpoint advanced");
        Ok(new_date)
    }

    pub async fn checkpoint_info(&self, today: NaiveDate) -> DimloadResult<CheckpointInfo> {
        let row = self.store.lock().await.get_checkpoint(&self.environment)?;
        let (last_date, updated_at) = match row {
            Some(row) => (Some(parse_date(&row.last_date)?), Some(parse_timestamp(&row.updated_at)?)),
            None => (None, None),
        };
        Ok(CheckpointInfo {
            environment: self.environment.clone(),
            effective_start: self.get_watermark(today).await?,
            last_date,
            updated_at,
            auto_update: self.auto_update,
        })
    }
}
