use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use arrow::datatypes::DataType;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use dimload_utils::error::Error;
use dimload_utils::DimloadResult;

#[derive(Debug, Clone, Deserialize)]
pub struct EtlConfig {
    /// Checkpoint singleton key, e.g. "local" or "production".
    pub environment: String,
    /// SQLite file holding the run ledger and checkpoint. In-memory when absent.
    pub state_path: Option<PathBuf>,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    pub sources: SourceConfig,
    pub target: StoreKind,
    #[serde(default)]
    pub notifications: NotificationConfig,
    pub schedule: Option<ScheduleConfig>,
    pub tables: Vec<TableMapping>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Window start used while no checkpoint has been recorded.
    pub default_start_date: Option<NaiveDate>,
    pub auto_update_checkpoint: bool,
    pub load_strategy: LoadStrategy,
    /// Tables extracted and transformed concurrently.
    pub parallelism: usize,
    /// Caps an open-ended window at `start + N days`.
    pub max_window_days: Option<u32>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            default_start_date: None,
            auto_update_checkpoint: true,
            load_strategy: LoadStrategy::default(),
            parallelism: 4,
            max_window_days: None,
        }
    }
}

/// Policy applied when a table fails to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    #[default]
    ContinueOnError,
    FailFast,
}

impl LoadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStrategy::ContinueOnError => "continue_on_error",
            LoadStrategy::FailFast => "fail_fast",
        }
    }

    /// The only decision point the loading stage delegates to the strategy.
    pub fn halts_after_failure(&self) -> bool {
        matches!(self, LoadStrategy::FailFast)
    }
}

impl FromStr for LoadStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue_on_error" => Ok(LoadStrategy::ContinueOnError),
            "fail_fast" => Ok(LoadStrategy::FailFast),
            other => Err(Error::Configuration(format!("unknown load strategy '{other}'"))),
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    /// Database identifier -> SQLite file.
    #[serde(default)]
    pub databases: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub include_keywords: Vec<String>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
}

/// Where transformed tables are written.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreKind {
    /// Embedded SQLite store. In-memory when no path is given.
    Local { path: Option<PathBuf> },
    Warehouse { url: String },
}

impl StoreKind {
    pub fn label(&self) -> &'static str {
        match self {
            StoreKind::Local { .. } => "local",
            StoreKind::Warehouse { .. } => "warehouse",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub on_start: bool,
    pub on_success: bool,
    pub on_partial: bool,
    pub on_failure: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            on_start: false,
            on_success: true,
            on_partial: true,
            on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// e.g. "90s", "15m", "6h", "1d"
    pub every: String,
    #[serde(default)]
    pub run_on_startup: bool,
}

impl ScheduleConfig {
    pub fn interval(&self) -> DimloadResult<Duration> {
        parse_duration(&self.every)
    }
}

/// Parse a short duration literal such as `60s` or `6h`.
pub fn parse_duration(raw: &str) -> DimloadResult<Duration> {
    let raw = raw.trim();
    let invalid = || Error::Configuration(format!("invalid duration '{raw}'"));
    let split = raw.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 60 * 60,
        "d" => value * 60 * 60 * 24,
        _ => return Err(invalid()),
    };
    if secs == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(secs))
}

/// Target column type a source column is coerced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int64,
    Float64,
    Text,
    Boolean,
    Date,
}

impl ColumnType {
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Text => DataType::Utf8,
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Date => DataType::Date32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
    pub coerce: Option<ColumnType>,
}

/// A table left-joined onto the primary source table during extraction.
/// Columns of a joined table arrive qualified as `table.column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceJoin {
    pub table: String,
    /// Primary table column, or `table.column` of an earlier join.
    pub left: String,
    /// Column of `table` matched against `left`.
    pub right: String,
}

/// How one target table is populated. Closed set, validated at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableMapping {
    Dimension {
        target: String,
        source_table: String,
        natural_key: Vec<String>,
        columns: Vec<ColumnMapping>,
        /// Date column for incremental extraction. Full snapshot when absent.
        incremental_column: Option<String>,
        source_db_column: Option<String>,
        #[serde(default)]
        joins: Vec<SourceJoin>,
    },
    Fact {
        target: String,
        source_table: String,
        /// Date column the run window is applied to.
        event_column: String,
        columns: Vec<ColumnMapping>,
        source_db_column: Option<String>,
        #[serde(default)]
        joins: Vec<SourceJoin>,
    },
}

impl TableMapping {
    pub fn target(&self) -> &str {
        match self {
            TableMapping::Dimension { target, .. } | TableMapping::Fact { target, .. } => target,
        }
    }

    pub fn source_table(&self) -> &str {
        match self {
            TableMapping::Dimension { source_table, .. }
            | TableMapping::Fact { source_table, .. } => source_table,
        }
    }

    pub fn columns(&self) -> &[ColumnMapping] {
        match self {
            TableMapping::Dimension { columns, .. } | TableMapping::Fact { columns, .. } => columns,
        }
    }

    /// Source column the extraction window filters on, if any.
    pub fn window_column(&self) -> Option<&str> {
        match self {
            TableMapping::Dimension { incremental_column, .. } => incremental_column.as_deref(),
            TableMapping::Fact { event_column, .. } => Some(event_column),
        }
    }

    pub fn source_db_column(&self) -> Option<&str> {
        match self {
            TableMapping::Dimension { source_db_column, .. }
            | TableMapping::Fact { source_db_column, .. } => source_db_column.as_deref(),
        }
    }

    /// Tables joined onto `source_table`, applied in order.
    pub fn joins(&self) -> &[SourceJoin] {
        match self {
            TableMapping::Dimension { joins, .. } | TableMapping::Fact { joins, .. } => joins,
        }
    }

    /// Target columns that must not be null; rows violating this are dropped.
    pub fn required_columns(&self) -> &[String] {
        match self {
            TableMapping::Dimension { natural_key, .. } => natural_key,
            TableMapping::Fact { .. } => &[],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TableMapping::Dimension { .. } => "dimension",
            TableMapping::Fact { .. } => "fact",
        }
    }

    pub(crate) fn validate(&self) -> DimloadResult<()> {
        let table = self.target();
        let invalid = |msg: String| Error::Configuration(format!("table '{table}': {msg}"));

        if table.trim().is_empty() {
            return Err(Error::Configuration("table with empty target name".into()));
        }
        if self.source_table().trim().is_empty() {
            return Err(invalid("empty source_table".into()));
        }
        if self.columns().is_empty() {
            return Err(invalid("no column mappings".into()));
        }

        let mut targets = HashSet::new();
        for column in self.columns() {
            if column.source.trim().is_empty() || column.target.trim().is_empty() {
                return Err(invalid("column mapping with empty name".into()));
            }
            if !targets.insert(column.target.as_str()) {
                return Err(invalid(format!("duplicate target column '{}'", column.target)));
            }
        }
        if let Some(stamp) = self.source_db_column() {
            if !targets.insert(stamp) {
                return Err(invalid(format!("source_db_column '{stamp}' collides with a mapped column")));
            }
        }

        if let TableMapping::Dimension { natural_key, .. } = self {
            if natural_key.is_empty() {
                return Err(invalid("dimension needs a natural_key".into()));
            }
            for key in natural_key {
                if !targets.contains(key.as_str()) {
                    return Err(invalid(format!("natural key '{key}' is not a mapped column")));
                }
            }
        }
        if let Some(col) = self.window_column() {
            if col.trim().is_empty() {
                return Err(invalid("empty window column".into()));
            }
        }

        let mut joined = HashSet::from([self.source_table()]);
        for join in self.joins() {
            if join.left.trim().is_empty() || join.right.trim().is_empty() {
                return Err(invalid(format!("join on '{}' needs left and right columns", join.table)));
            }
            if let Some((table, _)) = join.left.split_once('.') {
                if !joined.contains(table) {
                    return Err(invalid(format!(
                        "join on '{}' refers to '{table}' before it is joined",
                        join.table
                    )));
                }
            }
            if join.table.trim().is_empty() || !joined.insert(join.table.as_str()) {
                return Err(invalid(format!("table '{}' joined more than once", join.table)));
            }
        }
        Ok(())
    }
}

impl EtlConfig {
    /// Cross-field checks run once at startup.
    pub fn validate(&self) -> DimloadResult<()> {
        if self.environment.trim().is_empty() {
            return Err(Error::Configuration("environment is required".into()));
        }
        if self.tables.is_empty() {
            return Err(Error::Configuration("at least one table mapping is required".into()));
        }
        if self.pipeline.parallelism == 0 {
            return Err(Error::Configuration("parallelism must be at least 1".into()));
        }
        if self.pipeline.max_window_days == Some(0) {
            return Err(Error::Configuration("max_window_days must be at least 1".into()));
        }

        let mut names = HashSet::new();
        for table in &self.tables {
            table.validate()?;
            if !names.insert(table.target().to_ascii_lowercase()) {
                return Err(Error::Configuration(format!(
                    "duplicate target table '{}'",
                    table.target()
                )));
            }
        }

        if let StoreKind::Warehouse { url } = &self.target {
            url::Url::parse(url)?;
        }
        if let Some(hook) = &self.notifications.webhook_url {
            url::Url::parse(hook)?;
        }
        if let Some(schedule) = &self.schedule {
            schedule.interval()?;
        }
        Ok(())
    }

    /// Environment variables override the file, never a request.
    pub fn apply_env_overrides(&mut self) -> DimloadResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> DimloadResult<()> {
        if let Some(strategy) = lookup("DIMLOAD_LOAD_STRATEGY") {
            self.pipeline.load_strategy = strategy.parse()?;
        }
        if let Some(start) = lookup("DIMLOAD_START_DATE") {
            let date = NaiveDate::parse_from_str(start.trim(), "%Y-%m-%d").map_err(|e| {
                Error::Configuration(format!("DIMLOAD_START_DATE '{start}': {e}"))
            })?;
            self.pipeline.default_start_date = Some(date);
        }
        if let Some(flag) = lookup("DIMLOAD_AUTO_UPDATE") {
            self.pipeline.auto_update_checkpoint = match flag.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                other => {
                    return Err(Error::Configuration(format!("DIMLOAD_AUTO_UPDATE '{other}'")))
                }
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("5w").is_err());
        assert!(parse_duration("h").is_err());
    }

    fn joined_dimension(joins: Vec<SourceJoin>) -> TableMapping {
        TableMapping::Dimension {
            target: "dim_user".into(),
            source_table: "users".into(),
            natural_key: vec!["user_id".into()],
            columns: vec![
                ColumnMapping { source: "id".into(), target: "user_id".into(), coerce: None },
                ColumnMapping { source: "prefs.theme".into(), target: "theme".into(), coerce: None },
            ],
            incremental_column: None,
            source_db_column: None,
            joins,
        }
    }

    fn join(table: &str, left: &str, right: &str) -> SourceJoin {
        SourceJoin { table: table.into(), left: left.into(), right: right.into() }
    }

    #[test]
    fn joins_must_reference_tables_already_in_scope() {
        let chained = joined_dimension(vec![
            join("prefs", "id", "user_id"),
            join("themes", "prefs.theme", "code"),
        ]);
        assert!(chained.validate().is_ok());
        assert_eq!(chained.joins().len(), 2);

        let out_of_order = joined_dimension(vec![
            join("themes", "prefs.theme", "code"),
            join("prefs", "id", "user_id"),
        ]);
        assert!(matches!(out_of_order.validate(), Err(Error::Configuration(_))));

        let self_join = joined_dimension(vec![join("users", "id", "id")]);
        assert!(self_join.validate().is_err());

        let blank = joined_dimension(vec![join("prefs", "", "user_id")]);
        assert!(blank.validate().is_err());
    }

    #[test]
    fn joins_default_to_empty_in_yaml() {
        let mapping: TableMapping = serde_yaml::from_str(
            "kind: fact\ntarget: fct_order\nsource_table: orders\nevent_column: placed_at\n\
             columns: [{source: id, target: order_id}]\n",
        )
        .unwrap();
        assert!(mapping.joins().is_empty());
    }

    #[test]
    fn load_strategy_from_str() {
        assert_eq!("fail_fast".parse::<LoadStrategy>().unwrap(), LoadStrategy::FailFast);
        assert_eq!(
            " Continue_On_Error ".parse::<LoadStrategy>().unwrap(),
            LoadStrategy::ContinueOnError
        );
        assert!(matches!(
            "retry".parse::<LoadStrategy>(),
            Err(Error::Configuration(_))
        ));
    }
}
