pub mod loader;
pub mod types;

pub use loader::{load_config, parse_config, ConfigError};
pub use types::{
    ColumnMapping, ColumnType, EtlConfig, LoadStrategy, NotificationConfig, PipelineSettings,
    ScheduleConfig, SourceConfig, SourceJoin, StoreKind, TableMapping,
};
