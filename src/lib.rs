pub use dimload_core as core;
pub use dimload_utils as utils;

// Convenience re-exports for common usage
pub use dimload_core::builder::OrchestratorBuilder;
pub use dimload_core::config::{load_config, EtlConfig, LoadStrategy, TableMapping};
pub use dimload_core::engine::DimloadFlow;
pub use dimload_core::orchestrator::{
    Orchestrator, RecoveryRequest, RunRef, RunStatus, RunSummary, TriggerRequest, TriggerResponse,
};
pub use dimload_utils::{DimloadResult, TableData};
