//! dimload_core - incremental, recoverable ETL into dimension/fact tables
//!
//! The orchestrator extracts every configured table from a set of source
//! databases over a date window, maps it onto its target schema and loads it
//! into the analytical store. Each run is recorded in an append-only ledger;
//! the checkpoint watermark only moves forward, and a recovery run replays the
//! tables a previous run failed to load.
//!
//! Basic usage:
//!
//! ```no_run
//! use dimload_core::config::load_config;
//! use dimload_core::orchestrator::{Orchestrator, TriggerRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("dimload.yaml")?;
//! let orchestrator = Orchestrator::from_config(&config)?;
//! let response = orchestrator.trigger(TriggerRequest::default()).await?;
//! println!("run {} finished", response.run_id);
//! # Ok(())
//! # }
//! ```

pub mod sources;
pub mod destinations;
pub mod transforms;
pub mod events;
pub mod store;
pub mod orchestrator;
pub mod config;
pub mod builder;
pub mod engine;

pub mod logging;

pub mod metrics;
