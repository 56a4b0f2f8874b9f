pub mod checkpoint;
pub mod db;
pub mod ledger;

pub use checkpoint::{CheckpointInfo, CheckpointStore};
pub use db::Store;
pub use ledger::RunLedger;
