pub mod sqlite;
pub mod traits;

pub use sqlite::{LocalTargetProvider, SqliteTarget};
pub use traits::{TargetProvider, TargetStore};
