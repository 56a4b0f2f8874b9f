pub mod catalog;
mod join;
pub mod memory;
pub mod sqlite;
pub mod traits;

pub use catalog::SourceCatalog;
pub use traits::{SourceConnection, SourceProvider, SourceQuery};
