pub mod mapping;
pub mod traits;

pub use mapping::{stamp_source, MappingTransformer, SOURCE_DB_FIELD};
pub use traits::Transformer;
