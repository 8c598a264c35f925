pub mod schema;
pub mod sqlite;
mod traits;

pub use sqlite::{SqliteStore, merge_metadata};
pub use traits::MetadataStore;
