// ABOUTME: SQLite implementations of the sync collaborators
// ABOUTME: The external article source and the local content store

pub mod converter;
pub mod reader;
pub mod store;

pub use reader::SqliteSource;
pub use store::SqliteEntityStore;
