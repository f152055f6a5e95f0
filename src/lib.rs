// ABOUTME: Library root for article-sync
// ABOUTME: Incremental mirroring of external article rows into a local content store

pub mod config;
pub mod lock;
pub mod sqlite;
pub mod sync;
pub mod utils;
