//! Shared test utilities

pub mod registry;

pub use registry::*;

use std::sync::Arc;

use tag_monitor::store::SqliteStore;
use tempfile::TempDir;

/// Create a SQLite store in a fresh temporary directory
pub fn create_test_store() -> (TempDir, Arc<SqliteStore>) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let store = SqliteStore::new(&db_path).unwrap();
    (temp_dir, Arc::new(store))
}
