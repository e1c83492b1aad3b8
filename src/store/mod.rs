//! Record store: entities and the persistence trait the engine consumes
//!
//! # Modules
//!
//! - [`sqlite`]: SQLite-backed implementation
//! - [`error`]: store error type

pub mod error;
pub mod sqlite;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

#[cfg(test)]
use mockall::automock;

use crate::store::error::StoreError;

pub use sqlite::SqliteStore;

/// One tracked (endpoint, image, tag) triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredTag {
    pub id: i64,
    pub endpoint: String,
    pub image: String,
    pub tag: String,
    pub added_at: DateTime<Utc>,
    pub last_viewed: DateTime<Utc>,
}

/// One observed digest of a monitored tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagUpdate {
    pub id: i64,
    pub monitored_tag_id: i64,
    pub scraped_at: DateTime<Utc>,
    pub digest: String,
}

/// Last observed tag universe of an (endpoint, image)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSnapshot {
    pub endpoint: String,
    pub image: String,
    pub known_tags: BTreeSet<String>,
}

/// Ledger entry of one digest refresh cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobExecution {
    pub started: DateTime<Utc>,
    pub completed: DateTime<Utc>,
    pub successful_queries: u32,
    pub failed_queries: u32,
}

/// Distinct (endpoint, image) pair referenced by monitored tags
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackedImage {
    pub endpoint: String,
    pub image: String,
}

/// Row counts, for status output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub monitored_tags: u64,
    pub tag_updates: u64,
    pub image_snapshots: u64,
    pub job_executions: u64,
}

/// Trait for persisting monitored tags, their digest history and job records
#[cfg_attr(test, automock)]
pub trait RecordStore: Send + Sync + 'static {
    /// Inserts a monitored tag unless it already exists; returns true if inserted
    fn add_monitored_tag(&self, endpoint: &str, image: &str, tag: &str)
    -> Result<bool, StoreError>;

    /// Returns all monitored tags
    fn monitored_tags(&self) -> Result<Vec<MonitoredTag>, StoreError>;

    /// Returns a single monitored tag
    fn find_monitored_tag(
        &self,
        endpoint: &str,
        image: &str,
        tag: &str,
    ) -> Result<Option<MonitoredTag>, StoreError>;

    /// Checks whether a monitored tag exists
    fn monitored_tag_exists(&self, endpoint: &str, image: &str, tag: &str)
    -> Result<bool, StoreError>;

    /// Deletes a monitored tag together with its digest history
    fn delete_monitored_tag(&self, id: i64) -> Result<(), StoreError>;

    /// Returns the distinct images referenced by monitored tags
    fn tracked_images(&self) -> Result<Vec<TrackedImage>, StoreError>;

    /// Returns the most recent digest record of a monitored tag
    fn latest_update(&self, monitored_tag_id: i64) -> Result<Option<TagUpdate>, StoreError>;

    /// Appends a digest record
    fn insert_update(
        &self,
        monitored_tag_id: i64,
        digest: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Returns the digest history of a monitored tag, oldest first
    fn updates(&self, monitored_tag_id: i64) -> Result<Vec<TagUpdate>, StoreError>;

    /// Deletes digest records scraped strictly before `cutoff`
    fn delete_updates_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Deletes monitored tags last viewed strictly before `cutoff`
    fn delete_tags_viewed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Returns the snapshot of an image, creating an empty one if missing
    fn ensure_snapshot(&self, endpoint: &str, image: &str) -> Result<ImageSnapshot, StoreError>;

    /// Atomically enrolls `new_tags` (skipping existing ones) and replaces the
    /// snapshot's known tags with `live_tags`; returns the number of inserted tags
    fn apply_discovery(
        &self,
        endpoint: &str,
        image: &str,
        new_tags: &[String],
        live_tags: &BTreeSet<String>,
    ) -> Result<usize, StoreError>;

    /// Appends a job execution record
    fn insert_job_execution(&self, execution: &JobExecution) -> Result<(), StoreError>;

    /// Returns the most recent job execution records, newest first
    fn recent_job_executions(&self, limit: usize) -> Result<Vec<JobExecution>, StoreError>;

    /// Returns row counts of all tables
    fn stats(&self) -> Result<StoreStats, StoreError>;
}
