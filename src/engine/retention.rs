//! Retention sweep of old digest history and inactive monitored tags

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{error, info};

use crate::config::{DEFAULT_HISTORY_MAX_AGE, DEFAULT_INACTIVE_MAX_AGE};
use crate::store::RecordStore;

/// Age thresholds applied by the sweeper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Digest records scraped longer ago than this are deleted
    pub history_max_age: Duration,
    /// Monitored tags not viewed for longer than this are deleted
    pub inactive_max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            history_max_age: DEFAULT_HISTORY_MAX_AGE,
            inactive_max_age: DEFAULT_INACTIVE_MAX_AGE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionSummary {
    pub deleted_updates: usize,
    pub deleted_tags: usize,
}

/// Oldest timestamp still retained; saturates for ages beyond the calendar range
fn cutoff(now: DateTime<Utc>, max_age: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(max_age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Delete history and monitored tags older than the policy allows, relative to `now`
///
/// Rows exactly at a cutoff are kept. Failures are logged; the next scheduled
/// sweep retries.
pub fn sweep<S: RecordStore>(
    store: &S,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> RetentionSummary {
    let mut summary = RetentionSummary::default();

    let history_cutoff = cutoff(now, policy.history_max_age);
    match store.delete_updates_before(history_cutoff) {
        Ok(deleted) => {
            info!(deleted, cutoff = %history_cutoff, "Deleted old digest records");
            summary.deleted_updates = deleted;
        }
        Err(e) => error!("Failed to delete old digest records: {}", e),
    }

    let inactive_cutoff = cutoff(now, policy.inactive_max_age);
    match store.delete_tags_viewed_before(inactive_cutoff) {
        Ok(deleted) => {
            info!(deleted, cutoff = %inactive_cutoff, "Deleted inactive monitored tags");
            summary.deleted_tags = deleted;
        }
        Err(e) => error!("Failed to delete inactive monitored tags: {}", e),
    }

    summary
}
