//! Digest refresh: reconcile stored digests with the registry in rate-limited batches

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_COOLDOWN_INTERVAL};
use crate::engine::rate_limiter::RateLimiter;
use crate::registry::client::{ManifestHead, RegistryClient};
use crate::registry::error::RegistryError;
use crate::store::{JobExecution, MonitoredTag, RecordStore};

/// Tunables of a refresh cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSettings {
    /// Number of tags queried concurrently; batches run one after another
    pub batch_size: usize,
    /// Pause before retrying requests the registry throttled
    pub cooldown: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            cooldown: DEFAULT_COOLDOWN_INTERVAL,
        }
    }
}

/// Classified result of one manifest query
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Found(String),
    Missing,
    Unauthorized,
    Throttled,
    Failed(String),
}

impl Outcome {
    fn classify(result: Result<ManifestHead, RegistryError>) -> Self {
        match result {
            Ok(head) if head.status_code == 401 => Outcome::Unauthorized,
            Ok(head) if head.status_code == 429 => Outcome::Throttled,
            Ok(ManifestHead {
                exists: true,
                digest: Some(digest),
                ..
            }) => Outcome::Found(digest),
            Ok(head) if !head.exists && head.status_code == 404 => Outcome::Missing,
            Ok(head) => Outcome::Failed(format!(
                "unexpected response (status {}, exists {}, digest {:?})",
                head.status_code, head.exists, head.digest
            )),
            Err(RegistryError::Unauthorized(_)) => Outcome::Unauthorized,
            Err(RegistryError::RateLimited { .. }) => Outcome::Throttled,
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }
}

/// Counters of one refresh cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub successful_queries: u32,
    pub failed_queries: u32,
    pub new_digests: u32,
    pub deleted_tags: u32,
}

async fn query(
    registry: &dyn RegistryClient,
    limiter: &RateLimiter,
    tag: &MonitoredTag,
) -> Outcome {
    limiter.acquire().await;
    Outcome::classify(
        registry
            .head_manifest(&tag.endpoint, &tag.image, &tag.tag)
            .await,
    )
}

/// Re-queries every entry whose outcome matches `needs_retry`, once
async fn retry_where(
    registry: &dyn RegistryClient,
    limiter: &RateLimiter,
    batch: &[MonitoredTag],
    outcomes: &mut [Outcome],
    needs_retry: impl Fn(&Outcome) -> bool,
) {
    let indices: Vec<usize> = (0..batch.len()).filter(|&i| needs_retry(&outcomes[i])).collect();
    let retried = join_all(indices.iter().map(|&i| query(registry, limiter, &batch[i]))).await;
    for (i, result) in indices.into_iter().zip(retried) {
        outcomes[i] = result;
    }
}

/// Queries a batch concurrently and runs the 401/429 recovery passes
///
/// Auth invalidation happens once per pass, before any retried request starts.
async fn query_batch(
    registry: &dyn RegistryClient,
    limiter: &RateLimiter,
    settings: &RefreshSettings,
    batch: &[MonitoredTag],
) -> Vec<Outcome> {
    let mut outcomes = join_all(batch.iter().map(|tag| query(registry, limiter, tag))).await;

    let unauthorized = outcomes.iter().filter(|o| **o == Outcome::Unauthorized).count();
    if unauthorized > 0 {
        info!(
            unauthorized,
            "Registry rejected credentials, invalidating auth and retrying"
        );
        registry.invalidate_auth().await;
        retry_where(registry, limiter, batch, &mut outcomes, |o| {
            *o == Outcome::Unauthorized
        })
        .await;
    }

    let throttled = outcomes.iter().filter(|o| **o == Outcome::Throttled).count();
    if throttled > 0 {
        warn!(
            throttled,
            cooldown_secs = settings.cooldown.as_secs(),
            "Registry rate limit hit, cooling down before retrying"
        );
        sleep(settings.cooldown).await;
        // Tokens may have expired during the cooldown
        registry.invalidate_auth().await;
        retry_where(registry, limiter, batch, &mut outcomes, |o| *o == Outcome::Throttled).await;
    }

    outcomes
}

/// Applies one query outcome to the store and updates the counters
fn reconcile<S: RecordStore>(
    store: &S,
    tag: &MonitoredTag,
    outcome: Outcome,
    summary: &mut RefreshSummary,
) {
    let image_name = format!("{}/{}:{}", tag.endpoint, tag.image, tag.tag);

    match outcome {
        Outcome::Found(digest) => {
            let changed = match store.latest_update(tag.id) {
                Ok(latest) => latest.is_none_or(|update| update.digest != digest),
                Err(e) => {
                    error!("Failed to load latest digest for {}: {}", image_name, e);
                    summary.failed_queries += 1;
                    return;
                }
            };

            if changed {
                if let Err(e) = store.insert_update(tag.id, &digest, Utc::now()) {
                    error!("Failed to record digest {} for {}: {}", digest, image_name, e);
                    summary.failed_queries += 1;
                    return;
                }
                debug!("Recorded new digest {} for {}", digest, image_name);
                summary.new_digests += 1;
            }
            summary.successful_queries += 1;
        }
        Outcome::Missing => {
            info!(
                "Tag {} no longer exists in the registry, removing it",
                image_name
            );
            match store.delete_monitored_tag(tag.id) {
                Ok(()) => summary.deleted_tags += 1,
                Err(e) => error!("Failed to delete {}: {}", image_name, e),
            }
            summary.failed_queries += 1;
        }
        Outcome::Unauthorized => {
            warn!(
                "Failed to refresh digest for {}: still unauthorized after retry",
                image_name
            );
            summary.failed_queries += 1;
        }
        Outcome::Throttled => {
            warn!(
                "Failed to refresh digest for {}: still rate limited after cooldown",
                image_name
            );
            summary.failed_queries += 1;
        }
        Outcome::Failed(reason) => {
            warn!("Failed to refresh digest for {}: {}", image_name, reason);
            summary.failed_queries += 1;
        }
    }
}

/// Refresh the digest of every monitored tag
///
/// Tags are queried in sequential batches of `settings.batch_size`, each
/// request passing through `limiter`. New digests are appended to the
/// history only when they differ from the latest recorded one, tags the
/// registry reports as missing are deleted, and exactly one job execution
/// record is written at the end.
/// Errors are logged but do not stop processing of other tags.
pub async fn refresh_digests<S: RecordStore>(
    store: &S,
    registry: &dyn RegistryClient,
    limiter: &RateLimiter,
    settings: &RefreshSettings,
) -> RefreshSummary {
    let started = Utc::now();
    let mut summary = RefreshSummary::default();

    let tags = match store.monitored_tags() {
        Ok(tags) => tags,
        Err(e) => {
            error!("Failed to load monitored tags: {}", e);
            Vec::new()
        }
    };
    info!(tags = tags.len(), "Refreshing digests for all monitored tags");

    for (batch_index, batch) in tags.chunks(settings.batch_size.max(1)).enumerate() {
        debug!(batch = batch_index, size = batch.len(), "Processing batch");
        let outcomes = query_batch(registry, limiter, settings, batch).await;
        for (tag, outcome) in batch.iter().zip(outcomes) {
            reconcile(store, tag, outcome, &mut summary);
        }
    }

    let execution = JobExecution {
        started,
        completed: Utc::now(),
        successful_queries: summary.successful_queries,
        failed_queries: summary.failed_queries,
    };
    if let Err(e) = store.insert_job_execution(&execution) {
        error!("Failed to record job execution: {}", e);
    }

    info!(
        successful_queries = summary.successful_queries,
        failed_queries = summary.failed_queries,
        new_digests = summary.new_digests,
        deleted_tags = summary.deleted_tags,
        "Digest refresh completed"
    );

    summary
}
