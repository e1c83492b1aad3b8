//! Scheduler loop driving the periodic jobs

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::config::{
    DEFAULT_DIGEST_REFRESH_INTERVAL, DEFAULT_IMAGE_REFRESH_INTERVAL, DEFAULT_SCHEDULER_IDLE_INTERVAL,
};
use crate::engine::discovery::discover_new_tags;
use crate::engine::importer::import_popular_images;
use crate::engine::rate_limiter::RateLimiter;
use crate::engine::refresh::{RefreshSettings, RefreshSummary, refresh_digests};
use crate::engine::retention::{RetentionPolicy, sweep};
use crate::registry::catalog::Catalog;
use crate::registry::client::RegistryClient;
use crate::store::RecordStore;

/// Cadences and per-job settings of the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Time between catalog imports
    pub image_refresh_interval: Duration,
    /// Time between retention + discovery + refresh cycles
    pub digest_refresh_interval: Duration,
    /// Sleep when no job is due
    pub idle_interval: Duration,
    /// Run tag discovery before each refresh
    pub auto_monitor_new_tags: bool,
    pub refresh: RefreshSettings,
    pub retention: RetentionPolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            image_refresh_interval: DEFAULT_IMAGE_REFRESH_INTERVAL,
            digest_refresh_interval: DEFAULT_DIGEST_REFRESH_INTERVAL,
            idle_interval: DEFAULT_SCHEDULER_IDLE_INTERVAL,
            auto_monitor_new_tags: true,
            refresh: RefreshSettings::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

/// Runs catalog import and the refresh cycle on independent cadences
///
/// Cadences count from the completion of the previous run, so a cycle that
/// overruns its interval is followed immediately by the next one instead of
/// queueing missed runs.
pub struct Scheduler<S: RecordStore> {
    store: Arc<S>,
    registry: Arc<dyn RegistryClient>,
    catalog: Option<Arc<dyn Catalog>>,
    limiter: Arc<RateLimiter>,
    settings: SchedulerSettings,
    last_catalog_import: Option<Instant>,
    last_refresh: Option<Instant>,
}

fn is_due(last_run: Option<Instant>, interval: Duration, now: Instant) -> bool {
    last_run.is_none_or(|last| now.duration_since(last) >= interval)
}

impl<S: RecordStore> Scheduler<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<dyn RegistryClient>,
        limiter: Arc<RateLimiter>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            registry,
            catalog: None,
            limiter,
            settings,
            last_catalog_import: None,
            last_refresh: None,
        }
    }

    /// Enables the periodic catalog import
    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Retention sweep, then discovery if enabled, then digest refresh
    pub async fn run_refresh_cycle(&self) -> RefreshSummary {
        info!("Refresh cycle started");

        sweep(self.store.as_ref(), &self.settings.retention, Utc::now());

        if self.settings.auto_monitor_new_tags {
            discover_new_tags(self.store.as_ref(), self.registry.as_ref(), &self.limiter).await;
        }

        let summary = refresh_digests(
            self.store.as_ref(),
            self.registry.as_ref(),
            &self.limiter,
            &self.settings.refresh,
        )
        .await;

        info!("Refresh cycle finished");
        summary
    }

    /// Runs every job that is due; returns whether anything ran
    pub async fn run_pending(&mut self) -> bool {
        let mut ran = false;

        if let Some(catalog) = &self.catalog {
            if is_due(
                self.last_catalog_import,
                self.settings.image_refresh_interval,
                Instant::now(),
            ) {
                import_popular_images(self.store.as_ref(), catalog.as_ref()).await;
                self.last_catalog_import = Some(Instant::now());
                ran = true;
            }
        }

        if is_due(
            self.last_refresh,
            self.settings.digest_refresh_interval,
            Instant::now(),
        ) {
            let started = Instant::now();
            self.run_refresh_cycle().await;
            let elapsed = started.elapsed();
            if elapsed > self.settings.digest_refresh_interval {
                warn!(
                    elapsed_secs = elapsed.as_secs(),
                    interval_secs = self.settings.digest_refresh_interval.as_secs(),
                    "Refresh cycle took longer than its interval, consider a longer interval or a higher request rate"
                );
            }
            self.last_refresh = Some(Instant::now());
            ran = true;
        }

        ran
    }

    /// Loops forever, sleeping the idle interval whenever no job is due
    pub async fn run_forever(&mut self) {
        info!(
            image_refresh_interval_secs = self.settings.image_refresh_interval.as_secs(),
            digest_refresh_interval_secs = self.settings.digest_refresh_interval.as_secs(),
            catalog_import = self.catalog.is_some(),
            "Scheduler started"
        );

        loop {
            if !self.run_pending().await {
                sleep(self.settings.idle_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::catalog::MockCatalog;
    use crate::registry::client::{ManifestHead, MockRegistryClient};
    use crate::registry::reference::ImageRef;
    use crate::store::SqliteStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, Arc<SqliteStore>) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let store = SqliteStore::new(&db_path).unwrap();
        (temp_dir, Arc::new(store))
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            image_refresh_interval: Duration::from_secs(24 * 60 * 60),
            digest_refresh_interval: Duration::from_secs(60 * 60),
            idle_interval: Duration::from_secs(10),
            auto_monitor_new_tags: false,
            ..SchedulerSettings::default()
        }
    }

    fn counting_registry(heads: Arc<AtomicUsize>) -> MockRegistryClient {
        let mut registry = MockRegistryClient::new();
        registry.expect_head_manifest().returning(move |_, _, _| {
            heads.fetch_add(1, Ordering::SeqCst);
            Ok(ManifestHead::found("sha256:a"))
        });
        registry.expect_list_tags().returning(|_, _| Ok(vec![]));
        registry
    }

    #[test]
    fn is_due_when_never_run_or_interval_elapsed() {
        let now = Instant::now();
        let interval = Duration::from_secs(60);

        assert!(is_due(None, interval, now));
        assert!(is_due(Some(now - interval), interval, now));
        assert!(!is_due(Some(now - Duration::from_secs(59)), interval, now));
    }

    #[tokio::test(start_paused = true)]
    async fn run_pending_runs_refresh_only_when_interval_elapsed() {
        let (_temp_dir, store) = create_test_store();
        store.add_monitored_tag("ghcr.io", "owner/app", "1.0").unwrap();
        let heads = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(counting_registry(heads.clone()));
        let mut scheduler = Scheduler::new(
            store.clone(),
            registry,
            Arc::new(RateLimiter::new(10)),
            settings(),
        );

        assert!(scheduler.run_pending().await);
        assert!(!scheduler.run_pending().await);
        assert_eq!(heads.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(60 * 60)).await;

        assert!(scheduler.run_pending().await);
        assert_eq!(heads.load(Ordering::SeqCst), 2);
        assert_eq!(store.recent_job_executions(10).unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_pending_imports_catalog_before_refresh() {
        let (_temp_dir, store) = create_test_store();
        let heads = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(counting_registry(heads.clone()));
        let mut catalog = MockCatalog::new();
        catalog
            .expect_images_to_track()
            .times(1)
            .returning(|| vec![ImageRef::new("index.docker.io", "library/nginx", "1.27")]);
        let mut scheduler = Scheduler::new(
            store.clone(),
            registry,
            Arc::new(RateLimiter::new(10)),
            settings(),
        )
        .with_catalog(Arc::new(catalog));

        assert!(scheduler.run_pending().await);

        // the imported tag was refreshed in the same pass
        assert_eq!(heads.load(Ordering::SeqCst), 1);
        let tag = store
            .find_monitored_tag("index.docker.io", "library/nginx", "1.27")
            .unwrap()
            .unwrap();
        assert_eq!(store.latest_update(tag.id).unwrap().unwrap().digest, "sha256:a");

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        // catalog is not due again for a day
        assert!(scheduler.run_pending().await);
    }

    #[tokio::test(start_paused = true)]
    async fn run_refresh_cycle_runs_discovery_when_enabled() {
        let (_temp_dir, store) = create_test_store();
        store.add_monitored_tag("ghcr.io", "owner/app", "1.0").unwrap();
        let mut registry = MockRegistryClient::new();
        registry
            .expect_list_tags()
            .times(1)
            .returning(|_, _| Ok(vec!["1.0".to_string(), "1.1".to_string()]));
        registry
            .expect_head_manifest()
            .times(2)
            .returning(|_, _, _| Ok(ManifestHead::found("sha256:a")));
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(RateLimiter::new(10)),
            SchedulerSettings {
                auto_monitor_new_tags: true,
                ..settings()
            },
        );

        let summary = scheduler.run_refresh_cycle().await;

        assert_eq!(summary.successful_queries, 2);
        assert!(store.monitored_tag_exists("ghcr.io", "owner/app", "1.1").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn run_refresh_cycle_skips_discovery_when_disabled() {
        let (_temp_dir, store) = create_test_store();
        store.add_monitored_tag("ghcr.io", "owner/app", "1.0").unwrap();
        let mut registry = MockRegistryClient::new();
        registry.expect_list_tags().times(0);
        registry
            .expect_head_manifest()
            .times(1)
            .returning(|_, _, _| Ok(ManifestHead::found("sha256:a")));
        let scheduler = Scheduler::new(
            store,
            Arc::new(registry),
            Arc::new(RateLimiter::new(10)),
            settings(),
        );

        let summary = scheduler.run_refresh_cycle().await;

        assert_eq!(summary.successful_queries, 1);
    }
}
