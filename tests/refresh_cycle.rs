//! Refresh cycle tests against a real SQLite store

mod helper;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use helper::{ScriptedRegistry, create_test_store};
use tag_monitor::engine::rate_limiter::RateLimiter;
use tag_monitor::engine::refresh::{RefreshSettings, refresh_digests};
use tag_monitor::engine::scheduler::{Scheduler, SchedulerSettings};
use tag_monitor::registry::client::ManifestHead;
use tag_monitor::store::RecordStore;

const ENDPOINT: &str = "ghcr.io";
const IMAGE: &str = "owner/app";

fn settings() -> RefreshSettings {
    RefreshSettings {
        batch_size: 10,
        cooldown: Duration::from_secs(60),
    }
}

#[tokio::test(start_paused = true)]
async fn refresh_digests_reconciles_mixed_batch() {
    let (_temp_dir, store) = create_test_store();
    let mut registry = ScriptedRegistry::new();

    // 7 unchanged, 2 changed, 1 gone
    for i in 0..7 {
        let tag = format!("unchanged-{}", i);
        store.add_monitored_tag(ENDPOINT, IMAGE, &tag).unwrap();
        let id = store.find_monitored_tag(ENDPOINT, IMAGE, &tag).unwrap().unwrap().id;
        store.insert_update(id, "sha256:same", Utc::now()).unwrap();
        registry = registry.with_manifest(IMAGE, &tag, vec![ManifestHead::found("sha256:same")]);
    }
    for i in 0..2 {
        let tag = format!("changed-{}", i);
        store.add_monitored_tag(ENDPOINT, IMAGE, &tag).unwrap();
        let id = store.find_monitored_tag(ENDPOINT, IMAGE, &tag).unwrap().unwrap().id;
        store.insert_update(id, "sha256:old", Utc::now()).unwrap();
        registry = registry.with_manifest(IMAGE, &tag, vec![ManifestHead::found("sha256:new")]);
    }
    store.add_monitored_tag(ENDPOINT, IMAGE, "gone").unwrap();
    let limiter = RateLimiter::new(10);

    let summary = refresh_digests(store.as_ref(), &registry, &limiter, &settings()).await;

    assert_eq!(summary.successful_queries, 9);
    assert_eq!(summary.failed_queries, 1);
    assert_eq!(summary.new_digests, 2);
    assert_eq!(summary.deleted_tags, 1);
    assert!(!store.monitored_tag_exists(ENDPOINT, IMAGE, "gone").unwrap());
    assert_eq!(store.stats().unwrap().tag_updates, 9 + 2);

    let executions = store.recent_job_executions(10).unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].successful_queries, 9);
    assert_eq!(executions[0].failed_queries, 1);
}

#[tokio::test(start_paused = true)]
async fn refresh_digests_is_idempotent_for_unchanged_digests() {
    let (_temp_dir, store) = create_test_store();
    store.add_monitored_tag(ENDPOINT, IMAGE, "1.0").unwrap();
    let registry =
        ScriptedRegistry::new().with_manifest(IMAGE, "1.0", vec![ManifestHead::found("sha256:a")]);
    let limiter = RateLimiter::new(10);

    refresh_digests(store.as_ref(), &registry, &limiter, &settings()).await;
    let second = refresh_digests(store.as_ref(), &registry, &limiter, &settings()).await;

    assert_eq!(second.new_digests, 0);
    assert_eq!(store.stats().unwrap().tag_updates, 1);
    assert_eq!(store.recent_job_executions(10).unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn refresh_digests_recovers_from_expired_token() {
    let (_temp_dir, store) = create_test_store();
    store.add_monitored_tag(ENDPOINT, IMAGE, "1.0").unwrap();
    store.add_monitored_tag(ENDPOINT, IMAGE, "2.0").unwrap();
    let registry = ScriptedRegistry::new()
        .with_manifest(
            IMAGE,
            "1.0",
            vec![ManifestHead::status(401), ManifestHead::found("sha256:a")],
        )
        .with_manifest(
            IMAGE,
            "2.0",
            vec![ManifestHead::status(401), ManifestHead::found("sha256:b")],
        );
    let limiter = RateLimiter::new(10);

    let summary = refresh_digests(store.as_ref(), &registry, &limiter, &settings()).await;

    assert_eq!(summary.successful_queries, 2);
    assert_eq!(registry.invalidations(), 1);
    assert_eq!(registry.head_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn refresh_digests_retries_throttled_requests_after_cooldown() {
    let (_temp_dir, store) = create_test_store();
    store.add_monitored_tag(ENDPOINT, IMAGE, "1.0").unwrap();
    let registry = ScriptedRegistry::new().with_manifest(
        IMAGE,
        "1.0",
        vec![ManifestHead::status(429), ManifestHead::found("sha256:a")],
    );
    let limiter = RateLimiter::new(10);
    let started = tokio::time::Instant::now();

    let summary = refresh_digests(store.as_ref(), &registry, &limiter, &settings()).await;

    assert_eq!(summary.successful_queries, 1);
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(registry.invalidations(), 1);
}

#[tokio::test(start_paused = true)]
async fn refresh_cycle_enrolls_discovered_tags_and_records_their_digests() {
    let (_temp_dir, store) = create_test_store();
    store.add_monitored_tag(ENDPOINT, IMAGE, "1.0").unwrap();
    let registry = ScriptedRegistry::new()
        .with_tags(
            IMAGE,
            &[
                "1.0",
                "1.1",
                "sha256-0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef.sig",
            ],
        )
        .with_manifest(IMAGE, "1.0", vec![ManifestHead::found("sha256:a")])
        .with_manifest(IMAGE, "1.1", vec![ManifestHead::found("sha256:b")]);
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(registry),
        Arc::new(RateLimiter::new(10)),
        SchedulerSettings::default(),
    );

    let summary = scheduler.run_refresh_cycle().await;

    assert_eq!(summary.successful_queries, 2);
    assert_eq!(summary.new_digests, 2);
    let tags: Vec<String> = store
        .monitored_tags()
        .unwrap()
        .into_iter()
        .map(|t| t.tag)
        .collect();
    assert_eq!(tags.len(), 2);
    assert!(tags.contains(&"1.1".to_string()));
}
