//! Handlers of the command line subcommands

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use futures::future::join_all;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::rate_limiter::RateLimiter;
use crate::engine::scheduler::Scheduler;
use crate::registry::catalog::DockerHubCatalog;
use crate::registry::client::RegistryClient;
use crate::registry::oci::OciRegistryClient;
use crate::registry::reference::{DOCKER_HUB_ENDPOINT, ImageRef};
use crate::store::{RecordStore, SqliteStore};

/// Opens the record store, creating its directory if needed
pub fn open_store(db_path: &Path) -> anyhow::Result<SqliteStore> {
    if let Some(parent) = db_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }
    SqliteStore::new(db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))
}

fn registry_client(config: &Config) -> OciRegistryClient {
    let client = OciRegistryClient::new();
    match config.dockerhub_credentials() {
        Some(credentials) => client.with_credentials(DOCKER_HUB_ENDPOINT, credentials),
        None => client,
    }
}

fn scheduler(config: &Config) -> anyhow::Result<Scheduler<SqliteStore>> {
    let store = open_store(&config.database_path())?;
    let scheduler = Scheduler::new(
        Arc::new(store),
        Arc::new(registry_client(config)),
        Arc::new(RateLimiter::new(config.max_requests_per_second)),
        config.scheduler_settings(),
    );

    Ok(if config.import_popular_images {
        scheduler.with_catalog(Arc::new(DockerHubCatalog::default()))
    } else {
        scheduler
    })
}

/// Runs the scheduler until interrupted
pub async fn run(config: &Config) -> anyhow::Result<()> {
    let mut scheduler = scheduler(config)?;

    tokio::select! {
        _ = scheduler.run_forever() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Received shutdown signal, stopping");
        }
    }

    Ok(())
}

/// Runs one retention + discovery + refresh pass
pub async fn refresh(config: &Config) -> anyhow::Result<()> {
    let summary = scheduler(config)?.run_refresh_cycle().await;

    println!(
        "successful: {}, failed: {}, new digests: {}, deleted tags: {}",
        summary.successful_queries,
        summary.failed_queries,
        summary.new_digests,
        summary.deleted_tags
    );
    Ok(())
}

/// Enrolls tags after checking that every one of them exists
///
/// Nothing is stored unless all references resolve. Returns how many tags
/// were newly added.
pub async fn enroll_tags<S: RecordStore>(
    store: &S,
    registry: &dyn RegistryClient,
    limiter: &RateLimiter,
    references: &[ImageRef],
) -> anyhow::Result<usize> {
    let heads = join_all(references.iter().map(|reference| async move {
        limiter.acquire().await;
        registry
            .head_manifest(&reference.endpoint, &reference.image, &reference.tag)
            .await
    }))
    .await;

    let mut missing = Vec::new();
    for (reference, head) in references.iter().zip(heads) {
        match head {
            Ok(head) if head.exists => {}
            Ok(head) => {
                warn!(status = head.status_code, "Tag {} not found", reference);
                missing.push(reference.to_string());
            }
            Err(e) => {
                warn!("Failed to look up {}: {}", reference, e);
                missing.push(reference.to_string());
            }
        }
    }
    if !missing.is_empty() {
        bail!("Tags not found in registry: {}", missing.join(", "));
    }

    let mut added = 0;
    for reference in references {
        if store.add_monitored_tag(&reference.endpoint, &reference.image, &reference.tag)? {
            added += 1;
        }
    }
    Ok(added)
}

pub async fn add(config: &Config, references: &[String]) -> anyhow::Result<()> {
    let references = references
        .iter()
        .map(|r| r.parse::<ImageRef>())
        .collect::<Result<Vec<_>, _>>()?;
    let store = open_store(&config.database_path())?;
    let registry = registry_client(config);
    let limiter = RateLimiter::new(config.max_requests_per_second);

    let added = enroll_tags(&store, &registry, &limiter, &references).await?;

    println!(
        "added {} tag(s), {} already monitored",
        added,
        references.len() - added
    );
    Ok(())
}

/// Prints the digest history of a tag and marks it as viewed
pub fn history(config: &Config, reference: &str) -> anyhow::Result<()> {
    let reference: ImageRef = reference.parse()?;
    let store = open_store(&config.database_path())?;

    let Some(tag) =
        store.find_monitored_tag(&reference.endpoint, &reference.image, &reference.tag)?
    else {
        bail!("{} is not monitored", reference);
    };
    store.set_last_viewed(tag.id, Utc::now())?;

    let updates = store.updates(tag.id)?;
    println!("{} (monitored since {})", reference, tag.added_at.to_rfc3339());
    if updates.is_empty() {
        println!("  no digests recorded yet");
    }
    for update in updates {
        println!("  {}  {}", update.scraped_at.to_rfc3339(), update.digest);
    }
    Ok(())
}

/// Prints row counts and the most recent refresh cycles
pub fn status(config: &Config, limit: usize) -> anyhow::Result<()> {
    let store = open_store(&config.database_path())?;
    let stats = store.stats()?;

    println!("monitored tags:  {}", stats.monitored_tags);
    println!("digest records:  {}", stats.tag_updates);
    println!("image snapshots: {}", stats.image_snapshots);
    println!("refresh cycles:  {}", stats.job_executions);

    let executions = store.recent_job_executions(limit)?;
    if !executions.is_empty() {
        println!();
        println!("recent refresh cycles:");
    }
    for execution in executions {
        let duration = execution.completed - execution.started;
        println!(
            "  {}  {}s  successful: {}, failed: {}",
            execution.started.to_rfc3339(),
            duration.num_seconds(),
            execution.successful_queries,
            execution.failed_queries
        );
    }
    Ok(())
}
