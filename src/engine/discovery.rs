//! Tag discovery: enroll tags that appeared in the registry since the last pass

use std::collections::BTreeSet;

use tracing::{debug, error, info, warn};

use crate::engine::rate_limiter::RateLimiter;
use crate::registry::client::RegistryClient;
use crate::registry::tags::filter_version_tags;
use crate::store::{RecordStore, TrackedImage};

/// Counters of one discovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub images_scanned: u32,
    pub images_failed: u32,
    pub tags_enrolled: u32,
}

/// Diff one image's live tag list against its snapshot and enroll new tags
///
/// Returns the number of enrolled tags, or `None` if the image was skipped.
async fn discover_image<S: RecordStore>(
    store: &S,
    registry: &dyn RegistryClient,
    limiter: &RateLimiter,
    image: &TrackedImage,
) -> Option<usize> {
    let image_name = format!("{}/{}", image.endpoint, image.image);

    let snapshot = store
        .ensure_snapshot(&image.endpoint, &image.image)
        .inspect_err(|e| error!("Failed to load tag snapshot for {}: {}", image_name, e))
        .ok()?;

    limiter.acquire().await;
    let live_tags: BTreeSet<String> = match registry.list_tags(&image.endpoint, &image.image).await
    {
        Ok(tags) => filter_version_tags(tags).into_iter().collect(),
        Err(e) => {
            warn!("Failed to list tags of {}: {}", image_name, e);
            return None;
        }
    };

    let new_tags: Vec<String> = live_tags
        .difference(&snapshot.known_tags)
        .cloned()
        .collect();

    if new_tags.is_empty() && live_tags == snapshot.known_tags {
        debug!("No tag changes for {}", image_name);
        return Some(0);
    }

    let enrolled = store
        .apply_discovery(&image.endpoint, &image.image, &new_tags, &live_tags)
        .inspect_err(|e| error!("Failed to store discovered tags of {}: {}", image_name, e))
        .ok()?;

    info!(
        image = %image_name,
        live_tags = live_tags.len(),
        new_tags = new_tags.len(),
        enrolled,
        "Discovered tags"
    );
    Some(enrolled)
}

/// Enroll newly published tags of every tracked image
///
/// An image's first pass treats every live tag as new. Signature and
/// attestation tags are never enrolled. A failure for one image leaves its
/// snapshot untouched and does not stop processing of other images.
pub async fn discover_new_tags<S: RecordStore>(
    store: &S,
    registry: &dyn RegistryClient,
    limiter: &RateLimiter,
) -> DiscoverySummary {
    let mut summary = DiscoverySummary::default();

    let images = match store.tracked_images() {
        Ok(images) => images,
        Err(e) => {
            error!("Failed to load tracked images: {}", e);
            return summary;
        }
    };
    info!(images = images.len(), "Discovering new tags");

    for image in &images {
        summary.images_scanned += 1;
        match discover_image(store, registry, limiter, image).await {
            Some(enrolled) => summary.tags_enrolled += enrolled as u32,
            None => summary.images_failed += 1,
        }
    }

    info!(
        images_scanned = summary.images_scanned,
        images_failed = summary.images_failed,
        tags_enrolled = summary.tags_enrolled,
        "Tag discovery completed"
    );
    summary
}
