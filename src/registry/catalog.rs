//! Docker Hub catalog of popular images, used to seed tracking

#[cfg(test)]
use mockall::automock;

use serde::Deserialize;
use tracing::{info, warn};

use crate::registry::reference::{DOCKER_HUB_ENDPOINT, ImageRef, normalize_docker_hub_image};

/// Default base URL for the Docker Hub web API
const DEFAULT_BASE_URL: &str = "https://hub.docker.com";

/// Number of popular images requested from the search API
const POPULAR_IMAGES_COUNT: usize = 100;

/// Number of most recently pushed tags seeded per popular image
pub const TAGS_PER_IMAGE_MAX_COUNT: usize = 25;

/// Source of image triples that should be tracked
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    /// Returns (endpoint, image, tag) triples to track; failures yield a partial list
    async fn images_to_track(&self) -> Vec<ImageRef>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    results: Vec<TagResult>,
}

#[derive(Debug, Deserialize)]
struct TagResult {
    name: Option<String>,
    content_type: Option<String>,
}

/// Catalog backed by the Docker Hub search and repository APIs
pub struct DockerHubCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl DockerHubCatalog {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("tag-monitor/", env!("CARGO_PKG_VERSION")))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Names of the most pulled images, normalized to `namespace/name`
    pub async fn popular_images(&self) -> Vec<String> {
        info!("Getting popular images");
        let url = format!(
            "{}/api/search/v3/catalog/search?from=0&size={}&type=image&sort=pull_count&order=desc",
            self.base_url, POPULAR_IMAGES_COUNT
        );

        let response = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(
                    "Failed to get popular images: unexpected status {}",
                    response.status()
                );
                return Vec::new();
            }
            Err(e) => {
                warn!("Failed to get popular images: {}", e);
                return Vec::new();
            }
        };

        let search: SearchResponse = match response.json().await {
            Ok(search) => search,
            Err(e) => {
                warn!("Unexpected response from Docker Hub search API: {}", e);
                return Vec::new();
            }
        };

        let images: Vec<String> = search
            .results
            .into_iter()
            .filter_map(|result| match result.id {
                Some(id) => Some(normalize_docker_hub_image(&id)),
                None => {
                    warn!("Search result without 'id' field, skipping");
                    None
                }
            })
            .collect();

        info!("Retrieved {} popular images", images.len());
        images
    }

    /// Most recently pushed image tags of a Docker Hub repository
    async fn image_tags(&self, image: &str) -> Result<Vec<String>, reqwest::Error> {
        let url = format!(
            "{}/v2/repositories/{}/tags?page_size={}&ordering=last_updated",
            self.base_url, image, TAGS_PER_IMAGE_MAX_COUNT
        );

        let tags: TagsResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(tags
            .results
            .into_iter()
            .filter(|result| result.content_type.as_deref() == Some("image"))
            .filter_map(|result| result.name)
            .collect())
    }
}

impl Default for DockerHubCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

#[async_trait::async_trait]
impl Catalog for DockerHubCatalog {
    async fn images_to_track(&self) -> Vec<ImageRef> {
        let images = self.popular_images().await;
        let mut to_track = Vec::new();

        for image in images {
            match self.image_tags(&image).await {
                Ok(tags) => to_track.extend(
                    tags.into_iter()
                        .map(|tag| ImageRef::new(DOCKER_HUB_ENDPOINT, &image, &tag)),
                ),
                Err(e) => {
                    // Most likely throttled, later images would fail the same way
                    warn!("Failed to get tags for image '{}': {}", image, e);
                    break;
                }
            }
        }

        info!("Retrieved {} images with tags to track", to_track.len());
        to_track
    }
}
