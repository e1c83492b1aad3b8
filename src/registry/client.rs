//! Registry client trait consumed by the reconciliation engine

#[cfg(test)]
use mockall::automock;

use crate::registry::error::RegistryError;

/// Outcome of a manifest HEAD request
///
/// Registry-side statuses (401, 404, 429, ...) are reported here rather than as
/// errors, so callers can decide how to recover. Only transport-level failures
/// are returned as `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestHead {
    pub exists: bool,
    pub digest: Option<String>,
    pub status_code: u16,
}

impl ManifestHead {
    pub fn found(digest: &str) -> Self {
        Self {
            exists: true,
            digest: Some(digest.to_string()),
            status_code: 200,
        }
    }

    pub fn status(status_code: u16) -> Self {
        Self {
            exists: false,
            digest: None,
            status_code,
        }
    }
}

/// Capability for querying an image registry
///
/// Implementations own their authentication state. Retrying and rate limiting
/// are the caller's job.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync {
    /// Checks whether `endpoint/image:tag` exists and returns its manifest digest
    async fn head_manifest(
        &self,
        endpoint: &str,
        image: &str,
        tag: &str,
    ) -> Result<ManifestHead, RegistryError>;

    /// Lists every tag of `endpoint/image`
    async fn list_tags(&self, endpoint: &str, image: &str) -> Result<Vec<String>, RegistryError>;

    /// Drops all cached credentials/tokens so the next request re-authenticates
    async fn invalidate_auth(&self);
}
