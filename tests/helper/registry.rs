//! Registry test utilities

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use tag_monitor::registry::client::{ManifestHead, RegistryClient};
use tag_monitor::registry::error::RegistryError;

/// In-memory registry answering from scripted responses
///
/// Each tag has a queue of manifest responses; the last one is repeated once
/// the queue is down to a single entry. Unknown tags answer 404.
#[derive(Default)]
pub struct ScriptedRegistry {
    manifests: Mutex<HashMap<String, VecDeque<ManifestHead>>>,
    tags: HashMap<String, Vec<String>>,
    head_calls: AtomicUsize,
    invalidations: AtomicUsize,
}

impl ScriptedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the responses of `image:tag`, served in order
    pub fn with_manifest(self, image: &str, tag: &str, responses: Vec<ManifestHead>) -> Self {
        self.manifests
            .lock()
            .unwrap()
            .insert(format!("{}:{}", image, tag), responses.into());
        self
    }

    /// Sets the live tag list of `image`
    pub fn with_tags(mut self, image: &str, tags: &[&str]) -> Self {
        self.tags.insert(
            image.to_string(),
            tags.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    pub fn head_calls(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryClient for ScriptedRegistry {
    async fn head_manifest(
        &self,
        _endpoint: &str,
        image: &str,
        tag: &str,
    ) -> Result<ManifestHead, RegistryError> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);

        let mut manifests = self.manifests.lock().unwrap();
        let response = match manifests.get_mut(&format!("{}:{}", image, tag)) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(response.unwrap_or_else(|| ManifestHead::status(404)))
    }

    async fn list_tags(&self, _endpoint: &str, image: &str) -> Result<Vec<String>, RegistryError> {
        self.tags
            .get(image)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(image.to_string()))
    }

    async fn invalidate_auth(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}
