//! One-shot import of catalog images into the monitored tag set

use tracing::{error, info};

use crate::registry::catalog::Catalog;
use crate::store::RecordStore;

/// Insert every catalog triple that is not monitored yet
///
/// Returns the number of newly inserted tags. Store failures for a single
/// triple are logged and skipped.
pub async fn import_popular_images<S: RecordStore>(store: &S, catalog: &dyn Catalog) -> usize {
    let images = catalog.images_to_track().await;
    info!(candidates = images.len(), "Importing catalog images");

    let mut inserted = 0;
    for image in &images {
        match store.add_monitored_tag(&image.endpoint, &image.image, &image.tag) {
            Ok(true) => inserted += 1,
            Ok(false) => {}
            Err(e) => error!("Failed to import {}: {}", image, e),
        }
    }

    info!(inserted, "Catalog import completed");
    inserted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::catalog::MockCatalog;
    use crate::store::error::StoreError;
    use crate::registry::reference::ImageRef;
    use crate::store::{MockRecordStore, SqliteStore};
    use tempfile::TempDir;

    fn catalog_of(refs: &'static [&'static str]) -> MockCatalog {
        let mut catalog = MockCatalog::new();
        catalog.expect_images_to_track().returning(move || {
            refs.iter()
                .map(|r| r.parse::<ImageRef>().unwrap())
                .collect()
        });
        catalog
    }

    #[tokio::test]
    async fn import_popular_images_inserts_only_absent_triples() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStore::new(&temp_dir.path().join("test.db")).unwrap();
        store
            .add_monitored_tag("index.docker.io", "library/nginx", "1.27")
            .unwrap();
        let catalog = catalog_of(&["nginx:1.27", "nginx:1.28", "redis:7"]);

        let inserted = import_popular_images(&store, &catalog).await;

        assert_eq!(inserted, 2);
        assert_eq!(store.stats().unwrap().monitored_tags, 3);
        assert!(
            store
                .monitored_tag_exists("index.docker.io", "library/redis", "7")
                .unwrap()
        );
    }

    #[tokio::test]
    async fn import_popular_images_skips_failed_inserts() {
        let mut store = MockRecordStore::new();
        store
            .expect_add_monitored_tag()
            .withf(|_, image, _| image == "library/nginx")
            .returning(|_, _, _| Err(StoreError::LockPoisoned));
        store
            .expect_add_monitored_tag()
            .withf(|_, image, _| image == "library/redis")
            .returning(|_, _, _| Ok(true));
        let catalog = catalog_of(&["nginx:1.27", "redis:7"]);

        let inserted = import_popular_images(&store, &catalog).await;

        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn import_popular_images_with_empty_catalog_inserts_nothing() {
        let mut store = MockRecordStore::new();
        store.expect_add_monitored_tag().times(0);
        let catalog = catalog_of(&[]);

        assert_eq!(import_popular_images(&store, &catalog).await, 0);
    }
}
