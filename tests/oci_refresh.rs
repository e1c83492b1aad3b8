//! Discovery and refresh against an HTTP registry

mod helper;

use helper::create_test_store;
use mockito::{Matcher, Server};
use tag_monitor::engine::discovery::discover_new_tags;
use tag_monitor::engine::rate_limiter::RateLimiter;
use tag_monitor::engine::refresh::{RefreshSettings, refresh_digests};
use tag_monitor::registry::oci::OciRegistryClient;
use tag_monitor::store::RecordStore;

#[tokio::test]
async fn discover_and_refresh_against_registry() {
    let mut server = Server::new_async().await;
    let endpoint = server.url();
    let (_temp_dir, store) = create_test_store();
    store.add_monitored_tag(&endpoint, "owner/app", "1.0").unwrap();
    store.add_monitored_tag(&endpoint, "owner/app", "gone").unwrap();

    let tags_mock = server
        .mock("GET", "/v2/owner/app/tags/list")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"name":"owner/app","tags":["1.0","1.1"]}"#)
        .create_async()
        .await;
    let head_1_0 = server
        .mock("HEAD", "/v2/owner/app/manifests/1.0")
        .with_status(200)
        .with_header("docker-content-digest", "sha256:aaa")
        .create_async()
        .await;
    let head_1_1 = server
        .mock("HEAD", "/v2/owner/app/manifests/1.1")
        .with_status(200)
        .with_header("docker-content-digest", "sha256:bbb")
        .create_async()
        .await;
    let head_gone = server
        .mock("HEAD", "/v2/owner/app/manifests/gone")
        .with_status(404)
        .create_async()
        .await;

    let registry = OciRegistryClient::new();
    let limiter = RateLimiter::new(100);

    let discovery = discover_new_tags(store.as_ref(), &registry, &limiter).await;
    let refresh =
        refresh_digests(store.as_ref(), &registry, &limiter, &RefreshSettings::default()).await;

    tags_mock.assert_async().await;
    head_1_0.assert_async().await;
    head_1_1.assert_async().await;
    head_gone.assert_async().await;

    assert_eq!(discovery.tags_enrolled, 1);
    assert_eq!(refresh.successful_queries, 2);
    assert_eq!(refresh.failed_queries, 1);
    assert_eq!(refresh.deleted_tags, 1);

    let tag = store
        .find_monitored_tag(&endpoint, "owner/app", "1.1")
        .unwrap()
        .unwrap();
    assert_eq!(store.latest_update(tag.id).unwrap().unwrap().digest, "sha256:bbb");
    assert!(!store.monitored_tag_exists(&endpoint, "owner/app", "gone").unwrap());
}

#[tokio::test]
async fn refresh_fetches_one_token_for_whole_batch() {
    let mut server = Server::new_async().await;
    let endpoint = server.url();
    let (_temp_dir, store) = create_test_store();
    for i in 0..10 {
        store
            .add_monitored_tag(&endpoint, "owner/app", &format!("1.{}", i))
            .unwrap();
    }

    let challenge = format!(
        r#"Bearer realm="{}/token",service="registry.test",scope="repository:owner/app:pull""#,
        endpoint
    );
    let unauthenticated = server
        .mock("HEAD", Matcher::Regex(r"^/v2/owner/app/manifests/".to_string()))
        .match_header("authorization", Matcher::Missing)
        .with_status(401)
        .with_header("www-authenticate", &challenge)
        .expect(1)
        .create_async()
        .await;
    let token = server
        .mock("GET", "/token")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token": "abc", "expires_in": 300}"#)
        .expect(1)
        .create_async()
        .await;
    let authenticated = server
        .mock("HEAD", Matcher::Regex(r"^/v2/owner/app/manifests/".to_string()))
        .match_header("authorization", "Bearer abc")
        .with_status(200)
        .with_header("docker-content-digest", "sha256:aaa")
        .expect(10)
        .create_async()
        .await;

    let registry = OciRegistryClient::new();
    let limiter = RateLimiter::new(1000);

    let summary =
        refresh_digests(store.as_ref(), &registry, &limiter, &RefreshSettings::default()).await;

    unauthenticated.assert_async().await;
    token.assert_async().await;
    authenticated.assert_async().await;
    assert_eq!(summary.successful_queries, 10);
    assert_eq!(summary.failed_queries, 0);
}
