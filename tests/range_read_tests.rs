//! Range-read coverage: exact byte-range serving, suffix ranges, and
//! aggregator failover with last-known-good preference, driven through the
//! stream handler against a `wiremock`-mocked aggregator.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use floe_gateway::kv::KvStore;
use floe_gateway::models::AssetFields;
use floe_gateway::testing::{FakePublishClient, FakeRegistryClient};
use std::time::Duration;
use tower::util::ServiceExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;
use common::setup_test_app_with_aggregators;

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn seed_file_fields(app: &common::TestApp, file_id: &str, blob_id: &str, size: u64) {
    let fields = AssetFields {
        blob_id: blob_id.to_string(),
        size_bytes: size,
        mime: "application/octet-stream".to_string(),
        created_at: None,
        owner: None,
    };
    let key = app.state.keys.file_fields(file_id);
    let serialized = serde_json::to_string(&fields).unwrap();
    app.state.kv.set(&key, &serialized, Duration::from_secs(60)).await.unwrap();
}

#[tokio::test]
async fn serves_an_exact_byte_range() {
    let content = pattern_bytes(10_000);
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/blobs/blob-range"))
        .and(header("Range", "bytes=100-299"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(content[100..300].to_vec())
                .insert_header("Content-Range", format!("bytes 100-299/{}", content.len())),
        )
        .mount(&server)
        .await;

    let app = setup_test_app_with_aggregators(
        FakePublishClient::succeeding("unused"),
        FakeRegistryClient::succeeding("unused"),
        vec![server.uri()],
    )
    .await;
    seed_file_fields(&app, "file-range", "blob-range", content.len() as u64).await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/files/file-range/stream")
                .header("Range", "bytes=100-299")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), &content[100..300]);
}

#[tokio::test]
async fn serves_a_suffix_range() {
    let content = pattern_bytes(1_000);
    let server = MockServer::start().await;
    let suffix_start = content.len() - 64;

    Mock::given(method("GET"))
        .and(path("/v1/blobs/blob-suffix"))
        .and(header("Range", format!("bytes={}-{}", suffix_start, content.len() - 1)))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(content[suffix_start..].to_vec()))
        .mount(&server)
        .await;

    let app = setup_test_app_with_aggregators(
        FakePublishClient::succeeding("unused"),
        FakeRegistryClient::succeeding("unused"),
        vec![server.uri()],
    )
    .await;
    seed_file_fields(&app, "file-suffix", "blob-suffix", content.len() as u64).await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/files/file-suffix/stream")
                .header("Range", "bytes=-64")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), &content[suffix_start..]);
}

/// The first aggregator fails every attempt; the pool falls over to the
/// second and serves the bytes anyway.
#[tokio::test]
async fn falls_over_to_the_next_aggregator_on_failure() {
    let content = pattern_bytes(500);

    let bad_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/blobs/blob-failover"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&bad_server)
        .await;

    let good_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/blobs/blob-failover"))
        .and(header("Range", format!("bytes=0-{}", content.len() - 1)))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(content.clone()))
        .mount(&good_server)
        .await;

    let app = setup_test_app_with_aggregators(
        FakePublishClient::succeeding("unused"),
        FakeRegistryClient::succeeding("unused"),
        vec![bad_server.uri(), good_server.uri()],
    )
    .await;
    seed_file_fields(&app, "file-failover", "blob-failover", content.len() as u64).await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/files/file-failover/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.as_ref(), content.as_slice());
}

#[tokio::test]
async fn head_request_reports_length_without_a_body() {
    let content = pattern_bytes(2_048);
    let server = MockServer::start().await;

    let app = setup_test_app_with_aggregators(
        FakePublishClient::succeeding("unused"),
        FakeRegistryClient::succeeding("unused"),
        vec![server.uri()],
    )
    .await;
    seed_file_fields(&app, "file-head", "blob-head", content.len() as u64).await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("HEAD")
                .uri("/v1/files/file-head/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-length").unwrap(),
        &content.len().to_string()
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(body.is_empty());
}
