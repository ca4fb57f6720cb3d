//! Crash-resume and concurrent-finalize coverage (§4.4, §5).

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tower::util::ServiceExt;

mod common;
use common::setup_test_app;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create(app: &common::TestApp, filename: &str, size: u64, chunk_size: u64) -> String {
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/uploads/create")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({
                        "filename": filename,
                        "contentType": "application/octet-stream",
                        "sizeBytes": size,
                        "chunkSize": chunk_size,
                    }))
                    .unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["uploadId"].as_str().unwrap().to_string()
}

/// After uploading one of two chunks and checking status (standing in for a
/// client restart that re-reads progress via `GET status`), the remaining
/// chunk still uploads and completion still succeeds.
#[tokio::test]
async fn status_after_partial_upload_then_resume_to_completion() {
    let app = setup_test_app().await;
    let upload_id = create(&app, "resume.bin", 16, 8).await;

    let boundary = "floe-test-boundary";
    let mut chunk0_body = Vec::new();
    chunk0_body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    chunk0_body.extend_from_slice(b"Content-Disposition: form-data; name=\"file\"; filename=\"chunk\"\r\n\r\n");
    chunk0_body.extend_from_slice(&[7u8; 8]);
    chunk0_body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    let hash0 = hex::encode(sha2::Sha256::digest([7u8; 8]));

    let r0 = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/v1/uploads/{upload_id}/chunk/0"))
                .header("Content-Type", format!("multipart/form-data; boundary={boundary}"))
                .header("x-chunk-sha256", hash0)
                .body(Body::from(chunk0_body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(r0.status(), StatusCode::OK);

    // "Restart": the client re-reads status before resuming.
    let status_resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/v1/uploads/{upload_id}/status"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(status_resp.status(), StatusCode::OK);
    let status = body_json(status_resp).await;
    assert_eq!(status["receivedChunks"], json!([0]));

    let mut chunk1_body = Vec::new();
    chunk1_body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    chunk1_body.extend_from_slice(b"Content-Disposition: form-data; name=\"file\"; filename=\"chunk\"\r\n\r\n");
    chunk1_body.extend_from_slice(&[9u8; 8]);
    chunk1_body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    let hash1 = hex::encode(sha2::Sha256::digest([9u8; 8]));

    let r1 = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/v1/uploads/{upload_id}/chunk/1"))
                .header("Content-Type", format!("multipart/form-data; boundary={boundary}"))
                .header("x-chunk-sha256", hash1)
                .body(Body::from(chunk1_body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(r1.status(), StatusCode::OK);

    let complete_resp = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/uploads/{upload_id}/complete"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(complete_resp.status(), StatusCode::OK);
}

/// Two concurrent `complete` calls for the same upload: exactly one wins the
/// finalization lock outright; the other either observes the same
/// completed result or is told finalization is already in progress, never
/// anything else.
#[tokio::test]
async fn concurrent_complete_calls_agree_on_one_outcome() {
    let app = setup_test_app().await;
    let upload_id = create(&app, "race.bin", 8, 8).await;

    let boundary = "floe-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"file\"; filename=\"chunk\"\r\n\r\n");
    body.extend_from_slice(&[3u8; 8]);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    let hash = hex::encode(sha2::Sha256::digest([3u8; 8]));

    let r = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/v1/uploads/{upload_id}/chunk/0"))
                .header("Content-Type", format!("multipart/form-data; boundary={boundary}"))
                .header("x-chunk-sha256", hash)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(r.status(), StatusCode::OK);

    let router_a = app.router.clone();
    let router_b = app.router.clone();
    let uri = format!("/v1/uploads/{upload_id}/complete");
    let uri_a = uri.clone();
    let uri_b = uri.clone();

    let (resp_a, resp_b) = tokio::join!(
        router_a.oneshot(Request::builder().method("POST").uri(uri_a).body(Body::empty()).unwrap()),
        router_b.oneshot(Request::builder().method("POST").uri(uri_b).body(Body::empty()).unwrap()),
    );
    let resp_a = resp_a.unwrap();
    let resp_b = resp_b.unwrap();

    let statuses = [resp_a.status(), resp_b.status()];
    assert!(statuses.contains(&StatusCode::OK), "at least one completion must succeed");
    for status in statuses {
        assert!(
            status == StatusCode::OK || status == StatusCode::CONFLICT,
            "unexpected status {status}"
        );
    }
}
