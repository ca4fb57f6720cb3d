//! Read proxy (§4.7): metadata/manifest/stream handlers over the asset-fields
//! cache and the segment stitcher.
//!
//! The cache-then-fetch-then-normalize flow mirrors the teacher's
//! `Storage::load_package` read-through pattern (typed parse, typed
//! failure), generalized here to a remote registry fetch instead of a local
//! file read.

pub mod range;
pub mod stitcher;

use crate::error::{Error, Result};
use crate::models::AssetFields;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Resolves `fileId` into normalized on-chain asset fields, reading through
/// the KV cache before falling back to a live registry fetch (§4.7).
pub async fn get_file_fields(state: &AppState, file_id: &str) -> Result<AssetFields> {
    let cache_key = state.keys.file_fields(file_id);

    if let Some(raw) = state.kv.get(&cache_key).await? {
        if let Ok(fields) = serde_json::from_str::<AssetFields>(&raw) {
            return Ok(fields);
        }
    }

    let fields = state.registry.get_fields(file_id).await?;

    if let Ok(serialized) = serde_json::to_string(&fields) {
        let ttl = Duration::from_millis(state.config.sui.file_fields_cache_ttl_ms);
        let _ = state.kv.set(&cache_key, &serialized, ttl).await;
    }

    Ok(fields)
}

fn should_include_blob_id(state: &AppState, query: &IncludeBlobIdQuery) -> bool {
    state.config.server.expose_blob_id || matches!(query.include_blob_id.as_deref(), Some("1") | Some("true"))
}

#[derive(Debug, Deserialize)]
pub struct IncludeBlobIdQuery {
    #[serde(rename = "includeBlobId")]
    include_blob_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataResponse {
    file_id: String,
    manifest_version: u32,
    container: &'static str,
    size_bytes: u64,
    mime_type: String,
    owner: Option<String>,
    created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blob_id: Option<String>,
}

pub async fn metadata(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
    Query(query): Query<IncludeBlobIdQuery>,
) -> Result<Response> {
    let fields = get_file_fields(&state, &file_id).await?;
    let include_blob_id = should_include_blob_id(&state, &query);

    Ok(axum::Json(MetadataResponse {
        file_id,
        manifest_version: 1,
        container: "walrus_single_blob",
        size_bytes: fields.size_bytes,
        mime_type: fields.mime,
        owner: fields.owner,
        created_at: fields.created_at,
        blob_id: include_blob_id.then_some(fields.blob_id),
    })
    .into_response())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Segment {
    index: u32,
    offset_bytes: u64,
    size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    blob_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct Layout {
    #[serde(rename = "type")]
    kind: &'static str,
    segments: Vec<Segment>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestResponse {
    file_id: String,
    manifest_version: u32,
    container: &'static str,
    size_bytes: u64,
    mime_type: String,
    owner: Option<String>,
    created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blob_id: Option<String>,
    layout: Layout,
}

pub async fn manifest(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
    Query(query): Query<IncludeBlobIdQuery>,
) -> Result<Response> {
    let fields = get_file_fields(&state, &file_id).await?;
    let include_blob_id = should_include_blob_id(&state, &query);

    Ok(axum::Json(ManifestResponse {
        file_id: file_id.clone(),
        manifest_version: 1,
        container: "walrus_single_blob",
        size_bytes: fields.size_bytes,
        mime_type: fields.mime.clone(),
        owner: fields.owner.clone(),
        created_at: fields.created_at.clone(),
        blob_id: include_blob_id.then_some(fields.blob_id.clone()),
        layout: Layout {
            kind: "walrus_single_blob",
            segments: vec![Segment {
                index: 0,
                offset_bytes: 0,
                size_bytes: fields.size_bytes,
                blob_id: include_blob_id.then_some(fields.blob_id),
            }],
        },
    })
    .into_response())
}

pub async fn stream(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
    method: axum::http::Method,
) -> Result<Response> {
    let fields = get_file_fields(&state, &file_id).await?;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let parsed_range = match &range_header {
        Some(h) => Some(range::parse_range(h, fields.size_bytes)?),
        None => None,
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
    if let Ok(etag) = fields.blob_id.parse() {
        response_headers.insert(header::ETAG, etag);
    }
    if let Ok(content_type) = fields.mime.parse() {
        response_headers.insert(header::CONTENT_TYPE, content_type);
    }

    let (status, served_range) = match parsed_range {
        Some(r) => (StatusCode::PARTIAL_CONTENT, r),
        None => (
            StatusCode::OK,
            range::ByteRange {
                start: 0,
                end: fields.size_bytes.saturating_sub(1),
            },
        ),
    };

    response_headers.insert(
        header::CONTENT_LENGTH,
        served_range.len().to_string().parse().unwrap(),
    );
    if status == StatusCode::PARTIAL_CONTENT {
        response_headers.insert(
            header::CONTENT_RANGE,
            format!(
                "bytes {}-{}/{}",
                served_range.start, served_range.end, fields.size_bytes
            )
            .parse()
            .unwrap(),
        );
    }

    if method == axum::http::Method::HEAD {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        return Ok(response);
    }

    let cancel = CancellationToken::new();
    let body_stream = state
        .aggregators
        .stream_range(fields.blob_id, served_range, fields.size_bytes, cancel.clone());

    // Dropped when the response body is dropped, i.e. on client disconnect:
    // fires the same abort signal threaded into every upstream fetch and
    // inter-attempt sleep in the stitcher.
    let guard = cancel.drop_guard();
    let body_stream = body_stream.map(move |item| {
        let _ = &guard;
        item
    });
    let body = Body::from_stream(body_stream);

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}
