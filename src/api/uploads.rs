//! Upload session routes (§4.2, §4.3, §4.4, §6): create, chunk, status,
//! complete, cancel. Shaped like the teacher's `api::upload` handlers
//! (`State` + `Path` extractors, structured error mapping) but consuming a
//! streamed multipart file part per chunk rather than a raw body.

use crate::config;
use crate::error::{Error, Result};
use crate::models::session::SessionBuilder;
use crate::models::SessionStatus;
use crate::state::AppState;
use axum::extract::{Multipart, Path, State};
use axum::response::IntoResponse;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadRequest {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub epochs: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadResponse {
    pub upload_id: Uuid,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub epochs: i64,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

fn validate_create_request(req: &CreateUploadRequest) -> Result<()> {
    if req.filename.is_empty() || req.filename.len() > config::MAX_FILENAME_LEN {
        return Err(Error::InvalidFilename {
            msg: format!("filename must be 1..={} bytes", config::MAX_FILENAME_LEN),
        });
    }
    if req.content_type.is_empty() || req.content_type.len() > config::MAX_CONTENT_TYPE_LEN {
        return Err(Error::InvalidContentType {
            msg: format!("contentType must be 1..={} bytes", config::MAX_CONTENT_TYPE_LEN),
        });
    }
    if req.size_bytes == 0 {
        return Err(Error::InvalidFileSize {
            msg: "sizeBytes must be positive".to_string(),
        });
    }
    if req.size_bytes > config::MAX_FILE_SIZE_BYTES {
        return Err(Error::FileTooLarge {
            msg: format!("sizeBytes exceeds max of {}", config::MAX_FILE_SIZE_BYTES),
        });
    }
    if let Some(cs) = req.chunk_size {
        if cs == 0 {
            return Err(Error::InvalidChunkSize {
                msg: "chunkSize must be positive".to_string(),
            });
        }
    }
    if let Some(e) = req.epochs {
        if e <= 0 {
            return Err(Error::InvalidEpochs { epochs: e });
        }
    }
    Ok(())
}

pub async fn create_upload(
    State(state): State<Arc<AppState>>,
    axum::Json(req): axum::Json<CreateUploadRequest>,
) -> Result<impl IntoResponse> {
    validate_create_request(&req)?;

    let active = state.sessions.active_count().await?;
    if active >= config::MAX_ACTIVE_UPLOADS as u64 {
        return Err(Error::UploadCapacityReached);
    }

    let chunk_size = config::clamp_chunk_size(req.chunk_size);
    let epochs = config::clamp_epochs(req.epochs);

    let total_chunks_check = req.size_bytes.div_ceil(chunk_size);
    if total_chunks_check > config::MAX_TOTAL_CHUNKS {
        return Err(Error::TooManyChunks {
            msg: format!("totalChunks {total_chunks_check} exceeds max of {}", config::MAX_TOTAL_CHUNKS),
        });
    }

    let session = SessionBuilder::new()
        .filename(req.filename)
        .content_type(req.content_type)
        .size_bytes(req.size_bytes)
        .chunk_size(chunk_size)
        .epochs(epochs)
        .session_ttl_secs(state.config.storage.session_ttl_secs)
        .build();

    state.sessions.create(&session).await?;

    Ok(axum::Json(CreateUploadResponse {
        upload_id: session.upload_id,
        chunk_size: session.chunk_size,
        total_chunks: session.total_chunks,
        epochs: session.epochs,
        expires_at: session.expires_at,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub ok: bool,
    pub chunk_index: u32,
}

pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Path((upload_id, index)): Path<(String, u32)>,
    headers: axum::http::HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let upload_id = parse_upload_id(&upload_id)?;

    let session = state
        .sessions
        .get(upload_id)
        .await?
        .ok_or(Error::UploadNotFound {
            upload_id: upload_id.to_string(),
        })?;

    if session.status == SessionStatus::Completed {
        return Err(Error::UploadAlreadyCompleted {
            upload_id: upload_id.to_string(),
        });
    }
    if index >= session.total_chunks {
        return Err(Error::InvalidChunk {
            reason: format!("index {index} out of range [0, {})", session.total_chunks),
        });
    }

    let expected_hash = headers
        .get("x-chunk-sha256")
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::InvalidChunk {
            reason: "missing x-chunk-sha256 header".to_string(),
        })?
        .to_lowercase();

    let field = multipart
        .next_field()
        .await
        .map_err(|e| Error::ChunkStreamError { msg: e.to_string() })?
        .ok_or(Error::InvalidChunk {
            reason: "missing file part".to_string(),
        })?;

    let expected_size = session.expected_chunk_size(index);
    let is_last = session.is_last_chunk(index);

    let stream = Box::pin(field.map(|r| r.map_err(|e| Error::ChunkStreamError { msg: e.to_string() })));

    state
        .chunks
        .write_chunk(upload_id, index, stream, &expected_hash, expected_size, is_last)
        .await?;

    state.sessions.mark_chunk_received(upload_id, index).await?;

    Ok(axum::Json(UploadChunkResponse {
        ok: true,
        chunk_index: index,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub upload_id: Uuid,
    pub chunk_size: Option<u64>,
    pub total_chunks: Option<u32>,
    pub received_chunks: Vec<u32>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse> {
    let upload_id = parse_upload_id(&upload_id)?;

    if let Some(session) = state.sessions.get(upload_id).await? {
        let mut received = state.sessions.received_chunks(upload_id).await?;
        received.sort_unstable();

        return Ok(axum::Json(StatusResponse {
            upload_id,
            chunk_size: Some(session.chunk_size),
            total_chunks: Some(session.total_chunks),
            received_chunks: received,
            expires_at: Some(session.expires_at),
            status: session.status.as_str().to_string(),
            file_id: None,
            blob_id: None,
            error: None,
        }));
    }

    let meta = state.sessions.get_meta(upload_id).await?;
    let status = meta.status.ok_or(Error::UploadNotFound {
        upload_id: upload_id.to_string(),
    })?;

    Ok(axum::Json(StatusResponse {
        upload_id,
        chunk_size: None,
        total_chunks: None,
        received_chunks: vec![],
        expires_at: None,
        status: status.as_str().to_string(),
        file_id: meta.file_id,
        blob_id: meta.blob_id,
        error: meta.error,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub file_id: String,
    pub blob_id: String,
    pub size_bytes: u64,
    pub status: &'static str,
}

pub async fn complete(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse> {
    let upload_id = parse_upload_id(&upload_id)?;
    let triple = state.finalize.complete(upload_id).await?;

    Ok(axum::Json(CompleteResponse {
        file_id: triple.file_id,
        blob_id: triple.blob_id,
        size_bytes: triple.size_bytes,
        status: "ready",
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub ok: bool,
    pub upload_id: Uuid,
    pub status: &'static str,
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse> {
    let upload_id = parse_upload_id(&upload_id)?;
    let id = upload_id.to_string();

    if state.kv.exists(&state.keys.lock(&id)).await? {
        return Err(Error::UploadFinalizationInProgress {
            upload_id: id,
        });
    }

    state.sessions.transition(upload_id, SessionStatus::Canceled).await?;
    state.kv.delete(&state.keys.session(&id)).await?;
    state.kv.delete(&state.keys.chunks(&id)).await?;
    state.kv.srem(&state.keys.gc_active(), &id).await?;
    state.chunks.cleanup(upload_id).await;

    Ok(axum::Json(CancelResponse {
        ok: true,
        upload_id,
        status: "canceled",
    }))
}

fn parse_upload_id(raw: &str) -> Result<Uuid> {
    let invalid = || Error::InvalidUploadId {
        upload_id: raw.to_string(),
    };
    let id = Uuid::parse_str(raw).map_err(|_| invalid())?;
    if id.get_version_num() != 4 {
        return Err(invalid());
    }
    Ok(id)
}
