use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use uuid::Uuid;

/// Lifecycle status of an upload session, shared between the `Session` (the
/// live control-plane record) and `Meta` (its durable sibling that outlives
/// it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Uploading,
    Finalizing,
    Completed,
    Failed,
    Canceled,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Uploading => "uploading",
            SessionStatus::Finalizing => "finalizing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Canceled => "canceled",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(Self::Uploading),
            "finalizing" => Some(Self::Finalizing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// §4.8: only these statuses are ever collectible by the reaper.
    pub fn is_collectible(&self) -> bool {
        matches!(self, Self::Failed | Self::Expired | Self::Canceled)
    }
}

/// The control-plane Session record (§3). Lives in the KV `session` hash and
/// is deleted on completion/cancel/expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub upload_id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub epochs: i64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Expected byte size of chunk `index` (0-based), per §4.1 step 6.
    pub fn expected_chunk_size(&self, index: u32) -> u64 {
        if index + 1 == self.total_chunks {
            self.size_bytes - self.chunk_size * (self.total_chunks as u64 - 1)
        } else {
            self.chunk_size
        }
    }

    pub fn is_last_chunk(&self, index: u32) -> bool {
        index + 1 == self.total_chunks
    }
}

/// Typestate markers for the Session builder, mirroring the teacher's
/// upload-session builder.
#[derive(Debug, Default)]
pub struct NoFilename;
#[derive(Debug, Default)]
pub struct HasFilename;
#[derive(Debug, Default)]
pub struct NoSize;
#[derive(Debug, Default)]
pub struct HasSize;

#[derive(Debug)]
pub struct SessionBuilder<F, S> {
    filename: Option<String>,
    content_type: String,
    size_bytes: Option<u64>,
    chunk_size: u64,
    epochs: i64,
    session_ttl_secs: i64,
    _marker: PhantomData<(F, S)>,
}

impl SessionBuilder<NoFilename, NoSize> {
    pub fn new() -> Self {
        Self {
            filename: None,
            content_type: "application/octet-stream".to_string(),
            size_bytes: None,
            chunk_size: crate::config::MAX_CHUNK_BYTES,
            epochs: crate::config::MIN_EPOCHS,
            session_ttl_secs: 6 * 3600,
            _marker: PhantomData,
        }
    }
}

impl Default for SessionBuilder<NoFilename, NoSize> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F, S> SessionBuilder<F, S> {
    pub fn filename<T: Into<String>>(self, filename: T) -> SessionBuilder<HasFilename, S> {
        SessionBuilder {
            filename: Some(filename.into()),
            content_type: self.content_type,
            size_bytes: self.size_bytes,
            chunk_size: self.chunk_size,
            epochs: self.epochs,
            session_ttl_secs: self.session_ttl_secs,
            _marker: PhantomData,
        }
    }

    pub fn content_type<T: Into<String>>(mut self, content_type: T) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn size_bytes(self, size: u64) -> SessionBuilder<F, HasSize> {
        SessionBuilder {
            filename: self.filename,
            content_type: self.content_type,
            size_bytes: Some(size),
            chunk_size: self.chunk_size,
            epochs: self.epochs,
            session_ttl_secs: self.session_ttl_secs,
            _marker: PhantomData,
        }
    }

    pub fn chunk_size(mut self, size: u64) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn epochs(mut self, epochs: i64) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn session_ttl_secs(mut self, secs: i64) -> Self {
        self.session_ttl_secs = secs;
        self
    }
}

impl SessionBuilder<HasFilename, HasSize> {
    pub fn build(self) -> Session {
        let size_bytes = self.size_bytes.expect("size_bytes is required");
        let total_chunks = size_bytes.div_ceil(self.chunk_size) as u32;
        let now = Utc::now();

        Session {
            upload_id: Uuid::new_v4(),
            filename: self.filename.expect("filename is required"),
            content_type: self.content_type,
            size_bytes,
            chunk_size: self.chunk_size,
            total_chunks: total_chunks.max(1),
            epochs: self.epochs,
            status: SessionStatus::Uploading,
            created_at: now,
            expires_at: now + Duration::seconds(self.session_ttl_secs),
        }
    }
}

/// The durable Meta sibling (§3): outlives the Session and is the only
/// observable record of terminal state once the session key has expired.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    pub status: Option<SessionStatus>,
    pub created_at: Option<DateTime<Utc>>,
    pub finalizing_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub recovered_at: Option<DateTime<Utc>>,
    pub walrus_uploaded_at: Option<DateTime<Utc>>,
    pub metadata_finalized_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub file_id: Option<String>,
    pub blob_id: Option<String>,
    pub size_bytes: Option<u64>,
}

impl Meta {
    pub fn commit_triple(&self) -> Option<CommitTriple> {
        Some(CommitTriple {
            file_id: self.file_id.clone()?,
            blob_id: self.blob_id.clone()?,
            size_bytes: self.size_bytes?,
        })
    }
}

/// The commit triple written once publish and mint both succeed (§4.4 step 10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitTriple {
    pub file_id: String,
    pub blob_id: String,
    pub size_bytes: u64,
}
