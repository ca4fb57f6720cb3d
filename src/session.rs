//! Session service (§4.2): the KV-backed control plane for an upload in
//! progress. Grounded on the teacher's `UploadSessionStore` — an in-memory
//! map keyed by upload id — generalized to a shared KV store so multiple
//! gateway instances can see the same sessions.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::kv::{KvStore, Keyspace, WriteOp};
use crate::models::{Meta, Session, SessionStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct SessionService {
    kv: Arc<dyn KvStore>,
    keys: Keyspace,
    session_ttl: Duration,
}

impl SessionService {
    pub fn new(kv: Arc<dyn KvStore>, config: &Config) -> Self {
        Self {
            kv,
            keys: Keyspace::new(config.kv.key_prefix.clone()),
            session_ttl: Duration::from_secs(config.storage.session_ttl_secs as u64),
        }
    }

    /// §4.2 createSession: one atomic multi-op against the KV store — sets
    /// the session hash, the (initially empty) meta hash, and registers the
    /// upload in the GC index, so a crash mid-sequence (or a reaper/cancel
    /// racing a partially-created session) can never observe just one or two
    /// of the three.
    pub async fn create(&self, session: &Session) -> Result<()> {
        let id = session.upload_id.to_string();

        let session_fields: Vec<(String, String)> = vec![
            ("filename".to_string(), session.filename.clone()),
            ("content_type".to_string(), session.content_type.clone()),
            ("size_bytes".to_string(), session.size_bytes.to_string()),
            ("chunk_size".to_string(), session.chunk_size.to_string()),
            ("total_chunks".to_string(), session.total_chunks.to_string()),
            ("epochs".to_string(), session.epochs.to_string()),
            ("status".to_string(), session.status.as_str().to_string()),
            ("created_at".to_string(), session.created_at.to_rfc3339()),
            ("expires_at".to_string(), session.expires_at.to_rfc3339()),
        ];

        let meta_ttl = self.session_ttl + Duration::from_secs(30 * 60);
        let meta_fields: Vec<(String, String)> = vec![
            ("status".to_string(), session.status.as_str().to_string()),
            ("created_at".to_string(), session.created_at.to_rfc3339()),
        ];

        self.kv
            .transaction(&[
                WriteOp::hset_all(self.keys.session(&id), session_fields, self.session_ttl),
                WriteOp::hset_all(self.keys.meta(&id), meta_fields, meta_ttl),
                WriteOp::sadd(self.keys.gc_active(), id.clone()),
            ])
            .await
            .map_err(|_| Error::SessionCreateFailed {
                msg: "failed to persist session atomically".to_string(),
            })
    }

    /// Current count of registered (not-yet-collected) uploads, used by the
    /// admission check against `max_active_uploads`.
    pub async fn active_count(&self) -> Result<u64> {
        self.kv.scard(&self.keys.gc_active()).await
    }

    /// §4.2 getSession: defensively parses the session hash, mapping any
    /// missing/malformed field to `CORRUPT_UPLOAD_SESSION` rather than
    /// panicking. Returns `None` if the session has expired or never
    /// existed — callers fall back to `Meta` for terminal-state answers.
    pub async fn get(&self, upload_id: Uuid) -> Result<Option<Session>> {
        let id = upload_id.to_string();
        let fields = self.kv.hgetall(&self.keys.session(&id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        Self::parse_session(upload_id, &fields)
            .map(Some)
            .map_err(|_| Error::CorruptSession {
                upload_id: id.clone(),
            })
    }

    fn parse_session(upload_id: Uuid, fields: &HashMap<String, String>) -> Result<Session> {
        let get = |k: &str| fields.get(k).cloned().ok_or(Error::CorruptSession {
            upload_id: upload_id.to_string(),
        });

        let status = SessionStatus::parse(&get("status")?).ok_or(Error::CorruptSession {
            upload_id: upload_id.to_string(),
        })?;

        let parse_u64 = |k: &str| -> Result<u64> {
            get(k)?.parse().map_err(|_| Error::CorruptSession {
                upload_id: upload_id.to_string(),
            })
        };
        let parse_u32 = |k: &str| -> Result<u32> {
            get(k)?.parse().map_err(|_| Error::CorruptSession {
                upload_id: upload_id.to_string(),
            })
        };
        let parse_i64 = |k: &str| -> Result<i64> {
            get(k)?.parse().map_err(|_| Error::CorruptSession {
                upload_id: upload_id.to_string(),
            })
        };
        let parse_time = |k: &str| -> Result<chrono::DateTime<Utc>> {
            chrono::DateTime::parse_from_rfc3339(&get(k)?)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| Error::CorruptSession {
                    upload_id: upload_id.to_string(),
                })
        };

        Ok(Session {
            upload_id,
            filename: get("filename")?,
            content_type: get("content_type")?,
            size_bytes: parse_u64("size_bytes")?,
            chunk_size: parse_u64("chunk_size")?,
            total_chunks: parse_u32("total_chunks")?,
            epochs: parse_i64("epochs")?,
            status,
            created_at: parse_time("created_at")?,
            expires_at: parse_time("expires_at")?,
        })
    }

    /// §4.2: move the session (and its meta sibling) into a terminal status.
    /// Never resurrects a session that is already terminal.
    pub async fn transition(&self, upload_id: Uuid, status: SessionStatus) -> Result<()> {
        let id = upload_id.to_string();

        if let Some(session) = self.get(upload_id).await? {
            if matches!(
                session.status,
                SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Canceled | SessionStatus::Expired
            ) {
                return Ok(());
            }
            self.kv
                .hset(&self.keys.session(&id), "status", status.as_str())
                .await?;
        }

        let timestamp_field = match status {
            SessionStatus::Finalizing => "finalizing_at",
            SessionStatus::Completed => "completed_at",
            SessionStatus::Failed => "failed_at",
            SessionStatus::Canceled => "canceled_at",
            SessionStatus::Expired => "expired_at",
            SessionStatus::Uploading => "created_at",
        };
        self.kv
            .hset(&self.keys.meta(&id), "status", status.as_str())
            .await?;
        self.kv
            .hset(&self.keys.meta(&id), timestamp_field, &Utc::now().to_rfc3339())
            .await?;

        Ok(())
    }

    pub async fn get_meta(&self, upload_id: Uuid) -> Result<Meta> {
        let id = upload_id.to_string();
        let fields = self.kv.hgetall(&self.keys.meta(&id)).await?;
        Ok(Self::parse_meta(&fields))
    }

    fn parse_meta(fields: &HashMap<String, String>) -> Meta {
        let get_time = |k: &str| {
            fields
                .get(k)
                .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        Meta {
            status: fields.get("status").and_then(|s| SessionStatus::parse(s)),
            created_at: get_time("created_at"),
            finalizing_at: get_time("finalizing_at"),
            completed_at: get_time("completed_at"),
            failed_at: get_time("failed_at"),
            canceled_at: get_time("canceled_at"),
            expired_at: get_time("expired_at"),
            recovered_at: get_time("recovered_at"),
            walrus_uploaded_at: get_time("walrus_uploaded_at"),
            metadata_finalized_at: get_time("metadata_finalized_at"),
            error: fields.get("error").cloned(),
            file_id: fields.get("file_id").cloned(),
            blob_id: fields.get("blob_id").cloned(),
            size_bytes: fields.get("size_bytes").and_then(|s| s.parse().ok()),
        }
    }

    pub async fn record_error(&self, upload_id: Uuid, message: &str) -> Result<()> {
        let id = upload_id.to_string();
        self.kv.hset(&self.keys.meta(&id), "error", message).await
    }

    pub async fn mark_chunk_received(&self, upload_id: Uuid, index: u32) -> Result<()> {
        let id = upload_id.to_string();
        self.kv.sadd(&self.keys.chunks(&id), &index.to_string()).await
    }

    pub async fn received_chunk_count(&self, upload_id: Uuid) -> Result<u64> {
        let id = upload_id.to_string();
        self.kv.scard(&self.keys.chunks(&id)).await
    }

    pub async fn received_chunks(&self, upload_id: Uuid) -> Result<Vec<u32>> {
        let id = upload_id.to_string();
        let members = self.kv.smembers(&self.keys.chunks(&id)).await?;
        Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
    }

    pub fn keys(&self) -> &Keyspace {
        &self.keys
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }
}
