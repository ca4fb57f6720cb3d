//! Finalization engine (§4.4): assembly → publish → mint → commit, guarded
//! by a KV-based lease lock with a background refresher.
//!
//! The lease refresher is a single-session analogue of the teacher's
//! `db_actor::DbUpdateActor` debounce loop: an `mpsc` shutdown channel plus
//! `tokio::select!` against a ticking interval, instead of a raw spawned
//! loop with no clean teardown.

pub mod coordinator;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::kv::{KvStore, Keyspace, WriteOp};
use crate::models::{CommitTriple, SessionStatus};
use crate::publish_client::PublishClient;
use crate::registry::RegistryClient;
use crate::session::SessionService;
use crate::storage::ChunkStore;
use coordinator::PublishCoordinator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct FinalizeEngine {
    sessions: SessionService,
    chunks: ChunkStore,
    kv: Arc<dyn KvStore>,
    keys: Keyspace,
    coordinator: PublishCoordinator,
    registry: Arc<dyn RegistryClient>,
    lock_ttl: Duration,
    refresh_interval: Duration,
    fields_cache_ttl_ms: u64,
}

impl FinalizeEngine {
    pub fn new(
        sessions: SessionService,
        chunks: ChunkStore,
        publish_client: Arc<dyn PublishClient>,
        registry: Arc<dyn RegistryClient>,
        config: &Config,
    ) -> Self {
        Self {
            kv: sessions.kv().clone(),
            keys: Keyspace::new(config.kv.key_prefix.clone()),
            coordinator: PublishCoordinator::new(publish_client, config.publish.clone()),
            registry,
            lock_ttl: Duration::from_secs(config.finalize.lock_ttl_secs.max(0) as u64),
            refresh_interval: Duration::from_secs(config.finalize.refresh_interval_secs),
            fields_cache_ttl_ms: config.sui.file_fields_cache_ttl_ms,
            sessions,
            chunks,
        }
    }

    /// Runs the full protocol described in §4.4. Returns the commit triple on
    /// success.
    pub async fn complete(&self, upload_id: Uuid) -> Result<CommitTriple> {
        // Step 1: fast-path idempotency.
        let meta = self.sessions.get_meta(upload_id).await?;
        if meta.status == Some(SessionStatus::Completed) {
            return meta.commit_triple().ok_or(Error::CorruptCompletedUpload {
                upload_id: upload_id.to_string(),
            });
        }

        // Step 2: acquire lock.
        let token = Uuid::new_v4().to_string();
        let lock_key = self.keys.lock(&upload_id.to_string());
        let acquired = self.kv.set_nx(&lock_key, &token, self.lock_ttl).await?;
        if !acquired {
            return Err(Error::UploadFinalizationInProgress {
                upload_id: upload_id.to_string(),
            });
        }

        let result = self.run_under_lock(upload_id, &lock_key, &token).await;

        // Step 11: release the lock only if we still own it.
        if let Ok(Some(current)) = self.kv.get(&lock_key).await {
            if current == token {
                let _ = self.kv.delete(&lock_key).await;
            }
        }

        result
    }

    async fn run_under_lock(
        &self,
        upload_id: Uuid,
        lock_key: &str,
        token: &str,
    ) -> Result<CommitTriple> {
        let lock_lost = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let refresher = self.spawn_lease_refresher(
            lock_key.to_string(),
            token.to_string(),
            lock_lost.clone(),
            shutdown_rx,
        );

        let outcome = self.run_protocol(upload_id, &lock_lost).await;

        let _ = shutdown_tx.send(()).await;
        let _ = refresher.await;

        match outcome {
            Ok(triple) => Ok(triple),
            Err(e) => {
                // Lock loss means another actor now owns finalization; only
                // mark the session failed when we ourselves hit a real error.
                if !lock_lost.load(Ordering::SeqCst) {
                    let _ = self.sessions.record_error(upload_id, &e.to_string()).await;
                    let _ = self.sessions.transition(upload_id, SessionStatus::Failed).await;
                }
                Err(e)
            }
        }
    }

    fn spawn_lease_refresher(
        &self,
        lock_key: String,
        token: String,
        lock_lost: Arc<AtomicBool>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let kv = self.kv.clone();
        let interval = self.refresh_interval;
        let ttl = self.lock_ttl;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = ticker.tick() => {
                        match kv.get(&lock_key).await {
                            Ok(Some(current)) if current == token => {
                                let _ = kv.expire(&lock_key, ttl).await;
                            }
                            _ => {
                                lock_lost.store(true, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn run_protocol(
        &self,
        upload_id: Uuid,
        lock_lost: &Arc<AtomicBool>,
    ) -> Result<CommitTriple> {
        // Step 4: re-check inside lock.
        let meta = self.sessions.get_meta(upload_id).await?;
        if meta.status == Some(SessionStatus::Completed) {
            return meta.commit_triple().ok_or(Error::CorruptCompletedUpload {
                upload_id: upload_id.to_string(),
            });
        }
        self.sessions.transition(upload_id, SessionStatus::Finalizing).await?;

        let session = self
            .sessions
            .get(upload_id)
            .await?
            .ok_or(Error::UploadNotFound {
                upload_id: upload_id.to_string(),
            })?;

        // Step 5: integrity gate.
        let received = self.sessions.received_chunk_count(upload_id).await?;
        if received != session.total_chunks as u64 {
            let missing = self.missing_indices(upload_id, session.total_chunks).await?;
            return Err(Error::UploadIncomplete { missing });
        }
        let on_disk = self.chunks.list_chunks(upload_id).await?;
        if on_disk.len() != session.total_chunks as usize {
            let missing = self.missing_indices(upload_id, session.total_chunks).await?;
            return Err(Error::UploadIncomplete { missing });
        }

        let mut meta = self.sessions.get_meta(upload_id).await?;

        // Step 6: assemble (skip if already checkpointed past it).
        if meta.blob_id.is_none() {
            self.assemble(upload_id, session.total_chunks).await?;
        }
        if lock_lost.load(Ordering::SeqCst) {
            return Err(Error::UploadFinalizationInProgress {
                upload_id: upload_id.to_string(),
            });
        }

        // Step 7: publish (skip + checkpoint if already have blobId).
        if meta.blob_id.is_none() {
            let assembled_path = self.chunks.assembled_path(upload_id);
            let blob_id = self
                .coordinator
                .submit(upload_id, &assembled_path, session.size_bytes, session.epochs)
                .await?;

            self.kv
                .hset(&self.keys.meta(&upload_id.to_string()), "blob_id", &blob_id)
                .await?;
            self.kv
                .hset(
                    &self.keys.meta(&upload_id.to_string()),
                    "walrus_uploaded_at",
                    &chrono::Utc::now().to_rfc3339(),
                )
                .await?;
            meta.blob_id = Some(blob_id);
        }
        if lock_lost.load(Ordering::SeqCst) {
            return Err(Error::UploadFinalizationInProgress {
                upload_id: upload_id.to_string(),
            });
        }

        // Step 8: mint (skip + checkpoint if already have fileId).
        let blob_id = meta.blob_id.clone().ok_or(Error::CorruptSession {
            upload_id: upload_id.to_string(),
        })?;
        if meta.file_id.is_none() {
            let file_id = self
                .registry
                .mint(&blob_id, session.size_bytes, &session.content_type)
                .await?;

            self.kv
                .hset(&self.keys.meta(&upload_id.to_string()), "file_id", &file_id)
                .await?;
            self.kv
                .hset(
                    &self.keys.meta(&upload_id.to_string()),
                    "metadata_finalized_at",
                    &chrono::Utc::now().to_rfc3339(),
                )
                .await?;
            self.kv
                .hset(
                    &self.keys.meta(&upload_id.to_string()),
                    "size_bytes",
                    &session.size_bytes.to_string(),
                )
                .await?;
            meta.file_id = Some(file_id.clone());
            meta.size_bytes = Some(session.size_bytes);

            // Eagerly populate the asset-fields cache so reads don't depend
            // on registry availability right after mint.
            let fields = crate::models::AssetFields {
                blob_id: blob_id.clone(),
                size_bytes: session.size_bytes,
                mime: session.content_type.clone(),
                created_at: Some(chrono::Utc::now().to_rfc3339()),
                owner: None,
            };
            if let Ok(serialized) = serde_json::to_string(&fields) {
                let ttl = Duration::from_millis(self.fields_cache_ttl_ms);
                let _ = self.kv.set(&self.keys.file_fields(&file_id), &serialized, ttl).await;
            }
        }

        let triple = CommitTriple {
            file_id: meta.file_id.clone().ok_or(Error::CorruptSession {
                upload_id: upload_id.to_string(),
            })?,
            blob_id,
            size_bytes: session.size_bytes,
        };

        // Step 9: cleanup (best-effort).
        self.chunks.cleanup(upload_id).await;

        // Step 10: commit — one atomic multi-op, so a crash never leaves the
        // completed meta record live alongside a stale session hash.
        let id = upload_id.to_string();
        self.kv
            .transaction(&[
                WriteOp::hset(self.keys.meta(&id), "status", SessionStatus::Completed.as_str()),
                WriteOp::hset(self.keys.meta(&id), "completed_at", chrono::Utc::now().to_rfc3339()),
                WriteOp::delete(self.keys.session(&id)),
                WriteOp::delete(self.keys.chunks(&id)),
                WriteOp::srem(self.keys.gc_active(), id.clone()),
            ])
            .await?;

        Ok(triple)
    }

    async fn missing_indices(&self, upload_id: Uuid, total_chunks: u32) -> Result<Vec<u32>> {
        let received = self.sessions.received_chunks(upload_id).await?;
        let received: std::collections::HashSet<u32> = received.into_iter().collect();
        Ok((0..total_chunks).filter(|i| !received.contains(i)).collect())
    }

    async fn assemble(&self, upload_id: Uuid, total_chunks: u32) -> Result<()> {
        use crate::error::ResultIoExt;

        let assembled_path = self.chunks.assembled_path(upload_id);
        let mut out = tokio::fs::File::create(&assembled_path)
            .await
            .map_io_err(&assembled_path)?;

        for index in 0..total_chunks {
            let mut chunk = self.chunks.open_chunk(upload_id, index).await?;
            tokio::io::copy(&mut chunk, &mut out).await.map_io_err(&assembled_path)?;
        }
        out.flush().await.map_io_err(&assembled_path)?;
        Ok(())
    }
}
