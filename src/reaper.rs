//! Reaper/GC (§4.8): fixed-interval scan of the GC index, grace-period
//! deletion of abandoned artifacts.
//!
//! Grounded on the teacher's `upload::spawn_cleanup_task`/`cleanup_expired`
//! loop — fixed-interval `tokio::time::sleep`, overlap prevention via an
//! atomic guard, yielding between IDs to avoid starving the dispatcher under
//! backlog.

use crate::config::Config;
use crate::kv::{KvStore, Keyspace, WriteOp};
use crate::models::SessionStatus;
use crate::session::SessionService;
use crate::storage::ChunkStore;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct Reaper {
    kv: Arc<dyn KvStore>,
    keys: Keyspace,
    sessions: SessionService,
    chunks: ChunkStore,
    interval: Duration,
    grace: chrono::Duration,
    running: Arc<AtomicBool>,
}

impl Reaper {
    pub fn new(
        kv: Arc<dyn KvStore>,
        sessions: SessionService,
        chunks: ChunkStore,
        config: &Config,
    ) -> Self {
        Self {
            kv,
            keys: Keyspace::new(config.kv.key_prefix.clone()),
            sessions,
            chunks,
            interval: Duration::from_secs(config.reaper.interval_secs),
            grace: chrono::Duration::seconds(config.reaper.grace_secs),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    pub async fn run_once(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("reaper run skipped: previous run still in flight");
            return;
        }

        let ids = match self.kv.smembers(&self.keys.gc_active()).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "reaper failed to list gc index");
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        };

        for id in ids {
            self.reap_one(&id).await;
            tokio::task::yield_now().await;
        }

        self.running.store(false, Ordering::SeqCst);
    }

    async fn reap_one(&self, id: &str) {
        // Hard safety: a finalize lock in flight is never touched.
        if matches!(self.kv.exists(&self.keys.lock(id)).await, Ok(true)) {
            return;
        }

        let Ok(upload_id) = uuid::Uuid::parse_str(id) else {
            return;
        };

        let session = self.sessions.get(upload_id).await.ok().flatten();
        let meta = match self.sessions.get_meta(upload_id).await {
            Ok(meta) => meta,
            Err(_) => return,
        };

        if session.is_none() {
            if let Some(status) = meta.status {
                if matches!(status, SessionStatus::Uploading | SessionStatus::Finalizing) {
                    let _ = self.sessions.transition(upload_id, SessionStatus::Expired).await;
                }
            }
        }

        let status = match session.map(|s| s.status).or(meta.status) {
            Some(s) => s,
            None => {
                self.purge_keys(id).await;
                return;
            }
        };

        if !status.is_collectible() {
            return;
        }

        let mtime = self.chunks.mtime(upload_id).await;
        let Some(mtime) = mtime else {
            // No on-disk artifact at all: nothing to wait out, purge now.
            self.purge_keys(id).await;
            return;
        };

        let age = Utc::now().signed_duration_since(chrono::DateTime::<Utc>::from(mtime));
        if age < self.grace {
            return;
        }

        self.chunks.cleanup(upload_id).await;
        self.purge_keys(id).await;
    }

    /// §4.8: "atomically delete session/chunks/meta keys and remove from GC
    /// index" — one transaction rather than four independent calls, so a
    /// partial failure can't leave a half-purged record with no retry.
    async fn purge_keys(&self, id: &str) {
        let ops = [
            WriteOp::delete(self.keys.session(id)),
            WriteOp::delete(self.keys.chunks(id)),
            WriteOp::delete(self.keys.meta(id)),
            WriteOp::srem(self.keys.gc_active(), id.to_string()),
        ];
        if let Err(e) = self.kv.transaction(&ops).await {
            tracing::error!(upload_id = id, error = %e, "reaper failed to purge upload keys");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeKvStore;

    #[tokio::test]
    async fn run_once_skips_ids_with_an_active_lock() {
        let kv: Arc<dyn KvStore> = Arc::new(FakeKvStore::new());
        let config = Config::for_tests();
        let sessions = SessionService::new(kv.clone(), &config);
        let dir = tempfile::tempdir().unwrap();
        let chunks = ChunkStore::new(dir.path());
        let reaper = Reaper::new(kv.clone(), sessions, chunks, &config);

        let id = uuid::Uuid::new_v4().to_string();
        kv.sadd(&reaper.keys.gc_active(), &id).await.unwrap();
        kv.set(&reaper.keys.lock(&id), "token", Duration::from_secs(60))
            .await
            .unwrap();

        reaper.run_once().await;

        // still present: lock protected it
        assert!(kv.sismember(&reaper.keys.gc_active(), &id).await.unwrap());
    }

    #[tokio::test]
    async fn run_once_purges_ids_with_no_session_or_meta() {
        let kv: Arc<dyn KvStore> = Arc::new(FakeKvStore::new());
        let config = Config::for_tests();
        let sessions = SessionService::new(kv.clone(), &config);
        let dir = tempfile::tempdir().unwrap();
        let chunks = ChunkStore::new(dir.path());
        let reaper = Reaper::new(kv.clone(), sessions, chunks, &config);

        let id = uuid::Uuid::new_v4().to_string();
        kv.sadd(&reaper.keys.gc_active(), &id).await.unwrap();

        reaper.run_once().await;

        assert!(!kv.sismember(&reaper.keys.gc_active(), &id).await.unwrap());
    }
}
