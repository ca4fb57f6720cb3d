//! Orphan reconciler (§4.8): startup scan of `tmpDir`, registering any
//! on-disk artifact not already in the GC index.
//!
//! Grounded on the teacher's `UploadSessionStore::purge_all` startup scan,
//! generalized from "delete everything" to "classify and register".

use crate::kv::{KvStore, Keyspace};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub async fn reconcile(kv: &Arc<dyn KvStore>, keys: &Keyspace, tmp_dir: &Path) -> crate::error::Result<usize> {
    let mut entries = match tokio::fs::read_dir(tmp_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut recovered = 0usize;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();

        let id = if let Some(stripped) = name.strip_suffix(".bin") {
            Uuid::parse_str(stripped).ok()
        } else {
            Uuid::parse_str(&name).ok()
        };

        let Some(id) = id else {
            continue; // non-UUID name, ignored per §4.8
        };
        let id = id.to_string();

        if kv.sismember(&keys.gc_active(), &id).await? {
            continue;
        }

        kv.sadd(&keys.gc_active(), &id).await?;
        kv.hset(&keys.meta(&id), "status", "expired").await?;
        kv.hset(&keys.meta(&id), "recovered_at", &Utc::now().to_rfc3339()).await?;
        recovered += 1;

        tracing::info!(upload_id = %id, "reconciled orphaned upload artifact");
    }

    Ok(recovered)
}
