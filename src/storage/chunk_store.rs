//! Disk chunk store (§4.1).
//!
//! Chunk files land at `tmp/<uploadId>/<index>`; the exclusive-create +
//! atomic-rename dance is the same crash-safe, concurrent-writer-safe
//! technique the teacher uses in `Storage::store_package` (`create_new`
//! to avoid TOCTOU races) and `UploadSessionStore::store_chunk` (hash the
//! payload while it streams through).

use crate::error::{Error, Result, ResultIoExt};
use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Temp files older than this are presumed abandoned by a crashed writer and
/// may be reclaimed by a fresh attempt.
const STALE_TEMP_THRESHOLD: Duration = Duration::from_secs(10 * 60);

#[derive(Clone)]
pub struct ChunkStore {
    base_dir: PathBuf,
}

impl ChunkStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn upload_dir(&self, upload_id: Uuid) -> PathBuf {
        self.base_dir.join(upload_id.to_string())
    }

    pub fn assembled_path(&self, upload_id: Uuid) -> PathBuf {
        self.base_dir.join(format!("{upload_id}.bin"))
    }

    fn chunk_path(&self, upload_id: Uuid, index: u32) -> PathBuf {
        self.upload_dir(upload_id).join(index.to_string())
    }

    fn chunk_tmp_path(&self, upload_id: Uuid, index: u32) -> PathBuf {
        self.upload_dir(upload_id).join(format!("{index}.tmp"))
    }

    pub async fn has_chunk(&self, upload_id: Uuid, index: u32) -> bool {
        fs::metadata(self.chunk_path(upload_id, index)).await.is_ok()
    }

    /// Ascending sorted list of chunk indices present on disk.
    pub async fn list_chunks(&self, upload_id: Uuid) -> Result<Vec<u32>> {
        let dir = self.upload_dir(upload_id);
        let mut indices = Vec::new();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(indices),
            Err(e) => return Err(e).map_io_err(&dir),
        };

        while let Some(entry) = entries.next_entry().await.map_io_err(&dir)? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".tmp") {
                if let Ok(index) = name.parse::<u32>() {
                    indices.push(index);
                }
            }
        }

        indices.sort_unstable();
        Ok(indices)
    }

    /// Open a chunk for sequential reading, used by assembly.
    pub async fn open_chunk(&self, upload_id: Uuid, index: u32) -> Result<fs::File> {
        let path = self.chunk_path(upload_id, index);
        fs::File::open(&path).await.map_io_err(&path)
    }

    /// Write one chunk from a streamed, fallible byte source, validating
    /// cumulative size and the SHA-256 digest as bytes arrive (§4.1
    /// algorithm steps 1-8).
    pub async fn write_chunk<S>(
        &self,
        upload_id: Uuid,
        index: u32,
        mut stream: S,
        expected_hash: &str,
        expected_size: u64,
        is_last: bool,
    ) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Bytes, Error>> + Unpin,
    {
        let dir = self.upload_dir(upload_id);
        fs::create_dir_all(&dir).await.map_io_err(&dir)?;

        let final_path = self.chunk_path(upload_id, index);
        if fs::metadata(&final_path).await.is_ok() {
            // Idempotent replay: already persisted, nothing to do.
            return Ok(());
        }

        let tmp_path = self.chunk_tmp_path(upload_id, index);
        let mut file = match self.create_exclusive(&tmp_path).await? {
            Some(file) => file,
            None => {
                // Another writer's temp file is in the way.
                if fs::metadata(&final_path).await.is_ok() {
                    return Ok(());
                }
                if self.reclaim_if_stale(&tmp_path).await? {
                    self.create_exclusive(&tmp_path)
                        .await?
                        .ok_or(Error::ChunkInProgress)?
                } else {
                    return Err(Error::ChunkInProgress);
                }
            }
        };

        let result = self
            .stream_into(&mut file, &mut stream, expected_size, expected_hash)
            .await;

        drop(file);

        let digest = match result {
            Ok(digest) => digest,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(e);
            }
        };

        if digest != expected_hash.to_lowercase() {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Error::InvalidChunk {
                reason: "HASH_MISMATCH".to_string(),
            });
        }

        let actual_size = fs::metadata(&tmp_path)
            .await
            .map_io_err(&tmp_path)?
            .len();

        if let Err(e) = Self::check_size_policy(actual_size, expected_size, is_last) {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        // Rename is atomic within the filesystem; on POSIX this also bumps
        // the parent directory's mtime, which the reaper relies on as a
        // freshness signal for artifacts without an assembled `.bin` yet.
        fs::rename(&tmp_path, &final_path)
            .await
            .map_io_err(&final_path)?;

        Ok(())
    }

    async fn create_exclusive(&self, path: &Path) -> Result<Option<fs::File>> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e).map_io_err(path),
        }
    }

    async fn reclaim_if_stale(&self, tmp_path: &Path) -> Result<bool> {
        let metadata = match fs::metadata(tmp_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e).map_io_err(tmp_path),
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or(Duration::ZERO);

        if age > STALE_TEMP_THRESHOLD {
            let _ = fs::remove_file(tmp_path).await;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn stream_into<S>(
        &self,
        file: &mut fs::File,
        stream: &mut S,
        expected_size: u64,
        _expected_hash: &str,
    ) -> Result<String>
    where
        S: Stream<Item = std::result::Result<Bytes, Error>> + Unpin,
    {
        let mut hasher = Sha256::new();
        let mut total: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            if total > expected_size {
                return Err(Error::InvalidChunk {
                    reason: "CHUNK_TOO_LARGE".to_string(),
                });
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(|e| Error::Io {
                error: e,
                path: "<chunk temp file>".to_string(),
            })?;
        }

        file.flush().await.map_err(|e| Error::Io {
            error: e,
            path: "<chunk temp file>".to_string(),
        })?;

        Ok(hex::encode(hasher.finalize()))
    }

    fn check_size_policy(actual: u64, expected: u64, is_last: bool) -> Result<()> {
        if is_last {
            if actual == 0 || actual > expected {
                return Err(Error::InvalidChunk {
                    reason: "INVALID_LAST_CHUNK_SIZE".to_string(),
                });
            }
        } else if actual != expected {
            return Err(Error::InvalidChunk {
                reason: "CHUNK_SIZE_MISMATCH".to_string(),
            });
        }
        Ok(())
    }

    /// Best-effort recursive delete of everything for `upload_id`.
    pub async fn cleanup(&self, upload_id: Uuid) {
        let dir = self.upload_dir(upload_id);
        if let Err(e) = fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(upload_id = %upload_id, error = %e, "failed to remove chunk directory");
            }
        }

        let assembled = self.assembled_path(upload_id);
        if let Err(e) = fs::remove_file(&assembled).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(upload_id = %upload_id, error = %e, "failed to remove assembled file");
            }
        }
    }

    pub async fn mtime(&self, upload_id: Uuid) -> Option<std::time::SystemTime> {
        let assembled = self.assembled_path(upload_id);
        if let Ok(meta) = fs::metadata(&assembled).await {
            return meta.modified().ok();
        }
        let dir = self.upload_dir(upload_id);
        fs::metadata(&dir).await.ok()?.modified().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn hash_of(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn byte_stream(data: Vec<u8>) -> impl Stream<Item = std::result::Result<Bytes, Error>> + Unpin {
        stream::iter(vec![Ok(Bytes::from(data))])
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let id = Uuid::new_v4();
        let data = vec![7u8; 1024];
        let hash = hash_of(&data);

        store
            .write_chunk(id, 0, byte_stream(data.clone()), &hash, data.len() as u64, true)
            .await
            .unwrap();

        assert!(store.has_chunk(id, 0).await);
        assert_eq!(store.list_chunks(id).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn hash_mismatch_leaves_no_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let id = Uuid::new_v4();
        let data = vec![1u8; 64];
        let wrong_hash = hash_of(b"not the right bytes");

        let err = store
            .write_chunk(id, 0, byte_stream(data.clone()), &wrong_hash, data.len() as u64, true)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidChunk { .. }));
        assert!(!store.has_chunk(id, 0).await);
    }

    #[tokio::test]
    async fn repeated_write_of_identical_bytes_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let id = Uuid::new_v4();
        let data = vec![9u8; 128];
        let hash = hash_of(&data);

        store
            .write_chunk(id, 0, byte_stream(data.clone()), &hash, data.len() as u64, true)
            .await
            .unwrap();
        // Second write of the same chunk is a no-op success (replay).
        store
            .write_chunk(id, 0, byte_stream(data.clone()), &hash, data.len() as u64, true)
            .await
            .unwrap();

        assert_eq!(store.list_chunks(id).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn non_last_chunk_size_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let id = Uuid::new_v4();
        let data = vec![3u8; 100];
        let hash = hash_of(&data);

        let err = store
            .write_chunk(id, 0, byte_stream(data), &hash, 200, false)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidChunk { .. }));
    }

    #[tokio::test]
    async fn order_independent_assembly_is_byte_equal() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let id = Uuid::new_v4();

        let chunks = [vec![1u8; 16], vec![2u8; 16], vec![3u8; 8]];
        // upload out of order: 2, 0, 1
        for &i in &[2usize, 0, 1] {
            let data = chunks[i].clone();
            let hash = hash_of(&data);
            let is_last = i + 1 == chunks.len();
            store
                .write_chunk(id, i as u32, byte_stream(data.clone()), &hash, data.len() as u64, is_last)
                .await
                .unwrap();
        }

        let mut assembled = Vec::new();
        for i in store.list_chunks(id).await.unwrap() {
            use tokio::io::AsyncReadExt;
            let mut f = store.open_chunk(id, i).await.unwrap();
            f.read_to_end(&mut assembled).await.unwrap();
        }

        let expected: Vec<u8> = chunks.concat();
        assert_eq!(assembled, expected);
    }

    #[tokio::test]
    async fn cleanup_removes_directory_and_assembled_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let id = Uuid::new_v4();
        let data = vec![5u8; 16];
        let hash = hash_of(&data);

        store
            .write_chunk(id, 0, byte_stream(data), &hash, 16, true)
            .await
            .unwrap();
        fs::write(store.assembled_path(id), b"assembled").await.unwrap();

        store.cleanup(id).await;

        assert!(!store.has_chunk(id, 0).await);
        assert!(fs::metadata(store.assembled_path(id)).await.is_err());
    }
}
