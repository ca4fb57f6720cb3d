//! In-memory fakes for the external seams (`KvStore`, publish/registry
//! clients), grounded on the teacher's `tests/common/mod.rs::setup_test_app`
//! convention of building a fully wired `AppState` over fakes instead of
//! mocking individual calls.

use crate::error::{Error, Result};
use crate::kv::{KvStore, WriteOp};
use crate::models::AssetFields;
use crate::publish_client::PublishClient;
use crate::registry::RegistryClient;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct Inner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
}

/// An in-process stand-in for `RedisKv`. TTLs are accepted but not enforced —
/// tests that need expiry semantics drive time explicitly instead.
pub struct FakeKvStore {
    inner: Mutex<Inner>,
}

impl FakeKvStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for FakeKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for FakeKvStore {
    async fn hset_all(&self, key: &str, fields: &[(&str, String)], _ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.sets.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.strings.contains_key(key)
            || inner.hashes.contains_key(key)
            || inner.sets.contains_key(key))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sets.get(key).map(|s| s.len()).unwrap_or(0) as u64)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.contains(member))
            .unwrap_or(false))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, _ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.strings.contains_key(key) {
            Ok(false)
        } else {
            inner.strings.insert(key.to_string(), value.to_string());
            Ok(true)
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Applies every op under a single lock acquisition, the same atomicity
    /// guarantee `RedisKv` gets from `redis::pipe().atomic()`.
    async fn transaction(&self, ops: &[WriteOp]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for op in ops {
            match op {
                WriteOp::HsetAll { key, fields, .. } => {
                    let entry = inner.hashes.entry(key.clone()).or_default();
                    for (field, value) in fields {
                        entry.insert(field.clone(), value.clone());
                    }
                }
                WriteOp::Hset { key, field, value } => {
                    inner
                        .hashes
                        .entry(key.clone())
                        .or_default()
                        .insert(field.clone(), value.clone());
                }
                WriteOp::Sadd { key, member } => {
                    inner.sets.entry(key.clone()).or_default().insert(member.clone());
                }
                WriteOp::Srem { key, member } => {
                    if let Some(set) = inner.sets.get_mut(key) {
                        set.remove(member);
                    }
                }
                WriteOp::Delete { key } => {
                    inner.strings.remove(key);
                    inner.hashes.remove(key);
                    inner.sets.remove(key);
                }
            }
        }
        Ok(())
    }
}

/// A `PublishClient` stand-in that either hands back a fixed blob id or
/// returns a configured failure, recording every call it receives.
pub struct FakePublishClient {
    blob_id: Result<String, String>,
    calls: Mutex<Vec<(u64, i64)>>,
}

impl FakePublishClient {
    pub fn succeeding(blob_id: impl Into<String>) -> Self {
        Self {
            blob_id: Ok(blob_id.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            blob_id: Err(message.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PublishClient for FakePublishClient {
    async fn publish(&self, _file_path: &Path, size_bytes: u64, epochs: i64) -> Result<String> {
        self.calls.lock().unwrap().push((size_bytes, epochs));
        self.blob_id.clone().map_err(|msg| Error::UploadFailed { msg })
    }
}

/// A `RegistryClient` stand-in driven by a fixed `fileId` and a fixed
/// `AssetFields` response, recording mint calls for assertions.
pub struct FakeRegistryClient {
    file_id: Result<String, String>,
    fields: Mutex<Option<AssetFields>>,
    mint_calls: Mutex<Vec<(String, u64, String)>>,
}

impl FakeRegistryClient {
    pub fn succeeding(file_id: impl Into<String>) -> Self {
        Self {
            file_id: Ok(file_id.into()),
            fields: Mutex::new(None),
            mint_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            file_id: Err(message.into()),
            fields: Mutex::new(None),
            mint_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fields(self, fields: AssetFields) -> Self {
        *self.fields.lock().unwrap() = Some(fields);
        self
    }

    pub fn mint_count(&self) -> usize {
        self.mint_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RegistryClient for FakeRegistryClient {
    async fn mint(&self, blob_id: &str, size_bytes: u64, mime: &str) -> Result<String> {
        self.mint_calls
            .lock()
            .unwrap()
            .push((blob_id.to_string(), size_bytes, mime.to_string()));
        self.file_id.clone().map_err(|msg| Error::RegistryUnavailable { msg })
    }

    async fn get_fields(&self, _file_id: &str) -> Result<AssetFields> {
        self.fields
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::RegistryUnavailable {
                msg: "no fields configured on fake registry".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_exclusive() {
        let kv = FakeKvStore::new();
        assert!(kv.set_nx("lock", "a", Duration::from_secs(1)).await.unwrap());
        assert!(!kv.set_nx("lock", "b", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn hash_and_set_round_trip() {
        let kv = FakeKvStore::new();
        kv.hset_all("h", &[("a", "1".to_string())], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(kv.hgetall("h").await.unwrap().get("a").unwrap(), "1");

        kv.sadd("s", "x").await.unwrap();
        kv.sadd("s", "y").await.unwrap();
        assert_eq!(kv.scard("s").await.unwrap(), 2);
        kv.srem("s", "x").await.unwrap();
        assert_eq!(kv.scard("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transaction_applies_every_op() {
        let kv = FakeKvStore::new();
        kv.sadd("gc", "id-1").await.unwrap();

        kv.transaction(&[
            WriteOp::hset_all("session", vec![("status".to_string(), "uploading".to_string())], Duration::from_secs(1)),
            WriteOp::hset("meta", "status", "uploading"),
            WriteOp::srem("gc", "id-1"),
            WriteOp::sadd("gc", "id-2"),
        ])
        .await
        .unwrap();

        assert_eq!(kv.hgetall("session").await.unwrap().get("status").unwrap(), "uploading");
        assert_eq!(kv.hgetall("meta").await.unwrap().get("status").unwrap(), "uploading");
        assert!(!kv.sismember("gc", "id-1").await.unwrap());
        assert!(kv.sismember("gc", "id-2").await.unwrap());
    }

    #[tokio::test]
    async fn transaction_delete_clears_all_kinds_for_a_key() {
        let kv = FakeKvStore::new();
        kv.hset("shared", "f", "v").await.unwrap();
        kv.transaction(&[WriteOp::delete("shared")]).await.unwrap();
        assert!(!kv.exists("shared").await.unwrap());
    }
}
