//! KV keyspace & schema (§3, §6 keyspace table).
//!
//! Canonical layout under the `floe:v1` prefix:
//!   upload:<id>:session        hash, TTL = sessionTTL
//!   upload:<id>:meta           hash, TTL = sessionTTL + 30min
//!   upload:<id>:chunks         set (received chunk indices)
//!   upload:<id>:meta:lock      string, "create-if-absent" CAS lease
//!   upload:gc:active           set (GC index)
//!   file:<fileId>:fields       string JSON (asset-fields cache)
//!
//! The store is accessed through the `KvStore` trait so the rest of the
//! service (and its tests) depend on behavior, not on `redis` directly —
//! the same seam the teacher draws around `Storage`/`UploadSessionStore`.

use crate::error::{Error, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn hset_all(&self, key: &str, fields: &[(&str, String)], ttl: Duration) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn scard(&self, key: &str) -> Result<u64>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// `SET key value NX PX ttl` — true if the key was absent and is now set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    async fn ping(&self) -> Result<()>;

    /// Applies every op in `ops` as a single atomic multi-key transaction —
    /// the cross-key counterpart to `hset_all`'s single-key pipeline, for the
    /// spec's repeated "one atomic multi-op" requirements (session creation,
    /// finalization commit, reaper purge).
    async fn transaction(&self, ops: &[WriteOp]) -> Result<()>;
}

/// A single write within an atomic `KvStore::transaction` batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    HsetAll {
        key: String,
        fields: Vec<(String, String)>,
        ttl: Duration,
    },
    Hset {
        key: String,
        field: String,
        value: String,
    },
    Sadd {
        key: String,
        member: String,
    },
    Srem {
        key: String,
        member: String,
    },
    Delete {
        key: String,
    },
}

impl WriteOp {
    pub fn hset_all(key: impl Into<String>, fields: Vec<(String, String)>, ttl: Duration) -> Self {
        Self::HsetAll {
            key: key.into(),
            fields,
            ttl,
        }
    }

    pub fn hset(key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Hset {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::Sadd {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn srem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::Srem {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Redis-backed `KvStore`, using a multiplexed connection manager so callers
/// never serialize on a single connection (grounded on the teacher's
/// everything-is-a-shared-handle style — `Storage`/`DbUpdateHandle` are both
/// `Clone` wrappers over shared state).
#[derive(Clone)]
pub struct RedisKv {
    manager: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| Error::Config {
            msg: format!("invalid KV url: {e}"),
        })?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::Internal {
                msg: format!("failed to connect to KV store: {e}"),
            })?;
        Ok(Self { manager })
    }

    fn map_err(e: redis::RedisError) -> Error {
        Error::Internal {
            msg: format!("kv error: {e}"),
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn hset_all(&self, key: &str, fields: &[(&str, String)], ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, value) in fields {
            pipe.hset(key, *field, value).ignore();
        }
        pipe.expire(key, ttl.as_secs() as i64).ignore();
        pipe.query_async::<()>(&mut conn).await.map_err(Self::map_err)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.manager.clone();
        conn.hgetall(key).await.map_err(Self::map_err)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.hset(key, field, value).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .expire(key, ttl.as_secs() as i64)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        conn.exists(key).await.map_err(Self::map_err)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.sadd(key, member).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.srem(key, member).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        conn.scard(key).await.map_err(Self::map_err)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        conn.smembers(key).await.map_err(Self::map_err)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        conn.sismember(key, member).await.map_err(Self::map_err)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(Self::map_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(result.is_some())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn transaction(&self, ops: &[WriteOp]) -> Result<()> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                WriteOp::HsetAll { key, fields, ttl } => {
                    for (field, value) in fields {
                        pipe.hset(key, field, value).ignore();
                    }
                    pipe.expire(key, ttl.as_secs() as i64).ignore();
                }
                WriteOp::Hset { key, field, value } => {
                    pipe.hset(key, field, value).ignore();
                }
                WriteOp::Sadd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                WriteOp::Srem { key, member } => {
                    pipe.srem(key, member).ignore();
                }
                WriteOp::Delete { key } => {
                    pipe.del(key).ignore();
                }
            }
        }
        pipe.query_async::<()>(&mut conn).await.map_err(Self::map_err)
    }
}

/// Key builder for the `floe:v1` keyspace, parameterized on the configured
/// prefix so tests can isolate themselves with a unique prefix.
#[derive(Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn session(&self, upload_id: &str) -> String {
        format!("{}:upload:{}:session", self.prefix, upload_id)
    }

    pub fn meta(&self, upload_id: &str) -> String {
        format!("{}:upload:{}:meta", self.prefix, upload_id)
    }

    pub fn chunks(&self, upload_id: &str) -> String {
        format!("{}:upload:{}:chunks", self.prefix, upload_id)
    }

    pub fn lock(&self, upload_id: &str) -> String {
        format!("{}:upload:{}:meta:lock", self.prefix, upload_id)
    }

    pub fn gc_active(&self) -> String {
        format!("{}:upload:gc:active", self.prefix)
    }

    pub fn file_fields(&self, file_id: &str) -> String {
        format!("{}:file:{}:fields", self.prefix, file_id)
    }
}
