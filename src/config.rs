use crate::error::{Error, Result};
use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const MIN_CHUNK_BYTES: u64 = 256 * 1024;
pub const MAX_CHUNK_BYTES: u64 = 20 * 1024 * 1024;
pub const MIN_EPOCHS: i64 = 1;
pub const MAX_EPOCHS: i64 = 90;
pub const MAX_FILE_SIZE_BYTES: u64 = 15 * 1024 * 1024 * 1024;
pub const MAX_TOTAL_CHUNKS: u64 = 200_000;
pub const MAX_ACTIVE_UPLOADS: usize = 100;
pub const MAX_FILENAME_LEN: usize = 512;
pub const MAX_CONTENT_TYPE_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub kv: KvConfig,
    pub walrus: WalrusConfig,
    pub sui: SuiConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub finalize: FinalizeConfig,
    #[serde(default)]
    pub publish: PublishConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: Byte,
    #[serde(default = "default_expose_blob_id")]
    pub expose_blob_id: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KvConfig {
    #[serde(default = "default_kv_url")]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WalrusConfig {
    pub publisher_url: String,
    #[serde(default)]
    pub aggregator_urls: Vec<String>,
    #[serde(default = "default_max_range_bytes")]
    pub max_range_bytes: u64,
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    #[serde(default)]
    pub signer_secret: Option<String>,
    #[serde(default = "default_min_balance")]
    pub min_balance: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SuiConfig {
    pub rpc_url: String,
    #[serde(default = "default_network")]
    pub network: Network,
    #[serde(default = "default_fields_cache_ttl_ms")]
    pub file_fields_cache_ttl_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            grace_secs: default_grace_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FinalizeConfig {
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: i64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublishConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_interval_cap")]
    pub interval_cap: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            interval_cap: default_interval_cap(),
            interval_ms: default_interval_ms(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_payload_size() -> Byte {
    Byte::from_u64_with_unit(20, byte_unit::Unit::MiB).unwrap()
}
fn default_expose_blob_id() -> bool {
    std::env::var("FLOE_EXPOSE_BLOB_ID")
        .map(|v| v == "1")
        .unwrap_or(false)
}
fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/var/lib/floe/tmp")
}
fn default_session_ttl_secs() -> i64 {
    6 * 3600
}
fn default_kv_url() -> String {
    "redis://127.0.0.1/".to_string()
}
fn default_key_prefix() -> String {
    "floe:v1".to_string()
}
fn default_max_range_bytes() -> u64 {
    16 * 1024 * 1024
}
fn default_publish_timeout_secs() -> u64 {
    300
}
fn default_min_balance() -> u64 {
    1_000_000_000
}
fn default_network() -> Network {
    Network::Testnet
}
fn default_fields_cache_ttl_ms() -> u64 {
    24 * 3600 * 1000
}
fn default_reaper_interval_secs() -> u64 {
    300
}
fn default_grace_secs() -> i64 {
    900
}
fn default_lock_ttl_secs() -> i64 {
    900
}
fn default_refresh_interval_secs() -> u64 {
    60
}
fn default_concurrency() -> usize {
    4
}
fn default_interval_cap() -> usize {
    10
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}

impl Config {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if config_path.is_none() {
            #[cfg(not(debug_assertions))]
            {
                builder = builder
                    .add_source(config::File::with_name("/etc/floe/config").required(false));
            }
            #[cfg(debug_assertions)]
            {
                builder = builder.add_source(config::File::with_name("config").required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(config::Environment::with_prefix("FLOE").separator("__"));

        let raw = builder.build().map_err(|e| Error::Config {
            msg: format!("failed to load configuration: {e}"),
        })?;

        let config: Self = raw.try_deserialize().map_err(|e| Error::Config {
            msg: format!("failed to deserialize configuration: {e}"),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate environment invariants per §6: `tmp_dir` must be absolute and
    /// must not be `/`, `/home`, or `$HOME`.
    pub fn validate(&self) -> Result<()> {
        let tmp = &self.storage.tmp_dir;

        if !tmp.is_absolute() {
            return Err(Error::Config {
                msg: format!("UPLOAD_TMP_DIR must be absolute, got {}", tmp.display()),
            });
        }

        let forbidden: Vec<PathBuf> = std::iter::once(PathBuf::from("/"))
            .chain(std::iter::once(PathBuf::from("/home")))
            .chain(std::env::var("HOME").ok().map(PathBuf::from))
            .collect();

        if forbidden.iter().any(|f| f == tmp) {
            return Err(Error::Config {
                msg: format!("UPLOAD_TMP_DIR must not be {}", tmp.display()),
            });
        }

        if self.walrus.publisher_url.is_empty() {
            return Err(Error::Config {
                msg: "walrus.publisher_url must be set".to_string(),
            });
        }

        if self.sui.rpc_url.is_empty() {
            return Err(Error::Config {
                msg: "sui.rpc_url must be set".to_string(),
            });
        }

        Ok(())
    }

    /// Probe that `tmp_dir` is writable; called once at startup.
    pub async fn probe_tmp_dir_writable(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.storage.tmp_dir).await?;
        let probe = self.storage.tmp_dir.join(".floe-writable-probe");
        tokio::fs::write(&probe, b"ok").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok(())
    }

    /// A fully-populated config for unit/integration tests elsewhere in the
    /// crate; not reachable from `load()`.
    #[cfg(any(test, feature = "test-util"))]
    pub fn for_tests() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                max_payload_size: default_max_payload_size(),
                expose_blob_id: false,
            },
            storage: StorageConfig {
                tmp_dir: std::env::temp_dir().join("floe-tests"),
                session_ttl_secs: default_session_ttl_secs(),
            },
            kv: KvConfig {
                url: default_kv_url(),
                key_prefix: default_key_prefix(),
            },
            walrus: WalrusConfig {
                publisher_url: "https://publisher.example/".to_string(),
                aggregator_urls: vec!["https://aggregator.example/".to_string()],
                max_range_bytes: default_max_range_bytes(),
                publish_timeout_secs: default_publish_timeout_secs(),
                signer_secret: None,
                min_balance: default_min_balance(),
            },
            sui: SuiConfig {
                rpc_url: "https://rpc.example/".to_string(),
                network: Network::Testnet,
                file_fields_cache_ttl_ms: default_fields_cache_ttl_ms(),
            },
            reaper: ReaperConfig::default(),
            finalize: FinalizeConfig::default(),
            publish: PublishConfig::default(),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field(
                "max_payload_size",
                &self
                    .max_payload_size
                    .get_appropriate_unit(byte_unit::UnitType::Binary)
                    .to_string(),
            )
            .field("expose_blob_id", &self.expose_blob_id)
            .finish()
    }
}

/// Clamp a requested chunk size into `[MIN_CHUNK_BYTES, MAX_CHUNK_BYTES]`.
pub fn clamp_chunk_size(requested: Option<u64>) -> u64 {
    requested
        .unwrap_or(MAX_CHUNK_BYTES)
        .clamp(MIN_CHUNK_BYTES, MAX_CHUNK_BYTES)
}

/// Clamp a requested epoch count into `[MIN_EPOCHS, MAX_EPOCHS]`.
pub fn clamp_epochs(requested: Option<i64>) -> i64 {
    requested
        .unwrap_or(MIN_EPOCHS)
        .clamp(MIN_EPOCHS, MAX_EPOCHS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_clamps_to_bounds() {
        assert_eq!(clamp_chunk_size(Some(1)), MIN_CHUNK_BYTES);
        assert_eq!(clamp_chunk_size(Some(u64::MAX)), MAX_CHUNK_BYTES);
        assert_eq!(clamp_chunk_size(Some(1024 * 1024)), 1024 * 1024);
        assert_eq!(clamp_chunk_size(None), MAX_CHUNK_BYTES);
    }

    #[test]
    fn epochs_clamp_to_bounds() {
        assert_eq!(clamp_epochs(Some(0)), MIN_EPOCHS);
        assert_eq!(clamp_epochs(Some(1000)), MAX_EPOCHS);
        assert_eq!(clamp_epochs(Some(10)), 10);
    }

    #[test]
    fn rejects_relative_tmp_dir() {
        let mut cfg = sample_config();
        cfg.storage.tmp_dir = PathBuf::from("relative/tmp");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_root_tmp_dir() {
        let mut cfg = sample_config();
        cfg.storage.tmp_dir = PathBuf::from("/");
        assert!(cfg.validate().is_err());
    }

    fn sample_config() -> Config {
        Config {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                max_payload_size: default_max_payload_size(),
                expose_blob_id: false,
            },
            storage: StorageConfig {
                tmp_dir: PathBuf::from("/var/lib/floe/tmp"),
                session_ttl_secs: default_session_ttl_secs(),
            },
            kv: KvConfig {
                url: default_kv_url(),
                key_prefix: default_key_prefix(),
            },
            walrus: WalrusConfig {
                publisher_url: "https://publisher.example/".to_string(),
                aggregator_urls: vec!["https://aggregator.example/".to_string()],
                max_range_bytes: default_max_range_bytes(),
                publish_timeout_secs: default_publish_timeout_secs(),
                signer_secret: None,
                min_balance: default_min_balance(),
            },
            sui: SuiConfig {
                rpc_url: "https://rpc.example/".to_string(),
                network: Network::Testnet,
                file_fields_cache_ttl_ms: default_fields_cache_ttl_ms(),
            },
            reaper: ReaperConfig::default(),
            finalize: FinalizeConfig::default(),
            publish: PublishConfig::default(),
        }
    }
}
