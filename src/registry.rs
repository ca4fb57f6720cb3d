//! On-chain registry client (§4.6 mint, §4.7 resolution).
//!
//! A narrow, typed seam over the registry's JSON-RPC surface, following the
//! teacher's `reqwest::Client` + typed-deserialize pattern from `auth.rs`'s
//! GitHub calls rather than hand-rolling HTTP parsing.

use crate::config::{Config, Network};
use crate::error::{Error, Result};
use crate::models::AssetFields;
use crate::signer::Signer;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Mints a new on-chain object for `{blobId, sizeBytes, mime, owner?}`
    /// and returns the registry-assigned `fileId`.
    async fn mint(&self, blob_id: &str, size_bytes: u64, mime: &str) -> Result<String>;

    /// Fetches and normalizes the on-chain object fields for `fileId`.
    async fn get_fields(&self, file_id: &str) -> Result<AssetFields>;
}

pub struct SuiRegistryClient {
    http: reqwest::Client,
    rpc_url: String,
    network: Network,
    signer: Option<Signer>,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct MintResult {
    #[serde(rename = "objectId")]
    object_id: String,
}

#[derive(Debug, Deserialize)]
struct ObjectFieldsResult {
    #[serde(rename = "blobId")]
    blob_id: String,
    #[serde(rename = "sizeBytes")]
    size_bytes: u64,
    #[serde(default)]
    mime: Option<String>,
    #[serde(rename = "createdAt", default)]
    created_at: Option<String>,
    #[serde(default)]
    owner: Option<String>,
}

impl SuiRegistryClient {
    pub fn new(config: &Config, signer: Option<Signer>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config {
                msg: format!("failed to build registry http client: {e}"),
            })?;

        if config.sui.network == Network::Mainnet && signer.is_none() {
            return Err(Error::Config {
                msg: "mainnet network requires a signer_secret".to_string(),
            });
        }

        Ok(Self {
            http,
            rpc_url: config.sui.rpc_url.clone(),
            network: config.sui.network,
            signer,
        })
    }
}

#[async_trait]
impl RegistryClient for SuiRegistryClient {
    async fn mint(&self, blob_id: &str, size_bytes: u64, mime: &str) -> Result<String> {
        let mut body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "floe_mintAsset",
            "params": {
                "blobId": blob_id,
                "sizeBytes": size_bytes,
                "mime": mime,
                "network": self.network,
            }
        });

        if let Some(signer) = &self.signer {
            let payload = serde_json::to_vec(&body).unwrap_or_default();
            body["auth"] = serde_json::json!({
                "address": signer.address(),
                "signature": signer.sign(&payload),
            });
        }

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::RegistryUnavailable {
                msg: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::RegistryUnavailable {
                msg: format!("registry returned status {}", response.status()),
            });
        }

        let envelope: RpcEnvelope<MintResult> =
            response.json().await.map_err(|e| Error::RegistryUnavailable {
                msg: format!("unparseable registry response: {e}"),
            })?;

        if let Some(err) = envelope.error {
            return Err(Error::RegistryUnavailable { msg: err.message });
        }

        envelope
            .result
            .map(|r| r.object_id)
            .ok_or_else(|| Error::RegistryUnavailable {
                msg: "registry mint returned no result".to_string(),
            })
    }

    async fn get_fields(&self, file_id: &str) -> Result<AssetFields> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sui_getObject",
            "params": [file_id, {"showContent": true}],
        });

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::RegistryUnavailable {
                msg: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::RegistryUnavailable {
                msg: format!("registry returned status {}", response.status()),
            });
        }

        let envelope: RpcEnvelope<ObjectFieldsResult> =
            response.json().await.map_err(|e| Error::RegistryUnavailable {
                msg: format!("unparseable registry response: {e}"),
            })?;

        if let Some(err) = envelope.error {
            return Err(Error::RegistryUnavailable { msg: err.message });
        }

        let raw = envelope.result.ok_or_else(|| Error::InvalidFileMetadata {
            msg: "registry object has no content".to_string(),
        })?;

        normalize_fields(raw)
    }
}

fn normalize_fields(raw: ObjectFieldsResult) -> Result<AssetFields> {
    let blob_id = raw.blob_id.trim().to_string();
    if blob_id.is_empty() {
        return Err(Error::InvalidFileMetadata {
            msg: "blobId is empty".to_string(),
        });
    }
    if raw.size_bytes == 0 {
        return Err(Error::InvalidFileMetadata {
            msg: "sizeBytes must be positive".to_string(),
        });
    }

    Ok(AssetFields {
        blob_id,
        size_bytes: raw.size_bytes,
        mime: raw
            .mime
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        created_at: raw.created_at,
        owner: raw.owner,
    })
}
