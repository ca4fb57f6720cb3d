//! Single-attempt publish client (§4.6).
//!
//! Mirrors the teacher's `reqwest`-based upstream client shape in
//! `auth.rs` (typed, error-mapped, non-2xx surfaced as a descriptive error)
//! generalized to a streamed multipart-free body upload against the
//! publisher's raw-bytes endpoint.

use crate::config::{Config, Network};
use crate::error::{Error, Result};
use crate::signer::Signer;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

#[async_trait]
pub trait PublishClient: Send + Sync {
    async fn publish(&self, file_path: &Path, size_bytes: u64, epochs: i64) -> Result<String>;
}

pub struct WalrusPublishClient {
    http: reqwest::Client,
    publisher_url: String,
    network: Network,
    signer: Option<Signer>,
    min_balance: u64,
}

impl WalrusPublishClient {
    pub fn new(config: &Config, signer: Option<Signer>) -> Result<Self> {
        if config.sui.network == Network::Mainnet && signer.is_none() {
            return Err(Error::Config {
                msg: "mainnet network requires a signer_secret for publishing".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.walrus.publish_timeout_secs))
            .build()
            .map_err(|e| Error::Config {
                msg: format!("failed to build publish http client: {e}"),
            })?;

        Ok(Self {
            http,
            publisher_url: config.walrus.publisher_url.clone(),
            network: config.sui.network,
            signer,
            min_balance: config.walrus.min_balance,
        })
    }

    async fn precheck_balance(&self) -> Result<()> {
        let Some(signer) = &self.signer else {
            return Ok(());
        };
        if self.network != Network::Mainnet || !signer.should_check_balance() {
            return Ok(());
        }

        let url = format!("{}/v1/balance/{}", self.publisher_url.trim_end_matches('/'), signer.address());
        let response = self.http.get(&url).send().await.map_err(|e| Error::UploadFailed {
            msg: format!("balance check failed: {e}"),
        })?;

        #[derive(Deserialize)]
        struct Balance {
            balance: u64,
        }
        let balance: Balance = response.json().await.map_err(|e| Error::UploadFailed {
            msg: format!("unparseable balance response: {e}"),
        })?;

        if balance.balance < self.min_balance {
            return Err(Error::UploadFailed {
                msg: format!(
                    "insufficient balance: {} < required {}",
                    balance.balance, self.min_balance
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    #[serde(rename = "newlyCreated")]
    newly_created: Option<NewlyCreated>,
    #[serde(rename = "alreadyCertified")]
    already_certified: Option<AlreadyCertified>,
    #[serde(rename = "blobObject")]
    blob_object: Option<BlobObject>,
}

#[derive(Debug, Deserialize)]
struct NewlyCreated {
    #[serde(rename = "blobObject")]
    blob_object: BlobObject,
}

#[derive(Debug, Deserialize)]
struct AlreadyCertified {
    #[serde(rename = "blobId")]
    blob_id: String,
}

#[derive(Debug, Deserialize)]
struct BlobObject {
    #[serde(rename = "blobId")]
    blob_id: String,
}

impl PublishResponse {
    /// First-match precedence per §4.6: `newlyCreated.blobObject.blobId`,
    /// then `alreadyCertified.blobId`, then `blobObject.blobId`.
    fn extract_blob_id(&self) -> Option<String> {
        self.newly_created
            .as_ref()
            .map(|nc| nc.blob_object.blob_id.clone())
            .or_else(|| self.already_certified.as_ref().map(|ac| ac.blob_id.clone()))
            .or_else(|| self.blob_object.as_ref().map(|bo| bo.blob_id.clone()))
    }
}

#[async_trait]
impl PublishClient for WalrusPublishClient {
    async fn publish(&self, file_path: &Path, size_bytes: u64, epochs: i64) -> Result<String> {
        if epochs <= 0 {
            return Err(Error::InvalidEpochs { epochs });
        }

        self.precheck_balance().await?;

        let file = File::open(file_path).await.map_err(|e| Error::UploadFailed {
            msg: format!("failed to open assembled file: {e}"),
        })?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let url = format!(
            "{}/v1/blobs?epochs={}",
            self.publisher_url.trim_end_matches('/'),
            epochs
        );

        let mut request = self
            .http
            .put(&url)
            .header(reqwest::header::CONTENT_LENGTH, size_bytes)
            .body(body);

        if let Some(signer) = &self.signer {
            let timestamp = Utc::now().to_rfc3339();
            let signature = signer.sign(timestamp.as_bytes());
            request = request
                .header("x-floe-address", signer.address())
                .header("x-floe-timestamp", timestamp)
                .header("x-floe-signature", signature);
        }

        let response = request.send().await.map_err(|e| Error::UploadFailed {
            msg: format!("publish request failed: {e}"),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UploadFailed {
                msg: format!("PUBLISH_FAILED:{}:{}", status.as_u16(), body),
            });
        }

        let parsed: PublishResponse = response.json().await.map_err(|e| Error::UploadFailed {
            msg: format!("unparseable publish response: {e}"),
        })?;

        parsed.extract_blob_id().ok_or_else(|| Error::UploadFailed {
            msg: "MISSING_BLOB_ID".to_string(),
        })
    }
}
