//! Thin CLI client for the ingestion gateway: create a session, stream the
//! file in fixed-size chunks with a per-chunk SHA-256 header, then complete.
//!
//! Shaped like the teacher's `sw1nn-pkg-upload` binary (`clap` args,
//! `colored` success banner, `tracing` for everything else) but driving the
//! chunked create/chunk/complete protocol instead of a single multipart PUT.

use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::process;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "floe-upload")]
#[command(about = "Upload a file to the floe ingestion gateway", long_about = None)]
#[command(version = VERSION)]
struct Args {
    /// Path to the file to upload.
    file: String,

    /// Gateway base URL, e.g. http://localhost:8080.
    #[arg(long, env = "FLOE_GATEWAY_URL", default_value = "http://localhost:8080")]
    gateway_url: String,

    /// Requested chunk size in bytes; the gateway clamps this to its
    /// configured bounds.
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Requested storage duration in epochs.
    #[arg(long)]
    epochs: Option<i64>,

    /// Number of chunks to upload concurrently.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateUploadRequest {
    filename: String,
    content_type: String,
    size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    epochs: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUploadResponse {
    upload_id: String,
    chunk_size: u64,
    total_chunks: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteResponse {
    file_id: String,
    blob_id: String,
    size_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "floe_upload=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("floe-upload version {VERSION}");

    let args = Args::parse();

    if let Err(e) = run(args).await {
        tracing::error!("{e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), String> {
    let path = Path::new(&args.file);
    if !path.exists() {
        return Err(format!("file '{}' does not exist", args.file));
    }

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("failed to stat '{}': {e}", args.file))?;
    let size_bytes = metadata.len();
    if size_bytes == 0 {
        return Err("refusing to upload an empty file".to_string());
    }

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_string());
    let content_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();

    let client = reqwest::Client::new();
    let base = args.gateway_url.trim_end_matches('/').to_string();

    tracing::info!("creating upload session for '{filename}' ({size_bytes} bytes, {content_type})");

    let create_response = client
        .post(format!("{base}/v1/uploads/create"))
        .json(&CreateUploadRequest {
            filename: filename.clone(),
            content_type,
            size_bytes,
            chunk_size: args.chunk_size,
            epochs: args.epochs,
        })
        .send()
        .await
        .map_err(|e| format!("create request failed: {e}"))?;

    let session = parse_or_envelope::<CreateUploadResponse>(create_response).await?;

    tracing::info!(
        "session {} created: {} chunk(s) of {} bytes",
        session.upload_id,
        session.total_chunks,
        session.chunk_size
    );

    let progress = ProgressBar::new(session.total_chunks as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} chunks ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    upload_chunks(
        &client,
        &base,
        &session.upload_id,
        path,
        session.chunk_size,
        session.total_chunks,
        args.concurrency,
        &progress,
    )
    .await?;

    progress.finish_and_clear();

    tracing::info!("all chunks uploaded, finalizing");

    let complete_response = client
        .post(format!("{base}/v1/uploads/{}/complete", session.upload_id))
        .send()
        .await
        .map_err(|e| format!("complete request failed: {e}"))?;

    let result = parse_or_envelope::<CompleteResponse>(complete_response).await?;

    println!("\n{}", "Upload complete".green().bold());
    println!();
    println!("  {}  {}", "File ID:".cyan().bold(), result.file_id);
    println!("  {}  {}", "Blob ID:".cyan().bold(), result.blob_id.bright_black());
    println!("  {}  {} bytes", "Size:".cyan().bold(), result.size_bytes.to_string().yellow());
    println!();

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn upload_chunks(
    client: &reqwest::Client,
    base: &str,
    upload_id: &str,
    path: &Path,
    chunk_size: u64,
    total_chunks: u32,
    concurrency: usize,
    progress: &ProgressBar,
) -> Result<(), String> {
    use futures::stream::{self, StreamExt};

    let results = stream::iter(0..total_chunks)
        .map(|index| {
            let client = client.clone();
            let base = base.to_string();
            let upload_id = upload_id.to_string();
            let path = path.to_path_buf();
            let progress = progress.clone();
            async move {
                let outcome = upload_one_chunk(&client, &base, &upload_id, &path, chunk_size, index).await;
                if outcome.is_ok() {
                    progress.inc(1);
                }
                outcome
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    results.into_iter().collect::<Result<Vec<()>, String>>()?;
    Ok(())
}

async fn upload_one_chunk(
    client: &reqwest::Client,
    base: &str,
    upload_id: &str,
    path: &Path,
    chunk_size: u64,
    index: u32,
) -> Result<(), String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| format!("failed to open '{}': {e}", path.display()))?;

    use tokio::io::AsyncSeekExt;
    let offset = index as u64 * chunk_size;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|e| format!("seek failed: {e}"))?;

    let mut buf = vec![0u8; chunk_size as usize];
    let mut read = 0usize;
    while read < buf.len() {
        let n = file
            .read(&mut buf[read..])
            .await
            .map_err(|e| format!("read failed: {e}"))?;
        if n == 0 {
            break;
        }
        read += n;
    }
    buf.truncate(read);

    let hash = hex::encode(Sha256::digest(&buf));

    let part = reqwest::multipart::Part::bytes(buf).file_name("chunk");
    let form = reqwest::multipart::Form::new().part("file", part);

    let response = client
        .put(format!("{base}/v1/uploads/{upload_id}/chunk/{index}"))
        .header("x-chunk-sha256", hash)
        .multipart(form)
        .send()
        .await
        .map_err(|e| format!("chunk {index} upload failed: {e}"))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("chunk {index} rejected with {status}: {body}"));
    }

    Ok(())
}

async fn parse_or_envelope<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, String> {
    let status = response.status();
    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| format!("unparseable response: {e}"))
    } else {
        match response.json::<ErrorEnvelope>().await {
            Ok(envelope) => Err(format!("{} ({}): {}", status, envelope.error.code, envelope.error.message)),
            Err(_) => Err(format!("request failed with status {status}")),
        }
    }
}
