//! Publish coordinator (§4.5): bounded concurrency + interval-admission rate
//! limiting + bounded retries with linear backoff + outcome metrics.
//!
//! No crate in the retrieval pack supplies a token-bucket rate limiter, so
//! the interval gate is hand-rolled here (documented in DESIGN.md); the
//! bounded-concurrency gate reuses `tokio::sync::Semaphore`, the same
//! primitive the teacher doesn't need but the pack's concurrent-worker
//! examples reach for routinely.

use crate::config::PublishConfig;
use crate::error::{Error, Result};
use crate::publish_client::PublishClient;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

struct IntervalGate {
    cap: usize,
    interval: Duration,
    window_start: Instant,
    admitted_in_window: usize,
}

impl IntervalGate {
    fn new(cap: usize, interval: Duration) -> Self {
        Self {
            cap,
            interval,
            window_start: Instant::now(),
            admitted_in_window: 0,
        }
    }

    /// Returns how long the caller must wait before admission, advancing the
    /// window (with carry-over) as time passes.
    fn admit(&mut self) -> Duration {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.interval {
            let elapsed_windows = (now.duration_since(self.window_start).as_nanos()
                / self.interval.as_nanos().max(1)) as u32;
            self.window_start += self.interval * elapsed_windows;
            self.admitted_in_window = 0;
        }

        if self.admitted_in_window < self.cap {
            self.admitted_in_window += 1;
            Duration::ZERO
        } else {
            let wait = self.interval.saturating_sub(now.duration_since(self.window_start));
            wait
        }
    }
}

/// Classification of a publish attempt's outcome, per §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    AuthFailed,
    RateLimited,
    ClientError,
    ServerError,
    Timeout,
    NetworkError,
    InvalidResponse,
    UnknownError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::AuthFailed => "auth_failed",
            Outcome::RateLimited => "rate_limited",
            Outcome::ClientError => "client_error",
            Outcome::ServerError => "server_error",
            Outcome::Timeout => "timeout",
            Outcome::NetworkError => "network_error",
            Outcome::InvalidResponse => "invalid_response",
            Outcome::UnknownError => "unknown_error",
        }
    }

    fn classify(error: &Error) -> Self {
        if let Error::UploadFailed { msg } = error {
            if msg == "MISSING_BLOB_ID" {
                return Outcome::InvalidResponse;
            }
            if let Some(rest) = msg.strip_prefix("PUBLISH_FAILED:") {
                if let Some(status_str) = rest.split(':').next() {
                    if let Ok(status) = status_str.parse::<u16>() {
                        return match status {
                            401 | 403 => Outcome::AuthFailed,
                            429 => Outcome::RateLimited,
                            400..=499 => Outcome::ClientError,
                            500..=599 => Outcome::ServerError,
                            _ => Outcome::UnknownError,
                        };
                    }
                }
            }
            let lower = msg.to_lowercase();
            if lower.contains("timed out") || lower.contains("timeout") || lower.contains("deadline") {
                return Outcome::Timeout;
            }
            if ["enotfound", "eai_again", "etimedout", "econnreset", "network", "fetch"]
                .iter()
                .any(|needle| lower.contains(needle))
            {
                return Outcome::NetworkError;
            }
        }
        Outcome::UnknownError
    }
}

pub struct PublishCoordinator {
    client: Arc<dyn PublishClient>,
    config: PublishConfig,
    concurrency: Arc<Semaphore>,
    gate: Arc<Mutex<IntervalGate>>,
}

impl PublishCoordinator {
    pub fn new(client: Arc<dyn PublishClient>, config: PublishConfig) -> Self {
        let gate = IntervalGate::new(config.interval_cap, Duration::from_millis(config.interval_ms));
        Self {
            client,
            concurrency: Arc::new(Semaphore::new(config.concurrency)),
            gate: Arc::new(Mutex::new(gate)),
            config,
        }
    }

    /// Runs the bounded retry loop for one upload, emitting a metric per
    /// attempt and a final outcome metric, per §4.5.
    pub async fn submit(
        &self,
        upload_id: Uuid,
        file_path: &Path,
        size_bytes: u64,
        epochs: i64,
    ) -> Result<String> {
        let _permit = self.concurrency.acquire().await.map_err(|_| Error::Internal {
            msg: "publish coordinator semaphore closed".to_string(),
        })?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.wait_for_admission().await;

            let started = Instant::now();
            let result = self.client.publish(file_path, size_bytes, epochs).await;
            let duration = started.elapsed();

            match &result {
                Ok(_) => {
                    self.record_metrics(upload_id, size_bytes, epochs, attempt, duration, Outcome::Success, None);
                    return result;
                }
                Err(e) => {
                    let outcome = Outcome::classify(e);
                    let status = extract_status(e);
                    self.record_metrics(upload_id, size_bytes, epochs, attempt, duration, outcome, status);

                    if attempt >= self.config.max_retries {
                        return result;
                    }

                    let backoff = Duration::from_millis(self.config.base_delay_ms * attempt as u64);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn wait_for_admission(&self) {
        loop {
            let wait = {
                let mut gate = self.gate.lock().await;
                gate.admit()
            };
            if wait.is_zero() {
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_metrics(
        &self,
        upload_id: Uuid,
        size_bytes: u64,
        epochs: i64,
        attempt: u32,
        duration: Duration,
        outcome: Outcome,
        http_status: Option<u16>,
    ) {
        metrics::histogram!("floe_publish_duration_ms", "outcome" => outcome.as_str())
            .record(duration.as_millis() as f64);
        metrics::counter!("floe_publish_attempts_total", "outcome" => outcome.as_str()).increment(1);

        tracing::info!(
            upload_id = %upload_id,
            size_bytes,
            epochs,
            attempt,
            duration_ms = duration.as_millis() as u64,
            outcome = outcome.as_str(),
            http_status,
            "publish attempt completed"
        );
    }
}

fn extract_status(error: &Error) -> Option<u16> {
    if let Error::UploadFailed { msg } = error {
        if let Some(rest) = msg.strip_prefix("PUBLISH_FAILED:") {
            return rest.split(':').next().and_then(|s| s.parse().ok());
        }
    }
    None
}
