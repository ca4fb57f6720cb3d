//! Segment stitcher + aggregator failover (§4.7).
//!
//! No teacher analogue streams a remote range-fetch loop, so the
//! cancellation-aware retry shape here is grounded on the chunked
//! range-fetch pattern common across the retrieval pack's streaming
//! download examples rather than on `sw1nn-pkg-repo` directly (see
//! DESIGN.md).

use crate::error::Error;
use crate::read_proxy::range::ByteRange;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

const SEGMENT_FLOOR_BYTES: u64 = 256 * 1024;
const RETRIES_PER_AGGREGATOR: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

pub struct AggregatorPool {
    urls: Vec<String>,
    last_good: AtomicUsize,
    max_range_bytes: u64,
    http: reqwest::Client,
}

impl AggregatorPool {
    pub fn new(urls: Vec<String>, max_range_bytes: u64) -> crate::error::Result<Self> {
        if urls.is_empty() {
            return Err(Error::Config {
                msg: "at least one aggregator url must be configured".to_string(),
            });
        }
        Ok(Self {
            urls,
            last_good: AtomicUsize::new(0),
            max_range_bytes,
            http: reqwest::Client::new(),
        })
    }

    fn last_good_index(&self) -> usize {
        self.last_good.load(Ordering::SeqCst) % self.urls.len()
    }

    /// Streams `range` of `blob_id` as an ordered sequence of byte chunks,
    /// failing over between aggregators and shrinking the segment size on
    /// short reads, per the §4.7 stitching algorithm.
    pub fn stream_range(
        self: &Arc<Self>,
        blob_id: String,
        range: ByteRange,
        total_size: u64,
        cancel: CancellationToken,
    ) -> ReceiverStream<crate::error::Result<Bytes>> {
        let (tx, rx) = mpsc::channel(8);
        let pool = Arc::clone(self);

        tokio::spawn(async move {
            if let Err(e) = pool.drive(blob_id, range, total_size, &cancel, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        ReceiverStream::new(rx)
    }

    async fn drive(
        &self,
        blob_id: String,
        range: ByteRange,
        total_size: u64,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<crate::error::Result<Bytes>>,
    ) -> crate::error::Result<()> {
        let mut off = range.start;
        let mut seg_size = self.max_range_bytes.min(range.end - range.start + 1);
        let start_index = self.last_good_index();

        while off <= range.end {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let (bytes, succeeded_index, want) = loop {
                let want = seg_size.min(range.end - off + 1);
                let seg_end = off + want - 1;

                match self
                    .fetch_segment(&blob_id, off, seg_end, total_size, start_index, cancel)
                    .await
                {
                    Ok((bytes, index)) => break (bytes, index, want),
                    Err(Error::RangeUnsupported) if seg_size > SEGMENT_FLOOR_BYTES => {
                        seg_size = (seg_size / 2).max(SEGMENT_FLOOR_BYTES);
                    }
                    Err(e) => return Err(e),
                }
            };

            let got = bytes.len() as u64;
            if got == 0 {
                return Err(Error::ReadFailed {
                    msg: "upstream returned zero bytes for a non-empty segment".to_string(),
                });
            }
            if got > want {
                return Err(Error::ReadFailed {
                    msg: "upstream returned more bytes than requested".to_string(),
                });
            }

            self.last_good.store(succeeded_index, Ordering::SeqCst);

            let short_read = got < want;
            off += got;

            if tx.send(Ok(bytes)).await.is_err() {
                return Ok(()); // receiver dropped (client disconnected)
            }

            if short_read {
                seg_size = (seg_size / 2).max(SEGMENT_FLOOR_BYTES);
            }
        }

        Ok(())
    }

    /// Tries aggregators starting at `start_index`, wrapping through the
    /// whole pool once, with a bounded per-aggregator retry budget.
    async fn fetch_segment(
        &self,
        blob_id: &str,
        start: u64,
        end: u64,
        total_size: u64,
        start_index: usize,
        cancel: &CancellationToken,
    ) -> crate::error::Result<(Bytes, usize)> {
        let mut last_err = Error::ReadFailed {
            msg: "no aggregators available".to_string(),
        };

        for offset in 0..self.urls.len() {
            let index = (start_index + offset) % self.urls.len();

            for attempt in 1..=RETRIES_PER_AGGREGATOR {
                if cancel.is_cancelled() {
                    return Err(Error::ReadFailed {
                        msg: "request canceled".to_string(),
                    });
                }

                match self.try_fetch(&self.urls[index], blob_id, start, end, total_size).await {
                    Ok(bytes) => return Ok((bytes, index)),
                    Err((e, retryable)) => {
                        last_err = e;
                        if !retryable || attempt == RETRIES_PER_AGGREGATOR {
                            break;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(RETRY_BASE_DELAY * attempt) => {},
                            _ = cancel.cancelled() => {
                                return Err(Error::ReadFailed { msg: "request canceled".to_string() });
                            }
                        }
                    }
                }
            }
        }

        Err(last_err)
    }

    /// A single upstream GET, returning `(error, retryable)` on failure.
    async fn try_fetch(
        &self,
        aggregator_url: &str,
        blob_id: &str,
        start: u64,
        end: u64,
        total_size: u64,
    ) -> Result<Bytes, (Error, bool)> {
        let url = format!("{}/v1/blobs/{blob_id}", aggregator_url.trim_end_matches('/'));

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
            .send()
            .await
            .map_err(|e| (Error::ReadFailed { msg: e.to_string() }, true))?;

        let status = response.status();
        let whole_object_single_segment = start == 0 && end + 1 == total_size;

        let ok = status == reqwest::StatusCode::PARTIAL_CONTENT
            || (status == reqwest::StatusCode::OK && whole_object_single_segment);

        if !ok {
            let retryable = status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
            let mapped = match status {
                reqwest::StatusCode::NOT_FOUND => Error::FileNotFound {
                    file_id: blob_id.to_string(),
                },
                reqwest::StatusCode::RANGE_NOT_SATISFIABLE => Error::RangeUnsupported,
                s if s.is_server_error() => Error::ReadUnavailable {
                    msg: format!("aggregator returned {s}"),
                },
                s => Error::ReadFailed {
                    msg: format!("aggregator returned {s}"),
                },
            };
            return Err((mapped, retryable));
        }

        response
            .bytes()
            .await
            .map_err(|e| (Error::ReadFailed { msg: e.to_string() }, true))
    }
}
