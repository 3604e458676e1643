//! Segment worker
//!
//! One worker streams one byte range into its own part file. Workers
//! never touch the final file; the owning task merges part files in
//! offset order once every worker reports complete.

use crate::engine::persistence::RecordStore;
use crate::engine::rate_limiter::BandwidthGovernor;
use crate::error::PullmanError;
use futures::StreamExt;
use pullman_types::Segment;
use reqwest::Client;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of one segment run
pub struct SegmentOutcome {
    pub path: PathBuf,
    /// Total transfer size learned mid-stream, when it was unknown
    pub discovered_size: Option<u64>,
}

/// Part file name for a transfer's segment, shared with the merge step.
pub fn part_path(temp_dir: &std::path::Path, transfer_id: Uuid, index: u32) -> PathBuf {
    temp_dir.join(format!("{}_segment_{}.part", transfer_id, index))
}

pub struct SegmentWorker {
    transfer_id: Uuid,
    segment: Segment,
    url: String,
    part_file: PathBuf,
    client: Client,
    governor: BandwidthGovernor,
    store: RecordStore,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    task_downloaded: Arc<AtomicU64>,
}

impl SegmentWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transfer_id: Uuid,
        segment: Segment,
        url: String,
        temp_dir: PathBuf,
        client: Client,
        governor: BandwidthGovernor,
        store: RecordStore,
        paused: Arc<AtomicBool>,
        cancelled: Arc<AtomicBool>,
        task_downloaded: Arc<AtomicU64>,
    ) -> Self {
        let part_file = part_path(&temp_dir, transfer_id, segment.index);
        Self {
            transfer_id,
            segment,
            url,
            part_file,
            client,
            governor,
            store,
            paused,
            cancelled,
            task_downloaded,
        }
    }

    pub async fn run(mut self) -> Result<SegmentOutcome, PullmanError> {
        debug!(
            "Segment {} of {} covers bytes {}-{}",
            self.segment.index, self.transfer_id, self.segment.start, self.segment.end
        );

        let mut discovered_size: Option<u64> = None;

        if self.segment.complete {
            return Ok(SegmentOutcome {
                path: self.part_file,
                discovered_size: None,
            });
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&self.part_file)
            .await?;

        // Resume from whatever the part file already holds. The on-disk
        // length is authoritative over the persisted counter.
        let existing = file.metadata().await?.len();
        if existing > 0 && (self.segment.is_unknown_size() || existing <= self.segment.size()) {
            self.segment.downloaded = existing;
            file.seek(std::io::SeekFrom::Start(existing)).await?;
            debug!(
                "Segment {} resumes at byte {}",
                self.segment.index, existing
            );
        }

        let start_byte = self.segment.start + self.segment.downloaded;
        let unknown_size = self.segment.is_unknown_size();

        if !unknown_size && start_byte > self.segment.end {
            self.segment.complete = true;
            self.save_progress().await?;
            return Ok(SegmentOutcome {
                path: self.part_file,
                discovered_size: None,
            });
        }

        let request = if unknown_size {
            if start_byte == 0 {
                self.client.get(&self.url)
            } else {
                self.client
                    .get(&self.url)
                    .header(reqwest::header::RANGE, format!("bytes={}-", start_byte))
            }
        } else {
            self.client.get(&self.url).header(
                reqwest::header::RANGE,
                format!("bytes={}-{}", start_byte, self.segment.end),
            )
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PullmanError::ServerError {
                status: status.as_u16(),
                message: format!("segment {} request rejected", self.segment.index),
            });
        }

        if unknown_size {
            if let Some(total) = total_from_headers(&response, start_byte) {
                self.segment.end = total.saturating_sub(1);
                discovered_size = Some(total);
                info!("Learned total size mid-stream: {} bytes", total);
            }
        }

        let mut stream = response.bytes_stream();
        let mut last_save = tokio::time::Instant::now();

        while let Some(chunk) = stream.next().await {
            if self.cancelled.load(Ordering::Acquire) {
                self.save_progress().await?;
                return Err(PullmanError::Cancelled);
            }
            if self.paused.load(Ordering::Acquire) {
                self.save_progress().await?;
                return Err(PullmanError::Paused);
            }

            let chunk = chunk?;
            let len = chunk.len() as u64;

            // Both ceilings must clear before the chunk lands on disk.
            self.governor.acquire(len).await;

            file.write_all(&chunk).await?;
            self.segment.downloaded += len;
            self.task_downloaded.fetch_add(len, Ordering::AcqRel);

            if last_save.elapsed().as_secs() >= 2 {
                self.save_progress().await?;
                last_save = tokio::time::Instant::now();
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        self.segment.complete = true;
        self.save_progress().await?;

        debug!(
            "Segment {} complete ({} bytes)",
            self.segment.index, self.segment.downloaded
        );

        Ok(SegmentOutcome {
            path: self.part_file,
            discovered_size,
        })
    }

    async fn save_progress(&self) -> Result<(), PullmanError> {
        self.store
            .update_segment_progress(
                self.transfer_id,
                self.segment.index,
                self.segment.downloaded,
                self.segment.complete,
            )
            .await
    }
}

/// Pull the total transfer size out of a response when it was unknown.
///
/// 206 responses carry `Content-Range: bytes a-b/total`; a 200 that
/// ignored the Range header carries a plain Content-Length, which is
/// the remaining byte count when resuming.
fn total_from_headers(response: &reqwest::Response, start_byte: u64) -> Option<u64> {
    if let Some(range) = response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(total) = range.rsplit('/').next() {
            if total != "*" {
                if let Ok(total) = total.parse::<u64>() {
                    return Some(total);
                }
            }
        }
    }

    response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(|len| start_byte + len)
}
