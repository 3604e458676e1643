//! HTTP transfer task
//!
//! Owns one transfer end to end: probe, segment planning, parallel
//! segment workers, part-file merge, and checksum verification. Pause
//! and cancel arrive through shared atomic flags; workers surface them
//! as `Paused` / `Cancelled` errors that unwind cleanly.

use crate::checksum;
use crate::engine::persistence::RecordStore;
use crate::engine::rate_limiter::BandwidthGovernor;
use crate::engine::segment_worker::{part_path, SegmentWorker};
use crate::error::PullmanError;
use pullman_types::{CoreEvent, Segment, TransferStatus, TransferTask};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Files below this size are never split.
const MIN_SPLIT_SIZE: u64 = 1024 * 1024;

/// What the probe learned about the remote resource.
struct ProbeReport {
    supports_range: bool,
    size: Option<u64>,
    etag: Option<String>,
    last_modified: Option<String>,
    final_url: Option<String>,
}

pub struct HttpTransferTask {
    pub task: TransferTask,
    url: String,
    final_url: Option<String>,
    temp_dir: PathBuf,
    client: Client,
    governor: BandwidthGovernor,
    store: RecordStore,
    event_tx: broadcast::Sender<CoreEvent>,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    total_downloaded: Arc<AtomicU64>,
    segment_count: u32,
}

impl HttpTransferTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task: TransferTask,
        url: String,
        temp_dir: PathBuf,
        client: Client,
        governor: BandwidthGovernor,
        store: RecordStore,
        event_tx: broadcast::Sender<CoreEvent>,
        paused: Arc<AtomicBool>,
        cancelled: Arc<AtomicBool>,
        segment_count: u32,
    ) -> Self {
        let resumed: u64 = task.segments.iter().map(|s| s.downloaded).sum();
        let initial = if resumed > 0 { resumed } else { task.downloaded };

        Self {
            task,
            url,
            final_url: None,
            temp_dir,
            client,
            governor,
            store,
            event_tx,
            paused,
            cancelled,
            total_downloaded: Arc::new(AtomicU64::new(initial)),
            segment_count,
        }
    }

    fn effective_url(&self) -> &str {
        self.final_url.as_deref().unwrap_or(&self.url)
    }

    /// Drive the transfer to a terminal state.
    ///
    /// `Paused` and `Cancelled` errors are control flow and come back
    /// as `Ok(())` after the status row is updated; real failures
    /// propagate to the caller for retry classification.
    pub async fn run(mut self) -> Result<(), PullmanError> {
        info!(
            "Transfer {} starting: {} ({} segments max)",
            self.task.id, self.task.file_name, self.segment_count
        );

        if let Some(status) = self.check_control_flags().await? {
            debug!("Transfer {} stopped before connect: {:?}", self.task.id, status);
            return Ok(());
        }

        self.set_status(TransferStatus::Connecting, None).await?;

        let report = self.probe().await?;
        self.final_url = report.final_url.clone();

        if let Some(status) = self.check_control_flags().await? {
            debug!("Transfer {} stopped after probe: {:?}", self.task.id, status);
            return Ok(());
        }

        self.apply_probe(report).await?;

        if self.task.size == Some(0) {
            return self.finish_empty().await;
        }

        self.set_status(TransferStatus::Downloading, None).await?;
        self.emit_progress(0, None);

        let all_complete = !self.task.segments.is_empty()
            && self.task.segments.iter().all(|s| s.complete);

        if !all_complete {
            if let Err(e) = self.download_segments().await {
                return self.finish_with_error(e).await;
            }
        }

        if let Err(e) = self.merge_and_verify().await {
            return self.finish_with_error(e).await;
        }

        self.task.status = TransferStatus::Completed;
        self.task.downloaded = self
            .task
            .size
            .unwrap_or_else(|| self.total_downloaded.load(Ordering::Acquire));
        self.store.upsert_transfer(&self.task).await?;
        self.set_status(TransferStatus::Completed, None).await?;
        let _ = self.event_tx.send(CoreEvent::DownloadCompleted { id: self.task.id });

        info!("Transfer {} completed: {}", self.task.id, self.task.file_name);
        Ok(())
    }

    /// Map control-flow and failure errors to their terminal status.
    async fn finish_with_error(&mut self, e: PullmanError) -> Result<(), PullmanError> {
        match e {
            PullmanError::Paused => {
                debug!("Transfer {} paused", self.task.id);
                // Status row was already flipped by the pause command.
                let _ = self.event_tx.send(CoreEvent::DownloadPaused { id: self.task.id });
                Ok(())
            }
            PullmanError::Cancelled => {
                debug!("Transfer {} cancelled", self.task.id);
                self.set_status(TransferStatus::Cancelled, None).await?;
                Ok(())
            }
            e => {
                error!("Transfer {} failed: {}", self.task.id, e);
                let message = e.to_string();
                self.set_status(TransferStatus::Failed, Some(message.clone()))
                    .await?;
                let _ = self.event_tx.send(CoreEvent::DownloadFailed {
                    id: self.task.id,
                    error: message,
                });
                Err(e)
            }
        }
    }

    async fn check_control_flags(&mut self) -> Result<Option<TransferStatus>, PullmanError> {
        if self.cancelled.load(Ordering::Acquire) {
            self.set_status(TransferStatus::Cancelled, None).await?;
            return Ok(Some(TransferStatus::Cancelled));
        }
        if self.paused.load(Ordering::Acquire) {
            self.set_status(TransferStatus::Paused, None).await?;
            return Ok(Some(TransferStatus::Paused));
        }
        Ok(None)
    }

    // ========================================================================
    // Probe and segment planning
    // ========================================================================

    /// HEAD first, partial GET fallback for servers that hide size
    /// from HEAD (common on release CDNs).
    async fn probe(&self) -> Result<ProbeReport, PullmanError> {
        let response = self.client.head(&self.url).send().await?;

        let mut supports_range = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|s| s == "bytes")
            .unwrap_or(false);

        let mut size: Option<u64> = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());

        let etag = header_string(&response, reqwest::header::ETAG);
        let last_modified = header_string(&response, reqwest::header::LAST_MODIFIED);

        let final_url = {
            let u = response.url().to_string();
            (u != self.url).then_some(u)
        };

        if size.is_none() {
            let probe_url = final_url.as_deref().unwrap_or(&self.url);
            debug!("HEAD gave no Content-Length, probing {} with bytes=0-0", probe_url);

            match self
                .client
                .get(probe_url)
                .header(reqwest::header::RANGE, "bytes=0-0")
                .send()
                .await
            {
                Ok(ranged) => {
                    if ranged.status() == reqwest::StatusCode::PARTIAL_CONTENT {
                        supports_range = true;
                        size = ranged
                            .headers()
                            .get(reqwest::header::CONTENT_RANGE)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.rsplit('/').next())
                            .filter(|total| *total != "*")
                            .and_then(|total| total.parse().ok());
                    } else if ranged.status() == reqwest::StatusCode::OK {
                        supports_range = false;
                        size = ranged
                            .headers()
                            .get(reqwest::header::CONTENT_LENGTH)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse().ok());
                    }
                }
                Err(e) => {
                    warn!("Range probe failed, continuing without size: {}", e);
                }
            }
        }

        Ok(ProbeReport {
            supports_range,
            size,
            etag,
            last_modified,
            final_url,
        })
    }

    /// Fold probe results into the task: size, validators, segments.
    ///
    /// A changed validator on a resumed task means the remote content
    /// was replaced, so partial data is discarded and the plan rebuilt.
    async fn apply_probe(&mut self, report: ProbeReport) -> Result<(), PullmanError> {
        let validator_changed = !self.task.segments.is_empty()
            && ((self.task.etag.is_some() && self.task.etag != report.etag)
                || (self.task.etag.is_none()
                    && self.task.last_modified.is_some()
                    && self.task.last_modified != report.last_modified));

        if validator_changed {
            warn!(
                "Remote content changed for {}, restarting from scratch",
                self.task.id
            );
            let _ = self.event_tx.send(CoreEvent::Warning {
                id: Some(self.task.id),
                message: "remote file changed since last attempt; restarting".into(),
            });
            self.discard_parts().await;
            self.task.segments.clear();
            self.task.downloaded = 0;
            self.total_downloaded.store(0, Ordering::Release);
        }

        if self.task.size.is_none() {
            self.task.size = report.size;
        }
        self.task.etag = report.etag;
        self.task.last_modified = report.last_modified;

        if self.task.segments.is_empty() && self.task.size != Some(0) {
            let size = self.task.size.unwrap_or(u64::MAX);
            self.task.segments = if report.supports_range
                && size != u64::MAX
                && size >= MIN_SPLIT_SIZE
                && self.segment_count > 1
            {
                plan_segments(size, self.segment_count)
            } else {
                vec![Segment::new(
                    0,
                    0,
                    if size == u64::MAX { u64::MAX } else { size.saturating_sub(1) },
                )]
            };
            debug!(
                "Transfer {} planned with {} segment(s)",
                self.task.id,
                self.task.segments.len()
            );
        }

        self.store.upsert_transfer(&self.task).await?;
        Ok(())
    }

    /// A zero-byte resource has nothing to segment or merge; create
    /// the empty file and complete.
    async fn finish_empty(&mut self) -> Result<(), PullmanError> {
        tokio::fs::create_dir_all(&self.task.save_path).await?;
        let final_path = self.task.save_path.join(&self.task.file_name);
        let output = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&final_path)
            .await?;
        output.sync_all().await?;

        if let Some(expected) = self.task.checksum.clone() {
            self.set_status(TransferStatus::Verifying, None).await?;
            if let Err(e) = checksum::verify(final_path, expected).await {
                return self.finish_with_error(e).await;
            }
        }

        self.task.status = TransferStatus::Completed;
        self.task.downloaded = 0;
        self.store.upsert_transfer(&self.task).await?;
        self.set_status(TransferStatus::Completed, None).await?;
        let _ = self.event_tx.send(CoreEvent::DownloadCompleted { id: self.task.id });

        info!("Transfer {} completed (empty file): {}", self.task.id, self.task.file_name);
        Ok(())
    }

    async fn discard_parts(&self) {
        for segment in &self.task.segments {
            let path = part_path(&self.temp_dir, self.task.id, segment.index);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove stale part {:?}: {}", path, e);
                }
            }
        }
    }

    // ========================================================================
    // Segment execution
    // ========================================================================

    async fn download_segments(&mut self) -> Result<(), PullmanError> {
        let progress_stop = Arc::new(AtomicBool::new(false));
        let progress_handle = self.spawn_progress_reporter(progress_stop.clone());

        let result = self.run_workers().await;

        progress_stop.store(true, Ordering::Release);
        let _ = progress_handle.await;

        match result {
            Ok(discovered) => {
                if let Some(size) = discovered {
                    self.task.size = Some(size);
                    if let Some(seg) = self.task.segments.first_mut() {
                        if seg.is_unknown_size() {
                            seg.end = size.saturating_sub(1);
                        }
                    }
                    self.store.upsert_transfer(&self.task).await?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_workers(&mut self) -> Result<Option<u64>, PullmanError> {
        let url = self.effective_url().to_string();
        let pending: Vec<Segment> = self
            .task
            .segments
            .iter()
            .filter(|s| !s.complete)
            .cloned()
            .collect();

        let mut join_set = JoinSet::new();
        for segment in pending {
            let worker = SegmentWorker::new(
                self.task.id,
                segment.clone(),
                url.clone(),
                self.temp_dir.clone(),
                self.client.clone(),
                self.governor.clone(),
                self.store.clone(),
                self.paused.clone(),
                self.cancelled.clone(),
                self.total_downloaded.clone(),
            );
            let index = segment.index;
            join_set.spawn(async move { (index, worker.run().await) });
        }

        let mut discovered: Option<u64> = None;
        let mut failure: Option<PullmanError> = None;
        let mut was_paused = false;
        let mut was_cancelled = false;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(outcome))) => {
                    if let Some(s) = self.task.segments.iter_mut().find(|s| s.index == index) {
                        s.complete = true;
                    }
                    if outcome.discovered_size.is_some() {
                        discovered = outcome.discovered_size;
                    }
                }
                Ok((_, Err(PullmanError::Paused))) => {
                    // Make the siblings stop too.
                    self.paused.store(true, Ordering::Release);
                    was_paused = true;
                }
                Ok((_, Err(PullmanError::Cancelled))) => {
                    self.cancelled.store(true, Ordering::Release);
                    was_cancelled = true;
                }
                Ok((index, Err(e))) => {
                    warn!("Segment {} of {} failed: {}", index, self.task.id, e);
                    // First real failure wins; flag the rest down.
                    if failure.is_none() {
                        failure = Some(e);
                    }
                    self.cancelled.store(true, Ordering::Release);
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(PullmanError::Unknown(format!(
                            "segment worker panicked: {}",
                            e
                        )));
                    }
                    self.cancelled.store(true, Ordering::Release);
                }
            }
        }

        if let Some(e) = failure {
            // The cancel flag was only used to stop siblings.
            self.cancelled.store(false, Ordering::Release);
            return Err(e);
        }
        if was_cancelled {
            return Err(PullmanError::Cancelled);
        }
        if was_paused {
            return Err(PullmanError::Paused);
        }

        Ok(discovered)
    }

    /// Periodic progress events with EMA-smoothed speed and derived ETA.
    fn spawn_progress_reporter(&self, stop: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let id = self.task.id;
        let total = self.task.size;
        let downloaded = self.total_downloaded.clone();
        let paused = self.paused.clone();
        let event_tx = self.event_tx.clone();
        let store = self.store.clone();

        tokio::spawn(async move {
            let mut last_bytes = downloaded.load(Ordering::Acquire);
            let mut last_tick = std::time::Instant::now();
            let mut smoothed: f64 = 0.0;
            let alpha = 0.15;
            let mut last_store_save = std::time::Instant::now();

            while !stop.load(Ordering::Acquire) {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;

                if paused.load(Ordering::Acquire) {
                    last_tick = std::time::Instant::now();
                    last_bytes = downloaded.load(Ordering::Acquire);
                    smoothed = 0.0;
                    continue;
                }

                let now = std::time::Instant::now();
                let bytes = downloaded.load(Ordering::Acquire);
                let elapsed = now.duration_since(last_tick).as_secs_f64();
                let instant = if elapsed > 0.0 {
                    bytes.saturating_sub(last_bytes) as f64 / elapsed
                } else {
                    0.0
                };
                smoothed = alpha * instant + (1.0 - alpha) * smoothed;
                let speed = smoothed as u64;

                let eta = match (speed, total) {
                    (s, Some(t)) if s > 0 => Some(t.saturating_sub(bytes) / s),
                    _ => None,
                };

                let _ = event_tx.send(CoreEvent::DownloadProgress {
                    id,
                    downloaded: bytes,
                    total,
                    speed,
                    eta,
                });

                if last_store_save.elapsed().as_secs() >= 5 {
                    let _ = store.update_transfer_progress(id, bytes).await;
                    last_store_save = std::time::Instant::now();
                }

                last_bytes = bytes;
                last_tick = now;
            }
        })
    }

    // ========================================================================
    // Merge and verify
    // ========================================================================

    async fn merge_and_verify(&mut self) -> Result<(), PullmanError> {
        self.set_status(TransferStatus::Merging, None).await?;

        let final_path = self.task.save_path.join(&self.task.file_name);
        info!(
            "Merging {} part(s) into {:?}",
            self.task.segments.len(),
            final_path
        );

        let mut merged_total: u64 = 0;
        for segment in &self.task.segments {
            let path = part_path(&self.temp_dir, self.task.id, segment.index);
            if !path.exists() {
                return Err(PullmanError::Unknown(format!(
                    "part file for segment {} is missing",
                    segment.index
                )));
            }
            merged_total += tokio::fs::metadata(&path).await?.len();
        }

        tokio::fs::create_dir_all(&self.task.save_path).await?;

        let mut output = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&final_path)
            .await?;

        let mut buffer = vec![0u8; 1024 * 1024];
        for segment in &self.task.segments {
            let path = part_path(&self.temp_dir, self.task.id, segment.index);
            let mut input = File::open(&path).await?;
            loop {
                let n = input.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                output.write_all(&buffer[..n]).await?;
            }
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Could not remove part file {:?}: {}", path, e);
            }
        }

        output.flush().await?;
        output.sync_all().await?;

        if self.task.size.is_none() && merged_total > 0 {
            self.task.size = Some(merged_total);
        }

        if let Some(expected) = self.task.checksum.clone() {
            self.set_status(TransferStatus::Verifying, None).await?;
            checksum::verify(final_path, expected).await?;
            debug!("Transfer {} checksum verified", self.task.id);
        }

        Ok(())
    }

    async fn set_status(
        &mut self,
        status: TransferStatus,
        error: Option<String>,
    ) -> Result<(), PullmanError> {
        self.task.status = status;
        self.task.error = error.clone();
        self.store
            .update_transfer_status(self.task.id, status, error.clone())
            .await?;
        let _ = self.event_tx.send(CoreEvent::DownloadStatusChanged {
            id: self.task.id,
            status,
            error,
        });
        Ok(())
    }

    fn emit_progress(&self, speed: u64, eta: Option<u64>) {
        let _ = self.event_tx.send(CoreEvent::DownloadProgress {
            id: self.task.id,
            downloaded: self.total_downloaded.load(Ordering::Acquire),
            total: self.task.size,
            speed,
            eta,
        });
    }
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Split `total` bytes into `count` near-equal inclusive ranges.
///
/// The partition is exact: ranges are contiguous, non-overlapping, and
/// the last range absorbs the remainder.
pub fn plan_segments(total: u64, count: u32) -> Vec<Segment> {
    let count = count.max(1) as u64;
    if count == 1 || total < MIN_SPLIT_SIZE {
        return vec![Segment::new(0, 0, total.saturating_sub(1))];
    }

    let base = total / count;
    let mut segments = Vec::with_capacity(count as usize);
    for i in 0..count {
        let start = i * base;
        let end = if i == count - 1 {
            total - 1
        } else {
            (i + 1) * base - 1
        };
        segments.push(Segment::new(i as u32, start, end));
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_exact_and_contiguous() {
        for total in [MIN_SPLIT_SIZE, 10_000_000, 10_000_001, 10_000_007] {
            for count in [2u32, 3, 4, 8] {
                let segments = plan_segments(total, count);
                assert_eq!(segments[0].start, 0);
                assert_eq!(segments.last().unwrap().end, total - 1);
                for pair in segments.windows(2) {
                    assert_eq!(pair[1].start, pair[0].end + 1);
                }
                let sum: u64 = segments.iter().map(|s| s.size()).sum();
                assert_eq!(sum, total);
            }
        }
    }

    #[test]
    fn small_files_stay_single_segment() {
        let segments = plan_segments(1024, 8);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].end, 1023);
    }

    #[test]
    fn one_segment_requested_gives_one_range() {
        let segments = plan_segments(50_000_000, 1);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].size(), 50_000_000);
    }

    #[tokio::test]
    async fn zero_byte_transfer_completes_with_an_empty_file() {
        use crate::engine::rate_limiter::RateLimiter;
        use pullman_types::TransferSource;

        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("t.db")).await.unwrap();
        let (event_tx, _events) = broadcast::channel(16);

        let mut task = TransferTask::new(
            TransferSource::Url("http://example.com/empty.bin".into()),
            dir.path().join("done"),
        );
        task.size = Some(0);

        let mut transfer = HttpTransferTask::new(
            task,
            "http://example.com/empty.bin".into(),
            dir.path().join("tmp"),
            Client::new(),
            BandwidthGovernor::new(
                RateLimiter::from_limit(None),
                RateLimiter::from_limit(None),
            ),
            store,
            event_tx,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            4,
        );

        transfer.finish_empty().await.unwrap();

        let written = dir.path().join("done/empty.bin");
        assert_eq!(tokio::fs::metadata(&written).await.unwrap().len(), 0);
        assert_eq!(transfer.task.status, TransferStatus::Completed);
    }
}
