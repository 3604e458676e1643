//! Pullman Core - Download Orchestration Engine
//!
//! This crate provides the download engine for Pullman: segmented HTTP
//! transfers, BitTorrent swarms, an admission queue, bandwidth limits,
//! retry and stall recovery, scheduling, and categories.

pub mod checksum;
mod error;
mod extractor;
mod queue;
mod recovery;
mod scheduler;

pub mod engine;
pub mod torrent;

pub use error::*;
pub use extractor::*;
pub use queue::*;
pub use recovery::*;
pub use scheduler::*;

use engine::{part_path, RecordStore, TransferManager};
use pullman_types::{
    BandwidthLimit, Category, CategoryStats, CoreEvent, DownloadRequest, EncryptionPolicy,
    GlobalStats, InfoHash, Progress, QueueInfo, RecurrenceRule, ScheduleWindow, ScheduledEntry,
    Settings, SwarmConfig, TorrentInfo, TorrentMetadata, TorrentState, TorrentStats,
    TransferSource, TransferStatus, TransferTask,
};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use torrent::TorrentEngine;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The main Pullman core instance
pub struct PullmanCore {
    /// All known transfers, mirrored from the record store
    pub tasks: Arc<RwLock<HashMap<Uuid, TransferTask>>>,
    /// Category lookup table
    pub categories: Arc<RwLock<HashMap<Uuid, Category>>>,
    /// Engine configuration
    pub settings: Arc<RwLock<Settings>>,
    /// Database connection
    pub store: RecordStore,
    event_tx: broadcast::Sender<CoreEvent>,
    manager: Arc<TransferManager>,
    admission: Arc<AdmissionController>,
    torrents: Arc<TorrentEngine>,
    scheduler: Arc<Scheduler>,
    stalls: Arc<StallDetector>,
    /// Transfer id -> swarm info hash, for routing torrent commands
    torrent_index: Arc<RwLock<HashMap<Uuid, InfoHash>>>,
    /// Per-request segment count overrides, applied at admission
    segment_overrides: Arc<RwLock<HashMap<Uuid, u32>>>,
    /// Tasks whose single clean checksum restart is spent
    checksum_restarts: Arc<RwLock<HashSet<Uuid>>>,
    /// Live per-task speeds feeding the aggregate rollups
    speeds: Arc<RwLock<HashMap<Uuid, u64>>>,
    /// Last stats snapshot per swarm, keyed by hex info hash
    torrent_stats: Arc<RwLock<HashMap<String, TorrentStats>>>,
    fired_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<FiredEntry>>>>,
    data_dir: PathBuf,
}

impl PullmanCore {
    /// Create a new core instance. Call [`PullmanCore::start`]
    /// afterwards to restore persisted state and spawn the supervisor
    /// loops.
    pub async fn new(data_dir: PathBuf) -> Result<Self, PullmanError> {
        tokio::fs::create_dir_all(&data_dir).await?;

        let store = RecordStore::new(data_dir.join("pullman.db")).await?;
        let settings = load_settings(&data_dir).await;

        let (event_tx, _) = broadcast::channel(1000);

        let manager = Arc::new(
            TransferManager::new(
                data_dir.clone(),
                store.clone(),
                event_tx.clone(),
                settings.global_speed_limit,
            )
            .await?,
        );
        let admission = Arc::new(AdmissionController::new(settings.max_concurrent));
        let torrents = Arc::new(TorrentEngine::new(
            store.clone(),
            event_tx.clone(),
            settings.torrent_listen_port,
        ));
        let (scheduler, fired_rx) = Scheduler::new(store.clone());
        let stalls = Arc::new(StallDetector::new(settings.stall_window_secs));

        // Ensure the default category exists
        let mut categories: HashMap<Uuid, Category> = store
            .load_categories()
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();
        if !categories.contains_key(&Uuid::nil()) {
            let default = Category::default_category();
            store.upsert_category(&default).await?;
            categories.insert(Uuid::nil(), default);
        }

        let tasks: HashMap<Uuid, TransferTask> = store
            .load_all_transfers()
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        Ok(Self {
            tasks: Arc::new(RwLock::new(tasks)),
            categories: Arc::new(RwLock::new(categories)),
            settings: Arc::new(RwLock::new(settings)),
            store,
            event_tx,
            manager,
            admission,
            torrents,
            scheduler: Arc::new(scheduler),
            stalls,
            torrent_index: Arc::new(RwLock::new(HashMap::new())),
            segment_overrides: Arc::new(RwLock::new(HashMap::new())),
            checksum_restarts: Arc::new(RwLock::new(HashSet::new())),
            speeds: Arc::new(RwLock::new(HashMap::new())),
            torrent_stats: Arc::new(RwLock::new(HashMap::new())),
            fired_rx: Arc::new(Mutex::new(Some(fired_rx))),
            data_dir,
        })
    }

    /// Restore persisted state and spawn the event pump, the stall
    /// sweeper, the scheduler, and the peer listener.
    pub async fn start(&self) -> Result<(), PullmanError> {
        // Anything mid-flight at the last shutdown goes back to the
        // queue in priority order.
        let restored = self.manager.restore().await?;
        {
            let mut tasks = self.tasks.write().await;
            for task in restored {
                if task.status == TransferStatus::Queued
                    && task.kind == pullman_types::TransferKind::Http
                {
                    self.admission.enqueue(PendingEntry {
                        id: task.id,
                        priority: task.priority,
                        created_at: task.created_at,
                    });
                }
                tasks.insert(task.id, task);
            }
        }

        // Rebuild the transfer -> swarm routing before respawning.
        {
            let mut index = self.torrent_index.write().await;
            for record in self.store.load_swarms().await? {
                index.insert(record.transfer_id, record.info_hash);
            }
        }
        let swarms = self.torrents.restore().await?;
        info!("Restored {} swarms", swarms);
        self.torrents.start_listener().await;

        self.scheduler.load().await?;
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move { scheduler.run().await });

        self.spawn_fired_loop().await;
        self.spawn_event_pump();
        self.spawn_stall_sweeper();

        self.pump_admissible().await;
        Ok(())
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    /// Emit an event
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.event_tx.send(event);
    }

    // ========================================================================
    // Download Operations
    // ========================================================================

    /// Add a new download from a request. Magnet URIs are routed to the
    /// torrent engine; everything else must be a valid http(s) URL.
    pub async fn add_download(&self, request: DownloadRequest) -> Result<TransferTask, PullmanError> {
        if request.url.starts_with("magnet:") {
            let url = request.url.clone();
            return self.add_magnet_link(&url, request.save_path).await;
        }

        let parsed = url::Url::parse(&request.url)
            .map_err(|_| PullmanError::InvalidUrl(request.url.clone()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(PullmanError::InvalidUrl(request.url.clone()));
        }

        let save_path = self.resolve_save_path(&request).await;
        let mut task = TransferTask::new(TransferSource::Url(request.url.clone()), save_path);
        if let Some(name) = request.file_name {
            task.file_name = name;
        }
        if let Some(priority) = request.priority {
            task.priority = priority;
        }
        if let Some(max_retries) = request.max_retries {
            task.max_retries = max_retries;
        } else {
            task.max_retries = self.settings.read().await.max_retries;
        }
        task.category_id = request.category_id;
        task.checksum = request.checksum;

        if let Some(segments) = request.segments {
            self.segment_overrides
                .write()
                .await
                .insert(task.id, segments.max(1));
        }

        self.store.upsert_transfer(&task).await?;
        self.tasks.write().await.insert(task.id, task.clone());
        self.emit(CoreEvent::DownloadAdded { task: task.clone() });

        self.admission.enqueue(PendingEntry {
            id: task.id,
            priority: task.priority,
            created_at: task.created_at,
        });
        self.pump_admissible().await;

        Ok(task)
    }

    /// Add many downloads at once; each request succeeds or fails on
    /// its own.
    pub async fn add_batch_downloads(
        &self,
        requests: Vec<DownloadRequest>,
    ) -> Vec<Result<TransferTask, PullmanError>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.add_download(request).await);
        }
        results
    }

    /// Resolve a page URL through the configured media extractor and
    /// download the stream it reports.
    pub async fn add_media_download(&self, page_url: &str) -> Result<TransferTask, PullmanError> {
        let command = self
            .settings
            .read()
            .await
            .extractor_command
            .clone()
            .ok_or_else(|| {
                PullmanError::InvalidOperation("no extractor command configured".into())
            })?;

        let media = MediaExtractor::new(command).extract(page_url).await?;
        info!("Extractor resolved {} -> {}", page_url, media.url);

        let mut request = DownloadRequest::new(media.url.clone());
        request.file_name = Some(media.file_name());
        self.add_download(request).await
    }

    /// Pause a download. Active HTTP workers unwind cooperatively;
    /// queued tasks just leave the admission queue.
    pub async fn pause_download(&self, id: Uuid) -> Result<(), PullmanError> {
        if let Some(info_hash) = self.torrent_index.read().await.get(&id).copied() {
            self.torrents.pause(&info_hash).await?;
            self.update_status(id, TransferStatus::Paused, None).await?;
            self.emit(CoreEvent::DownloadPaused { id });
            return Ok(());
        }

        if self.manager.is_active(id).await {
            self.manager.pause(id).await?;
        } else {
            // Not yet admitted: forget the queue entry; the status
            // stays Queued and resume simply re-enqueues.
            self.admission.forget(id);
        }
        Ok(())
    }

    /// Resume a paused download.
    pub async fn resume_download(&self, id: Uuid) -> Result<(), PullmanError> {
        if let Some(info_hash) = self.torrent_index.read().await.get(&id).copied() {
            self.torrents.resume(&info_hash).await?;
            self.update_status(id, TransferStatus::Connecting, None).await?;
            return Ok(());
        }

        if self.manager.unpause_running(id).await {
            return Ok(());
        }

        let task = self
            .tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(PullmanError::NotFound(id))?;

        self.admission.enqueue(PendingEntry {
            id,
            priority: task.priority,
            created_at: task.created_at,
        });
        self.pump_admissible().await;
        Ok(())
    }

    /// Retry a failed download from its kept part files.
    pub async fn retry_download(&self, id: Uuid) -> Result<(), PullmanError> {
        let task = self
            .tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(PullmanError::NotFound(id))?;

        if task.status != TransferStatus::Failed {
            return Err(PullmanError::InvalidOperation(format!(
                "cannot retry a transfer in state {}",
                task.status.as_str()
            )));
        }

        self.update_status(id, TransferStatus::Queued, None).await?;
        self.admission.enqueue(PendingEntry {
            id,
            priority: task.priority,
            created_at: task.created_at,
        });
        self.pump_admissible().await;
        Ok(())
    }

    /// Cancel a download. Part files stay on disk until removal.
    pub async fn cancel_download(&self, id: Uuid) -> Result<(), PullmanError> {
        if let Some(info_hash) = self.torrent_index.read().await.get(&id).copied() {
            self.torrents.pause(&info_hash).await?;
            self.update_status(id, TransferStatus::Cancelled, None).await?;
            return Ok(());
        }

        self.admission.forget(id);
        self.manager.cancel(id).await
    }

    /// Remove a download and its part files; the completed output file
    /// goes too when `delete_file` is set.
    pub async fn remove_download(&self, id: Uuid, delete_file: bool) -> Result<(), PullmanError> {
        if let Some(info_hash) = self.torrent_index.write().await.remove(&id) {
            self.torrents.remove(&info_hash, delete_file).await?;
            self.store.delete_transfer(id).await?;
            self.tasks.write().await.remove(&id);
            self.emit(CoreEvent::DownloadRemoved { id });
            return Ok(());
        }

        self.admission.forget(id);
        self.manager.remove(id, delete_file).await?;
        self.tasks.write().await.remove(&id);
        self.segment_overrides.write().await.remove(&id);
        self.checksum_restarts.write().await.remove(&id);
        self.stalls.forget(id);
        Ok(())
    }

    /// Pause everything that is queued or moving.
    pub async fn pause_all(&self) -> Result<(), PullmanError> {
        let ids: Vec<Uuid> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status.is_active() || t.status == TransferStatus::Queued)
            .map(|t| t.id)
            .collect();
        for id in ids {
            if let Err(e) = self.pause_download(id).await {
                warn!("Could not pause {}: {}", id, e);
            }
        }
        Ok(())
    }

    /// Resume everything paused.
    pub async fn resume_all(&self) -> Result<(), PullmanError> {
        let ids: Vec<Uuid> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == TransferStatus::Paused || t.status == TransferStatus::Queued)
            .map(|t| t.id)
            .collect();
        for id in ids {
            if let Err(e) = self.resume_download(id).await {
                warn!("Could not resume {}: {}", id, e);
            }
        }
        Ok(())
    }

    /// Cancel everything non-terminal.
    pub async fn cancel_all(&self) -> Result<(), PullmanError> {
        let ids: Vec<Uuid> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id)
            .collect();
        for id in ids {
            if let Err(e) = self.cancel_download(id).await {
                warn!("Could not cancel {}: {}", id, e);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// All transfers, oldest first.
    pub async fn get_all_downloads(&self) -> Vec<TransferTask> {
        let mut tasks: Vec<TransferTask> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub async fn get_download(&self, id: Uuid) -> Option<TransferTask> {
        self.tasks.read().await.get(&id).cloned()
    }

    pub async fn get_download_progress(&self, id: Uuid) -> Option<Progress> {
        let tasks = self.tasks.read().await;
        let task = tasks.get(&id)?;
        Some(Progress {
            id,
            status: task.status,
            downloaded: task.downloaded,
            total: task.size,
            speed: task.speed,
            eta: task.eta,
        })
    }

    /// Engine-wide rollup, recomputed from the task table.
    pub async fn get_global_stats(&self) -> GlobalStats {
        let tasks = self.tasks.read().await;
        let mut stats = GlobalStats {
            total: tasks.len(),
            ..Default::default()
        };
        for task in tasks.values() {
            match task.status {
                s if s.is_active() => stats.active += 1,
                TransferStatus::Queued => stats.queued += 1,
                TransferStatus::Paused => stats.paused += 1,
                TransferStatus::Completed => stats.completed += 1,
                TransferStatus::Failed => stats.failed += 1,
                _ => {}
            }
            stats.downloaded_bytes += task.downloaded;
        }
        stats.aggregate_speed = self.speeds.read().await.values().sum();
        stats
    }

    pub async fn get_queue_info(&self) -> QueueInfo {
        let aggregate = self.speeds.read().await.values().sum();
        self.admission.snapshot(aggregate)
    }

    // ========================================================================
    // Limits and Priorities
    // ========================================================================

    /// Change the admission cap. Lowering it never preempts running
    /// transfers; the surplus drains as they finish.
    pub async fn set_max_concurrent(&self, max: usize) -> Result<(), PullmanError> {
        self.admission.set_max_concurrent(max);
        {
            let mut settings = self.settings.write().await;
            settings.max_concurrent = max.max(1);
            save_settings(&self.data_dir, &settings).await?;
        }
        self.pump_admissible().await;
        Ok(())
    }

    /// Per-task bandwidth ceiling; applies immediately to live workers.
    pub async fn set_speed_limit(&self, id: Uuid, limit: Option<u64>) -> Result<(), PullmanError> {
        self.manager.set_task_speed_limit(id, limit).await?;
        if let Some(task) = self.tasks.write().await.get_mut(&id) {
            task.speed_limit = limit;
        }
        Ok(())
    }

    /// Engine-wide bandwidth ceiling shared by every worker.
    pub async fn set_global_speed_limit(&self, limit: Option<u64>) -> Result<(), PullmanError> {
        self.manager.set_global_speed_limit(limit).await;
        let mut settings = self.settings.write().await;
        settings.global_speed_limit = limit;
        save_settings(&self.data_dir, &settings).await
    }

    pub async fn set_priority(&self, id: Uuid, priority: i32) -> Result<(), PullmanError> {
        let task = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(&id).ok_or(PullmanError::NotFound(id))?;
            task.priority = priority;
            task.clone()
        };
        self.store.upsert_transfer(&task).await?;
        self.admission.reprioritize(id, priority);
        Ok(())
    }

    // ========================================================================
    // Torrent Operations
    // ========================================================================

    /// Add a torrent from a .torrent file on disk.
    pub async fn add_torrent_file(
        &self,
        path: PathBuf,
        save_path: Option<PathBuf>,
    ) -> Result<TransferTask, PullmanError> {
        let bytes = tokio::fs::read(&path).await?;
        let save_path = match save_path {
            Some(p) => p,
            None => self.settings.read().await.default_save_path.clone(),
        };

        let mut task = TransferTask::new(TransferSource::TorrentFile(path), save_path.clone());
        task.status = TransferStatus::Connecting;

        let config = self.default_swarm_config().await;
        let metadata = self
            .torrents
            .add_torrent_file(task.id, bytes, save_path, config)
            .await?;

        task.file_name = metadata.name.clone();
        task.size = Some(metadata.total_size);
        let info_hash = decode_index_hash(&metadata.info_hash)?;

        self.store.upsert_transfer(&task).await?;
        self.torrent_index.write().await.insert(task.id, info_hash);
        self.tasks.write().await.insert(task.id, task.clone());
        self.emit(CoreEvent::DownloadAdded { task: task.clone() });
        Ok(task)
    }

    /// Add a torrent from a magnet URI. Metadata is fetched from the
    /// swarm, so name and size firm up later.
    pub async fn add_magnet_link(
        &self,
        uri: &str,
        save_path: Option<PathBuf>,
    ) -> Result<TransferTask, PullmanError> {
        let save_path = match save_path {
            Some(p) => p,
            None => self.settings.read().await.default_save_path.clone(),
        };

        let mut task = TransferTask::new(TransferSource::Magnet(uri.to_string()), save_path.clone());
        task.status = TransferStatus::Connecting;

        let config = self.default_swarm_config().await;
        let (info_hash, name) = self
            .torrents
            .add_magnet(task.id, uri, save_path, config)
            .await?;
        task.file_name = name;

        self.store.upsert_transfer(&task).await?;
        self.torrent_index.write().await.insert(task.id, info_hash);
        self.tasks.write().await.insert(task.id, task.clone());
        self.emit(CoreEvent::DownloadAdded { task: task.clone() });
        Ok(task)
    }

    pub async fn pause_torrent(&self, id: Uuid) -> Result<(), PullmanError> {
        self.pause_download(id).await
    }

    pub async fn resume_torrent(&self, id: Uuid) -> Result<(), PullmanError> {
        self.resume_download(id).await
    }

    pub async fn remove_torrent(&self, id: Uuid, delete_data: bool) -> Result<(), PullmanError> {
        self.remove_download(id, delete_data).await
    }

    /// Replace a swarm's runtime config: bandwidth, schedule window,
    /// blocklist, seed ratio, connection cap.
    pub async fn set_torrent_config(
        &self,
        id: Uuid,
        config: SwarmConfig,
    ) -> Result<(), PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        self.torrents.set_config(&info_hash, config).await
    }

    /// Combined static + live view of one swarm.
    pub async fn get_torrent_info(&self, id: Uuid) -> Result<TorrentInfo, PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        let hash_hex = hex::encode(info_hash);
        let metadata = self.get_torrent_metadata(id).await?;
        let stats = self.torrent_stats.read().await.get(&hash_hex).cloned();
        let name = stats
            .as_ref()
            .map(|s| s.name.clone())
            .or_else(|| metadata.as_ref().map(|m| m.name.clone()))
            .unwrap_or_else(|| hash_hex.clone());
        Ok(TorrentInfo {
            info_hash: hash_hex,
            name,
            metadata,
            stats,
            config: self.torrents.config(&info_hash).await?,
        })
    }

    /// Last stats snapshot emitted by the swarm.
    pub async fn get_torrent_stats(&self, id: Uuid) -> Result<Option<TorrentStats>, PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        Ok(self
            .torrent_stats
            .read()
            .await
            .get(&hex::encode(info_hash))
            .cloned())
    }

    pub async fn get_torrent_state(&self, id: Uuid) -> Result<Option<TorrentState>, PullmanError> {
        Ok(self.get_torrent_stats(id).await?.map(|s| s.state))
    }

    /// Static content description; None for magnets still resolving.
    pub async fn get_torrent_metadata(
        &self,
        id: Uuid,
    ) -> Result<Option<TorrentMetadata>, PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        for record in self.store.load_swarms().await? {
            if record.info_hash == info_hash {
                return match record.metainfo {
                    Some(bytes) => {
                        let meta = torrent::Metainfo::from_bytes(&bytes)?;
                        Ok(Some(meta.to_metadata()))
                    }
                    None => Ok(None),
                };
            }
        }
        Ok(None)
    }

    pub async fn set_torrent_priority(&self, id: Uuid, priority: i32) -> Result<(), PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        self.torrents
            .update_config(&info_hash, |c| c.priority = priority)
            .await?;
        self.set_priority(id, priority).await
    }

    pub async fn get_torrent_priority(&self, id: Uuid) -> Result<i32, PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        Ok(self.torrents.config(&info_hash).await?.priority)
    }

    pub async fn set_torrent_bandwidth_limit(
        &self,
        id: Uuid,
        limit: BandwidthLimit,
    ) -> Result<(), PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        self.torrents
            .update_config(&info_hash, |c| c.bandwidth = limit)
            .await?;
        Ok(())
    }

    pub async fn get_torrent_bandwidth_limit(
        &self,
        id: Uuid,
    ) -> Result<BandwidthLimit, PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        Ok(self.torrents.config(&info_hash).await?.bandwidth)
    }

    pub async fn set_torrent_schedule(
        &self,
        id: Uuid,
        schedule: Option<ScheduleWindow>,
    ) -> Result<(), PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        self.torrents
            .update_config(&info_hash, |c| c.schedule = schedule)
            .await?;
        Ok(())
    }

    pub async fn get_torrent_schedule(
        &self,
        id: Uuid,
    ) -> Result<Option<ScheduleWindow>, PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        Ok(self.torrents.config(&info_hash).await?.schedule)
    }

    pub async fn add_web_seed(&self, id: Uuid, url: String) -> Result<(), PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        self.torrents
            .update_config(&info_hash, |c| {
                if !c.web_seeds.contains(&url) {
                    c.web_seeds.push(url);
                }
            })
            .await?;
        Ok(())
    }

    pub async fn remove_web_seed(&self, id: Uuid, url: &str) -> Result<(), PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        self.torrents
            .update_config(&info_hash, |c| c.web_seeds.retain(|s| s != url))
            .await?;
        Ok(())
    }

    pub async fn set_encryption_config(
        &self,
        id: Uuid,
        policy: EncryptionPolicy,
    ) -> Result<(), PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        self.torrents
            .update_config(&info_hash, |c| c.encryption = policy)
            .await?;
        Ok(())
    }

    pub async fn get_encryption_config(&self, id: Uuid) -> Result<EncryptionPolicy, PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        Ok(self.torrents.config(&info_hash).await?.encryption)
    }

    /// Blocked peers are disconnected within one maintenance cycle.
    pub async fn add_blocked_ip(&self, id: Uuid, ip: IpAddr) -> Result<(), PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        self.torrents
            .update_config(&info_hash, |c| {
                c.blocked_ips.insert(ip);
            })
            .await?;
        Ok(())
    }

    pub async fn remove_blocked_ip(&self, id: Uuid, ip: IpAddr) -> Result<(), PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        self.torrents
            .update_config(&info_hash, |c| {
                c.blocked_ips.remove(&ip);
            })
            .await?;
        Ok(())
    }

    pub async fn set_seed_ratio_limit(
        &self,
        id: Uuid,
        limit: Option<f64>,
    ) -> Result<(), PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        self.torrents
            .update_config(&info_hash, |c| c.seed_ratio_limit = limit)
            .await?;
        Ok(())
    }

    pub async fn set_max_connections(&self, id: Uuid, max: usize) -> Result<(), PullmanError> {
        let info_hash = self.swarm_of(id).await?;
        self.torrents
            .update_config(&info_hash, |c| c.max_connections = max.max(1))
            .await?;
        Ok(())
    }

    async fn swarm_of(&self, id: Uuid) -> Result<InfoHash, PullmanError> {
        self.torrent_index
            .read()
            .await
            .get(&id)
            .copied()
            .ok_or(PullmanError::NotFound(id))
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Register a future download.
    pub async fn schedule_download(
        &self,
        template: DownloadRequest,
        next_fire: chrono::DateTime<chrono::Utc>,
        recurrence: RecurrenceRule,
    ) -> Result<ScheduledEntry, PullmanError> {
        let entry = ScheduledEntry::new(template, next_fire, recurrence);
        self.scheduler.add(entry.clone()).await?;
        Ok(entry)
    }

    pub async fn update_scheduled_download(&self, entry: ScheduledEntry) -> Result<(), PullmanError> {
        self.scheduler.update(entry).await
    }

    pub async fn cancel_scheduled_download(&self, id: Uuid) -> Result<(), PullmanError> {
        self.scheduler.remove(id).await
    }

    pub async fn set_schedule_enabled(&self, id: Uuid, enabled: bool) -> Result<(), PullmanError> {
        self.scheduler.set_enabled(id, enabled).await
    }

    pub async fn get_scheduled_downloads(&self) -> Vec<ScheduledEntry> {
        self.scheduler.list().await
    }

    // ========================================================================
    // Category Operations
    // ========================================================================

    pub async fn create_category(&self, name: &str) -> Result<Category, PullmanError> {
        let category = Category::new(name.to_string());
        self.store.upsert_category(&category).await?;
        self.categories
            .write()
            .await
            .insert(category.id, category.clone());
        Ok(category)
    }

    pub async fn update_category(&self, category: Category) -> Result<(), PullmanError> {
        if !self.categories.read().await.contains_key(&category.id) {
            return Err(PullmanError::NotFound(category.id));
        }
        self.store.upsert_category(&category).await?;
        self.categories.write().await.insert(category.id, category);
        Ok(())
    }

    /// Delete a category; its tasks move to the default category.
    pub async fn delete_category(&self, id: Uuid) -> Result<(), PullmanError> {
        if id == Uuid::nil() {
            return Err(PullmanError::InvalidOperation(
                "Cannot delete default category".to_string(),
            ));
        }

        self.store.reassign_category(id, Uuid::nil()).await?;
        {
            let mut tasks = self.tasks.write().await;
            for task in tasks.values_mut() {
                if task.category_id == Some(id) {
                    task.category_id = Some(Uuid::nil());
                }
            }
        }
        self.store.delete_category(id).await?;
        self.categories.write().await.remove(&id);
        Ok(())
    }

    pub async fn get_categories(&self) -> Vec<Category> {
        let mut categories: Vec<Category> =
            self.categories.read().await.values().cloned().collect();
        categories.sort_by_key(|c| c.created_at);
        categories
    }

    /// Per-category rollup, recomputed from the task table.
    pub async fn get_category_stats(&self, id: Uuid) -> CategoryStats {
        let tasks = self.tasks.read().await;
        let mut stats = CategoryStats {
            category_id: id,
            total: 0,
            active: 0,
            completed: 0,
            downloaded_bytes: 0,
        };
        for task in tasks.values() {
            if task.category_id.unwrap_or_else(Uuid::nil) != id {
                continue;
            }
            stats.total += 1;
            if task.status.is_active() {
                stats.active += 1;
            }
            if task.status == TransferStatus::Completed {
                stats.completed += 1;
            }
            stats.downloaded_bytes += task.downloaded;
        }
        stats
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub async fn get_settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Replace the settings; the admission cap and global bandwidth
    /// ceiling apply immediately.
    pub async fn update_settings(&self, settings: Settings) -> Result<(), PullmanError> {
        self.admission.set_max_concurrent(settings.max_concurrent);
        self.manager
            .set_global_speed_limit(settings.global_speed_limit)
            .await;
        save_settings(&self.data_dir, &settings).await?;
        *self.settings.write().await = settings;
        self.pump_admissible().await;
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn resolve_save_path(&self, request: &DownloadRequest) -> PathBuf {
        if let Some(path) = &request.save_path {
            return path.clone();
        }
        if let Some(category_id) = request.category_id {
            if let Some(category) = self.categories.read().await.get(&category_id) {
                if let Some(path) = &category.save_path {
                    return path.clone();
                }
            }
        }
        self.settings.read().await.default_save_path.clone()
    }

    async fn default_swarm_config(&self) -> SwarmConfig {
        SwarmConfig {
            max_connections: self.settings.read().await.torrent_max_connections,
            ..SwarmConfig::default()
        }
    }

    /// Start every admissible task from the queue.
    async fn pump_admissible(&self) {
        let default_segments = self.settings.read().await.default_segments;
        for id in self.admission.take_admissible() {
            let task = self.tasks.read().await.get(&id).cloned();
            let Some(task) = task else {
                self.admission.release(id);
                continue;
            };

            let segments = self
                .segment_overrides
                .read()
                .await
                .get(&id)
                .copied()
                .unwrap_or(default_segments);

            if let Err(e) = self.manager.start(task, segments).await {
                warn!("Could not start transfer {}: {}", id, e);
                self.admission.release(id);
            }
        }
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TransferStatus,
        error: Option<String>,
    ) -> Result<(), PullmanError> {
        {
            let mut tasks = self.tasks.write().await;
            if let Some(task) = tasks.get_mut(&id) {
                task.status = status;
                task.error = error.clone();
                if status == TransferStatus::Completed {
                    task.completed_at = Some(chrono::Utc::now());
                }
            }
        }
        self.store.update_transfer_status(id, status, error.clone()).await?;
        self.emit(CoreEvent::DownloadStatusChanged { id, status, error });
        Ok(())
    }

    /// Consume scheduler firings and turn them into downloads.
    async fn spawn_fired_loop(&self) {
        let Some(mut fired_rx) = self.fired_rx.lock().await.take() else {
            return;
        };
        let core = self.clone();
        tokio::spawn(async move {
            while let Some(fired) = fired_rx.recv().await {
                match core.add_download(fired.template).await {
                    Ok(task) => {
                        core.emit(CoreEvent::ScheduledFired {
                            entry_id: fired.entry_id,
                            task_id: task.id,
                        });
                    }
                    Err(e) => {
                        warn!("Scheduled entry {} could not fire: {}", fired.entry_id, e);
                        core.emit(CoreEvent::Warning {
                            id: None,
                            message: format!("scheduled download failed to start: {}", e),
                        });
                    }
                }
            }
        });
    }

    /// Mirror worker events into the task table and drive admission
    /// and recovery from them.
    fn spawn_event_pump(&self) {
        let core = self.clone();
        let mut rx = self.event_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(e) => e,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event pump lagged, skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                core.handle_event(event).await;
            }
        });
    }

    async fn handle_event(&self, event: CoreEvent) {
        match event {
            CoreEvent::DownloadProgress {
                id,
                downloaded,
                total,
                speed,
                eta,
            } => {
                {
                    let mut tasks = self.tasks.write().await;
                    if let Some(task) = tasks.get_mut(&id) {
                        task.downloaded = downloaded;
                        if total.is_some() {
                            task.size = total;
                        }
                        task.speed = speed;
                        task.eta = eta;
                    }
                }
                self.speeds.write().await.insert(id, speed);
                self.stalls.observe(id, downloaded);
            }
            CoreEvent::DownloadStatusChanged { id, status, error } => {
                {
                    let mut tasks = self.tasks.write().await;
                    if let Some(task) = tasks.get_mut(&id) {
                        task.status = status;
                        task.error = error;
                        if status == TransferStatus::Completed {
                            task.completed_at = Some(chrono::Utc::now());
                        }
                    }
                }
                if status == TransferStatus::Paused || status.is_terminal() {
                    self.admission.release(id);
                    self.speeds.write().await.remove(&id);
                    self.stalls.forget(id);
                    self.pump_admissible().await;
                }
                if status == TransferStatus::Completed {
                    self.checksum_restarts.write().await.remove(&id);
                    self.segment_overrides.write().await.remove(&id);
                }
            }
            CoreEvent::DownloadFailed { id, error } => {
                self.recover(id, &error).await;
            }
            CoreEvent::DownloadRemoved { id } => {
                self.admission.forget(id);
                self.speeds.write().await.remove(&id);
                self.stalls.forget(id);
                self.pump_admissible().await;
            }
            CoreEvent::TorrentStats { stats } => {
                if let Some(id) = {
                    let index = self.torrent_index.read().await;
                    let hash = decode_index_hash(&stats.info_hash).ok();
                    hash.and_then(|h| {
                        index
                            .iter()
                            .find(|(_, v)| **v == h)
                            .map(|(k, _)| *k)
                    })
                } {
                    self.speeds.write().await.insert(id, stats.download_rate);
                }
                self.torrent_stats
                    .write()
                    .await
                    .insert(stats.info_hash.clone(), stats);
            }
            _ => {}
        }
    }

    /// Apply the retry policy to a failed transfer.
    async fn recover(&self, id: Uuid, error: &str) {
        let task = self.tasks.read().await.get(&id).cloned();
        let Some(task) = task else { return };
        if self.torrent_index.read().await.contains_key(&id) {
            return;
        }

        let settings = self.settings.read().await.clone();
        let policy = RetryPolicy::new(task.max_retries, settings.retry_base_delay_secs);
        let class = classify_failure(error);
        let restarted = self.checksum_restarts.read().await.contains(&id);

        match policy.decide(class, task.retry_count, restarted) {
            RecoveryAction::Ignore | RecoveryAction::GiveUp => {
                debug!("No recovery for {}: {}", id, error);
            }
            RecoveryAction::RetryAfter(delay) => {
                let attempt = task.retry_count + 1;
                info!(
                    "Retrying {} in {:?} (attempt {}/{})",
                    id, delay, attempt, task.max_retries
                );
                if let Err(e) = self.bump_retry_count(id, attempt).await {
                    warn!("Could not persist retry count for {}: {}", id, e);
                    return;
                }

                let core = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    core.requeue_if_still_failed(id).await;
                });
            }
            RecoveryAction::RestartClean => {
                info!("Checksum mismatch on {}, restarting from scratch", id);
                self.checksum_restarts.write().await.insert(id);
                if let Err(e) = self.restart_clean(id).await {
                    warn!("Clean restart of {} failed: {}", id, e);
                }
            }
        }
    }

    async fn bump_retry_count(&self, id: Uuid, attempt: u32) -> Result<(), PullmanError> {
        let task = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(&id).ok_or(PullmanError::NotFound(id))?;
            task.retry_count = attempt;
            task.clone()
        };
        self.store.upsert_transfer(&task).await
    }

    async fn requeue_if_still_failed(&self, id: Uuid) {
        let task = self.tasks.read().await.get(&id).cloned();
        let Some(task) = task else { return };
        if task.status != TransferStatus::Failed {
            return;
        }

        if let Err(e) = self.update_status(id, TransferStatus::Queued, None).await {
            warn!("Could not requeue {}: {}", id, e);
            return;
        }
        self.admission.enqueue(PendingEntry {
            id,
            priority: task.priority,
            created_at: task.created_at,
        });
        self.pump_admissible().await;
    }

    /// Discard part files and segment state, then requeue. Used once
    /// per task after a checksum mismatch.
    async fn restart_clean(&self, id: Uuid) -> Result<(), PullmanError> {
        let task = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(&id).ok_or(PullmanError::NotFound(id))?;
            for segment in &task.segments {
                let part = part_path(&self.data_dir.join("temp"), id, segment.index);
                if part.exists() {
                    let _ = std::fs::remove_file(&part);
                }
            }
            task.segments.clear();
            task.downloaded = 0;
            task.etag = None;
            task.last_modified = None;
            task.clone()
        };
        self.store.upsert_transfer(&task).await?;

        self.update_status(id, TransferStatus::Queued, None).await?;
        self.admission.enqueue(PendingEntry {
            id,
            priority: task.priority,
            created_at: task.created_at,
        });
        self.pump_admissible().await;
        Ok(())
    }

    /// Periodically sweep for flatlined transfers. First offence gets a
    /// connection bounce, the second a stall-timeout failure.
    fn spawn_stall_sweeper(&self) {
        let core = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(15));
            loop {
                tick.tick().await;
                for (id, verdict) in core.stalls.sweep() {
                    match verdict {
                        StallVerdict::Heal => {
                            info!("Transfer {} stalled, bouncing connections", id);
                            core.bounce(id).await;
                        }
                        StallVerdict::Fail => {
                            let window = core.stalls.window_secs();
                            warn!("Transfer {} stalled again, failing", id);
                            core.fail_stalled(id, window).await;
                        }
                    }
                }
            }
        });
    }

    /// Stop a stalled worker and requeue it so fresh connections are
    /// opened from the saved offsets.
    async fn bounce(&self, id: Uuid) {
        if !self.manager.interrupt(id).await {
            return;
        }
        let core = self.clone();
        tokio::spawn(async move {
            core.wait_until_inactive(id).await;
            let task = core.tasks.read().await.get(&id).cloned();
            let Some(task) = task else { return };
            core.admission.release(id);
            core.admission.enqueue(PendingEntry {
                id,
                priority: task.priority,
                created_at: task.created_at,
            });
            core.pump_admissible().await;
        });
    }

    async fn fail_stalled(&self, id: Uuid, window_secs: u32) {
        self.manager.interrupt(id).await;
        let core = self.clone();
        tokio::spawn(async move {
            core.wait_until_inactive(id).await;
            core.admission.release(id);
            let error = PullmanError::StallTimeout { window_secs }.to_string();
            if let Err(e) = core
                .update_status(id, TransferStatus::Failed, Some(error.clone()))
                .await
            {
                warn!("Could not mark {} failed: {}", id, e);
                return;
            }
            core.emit(CoreEvent::DownloadFailed { id, error });
        });
    }

    /// Wait for a signalled worker to unwind and leave the registry.
    async fn wait_until_inactive(&self, id: Uuid) {
        for _ in 0..120 {
            if !self.manager.is_active(id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        warn!("Worker {} did not unwind in time", id);
    }
}

impl Clone for PullmanCore {
    fn clone(&self) -> Self {
        Self {
            tasks: Arc::clone(&self.tasks),
            categories: Arc::clone(&self.categories),
            settings: Arc::clone(&self.settings),
            store: self.store.clone(),
            event_tx: self.event_tx.clone(),
            manager: Arc::clone(&self.manager),
            admission: Arc::clone(&self.admission),
            torrents: Arc::clone(&self.torrents),
            scheduler: Arc::clone(&self.scheduler),
            stalls: Arc::clone(&self.stalls),
            torrent_index: Arc::clone(&self.torrent_index),
            segment_overrides: Arc::clone(&self.segment_overrides),
            checksum_restarts: Arc::clone(&self.checksum_restarts),
            speeds: Arc::clone(&self.speeds),
            torrent_stats: Arc::clone(&self.torrent_stats),
            fired_rx: Arc::clone(&self.fired_rx),
            data_dir: self.data_dir.clone(),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Map a task-boundary error message back to its failure class. The
/// checksum and stall cases carry stable prefixes for this purpose.
fn classify_failure(message: &str) -> FailureClass {
    if message.starts_with("checksum-mismatch:") {
        return FailureClass::ChecksumMismatch;
    }
    if message.starts_with("stall-timeout:") {
        return FailureClass::Transient;
    }
    if message.starts_with("Network error:") || message == "Timeout" {
        return FailureClass::Transient;
    }
    if let Some(rest) = message.strip_prefix("Server error: ") {
        let status: u16 = rest
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        return if status >= 500 {
            FailureClass::Transient
        } else {
            FailureClass::Fatal
        };
    }
    if message.starts_with("IO error:") {
        return FailureClass::Transient;
    }
    FailureClass::Fatal
}

fn decode_index_hash(hash_hex: &str) -> Result<InfoHash, PullmanError> {
    let bytes = hex::decode(hash_hex)
        .map_err(|_| PullmanError::TorrentNotFound(hash_hex.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| PullmanError::TorrentNotFound(hash_hex.to_string()))
}

async fn load_settings(data_dir: &std::path::Path) -> Settings {
    let path = data_dir.join("settings.json");
    match tokio::fs::read_to_string(&path).await {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!("Settings file is corrupt ({}), using defaults", e);
            Settings::default()
        }),
        Err(_) => Settings::default(),
    }
}

async fn save_settings(
    data_dir: &std::path::Path,
    settings: &Settings,
) -> Result<(), PullmanError> {
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| PullmanError::Serialization(e.to_string()))?;
    tokio::fs::write(data_dir.join("settings.json"), json).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_messages_map_to_classes() {
        assert_eq!(
            classify_failure("checksum-mismatch: expected aa, got bb"),
            FailureClass::ChecksumMismatch
        );
        assert_eq!(
            classify_failure("stall-timeout: no progress for 60s"),
            FailureClass::Transient
        );
        assert_eq!(
            classify_failure("Network error: connection refused"),
            FailureClass::Transient
        );
        assert_eq!(
            classify_failure("Server error: 503 - busy"),
            FailureClass::Transient
        );
        assert_eq!(
            classify_failure("Server error: 404 - gone"),
            FailureClass::Fatal
        );
        assert_eq!(
            classify_failure("Invalid URL: notaurl"),
            FailureClass::Fatal
        );
    }

    #[tokio::test]
    async fn settings_round_trip_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.max_concurrent = 7;
        settings.global_speed_limit = Some(1_000_000);

        save_settings(dir.path(), &settings).await.unwrap();
        let back = load_settings(dir.path()).await;
        assert_eq!(back.max_concurrent, 7);
        assert_eq!(back.global_speed_limit, Some(1_000_000));
    }

    #[tokio::test]
    async fn missing_settings_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(dir.path()).await;
        assert_eq!(settings.max_concurrent, Settings::default().max_concurrent);
    }

    #[tokio::test]
    async fn default_category_cannot_be_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let core = PullmanCore::new(dir.path().to_path_buf()).await.unwrap();

        let result = core.delete_category(Uuid::nil()).await;
        assert!(matches!(result, Err(PullmanError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn category_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let core = PullmanCore::new(dir.path().to_path_buf()).await.unwrap();

        let movies = core.create_category("Movies").await.unwrap();
        let listed = core.get_categories().await;
        assert!(listed.iter().any(|c| c.id == movies.id));
        assert!(listed.iter().any(|c| c.id == Uuid::nil()));

        core.delete_category(movies.id).await.unwrap();
        assert!(!core
            .get_categories()
            .await
            .iter()
            .any(|c| c.id == movies.id));
    }

    #[tokio::test]
    async fn add_download_rejects_bad_urls() {
        let dir = tempfile::tempdir().unwrap();
        let core = PullmanCore::new(dir.path().to_path_buf()).await.unwrap();

        let result = core.add_download(DownloadRequest::new("not a url")).await;
        assert!(matches!(result, Err(PullmanError::InvalidUrl(_))));

        let result = core
            .add_download(DownloadRequest::new("ftp://host/file"))
            .await;
        assert!(matches!(result, Err(PullmanError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn media_download_requires_an_extractor() {
        let dir = tempfile::tempdir().unwrap();
        let core = PullmanCore::new(dir.path().to_path_buf()).await.unwrap();

        let result = core.add_media_download("https://example.com/watch").await;
        assert!(matches!(result, Err(PullmanError::InvalidOperation(_))));
    }
}
