//! Transfer manager
//!
//! Registry of live HTTP transfer tasks. Admission decisions (who gets
//! a slot) live above this layer; the manager only starts, signals and
//! forgets workers. Control signalling is flag-based so a pause never
//! has to await a worker.

use crate::engine::download_task::HttpTransferTask;
use crate::engine::persistence::RecordStore;
use crate::engine::rate_limiter::{BandwidthGovernor, RateLimiter};
use crate::engine::segment_worker::part_path;
use crate::error::PullmanError;
use pullman_types::{CoreEvent, TransferSource, TransferStatus, TransferTask};
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

pub struct TransferManager {
    active: Arc<RwLock<HashMap<Uuid, TaskHandle>>>,
    client: Client,
    store: RecordStore,
    temp_dir: PathBuf,
    event_tx: broadcast::Sender<CoreEvent>,
    global_limiter: RateLimiter,
}

struct TaskHandle {
    _join: tokio::task::JoinHandle<Result<(), PullmanError>>,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    task_limiter: RateLimiter,
}

impl TransferManager {
    pub async fn new(
        data_dir: PathBuf,
        store: RecordStore,
        event_tx: broadcast::Sender<CoreEvent>,
        global_speed_limit: Option<u64>,
    ) -> Result<Self, PullmanError> {
        let temp_dir = data_dir.join("temp");
        tokio::fs::create_dir_all(&temp_dir).await?;

        let client = Client::builder()
            .user_agent(concat!("Pullman/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| PullmanError::Unknown(e.to_string()))?;

        Ok(Self {
            active: Arc::new(RwLock::new(HashMap::new())),
            client,
            store,
            temp_dir,
            event_tx,
            global_limiter: RateLimiter::from_limit(global_speed_limit),
        })
    }

    /// Start a transfer worker for an admitted task.
    ///
    /// No-op if the task already has a live worker.
    pub async fn start(&self, task: TransferTask, segment_count: u32) -> Result<(), PullmanError> {
        let id = task.id;

        if self.active.read().await.contains_key(&id) {
            warn!("Transfer {} already has a worker", id);
            return Ok(());
        }

        let url = match &task.source {
            TransferSource::Url(url) => url.clone(),
            _ => {
                return Err(PullmanError::InvalidOperation(
                    "transfer manager only runs HTTP sources".into(),
                ))
            }
        };

        info!(
            "Admitting transfer {}: {} (limit {:?})",
            id, task.file_name, task.speed_limit
        );

        let task_limiter = RateLimiter::from_limit(task.speed_limit);
        let governor = BandwidthGovernor::new(self.global_limiter.clone(), task_limiter.clone());

        let paused = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));

        let worker = HttpTransferTask::new(
            task,
            url,
            self.temp_dir.clone(),
            self.client.clone(),
            governor,
            self.store.clone(),
            self.event_tx.clone(),
            paused.clone(),
            cancelled.clone(),
            segment_count,
        );

        let active = self.active.clone();
        let join = tokio::spawn(async move {
            let result = worker.run().await;
            active.write().await.remove(&id);
            result
        });

        self.active.write().await.insert(
            id,
            TaskHandle {
                _join: join,
                paused,
                cancelled,
                task_limiter,
            },
        );

        Ok(())
    }

    /// Signal pause; the worker saves progress and unwinds on its own.
    pub async fn pause(&self, id: Uuid) -> Result<(), PullmanError> {
        if let Some(handle) = self.active.read().await.get(&id) {
            handle.paused.store(true, Ordering::Release);
            info!("Pause signalled for transfer {}", id);
        }

        let _ = self.event_tx.send(CoreEvent::DownloadStatusChanged {
            id,
            status: TransferStatus::Paused,
            error: None,
        });

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store
                .update_transfer_status(id, TransferStatus::Paused, None)
                .await
            {
                warn!("Could not persist pause for {}: {}", id, e);
            }
        });

        Ok(())
    }

    /// Unpause a still-running worker. Returns false when there is no
    /// live worker and the caller must re-admit the task instead.
    pub async fn unpause_running(&self, id: Uuid) -> bool {
        let active = self.active.read().await;
        if let Some(handle) = active.get(&id) {
            handle.paused.store(false, Ordering::Release);
            info!("Unpaused running transfer {}", id);
            let _ = self.event_tx.send(CoreEvent::DownloadStatusChanged {
                id,
                status: TransferStatus::Downloading,
                error: None,
            });
            true
        } else {
            false
        }
    }

    /// Stop a worker without any status write. The recovery supervisor
    /// uses this when it owns the resulting status itself.
    pub async fn interrupt(&self, id: Uuid) -> bool {
        if let Some(handle) = self.active.read().await.get(&id) {
            handle.paused.store(true, Ordering::Release);
            info!("Interrupt signalled for transfer {}", id);
            true
        } else {
            false
        }
    }

    /// Cancel a transfer. Part files stay on disk so a later retry can
    /// reuse them; removal is what deletes them.
    pub async fn cancel(&self, id: Uuid) -> Result<(), PullmanError> {
        if let Some(handle) = self.active.write().await.remove(&id) {
            handle.cancelled.store(true, Ordering::Release);
            info!("Cancel signalled for transfer {}", id);
        }

        self.store
            .update_transfer_status(id, TransferStatus::Cancelled, None)
            .await?;

        let _ = self.event_tx.send(CoreEvent::DownloadStatusChanged {
            id,
            status: TransferStatus::Cancelled,
            error: None,
        });

        Ok(())
    }

    /// Remove a transfer record, its part files, and optionally the
    /// completed output file.
    pub async fn remove(&self, id: Uuid, delete_file: bool) -> Result<(), PullmanError> {
        self.cancel(id).await?;

        if let Some(task) = self.store.load_transfer(id).await? {
            if delete_file && task.status == TransferStatus::Completed {
                let file_path = task.save_path.join(&task.file_name);
                if file_path.exists() {
                    tokio::fs::remove_file(&file_path).await?;
                    let _ = self.event_tx.send(CoreEvent::FileDeleted {
                        id,
                        path: file_path,
                    });
                }
            }

            for segment in &task.segments {
                let part = part_path(&self.temp_dir, id, segment.index);
                if part.exists() {
                    let _ = tokio::fs::remove_file(&part).await;
                }
            }
        }

        self.store.delete_transfer(id).await?;
        let _ = self.event_tx.send(CoreEvent::DownloadRemoved { id });

        Ok(())
    }

    /// Store the per-task ceiling and apply it to the live worker.
    pub async fn set_task_speed_limit(
        &self,
        id: Uuid,
        limit: Option<u64>,
    ) -> Result<(), PullmanError> {
        let mut task = self
            .store
            .load_transfer(id)
            .await?
            .ok_or(PullmanError::NotFound(id))?;
        task.speed_limit = limit;
        self.store.upsert_transfer(&task).await?;

        if let Some(handle) = self.active.read().await.get(&id) {
            handle.task_limiter.set_limit(limit).await;
            info!("Applied speed limit {:?} to live transfer {}", limit, id);
        }

        Ok(())
    }

    /// Retarget the engine-wide ceiling; every live worker sees it on
    /// its next chunk.
    pub async fn set_global_speed_limit(&self, limit: Option<u64>) {
        self.global_limiter.set_limit(limit).await;
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn is_active(&self, id: Uuid) -> bool {
        self.active.read().await.contains_key(&id)
    }

    pub async fn active_ids(&self) -> Vec<Uuid> {
        self.active.read().await.keys().copied().collect()
    }

    /// Reconcile persisted state after a restart: anything that was
    /// mid-flight goes back to the queue to be re-admitted in order.
    pub async fn restore(&self) -> Result<Vec<TransferTask>, PullmanError> {
        let mut tasks = self.store.load_all_transfers().await?;
        info!("Restored {} transfer records", tasks.len());

        for task in &mut tasks {
            if task.status.is_active() {
                self.store
                    .update_transfer_status(task.id, TransferStatus::Queued, None)
                    .await?;
                task.status = TransferStatus::Queued;
            }
        }

        Ok(tasks)
    }
}
