//! SQLite-backed transfer record store
//!
//! One durable row per TransferTask, Segment, swarm, ScheduledEntry and
//! Category, keyed by a stable identifier. All multi-row writes go
//! through transactions so a crash never leaves a task without its
//! segment plan.

use crate::error::PullmanError;
use crate::torrent::SwarmRecord;
use pullman_types::{
    Category, ChecksumAlgorithm, ChecksumExpectation, DownloadRequest, RecurrenceRule,
    ScheduledEntry, Segment, SwarmConfig, TransferKind, TransferSource, TransferStatus,
    TransferTask,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;
use uuid::Uuid;

/// Database connection pool for engine persistence
#[derive(Clone, Debug)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    /// Open (or create) the store at the given path.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, PullmanError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id TEXT PRIMARY KEY,
                source_kind TEXT NOT NULL,
                source_value TEXT NOT NULL,
                kind TEXT NOT NULL,
                file_name TEXT NOT NULL,
                save_path TEXT NOT NULL,
                size INTEGER,
                downloaded INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                category_id TEXT,
                checksum_algo TEXT,
                checksum_value TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 5,
                speed_limit INTEGER,
                error TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                etag TEXT,
                last_modified TEXT
            );

            CREATE TABLE IF NOT EXISTS segments (
                transfer_id TEXT NOT NULL,
                segment_index INTEGER NOT NULL,
                start_byte INTEGER NOT NULL,
                end_byte INTEGER NOT NULL,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                complete INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (transfer_id, segment_index),
                FOREIGN KEY (transfer_id) REFERENCES transfers(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS swarms (
                info_hash TEXT PRIMARY KEY,
                transfer_id TEXT NOT NULL,
                name TEXT NOT NULL,
                metainfo BLOB,
                magnet TEXT,
                bitfield BLOB NOT NULL,
                uploaded INTEGER NOT NULL DEFAULT 0,
                downloaded INTEGER NOT NULL DEFAULT 0,
                config TEXT NOT NULL,
                FOREIGN KEY (transfer_id) REFERENCES transfers(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS scheduled_entries (
                id TEXT PRIMARY KEY,
                template TEXT NOT NULL,
                next_fire TEXT NOT NULL,
                recurrence TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_fired TEXT
            );

            CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                color TEXT NOT NULL,
                save_path TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transfers_status ON transfers(status);
            CREATE INDEX IF NOT EXISTS idx_transfers_category ON transfers(category_id);
            CREATE INDEX IF NOT EXISTS idx_segments_transfer ON segments(transfer_id);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Save or update a transfer together with its segment plan.
    pub async fn upsert_transfer(&self, task: &TransferTask) -> Result<(), PullmanError> {
        let mut tx = self.pool.begin().await?;

        let (source_kind, source_value) = source_columns(&task.source);

        sqlx::query(
            r#"
            INSERT INTO transfers (
                id, source_kind, source_value, kind, file_name, save_path,
                size, downloaded, status, priority, category_id,
                checksum_algo, checksum_value, retry_count, max_retries,
                speed_limit, error, created_at, completed_at, etag, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_kind = excluded.source_kind,
                source_value = excluded.source_value,
                kind = excluded.kind,
                file_name = excluded.file_name,
                save_path = excluded.save_path,
                size = excluded.size,
                downloaded = excluded.downloaded,
                status = excluded.status,
                priority = excluded.priority,
                category_id = excluded.category_id,
                checksum_algo = excluded.checksum_algo,
                checksum_value = excluded.checksum_value,
                retry_count = excluded.retry_count,
                max_retries = excluded.max_retries,
                speed_limit = excluded.speed_limit,
                error = excluded.error,
                completed_at = excluded.completed_at,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(task.id.to_string())
        .bind(source_kind)
        .bind(source_value)
        .bind(match task.kind {
            TransferKind::Http => "http",
            TransferKind::Torrent => "torrent",
        })
        .bind(&task.file_name)
        .bind(task.save_path.to_string_lossy().to_string())
        .bind(task.size.map(|s| s as i64))
        .bind(task.downloaded as i64)
        .bind(task.status.as_str())
        .bind(task.priority as i64)
        .bind(task.category_id.map(|id| id.to_string()))
        .bind(task.checksum.as_ref().map(|c| c.algorithm.as_str()))
        .bind(task.checksum.as_ref().map(|c| c.value.clone()))
        .bind(task.retry_count as i64)
        .bind(task.max_retries as i64)
        .bind(task.speed_limit.map(|s| s as i64))
        .bind(task.error.as_ref())
        .bind(task.created_at.to_rfc3339())
        .bind(task.completed_at.map(|d| d.to_rfc3339()))
        .bind(task.etag.as_ref())
        .bind(task.last_modified.as_ref())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM segments WHERE transfer_id = ?")
            .bind(task.id.to_string())
            .execute(&mut *tx)
            .await?;

        for segment in &task.segments {
            sqlx::query(
                r#"
                INSERT INTO segments (
                    transfer_id, segment_index, start_byte, end_byte,
                    downloaded_bytes, complete
                ) VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(task.id.to_string())
            .bind(segment.index as i64)
            .bind(segment.start as i64)
            .bind(segment.end as i64)
            .bind(segment.downloaded as i64)
            .bind(if segment.complete { 1i64 } else { 0i64 })
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load a transfer by id, with its segments.
    pub async fn load_transfer(&self, id: Uuid) -> Result<Option<TransferTask>, PullmanError> {
        let row = sqlx::query("SELECT * FROM transfers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let segments = self.load_segments(id).await?;
        Ok(Some(row_to_transfer(row, segments)?))
    }

    /// Load every transfer, segments fetched in one query.
    pub async fn load_all_transfers(&self) -> Result<Vec<TransferTask>, PullmanError> {
        let transfer_rows = sqlx::query("SELECT * FROM transfers ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        let segment_rows =
            sqlx::query("SELECT * FROM segments ORDER BY transfer_id, segment_index")
                .fetch_all(&self.pool)
                .await?;

        let mut segments_map: std::collections::HashMap<String, Vec<Segment>> =
            std::collections::HashMap::new();
        for row in segment_rows {
            let transfer_id: String = row.get("transfer_id");
            segments_map
                .entry(transfer_id)
                .or_default()
                .push(row_to_segment(&row));
        }

        let mut transfers = Vec::new();
        for row in transfer_rows {
            let id: String = row.get("id");
            let segments = segments_map.remove(&id).unwrap_or_default();
            transfers.push(row_to_transfer(row, segments)?);
        }

        Ok(transfers)
    }

    async fn load_segments(&self, transfer_id: Uuid) -> Result<Vec<Segment>, PullmanError> {
        let rows =
            sqlx::query("SELECT * FROM segments WHERE transfer_id = ? ORDER BY segment_index")
                .bind(transfer_id.to_string())
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.iter().map(row_to_segment).collect())
    }

    pub async fn update_segment_progress(
        &self,
        transfer_id: Uuid,
        segment_index: u32,
        downloaded_bytes: u64,
        complete: bool,
    ) -> Result<(), PullmanError> {
        sqlx::query(
            r#"
            UPDATE segments
            SET downloaded_bytes = ?, complete = ?
            WHERE transfer_id = ? AND segment_index = ?
            "#,
        )
        .bind(downloaded_bytes as i64)
        .bind(if complete { 1i64 } else { 0i64 })
        .bind(transfer_id.to_string())
        .bind(segment_index as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_transfer_progress(
        &self,
        transfer_id: Uuid,
        downloaded: u64,
    ) -> Result<(), PullmanError> {
        sqlx::query("UPDATE transfers SET downloaded = ? WHERE id = ?")
            .bind(downloaded as i64)
            .bind(transfer_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn update_transfer_status(
        &self,
        transfer_id: Uuid,
        status: TransferStatus,
        error: Option<String>,
    ) -> Result<(), PullmanError> {
        sqlx::query(
            r#"
            UPDATE transfers
            SET status = ?, error = ?,
                completed_at = CASE WHEN ? = 'completed' THEN datetime('now') ELSE completed_at END
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(status.as_str())
        .bind(transfer_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_transfer(&self, transfer_id: Uuid) -> Result<(), PullmanError> {
        sqlx::query("DELETE FROM transfers WHERE id = ?")
            .bind(transfer_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ========================================================================
    // Swarms
    // ========================================================================

    pub async fn upsert_swarm(&self, record: &SwarmRecord) -> Result<(), PullmanError> {
        let config = serde_json::to_string(&record.config)
            .map_err(|e| PullmanError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO swarms (
                info_hash, transfer_id, name, metainfo, magnet,
                bitfield, uploaded, downloaded, config
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(info_hash) DO UPDATE SET
                transfer_id = excluded.transfer_id,
                name = excluded.name,
                metainfo = excluded.metainfo,
                magnet = excluded.magnet,
                bitfield = excluded.bitfield,
                uploaded = excluded.uploaded,
                downloaded = excluded.downloaded,
                config = excluded.config
            "#,
        )
        .bind(hex::encode(record.info_hash))
        .bind(record.transfer_id.to_string())
        .bind(&record.name)
        .bind(record.metainfo.as_deref())
        .bind(record.magnet.as_ref())
        .bind(&record.bitfield)
        .bind(record.uploaded as i64)
        .bind(record.downloaded as i64)
        .bind(config)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_swarms(&self) -> Result<Vec<SwarmRecord>, PullmanError> {
        let rows = sqlx::query("SELECT * FROM swarms")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_swarm).collect()
    }

    pub async fn delete_swarm(&self, info_hash: &str) -> Result<(), PullmanError> {
        sqlx::query("DELETE FROM swarms WHERE info_hash = ?")
            .bind(info_hash)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ========================================================================
    // Scheduled entries
    // ========================================================================

    pub async fn upsert_scheduled(&self, entry: &ScheduledEntry) -> Result<(), PullmanError> {
        let template = serde_json::to_string(&entry.template)
            .map_err(|e| PullmanError::Serialization(e.to_string()))?;
        let recurrence = serde_json::to_string(&entry.recurrence)
            .map_err(|e| PullmanError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO scheduled_entries (
                id, template, next_fire, recurrence, enabled, created_at, last_fired
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                template = excluded.template,
                next_fire = excluded.next_fire,
                recurrence = excluded.recurrence,
                enabled = excluded.enabled,
                last_fired = excluded.last_fired
            "#,
        )
        .bind(entry.id.to_string())
        .bind(template)
        .bind(entry.next_fire.to_rfc3339())
        .bind(recurrence)
        .bind(if entry.enabled { 1i64 } else { 0i64 })
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.last_fired.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_scheduled(&self) -> Result<Vec<ScheduledEntry>, PullmanError> {
        let rows = sqlx::query("SELECT * FROM scheduled_entries ORDER BY next_fire")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_scheduled).collect()
    }

    pub async fn delete_scheduled(&self, id: Uuid) -> Result<(), PullmanError> {
        sqlx::query("DELETE FROM scheduled_entries WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ========================================================================
    // Categories
    // ========================================================================

    pub async fn upsert_category(&self, category: &Category) -> Result<(), PullmanError> {
        sqlx::query(
            r#"
            INSERT INTO categories (id, name, color, save_path, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                color = excluded.color,
                save_path = excluded.save_path
            "#,
        )
        .bind(category.id.to_string())
        .bind(&category.name)
        .bind(&category.color)
        .bind(
            category
                .save_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        )
        .bind(category.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_categories(&self) -> Result<Vec<Category>, PullmanError> {
        let rows = sqlx::query("SELECT * FROM categories ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_category).collect()
    }

    pub async fn delete_category(&self, id: Uuid) -> Result<(), PullmanError> {
        sqlx::query("DELETE FROM categories WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Reassign every task in `from` to the default category.
    pub async fn reassign_category(&self, from: Uuid, to: Uuid) -> Result<(), PullmanError> {
        sqlx::query("UPDATE transfers SET category_id = ? WHERE category_id = ?")
            .bind(to.to_string())
            .bind(from.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn source_columns(source: &TransferSource) -> (&'static str, String) {
    match source {
        TransferSource::Url(url) => ("url", url.clone()),
        TransferSource::Magnet(uri) => ("magnet", uri.clone()),
        TransferSource::TorrentFile(path) => ("file", path.to_string_lossy().to_string()),
    }
}

fn row_to_segment(row: &SqliteRow) -> Segment {
    Segment {
        index: row.get::<i64, _>("segment_index") as u32,
        start: row.get::<i64, _>("start_byte") as u64,
        end: row.get::<i64, _>("end_byte") as u64,
        downloaded: row.get::<i64, _>("downloaded_bytes") as u64,
        complete: row.get::<i64, _>("complete") != 0,
    }
}

fn row_to_transfer(row: SqliteRow, segments: Vec<Segment>) -> Result<TransferTask, PullmanError> {
    use chrono::{DateTime, Utc};
    use std::path::PathBuf;

    let source_kind: String = row.get("source_kind");
    let source_value: String = row.get("source_value");
    let source = match source_kind.as_str() {
        "url" => TransferSource::Url(source_value),
        "magnet" => TransferSource::Magnet(source_value),
        "file" => TransferSource::TorrentFile(PathBuf::from(source_value)),
        other => {
            return Err(PullmanError::Serialization(format!(
                "unknown source kind: {}",
                other
            )))
        }
    };

    let status_str: String = row.get("status");
    let status = TransferStatus::parse(&status_str).unwrap_or(TransferStatus::Queued);

    let checksum = match (
        row.get::<Option<String>, _>("checksum_algo"),
        row.get::<Option<String>, _>("checksum_value"),
    ) {
        (Some(algo), Some(value)) => ChecksumAlgorithm::parse(&algo)
            .map(|algorithm| ChecksumExpectation { algorithm, value }),
        _ => None,
    };

    Ok(TransferTask {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str())
            .map_err(|e| PullmanError::Serialization(e.to_string()))?,
        kind: source.kind(),
        source,
        file_name: row.get("file_name"),
        save_path: PathBuf::from(row.get::<String, _>("save_path")),
        size: row.get::<Option<i64>, _>("size").map(|s| s as u64),
        downloaded: row.get::<i64, _>("downloaded") as u64,
        status,
        segments,
        priority: row.get::<i64, _>("priority") as i32,
        category_id: row
            .get::<Option<String>, _>("category_id")
            .and_then(|s| Uuid::parse_str(&s).ok()),
        checksum,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        speed_limit: row.get::<Option<i64>, _>("speed_limit").map(|s| s as u64),
        error: row.get("error"),
        created_at: DateTime::parse_from_rfc3339(row.get::<String, _>("created_at").as_str())
            .map_err(|e| PullmanError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        etag: row.get("etag"),
        last_modified: row.get("last_modified"),
        speed: 0,
        eta: None,
    })
}

fn row_to_swarm(row: SqliteRow) -> Result<SwarmRecord, PullmanError> {
    let info_hash_hex: String = row.get("info_hash");
    let bytes =
        hex::decode(&info_hash_hex).map_err(|e| PullmanError::Serialization(e.to_string()))?;
    let info_hash: [u8; 20] = bytes
        .try_into()
        .map_err(|_| PullmanError::Serialization("info hash must be 20 bytes".into()))?;

    let config: SwarmConfig = serde_json::from_str(row.get::<String, _>("config").as_str())
        .map_err(|e| PullmanError::Serialization(e.to_string()))?;

    Ok(SwarmRecord {
        info_hash,
        transfer_id: Uuid::parse_str(row.get::<String, _>("transfer_id").as_str())
            .map_err(|e| PullmanError::Serialization(e.to_string()))?,
        name: row.get("name"),
        metainfo: row.get::<Option<Vec<u8>>, _>("metainfo"),
        magnet: row.get("magnet"),
        bitfield: row.get::<Vec<u8>, _>("bitfield"),
        uploaded: row.get::<i64, _>("uploaded") as u64,
        downloaded: row.get::<i64, _>("downloaded") as u64,
        config,
    })
}

fn row_to_scheduled(row: SqliteRow) -> Result<ScheduledEntry, PullmanError> {
    use chrono::{DateTime, Utc};

    let template: DownloadRequest = serde_json::from_str(row.get::<String, _>("template").as_str())
        .map_err(|e| PullmanError::Serialization(e.to_string()))?;
    let recurrence: RecurrenceRule =
        serde_json::from_str(row.get::<String, _>("recurrence").as_str())
            .map_err(|e| PullmanError::Serialization(e.to_string()))?;

    Ok(ScheduledEntry {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str())
            .map_err(|e| PullmanError::Serialization(e.to_string()))?,
        template,
        next_fire: DateTime::parse_from_rfc3339(row.get::<String, _>("next_fire").as_str())
            .map_err(|e| PullmanError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
        recurrence,
        enabled: row.get::<i64, _>("enabled") != 0,
        created_at: DateTime::parse_from_rfc3339(row.get::<String, _>("created_at").as_str())
            .map_err(|e| PullmanError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
        last_fired: row
            .get::<Option<String>, _>("last_fired")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

fn row_to_category(row: SqliteRow) -> Result<Category, PullmanError> {
    use chrono::{DateTime, Utc};
    use std::path::PathBuf;

    Ok(Category {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str())
            .map_err(|e| PullmanError::Serialization(e.to_string()))?,
        name: row.get("name"),
        color: row.get("color"),
        save_path: row.get::<Option<String>, _>("save_path").map(PathBuf::from),
        created_at: DateTime::parse_from_rfc3339(row.get::<String, _>("created_at").as_str())
            .map_err(|e| PullmanError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pullman_types::{RecurrenceRule, TransferSource};

    async fn store() -> (RecordStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("pullman.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn transfer_round_trip_preserves_segments() {
        let (store, _dir) = store().await;

        let mut task = TransferTask::new(
            TransferSource::Url("https://example.com/big.bin".into()),
            "/tmp".into(),
        );
        task.size = Some(400);
        task.segments = vec![
            Segment::new(0, 0, 99),
            Segment::new(1, 100, 199),
            Segment::new(2, 200, 299),
            Segment::new(3, 300, 399),
        ];
        store.upsert_transfer(&task).await.unwrap();

        let loaded = store.load_transfer(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.segments.len(), 4);
        assert_eq!(loaded.segments[3].end, 399);
        assert_eq!(loaded.status, TransferStatus::Queued);
        assert_eq!(loaded.size, Some(400));
    }

    #[tokio::test]
    async fn segment_progress_survives_reload() {
        let (store, _dir) = store().await;

        let mut task = TransferTask::new(
            TransferSource::Url("https://example.com/a".into()),
            "/tmp".into(),
        );
        task.segments = vec![Segment::new(0, 0, 999)];
        store.upsert_transfer(&task).await.unwrap();

        store
            .update_segment_progress(task.id, 0, 512, false)
            .await
            .unwrap();

        let loaded = store.load_transfer(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.segments[0].downloaded, 512);
        assert!(!loaded.segments[0].complete);
    }

    #[tokio::test]
    async fn scheduled_entry_round_trip() {
        let (store, _dir) = store().await;

        let entry = ScheduledEntry::new(
            DownloadRequest::new("https://example.com/nightly.iso"),
            chrono::Utc::now() + chrono::Duration::hours(1),
            RecurrenceRule::Daily,
        );
        store.upsert_scheduled(&entry).await.unwrap();

        let loaded = store.load_scheduled().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].recurrence, RecurrenceRule::Daily);
        assert!(loaded[0].enabled);
    }

    #[tokio::test]
    async fn category_reassignment_moves_tasks() {
        let (store, _dir) = store().await;

        let cat = Category::new("Movies".into());
        store.upsert_category(&cat).await.unwrap();

        let mut task = TransferTask::new(
            TransferSource::Url("https://example.com/movie".into()),
            "/tmp".into(),
        );
        task.category_id = Some(cat.id);
        store.upsert_transfer(&task).await.unwrap();

        store.reassign_category(cat.id, Uuid::nil()).await.unwrap();

        let loaded = store.load_transfer(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.category_id, Some(Uuid::nil()));
    }
}
