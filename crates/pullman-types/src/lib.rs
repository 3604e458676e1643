//! Shared types for Pullman
//!
//! This crate contains all the shared data structures used by the
//! download engine and its collaborators: the transfer record model,
//! torrent swarm state, schedule entries, categories, and the event
//! stream payloads.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use uuid::Uuid;

/// 20-byte BitTorrent info hash
pub type InfoHash = [u8; 20];

// ============================================================================
// Transfer Types
// ============================================================================

/// Transport family of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Http,
    Torrent,
}

/// Where a transfer's bytes come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum TransferSource {
    Url(String),
    Magnet(String),
    TorrentFile(PathBuf),
}

impl TransferSource {
    pub fn kind(&self) -> TransferKind {
        match self {
            TransferSource::Url(_) => TransferKind::Http,
            TransferSource::Magnet(_) | TransferSource::TorrentFile(_) => TransferKind::Torrent,
        }
    }
}

/// Status of a transfer task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Queued,
    Connecting,
    Downloading,
    Merging,
    Verifying,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// Whether a direct transition `self -> to` is legal.
    ///
    /// The machine is closed: Completed and Cancelled accept nothing,
    /// Failed accepts only a retry back to Queued.
    pub fn can_transition(self, to: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, to) {
            (Queued, Connecting) | (Queued, Cancelled) => true,
            (Connecting, Downloading)
            | (Connecting, Paused)
            | (Connecting, Failed)
            | (Connecting, Cancelled) => true,
            (Downloading, Merging)
            | (Downloading, Verifying)
            | (Downloading, Completed)
            | (Downloading, Paused)
            | (Downloading, Failed)
            | (Downloading, Cancelled) => true,
            (Merging, Verifying) | (Merging, Completed) | (Merging, Failed) | (Merging, Cancelled) => {
                true
            }
            (Verifying, Completed) | (Verifying, Failed) | (Verifying, Cancelled) => true,
            (Paused, Connecting) | (Paused, Cancelled) => true,
            (Failed, Queued) => true,
            (Completed, _) | (Cancelled, _) => false,
            _ => false,
        }
    }

    /// Active states hold a live worker context.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TransferStatus::Connecting
                | TransferStatus::Downloading
                | TransferStatus::Merging
                | TransferStatus::Verifying
        )
    }

    /// Terminal until explicitly removed (or retried, for Failed).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Queued => "queued",
            TransferStatus::Connecting => "connecting",
            TransferStatus::Downloading => "downloading",
            TransferStatus::Merging => "merging",
            TransferStatus::Verifying => "verifying",
            TransferStatus::Paused => "paused",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<TransferStatus> {
        Some(match s {
            "queued" => TransferStatus::Queued,
            "connecting" => TransferStatus::Connecting,
            "downloading" => TransferStatus::Downloading,
            "merging" => TransferStatus::Merging,
            "verifying" => TransferStatus::Verifying,
            "paused" => TransferStatus::Paused,
            "completed" => TransferStatus::Completed,
            "failed" => TransferStatus::Failed,
            "cancelled" => TransferStatus::Cancelled,
            _ => return None,
        })
    }
}

/// A contiguous byte range of a multi-part HTTP transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub index: u32,
    pub start: u64,
    /// Inclusive end offset. `u64::MAX` marks an unknown-size stream.
    pub end: u64,
    pub downloaded: u64,
    pub complete: bool,
}

impl Segment {
    pub fn new(index: u32, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            downloaded: 0,
            complete: false,
        }
    }

    pub fn is_unknown_size(&self) -> bool {
        self.end == u64::MAX
    }

    pub fn size(&self) -> u64 {
        if self.is_unknown_size() {
            u64::MAX
        } else {
            self.end - self.start + 1
        }
    }
}

/// Checksum algorithm for post-download verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn parse(s: &str) -> Option<ChecksumAlgorithm> {
        Some(match s.to_ascii_lowercase().as_str() {
            "md5" => ChecksumAlgorithm::Md5,
            "sha1" | "sha-1" => ChecksumAlgorithm::Sha1,
            "sha256" | "sha-256" => ChecksumAlgorithm::Sha256,
            _ => return None,
        })
    }
}

/// Expected checksum for a completed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumExpectation {
    pub algorithm: ChecksumAlgorithm,
    /// Lowercase hex digest
    pub value: String,
}

/// A single transfer task, HTTP or torrent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: Uuid,
    pub source: TransferSource,
    pub kind: TransferKind,
    pub file_name: String,
    pub save_path: PathBuf,
    pub size: Option<u64>,
    pub downloaded: u64,
    pub status: TransferStatus,
    pub segments: Vec<Segment>,
    pub priority: i32,
    pub category_id: Option<Uuid>,
    pub checksum: Option<ChecksumExpectation>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub speed_limit: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Validator captured at first probe; a change forces a restart
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Live fields, recomputed by the engine and never persisted as truth
    #[serde(default)]
    pub speed: u64,
    #[serde(default)]
    pub eta: Option<u64>,
}

impl TransferTask {
    pub fn new(source: TransferSource, save_path: PathBuf) -> Self {
        let kind = source.kind();
        let file_name = match &source {
            TransferSource::Url(url) => url
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("download")
                .to_string(),
            TransferSource::Magnet(_) => "magnet".to_string(),
            TransferSource::TorrentFile(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "torrent".to_string()),
        };

        Self {
            id: Uuid::new_v4(),
            source,
            kind,
            file_name,
            save_path,
            size: None,
            downloaded: 0,
            status: TransferStatus::Queued,
            segments: Vec::new(),
            priority: 0,
            category_id: None,
            checksum: None,
            retry_count: 0,
            max_retries: 5,
            speed_limit: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            etag: None,
            last_modified: None,
            speed: 0,
            eta: None,
        }
    }

    pub fn progress(&self) -> f64 {
        match self.size {
            Some(size) if size > 0 => (self.downloaded as f64 / size as f64) * 100.0,
            _ => 0.0,
        }
    }
}

/// Parameters for creating a new download; also the by-value template
/// stored inside a [`ScheduledEntry`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub save_path: Option<PathBuf>,
    pub file_name: Option<String>,
    pub segments: Option<u32>,
    pub max_retries: Option<u32>,
    pub checksum: Option<ChecksumExpectation>,
    pub category_id: Option<Uuid>,
    pub priority: Option<i32>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Live progress snapshot for one transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub id: Uuid,
    pub status: TransferStatus,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub speed: u64,
    pub eta: Option<u64>,
}

// ============================================================================
// Torrent Types
// ============================================================================

/// Whether unencrypted peer connections are attempted or accepted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionPolicy {
    Disabled,
    #[default]
    Optional,
    Required,
}

/// Per-swarm bandwidth ceilings in bytes per second (None = unlimited)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthLimit {
    pub download: Option<u64>,
    pub upload: Option<u64>,
}

/// Time-of-day / day-of-week window during which peer I/O is allowed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub enabled: bool,
    pub start: Option<NaiveTime>,
    pub stop: Option<NaiveTime>,
    #[serde(with = "weekday_vec_serde")]
    pub days: Vec<Weekday>,
}

impl ScheduleWindow {
    /// Whether peer I/O is allowed at the given local day/time.
    ///
    /// A disabled window, or one with no start/stop, is always open.
    /// Overnight windows (start > stop) wrap past midnight.
    pub fn is_open(&self, day: Weekday, time: NaiveTime) -> bool {
        if !self.enabled {
            return true;
        }
        if !self.days.is_empty() && !self.days.contains(&day) {
            return false;
        }
        match (self.start, self.stop) {
            (Some(start), Some(stop)) => {
                if start <= stop {
                    time >= start && time < stop
                } else {
                    time >= start || time < stop
                }
            }
            (Some(start), None) => time >= start,
            (None, Some(stop)) => time < stop,
            (None, None) => true,
        }
    }
}

/// Custom serialization for Vec<Weekday> to/from lowercase string array
mod weekday_vec_serde {
    use chrono::Weekday;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(days: &[Weekday], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(days.len()))?;
        for day in days {
            let day_str = match day {
                Weekday::Mon => "mon",
                Weekday::Tue => "tue",
                Weekday::Wed => "wed",
                Weekday::Thu => "thu",
                Weekday::Fri => "fri",
                Weekday::Sat => "sat",
                Weekday::Sun => "sun",
            };
            seq.serialize_element(day_str)?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Weekday>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let strings: Vec<String> = Vec::deserialize(deserializer)?;
        let mut days = Vec::with_capacity(strings.len());
        for s in strings {
            let day = match s.to_lowercase().as_str() {
                "mon" | "monday" => Weekday::Mon,
                "tue" | "tuesday" => Weekday::Tue,
                "wed" | "wednesday" => Weekday::Wed,
                "thu" | "thursday" => Weekday::Thu,
                "fri" | "friday" => Weekday::Fri,
                "sat" | "saturday" => Weekday::Sat,
                "sun" | "sunday" => Weekday::Sun,
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "Invalid weekday: {}",
                        other
                    )))
                }
            };
            days.push(day);
        }
        Ok(days)
    }
}

/// Runtime-reconfigurable swarm settings, applied without teardown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    pub priority: i32,
    pub bandwidth: BandwidthLimit,
    pub encryption: EncryptionPolicy,
    pub schedule: Option<ScheduleWindow>,
    pub web_seeds: Vec<String>,
    pub blocked_ips: HashSet<IpAddr>,
    pub seed_ratio_limit: Option<f64>,
    pub max_connections: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            priority: 0,
            bandwidth: BandwidthLimit::default(),
            encryption: EncryptionPolicy::default(),
            schedule: None,
            web_seeds: Vec::new(),
            blocked_ips: HashSet::new(),
            seed_ratio_limit: None,
            max_connections: 50,
        }
    }
}

/// Lifecycle state of one swarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentState {
    Connecting,
    Downloading,
    Seeding,
    /// Seed-ratio limit reached; data retained, no uploads
    Idle,
    Paused,
}

/// Live statistics for one swarm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentStats {
    pub info_hash: String,
    pub name: String,
    pub state: TorrentState,
    pub total_size: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub progress: f64,
    pub peer_count: usize,
    pub seeder_count: usize,
    pub piece_count: usize,
    pub pieces_have: usize,
}

/// Static description of a torrent's content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentMetadata {
    pub info_hash: String,
    pub name: String,
    pub piece_length: u64,
    pub piece_count: usize,
    pub total_size: u64,
    pub files: Vec<TorrentFileEntry>,
    pub trackers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentFileEntry {
    pub path: String,
    pub length: u64,
}

/// Combined static + live view of one swarm. Metadata and stats are
/// absent for magnet swarms that have not resolved yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentInfo {
    pub info_hash: String,
    pub name: String,
    pub metadata: Option<TorrentMetadata>,
    pub stats: Option<TorrentStats>,
    pub config: SwarmConfig,
}

// ============================================================================
// Scheduling Types
// ============================================================================

/// How a scheduled entry repeats after firing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "value", rename_all = "lowercase")]
pub enum RecurrenceRule {
    None,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    /// Fixed interval in seconds
    Every(u64),
}

/// A future transfer, fired by the time-based scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEntry {
    pub id: Uuid,
    pub template: DownloadRequest,
    pub next_fire: DateTime<Utc>,
    pub recurrence: RecurrenceRule,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_fired: Option<DateTime<Utc>>,
}

impl ScheduledEntry {
    pub fn new(template: DownloadRequest, next_fire: DateTime<Utc>, recurrence: RecurrenceRule) -> Self {
        Self {
            id: Uuid::new_v4(),
            template,
            next_fire,
            recurrence,
            enabled: true,
            created_at: Utc::now(),
            last_fired: None,
        }
    }
}

// ============================================================================
// Category Types
// ============================================================================

/// A pure lookup table entry referenced by id from tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    /// Overrides the default save path for tasks in this category
    pub save_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl Category {
    pub fn new(name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            color: "#3b82f6".to_string(),
            save_path: None,
            created_at: Utc::now(),
        }
    }

    /// The default category that always exists and cannot be deleted
    pub fn default_category() -> Self {
        Self {
            id: Uuid::nil(),
            name: "Default".to_string(),
            color: "#3b82f6".to_string(),
            save_path: None,
            created_at: Utc::now(),
        }
    }
}

/// Per-category rollup, recomputed from the task table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryStats {
    pub category_id: Uuid,
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub downloaded_bytes: u64,
}

// ============================================================================
// Derived Views
// ============================================================================

/// Engine-wide rollup, recomputed from the task table on demand
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total: usize,
    pub active: usize,
    pub queued: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub downloaded_bytes: u64,
    pub aggregate_speed: u64,
}

/// Admission queue snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    pub active_count: usize,
    pub queued_count: usize,
    pub max_concurrent: usize,
    pub aggregate_speed: u64,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub default_save_path: PathBuf,
    pub max_concurrent: usize,
    pub default_segments: u32,
    pub global_speed_limit: Option<u64>,
    /// Maximum number of automatic retries for transient failures
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries
    pub retry_base_delay_secs: u32,
    /// Zero-progress window before the stall self-heal kicks in
    pub stall_window_secs: u32,
    pub torrent_listen_port: u16,
    pub torrent_max_connections: usize,
    /// External media-extraction command (consumed, never implemented)
    pub extractor_command: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_save_path: dirs::download_dir()
                .map(|p| p.join("Pullman"))
                .unwrap_or_else(|| PathBuf::from(".")),
            max_concurrent: 4,
            default_segments: 4,
            global_speed_limit: None,
            max_retries: 5,
            retry_base_delay_secs: 2,
            stall_window_secs: 60,
            torrent_listen_port: 6881,
            torrent_max_connections: 50,
            extractor_command: None,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events published by the engine to all subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    DownloadAdded {
        task: TransferTask,
    },
    DownloadProgress {
        id: Uuid,
        downloaded: u64,
        total: Option<u64>,
        speed: u64,
        eta: Option<u64>,
    },
    DownloadStatusChanged {
        id: Uuid,
        status: TransferStatus,
        error: Option<String>,
    },
    DownloadCompleted {
        id: Uuid,
    },
    DownloadFailed {
        id: Uuid,
        error: String,
    },
    DownloadPaused {
        id: Uuid,
    },
    DownloadRemoved {
        id: Uuid,
    },
    FileDeleted {
        id: Uuid,
        path: PathBuf,
    },
    TorrentStats {
        stats: TorrentStats,
    },
    ScheduledFired {
        entry_id: Uuid,
        task_id: Uuid,
    },
    Warning {
        id: Option<Uuid>,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_no_transition() {
        use TransferStatus::*;
        for to in [
            Queued,
            Connecting,
            Downloading,
            Merging,
            Verifying,
            Paused,
            Failed,
            Cancelled,
        ] {
            assert!(!Completed.can_transition(to));
            assert!(!Cancelled.can_transition(to));
        }
    }

    #[test]
    fn failed_only_retries_to_queued() {
        use TransferStatus::*;
        assert!(Failed.can_transition(Queued));
        assert!(!Failed.can_transition(Downloading));
        assert!(!Failed.can_transition(Completed));
    }

    #[test]
    fn verify_path_reaches_completed() {
        use TransferStatus::*;
        assert!(Downloading.can_transition(Merging));
        assert!(Merging.can_transition(Verifying));
        assert!(Verifying.can_transition(Completed));
    }

    #[test]
    fn schedule_window_overnight_wraps() {
        let window = ScheduleWindow {
            enabled: true,
            start: NaiveTime::from_hms_opt(22, 0, 0),
            stop: NaiveTime::from_hms_opt(6, 0, 0),
            days: vec![],
        };
        assert!(window.is_open(Weekday::Mon, NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(window.is_open(Weekday::Mon, NaiveTime::from_hms_opt(3, 0, 0).unwrap()));
        assert!(!window.is_open(Weekday::Mon, NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn disabled_window_is_always_open() {
        let window = ScheduleWindow {
            enabled: false,
            start: NaiveTime::from_hms_opt(9, 0, 0),
            stop: NaiveTime::from_hms_opt(10, 0, 0),
            days: vec![Weekday::Mon],
        };
        assert!(window.is_open(Weekday::Sun, NaiveTime::from_hms_opt(15, 0, 0).unwrap()));
    }

    #[test]
    fn source_kind_mapping() {
        assert_eq!(
            TransferSource::Url("http://x/y".into()).kind(),
            TransferKind::Http
        );
        assert_eq!(
            TransferSource::Magnet("magnet:?xt=urn:btih:aa".into()).kind(),
            TransferKind::Torrent
        );
    }
}
