//! Swarm actor
//!
//! One task per torrent. Peers run in their own tasks and talk to the
//! swarm over channels: the swarm assigns pieces, writes verified data
//! to disk, and owns all shared state. Config changes arrive on a
//! watch channel and apply without tearing the swarm down.

use crate::engine::{RateLimiter, RecordStore};
use crate::error::PullmanError;
use crate::torrent::metainfo::{MagnetLink, Metainfo, BLOCK_SIZE};
use crate::torrent::peer::{Message, PeerConnection};
use crate::torrent::piece_picker::{Bitfield, PiecePicker};
use crate::torrent::SwarmRecord;
use chrono::{Datelike, Local};
use pullman_types::{
    CoreEvent, EncryptionPolicy, InfoHash, SwarmConfig, TorrentState, TorrentStats,
    TransferStatus,
};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

const STATS_INTERVAL: Duration = Duration::from_secs(1);
const MAINTAIN_INTERVAL: Duration = Duration::from_secs(15);
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);
const RATE_ALPHA: f64 = 0.3;

// ============================================================================
// Commands and channel payloads
// ============================================================================

#[derive(Debug)]
pub enum SwarmCommand {
    Pause,
    Resume,
    /// An inbound socket whose handshake the listener already read
    Inbound {
        stream: TcpStream,
        addr: SocketAddr,
        peer_id: [u8; 20],
        extensions: bool,
    },
    Shutdown {
        delete_data: bool,
    },
}

enum PeerEvent {
    Ready {
        addr: SocketAddr,
        actions: mpsc::Sender<PeerAction>,
    },
    Bitfield {
        addr: SocketAddr,
        bitfield: Bitfield,
    },
    Have {
        addr: SocketAddr,
        index: u32,
    },
    /// Peer is unchoked and idle; give it work
    NeedPiece {
        addr: SocketAddr,
    },
    /// SHA-1 verified piece, ready to write
    PieceDone {
        addr: SocketAddr,
        index: u32,
        data: Vec<u8>,
    },
    PieceFailed {
        addr: SocketAddr,
        index: u32,
    },
    Uploaded {
        bytes: u64,
    },
    MetadataPiece {
        piece: u32,
        total_size: u64,
        data: Vec<u8>,
    },
    Closed {
        addr: SocketAddr,
        assigned: Option<u32>,
    },
}

enum PeerAction {
    Assign {
        index: u32,
        size: u32,
        hash: [u8; 20],
    },
    Announce(u32),
    FetchMetadata,
    Close,
}

struct PeerHandle {
    actions: mpsc::Sender<PeerAction>,
    bitfield: Bitfield,
    assigned: Option<u32>,
}

// ============================================================================
// File store
// ============================================================================

/// Maps the flat piece space onto the torrent's content files.
pub(crate) struct FileStore {
    base: PathBuf,
    files: Vec<(PathBuf, u64, u64)>,
}

impl FileStore {
    fn new(base: PathBuf, meta: &Metainfo) -> Self {
        let files = meta
            .files
            .iter()
            .map(|f| (f.path.clone(), f.offset, f.length))
            .collect();
        Self { base, files }
    }

    async fn write_at(&self, mut offset: u64, data: &[u8]) -> Result<(), PullmanError> {
        let mut remaining = data;
        for (path, file_offset, length) in &self.files {
            if remaining.is_empty() {
                break;
            }
            let file_end = file_offset + length;
            if offset >= file_end {
                continue;
            }

            let within = offset - file_offset;
            let room = (length - within) as usize;
            let take = room.min(remaining.len());

            let full_path = self.base.join(path);
            if let Some(parent) = full_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .read(true)
                .open(&full_path)
                .await?;
            file.seek(std::io::SeekFrom::Start(within)).await?;
            file.write_all(&remaining[..take]).await?;
            file.flush().await?;

            remaining = &remaining[take..];
            offset += take as u64;
        }
        Ok(())
    }

    async fn read_at(&self, mut offset: u64, len: usize) -> Result<Vec<u8>, PullmanError> {
        let mut out = Vec::with_capacity(len);
        for (path, file_offset, length) in &self.files {
            if out.len() == len {
                break;
            }
            let file_end = file_offset + length;
            if offset >= file_end {
                continue;
            }

            let within = offset - file_offset;
            let room = (length - within) as usize;
            let take = room.min(len - out.len());

            let full_path = self.base.join(path);
            let mut file = tokio::fs::File::open(&full_path).await?;
            file.seek(std::io::SeekFrom::Start(within)).await?;
            let mut buf = vec![0u8; take];
            file.read_exact(&mut buf).await?;
            out.extend_from_slice(&buf);
            offset += take as u64;
        }
        Ok(out)
    }

    async fn delete_all(&self) {
        for (path, _, _) in &self.files {
            let full_path = self.base.join(path);
            let _ = tokio::fs::remove_file(&full_path).await;
        }
    }
}

// ============================================================================
// Tracker announce
// ============================================================================

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default)]
    peers: Option<ByteBuf>,
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
}

fn percent_encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        out.push('%');
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Parse BEP 23 compact peers: 6 bytes each, 4 of IPv4 + 2 of port.
fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|c| {
            let ip = std::net::Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::from((ip, port))
        })
        .collect()
}

async fn announce_http(
    client: &reqwest::Client,
    tracker: &str,
    info_hash: &InfoHash,
    peer_id: &[u8; 20],
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
) -> Result<(Vec<SocketAddr>, Option<Duration>), PullmanError> {
    let url = format!(
        "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        tracker,
        percent_encode_bytes(info_hash),
        percent_encode_bytes(peer_id),
        port,
        uploaded,
        downloaded,
        left,
    );

    let body = client
        .get(&url)
        .timeout(Duration::from_secs(20))
        .send()
        .await?
        .bytes()
        .await?;

    let response: TrackerResponse = serde_bencode::from_bytes(&body)
        .map_err(|e| PullmanError::Protocol(format!("bad tracker response: {}", e)))?;

    if let Some(reason) = response.failure_reason {
        return Err(PullmanError::Protocol(format!("tracker refused: {}", reason)));
    }

    let peers = response
        .peers
        .map(|p| parse_compact_peers(&p))
        .unwrap_or_default();
    let interval = response
        .interval
        .filter(|i| *i > 0)
        .map(|i| Duration::from_secs(i as u64));

    Ok((peers, interval))
}

// ============================================================================
// Metadata extension (BEP 9/10)
// ============================================================================

const OUR_UT_METADATA_ID: u8 = 3;
const METADATA_BLOCK: u64 = 16 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct ExtHandshake {
    m: ExtMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_size: Option<i64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExtMap {
    #[serde(default)]
    ut_metadata: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataMsg {
    msg_type: i64,
    piece: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<i64>,
}

/// Length of the leading bencoded value in `bytes`, so the raw
/// metadata payload after the header dict can be sliced off.
fn bencode_value_len(bytes: &[u8]) -> Option<usize> {
    fn value_len(bytes: &[u8], pos: usize) -> Option<usize> {
        match *bytes.get(pos)? {
            b'i' => {
                let end = bytes[pos..].iter().position(|&b| b == b'e')? + pos;
                Some(end + 1)
            }
            b'l' | b'd' => {
                let mut cursor = pos + 1;
                while *bytes.get(cursor)? != b'e' {
                    cursor = value_len(bytes, cursor)?;
                }
                Some(cursor + 1)
            }
            b'0'..=b'9' => {
                let colon = bytes[pos..].iter().position(|&b| b == b':')? + pos;
                let len: usize = std::str::from_utf8(&bytes[pos..colon]).ok()?.parse().ok()?;
                Some(colon + 1 + len)
            }
            _ => None,
        }
    }
    value_len(bytes, 0)
}

// ============================================================================
// Swarm
// ============================================================================

pub struct Swarm {
    info_hash: InfoHash,
    transfer_id: Uuid,
    name: String,
    save_path: PathBuf,
    peer_id: [u8; 20],
    listen_port: u16,

    meta: Option<Arc<Metainfo>>,
    store_files: Option<Arc<FileStore>>,
    picker: PiecePicker,
    magnet: Option<String>,
    trackers: Vec<String>,

    state: TorrentState,
    uploaded: u64,
    downloaded: u64,
    /// Raw bytes moved since the last stats tick
    tick_down: u64,
    tick_up: u64,
    down_rate: f64,
    up_rate: f64,

    config: SwarmConfig,
    config_rx: watch::Receiver<SwarmConfig>,
    down_limiter: RateLimiter,
    up_limiter: RateLimiter,

    peers: HashMap<SocketAddr, PeerHandle>,
    candidates: VecDeque<SocketAddr>,
    next_announce: Instant,
    /// Cleared while the schedule window is closed; peer tasks stop
    /// requesting and serving but stay connected.
    io_gate: Arc<AtomicBool>,

    /// Metadata fetch buffer for magnet swarms
    metadata_buf: Option<Vec<u8>>,

    command_rx: mpsc::Receiver<SwarmCommand>,
    peer_event_tx: mpsc::Sender<PeerEvent>,
    peer_event_rx: mpsc::Receiver<PeerEvent>,

    event_tx: broadcast::Sender<CoreEvent>,
    store: RecordStore,
    http: reqwest::Client,
}

impl Swarm {
    /// Build a swarm from its persisted record. Metadata-bearing
    /// records get a picker seeded from the saved bitfield; magnet
    /// records start empty and fetch metadata from peers.
    #[allow(clippy::too_many_arguments)]
    pub fn from_record(
        record: SwarmRecord,
        save_path: PathBuf,
        peer_id: [u8; 20],
        listen_port: u16,
        config_rx: watch::Receiver<SwarmConfig>,
        event_tx: broadcast::Sender<CoreEvent>,
        store: RecordStore,
    ) -> Result<(Self, mpsc::Sender<SwarmCommand>), PullmanError> {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (peer_event_tx, peer_event_rx) = mpsc::channel(256);

        let config = record.config.clone();
        let down_limiter = RateLimiter::from_limit(config.bandwidth.download);
        let up_limiter = RateLimiter::from_limit(config.bandwidth.upload);

        let (meta, store_files, mut picker, trackers) = match &record.metainfo {
            Some(raw) => {
                let meta = Arc::new(Metainfo::from_bytes(raw)?);
                let files = Arc::new(FileStore::new(save_path.clone(), &meta));
                let bitfield = Bitfield::from_bytes(&record.bitfield, meta.piece_count());
                let trackers = meta.trackers.clone();
                (
                    Some(meta),
                    Some(files),
                    PiecePicker::from_bitfield(bitfield),
                    trackers,
                )
            }
            None => {
                let magnet = record
                    .magnet
                    .as_deref()
                    .ok_or_else(|| PullmanError::Protocol("swarm has neither metainfo nor magnet".into()))?;
                let link = MagnetLink::parse(magnet)?;
                (None, None, PiecePicker::new(0), link.trackers)
            }
        };
        picker.set_priority(config.priority);

        let swarm = Self {
            info_hash: record.info_hash,
            transfer_id: record.transfer_id,
            name: record.name,
            save_path,
            peer_id,
            listen_port,
            meta,
            store_files,
            picker,
            magnet: record.magnet,
            trackers,
            state: TorrentState::Connecting,
            uploaded: record.uploaded,
            downloaded: record.downloaded,
            tick_down: 0,
            tick_up: 0,
            down_rate: 0.0,
            up_rate: 0.0,
            config,
            config_rx,
            down_limiter,
            up_limiter,
            peers: HashMap::new(),
            candidates: VecDeque::new(),
            next_announce: Instant::now(),
            io_gate: Arc::new(AtomicBool::new(true)),
            metadata_buf: None,
            command_rx,
            peer_event_tx,
            peer_event_rx,
            event_tx,
            store,
            http: reqwest::Client::new(),
        };

        Ok((swarm, command_tx))
    }

    pub async fn run(mut self) {
        info!("Swarm {} running: {}", hex::encode(self.info_hash), self.name);

        if self.picker.is_complete() && self.meta.is_some() {
            self.state = TorrentState::Seeding;
        }

        let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
        let mut maintain_tick = tokio::time::interval(MAINTAIN_INTERVAL);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                Some(cmd) = self.command_rx.recv() => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Some(event) = self.peer_event_rx.recv() => {
                    self.handle_peer_event(event).await;
                }
                changed = self.config_rx.changed() => {
                    if changed.is_ok() {
                        let config = self.config_rx.borrow().clone();
                        self.apply_config(config).await;
                    }
                }
                _ = stats_tick.tick() => {
                    ticks += 1;
                    self.update_rates();
                    self.emit_stats();
                    if ticks % 10 == 0 {
                        self.persist().await;
                    }
                }
                _ = maintain_tick.tick() => {
                    self.maintain().await;
                }
            }
        }

        self.persist().await;
        info!("Swarm {} stopped", hex::encode(self.info_hash));
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    /// Returns true when the swarm should shut down.
    async fn handle_command(&mut self, cmd: SwarmCommand) -> bool {
        match cmd {
            SwarmCommand::Pause => {
                self.state = TorrentState::Paused;
                self.disconnect_all().await;
                self.persist().await;
                false
            }
            SwarmCommand::Resume => {
                if self.state == TorrentState::Paused {
                    self.state = if self.picker.is_complete() && self.meta.is_some() {
                        TorrentState::Seeding
                    } else {
                        TorrentState::Connecting
                    };
                    self.next_announce = Instant::now();
                }
                false
            }
            SwarmCommand::Inbound {
                stream,
                addr,
                peer_id,
                extensions,
            } => {
                self.accept_inbound(stream, addr, peer_id, extensions);
                false
            }
            SwarmCommand::Shutdown { delete_data } => {
                self.disconnect_all().await;
                if delete_data {
                    if let Some(files) = &self.store_files {
                        files.delete_all().await;
                    }
                }
                true
            }
        }
    }

    fn accept_inbound(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        peer_id: [u8; 20],
        extensions: bool,
    ) {
        if matches!(self.state, TorrentState::Paused | TorrentState::Idle) {
            debug!("Dropping inbound peer {}: swarm not accepting", addr);
            return;
        }
        if self.config.blocked_ips.contains(&addr.ip()) {
            debug!("Dropping inbound peer {}: blocklisted", addr);
            return;
        }
        if self.peers.len() >= self.config.max_connections {
            debug!("Dropping inbound peer {}: at connection cap", addr);
            return;
        }

        let piece_count = self.meta.as_ref().map(|m| m.piece_count()).unwrap_or(0);
        let conn = PeerConnection::adopt(stream, addr, peer_id, extensions, piece_count);
        self.spawn_peer_task(conn);
    }

    // ------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Ready { addr, actions } => {
                let piece_count = self.meta.as_ref().map(|m| m.piece_count()).unwrap_or(0);
                if self.meta.is_none() {
                    let _ = actions.try_send(PeerAction::FetchMetadata);
                }
                self.peers.insert(
                    addr,
                    PeerHandle {
                        actions,
                        bitfield: Bitfield::new(piece_count),
                        assigned: None,
                    },
                );
                if self.state == TorrentState::Connecting && self.meta.is_some() {
                    self.state = TorrentState::Downloading;
                }
            }
            PeerEvent::Bitfield { addr, bitfield } => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    self.picker.peer_left(&handle.bitfield);
                    self.picker.peer_joined(&bitfield);
                    handle.bitfield = bitfield;
                }
            }
            PeerEvent::Have { addr, index } => {
                if let Some(handle) = self.peers.get_mut(&addr) {
                    if !handle.bitfield.has(index as usize) {
                        handle.bitfield.set(index as usize);
                        self.picker.peer_has(index as usize);
                    }
                }
            }
            PeerEvent::NeedPiece { addr } => {
                self.assign_work(addr).await;
            }
            PeerEvent::PieceDone { addr, index, data } => {
                self.on_piece_done(addr, index, data).await;
            }
            PeerEvent::PieceFailed { addr, index } => {
                warn!("Piece {} failed from {}", index, addr);
                self.picker.unassign(index as usize);
                if let Some(handle) = self.peers.get_mut(&addr) {
                    handle.assigned = None;
                    // A peer that serves bad data gets cut.
                    let _ = handle.actions.try_send(PeerAction::Close);
                }
            }
            PeerEvent::Uploaded { bytes } => {
                self.uploaded += bytes;
                self.tick_up += bytes;
            }
            PeerEvent::MetadataPiece {
                piece,
                total_size,
                data,
            } => {
                self.on_metadata_piece(piece, total_size, data).await;
            }
            PeerEvent::Closed { addr, assigned } => {
                if let Some(handle) = self.peers.remove(&addr) {
                    self.picker.peer_left(&handle.bitfield);
                }
                if let Some(index) = assigned {
                    self.picker.unassign(index as usize);
                }
            }
        }
    }

    async fn assign_work(&mut self, addr: SocketAddr) {
        let Some(meta) = self.meta.clone() else {
            return;
        };
        if self.state != TorrentState::Downloading || !self.peer_io_allowed() {
            return;
        }
        let Some(handle) = self.peers.get_mut(&addr) else {
            return;
        };
        if handle.assigned.is_some() {
            return;
        }

        if let Some(index) = self.picker.pick(&handle.bitfield) {
            let sent = handle.actions.try_send(PeerAction::Assign {
                index: index as u32,
                size: meta.piece_size(index) as u32,
                hash: meta.piece_hashes[index],
            });
            match sent {
                Ok(()) => handle.assigned = Some(index as u32),
                Err(_) => {
                    // Channel full or peer gone; hand the piece back
                    // so another peer can take it.
                    self.picker.unassign(index);
                }
            }
        }
    }

    async fn on_piece_done(&mut self, addr: SocketAddr, index: u32, data: Vec<u8>) {
        let Some(meta) = self.meta.clone() else {
            return;
        };
        if self.picker.has(index as usize) {
            return;
        }

        let offset = index as u64 * meta.piece_length;
        if let Some(files) = &self.store_files {
            if let Err(e) = files.write_at(offset, &data).await {
                warn!("Could not write piece {}: {}", index, e);
                self.picker.unassign(index as usize);
                return;
            }
        }

        self.picker.mark_have(index as usize);
        self.downloaded += data.len() as u64;
        self.tick_down += data.len() as u64;

        if let Some(handle) = self.peers.get_mut(&addr) {
            handle.assigned = None;
        }
        for handle in self.peers.values() {
            let _ = handle.actions.try_send(PeerAction::Announce(index));
        }

        let _ = self.event_tx.send(CoreEvent::DownloadProgress {
            id: self.transfer_id,
            downloaded: self.downloaded,
            total: Some(meta.total_size),
            speed: self.down_rate as u64,
            eta: None,
        });

        if self.picker.is_complete() {
            self.on_complete().await;
        } else {
            self.assign_work(addr).await;
        }
    }

    async fn on_complete(&mut self) {
        info!("Swarm {} complete: {}", hex::encode(self.info_hash), self.name);
        self.state = TorrentState::Seeding;
        self.persist().await;

        if let Err(e) = self
            .store
            .update_transfer_status(self.transfer_id, TransferStatus::Completed, None)
            .await
        {
            warn!("Could not persist completion: {}", e);
        }
        let _ = self.event_tx.send(CoreEvent::DownloadStatusChanged {
            id: self.transfer_id,
            status: TransferStatus::Completed,
            error: None,
        });
        let _ = self
            .event_tx
            .send(CoreEvent::DownloadCompleted { id: self.transfer_id });
    }

    // ------------------------------------------------------------------
    // Metadata exchange
    // ------------------------------------------------------------------

    async fn on_metadata_piece(&mut self, piece: u32, total_size: u64, data: Vec<u8>) {
        if self.meta.is_some() || total_size == 0 || total_size > 16 * 1024 * 1024 {
            return;
        }

        let buf = self
            .metadata_buf
            .get_or_insert_with(|| vec![0u8; total_size as usize]);
        if buf.len() != total_size as usize {
            return;
        }

        let start = piece as u64 * METADATA_BLOCK;
        let end = (start + data.len() as u64).min(total_size);
        if start >= total_size {
            return;
        }
        buf[start as usize..end as usize]
            .copy_from_slice(&data[..(end - start) as usize]);

        let expected_pieces = total_size.div_ceil(METADATA_BLOCK);
        let last_start = (expected_pieces - 1) * METADATA_BLOCK;
        // Completion check: the final write that touches the tail.
        if end == total_size && start >= last_start {
            let buf = match self.metadata_buf.take() {
                Some(b) => b,
                None => return,
            };
            let digest: InfoHash = Sha1::digest(&buf).into();
            if digest != self.info_hash {
                warn!("Fetched metadata fails its hash, retrying");
                return;
            }
            match Metainfo::from_info_dict(&buf, self.trackers.clone()) {
                Ok(meta) => self.adopt_metadata(meta).await,
                Err(e) => warn!("Fetched metadata does not parse: {}", e),
            }
        }
    }

    async fn adopt_metadata(&mut self, meta: Metainfo) {
        info!(
            "Swarm {} resolved metadata: {} pieces, {} bytes",
            hex::encode(self.info_hash),
            meta.piece_count(),
            meta.total_size
        );

        let meta = Arc::new(meta);
        self.name = meta.name.clone();
        self.picker = PiecePicker::new(meta.piece_count());
        self.picker.set_priority(self.config.priority);
        self.store_files = Some(Arc::new(FileStore::new(self.save_path.clone(), &meta)));
        self.meta = Some(meta);
        self.state = TorrentState::Downloading;
        self.persist().await;

        // Peers connected pre-metadata carry stale zero-length
        // bitfields; reconnecting is simpler than resyncing them.
        self.disconnect_all().await;
        self.next_announce = Instant::now();
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    async fn apply_config(&mut self, config: SwarmConfig) {
        self.down_limiter.set_limit(config.bandwidth.download).await;
        self.up_limiter.set_limit(config.bandwidth.upload).await;
        self.picker.set_priority(config.priority);

        // A widened blocklist applies to live connections.
        let blocked: Vec<SocketAddr> = self
            .peers
            .keys()
            .filter(|a| config.blocked_ips.contains(&a.ip()))
            .copied()
            .collect();
        for addr in blocked {
            if let Some(handle) = self.peers.get(&addr) {
                let _ = handle.actions.try_send(PeerAction::Close);
            }
        }

        self.config = config;
        self.persist().await;
    }

    /// Whether the schedule window and lifecycle state allow peer I/O.
    fn peer_io_allowed(&self) -> bool {
        if matches!(self.state, TorrentState::Paused | TorrentState::Idle) {
            return false;
        }
        if let Some(window) = &self.config.schedule {
            let now = Local::now();
            if !window.is_open(now.weekday(), now.time()) {
                return false;
            }
        }
        true
    }

    async fn maintain(&mut self) {
        // Schedule gate: a closed window suspends peer I/O but keeps
        // the peer set connected, so reopening needs no re-handshake.
        if !self.peer_io_allowed() {
            if self.io_gate.swap(false, Ordering::AcqRel) {
                debug!(
                    "Swarm {} window closed, suspending peer I/O",
                    hex::encode(self.info_hash)
                );
            }
            return;
        }
        if !self.io_gate.swap(true, Ordering::AcqRel) {
            debug!(
                "Swarm {} window open, resuming peer I/O",
                hex::encode(self.info_hash)
            );
            let idle: Vec<SocketAddr> = self
                .peers
                .iter()
                .filter(|(_, h)| h.assigned.is_none())
                .map(|(a, _)| *a)
                .collect();
            for addr in idle {
                self.assign_work(addr).await;
            }
        }

        // Seed-ratio demotion.
        if self.state == TorrentState::Seeding {
            if let (Some(limit), Some(ratio)) = (
                self.config.seed_ratio_limit,
                seed_ratio(self.uploaded, self.downloaded),
            ) {
                if ratio >= limit {
                    info!(
                        "Swarm {} hit seed ratio {:.2}, idling",
                        hex::encode(self.info_hash),
                        ratio
                    );
                    self.state = TorrentState::Idle;
                    self.disconnect_all().await;
                    self.persist().await;
                    return;
                }
            }
        }

        if self.config.encryption == EncryptionPolicy::Required {
            // Plaintext is the only implemented transport; a Required
            // policy therefore refuses every peer.
            if !self.peers.is_empty() {
                self.disconnect_all().await;
            }
            return;
        }

        if self.next_announce <= Instant::now() {
            self.announce().await;
        }

        self.dial_candidates();
        self.web_seed_fallback().await;
    }

    async fn announce(&mut self) {
        let left = self
            .meta
            .as_ref()
            .map(|m| m.total_size.saturating_sub(self.downloaded))
            .unwrap_or(u64::MAX);

        let mut interval = ANNOUNCE_INTERVAL;
        for tracker in self.trackers.clone() {
            if !tracker.starts_with("http") {
                continue;
            }
            match announce_http(
                &self.http,
                &tracker,
                &self.info_hash,
                &self.peer_id,
                self.listen_port,
                self.uploaded,
                self.downloaded,
                left,
            )
            .await
            {
                Ok((peers, tracker_interval)) => {
                    debug!("Tracker {} returned {} peers", tracker, peers.len());
                    for addr in peers {
                        if !self.candidates.contains(&addr) && !self.peers.contains_key(&addr) {
                            self.candidates.push_back(addr);
                        }
                    }
                    if let Some(i) = tracker_interval {
                        interval = interval.min(i);
                    }
                }
                Err(e) => debug!("Tracker {} announce failed: {}", tracker, e),
            }
        }
        self.next_announce = Instant::now() + interval;
    }

    fn dial_candidates(&mut self) {
        if self.state == TorrentState::Seeding {
            // Seeders wait for inbound interest.
            return;
        }
        while self.peers.len() < self.config.max_connections {
            let Some(addr) = self.candidates.pop_front() else {
                break;
            };
            if self.config.blocked_ips.contains(&addr.ip()) || self.peers.contains_key(&addr) {
                continue;
            }

            let info_hash = self.info_hash;
            let peer_id = self.peer_id;
            let piece_count = self.meta.as_ref().map(|m| m.piece_count()).unwrap_or(0);
            let events = self.peer_event_tx.clone();
            let have = self.picker.have().clone();
            let down = self.down_limiter.clone();
            let up = self.up_limiter.clone();
            let files = self.store_files.clone();
            let meta = self.meta.clone();
            let gate = self.io_gate.clone();

            tokio::spawn(async move {
                match PeerConnection::dial(addr, &info_hash, &peer_id, piece_count).await {
                    Ok(conn) => {
                        peer_task(conn, have, meta, files, down, up, gate, events).await;
                    }
                    Err(e) => {
                        debug!("Dial {} failed: {}", addr, e);
                        // Free the reserved slot.
                        let _ = events
                            .send(PeerEvent::Closed {
                                addr,
                                assigned: None,
                            })
                            .await;
                    }
                }
            });

            // Reserve the slot optimistically; Ready replaces it.
            self.peers.insert(
                addr,
                PeerHandle {
                    actions: mpsc::channel(1).0,
                    bitfield: Bitfield::new(piece_count),
                    assigned: None,
                },
            );
        }
    }

    fn spawn_peer_task(&mut self, conn: PeerConnection) {
        let have = self.picker.have().clone();
        let meta = self.meta.clone();
        let files = self.store_files.clone();
        let down = self.down_limiter.clone();
        let up = self.up_limiter.clone();
        let gate = self.io_gate.clone();
        let events = self.peer_event_tx.clone();
        tokio::spawn(async move {
            peer_task(conn, have, meta, files, down, up, gate, events).await;
        });
    }

    /// When no peer has shown up, pull one pending piece from a web
    /// seed over a plain ranged GET (single-file layout only).
    async fn web_seed_fallback(&mut self) {
        let Some(meta) = self.meta.clone() else {
            return;
        };
        if self.state != TorrentState::Downloading
            || !self.peers.is_empty()
            || self.config.web_seeds.is_empty()
            || meta.files.len() != 1
        {
            return;
        }

        let mut everything = Bitfield::new(meta.piece_count());
        for i in 0..meta.piece_count() {
            everything.set(i);
        }
        let Some(index) = self.picker.pick(&everything) else {
            return;
        };

        let start = index as u64 * meta.piece_length;
        let size = meta.piece_size(index);
        let end = start + size - 1;

        for seed in self.config.web_seeds.clone() {
            let result = self
                .http
                .get(&seed)
                .header(reqwest::header::RANGE, format!("bytes={}-{}", start, end))
                .timeout(Duration::from_secs(60))
                .send()
                .await
                .and_then(|r| r.error_for_status());

            let bytes = match result {
                Ok(response) => match response.bytes().await {
                    Ok(b) => b,
                    Err(e) => {
                        debug!("Web seed {} read failed: {}", seed, e);
                        continue;
                    }
                },
                Err(e) => {
                    debug!("Web seed {} refused: {}", seed, e);
                    continue;
                }
            };

            if bytes.len() as u64 != size {
                debug!("Web seed {} returned short piece {}", seed, index);
                continue;
            }
            let digest: [u8; 20] = Sha1::digest(&bytes).into();
            if digest != meta.piece_hashes[index] {
                warn!("Web seed {} served a bad piece {}", seed, index);
                continue;
            }

            self.down_limiter.acquire(size).await;
            let addr: SocketAddr = ([0, 0, 0, 0], 0).into();
            self.on_piece_done(addr, index as u32, bytes.to_vec()).await;
            return;
        }

        self.picker.unassign(index);
    }

    async fn disconnect_all(&mut self) {
        for handle in self.peers.values() {
            let _ = handle.actions.try_send(PeerAction::Close);
        }
        self.peers.clear();
        // Availability resets with the peer set.
        let have = self.picker.have().clone();
        debug!("Disconnected all peers ({} pieces kept)", have.count());
        self.picker = PiecePicker::from_bitfield(have);
        self.picker.set_priority(self.config.priority);
    }

    // ------------------------------------------------------------------
    // Stats and persistence
    // ------------------------------------------------------------------

    fn update_rates(&mut self) {
        self.down_rate = RATE_ALPHA * self.tick_down as f64 + (1.0 - RATE_ALPHA) * self.down_rate;
        self.up_rate = RATE_ALPHA * self.tick_up as f64 + (1.0 - RATE_ALPHA) * self.up_rate;
        self.tick_down = 0;
        self.tick_up = 0;
    }

    fn emit_stats(&self) {
        let (total_size, piece_count) = self
            .meta
            .as_ref()
            .map(|m| (m.total_size, m.piece_count()))
            .unwrap_or((0, 0));
        let pieces_have = self.picker.pieces_have();
        let progress = if piece_count > 0 {
            pieces_have as f64 / piece_count as f64 * 100.0
        } else {
            0.0
        };

        let _ = self.event_tx.send(CoreEvent::TorrentStats {
            stats: TorrentStats {
                info_hash: hex::encode(self.info_hash),
                name: self.name.clone(),
                state: self.state,
                total_size,
                downloaded: self.downloaded,
                uploaded: self.uploaded,
                download_rate: self.down_rate as u64,
                upload_rate: self.up_rate as u64,
                progress,
                peer_count: self.peers.len(),
                seeder_count: self
                    .peers
                    .values()
                    .filter(|p| p.bitfield.is_complete() && !p.bitfield.is_empty())
                    .count(),
                piece_count,
                pieces_have,
            },
        });
    }

    async fn persist(&self) {
        let record = SwarmRecord {
            info_hash: self.info_hash,
            transfer_id: self.transfer_id,
            name: self.name.clone(),
            metainfo: self.meta.as_ref().map(|m| m.raw.clone()),
            magnet: self.magnet.clone(),
            bitfield: self.picker.have().as_bytes().to_vec(),
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            config: self.config.clone(),
        };
        if let Err(e) = self.store.upsert_swarm(&record).await {
            warn!("Could not persist swarm {}: {}", hex::encode(self.info_hash), e);
        }
    }
}

/// Seed ratio as uploaded over downloaded; undefined until the swarm
/// has downloaded anything.
fn seed_ratio(uploaded: u64, downloaded: u64) -> Option<f64> {
    (downloaded > 0).then(|| uploaded as f64 / downloaded as f64)
}

// ============================================================================
// Peer task
// ============================================================================

struct PieceInProgress {
    index: u32,
    size: u32,
    hash: [u8; 20],
    buf: Vec<u8>,
    received: u32,
    requested: bool,
}

/// Runs one peer connection to completion. Verified pieces flow back
/// to the swarm; requests are served straight from the file store.
/// While the swarm's I/O gate is cleared the connection stays up but
/// neither requests nor serves blocks.
#[allow(clippy::too_many_arguments)]
async fn peer_task(
    mut conn: PeerConnection,
    our_have: Bitfield,
    meta: Option<Arc<Metainfo>>,
    files: Option<Arc<FileStore>>,
    down_limiter: RateLimiter,
    up_limiter: RateLimiter,
    io_gate: Arc<AtomicBool>,
    events: mpsc::Sender<PeerEvent>,
) {
    let addr = conn.addr;
    let (action_tx, mut action_rx) = mpsc::channel::<PeerAction>(32);

    if events
        .send(PeerEvent::Ready {
            addr,
            actions: action_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    if !our_have.is_empty() {
        let _ = conn.send(Message::Bitfield(our_have.as_bytes().to_vec())).await;
    }
    if meta.is_some() {
        let _ = conn.send(Message::Interested).await;
    }

    let mut current: Option<PieceInProgress> = None;
    let mut their_metadata_id: Option<u8> = None;
    let mut metadata_size: Option<u64> = None;
    let mut assigned_for_close: Option<u32> = None;

    loop {
        tokio::select! {
            action = action_rx.recv() => {
                match action {
                    Some(PeerAction::Assign { index, size, hash }) => {
                        assigned_for_close = Some(index);
                        current = Some(PieceInProgress {
                            index,
                            size,
                            hash,
                            buf: vec![0u8; size as usize],
                            received: 0,
                            requested: false,
                        });
                        if !conn.peer_choking {
                            if request_blocks(&mut conn, current.as_mut()).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(PeerAction::Announce(index)) => {
                        if conn.send(Message::Have(index)).await.is_err() {
                            break;
                        }
                    }
                    Some(PeerAction::FetchMetadata) => {
                        if conn.supports_extensions {
                            let handshake = ExtHandshake {
                                m: ExtMap { ut_metadata: Some(OUR_UT_METADATA_ID as i64) },
                                metadata_size: None,
                            };
                            if let Ok(payload) = serde_bencode::to_bytes(&handshake) {
                                if conn.send(Message::Extended { id: 0, payload }).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(PeerAction::Close) | None => break,
                }
            }
            msg = conn.recv() => {
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        debug!("Peer {} closed: {}", addr, e);
                        break;
                    }
                };
                match msg {
                    Message::Unchoke => {
                        if io_gate.load(Ordering::Acquire) {
                            if request_blocks(&mut conn, current.as_mut()).await.is_err() {
                                break;
                            }
                            if current.is_none()
                                && events.send(PeerEvent::NeedPiece { addr }).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Choke => {}
                    Message::Interested => {
                        // Simple reciprocation: everyone interested is
                        // unchoked.
                        if conn.send(Message::Unchoke).await.is_err() {
                            break;
                        }
                    }
                    Message::Bitfield(_) => {
                        let bitfield = conn.bitfield.clone();
                        if events.send(PeerEvent::Bitfield { addr, bitfield }).await.is_err() {
                            break;
                        }
                        if !conn.peer_choking
                            && current.is_none()
                            && events.send(PeerEvent::NeedPiece { addr }).await.is_err() {
                            break;
                        }
                    }
                    Message::Have(index) => {
                        if events.send(PeerEvent::Have { addr, index }).await.is_err() {
                            break;
                        }
                    }
                    Message::Piece { index, begin, block } => {
                        down_limiter.acquire(block.len() as u64).await;
                        let mut done = false;
                        if let Some(piece) = current.as_mut() {
                            if piece.index == index
                                && (begin as usize + block.len()) <= piece.buf.len()
                            {
                                piece.buf[begin as usize..begin as usize + block.len()]
                                    .copy_from_slice(&block);
                                piece.received += block.len() as u32;
                                done = piece.received >= piece.size;
                            }
                        }
                        if done {
                            let piece = match current.take() {
                                Some(p) => p,
                                None => break,
                            };
                            assigned_for_close = None;
                            let digest: [u8; 20] = Sha1::digest(&piece.buf).into();
                            let event = if digest == piece.hash {
                                PeerEvent::PieceDone {
                                    addr,
                                    index: piece.index,
                                    data: piece.buf,
                                }
                            } else {
                                PeerEvent::PieceFailed {
                                    addr,
                                    index: piece.index,
                                }
                            };
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Request { index, begin, length } => {
                        if length > BLOCK_SIZE * 8 {
                            debug!("Peer {} requested oversized block", addr);
                            break;
                        }
                        if !io_gate.load(Ordering::Acquire) {
                            debug!("Holding block for {}: transfer window closed", addr);
                            continue;
                        }
                        if let (Some(meta), Some(files)) = (&meta, &files) {
                            // Peers only request pieces we announced,
                            // so serve straight from disk.
                            let offset = index as u64 * meta.piece_length + begin as u64;
                            match files.read_at(offset, length as usize).await {
                                Ok(block) => {
                                    up_limiter.acquire(block.len() as u64).await;
                                    let sent = block.len() as u64;
                                    if conn.send(Message::Piece { index, begin, block }).await.is_err() {
                                        break;
                                    }
                                    if events.send(PeerEvent::Uploaded { bytes: sent }).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    debug!("Could not serve block to {}: {}", addr, e);
                                }
                            }
                        }
                    }
                    Message::Extended { id: 0, payload } => {
                        if let Ok(hs) = serde_bencode::from_bytes::<ExtHandshake>(&payload) {
                            their_metadata_id = hs.m.ut_metadata.map(|i| i as u8);
                            metadata_size = hs.metadata_size.filter(|s| *s > 0).map(|s| s as u64);
                            if let (Some(ext_id), Some(size)) = (their_metadata_id, metadata_size) {
                                if meta.is_none() {
                                    let pieces = size.div_ceil(METADATA_BLOCK);
                                    for piece in 0..pieces {
                                        let req = MetadataMsg {
                                            msg_type: 0,
                                            piece: piece as i64,
                                            total_size: None,
                                        };
                                        if let Ok(payload) = serde_bencode::to_bytes(&req) {
                                            if conn.send(Message::Extended { id: ext_id, payload }).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Message::Extended { id: OUR_UT_METADATA_ID, payload } => {
                        if let Some(header_len) = bencode_value_len(&payload) {
                            if let Ok(header) =
                                serde_bencode::from_bytes::<MetadataMsg>(&payload[..header_len])
                            {
                                if header.msg_type == 1 {
                                    let total = header
                                        .total_size
                                        .map(|s| s.max(0) as u64)
                                        .or(metadata_size)
                                        .unwrap_or(0);
                                    let data = payload[header_len..].to_vec();
                                    if events
                                        .send(PeerEvent::MetadataPiece {
                                            piece: header.piece.max(0) as u32,
                                            total_size: total,
                                            data,
                                        })
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Message::Extended { .. } | Message::KeepAlive | Message::NotInterested
                    | Message::Cancel { .. } => {}
                }
            }
        }
    }

    let _ = events
        .send(PeerEvent::Closed {
            addr,
            assigned: assigned_for_close,
        })
        .await;
}

/// Fire the block requests for the piece in flight, once.
async fn request_blocks(
    conn: &mut PeerConnection,
    current: Option<&mut PieceInProgress>,
) -> Result<(), PullmanError> {
    let Some(piece) = current else {
        return Ok(());
    };
    if piece.requested {
        return Ok(());
    }
    piece.requested = true;

    let mut begin = 0u32;
    while begin < piece.size {
        let length = BLOCK_SIZE.min(piece.size - begin);
        conn.send(Message::Request {
            index: piece.index,
            begin,
            length,
        })
        .await?;
        begin += length;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo::FileSlice;
    use chrono::NaiveTime;
    use pullman_types::ScheduleWindow;

    fn tiny_torrent() -> Vec<u8> {
        let mut info = Vec::new();
        info.extend_from_slice(b"d6:lengthi32e4:name5:t.bin12:piece lengthi32768e6:pieces20:");
        info.extend_from_slice(&[0u8; 20]);
        info.push(b'e');
        let mut out = Vec::new();
        out.extend_from_slice(b"d4:info");
        out.extend_from_slice(&info);
        out.push(b'e');
        out
    }

    async fn swarm_fixture(
        dir: &tempfile::TempDir,
        config: SwarmConfig,
    ) -> (Swarm, mpsc::Sender<SwarmCommand>, watch::Sender<SwarmConfig>) {
        let store = RecordStore::new(dir.path().join("t.db")).await.unwrap();
        let (event_tx, _events) = broadcast::channel(16);
        let (config_tx, config_rx) = watch::channel(config.clone());
        let record = SwarmRecord {
            info_hash: [7u8; 20],
            transfer_id: Uuid::new_v4(),
            name: "t".into(),
            metainfo: Some(tiny_torrent()),
            magnet: None,
            bitfield: Vec::new(),
            uploaded: 0,
            downloaded: 0,
            config,
        };
        let (swarm, commands) = Swarm::from_record(
            record,
            dir.path().to_path_buf(),
            [1u8; 20],
            0,
            config_rx,
            event_tx,
            store,
        )
        .unwrap();
        (swarm, commands, config_tx)
    }

    fn one_piece_peer() -> Bitfield {
        let mut bf = Bitfield::new(1);
        bf.set(0);
        bf
    }

    #[tokio::test]
    async fn closed_window_suspends_io_but_keeps_peers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SwarmConfig::default();
        let closed = NaiveTime::from_hms_opt(3, 0, 0).unwrap();
        config.schedule = Some(ScheduleWindow {
            enabled: true,
            start: Some(closed),
            stop: Some(closed),
            days: Vec::new(),
        });
        let (mut swarm, _commands, _config_tx) = swarm_fixture(&dir, config).await;
        swarm.state = TorrentState::Downloading;

        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let (actions, _action_rx) = mpsc::channel(8);
        let bf = one_piece_peer();
        swarm.picker.peer_joined(&bf);
        swarm.peers.insert(
            addr,
            PeerHandle {
                actions,
                bitfield: bf,
                assigned: None,
            },
        );

        swarm.maintain().await;
        assert_eq!(swarm.peers.len(), 1);
        assert!(!swarm.io_gate.load(Ordering::Acquire));
        swarm.assign_work(addr).await;
        assert_eq!(swarm.picker.pending_count(), 0);

        // Reopening hands the connected peer work without a redial.
        swarm.config.schedule = None;
        swarm.maintain().await;
        assert!(swarm.io_gate.load(Ordering::Acquire));
        assert_eq!(swarm.picker.pending_count(), 1);
        assert_eq!(swarm.peers.get(&addr).unwrap().assigned, Some(0));
    }

    #[tokio::test]
    async fn full_peer_channel_hands_the_piece_back() {
        let dir = tempfile::tempdir().unwrap();
        let (mut swarm, _commands, _config_tx) =
            swarm_fixture(&dir, SwarmConfig::default()).await;
        swarm.state = TorrentState::Downloading;

        let addr: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        let (actions, _action_rx) = mpsc::channel(1);
        actions.try_send(PeerAction::Announce(0)).unwrap();
        let bf = one_piece_peer();
        swarm.picker.peer_joined(&bf);
        swarm.peers.insert(
            addr,
            PeerHandle {
                actions,
                bitfield: bf,
                assigned: None,
            },
        );

        swarm.assign_work(addr).await;
        assert_eq!(swarm.picker.pending_count(), 0);
        assert!(swarm.peers.get(&addr).unwrap().assigned.is_none());
    }

    #[test]
    fn seed_ratio_is_uploaded_over_downloaded() {
        assert_eq!(seed_ratio(300, 100), Some(3.0));
        assert_eq!(seed_ratio(0, 100), Some(0.0));
        assert_eq!(seed_ratio(500, 0), None);
    }

    #[test]
    fn compact_peers_decode() {
        let bytes = [127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x00, 0x50];
        let peers = parse_compact_peers(&bytes);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1], "10.0.0.2:80".parse().unwrap());
    }

    #[test]
    fn ragged_compact_peers_drop_the_tail() {
        let bytes = [127, 0, 0, 1, 0x1a, 0xe1, 9, 9];
        assert_eq!(parse_compact_peers(&bytes).len(), 1);
    }

    #[test]
    fn info_hash_percent_encoding() {
        assert_eq!(percent_encode_bytes(&[0x00, 0xff, 0x41]), "%00%ff%41");
    }

    #[test]
    fn bencode_header_length_is_found() {
        let payload = b"d8:msg_typei1e5:piecei0e10:total_sizei34256eeRAWDATA";
        let len = bencode_value_len(payload).unwrap();
        assert_eq!(&payload[len..], b"RAWDATA");

        let header: MetadataMsg = serde_bencode::from_bytes(&payload[..len]).unwrap();
        assert_eq!(header.msg_type, 1);
        assert_eq!(header.total_size, Some(34256));
    }

    #[test]
    fn nested_bencode_values_are_skipped_whole() {
        let payload = b"d1:md11:ut_metadatai3eee tail";
        let len = bencode_value_len(payload).unwrap();
        assert_eq!(&payload[len..], b" tail");
    }

    #[tokio::test]
    async fn file_store_spans_file_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Metainfo {
            info_hash: [0u8; 20],
            name: "bundle".into(),
            piece_length: 64,
            piece_hashes: vec![[0u8; 20]; 2],
            total_size: 100,
            files: vec![
                FileSlice {
                    path: PathBuf::from("bundle/a.bin"),
                    length: 60,
                    offset: 0,
                },
                FileSlice {
                    path: PathBuf::from("bundle/b.bin"),
                    length: 40,
                    offset: 60,
                },
            ],
            trackers: vec![],
            raw: vec![],
        };
        let store = FileStore::new(dir.path().to_path_buf(), &meta);

        let data: Vec<u8> = (0..100u8).collect();
        store.write_at(0, &data).await.unwrap();

        // Straddles the 60-byte boundary.
        let read = store.read_at(50, 20).await.unwrap();
        assert_eq!(read, (50..70u8).collect::<Vec<u8>>());

        let a = tokio::fs::read(dir.path().join("bundle/a.bin")).await.unwrap();
        let b = tokio::fs::read(dir.path().join("bundle/b.bin")).await.unwrap();
        assert_eq!(a.len(), 60);
        assert_eq!(b.len(), 40);
        assert_eq!(b[0], 60);
    }

    #[test]
    fn ext_handshake_round_trips() {
        let hs = ExtHandshake {
            m: ExtMap {
                ut_metadata: Some(3),
            },
            metadata_size: Some(1234),
        };
        let bytes = serde_bencode::to_bytes(&hs).unwrap();
        let back: ExtHandshake = serde_bencode::from_bytes(&bytes).unwrap();
        assert_eq!(back.m.ut_metadata, Some(3));
        assert_eq!(back.metadata_size, Some(1234));
    }
}
