//! BitTorrent engine
//!
//! One actor per swarm, a shared TCP listener that routes inbound
//! handshakes by info hash, and watch channels pushing runtime config
//! into running swarms without teardown.

mod engine;
mod metainfo;
mod peer;
mod piece_picker;
mod swarm;

pub use engine::TorrentEngine;
pub use metainfo::{MagnetLink, Metainfo, BLOCK_SIZE};
pub use peer::{Message, PeerConnection};
pub use piece_picker::{Bitfield, PiecePicker};
pub use swarm::{Swarm, SwarmCommand};

use pullman_types::{InfoHash, SwarmConfig};
use uuid::Uuid;

/// Durable per-swarm state, one row in the record store.
#[derive(Debug, Clone)]
pub struct SwarmRecord {
    pub info_hash: InfoHash,
    pub transfer_id: Uuid,
    pub name: String,
    /// Raw .torrent bytes when metadata is known
    pub metainfo: Option<Vec<u8>>,
    /// Original magnet URI for swarms still waiting on metadata
    pub magnet: Option<String>,
    pub bitfield: Vec<u8>,
    pub uploaded: u64,
    pub downloaded: u64,
    pub config: SwarmConfig,
}
