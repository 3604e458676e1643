//! Torrent metainfo and magnet parsing
//!
//! Bencoded .torrent files decode through serde_bencode; the info
//! hash is the SHA-1 of the re-encoded info dictionary. Magnet URIs
//! carry the info hash directly, as 40 hex or 32 BASE32 characters.

use crate::error::PullmanError;
use data_encoding::BASE32;
use pullman_types::{InfoHash, TorrentFileEntry, TorrentMetadata};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use url::Url;

/// Standard transfer block within a piece.
pub const BLOCK_SIZE: u32 = 16 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BencodeTorrent {
    #[serde(default)]
    announce: Option<String>,
    #[serde(rename = "announce-list", default)]
    announce_list: Option<Vec<Vec<String>>>,
    info: BencodeInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BencodeInfo {
    #[serde(default)]
    files: Option<Vec<BencodeFile>>,
    #[serde(default)]
    length: Option<i64>,
    name: String,
    #[serde(rename = "piece length")]
    piece_length: i64,
    pieces: ByteBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BencodeFile {
    length: i64,
    path: Vec<String>,
}

/// One content file with its absolute byte offset in the piece space.
#[derive(Debug, Clone)]
pub struct FileSlice {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

/// Fully parsed torrent description.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_size: u64,
    pub files: Vec<FileSlice>,
    pub trackers: Vec<String>,
    /// Original bencoded bytes, kept for persistence and re-load
    pub raw: Vec<u8>,
}

impl Metainfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PullmanError> {
        let torrent: BencodeTorrent = serde_bencode::from_bytes(bytes)
            .map_err(|e| PullmanError::Protocol(format!("bad torrent file: {}", e)))?;

        let info_bytes = serde_bencode::to_bytes(&torrent.info)
            .map_err(|e| PullmanError::Protocol(format!("info dict re-encode failed: {}", e)))?;
        let info_hash: InfoHash = Sha1::digest(&info_bytes).into();

        let pieces = &torrent.info.pieces;
        if pieces.is_empty() || pieces.len() % 20 != 0 {
            return Err(PullmanError::Protocol(
                "pieces field is not a multiple of 20 bytes".into(),
            ));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();

        let (files, total_size) = match (&torrent.info.files, torrent.info.length) {
            (Some(entries), _) => {
                let mut files = Vec::with_capacity(entries.len());
                let mut offset = 0u64;
                for entry in entries {
                    let length = entry.length.max(0) as u64;
                    let mut path = PathBuf::from(&torrent.info.name);
                    for part in &entry.path {
                        path.push(part);
                    }
                    files.push(FileSlice {
                        path,
                        length,
                        offset,
                    });
                    offset += length;
                }
                (files, offset)
            }
            (None, Some(length)) => {
                let length = length.max(0) as u64;
                (
                    vec![FileSlice {
                        path: PathBuf::from(&torrent.info.name),
                        length,
                        offset: 0,
                    }],
                    length,
                )
            }
            (None, None) => {
                return Err(PullmanError::Protocol(
                    "torrent has neither length nor files".into(),
                ))
            }
        };

        let mut trackers = Vec::new();
        if let Some(announce) = &torrent.announce {
            trackers.push(announce.clone());
        }
        if let Some(tiers) = &torrent.announce_list {
            for tier in tiers {
                for url in tier {
                    if !trackers.contains(url) {
                        trackers.push(url.clone());
                    }
                }
            }
        }

        Ok(Self {
            info_hash,
            name: torrent.info.name.clone(),
            piece_length: torrent.info.piece_length.max(0) as u64,
            piece_hashes,
            total_size,
            files,
            trackers,
            raw: bytes.to_vec(),
        })
    }

    /// Reconstruct a Metainfo from a bare info dictionary, as fetched
    /// over the metadata extension. Trackers come from the magnet URI.
    pub fn from_info_dict(info_bytes: &[u8], trackers: Vec<String>) -> Result<Self, PullmanError> {
        let expected: InfoHash = Sha1::digest(info_bytes).into();

        let torrent = BencodeTorrent {
            announce: trackers.first().cloned(),
            announce_list: None,
            info: serde_bencode::from_bytes(info_bytes)
                .map_err(|e| PullmanError::Protocol(format!("bad info dict: {}", e)))?,
        };
        let raw = serde_bencode::to_bytes(&torrent)
            .map_err(|e| PullmanError::Protocol(format!("torrent re-encode failed: {}", e)))?;

        let mut meta = Self::from_bytes(&raw)?;
        // Hash over the wire bytes is authoritative, not the re-encode.
        meta.info_hash = expected;
        meta.trackers = trackers;
        Ok(meta)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte length of one piece; the final piece holds the remainder.
    pub fn piece_size(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        self.piece_length.min(self.total_size.saturating_sub(start))
    }

    pub fn block_count(&self, piece_index: usize) -> u32 {
        let size = self.piece_size(piece_index);
        size.div_ceil(BLOCK_SIZE as u64) as u32
    }

    pub fn block_size(&self, piece_index: usize, block: u32) -> u32 {
        let piece = self.piece_size(piece_index);
        let start = block as u64 * BLOCK_SIZE as u64;
        (BLOCK_SIZE as u64).min(piece.saturating_sub(start)) as u32
    }

    pub fn to_metadata(&self) -> TorrentMetadata {
        TorrentMetadata {
            info_hash: hex::encode(self.info_hash),
            name: self.name.clone(),
            piece_length: self.piece_length,
            piece_count: self.piece_count(),
            total_size: self.total_size,
            files: self
                .files
                .iter()
                .map(|f| TorrentFileEntry {
                    path: f.path.to_string_lossy().into_owned(),
                    length: f.length,
                })
                .collect(),
            trackers: self.trackers.clone(),
        }
    }
}

/// The pieces of a magnet URI the engine cares about.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> Result<Self, PullmanError> {
        let url = Url::parse(uri).map_err(|e| PullmanError::InvalidUrl(e.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(PullmanError::InvalidUrl(format!(
                "not a magnet URI: {}",
                uri
            )));
        }

        let mut info_hash: Option<InfoHash> = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash_str) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(decode_info_hash(hash_str)?);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or_else(|| {
                PullmanError::InvalidUrl("magnet URI carries no btih hash".into())
            })?,
            display_name,
            trackers,
        })
    }
}

fn decode_info_hash(s: &str) -> Result<InfoHash, PullmanError> {
    let bytes = match s.len() {
        40 => hex::decode(s).map_err(|e| PullmanError::InvalidUrl(e.to_string()))?,
        32 => BASE32
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(|e| PullmanError::InvalidUrl(e.to_string()))?,
        n => {
            return Err(PullmanError::InvalidUrl(format!(
                "info hash must be 40 hex or 32 base32 chars, got {}",
                n
            )))
        }
    };
    bytes
        .try_into()
        .map_err(|_| PullmanError::InvalidUrl("info hash is not 20 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        let info = BencodeInfo {
            files: None,
            length: Some(100_000),
            name: "example.bin".into(),
            piece_length: 32_768,
            pieces: ByteBuf::from(vec![0u8; 20 * 4]),
            private: None,
        };
        serde_bencode::to_bytes(&BencodeTorrent {
            announce: Some("http://tracker.example.com/announce".into()),
            announce_list: None,
            info,
        })
        .unwrap()
    }

    #[test]
    fn single_file_layout() {
        let meta = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        assert_eq!(meta.name, "example.bin");
        assert_eq!(meta.piece_count(), 4);
        assert_eq!(meta.total_size, 100_000);
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.trackers.len(), 1);
    }

    #[test]
    fn final_piece_holds_the_remainder() {
        let meta = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        assert_eq!(meta.piece_size(0), 32_768);
        assert_eq!(meta.piece_size(3), 100_000 - 3 * 32_768);
        let total: u64 = (0..meta.piece_count()).map(|i| meta.piece_size(i)).sum();
        assert_eq!(total, meta.total_size);
    }

    #[test]
    fn block_math_covers_every_piece() {
        let meta = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        for piece in 0..meta.piece_count() {
            let total: u64 = (0..meta.block_count(piece))
                .map(|b| meta.block_size(piece, b) as u64)
                .sum();
            assert_eq!(total, meta.piece_size(piece));
        }
    }

    #[test]
    fn multi_file_offsets_are_cumulative() {
        let info = BencodeInfo {
            files: Some(vec![
                BencodeFile {
                    length: 700,
                    path: vec!["a.txt".into()],
                },
                BencodeFile {
                    length: 300,
                    path: vec!["sub".into(), "b.txt".into()],
                },
            ]),
            length: None,
            name: "bundle".into(),
            piece_length: 512,
            pieces: ByteBuf::from(vec![0u8; 20 * 2]),
            private: None,
        };
        let bytes = serde_bencode::to_bytes(&BencodeTorrent {
            announce: None,
            announce_list: None,
            info,
        })
        .unwrap();

        let meta = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(meta.total_size, 1000);
        assert_eq!(meta.files[0].offset, 0);
        assert_eq!(meta.files[1].offset, 700);
        assert!(meta.files[1].path.ends_with("sub/b.txt"));
    }

    #[test]
    fn info_hash_is_stable_across_parse() {
        let bytes = single_file_torrent();
        let a = Metainfo::from_bytes(&bytes).unwrap();
        let b = Metainfo::from_bytes(&a.raw).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }

    #[test]
    fn magnet_hex_and_base32_agree() {
        let hash = [0xabu8; 20];
        let hex_uri = format!("magnet:?xt=urn:btih:{}&dn=thing&tr=http://t/a", hex::encode(hash));
        let b32_uri = format!("magnet:?xt=urn:btih:{}", BASE32.encode(&hash));

        let from_hex = MagnetLink::parse(&hex_uri).unwrap();
        let from_b32 = MagnetLink::parse(&b32_uri).unwrap();
        assert_eq!(from_hex.info_hash, from_b32.info_hash);
        assert_eq!(from_hex.display_name.as_deref(), Some("thing"));
        assert_eq!(from_hex.trackers, vec!["http://t/a".to_string()]);
    }

    #[test]
    fn magnet_without_hash_is_rejected() {
        assert!(MagnetLink::parse("magnet:?dn=nothing").is_err());
        assert!(MagnetLink::parse("https://example.com").is_err());
    }
}
