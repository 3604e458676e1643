//! Torrent engine
//!
//! Owns the swarm registry and the shared TCP listener. Inbound
//! handshakes are read once, routed to their swarm by info hash, and
//! adopted by that swarm's actor; unknown hashes are dropped.

use crate::engine::RecordStore;
use crate::error::PullmanError;
use crate::torrent::metainfo::{MagnetLink, Metainfo};
use crate::torrent::peer::PeerConnection;
use crate::torrent::swarm::{Swarm, SwarmCommand};
use crate::torrent::SwarmRecord;
use pullman_types::{CoreEvent, InfoHash, SwarmConfig, TorrentMetadata};
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct SwarmHandle {
    commands: mpsc::Sender<SwarmCommand>,
    config_tx: watch::Sender<SwarmConfig>,
    transfer_id: Uuid,
}

pub struct TorrentEngine {
    swarms: Arc<RwLock<HashMap<InfoHash, SwarmHandle>>>,
    peer_id: [u8; 20],
    listen_port: u16,
    store: RecordStore,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl TorrentEngine {
    pub fn new(
        store: RecordStore,
        event_tx: broadcast::Sender<CoreEvent>,
        listen_port: u16,
    ) -> Self {
        Self {
            swarms: Arc::new(RwLock::new(HashMap::new())),
            peer_id: generate_peer_id(),
            listen_port,
            store,
            event_tx,
        }
    }

    /// Bind the peer listener. Failure to bind is logged, not fatal:
    /// outbound-only swarms still work.
    pub async fn start_listener(&self) {
        let listener = match TcpListener::bind(("0.0.0.0", self.listen_port)).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Could not bind peer port {}: {}", self.listen_port, e);
                return;
            }
        };
        info!("Peer listener on port {}", self.listen_port);

        let swarms = self.swarms.clone();
        let our_id = self.peer_id;
        tokio::spawn(async move {
            loop {
                let (mut stream, addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Peer accept failed: {}", e);
                        continue;
                    }
                };

                let swarms = swarms.clone();
                tokio::spawn(async move {
                    let (info_hash, peer_id, extensions) =
                        match PeerConnection::read_inbound_handshake(&mut stream).await {
                            Ok(parts) => parts,
                            Err(e) => {
                                debug!("Bad inbound handshake from {}: {}", addr, e);
                                return;
                            }
                        };

                    let commands = {
                        let guard = swarms.read().await;
                        match guard.get(&info_hash) {
                            Some(handle) => handle.commands.clone(),
                            None => {
                                debug!("Inbound peer {} for unknown swarm", addr);
                                return;
                            }
                        }
                    };

                    if let Err(e) =
                        PeerConnection::write_handshake_reply(&mut stream, &info_hash, &our_id)
                            .await
                    {
                        debug!("Handshake reply to {} failed: {}", addr, e);
                        return;
                    }

                    let _ = commands
                        .send(SwarmCommand::Inbound {
                            stream,
                            addr,
                            peer_id,
                            extensions,
                        })
                        .await;
                });
            }
        });
    }

    /// Register a swarm from raw .torrent bytes and start it.
    pub async fn add_torrent_file(
        &self,
        transfer_id: Uuid,
        bytes: Vec<u8>,
        save_path: PathBuf,
        config: SwarmConfig,
    ) -> Result<TorrentMetadata, PullmanError> {
        let meta = Metainfo::from_bytes(&bytes)?;
        let info_hash = meta.info_hash;

        if self.swarms.read().await.contains_key(&info_hash) {
            return Err(PullmanError::InvalidOperation(format!(
                "torrent {} is already registered",
                hex::encode(info_hash)
            )));
        }

        let metadata = meta.to_metadata();
        let record = SwarmRecord {
            info_hash,
            transfer_id,
            name: meta.name.clone(),
            metainfo: Some(bytes),
            magnet: None,
            bitfield: Vec::new(),
            uploaded: 0,
            downloaded: 0,
            config,
        };
        self.store.upsert_swarm(&record).await?;
        self.spawn_swarm(record, save_path).await?;

        Ok(metadata)
    }

    /// Register a magnet swarm; metadata arrives from peers later.
    pub async fn add_magnet(
        &self,
        transfer_id: Uuid,
        uri: &str,
        save_path: PathBuf,
        config: SwarmConfig,
    ) -> Result<(InfoHash, String), PullmanError> {
        let link = MagnetLink::parse(uri)?;
        let info_hash = link.info_hash;

        if self.swarms.read().await.contains_key(&info_hash) {
            return Err(PullmanError::InvalidOperation(format!(
                "torrent {} is already registered",
                hex::encode(info_hash)
            )));
        }

        let name = link
            .display_name
            .clone()
            .unwrap_or_else(|| hex::encode(info_hash));
        let record = SwarmRecord {
            info_hash,
            transfer_id,
            name: name.clone(),
            metainfo: None,
            magnet: Some(uri.to_string()),
            bitfield: Vec::new(),
            uploaded: 0,
            downloaded: 0,
            config,
        };
        self.store.upsert_swarm(&record).await?;
        self.spawn_swarm(record, save_path).await?;

        Ok((info_hash, name))
    }

    pub async fn pause(&self, info_hash: &InfoHash) -> Result<(), PullmanError> {
        self.send_command(info_hash, SwarmCommand::Pause).await
    }

    pub async fn resume(&self, info_hash: &InfoHash) -> Result<(), PullmanError> {
        self.send_command(info_hash, SwarmCommand::Resume).await
    }

    /// Stop a swarm and forget its record. Content files are removed
    /// only when `delete_data` is set.
    pub async fn remove(
        &self,
        info_hash: &InfoHash,
        delete_data: bool,
    ) -> Result<(), PullmanError> {
        let handle = self
            .swarms
            .write()
            .await
            .remove(info_hash)
            .ok_or_else(|| swarm_not_found(info_hash))?;

        let _ = handle
            .commands
            .send(SwarmCommand::Shutdown { delete_data })
            .await;
        self.store.delete_swarm(&hex::encode(info_hash)).await?;
        Ok(())
    }

    /// Push a new runtime config into a running swarm and persist it.
    pub async fn set_config(
        &self,
        info_hash: &InfoHash,
        config: SwarmConfig,
    ) -> Result<(), PullmanError> {
        let guard = self.swarms.read().await;
        let handle = guard.get(info_hash).ok_or_else(|| swarm_not_found(info_hash))?;
        handle
            .config_tx
            .send(config)
            .map_err(|_| swarm_not_found(info_hash))?;
        Ok(())
    }

    pub async fn config(&self, info_hash: &InfoHash) -> Result<SwarmConfig, PullmanError> {
        let guard = self.swarms.read().await;
        let handle = guard.get(info_hash).ok_or_else(|| swarm_not_found(info_hash))?;
        let config = handle.config_tx.borrow().clone();
        Ok(config)
    }

    /// Edit one field of a running swarm's config in place.
    pub async fn update_config<F>(
        &self,
        info_hash: &InfoHash,
        edit: F,
    ) -> Result<SwarmConfig, PullmanError>
    where
        F: FnOnce(&mut SwarmConfig),
    {
        let guard = self.swarms.read().await;
        let handle = guard.get(info_hash).ok_or_else(|| swarm_not_found(info_hash))?;
        handle.config_tx.send_modify(edit);
        let config = handle.config_tx.borrow().clone();
        Ok(config)
    }

    pub async fn transfer_of(&self, info_hash: &InfoHash) -> Option<Uuid> {
        self.swarms
            .read()
            .await
            .get(info_hash)
            .map(|h| h.transfer_id)
    }

    pub async fn contains(&self, info_hash: &InfoHash) -> bool {
        self.swarms.read().await.contains_key(info_hash)
    }

    /// Respawn every persisted swarm. The transfer row supplies the
    /// save path; orphaned records are dropped.
    pub async fn restore(&self) -> Result<usize, PullmanError> {
        let records = self.store.load_swarms().await?;
        let mut restored = 0;

        for record in records {
            let transfer = self.store.load_transfer(record.transfer_id).await?;
            let Some(transfer) = transfer else {
                warn!(
                    "Dropping orphaned swarm {} with no transfer row",
                    hex::encode(record.info_hash)
                );
                self.store.delete_swarm(&hex::encode(record.info_hash)).await?;
                continue;
            };

            match self.spawn_swarm(record, transfer.save_path).await {
                Ok(()) => restored += 1,
                Err(e) => warn!("Could not restore swarm: {}", e),
            }
        }

        Ok(restored)
    }

    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.swarms.write().await.drain().collect();
        for (_, handle) in handles {
            let _ = handle
                .commands
                .send(SwarmCommand::Shutdown { delete_data: false })
                .await;
        }
    }

    async fn spawn_swarm(
        &self,
        record: SwarmRecord,
        save_path: PathBuf,
    ) -> Result<(), PullmanError> {
        let info_hash = record.info_hash;
        let transfer_id = record.transfer_id;
        let (config_tx, config_rx) = watch::channel(record.config.clone());

        let (swarm, commands) = Swarm::from_record(
            record,
            save_path,
            self.peer_id,
            self.listen_port,
            config_rx,
            self.event_tx.clone(),
            self.store.clone(),
        )?;

        tokio::spawn(swarm.run());

        self.swarms.write().await.insert(
            info_hash,
            SwarmHandle {
                commands,
                config_tx,
                transfer_id,
            },
        );
        Ok(())
    }

    async fn send_command(
        &self,
        info_hash: &InfoHash,
        cmd: SwarmCommand,
    ) -> Result<(), PullmanError> {
        let commands = {
            let guard = self.swarms.read().await;
            guard
                .get(info_hash)
                .map(|h| h.commands.clone())
                .ok_or_else(|| swarm_not_found(info_hash))?
        };
        commands
            .send(cmd)
            .await
            .map_err(|_| swarm_not_found(info_hash))
    }
}

fn swarm_not_found(info_hash: &InfoHash) -> PullmanError {
    PullmanError::TorrentNotFound(hex::encode(info_hash))
}

/// Azureus-style peer id: client tag plus random tail.
fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-PL0100-");
    rand::thread_rng().fill(&mut id[8..]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn peer_id_carries_the_client_tag() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-PL0100-");
    }

    #[test]
    fn peer_ids_are_unique() {
        assert_ne!(generate_peer_id()[8..], generate_peer_id()[8..]);
    }

    #[tokio::test]
    async fn runtime_config_edits_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("t.db")).await.unwrap();
        let (event_tx, _events) = broadcast::channel(16);
        let engine = TorrentEngine::new(store, event_tx, 0);

        let meta = engine
            .add_torrent_file(
                Uuid::new_v4(),
                tiny_torrent(),
                dir.path().to_path_buf(),
                SwarmConfig::default(),
            )
            .await
            .unwrap();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hex::decode(&meta.info_hash).unwrap());

        let updated = engine
            .update_config(&hash, |c| c.max_connections = 7)
            .await
            .unwrap();
        assert_eq!(updated.max_connections, 7);
        assert_eq!(engine.config(&hash).await.unwrap().max_connections, 7);
    }
}
