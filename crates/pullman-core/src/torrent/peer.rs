//! Peer wire protocol
//!
//! Plaintext BitTorrent handshake plus the length-prefixed message
//! framing. The extension bit is advertised so metadata exchange
//! (BEP 9/10) works over magnet-only swarms.

use crate::error::PullmanError;
use crate::torrent::piece_picker::Bitfield;
use pullman_types::InfoHash;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

pub struct PeerConnection {
    stream: TcpStream,
    pub addr: SocketAddr,
    pub peer_id: [u8; 20],
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub am_choking: bool,
    pub am_interested: bool,
    pub bitfield: Bitfield,
    pub supports_extensions: bool,
}

impl PeerConnection {
    /// Dial a peer and complete the handshake.
    pub async fn dial(
        addr: SocketAddr,
        info_hash: &InfoHash,
        our_id: &[u8; 20],
        piece_count: usize,
    ) -> Result<Self, PullmanError> {
        let stream = tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(addr))
            .await
            .map_err(|_| PullmanError::Timeout)??;
        Self::handshake(stream, addr, info_hash, our_id, piece_count).await
    }

    /// Complete the handshake on an inbound connection whose first 68
    /// bytes were already consumed by the listener to route it here.
    pub fn adopt(
        stream: TcpStream,
        addr: SocketAddr,
        peer_id: [u8; 20],
        supports_extensions: bool,
        piece_count: usize,
    ) -> Self {
        Self {
            stream,
            addr,
            peer_id,
            peer_choking: true,
            peer_interested: false,
            am_choking: true,
            am_interested: false,
            bitfield: Bitfield::new(piece_count),
            supports_extensions,
        }
    }

    async fn handshake(
        mut stream: TcpStream,
        addr: SocketAddr,
        info_hash: &InfoHash,
        our_id: &[u8; 20],
        piece_count: usize,
    ) -> Result<Self, PullmanError> {
        let mut hello = Vec::with_capacity(68);
        hello.push(19u8);
        hello.extend_from_slice(PROTOCOL);
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10;
        hello.extend_from_slice(&reserved);
        hello.extend_from_slice(info_hash);
        hello.extend_from_slice(our_id);
        stream.write_all(&hello).await?;

        let mut reply = [0u8; 68];
        tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut reply))
            .await
            .map_err(|_| PullmanError::Timeout)??;

        if reply[0] != 19 || &reply[1..20] != PROTOCOL {
            return Err(PullmanError::Protocol("bad handshake header".into()));
        }
        if &reply[28..48] != info_hash {
            return Err(PullmanError::Protocol("handshake info hash mismatch".into()));
        }

        let supports_extensions = reply[25] & 0x10 != 0;
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&reply[48..68]);

        Ok(Self {
            stream,
            addr,
            peer_id,
            peer_choking: true,
            peer_interested: false,
            am_choking: true,
            am_interested: false,
            bitfield: Bitfield::new(piece_count),
            supports_extensions,
        })
    }

    /// Read one inbound handshake and hand back its info hash, so the
    /// listener can route the socket to the right swarm before
    /// replying.
    pub async fn read_inbound_handshake(
        stream: &mut TcpStream,
    ) -> Result<(InfoHash, [u8; 20], bool), PullmanError> {
        let mut hello = [0u8; 68];
        tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut hello))
            .await
            .map_err(|_| PullmanError::Timeout)??;

        if hello[0] != 19 || &hello[1..20] != PROTOCOL {
            return Err(PullmanError::Protocol("bad handshake header".into()));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&hello[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&hello[48..68]);
        let supports_extensions = hello[25] & 0x10 != 0;

        Ok((info_hash, peer_id, supports_extensions))
    }

    /// The replying half of an inbound handshake.
    pub async fn write_handshake_reply(
        stream: &mut TcpStream,
        info_hash: &InfoHash,
        our_id: &[u8; 20],
    ) -> Result<(), PullmanError> {
        let mut hello = Vec::with_capacity(68);
        hello.push(19u8);
        hello.extend_from_slice(PROTOCOL);
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10;
        hello.extend_from_slice(&reserved);
        hello.extend_from_slice(info_hash);
        hello.extend_from_slice(our_id);
        stream.write_all(&hello).await?;
        Ok(())
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.has(index)
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), PullmanError> {
        match msg {
            Message::KeepAlive => {
                self.stream.write_u32(0).await?;
            }
            Message::Choke => {
                self.stream.write_u32(1).await?;
                self.stream.write_u8(0).await?;
                self.am_choking = true;
            }
            Message::Unchoke => {
                self.stream.write_u32(1).await?;
                self.stream.write_u8(1).await?;
                self.am_choking = false;
            }
            Message::Interested => {
                self.stream.write_u32(1).await?;
                self.stream.write_u8(2).await?;
                self.am_interested = true;
            }
            Message::NotInterested => {
                self.stream.write_u32(1).await?;
                self.stream.write_u8(3).await?;
                self.am_interested = false;
            }
            Message::Have(index) => {
                self.stream.write_u32(5).await?;
                self.stream.write_u8(4).await?;
                self.stream.write_u32(index).await?;
            }
            Message::Bitfield(bits) => {
                self.stream.write_u32(1 + bits.len() as u32).await?;
                self.stream.write_u8(5).await?;
                self.stream.write_all(&bits).await?;
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                self.stream.write_u32(13).await?;
                self.stream.write_u8(6).await?;
                self.stream.write_u32(index).await?;
                self.stream.write_u32(begin).await?;
                self.stream.write_u32(length).await?;
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                self.stream.write_u32(9 + block.len() as u32).await?;
                self.stream.write_u8(7).await?;
                self.stream.write_u32(index).await?;
                self.stream.write_u32(begin).await?;
                self.stream.write_all(&block).await?;
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                self.stream.write_u32(13).await?;
                self.stream.write_u8(8).await?;
                self.stream.write_u32(index).await?;
                self.stream.write_u32(begin).await?;
                self.stream.write_u32(length).await?;
            }
            Message::Extended { id, payload } => {
                self.stream.write_u32(2 + payload.len() as u32).await?;
                self.stream.write_u8(20).await?;
                self.stream.write_u8(id).await?;
                self.stream.write_all(&payload).await?;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Message, PullmanError> {
        let fut = async {
            let len = self.stream.read_u32().await?;
            if len == 0 {
                return Ok(Message::KeepAlive);
            }
            if len > 1 + (1 << 17) {
                return Err(PullmanError::Protocol(format!(
                    "oversized peer message: {} bytes",
                    len
                )));
            }

            let id = self.stream.read_u8().await?;
            match id {
                0 => {
                    self.peer_choking = true;
                    Ok(Message::Choke)
                }
                1 => {
                    self.peer_choking = false;
                    Ok(Message::Unchoke)
                }
                2 => {
                    self.peer_interested = true;
                    Ok(Message::Interested)
                }
                3 => {
                    self.peer_interested = false;
                    Ok(Message::NotInterested)
                }
                4 => {
                    if len < 5 {
                        return Err(truncated(id, len));
                    }
                    let index = self.stream.read_u32().await?;
                    self.bitfield.set(index as usize);
                    Ok(Message::Have(index))
                }
                5 => {
                    let mut payload = vec![0u8; (len - 1) as usize];
                    self.stream.read_exact(&mut payload).await?;
                    self.bitfield = Bitfield::from_bytes(&payload, self.bitfield.len());
                    Ok(Message::Bitfield(payload))
                }
                6 => {
                    if len < 13 {
                        return Err(truncated(id, len));
                    }
                    Ok(Message::Request {
                        index: self.stream.read_u32().await?,
                        begin: self.stream.read_u32().await?,
                        length: self.stream.read_u32().await?,
                    })
                }
                7 => {
                    if len < 9 {
                        return Err(truncated(id, len));
                    }
                    let index = self.stream.read_u32().await?;
                    let begin = self.stream.read_u32().await?;
                    let mut block = vec![0u8; (len - 9) as usize];
                    self.stream.read_exact(&mut block).await?;
                    Ok(Message::Piece {
                        index,
                        begin,
                        block,
                    })
                }
                8 => {
                    if len < 13 {
                        return Err(truncated(id, len));
                    }
                    Ok(Message::Cancel {
                        index: self.stream.read_u32().await?,
                        begin: self.stream.read_u32().await?,
                        length: self.stream.read_u32().await?,
                    })
                }
                20 => {
                    if len < 2 {
                        return Err(truncated(id, len));
                    }
                    let ext_id = self.stream.read_u8().await?;
                    let mut payload = vec![0u8; (len - 2) as usize];
                    self.stream.read_exact(&mut payload).await?;
                    Ok(Message::Extended {
                        id: ext_id,
                        payload,
                    })
                }
                other => {
                    // Drain and skip unknown message types.
                    let mut buf = vec![0u8; (len - 1) as usize];
                    self.stream.read_exact(&mut buf).await?;
                    Err(PullmanError::Protocol(format!(
                        "unknown peer message id {}",
                        other
                    )))
                }
            }
        };

        tokio::time::timeout(READ_TIMEOUT, fut)
            .await
            .map_err(|_| PullmanError::Timeout)?
    }
}

fn truncated(id: u8, len: u32) -> PullmanError {
    PullmanError::Protocol(format!(
        "truncated peer message id {} ({} bytes)",
        id, len
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn wired_pair() -> (PeerConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (PeerConnection::adopt(server, addr, [0u8; 20], false, 8), client)
    }

    #[tokio::test]
    async fn short_piece_frame_is_a_protocol_error() {
        let (mut conn, mut wire) = wired_pair().await;
        // A Piece frame needs at least id + index + begin.
        wire.write_all(&[0, 0, 0, 4, 7, 0, 0, 0]).await.unwrap();
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, PullmanError::Protocol(_)));
    }

    #[tokio::test]
    async fn short_extended_frame_is_a_protocol_error() {
        let (mut conn, mut wire) = wired_pair().await;
        wire.write_all(&[0, 0, 0, 1, 20]).await.unwrap();
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, PullmanError::Protocol(_)));
    }

    #[tokio::test]
    async fn well_formed_have_still_parses() {
        let (mut conn, mut wire) = wired_pair().await;
        wire.write_all(&[0, 0, 0, 5, 4, 0, 0, 0, 2]).await.unwrap();
        assert!(matches!(conn.recv().await.unwrap(), Message::Have(2)));
        assert!(conn.has_piece(2));
    }
}
