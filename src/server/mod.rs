//! Responder side of the wire protocol: accepts inbound peers and serves
//! blocks of verified pieces from the shared piece stores.

use crate::error::{BittorrentError, Result};
use crate::peer::{read_frame, Handshake, PeerMessage, PeerState};
use crate::piece::PieceStore;
use crate::torrent::Torrent;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Largest block length a peer may request
pub const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

/// A torrent the server answers for
#[derive(Clone)]
pub struct HostedTorrent {
    pub torrent: Arc<Torrent>,
    pub store: Arc<PieceStore>,
}

pub struct PeerServer {
    listener: TcpListener,
    torrents: HashMap<[u8; 20], HostedTorrent>,
    read_timeout: Duration,
}

impl PeerServer {
    /// Bind the first free port in `ports`, scanning in order
    pub async fn bind(ip: IpAddr, ports: RangeInclusive<u16>, read_timeout: Duration) -> Result<Self> {
        for port in ports.clone() {
            match TcpListener::bind((ip, port)).await {
                Ok(listener) => {
                    info!("Peer server listening on {}", listener.local_addr()?);
                    return Ok(Self {
                        listener,
                        torrents: HashMap::new(),
                        read_timeout,
                    });
                }
                Err(e) => debug!("Port {} unavailable: {}", port, e),
            }
        }

        Err(BittorrentError::IoError(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("No free port in {}..={}", ports.start(), ports.end()),
        )))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve `torrent` from `store`; replaces an earlier entry with the same info hash
    pub fn host(&mut self, torrent: Arc<Torrent>, store: Arc<PieceStore>) {
        info!("Hosting {} ({})", torrent.name, torrent.info_hash_hex());
        self.torrents
            .insert(torrent.info_hash, HostedTorrent { torrent, store });
    }

    /// Accept connections forever, one task per connection
    pub async fn run(self) -> Result<()> {
        let torrents = Arc::new(self.torrents);

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually fd exhaustion; give it time to clear
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            debug!("Inbound connection from {}", addr);

            let torrents = Arc::clone(&torrents);
            let read_timeout = self.read_timeout;
            tokio::spawn(async move {
                match serve_connection(stream, addr, &torrents, read_timeout).await {
                    Ok(()) => debug!("Connection from {} closed", addr),
                    Err(e) => debug!("Connection from {} ended: {}", addr, e),
                }
            });
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    torrents: &HashMap<[u8; 20], HostedTorrent>,
    read_timeout: Duration,
) -> Result<()> {
    let handshake = timeout(read_timeout, Handshake::read_from(&mut stream))
        .await
        .map_err(|_| BittorrentError::Timeout(format!("handshake from {}", addr)))??;

    // Unknown torrents get no reply at all
    let Some(hosted) = torrents.get(&handshake.info_hash) else {
        debug!(
            "{} asked for unknown torrent {}, closing",
            addr,
            hex::encode(handshake.info_hash)
        );
        return Ok(());
    };

    let reply = Handshake::new(hosted.torrent.info_hash, hosted.torrent.peer_id);
    stream.write_all(&reply.to_bytes()).await?;
    let bitfield = PeerMessage::Bitfield {
        bitfield: hosted.store.bitfield().await,
    };
    stream.write_all(&bitfield.to_bytes()).await?;
    info!("Serving {} to {}", hosted.torrent.name, addr);

    let mut flags = PeerState::default();
    loop {
        let message = timeout(read_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| BittorrentError::Timeout(format!("no frame from {}", addr)))??;

        match message {
            PeerMessage::Interested => {
                flags.peer_interested = true;
                if flags.am_choking {
                    stream.write_all(&PeerMessage::Unchoke.to_bytes()).await?;
                    flags.am_choking = false;
                }
            }
            PeerMessage::NotInterested => flags.peer_interested = false,
            PeerMessage::Request { block } => {
                if block.length > MAX_REQUEST_LENGTH {
                    return Err(BittorrentError::ProtocolError(format!(
                        "{} requested {} bytes",
                        addr, block.length
                    )));
                }
                if flags.am_choking {
                    debug!("Dropping request {:?} from choked peer {}", block, addr);
                    continue;
                }

                let data = hosted.store.read_block(block).await?;
                let piece = PeerMessage::Piece {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    data,
                };
                stream.write_all(&piece.to_bytes()).await?;
                debug!("Sent {:?} to {}", block, addr);
            }
            other => debug!("Ignoring {:?} from {}", other.id(), addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::HANDSHAKE_LEN;
    use crate::piece::BlockInfo;
    use crate::torrent::tests::torrent_for;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    /// Seeds `data` (of which only `on_disk` bytes are real) and returns the server address
    async fn seeding(data: &[u8], on_disk: &[u8], dir: &std::path::Path) -> (Arc<Torrent>, SocketAddr) {
        std::fs::write(dir.join("f"), on_disk).unwrap();
        let torrent = Arc::new(torrent_for(data, 16384, &[("f", data.len() as u64)]));
        let store = Arc::new(PieceStore::open(dir, &torrent).await.unwrap());
        store.verify_existing().await.unwrap();

        let mut server = PeerServer::bind(LOCALHOST, 0..=0, Duration::from_secs(5))
            .await
            .unwrap();
        server.host(Arc::clone(&torrent), store);
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (torrent, addr)
    }

    async fn connect(addr: SocketAddr, info_hash: [u8; 20]) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&Handshake::new(info_hash, [5u8; 20]).to_bytes())
            .await
            .unwrap();
        stream
    }

    #[tokio::test]
    async fn test_unknown_info_hash_gets_no_reply() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(100);
        let (_torrent, addr) = seeding(&data, &data, dir.path()).await;

        let mut stream = connect(addr, [0xee; 20]).await;
        let mut buf = [0u8; HANDSHAKE_LEN];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_port_range_exhausted() {
        let taken = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = PeerServer::bind(LOCALHOST, port..=port, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BittorrentError::IoError(_))));
    }

    #[tokio::test]
    async fn test_serves_verified_blocks_after_unchoke() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(24384);
        // Second piece on disk is garbage, so only piece 0 verifies
        let mut on_disk = data.clone();
        on_disk[20000] ^= 0xff;
        let (torrent, addr) = seeding(&data, &on_disk, dir.path()).await;

        let mut stream = connect(addr, torrent.info_hash).await;
        let reply = Handshake::read_from(&mut stream).await.unwrap();
        assert_eq!(reply.info_hash, torrent.info_hash);
        assert_eq!(
            read_frame(&mut stream).await.unwrap(),
            PeerMessage::Bitfield {
                bitfield: vec![0b1000_0000]
            }
        );

        let block = BlockInfo::new(0, 1000, 500);
        // Still choked: this request is silently dropped
        stream
            .write_all(&PeerMessage::Request { block }.to_bytes())
            .await
            .unwrap();
        stream
            .write_all(&PeerMessage::Interested.to_bytes())
            .await
            .unwrap();
        assert_eq!(read_frame(&mut stream).await.unwrap(), PeerMessage::Unchoke);

        stream
            .write_all(&PeerMessage::Request { block }.to_bytes())
            .await
            .unwrap();
        assert_eq!(
            read_frame(&mut stream).await.unwrap(),
            PeerMessage::Piece {
                piece_index: 0,
                offset: 1000,
                data: data[1000..1500].to_vec()
            }
        );

        // A request for the unverified piece ends the connection
        let bad = BlockInfo::new(1, 0, 100);
        stream
            .write_all(&PeerMessage::Request { block: bad }.to_bytes())
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_oversized_request_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(100);
        let (torrent, addr) = seeding(&data, &data, dir.path()).await;

        let mut stream = connect(addr, torrent.info_hash).await;
        Handshake::read_from(&mut stream).await.unwrap();
        read_frame(&mut stream).await.unwrap();
        stream
            .write_all(&PeerMessage::Interested.to_bytes())
            .await
            .unwrap();
        assert_eq!(read_frame(&mut stream).await.unwrap(), PeerMessage::Unchoke);

        let block = BlockInfo::new(0, 0, MAX_REQUEST_LENGTH + 1);
        stream
            .write_all(&PeerMessage::Request { block }.to_bytes())
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }
}
