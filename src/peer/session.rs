use super::{bitfield, read_frame, Handshake, PeerMessage, PeerState};
use crate::error::{BittorrentError, Result};
use crate::piece::PieceStore;
use crate::torrent::Torrent;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How often an idle session re-checks the store for claimable work
const TICK: Duration = Duration::from_millis(250);

/// Timeouts and pipelining for one outbound session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Outstanding requests older than this stop counting against the pipeline
    pub request_timeout: Duration,
    pub pipeline_depth: usize,
    pub keepalive_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(50),
            read_timeout: Duration::from_secs(50),
            request_timeout: Duration::from_secs(30),
            pipeline_depth: 5,
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Lifecycle of an outbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    HandshakeSent,
    HandshakeVerified,
    AwaitingUnchoke,
    Active,
    Closed,
    Errored,
}

/// Downloader side of one peer connection.
///
/// Sessions never reconnect; a failed session ends in `Errored` and the
/// caller may build a fresh one for the same address.
pub struct PeerSession {
    addr: SocketAddr,
    torrent: Arc<Torrent>,
    store: Arc<PieceStore>,
    config: SessionConfig,
    state: SessionState,
    flags: PeerState,
    remote_id: Option<[u8; 20]>,
    /// Requests sent and not yet answered, keyed by (piece, offset)
    in_flight: HashMap<(u32, u32), Instant>,
    last_sent: Instant,
    shutdown: watch::Receiver<bool>,
}

impl PeerSession {
    pub fn new(
        addr: SocketAddr,
        torrent: Arc<Torrent>,
        store: Arc<PieceStore>,
        config: SessionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            addr,
            torrent,
            store,
            config,
            state: SessionState::Disconnected,
            flags: PeerState::default(),
            remote_id: None,
            in_flight: HashMap::new(),
            last_sent: Instant::now(),
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn flags(&self) -> &PeerState {
        &self.flags
    }

    pub fn remote_peer_id(&self) -> Option<&[u8; 20]> {
        self.remote_id.as_ref()
    }

    fn transition(&mut self, next: SessionState) {
        debug!("{}: {:?} -> {:?}", self.addr, self.state, next);
        self.state = next;
    }

    /// Drive the connection until the torrent completes, the peer goes
    /// away, or shutdown is signalled. Pending blocks this session claimed
    /// are always handed back to the store on exit.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.drive().await;

        self.in_flight.clear();
        self.store.release_peer(self.addr).await;

        match &result {
            Ok(()) => self.transition(SessionState::Closed),
            Err(e) => {
                warn!("Session with {} failed: {}", self.addr, e);
                self.transition(SessionState::Errored);
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        self.transition(SessionState::Connecting);
        let mut stream = timeout(self.config.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| BittorrentError::ConnectTimeout(self.addr))??;

        let handshake = Handshake::new(self.torrent.info_hash, self.torrent.peer_id);
        stream.write_all(&handshake.to_bytes()).await?;
        self.transition(SessionState::HandshakeSent);

        let reply = timeout(self.config.read_timeout, Handshake::read_from(&mut stream))
            .await
            .map_err(|_| BittorrentError::Timeout(format!("handshake from {}", self.addr)))??;
        if reply.info_hash != self.torrent.info_hash {
            return Err(BittorrentError::HandshakeMismatch {
                expected: hex::encode(self.torrent.info_hash),
                received: hex::encode(reply.info_hash),
            });
        }
        self.remote_id = Some(reply.peer_id);
        self.transition(SessionState::HandshakeVerified);
        info!("Handshake verified with {}", self.addr);

        let (read_half, mut writer) = stream.into_split();
        self.send(&mut writer, PeerMessage::Interested).await?;
        self.transition(SessionState::AwaitingUnchoke);

        let (tx, mut frames) = mpsc::channel(32);
        let reader = tokio::spawn(read_frames(read_half, tx, self.config.read_timeout));
        let result = self.message_loop(&mut writer, &mut frames).await;
        reader.abort();
        result
    }

    async fn message_loop(
        &mut self,
        writer: &mut OwnedWriteHalf,
        frames: &mut mpsc::Receiver<Result<PeerMessage>>,
    ) -> Result<()> {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *self.shutdown.borrow() {
                debug!("{}: shutdown requested", self.addr);
                return Ok(());
            }
            if self.store.is_complete() {
                let _ = self.send(writer, PeerMessage::NotInterested).await;
                return Ok(());
            }
            if self.state == SessionState::Active {
                self.fill_pipeline(writer).await?;
            }

            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(Ok(message)) => {
                        if !self.handle_message(message).await? {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
                _ = tick.tick() => {
                    self.expire_requests();
                    if self.last_sent.elapsed() >= self.config.keepalive_interval {
                        self.send(writer, PeerMessage::KeepAlive).await?;
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn send(&mut self, writer: &mut OwnedWriteHalf, message: PeerMessage) -> Result<()> {
        writer.write_all(&message.to_bytes()).await?;
        self.last_sent = Instant::now();

        match message {
            PeerMessage::Interested => self.flags.am_interested = true,
            PeerMessage::NotInterested => self.flags.am_interested = false,
            _ => {}
        }
        debug!("Sent message to {}: {:?}", self.addr, message);
        Ok(())
    }

    /// Request Missing blocks of pieces the peer owns, up to the pipeline depth
    async fn fill_pipeline(&mut self, writer: &mut OwnedWriteHalf) -> Result<()> {
        while self.in_flight.len() < self.config.pipeline_depth {
            let Some(block) = self.store.claim_next(self.addr).await else {
                break;
            };
            self.in_flight
                .insert((block.piece_index, block.offset), Instant::now());
            self.send(writer, PeerMessage::Request { block }).await?;
        }
        Ok(())
    }

    /// Stop waiting on requests the peer sat on; the store's sweep frees them
    fn expire_requests(&mut self) {
        let limit = self.config.request_timeout;
        let before = self.in_flight.len();
        self.in_flight.retain(|_, sent| sent.elapsed() < limit);
        if self.in_flight.len() < before {
            debug!(
                "{}: {} requests timed out",
                self.addr,
                before - self.in_flight.len()
            );
        }
    }

    /// Apply one incoming message. Returns `false` when the session should close.
    async fn handle_message(&mut self, message: PeerMessage) -> Result<bool> {
        debug!("Received message from {}: {:?}", self.addr, message.id());

        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                self.flags.peer_choking = true;
                if self.state == SessionState::Active {
                    self.transition(SessionState::AwaitingUnchoke);
                }
                self.in_flight.clear();
                self.store.release_peer(self.addr).await;
            }
            PeerMessage::Unchoke => {
                self.flags.peer_choking = false;
                if self.state == SessionState::AwaitingUnchoke {
                    self.transition(SessionState::Active);
                }
            }
            PeerMessage::Interested => self.flags.peer_interested = true,
            PeerMessage::NotInterested => self.flags.peer_interested = false,
            PeerMessage::Have { piece_index } => {
                self.store.register_ownership(piece_index, self.addr).await?;
            }
            PeerMessage::Bitfield { bitfield } => {
                let owned = bitfield::parse(&bitfield, self.torrent.piece_count())?;
                for piece_index in &owned {
                    self.store.register_ownership(*piece_index, self.addr).await?;
                }
                debug!("{} owns {} pieces", self.addr, owned.len());
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                self.in_flight.remove(&(piece_index, offset));
                match self.store.write_block(piece_index, offset, &data).await {
                    Ok(_) => {}
                    Err(BittorrentError::PieceCorrupt(index)) => {
                        warn!("Piece {} from {} was corrupt", index, self.addr);
                    }
                    Err(e) => return Err(e),
                }
            }
            PeerMessage::Request { block } => {
                debug!(
                    "{}: ignoring request {:?}, uploads go through the server",
                    self.addr, block
                );
            }
            PeerMessage::Cancel { block } => {
                info!("{} cancelled {:?}, closing", self.addr, block);
                return Ok(false);
            }
            PeerMessage::Port { port } => debug!("{} advertised DHT port {}", self.addr, port),
            PeerMessage::Unknown { id, payload } => {
                debug!(
                    "Skipping unknown message id {} ({} bytes) from {}",
                    id,
                    payload.len(),
                    self.addr
                );
            }
        }

        Ok(true)
    }
}

/// Forward frames in receipt order until the stream fails or times out
async fn read_frames(
    mut reader: OwnedReadHalf,
    tx: mpsc::Sender<Result<PeerMessage>>,
    read_timeout: Duration,
) {
    loop {
        let frame = match timeout(read_timeout, read_frame(&mut reader)).await {
            Ok(frame) => frame,
            Err(_) => Err(BittorrentError::Timeout(format!(
                "no frame within {:?}",
                read_timeout
            ))),
        };
        let failed = frame.is_err();
        if tx.send(frame).await.is_err() || failed {
            break;
        }
    }
}
