use crate::error::Result;
use crate::peer::{PeerSession, SessionConfig};
use crate::piece::PieceStore;
use crate::server::PeerServer;
use crate::torrent::{load_torrent_file, Torrent};
use crate::tracker::{Peer, TrackerClient, TrackerEvent, TrackerRequest};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Configuration for the BitTorrent client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub download_dir: PathBuf,
    /// The peer server binds the first free port in this range
    pub listen_ports: RangeInclusive<u16>,
    pub max_peers: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Pending blocks older than this are returned to the pool
    pub request_timeout: Duration,
    pub sweep_interval: Duration,
    pub pipeline_depth: usize,
    /// Bound on one HTTP tracker announce
    pub tracker_timeout: Duration,
    pub udp_connect_timeout: Duration,
    pub udp_announce_timeout: Duration,
    /// Wait before the next announce when every tracker failed
    pub announce_retry: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            listen_ports: 6881..=6889,
            max_peers: 50,
            connect_timeout: Duration::from_secs(50),
            read_timeout: Duration::from_secs(50),
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            pipeline_depth: 5,
            tracker_timeout: Duration::from_secs(30),
            udp_connect_timeout: Duration::from_secs(5),
            udp_announce_timeout: Duration::from_secs(60),
            announce_retry: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            request_timeout: self.request_timeout,
            pipeline_depth: self.pipeline_depth,
            ..SessionConfig::default()
        }
    }
}

/// Main BitTorrent client
pub struct TorrentClient {
    config: ClientConfig,
    tracker: TrackerClient,
}

impl TorrentClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let tracker = TrackerClient::with_timeouts(
            config.tracker_timeout,
            config.udp_connect_timeout,
            config.udp_announce_timeout,
        )?;
        Ok(Self { config, tracker })
    }

    /// Tell the trackers we are leaving; failures are only logged
    async fn announce_stopped(&self, torrent: &Torrent, store: &PieceStore, port: u16) {
        let request = TrackerRequest::new(
            torrent.info_hash,
            torrent.peer_id,
            port,
            store.remaining_bytes().await,
        )
        .with_event(Some(TrackerEvent::Stopped));
        if let Err(e) = self.tracker.announce(&torrent.tracker_urls(), &request).await {
            debug!("Stopped announce for {} failed: {}", torrent.name, e);
        }
    }

    async fn bind_server(&self) -> Result<PeerServer> {
        PeerServer::bind(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.config.listen_ports.clone(),
            self.config.read_timeout,
        )
        .await
    }

    /// Download a torrent, serving already-verified pieces to other peers
    /// while it runs
    pub async fn download(&self, torrent_path: &Path) -> Result<()> {
        info!("Starting download for: {}", torrent_path.display());

        let torrent = Arc::new(load_torrent_file(torrent_path).await?);
        info!("Torrent: {}", torrent.name);
        info!("Total size: {} bytes", torrent.total_length);
        info!("Pieces: {}", torrent.piece_count());
        info!("Info hash: {}", torrent.info_hash_hex());

        let store = Arc::new(PieceStore::open(&self.config.download_dir, &torrent).await?);
        let found = store.verify_existing().await?;
        if found > 0 {
            info!("Resuming with {}/{} pieces on disk", found, store.piece_count());
        }

        let mut server = self.bind_server().await?;
        server.host(Arc::clone(&torrent), Arc::clone(&store));
        let port = server.local_addr()?.port();
        let server_task = tokio::spawn(server.run());

        let finished = tokio::select! {
            result = self.swarm(&torrent, &store, port) => result.map(|()| true),
            _ = tokio::signal::ctrl_c() => Ok(false),
        };
        server_task.abort();
        self.announce_stopped(&torrent, &store, port).await;

        if finished? {
            info!("Download complete: {}", torrent.name);
        } else {
            info!(
                "Interrupted with {}/{} pieces of {}",
                store.completed_count(),
                store.piece_count(),
                torrent.name
            );
        }
        Ok(())
    }

    /// Announce, fan out sessions, and re-announce until every piece verifies
    async fn swarm(&self, torrent: &Arc<Torrent>, store: &Arc<PieceStore>, port: u16) -> Result<()> {
        let urls = torrent.tracker_urls();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = spawn_sweeper(
            Arc::clone(store),
            self.config.sweep_interval,
            self.config.request_timeout,
            shutdown_rx.clone(),
        );

        let mut sessions: JoinSet<SocketAddr> = JoinSet::new();
        let mut active: HashSet<SocketAddr> = HashSet::new();
        let mut event = Some(TrackerEvent::Started);

        'announce: while !store.is_complete() {
            let request = TrackerRequest::new(
                torrent.info_hash,
                torrent.peer_id,
                port,
                store.remaining_bytes().await,
            )
            .with_event(event);

            let wait = match self.tracker.announce(&urls, &request).await {
                Ok(response) => {
                    event = None;
                    info!(
                        "{} seeders, {} leechers, {} peers",
                        response.seeders,
                        response.leechers,
                        response.peers.len()
                    );
                    for peer in response.peers {
                        if active.len() >= self.config.max_peers {
                            break;
                        }
                        if !active.insert(peer.addr) {
                            continue;
                        }
                        self.spawn_session(&mut sessions, peer, torrent, store, &shutdown_rx);
                    }
                    Duration::from_secs(response.interval.max(1))
                }
                Err(e) => {
                    warn!("Announce failed: {}", e);
                    self.config.announce_retry
                }
            };

            let reannounce = tokio::time::sleep(wait);
            tokio::pin!(reannounce);
            loop {
                tokio::select! {
                    _ = store.wait_complete() => break 'announce,
                    _ = &mut reannounce => break,
                    Some(joined) = sessions.join_next() => {
                        if let Ok(addr) = joined {
                            active.remove(&addr);
                        }
                    }
                }
            }
        }

        let _ = shutdown_tx.send(true);
        while sessions.join_next().await.is_some() {}
        sweeper.abort();

        // Best effort; the data is already on disk
        let request = TrackerRequest::new(torrent.info_hash, torrent.peer_id, port, 0)
            .with_event(Some(TrackerEvent::Completed));
        if let Err(e) = self.tracker.announce(&urls, &request).await {
            debug!("Completed announce failed: {}", e);
        }

        Ok(())
    }

    fn spawn_session(
        &self,
        sessions: &mut JoinSet<SocketAddr>,
        peer: Peer,
        torrent: &Arc<Torrent>,
        store: &Arc<PieceStore>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let mut session = PeerSession::new(
            peer.addr,
            Arc::clone(torrent),
            Arc::clone(store),
            self.config.session_config(),
            shutdown.clone(),
        );
        sessions.spawn(async move {
            // Failures are logged by the session itself
            let _ = session.run().await;
            session.addr()
        });
    }

    /// Host every torrent whose data already sits in the download directory
    pub async fn seed(&self, torrent_paths: &[PathBuf]) -> Result<()> {
        let mut server = self.bind_server().await?;
        let port = server.local_addr()?.port();
        let mut hosted = Vec::with_capacity(torrent_paths.len());

        for path in torrent_paths {
            let torrent = Arc::new(load_torrent_file(path).await?);
            let store = Arc::new(PieceStore::open(&self.config.download_dir, &torrent).await?);
            let found = store.verify_existing().await?;
            info!(
                "{}: {}/{} pieces verified",
                torrent.name,
                found,
                store.piece_count()
            );

            let request = TrackerRequest::new(
                torrent.info_hash,
                torrent.peer_id,
                port,
                store.remaining_bytes().await,
            )
            .with_event(Some(TrackerEvent::Started));
            if let Err(e) = self.tracker.announce(&torrent.tracker_urls(), &request).await {
                warn!("Announce for {} failed: {}", torrent.name, e);
            }

            server.host(Arc::clone(&torrent), Arc::clone(&store));
            hosted.push((torrent, store));
        }

        tokio::select! {
            result = server.run() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                for (torrent, store) in &hosted {
                    self.announce_stopped(torrent, store, port).await;
                }
                Ok(())
            }
        }
    }
}

/// Periodically hand blocks stuck in `Pending` back to the pool
fn spawn_sweeper(
    store: Arc<PieceStore>,
    every: Duration,
    older_than: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let released = store.release_stuck_blocks(older_than).await;
                    if released > 0 {
                        debug!("Released {} stuck blocks", released);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encode, BencodeValue};
    use crate::torrent::tests::torrent_for;
    use sha1::{Digest, Sha1};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 253) as u8).collect()
    }

    async fn seeder(torrent: &Arc<Torrent>, dir: &Path) -> SocketAddr {
        let store = Arc::new(PieceStore::open(dir, torrent).await.unwrap());
        assert_eq!(store.verify_existing().await.unwrap(), torrent.piece_count());
        let mut server = PeerServer::bind(LOCALHOST, 0..=0, Duration::from_secs(5))
            .await
            .unwrap();
        server.host(Arc::clone(torrent), store);
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_sessions_fetch_from_two_seeders() {
        let data = sample(16384 + 8000);
        let torrent = Arc::new(torrent_for(&data, 16384, &[("payload.bin", data.len() as u64)]));

        let mut seeders = Vec::new();
        let mut seed_dirs = Vec::new();
        for _ in 0..2 {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("payload.bin"), &data).unwrap();
            seeders.push(seeder(&torrent, dir.path()).await);
            seed_dirs.push(dir);
        }

        let target = tempfile::tempdir().unwrap();
        let store = Arc::new(PieceStore::open(target.path(), &torrent).await.unwrap());
        let (_shutdown, rx) = watch::channel(false);
        let config = SessionConfig {
            read_timeout: Duration::from_secs(5),
            pipeline_depth: 1,
            ..SessionConfig::default()
        };

        let mut sessions = JoinSet::new();
        for addr in &seeders {
            let mut session = PeerSession::new(
                *addr,
                Arc::clone(&torrent),
                Arc::clone(&store),
                config.clone(),
                rx.clone(),
            );
            sessions.spawn(async move { session.run().await });
        }

        tokio::time::timeout(Duration::from_secs(10), store.wait_complete())
            .await
            .unwrap();
        while let Some(joined) = sessions.join_next().await {
            joined.unwrap().unwrap();
        }

        assert_eq!(store.completed_count(), 2);
        assert_eq!(std::fs::read(target.path().join("payload.bin")).unwrap(), data);
    }

    fn torrent_file(data: &[u8], piece_length: usize, announce: &str) -> Vec<u8> {
        let pieces: Vec<u8> = data
            .chunks(piece_length)
            .flat_map(|chunk| Sha1::digest(chunk).to_vec())
            .collect();
        encode(&BencodeValue::dict([
            ("announce", BencodeValue::from(announce)),
            (
                "info",
                BencodeValue::dict([
                    ("name", BencodeValue::from("movie.bin")),
                    ("length", BencodeValue::Integer(data.len() as i64)),
                    ("piece length", BencodeValue::Integer(piece_length as i64)),
                    ("pieces", BencodeValue::from(pieces)),
                ]),
            ),
        ]))
    }

    /// HTTP tracker that always answers with `peers`
    /// HTTP tracker that hands out `peers` and records each request line
    async fn fake_tracker(peers: Vec<SocketAddr>) -> (SocketAddr, Arc<StdMutex<Vec<String>>>) {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut compact = Vec::new();
        for peer in &peers {
            if let IpAddr::V4(ip) = peer.ip() {
                compact.extend_from_slice(&ip.octets());
                compact.extend_from_slice(&peer.port().to_be_bytes());
            }
        }
        let body = encode(&BencodeValue::dict([
            ("interval", BencodeValue::Integer(60)),
            ("peers", BencodeValue::from(compact)),
        ]));

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = body.clone();
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let text = String::from_utf8_lossy(&buf[..n]);
                    if let Some(line) = text.lines().next() {
                        log.lock().unwrap().push(line.to_string());
                    }
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                });
            }
        });
        (addr, seen)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_download_through_tracker() {
        let data = sample(3 * 16384 + 123);
        let seed_dir = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();

        // Seeder side uses the same metainfo as the downloader
        let meta_dir = tempfile::tempdir().unwrap();
        let seed_path = meta_dir.path().join("seed.torrent");
        std::fs::write(&seed_path, torrent_file(&data, 16384, "http://127.0.0.1:1/announce")).unwrap();
        let seeded = Arc::new(load_torrent_file(&seed_path).await.unwrap());
        std::fs::write(seed_dir.path().join("movie.bin"), &data).unwrap();
        let seeder_addr = seeder(&seeded, seed_dir.path()).await;

        let (tracker, seen) = fake_tracker(vec![seeder_addr]).await;
        let torrent_path = meta_dir.path().join("movie.torrent");
        std::fs::write(
            &torrent_path,
            torrent_file(&data, 16384, &format!("http://{}/announce", tracker)),
        )
        .unwrap();

        let client = TorrentClient::new(ClientConfig {
            download_dir: target.path().to_path_buf(),
            listen_ports: 0..=0,
            read_timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        })
        .unwrap();
        tokio::time::timeout(Duration::from_secs(20), client.download(&torrent_path))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(std::fs::read(target.path().join("movie.bin")).unwrap(), data);

        let events: Vec<&str> = ["started", "completed", "stopped"]
            .into_iter()
            .filter(|event| {
                let needle = format!("event={}", event);
                seen.lock().unwrap().iter().any(|line| line.contains(&needle))
            })
            .collect();
        assert_eq!(events, ["started", "completed", "stopped"]);
        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert!(last.contains("event=stopped") && last.contains("left=0"), "{}", last);
    }

    #[test]
    fn test_session_config_follows_client_config() {
        let config = ClientConfig {
            connect_timeout: Duration::from_secs(3),
            pipeline_depth: 9,
            ..ClientConfig::default()
        };
        let session = config.session_config();
        assert_eq!(session.connect_timeout, Duration::from_secs(3));
        assert_eq!(session.pipeline_depth, 9);
        assert_eq!(session.keepalive_interval, Duration::from_secs(30));
        assert_eq!(ClientConfig::default().listen_ports, 6881..=6889);
    }
}
