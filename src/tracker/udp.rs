use super::{Peer, TrackerEvent, TrackerRequest, TrackerResponse};
use crate::error::{BittorrentError, Result};
use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};
use url::Url;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Announce over UDP: a connect exchange followed by an announce exchange,
/// each matched by transaction id.
pub struct UdpTracker {
    url: String,
    connect_timeout: Duration,
    announce_timeout: Duration,
}

impl UdpTracker {
    pub fn new(url: &str, connect_timeout: Duration, announce_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            connect_timeout,
            announce_timeout,
        }
    }

    pub async fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse> {
        let addr = self.resolve().await?;
        let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;

        let connection_id = self.connect(&socket).await?;
        debug!("UDP tracker {} connection id {:#x}", addr, connection_id);

        let transaction_id: u32 = rand::thread_rng().gen();
        socket
            .send(&announce_packet(connection_id, transaction_id, request))
            .await?;
        let reply = await_reply(
            &socket,
            transaction_id,
            ACTION_ANNOUNCE,
            20,
            self.announce_timeout,
        )
        .await?;

        let mut body = &reply[8..];
        let interval = body.get_u32() as u64;
        let leechers = body.get_u32() as u64;
        let seeders = body.get_u32() as u64;
        let peers = Peer::from_compact_list(body);

        info!(
            "Received {} peers from {} (interval: {}s)",
            peers.len(),
            self.url,
            interval
        );

        Ok(TrackerResponse {
            interval,
            min_interval: None,
            tracker_id: None,
            seeders,
            leechers,
            peers,
        })
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let url = Url::parse(&self.url)?;
        let host = url
            .host_str()
            .ok_or_else(|| BittorrentError::UrlParseError(format!("No host in {}", self.url)))?;
        let port = url
            .port()
            .ok_or_else(|| BittorrentError::UrlParseError(format!("No port in {}", self.url)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let addr = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| BittorrentError::TrackerError(format!("Cannot resolve {}", host)));
        addr
    }

    async fn connect(&self, socket: &UdpSocket) -> Result<u64> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let mut packet = BytesMut::with_capacity(16);
        packet.put_u64(PROTOCOL_ID);
        packet.put_u32(ACTION_CONNECT);
        packet.put_u32(transaction_id);
        socket.send(&packet).await?;

        let reply = await_reply(
            socket,
            transaction_id,
            ACTION_CONNECT,
            16,
            self.connect_timeout,
        )
        .await?;
        Ok((&reply[8..16]).get_u64())
    }
}

fn announce_packet(connection_id: u64, transaction_id: u32, request: &TrackerRequest) -> Vec<u8> {
    let mut packet = BytesMut::with_capacity(98);
    packet.put_u64(connection_id);
    packet.put_u32(ACTION_ANNOUNCE);
    packet.put_u32(transaction_id);
    packet.put_slice(&request.info_hash);
    packet.put_slice(&request.peer_id);
    packet.put_u64(request.downloaded);
    packet.put_u64(request.left);
    packet.put_u64(request.uploaded);
    packet.put_u32(TrackerEvent::udp_id(request.event));
    packet.put_u32(0); // ip: sender's address
    packet.put_u32(rand::thread_rng().gen()); // key
    packet.put_i32(-1); // num_want: tracker default
    packet.put_u16(request.port);
    packet.to_vec()
}

/// Wait for a datagram carrying `transaction_id`. Datagrams with any other
/// transaction id are discarded and the wait continues until `wait` runs out.
async fn await_reply(
    socket: &UdpSocket,
    transaction_id: u32,
    action: u32,
    min_len: usize,
    wait: Duration,
) -> Result<Vec<u8>> {
    let deadline = Instant::now() + wait;
    let mut buf = vec![0u8; 2048];

    loop {
        let n = match timeout_at(deadline, socket.recv(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => {
                return Err(BittorrentError::Timeout(format!(
                    "No UDP tracker reply within {:?}",
                    wait
                )))
            }
        };
        if n < 8 {
            debug!("Ignoring {} byte UDP datagram", n);
            continue;
        }

        let mut header = &buf[..8];
        let reply_action = header.get_u32();
        let reply_tid = header.get_u32();
        if reply_tid != transaction_id {
            debug!(
                "Ignoring UDP reply for transaction {:#x}, want {:#x}",
                reply_tid, transaction_id
            );
            continue;
        }

        if reply_action == ACTION_ERROR {
            return Err(BittorrentError::TrackerError(
                String::from_utf8_lossy(&buf[8..n]).into_owned(),
            ));
        }
        if reply_action != action || n < min_len {
            return Err(BittorrentError::ProtocolError(format!(
                "Unexpected UDP tracker reply: action {}, {} bytes",
                reply_action, n
            )));
        }

        return Ok(buf[..n].to_vec());
    }
}
