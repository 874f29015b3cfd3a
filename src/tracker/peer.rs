use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// A peer as reported by a tracker.
///
/// Identity is the socket address; the peer id is advisory and absent in
/// compact responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub addr: SocketAddr,
    pub peer_id: Option<Vec<u8>>,
}

impl Peer {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            addr: SocketAddr::new(ip, port),
            peer_id: None,
        }
    }

    pub fn with_peer_id(ip: IpAddr, port: u16, peer_id: Vec<u8>) -> Self {
        Self {
            addr: SocketAddr::new(ip, port),
            peer_id: Some(peer_id),
        }
    }

    /// 6 bytes: 4-byte IPv4 address + 2-byte big-endian port
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        let [a, b, c, d, hi, lo] = <[u8; 6]>::try_from(data).ok()?;
        Some(Self::new(
            IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            u16::from_be_bytes([hi, lo]),
        ))
    }

    /// Parse a compact peer list; a trailing partial entry is ignored
    pub fn from_compact_list(data: &[u8]) -> Vec<Self> {
        data.chunks_exact(6).filter_map(Self::from_compact).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_list() {
        let peers = Peer::from_compact_list(&[127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80, 9]);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].addr, "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1].addr, "10.0.0.2:80".parse().unwrap());
        assert!(peers[0].peer_id.is_none());
    }
}
