use super::Peer;
use crate::bencode::BencodeValue;
use crate::error::{BittorrentError, Result};
use std::net::IpAddr;
use tracing::debug;

/// Outcome of a successful announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    /// Seconds to wait before the next announce
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub tracker_id: Option<String>,
    pub seeders: u64,
    pub leechers: u64,
    pub peers: Vec<Peer>,
}

impl TrackerResponse {
    /// Interpret a bencoded HTTP tracker response.
    ///
    /// A `failure reason` key is an application-level error reported by the
    /// tracker, distinct from transport failures.
    pub fn from_bencode(value: &BencodeValue) -> Result<Self> {
        if value.as_dict().is_none() {
            return Err(BittorrentError::TrackerError(
                "Response must be a dict".to_string(),
            ));
        }

        if let Some(failure) = value.get("failure reason") {
            let reason = failure
                .as_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_else(|| "Unknown failure".to_string());
            return Err(BittorrentError::TrackerError(reason));
        }

        let count = |key: &str| value.get_int(key).map(|i| i.max(0) as u64);

        let interval = count("interval").ok_or_else(|| {
            BittorrentError::TrackerError("Missing 'interval' field".to_string())
        })?;

        let peers = match value.get("peers") {
            Some(BencodeValue::String(compact)) => Peer::from_compact_list(compact),
            Some(BencodeValue::List(entries)) => entries.iter().filter_map(parse_peer_dict).collect(),
            Some(_) => {
                return Err(BittorrentError::TrackerError(
                    "Invalid 'peers' format".to_string(),
                ))
            }
            None => Vec::new(),
        };

        Ok(TrackerResponse {
            interval,
            min_interval: count("min interval"),
            tracker_id: value.get_str("tracker id").map(String::from),
            seeders: count("complete").unwrap_or(0),
            leechers: count("incomplete").unwrap_or(0),
            peers,
        })
    }
}

/// Dictionary-model peer; malformed entries are skipped
fn parse_peer_dict(entry: &BencodeValue) -> Option<Peer> {
    let ip: IpAddr = match entry.get_str("ip").map(str::parse) {
        Some(Ok(ip)) => ip,
        _ => {
            debug!("Skipping peer entry without a usable 'ip'");
            return None;
        }
    };
    let port = u16::try_from(entry.get_int("port")?).ok()?;

    Some(match entry.get_bytes("peer id") {
        Some(id) => Peer::with_peer_id(ip, port, id.to_vec()),
        None => Peer::new(ip, port),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{decode, encode};

    #[test]
    fn test_compact_peers() {
        let body = encode(&BencodeValue::dict([
            ("interval", BencodeValue::Integer(1800)),
            ("complete", BencodeValue::Integer(3)),
            ("incomplete", BencodeValue::Integer(5)),
            ("peers", BencodeValue::from(vec![192, 168, 1, 9, 0x1a, 0xe1])),
        ]));
        let response = TrackerResponse::from_bencode(&decode(&body).unwrap()).unwrap();

        assert_eq!(response.interval, 1800);
        assert_eq!((response.seeders, response.leechers), (3, 5));
        assert_eq!(response.peers, vec![Peer::new("192.168.1.9".parse().unwrap(), 6881)]);
    }

    #[test]
    fn test_dictionary_peers() {
        let body = encode(&BencodeValue::dict([
            ("interval", BencodeValue::Integer(60)),
            (
                "peers",
                BencodeValue::List(vec![
                    BencodeValue::dict([
                        ("ip", BencodeValue::from("10.1.2.3")),
                        ("port", BencodeValue::Integer(51413)),
                        ("peer id", BencodeValue::from(vec![1u8; 20])),
                    ]),
                    BencodeValue::dict([
                        ("ip", BencodeValue::from("::1")),
                        ("port", BencodeValue::Integer(6881)),
                    ]),
                    BencodeValue::dict([("ip", BencodeValue::from("not-an-ip"))]),
                ]),
            ),
        ]));
        let response = TrackerResponse::from_bencode(&decode(&body).unwrap()).unwrap();

        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].addr, "10.1.2.3:51413".parse().unwrap());
        assert_eq!(response.peers[0].peer_id, Some(vec![1u8; 20]));
        assert_eq!(response.peers[1].addr, "[::1]:6881".parse().unwrap());
    }

    #[test]
    fn test_failure_reason() {
        let body = encode(&BencodeValue::dict([(
            "failure reason",
            BencodeValue::from("unregistered torrent"),
        )]));
        let err = TrackerResponse::from_bencode(&decode(&body).unwrap()).unwrap_err();
        assert!(matches!(err, BittorrentError::TrackerError(ref r) if r == "unregistered torrent"));
    }
}
