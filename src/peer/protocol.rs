use super::message::read_exactly;
use crate::error::{BittorrentError, Result};
use tokio::io::AsyncRead;

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// pstrlen + pstr + reserved + info_hash + peer_id
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

/// Handshake message for peer wire protocol
/// Format: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        // 20..28 reserved, left zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LEN {
            return Err(BittorrentError::IncompleteFrame {
                expected: HANDSHAKE_LEN,
            });
        }

        if data[0] as usize != PROTOCOL_STRING.len() {
            return Err(BittorrentError::ProtocolError(format!(
                "Invalid protocol string length {}",
                data[0]
            )));
        }

        if &data[1..20] != PROTOCOL_STRING {
            return Err(BittorrentError::ProtocolError(
                "Invalid protocol string".to_string(),
            ));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }

    /// Read exactly one handshake from the stream
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; HANDSHAKE_LEN];
        read_exactly(reader, &mut buf).await?;
        Self::from_bytes(&buf)
    }
}
