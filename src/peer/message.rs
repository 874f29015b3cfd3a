use crate::error::{BittorrentError, Result};
use crate::piece::BlockInfo;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frames larger than this are treated as a protocol violation
pub const MAX_FRAME_LENGTH: usize = 1 << 21;

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Zero-length frame, no id
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { block: BlockInfo },
    Piece {
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel { block: BlockInfo },
    /// DHT listen port
    Port { port: u16 },
    /// Any id we do not understand; kept so the session can skip it
    Unknown { id: u8, payload: Vec<u8> },
}

impl PeerMessage {
    const CHOKE: u8 = 0;
    const UNCHOKE: u8 = 1;
    const INTERESTED: u8 = 2;
    const NOT_INTERESTED: u8 = 3;
    const HAVE: u8 = 4;
    const BITFIELD: u8 = 5;
    const REQUEST: u8 = 6;
    const PIECE: u8 = 7;
    const CANCEL: u8 = 8;
    const PORT: u8 = 9;

    /// Wire id, `None` for keep-alive
    pub fn id(&self) -> Option<u8> {
        let id = match self {
            PeerMessage::KeepAlive => return None,
            PeerMessage::Choke => Self::CHOKE,
            PeerMessage::Unchoke => Self::UNCHOKE,
            PeerMessage::Interested => Self::INTERESTED,
            PeerMessage::NotInterested => Self::NOT_INTERESTED,
            PeerMessage::Have { .. } => Self::HAVE,
            PeerMessage::Bitfield { .. } => Self::BITFIELD,
            PeerMessage::Request { .. } => Self::REQUEST,
            PeerMessage::Piece { .. } => Self::PIECE,
            PeerMessage::Cancel { .. } => Self::CANCEL,
            PeerMessage::Port { .. } => Self::PORT,
            PeerMessage::Unknown { id, .. } => *id,
        };
        Some(id)
    }

    fn payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            PeerMessage::KeepAlive
            | PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => {}
            PeerMessage::Have { piece_index } => buf.put_u32(*piece_index),
            PeerMessage::Bitfield { bitfield } => buf.put_slice(bitfield),
            PeerMessage::Request { block } | PeerMessage::Cancel { block } => {
                buf.put_u32(block.piece_index);
                buf.put_u32(block.offset);
                buf.put_u32(block.length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(*piece_index);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            PeerMessage::Port { port } => buf.put_u16(*port),
            PeerMessage::Unknown { payload, .. } => buf.put_slice(payload),
        }
        buf.to_vec()
    }

    /// Serialize to `<length prefix><message ID><payload>`
    pub fn to_bytes(&self) -> Vec<u8> {
        match self.id() {
            Some(id) => encode_frame(id, &self.payload()),
            None => vec![0u8; 4],
        }
    }

    /// Deserialize a complete frame, length prefix included
    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(BittorrentError::IncompleteFrame { expected: 4 });
        }

        let length = data.get_u32() as usize;
        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if data.len() < length {
            return Err(BittorrentError::IncompleteFrame { expected: length });
        }

        Self::from_body(&data[..length])
    }

    /// Decode a frame body (`<message ID><payload>`)
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let Some((&message_id, mut payload)) = body.split_first() else {
            return Ok(PeerMessage::KeepAlive);
        };

        let message = match message_id {
            Self::CHOKE => PeerMessage::Choke,
            Self::UNCHOKE => PeerMessage::Unchoke,
            Self::INTERESTED => PeerMessage::Interested,
            Self::NOT_INTERESTED => PeerMessage::NotInterested,
            Self::HAVE => {
                expect_len(payload, 4, "have")?;
                PeerMessage::Have {
                    piece_index: payload.get_u32(),
                }
            }
            Self::BITFIELD => PeerMessage::Bitfield {
                bitfield: payload.to_vec(),
            },
            Self::REQUEST | Self::CANCEL => {
                let name = if message_id == Self::REQUEST {
                    "request"
                } else {
                    "cancel"
                };
                expect_len(payload, 12, name)?;
                let block = BlockInfo::new(payload.get_u32(), payload.get_u32(), payload.get_u32());
                if message_id == Self::REQUEST {
                    PeerMessage::Request { block }
                } else {
                    PeerMessage::Cancel { block }
                }
            }
            Self::PIECE => {
                if payload.len() < 8 {
                    return Err(BittorrentError::ProtocolError(
                        "Invalid piece message".to_string(),
                    ));
                }
                let piece_index = payload.get_u32();
                let offset = payload.get_u32();
                PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: payload.to_vec(),
                }
            }
            Self::PORT => {
                expect_len(payload, 2, "port")?;
                PeerMessage::Port {
                    port: payload.get_u16(),
                }
            }
            id => PeerMessage::Unknown {
                id,
                payload: payload.to_vec(),
            },
        };

        Ok(message)
    }
}

fn expect_len(payload: &[u8], len: usize, name: &str) -> Result<()> {
    if payload.len() != len {
        return Err(BittorrentError::ProtocolError(format!(
            "Invalid {} message: {} byte payload",
            name,
            payload.len()
        )));
    }
    Ok(())
}

/// `<4-byte big-endian length><id><payload>`, length = payload + 1
pub fn encode_frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u32((payload.len() + 1) as u32);
    buf.put_u8(id);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Fill `buf` completely; a stream ending early is an incomplete frame
pub(crate) async fn read_exactly<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(BittorrentError::IncompleteFrame {
                expected: buf.len(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Read one length-prefixed frame
pub async fn read_frame<R>(reader: &mut R) -> Result<PeerMessage>
where
    R: AsyncRead + Unpin,
{
    let mut length_buf = [0u8; 4];
    read_exactly(reader, &mut length_buf).await?;

    let length = u32::from_be_bytes(length_buf) as usize;
    if length == 0 {
        return Ok(PeerMessage::KeepAlive);
    }
    if length > MAX_FRAME_LENGTH {
        return Err(BittorrentError::ProtocolError(format!(
            "Frame of {} bytes exceeds limit",
            length
        )));
    }

    let mut body = vec![0u8; length];
    read_exactly(reader, &mut body).await?;
    PeerMessage::from_body(&body)
}
