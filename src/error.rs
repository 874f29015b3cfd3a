use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BittorrentError {
    #[error("Bencode parsing error: {0}")]
    BencodeError(String),

    #[error("Invalid torrent file: {0}")]
    InvalidTorrent(String),

    #[error("Tracker error: {0}")]
    TrackerError(String),

    #[error("All trackers unreachable ({attempted} tried)")]
    TrackerUnreachable { attempted: usize },

    #[error("Connection to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Info hash mismatch: expected {expected}, received {received}")]
    HandshakeMismatch { expected: String, received: String },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Incomplete frame: expected {expected} bytes")]
    IncompleteFrame { expected: usize },

    #[error("Block size mismatch for piece {piece} offset {offset}: expected {expected}, got {actual}")]
    SizeMismatch {
        piece: u32,
        offset: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Piece {0} failed hash verification")]
    PieceCorrupt(u32),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(String),
}

impl From<url::ParseError> for BittorrentError {
    fn from(err: url::ParseError) -> Self {
        BittorrentError::UrlParseError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BittorrentError>;
