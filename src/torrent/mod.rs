mod metainfo;

pub use metainfo::{load_torrent_file, parse_torrent};

use rand::Rng;

/// A file inside the torrent's logical byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Path components relative to the download directory
    pub path: Vec<String>,
    pub length: u64,
}

/// Decoded, immutable torrent descriptor shared by every component
#[derive(Debug, Clone)]
pub struct Torrent {
    pub name: String,
    pub announce: String,
    pub announce_list: Vec<String>,
    pub info_hash: [u8; 20],
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileInfo>,
    pub total_length: u64,
    /// Our own peer id, generated once per loaded torrent
    pub peer_id: [u8; 20],
}

impl Torrent {
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`; only the last piece may be shorter
    pub fn piece_len(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        self.total_length
            .saturating_sub(start)
            .min(self.piece_length)
    }

    /// Tracker URLs in the order they should be tried: `announce` first,
    /// then the flattened announce-list, without duplicates.
    pub fn tracker_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::with_capacity(1 + self.announce_list.len());
        for url in std::iter::once(&self.announce).chain(self.announce_list.iter()) {
            if !url.is_empty() && !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// Generate an Azureus-style peer ID: `-PP0001-` followed by 12 random digits
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[0..8].copy_from_slice(b"-PP0001-");

    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[8..] {
        *byte = rng.gen_range(b'0'..=b'9');
    }

    peer_id
}
