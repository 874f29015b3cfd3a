use super::{generate_peer_id, FileInfo, Torrent};
use crate::bencode::{decode, raw_dict_value, BencodeValue};
use crate::error::{BittorrentError, Result};
use sha1::{Digest, Sha1};
use std::path::Path;
use tokio::fs;

/// Load and parse a .torrent file
pub async fn load_torrent_file<P: AsRef<Path>>(path: P) -> Result<Torrent> {
    let data = fs::read(path).await?;
    parse_torrent(&data)
}

/// Parse a bencoded metainfo buffer into a `Torrent`
pub fn parse_torrent(data: &[u8]) -> Result<Torrent> {
    let root = decode(data)?;

    let announce = root
        .get_str("announce")
        .ok_or_else(|| invalid("Missing 'announce' field"))?
        .to_string();

    // Tiers are flattened; only schemes we can announce to are kept
    let announce_list = root
        .get_list("announce-list")
        .unwrap_or_default()
        .iter()
        .filter_map(BencodeValue::as_list)
        .flatten()
        .filter_map(BencodeValue::as_str)
        .filter(|url| {
            url.starts_with("udp://") || url.starts_with("http://") || url.starts_with("https://")
        })
        .map(String::from)
        .collect();

    let info = root.get("info").ok_or_else(|| invalid("Missing 'info' field"))?;
    let raw_info = raw_dict_value(data, b"info")?.ok_or_else(|| invalid("Missing 'info' field"))?;
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&Sha1::digest(raw_info));

    let name = info
        .get_str("name")
        .ok_or_else(|| invalid("Missing 'name' field"))?
        .to_string();

    let piece_length = info
        .get_int("piece length")
        .filter(|&len| len > 0)
        .ok_or_else(|| invalid("Missing 'piece length' field"))? as u64;

    let pieces = info
        .get_bytes("pieces")
        .ok_or_else(|| invalid("Missing 'pieces' field"))?;
    if pieces.len() % 20 != 0 {
        return Err(invalid("Pieces length must be multiple of 20"));
    }
    let piece_hashes: Vec<[u8; 20]> = pieces
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let files = match (info.get_int("length"), info.get_list("files")) {
        (Some(length), _) => vec![FileInfo {
            path: vec![name.clone()],
            length: non_negative(length)?,
        }],
        (None, Some(entries)) => entries
            .iter()
            .map(|entry| parse_file_entry(&name, entry))
            .collect::<Result<Vec<_>>>()?,
        (None, None) => return Err(invalid("Missing 'length' or 'files' field")),
    };

    let total_length: u64 = files.iter().map(|f| f.length).sum();
    let expected_pieces = total_length.div_ceil(piece_length) as usize;
    if expected_pieces != piece_hashes.len() {
        return Err(invalid(&format!(
            "Expected {} piece hashes for {} bytes, found {}",
            expected_pieces,
            total_length,
            piece_hashes.len()
        )));
    }

    Ok(Torrent {
        name,
        announce,
        announce_list,
        info_hash,
        piece_length,
        piece_hashes,
        files,
        total_length,
        peer_id: generate_peer_id(),
    })
}

/// Multi-file entries live under a directory named after the torrent
fn parse_file_entry(name: &str, entry: &BencodeValue) -> Result<FileInfo> {
    let length = entry
        .get_int("length")
        .ok_or_else(|| invalid("Missing file 'length'"))?;

    let mut path = vec![name.to_string()];
    for component in entry
        .get_list("path")
        .ok_or_else(|| invalid("Missing file 'path'"))?
    {
        let component = component
            .as_str()
            .ok_or_else(|| invalid("Invalid path component"))?;
        if component.is_empty() || component == "." || component == ".." || component.contains('/') {
            return Err(invalid(&format!("Unsafe path component: {:?}", component)));
        }
        path.push(component.to_string());
    }

    Ok(FileInfo {
        path,
        length: non_negative(length)?,
    })
}

fn non_negative(length: i64) -> Result<u64> {
    u64::try_from(length).map_err(|_| invalid("Negative file length"))
}

fn invalid(msg: &str) -> BittorrentError {
    BittorrentError::InvalidTorrent(msg.to_string())
}
