use crate::error::{BittorrentError, Result};

/// Indices of pieces set in a peer's bitfield.
///
/// Bits past `piece_count` are spare and must be zero. A payload shorter
/// than `piece_count` bits simply marks the uncovered pieces as absent.
pub fn parse(bitfield: &[u8], piece_count: usize) -> Result<Vec<u32>> {
    let mut owned = Vec::new();

    for (byte_index, &byte) in bitfield.iter().enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) == 0 {
                continue;
            }
            let piece_index = byte_index * 8 + bit;
            if piece_index >= piece_count {
                return Err(BittorrentError::ProtocolError(format!(
                    "Spare bit {} set in bitfield for {} pieces",
                    piece_index, piece_count
                )));
            }
            owned.push(piece_index as u32);
        }
    }

    Ok(owned)
}

/// Pack per-piece ownership into a big-endian bitmap
pub fn encode(owned: &[bool]) -> Vec<u8> {
    let mut bitfield = vec![0u8; owned.len().div_ceil(8)];
    for (index, &has) in owned.iter().enumerate() {
        if has {
            bitfield[index / 8] |= 0x80 >> (index % 8);
        }
    }
    bitfield
}
