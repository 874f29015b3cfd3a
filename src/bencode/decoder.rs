use super::BencodeValue;
use crate::error::{BittorrentError, Result};
use std::collections::BTreeMap;

/// Lists and dictionaries nested deeper than this are rejected
const MAX_DEPTH: usize = 64;

/// Decode a complete bencoded buffer; trailing bytes are an error
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    let mut decoder = Decoder::new(data);
    let value = decoder.value()?;
    if decoder.pos != data.len() {
        return Err(BittorrentError::BencodeError(format!(
            "Trailing data after value at byte {}",
            decoder.pos
        )));
    }
    Ok(value)
}

/// Return the raw encoded bytes of `key` in a top-level dictionary.
///
/// The info-hash is computed over the bytes exactly as they appear in the
/// file, so the value is sliced out rather than re-encoded.
pub fn raw_dict_value<'a>(data: &'a [u8], key: &[u8]) -> Result<Option<&'a [u8]>> {
    let mut decoder = Decoder::new(data);
    decoder.expect(b'd')?;

    while decoder.peek()? != b'e' {
        let entry_key = decoder.byte_string()?;
        let start = decoder.pos;
        decoder.value()?;
        if entry_key == key {
            return Ok(Some(&data[start..decoder.pos]));
        }
    }

    Ok(None)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Result<u8> {
        self.data.get(self.pos).copied().ok_or_else(|| {
            BittorrentError::BencodeError("Unexpected end of input".to_string())
        })
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        let found = self.peek()?;
        if found != byte {
            return Err(BittorrentError::BencodeError(format!(
                "Expected '{}' at byte {}, found '{}'",
                byte as char, self.pos, found as char
            )));
        }
        self.pos += 1;
        Ok(())
    }

    /// Consume bytes up to (not including) `terminator` and return them
    fn take_until(&mut self, terminator: u8) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let len = rest.iter().position(|&b| b == terminator).ok_or_else(|| {
            BittorrentError::BencodeError(format!(
                "Missing '{}' terminator",
                terminator as char
            ))
        })?;
        self.pos += len;
        Ok(&rest[..len])
    }

    fn value(&mut self) -> Result<BencodeValue> {
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => Ok(BencodeValue::String(self.byte_string()?.to_vec())),
            c => Err(BittorrentError::BencodeError(format!(
                "Invalid bencode token: {}",
                c as char
            ))),
        }
    }

    fn integer(&mut self) -> Result<BencodeValue> {
        self.expect(b'i')?;
        let digits = self.take_until(b'e')?;
        self.pos += 1;

        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(BencodeValue::Integer)
            .ok_or_else(|| BittorrentError::BencodeError("Invalid integer".to_string()))
    }

    fn byte_string(&mut self) -> Result<&'a [u8]> {
        let digits = self.take_until(b':')?;
        self.pos += 1;

        let len = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| BittorrentError::BencodeError("Invalid string length".to_string()))?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                BittorrentError::BencodeError("String length exceeds data".to_string())
            })?;

        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(BittorrentError::BencodeError(format!(
                "Nesting deeper than {} at byte {}",
                MAX_DEPTH, self.pos
            )));
        }
        Ok(())
    }

    fn list(&mut self) -> Result<BencodeValue> {
        self.expect(b'l')?;
        self.enter()?;
        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.value()?);
        }
        self.pos += 1;
        self.depth -= 1;
        Ok(BencodeValue::List(list))
    }

    fn dict(&mut self) -> Result<BencodeValue> {
        self.expect(b'd')?;
        self.enter()?;
        let mut dict = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = self.byte_string()?.to_vec();
            let value = self.value()?;
            dict.insert(key, value);
        }
        self.pos += 1;
        self.depth -= 1;
        Ok(BencodeValue::Dict(dict))
    }
}
