//! Recursive-length-prefix encoding.
//!
//! The consensus surfaces that must stay byte-compatible (header seal
//! preimages, header hashes, transaction PoW preimages, genesis allocations)
//! all use RLP. Only the two shapes RLP defines are needed: byte strings and
//! lists, with integers as minimal big-endian strings.

use primitive_types::U256;

/// Errors from RLP decoding.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RlpError {
    #[error("rlp input truncated")]
    Truncated,
    #[error("rlp non-canonical encoding")]
    NonCanonical,
    #[error("rlp trailing bytes after item")]
    TrailingBytes,
    #[error("rlp expected {0}")]
    Expected(&'static str),
    #[error("rlp integer too large for target type")]
    IntegerOverflow,
}

/// A decoded RLP item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Item {
    Bytes(Vec<u8>),
    List(Vec<Item>),
}

impl Item {
    pub fn bytes(data: impl AsRef<[u8]>) -> Item {
        Item::Bytes(data.as_ref().to_vec())
    }

    /// Minimal big-endian integer item (zero encodes as the empty string).
    pub fn uint(value: u64) -> Item {
        Item::Bytes(trim_leading_zeros(&value.to_be_bytes()))
    }

    pub fn big_uint(value: U256) -> Item {
        let mut buf = [0u8; 32];
        value.to_big_endian(&mut buf);
        Item::Bytes(trim_leading_zeros(&buf))
    }

    pub fn as_bytes(&self) -> Result<&[u8], RlpError> {
        match self {
            Item::Bytes(b) => Ok(b),
            Item::List(_) => Err(RlpError::Expected("byte string")),
        }
    }

    pub fn as_list(&self) -> Result<&[Item], RlpError> {
        match self {
            Item::List(items) => Ok(items),
            Item::Bytes(_) => Err(RlpError::Expected("list")),
        }
    }

    pub fn as_u64(&self) -> Result<u64, RlpError> {
        let b = self.as_bytes()?;
        if b.len() > 8 {
            return Err(RlpError::IntegerOverflow);
        }
        if b.first() == Some(&0) {
            return Err(RlpError::NonCanonical);
        }
        let mut out = 0u64;
        for &byte in b {
            out = out << 8 | byte as u64;
        }
        Ok(out)
    }

    pub fn as_u256(&self) -> Result<U256, RlpError> {
        let b = self.as_bytes()?;
        if b.len() > 32 {
            return Err(RlpError::IntegerOverflow);
        }
        if b.first() == Some(&0) {
            return Err(RlpError::NonCanonical);
        }
        Ok(U256::from_big_endian(b))
    }
}

fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

/// Encode a single item.
pub fn encode(item: &Item) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(item, &mut out);
    out
}

/// Encode a list of items (the common top-level shape).
pub fn encode_list(items: &[Item]) -> Vec<u8> {
    encode(&Item::List(items.to_vec()))
}

fn encode_into(item: &Item, out: &mut Vec<u8>) {
    match item {
        Item::Bytes(b) => {
            if b.len() == 1 && b[0] < 0x80 {
                out.push(b[0]);
            } else {
                encode_length(b.len(), 0x80, out);
                out.extend_from_slice(b);
            }
        }
        Item::List(items) => {
            let mut payload = Vec::new();
            for inner in items {
                encode_into(inner, &mut payload);
            }
            encode_length(payload.len(), 0xc0, out);
            out.extend_from_slice(&payload);
        }
    }
}

fn encode_length(len: usize, offset: u8, out: &mut Vec<u8>) {
    if len <= 55 {
        out.push(offset + len as u8);
    } else {
        let len_bytes = trim_leading_zeros(&(len as u64).to_be_bytes());
        out.push(offset + 55 + len_bytes.len() as u8);
        out.extend_from_slice(&len_bytes);
    }
}

/// Decode exactly one item, rejecting trailing bytes.
pub fn decode(data: &[u8]) -> Result<Item, RlpError> {
    let (item, rest) = decode_item(data)?;
    if !rest.is_empty() {
        return Err(RlpError::TrailingBytes);
    }
    Ok(item)
}

fn decode_item(data: &[u8]) -> Result<(Item, &[u8]), RlpError> {
    let (&prefix, rest) = data.split_first().ok_or(RlpError::Truncated)?;
    match prefix {
        0x00..=0x7f => Ok((Item::Bytes(vec![prefix]), rest)),
        0x80..=0xb7 => {
            let len = (prefix - 0x80) as usize;
            let (payload, rest) = split_checked(rest, len)?;
            if len == 1 && payload[0] < 0x80 {
                return Err(RlpError::NonCanonical);
            }
            Ok((Item::Bytes(payload.to_vec()), rest))
        }
        0xb8..=0xbf => {
            let (len, rest) = decode_long_length(rest, (prefix - 0xb7) as usize)?;
            let (payload, rest) = split_checked(rest, len)?;
            Ok((Item::Bytes(payload.to_vec()), rest))
        }
        0xc0..=0xf7 => {
            let len = (prefix - 0xc0) as usize;
            let (payload, rest) = split_checked(rest, len)?;
            Ok((Item::List(decode_list_payload(payload)?), rest))
        }
        0xf8..=0xff => {
            let (len, rest) = decode_long_length(rest, (prefix - 0xf7) as usize)?;
            let (payload, rest) = split_checked(rest, len)?;
            Ok((Item::List(decode_list_payload(payload)?), rest))
        }
    }
}

fn decode_long_length(data: &[u8], len_of_len: usize) -> Result<(usize, &[u8]), RlpError> {
    let (len_bytes, rest) = split_checked(data, len_of_len)?;
    if len_bytes.first() == Some(&0) {
        return Err(RlpError::NonCanonical);
    }
    let mut len = 0usize;
    for &b in len_bytes {
        len = len.checked_mul(256).ok_or(RlpError::IntegerOverflow)? + b as usize;
    }
    if len <= 55 {
        return Err(RlpError::NonCanonical);
    }
    Ok((len, rest))
}

fn decode_list_payload(mut payload: &[u8]) -> Result<Vec<Item>, RlpError> {
    let mut items = Vec::new();
    while !payload.is_empty() {
        let (item, rest) = decode_item(payload)?;
        items.push(item);
        payload = rest;
    }
    Ok(items)
}

fn split_checked(data: &[u8], len: usize) -> Result<(&[u8], &[u8]), RlpError> {
    if data.len() < len {
        return Err(RlpError::Truncated);
    }
    Ok(data.split_at(len))
}
