//! Length-prefixed little-endian wire primitives.
//!
//! Every composite encodes as the concatenation of its fields in declaration
//! order: `u64` as 8 bytes little-endian, `bool` as a single byte, byte
//! strings and sequences behind a `u64` length prefix. Readers take a
//! `&mut &[u8]` cursor and never panic on truncated or malformed input.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("input truncated")]
    Truncated,
    #[error("invalid {0}")]
    Invalid(&'static str),
}

pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(u8::from(v));
}

pub fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_u64(buf, b.len() as u64);
    buf.extend_from_slice(b);
}

pub fn read_u64(b: &mut &[u8]) -> Result<u64, CodecError> {
    if b.len() < 8 {
        return Err(CodecError::Truncated);
    }
    let (head, rest) = b.split_at(8);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(head);
    *b = rest;
    Ok(u64::from_le_bytes(raw))
}

pub fn read_bool(b: &mut &[u8]) -> Result<bool, CodecError> {
    let Some((&first, rest)) = b.split_first() else {
        return Err(CodecError::Truncated);
    };
    *b = rest;
    match first {
        0x00 => Ok(false),
        0x01 => Ok(true),
        _ => Err(CodecError::Invalid("bool")),
    }
}

pub fn read_bytes(b: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = read_u64(b)?;
    let len = usize::try_from(len).map_err(|_| CodecError::Truncated)?;
    if b.len() < len {
        return Err(CodecError::Truncated);
    }
    let (head, rest) = b.split_at(len);
    *b = rest;
    Ok(head.to_vec())
}

/// Read a length-prefixed byte string that must be exactly `N` bytes.
pub fn read_fixed<const N: usize>(b: &mut &[u8]) -> Result<[u8; N], CodecError> {
    read_bytes(b)?
        .try_into()
        .map_err(|_| CodecError::Invalid("fixed-length field"))
}
