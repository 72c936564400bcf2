//! Message framing
//!
//! ```text
//! +------+-------+-------------+-----------------+---------+
//! | ZBXD | flags | data length | original length | payload |
//! |  4   |   1   |   4 or 8    |     4 or 8      |         |
//! +------+-------+-------------+-----------------+---------+
//! ```
//!
//! Lengths are little-endian. The original length holds the inflated size
//! of a compressed payload and is zero otherwise. With the large flag set
//! both length fields are eight bytes wide.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use super::error::TransportError;

pub const MAGIC: [u8; 4] = *b"ZBXD";

pub const FLAG_PROTOCOL: u8 = 0x01;
pub const FLAG_COMPRESS: u8 = 0x02;
pub const FLAG_LARGE: u8 = 0x04;

const KNOWN_FLAGS: u8 = FLAG_PROTOCOL | FLAG_COMPRESS | FLAG_LARGE;

/// Magic plus flags byte
pub const PREFIX_LEN: usize = 5;

/// Default receive limit
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 128 * 1024 * 1024;

/// Parsed fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub flags: u8,
    pub data_len: u64,
    pub original_len: u64,
}

impl Header {
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESS != 0
    }

    /// Size of the two length fields for the given flags
    pub fn lengths_size(flags: u8) -> usize {
        if flags & FLAG_LARGE != 0 { 16 } else { 8 }
    }

    /// Validate magic and flags; returns the flags byte
    pub fn parse_prefix(prefix: &[u8; PREFIX_LEN]) -> Result<u8, TransportError> {
        if prefix[..4] != MAGIC {
            return Err(TransportError::InvalidMagic);
        }

        let flags = prefix[4];
        if flags & FLAG_PROTOCOL == 0 || flags & !KNOWN_FLAGS != 0 {
            return Err(TransportError::UnsupportedFlags(flags));
        }

        Ok(flags)
    }

    /// Parse the length fields and enforce the size limit before any
    /// payload is read
    pub fn parse_lengths(flags: u8, lengths: &[u8], max: u64) -> Result<Self, TransportError> {
        let (data_len, original_len) = if flags & FLAG_LARGE != 0 {
            (read_u64(&lengths[..8]), read_u64(&lengths[8..16]))
        } else {
            (
                u64::from(read_u32(&lengths[..4])),
                u64::from(read_u32(&lengths[4..8])),
            )
        };

        let header = Self {
            flags,
            data_len,
            original_len,
        };

        if data_len > max {
            return Err(TransportError::MessageTooLarge {
                size: data_len,
                max,
            });
        }
        if header.is_compressed() && original_len > max {
            return Err(TransportError::MessageTooLarge {
                size: original_len,
                max,
            });
        }

        Ok(header)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Build a complete message
pub fn encode(payload: &[u8], compress: bool) -> Result<Vec<u8>, TransportError> {
    let (body, original_len, mut flags) = if compress {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(payload)
            .map_err(TransportError::Compression)?;
        let body = encoder.finish().map_err(TransportError::Compression)?;
        (body, payload.len() as u64, FLAG_PROTOCOL | FLAG_COMPRESS)
    } else {
        (payload.to_vec(), 0, FLAG_PROTOCOL)
    };

    let data_len = body.len() as u64;
    let large = data_len > u64::from(u32::MAX) || original_len > u64::from(u32::MAX);
    if large {
        flags |= FLAG_LARGE;
    }

    let mut message = Vec::with_capacity(PREFIX_LEN + Header::lengths_size(flags) + body.len());
    message.extend_from_slice(&MAGIC);
    message.push(flags);
    if large {
        message.extend_from_slice(&data_len.to_le_bytes());
        message.extend_from_slice(&original_len.to_le_bytes());
    } else {
        message.extend_from_slice(&(data_len as u32).to_le_bytes());
        message.extend_from_slice(&(original_len as u32).to_le_bytes());
    }
    message.extend_from_slice(&body);

    Ok(message)
}

/// Turn a received body into the payload, inflating when needed
pub fn decode_body(header: &Header, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
    if !header.is_compressed() {
        return Ok(body);
    }

    let expected = header.original_len;
    // capacity is bounded by the size limit checked in parse_lengths
    let mut payload = Vec::with_capacity(expected as usize);
    ZlibDecoder::new(body.as_slice())
        .take(expected.saturating_add(1))
        .read_to_end(&mut payload)
        .map_err(TransportError::Compression)?;

    let actual = payload.len() as u64;
    if actual != expected {
        return Err(TransportError::SizeMismatch { expected, actual });
    }

    Ok(payload)
}

/// Decode a complete message held in memory
pub fn decode(message: &[u8], max: u64) -> Result<Vec<u8>, TransportError> {
    let prefix: &[u8; PREFIX_LEN] = message
        .get(..PREFIX_LEN)
        .and_then(|p| p.try_into().ok())
        .ok_or(TransportError::ConnectionClosed)?;
    let flags = Header::parse_prefix(prefix)?;

    let lengths_end = PREFIX_LEN + Header::lengths_size(flags);
    let lengths = message
        .get(PREFIX_LEN..lengths_end)
        .ok_or(TransportError::ConnectionClosed)?;
    let header = Header::parse_lengths(flags, lengths, max)?;

    let body = message
        .get(lengths_end..)
        .filter(|rest| rest.len() as u64 >= header.data_len)
        .map(|rest| rest[..header.data_len as usize].to_vec())
        .ok_or(TransportError::ConnectionClosed)?;

    decode_body(&header, body)
}
