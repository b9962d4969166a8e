//! Chunk frame wire format.
//!
//! Every data chunk travels in a single mesh datagram beginning with a
//! fixed 15-byte header, all integers big-endian:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Chunk Frame                           │
//! ├─────────────┬───────┬───────┬──────┬──────────┬──────────────┤
//! │ transfer_id │ total │ index │ comp │  crc32   │  total_size  │
//! │   4 bytes   │  1 B  │  1 B  │ 1 B  │ 4 bytes  │   4 bytes    │
//! ├─────────────┴───────┴───────┴──────┴──────────┴──────────────┤
//! │                      chunk data (≤ 222 bytes)                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - `transfer_id`: random 32-bit identifier chosen per transfer
//! - `total`: chunk count in `[1, 255]`
//! - `index`: zero-based, strictly less than `total`
//! - `comp`: `0` raw payload, `1` compressed payload
//! - `crc32`: CRC32 (IEEE) of the full on-wire payload
//! - `total_size`: byte length of the full on-wire payload
//!
//! Parsers here are pure; nothing in this module touches the link.

use crate::error::{Error, Result};
use crate::MAX_FRAME;

/// Chunk header size in bytes.
pub const HEADER_SIZE: usize = 15;

/// Header of a single data chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Random per-transfer identifier
    pub transfer_id: u32,
    /// Total number of chunks in the transfer
    pub total_chunks: u8,
    /// Zero-based index of this chunk
    pub chunk_index: u8,
    /// Whether the full payload is compressed
    pub compressed: bool,
    /// CRC32 of the full on-wire payload
    pub crc32: u32,
    /// Byte length of the full on-wire payload
    pub total_size: u32,
}

impl ChunkHeader {
    /// Encode the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.transfer_id.to_be_bytes());
        buf[4] = self.total_chunks;
        buf[5] = self.chunk_index;
        buf[6] = u8::from(self.compressed);
        buf[7..11].copy_from_slice(&self.crc32.to_be_bytes());
        buf[11..15].copy_from_slice(&self.total_size.to_be_bytes());
        buf
    }

    /// Decode a header from the start of a frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedHeader`] if the slice is shorter than the
    /// header, declares zero chunks, carries an out-of-range index, or uses
    /// an unknown compression marker.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::MalformedHeader(format!(
                "frame too short: {} bytes",
                buf.len()
            )));
        }

        let transfer_id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let total_chunks = buf[4];
        let chunk_index = buf[5];

        if total_chunks == 0 {
            return Err(Error::MalformedHeader("zero total chunks".to_string()));
        }
        if chunk_index >= total_chunks {
            return Err(Error::MalformedHeader(format!(
                "chunk index {chunk_index} out of range for {total_chunks} chunks"
            )));
        }

        let compressed = match buf[6] {
            0 => false,
            1 => true,
            other => {
                return Err(Error::MalformedHeader(format!(
                    "unknown compression marker: {other:#04x}"
                )));
            }
        };

        let crc32 = u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);
        let total_size = u32::from_be_bytes([buf[11], buf[12], buf[13], buf[14]]);

        Ok(Self {
            transfer_id,
            total_chunks,
            chunk_index,
            compressed,
            crc32,
            total_size,
        })
    }
}

/// Encode a complete chunk frame (header plus data).
///
/// # Errors
///
/// Returns [`Error::FrameTooLarge`] if the encoded frame would exceed the
/// link datagram limit.
pub fn encode_chunk(header: &ChunkHeader, data: &[u8]) -> Result<Vec<u8>> {
    let len = HEADER_SIZE + data.len();
    if len > MAX_FRAME {
        return Err(Error::FrameTooLarge {
            len,
            max: MAX_FRAME,
        });
    }

    let mut frame = Vec::with_capacity(len);
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(data);
    Ok(frame)
}

/// Decode a chunk frame into its header and data bytes.
///
/// # Errors
///
/// Returns [`Error::FrameTooLarge`] for frames over the link limit and
/// [`Error::MalformedHeader`] for anything the header parser rejects.
pub fn decode_chunk(frame: &[u8]) -> Result<(ChunkHeader, &[u8])> {
    if frame.len() > MAX_FRAME {
        return Err(Error::FrameTooLarge {
            len: frame.len(),
            max: MAX_FRAME,
        });
    }

    let header = ChunkHeader::decode(frame)?;
    Ok((header, &frame[HEADER_SIZE..]))
}

/// Data bytes carried per chunk for a given configured chunk size.
#[must_use]
pub const fn data_per_chunk(chunk_size: usize) -> usize {
    chunk_size - HEADER_SIZE
}

/// Number of chunks needed to carry `total_size` payload bytes.
///
/// # Errors
///
/// Returns [`Error::PayloadTooLarge`] if the payload does not fit in 255
/// chunks, and [`Error::MalformedHeader`] for an empty payload.
#[allow(clippy::cast_possible_truncation)]
pub fn chunk_count(total_size: usize, chunk_size: usize) -> Result<u8> {
    if total_size == 0 {
        return Err(Error::MalformedHeader("empty payload".to_string()));
    }

    let per_chunk = data_per_chunk(chunk_size);
    let count = total_size.div_ceil(per_chunk);
    if count > usize::from(u8::MAX) {
        return Err(Error::PayloadTooLarge {
            len: total_size,
            max: per_chunk * usize::from(u8::MAX),
        });
    }

    Ok(count as u8)
}
