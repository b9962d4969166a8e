//! Payload integrity and compression.
//!
//! The checksum is CRC32 (IEEE polynomial), computed over the exact bytes
//! that travel on the wire: the compressed payload when compression wins,
//! the raw payload otherwise. Compression uses zstd at a high level and is
//! only kept when it saves at least 5% of the raw size.

use std::io::Cursor;

use crate::error::{Error, Result};

/// Zstd level used for payload compression. Blobs are small and encoded
/// once per transfer, so the slow high level is affordable.
pub const COMPRESSION_LEVEL: i32 = 19;

/// Compressed output must be below this fraction of the raw size to be used.
pub const COMPRESSION_THRESHOLD: f64 = 0.95;

/// CRC32 (IEEE) of the given bytes.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Compress data using zstd.
///
/// # Errors
///
/// Returns an error if compression fails.
pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    let cursor = Cursor::new(data);
    zstd::stream::encode_all(cursor, level)
        .map_err(|e| Error::Compression(format!("zstd compress failed: {e}")))
}

/// Decompress zstd data.
///
/// # Errors
///
/// Returns an error if decompression fails.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let cursor = Cursor::new(data);
    zstd::stream::decode_all(cursor)
        .map_err(|e| Error::Decompress(format!("zstd decompress failed: {e}")))
}

/// Pick the on-wire payload for a blob.
///
/// Attempts compression and keeps it only when the output is smaller than
/// [`COMPRESSION_THRESHOLD`] times the raw size. Returns the chosen bytes
/// and whether they are compressed. A compression failure falls back to the
/// raw payload.
#[must_use]
pub fn maybe_compress(data: &[u8]) -> (Vec<u8>, bool) {
    match compress(data, COMPRESSION_LEVEL) {
        Ok(compressed) => {
            #[allow(clippy::cast_precision_loss)]
            let limit = (data.len() as f64 * COMPRESSION_THRESHOLD) as usize;
            if compressed.len() < limit {
                (compressed, true)
            } else {
                (data.to_vec(), false)
            }
        }
        Err(e) => {
            tracing::debug!("compression skipped: {e}");
            (data.to_vec(), false)
        }
    }
}
