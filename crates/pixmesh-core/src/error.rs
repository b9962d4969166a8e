//! Error types for Pixmesh.
//!
//! This module provides a unified error type for all transport operations,
//! with specific error variants for different failure modes.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for Pixmesh operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Pixmesh.
#[derive(Error, Debug)]
pub enum Error {
    /// Chunk header failed to parse
    #[error("malformed chunk header: {0}")]
    MalformedHeader(String),

    /// Encoded frame exceeds the link datagram limit
    #[error("frame too large: {len} bytes exceeds link limit of {max}")]
    FrameTooLarge {
        /// Encoded frame length
        len: usize,
        /// Link datagram limit
        max: usize,
    },

    /// Payload cannot be fragmented into at most 255 chunks
    #[error("payload too large: {len} bytes exceeds {max} for this chunk size")]
    PayloadTooLarge {
        /// Payload length
        len: usize,
        /// Maximum payload length for the chosen chunk size
        max: usize,
    },

    /// Control message did not match the control grammar
    #[error("unrecognized control message: {0}")]
    UnknownControl(String),

    /// Reassembled payload checksum did not match the advertised one
    #[error("crc mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch {
        /// Checksum advertised in the chunk headers
        expected: u32,
        /// Checksum computed over the reassembled payload
        actual: u32,
    },

    /// Payload decompression failed
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// Payload compression failed
    #[error("compression failed: {0}")]
    Compression(String),

    /// Wall-clock budget for the operation elapsed
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Link driver reported an error for a single datagram
    #[error("link error: {0}")]
    Link(String),

    /// Link driver lost its session; in-flight transfers cannot continue
    #[error("link session lost")]
    LinkSessionLost,

    /// A link session is already open in this process
    #[error("link session already open in this process")]
    LinkBusy,

    /// Transfer was cancelled by the caller
    #[error("transfer cancelled")]
    Cancelled,

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Configuration file error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Link(_) | Self::Timeout(_) | Self::CrcMismatch { .. }
        )
    }
}

/// Terminal failure classification surfaced through the application sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Reassembled bytes did not match the advertised checksum
    CrcMismatch,
    /// Wall-clock budget elapsed before the transfer completed
    Timeout,
    /// Compressed payload could not be decompressed
    DecompressError,
    /// Reassembled payload was structurally invalid
    MalformedInput,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CrcMismatch => write!(f, "crc mismatch"),
            Self::Timeout => write!(f, "timeout"),
            Self::DecompressError => write!(f, "decompress error"),
            Self::MalformedInput => write!(f, "malformed input"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::Link("busy".to_string()).is_recoverable());
        assert!(Error::Timeout(60).is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
        assert!(!Error::LinkSessionLost.is_recoverable());
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::CrcMismatch.to_string(), "crc mismatch");
        assert_eq!(FailureKind::Timeout.to_string(), "timeout");
    }
}
