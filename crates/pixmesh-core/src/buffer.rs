//! Receiver-side reassembly buffers.
//!
//! One [`TransferBuffer`] exists per `(peer, transfer_id)` key, created on
//! the first chunk seen and destroyed after a successful save or once a
//! timed-out buffer ages past the hard threshold. The buffer is a pure
//! data structure; the receiver engine serializes all mutation.

use tokio::time::Instant;

use crate::frame::ChunkHeader;
use crate::link::NodeId;

/// Unique identity of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferKey {
    /// Originating mesh node
    pub peer: NodeId,
    /// Sender-chosen random identifier
    pub transfer_id: u32,
}

impl std::fmt::Display for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}@{:08x}", self.transfer_id, self.peer)
    }
}

/// Result of inserting a chunk into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First time this slot was filled
    New,
    /// Slot already held identical-position data; counted, not an error
    Duplicate,
    /// Chunk disagreed with the buffer and was discarded
    Rejected,
}

/// Lifecycle state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Chunks still arriving (or expected)
    Active,
    /// Went silent past the transfer timeout, or failed verification
    Timeout,
    /// Reassembled, verified, and surfaced
    Complete,
}

/// Per-transfer reassembly state.
#[derive(Debug)]
pub struct TransferBuffer {
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    expected_total_size: u32,
    expected_crc: u32,
    compressed: bool,
    full_chunk_len: Option<usize>,
    duplicates: u32,
    started_at: Instant,
    last_update: Instant,
    status: BufferStatus,
}

impl TransferBuffer {
    /// Create a buffer from the first chunk header seen for a transfer.
    #[must_use]
    pub fn new(header: &ChunkHeader) -> Self {
        let now = Instant::now();
        Self {
            chunks: vec![None; usize::from(header.total_chunks)],
            received: 0,
            expected_total_size: header.total_size,
            expected_crc: header.crc32,
            compressed: header.compressed,
            full_chunk_len: None,
            duplicates: 0,
            started_at: now,
            last_update: now,
            status: BufferStatus::Active,
        }
    }

    /// Whether a later chunk header agrees with the parameters this buffer
    /// was created with. A disagreeing header means a new transfer reused
    /// the id mid-flight and is treated as spurious.
    #[must_use]
    pub fn matches(&self, header: &ChunkHeader) -> bool {
        usize::from(header.total_chunks) == self.chunks.len()
            && header.total_size == self.expected_total_size
            && header.crc32 == self.expected_crc
            && header.compressed == self.compressed
    }

    /// Insert chunk data at the given index.
    pub fn insert(&mut self, index: u8, bytes: &[u8]) -> InsertOutcome {
        let index = usize::from(index);
        if index >= self.chunks.len() {
            return InsertOutcome::Rejected;
        }

        // Every chunk but the last carries the same number of data bytes.
        if index < self.chunks.len() - 1 {
            match self.full_chunk_len {
                Some(len) if len != bytes.len() => return InsertOutcome::Rejected,
                Some(_) => {}
                None => self.full_chunk_len = Some(bytes.len()),
            }
        }

        self.touch();
        if self.chunks[index].is_some() {
            self.duplicates += 1;
            return InsertOutcome::Duplicate;
        }

        self.chunks[index] = Some(bytes.to_vec());
        self.received += 1;
        InsertOutcome::New
    }

    /// Whether every slot is filled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received == self.chunks.len()
    }

    /// Concatenate all slots into the on-wire payload.
    ///
    /// Only meaningful once [`Self::is_complete`] holds; missing slots are
    /// skipped.
    #[must_use]
    pub fn assemble(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.expected_total_size as usize);
        for slot in self.chunks.iter().flatten() {
            payload.extend_from_slice(slot);
        }
        payload
    }

    /// Indices of slots still empty, ascending.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn missing(&self) -> Vec<u8> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i as u8)
            .collect()
    }

    /// Advance the last-update timestamp.
    pub fn touch(&mut self) {
        self.last_update = Instant::now();
    }

    /// Total chunks expected.
    #[must_use]
    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Chunks received so far.
    #[must_use]
    pub const fn chunks_received(&self) -> usize {
        self.received
    }

    /// Payload bytes received so far.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.chunks
            .iter()
            .flatten()
            .map(|slot| slot.len() as u64)
            .sum()
    }

    /// Advertised on-wire payload size.
    #[must_use]
    pub const fn expected_total_size(&self) -> u32 {
        self.expected_total_size
    }

    /// Advertised payload checksum.
    #[must_use]
    pub const fn expected_crc(&self) -> u32 {
        self.expected_crc
    }

    /// Whether the payload is compressed on the wire.
    #[must_use]
    pub const fn compressed(&self) -> bool {
        self.compressed
    }

    /// Duplicate insertions observed.
    #[must_use]
    pub const fn duplicates(&self) -> u32 {
        self.duplicates
    }

    /// When the first chunk arrived.
    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    /// When the buffer last made progress.
    #[must_use]
    pub const fn last_update(&self) -> Instant {
        self.last_update
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn status(&self) -> BufferStatus {
        self.status
    }

    /// Transition the lifecycle state.
    pub fn set_status(&mut self, status: BufferStatus) {
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(total_chunks: u8, total_size: u32) -> ChunkHeader {
        ChunkHeader {
            transfer_id: 0x0101_0202,
            total_chunks,
            chunk_index: 0,
            compressed: false,
            crc32: 0xAAAA_BBBB,
            total_size,
        }
    }

    #[test]
    fn test_insert_new_then_duplicate() {
        let mut buffer = TransferBuffer::new(&header(3, 30));
        assert_eq!(buffer.insert(0, &[1u8; 10]), InsertOutcome::New);
        assert_eq!(buffer.insert(0, &[1u8; 10]), InsertOutcome::Duplicate);
        assert_eq!(buffer.duplicates(), 1);
        assert_eq!(buffer.chunks_received(), 1);
    }

    #[test]
    fn test_insert_out_of_range_rejected() {
        let mut buffer = TransferBuffer::new(&header(3, 30));
        assert_eq!(buffer.insert(3, &[0u8; 10]), InsertOutcome::Rejected);
    }

    #[test]
    fn test_insert_rejects_inconsistent_full_chunk_length() {
        let mut buffer = TransferBuffer::new(&header(4, 35));
        assert_eq!(buffer.insert(0, &[0u8; 10]), InsertOutcome::New);
        assert_eq!(buffer.insert(1, &[0u8; 9]), InsertOutcome::Rejected);
        // Short last chunk is fine
        assert_eq!(buffer.insert(3, &[0u8; 5]), InsertOutcome::New);
    }

    #[test]
    fn test_completion_and_assembly() {
        let mut buffer = TransferBuffer::new(&header(3, 25));
        assert!(!buffer.is_complete());
        buffer.insert(2, &[3u8; 5]);
        buffer.insert(0, &[1u8; 10]);
        assert_eq!(buffer.missing(), vec![1]);
        buffer.insert(1, &[2u8; 10]);
        assert!(buffer.is_complete());
        assert!(buffer.missing().is_empty());

        let payload = buffer.assemble();
        assert_eq!(payload.len(), 25);
        assert_eq!(&payload[..10], &[1u8; 10]);
        assert_eq!(&payload[10..20], &[2u8; 10]);
        assert_eq!(&payload[20..], &[3u8; 5]);
    }

    #[test]
    fn test_matches_detects_reused_id() {
        let buffer = TransferBuffer::new(&header(3, 30));
        assert!(buffer.matches(&header(3, 30)));

        let mut other = header(3, 31);
        assert!(!buffer.matches(&other));
        other = header(4, 30);
        assert!(!buffer.matches(&other));
        other = header(3, 30);
        other.compressed = true;
        assert!(!buffer.matches(&other));
    }

    #[test]
    fn test_status_transitions() {
        let mut buffer = TransferBuffer::new(&header(2, 20));
        assert_eq!(buffer.status(), BufferStatus::Active);
        buffer.set_status(BufferStatus::Timeout);
        assert_eq!(buffer.status(), BufferStatus::Timeout);
        buffer.set_status(BufferStatus::Complete);
        assert_eq!(buffer.status(), BufferStatus::Complete);
    }

    #[test]
    fn test_bytes_received_tracks_partial_progress() {
        let mut buffer = TransferBuffer::new(&header(3, 25));
        assert_eq!(buffer.bytes_received(), 0);
        buffer.insert(0, &[0u8; 10]);
        buffer.insert(2, &[0u8; 5]);
        assert_eq!(buffer.bytes_received(), 15);
    }
}
