//! Live transfer status for UIs.
//!
//! Both engines publish [`TransferProgress`] snapshots: the sender through
//! a `tokio::sync::watch` channel on its handle, the receiver through the
//! [`TransferSink`] callbacks. Observers hold read-only copies and never
//! mutate engine state.

use std::time::Duration;

use tokio::time::Instant;

use crate::buffer::TransferKey;
use crate::error::FailureKind;

/// Coarse state of a transfer, either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Sender is splitting the payload into chunks
    Fragmenting,
    /// Chunks are moving
    Sending,
    /// All chunks issued; waiting for the peer's confirmation
    AwaitingOk,
    /// Receiver is collecting chunks
    Receiving,
    /// Went silent past the transfer timeout
    Timeout,
    /// Delivered and verified
    Completed,
    /// Terminal failure
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

/// Point-in-time snapshot of one transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Current state
    pub state: TransferState,
    /// Payload bytes moved so far
    pub bytes_transferred: u64,
    /// Total on-wire payload bytes
    pub total_bytes: u64,
    /// Chunks moved so far
    pub chunks_transferred: u32,
    /// Total chunks in the transfer
    pub total_chunks: u32,
    /// Link-ack success rate, once enough chunks completed
    pub success_rate: Option<f64>,
    /// Inter-chunk delay currently in force
    pub current_delay: Duration,
    /// When the transfer started
    pub started_at: Instant,
    /// Estimated time remaining
    pub eta: Option<Duration>,
}

impl TransferProgress {
    /// Create a fresh snapshot for a transfer of known size.
    #[must_use]
    pub fn new(total_chunks: u32, total_bytes: u64, current_delay: Duration) -> Self {
        Self {
            state: TransferState::Fragmenting,
            bytes_transferred: 0,
            total_bytes,
            chunks_transferred: 0,
            total_chunks,
            success_rate: None,
            current_delay,
            started_at: Instant::now(),
            eta: None,
        }
    }

    /// Overall progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        }
    }

    /// Recompute the estimate from chunks outstanding and the current delay.
    pub fn update_eta(&mut self) {
        let remaining = self.total_chunks.saturating_sub(self.chunks_transferred);
        self.eta = if remaining == 0 {
            None
        } else {
            Some(self.current_delay.saturating_mul(remaining))
        };
    }
}

/// Application-side callbacks for transfer outcomes.
///
/// Implementations must be cheap and non-blocking; they run on the engine
/// actors.
pub trait TransferSink: Send + Sync {
    /// A transfer made progress.
    fn on_progress(&self, _key: &TransferKey, _progress: &TransferProgress) {}

    /// A transfer completed; `blob` is the decoded original payload.
    fn on_complete(&self, key: &TransferKey, blob: Vec<u8>);

    /// A transfer failed terminally.
    fn on_failure(&self, key: &TransferKey, kind: FailureKind);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage() {
        let mut progress = TransferProgress::new(10, 1850, Duration::from_secs(4));
        assert!((progress.percentage() - 0.0).abs() < f64::EPSILON);
        progress.bytes_transferred = 925;
        assert!((progress.percentage() - 50.0).abs() < f64::EPSILON);

        let empty = TransferProgress::new(0, 0, Duration::from_secs(4));
        assert!((empty.percentage() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_eta_tracks_outstanding_chunks() {
        let mut progress = TransferProgress::new(10, 1850, Duration::from_secs(2));
        progress.chunks_transferred = 4;
        progress.update_eta();
        assert_eq!(progress.eta, Some(Duration::from_secs(12)));

        progress.chunks_transferred = 10;
        progress.update_eta();
        assert_eq!(progress.eta, None);
    }
}
