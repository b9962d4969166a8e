//! Receiver engine.
//!
//! A single worker drains the inbound frame queue, so all mutation of the
//! reassembly buffers is serialized. Control strings sharing the data port
//! are routed to the sender engine's inbox; everything else goes through
//! the chunk parser into a per-`(peer, transfer_id)` buffer.
//!
//! A periodic sweep drives recovery: long-silent active buffers get a
//! `REQ:` listing their missing chunks, buffers silent past the transfer
//! timeout transition to `timeout`, and timed-out buffers past the hard
//! age threshold are dropped.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::buffer::{BufferStatus, InsertOutcome, TransferBuffer, TransferKey};
use crate::control::{self, ControlEvent, ControlMessage, FrameKind};
use crate::error::{Error, FailureKind, Result};
use crate::frame;
use crate::integrity;
use crate::link::{InboundFrame, LinkSession, NodeId};
use crate::progress::{TransferProgress, TransferSink, TransferState};

/// How often the stall sweep runs.
pub const STALL_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Silence on an active buffer before a `REQ:` is emitted.
pub const STALL_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Silence on an active buffer before it transitions to `timeout`.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// How many times the completion `OK:` is sent.
pub const OK_REPEAT: u32 = 3;

/// Spacing between repeated `OK:` sends.
pub const OK_SPACING: Duration = Duration::from_millis(250);

/// Receiver engine tunables.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Sweep period
    pub stall_check_interval: Duration,
    /// Silence before a missing-chunk request
    pub stall_request_timeout: Duration,
    /// Silence before an active buffer times out
    pub transfer_timeout: Duration,
    /// Completion confirmations per transfer
    pub ok_repeat: u32,
    /// Spacing between confirmations
    pub ok_spacing: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            stall_check_interval: STALL_CHECK_INTERVAL,
            stall_request_timeout: STALL_REQUEST_TIMEOUT,
            transfer_timeout: TRANSFER_TIMEOUT,
            ok_repeat: OK_REPEAT,
            ok_spacing: OK_SPACING,
        }
    }
}

/// Live diagnostic counters, readable from any thread.
#[derive(Debug, Default)]
pub struct ReceiverCounters {
    /// Frames delivered by the link
    pub frames: AtomicU64,
    /// Chunks that filled a new slot
    pub chunks_new: AtomicU64,
    /// Duplicate chunk deliveries
    pub duplicates: AtomicU64,
    /// Frames dropped (malformed, spurious, or unroutable)
    pub dropped: AtomicU64,
    /// Control messages forwarded to the sender engine
    pub control_routed: AtomicU64,
    /// Transfers completed and surfaced
    pub completed: AtomicU64,
    /// Transfers failed terminally
    pub failed: AtomicU64,
    /// Reassembly buffers currently held
    pub buffers: AtomicU64,
}

impl ReceiverCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Receiver engine. Consumed by [`Receiver::run`].
pub struct Receiver {
    link: Arc<LinkSession>,
    sink: Arc<dyn TransferSink>,
    config: ReceiverConfig,
    buffers: HashMap<TransferKey, TransferBuffer>,
    control_tx: Option<mpsc::Sender<ControlEvent>>,
    counters: Arc<ReceiverCounters>,
}

impl Receiver {
    /// Create a receiver engine.
    #[must_use]
    pub fn new(link: Arc<LinkSession>, sink: Arc<dyn TransferSink>, config: ReceiverConfig) -> Self {
        Self {
            link,
            sink,
            config,
            buffers: HashMap::new(),
            control_tx: None,
            counters: Arc::new(ReceiverCounters::default()),
        }
    }

    /// Forward inbound control messages to a sender engine's inbox.
    #[must_use]
    pub fn with_control_forwarding(mut self, control_tx: mpsc::Sender<ControlEvent>) -> Self {
        self.control_tx = Some(control_tx);
        self
    }

    /// Handle to the live counters.
    #[must_use]
    pub fn counters(&self) -> Arc<ReceiverCounters> {
        Arc::clone(&self.counters)
    }

    /// Drain the inbound queue until the link driver closes it.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<InboundFrame>) {
        let mut sweep = tokio::time::interval(self.config.stall_check_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep().await,
            }
        }

        tracing::info!("receiver stopped: inbound queue closed");
    }

    async fn handle_frame(&mut self, frame: InboundFrame) {
        ReceiverCounters::bump(&self.counters.frames);

        match control::classify(&frame.payload) {
            FrameKind::Control(message) => self.route_control(frame.peer, message),
            FrameKind::Data => self.handle_chunk(frame.peer, &frame.payload).await,
        }
    }

    fn route_control(&self, peer: NodeId, message: ControlMessage) {
        let Some(control_tx) = &self.control_tx else {
            tracing::debug!(peer, "control message with no sender engine attached");
            ReceiverCounters::bump(&self.counters.dropped);
            return;
        };

        let event = ControlEvent { peer, message };
        if control_tx.try_send(event).is_err() {
            tracing::warn!(peer, "control inbox full, dropping message");
            ReceiverCounters::bump(&self.counters.dropped);
        } else {
            ReceiverCounters::bump(&self.counters.control_routed);
        }
    }

    async fn handle_chunk(&mut self, peer: NodeId, payload: &[u8]) {
        let sink = Arc::clone(&self.sink);
        let counters = Arc::clone(&self.counters);

        let (header, data) = match frame::decode_chunk(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(peer, "dropping frame: {e}");
                ReceiverCounters::bump(&counters.dropped);
                return;
            }
        };

        let key = TransferKey {
            peer,
            transfer_id: header.transfer_id,
        };

        let buffer = match self.buffers.entry(key) {
            Entry::Occupied(entry) => {
                if !entry.get().matches(&header) {
                    // A new transfer reusing a live id mid-flight is spurious.
                    tracing::debug!(%key, "chunk disagrees with buffer parameters, dropping");
                    ReceiverCounters::bump(&counters.dropped);
                    return;
                }
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                tracing::info!(
                    %key,
                    total_chunks = header.total_chunks,
                    total_size = header.total_size,
                    compressed = header.compressed,
                    "new incoming transfer"
                );
                let buffer = entry.insert(TransferBuffer::new(&header));
                counters.buffers.fetch_add(1, Ordering::Relaxed);
                buffer
            }
        };

        match buffer.insert(header.chunk_index, data) {
            InsertOutcome::New => {
                ReceiverCounters::bump(&counters.chunks_new);
                let progress = Self::snapshot(buffer);
                sink.on_progress(&key, &progress);
            }
            InsertOutcome::Duplicate => {
                tracing::debug!(%key, index = header.chunk_index, "duplicate chunk");
                ReceiverCounters::bump(&counters.duplicates);
            }
            InsertOutcome::Rejected => {
                ReceiverCounters::bump(&counters.dropped);
                return;
            }
        }

        let done = buffer.status() == BufferStatus::Active && buffer.is_complete();
        if done {
            self.complete(key).await;
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn snapshot(buffer: &TransferBuffer) -> TransferProgress {
        let mut progress = TransferProgress::new(
            buffer.total_chunks() as u32,
            u64::from(buffer.expected_total_size()),
            Duration::ZERO,
        );
        progress.state = TransferState::Receiving;
        progress.started_at = buffer.started_at();
        progress.bytes_transferred = buffer.bytes_received();
        progress.chunks_transferred = buffer.chunks_received() as u32;

        // Estimate the pace from what has arrived so far.
        let received = progress.chunks_transferred;
        if received > 0 {
            progress.current_delay = buffer.started_at().elapsed() / received;
            progress.update_eta();
        }
        progress
    }

    async fn complete(&mut self, key: TransferKey) {
        let Some(buffer) = self.buffers.get_mut(&key) else {
            return;
        };

        let payload = buffer.assemble();
        if payload.len() != buffer.expected_total_size() as usize {
            tracing::warn!(
                %key,
                len = payload.len(),
                expected = buffer.expected_total_size(),
                "assembled size disagrees with header"
            );
            buffer.set_status(BufferStatus::Timeout);
            ReceiverCounters::bump(&self.counters.failed);
            self.sink.on_failure(&key, FailureKind::MalformedInput);
            return;
        }

        let blob = match Self::verify_payload(buffer, payload) {
            Ok(blob) => blob,
            Err(e) => {
                let kind = match &e {
                    Error::Decompress(_) => FailureKind::DecompressError,
                    _ => FailureKind::CrcMismatch,
                };
                tracing::warn!(%key, "discarding reassembled payload, keeping buffer for inspection: {e}");
                buffer.set_status(BufferStatus::Timeout);
                ReceiverCounters::bump(&self.counters.failed);
                self.sink.on_failure(&key, kind);
                return;
            }
        };

        buffer.set_status(BufferStatus::Complete);
        ReceiverCounters::bump(&self.counters.completed);
        tracing::info!(
            %key,
            bytes = blob.len(),
            duplicates = buffer.duplicates(),
            elapsed_secs = buffer.started_at().elapsed().as_secs(),
            "transfer complete"
        );
        self.sink.on_complete(&key, blob);

        // Confirm off the worker so the queue keeps draining; the repeats
        // improve the odds of at least one landing on a lossy link.
        let link = Arc::clone(&self.link);
        let confirm = ControlMessage::Ok {
            transfer_id: key.transfer_id,
        };
        let (repeat, spacing) = (self.config.ok_repeat, self.config.ok_spacing);
        tokio::spawn(async move {
            let encoded = confirm.encode();
            for attempt in 0..repeat {
                if let Err(e) = link.send(key.peer, &encoded, false).await {
                    tracing::warn!(%key, "failed to send OK: {e}");
                }
                if attempt + 1 < repeat {
                    tokio::time::sleep(spacing).await;
                }
            }
        });
    }

    /// Check the reassembled payload against the advertised checksum and
    /// undo compression.
    fn verify_payload(buffer: &TransferBuffer, payload: Vec<u8>) -> Result<Vec<u8>> {
        let actual = integrity::crc32(&payload);
        if actual != buffer.expected_crc() {
            return Err(Error::CrcMismatch {
                expected: buffer.expected_crc(),
                actual,
            });
        }

        if buffer.compressed() {
            integrity::decompress(&payload)
        } else {
            Ok(payload)
        }
    }

    async fn sweep(&mut self) {
        let now = Instant::now();
        let hard_age = self.config.transfer_timeout * 2;
        let mut requests: Vec<(NodeId, ControlMessage)> = Vec::new();
        let mut timed_out: Vec<TransferKey> = Vec::new();

        self.buffers.retain(|key, buffer| {
            let idle = now.saturating_duration_since(buffer.last_update());
            match buffer.status() {
                BufferStatus::Complete => false,
                BufferStatus::Timeout => idle <= hard_age,
                BufferStatus::Active => {
                    if idle > self.config.transfer_timeout {
                        buffer.set_status(BufferStatus::Timeout);
                        timed_out.push(*key);
                    } else if idle > self.config.stall_request_timeout {
                        let missing = buffer.missing();
                        if !missing.is_empty() {
                            tracing::debug!(
                                %key,
                                missing = missing.len(),
                                idle_secs = idle.as_secs(),
                                "requesting missing chunks"
                            );
                            for message in control::req_batches(key.transfer_id, &missing) {
                                requests.push((key.peer, message));
                            }
                        }
                    }
                    true
                }
            }
        });

        self.counters
            .buffers
            .store(self.buffers.len() as u64, Ordering::Relaxed);

        for key in timed_out {
            tracing::warn!(%key, "transfer timed out");
            ReceiverCounters::bump(&self.counters.failed);
            self.sink.on_failure(&key, FailureKind::Timeout);
        }

        for (peer, message) in requests {
            if let Err(e) = self.link.send(peer, &message.encode(), false).await {
                tracing::warn!(peer, "failed to send REQ: {e}");
            }
        }
    }
}
