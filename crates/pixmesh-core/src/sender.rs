//! Sender engine.
//!
//! The engine is a single task that drives one transfer to completion
//! before starting the next. Inbound control messages arrive through a
//! bounded inbox filled by the link driver's event path (usually the
//! receiver engine's dispatch); the send loop drains the inbox only at
//! safe points, between chunks and during paced sleeps, so the two actors
//! share no mutable state.
//!
//! Per transfer the engine fragments the payload, transmits chunks in
//! index order with link-layer acknowledgement, retries each chunk with
//! exponential backoff, services `REQ:` retransmissions, and finally waits
//! for the peer's `OK:` under an adaptive timeout.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::buffer::TransferKey;
use crate::control::{ControlEvent, ControlMessage};
use crate::error::{Error, FailureKind, Result};
use crate::frame::{self, ChunkHeader};
use crate::integrity;
use crate::link::{LinkSession, NodeId, SendOutcome};
use crate::pacing::{self, AdaptivePacer};
use crate::progress::{TransferProgress, TransferState};
use crate::DEFAULT_CHUNK_SIZE;

/// Retry attempts per chunk after the initial transmission.
pub const MAX_RETRIES: u32 = 3;

/// Backoff before the first retry; doubles per attempt.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Hard deadline on the driver's per-datagram acknowledgement wait.
pub const LINK_ACK_DEADLINE: Duration = Duration::from_secs(30);

const SUBMIT_QUEUE_DEPTH: usize = 8;
const CONTROL_QUEUE_DEPTH: usize = 32;

/// Payload compression choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressMode {
    /// Compress when it saves enough
    #[default]
    Auto,
    /// Never compress
    Off,
}

/// Options for one submitted transfer.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Datagram size budget, header included
    pub chunk_size: usize,
    /// Baseline inter-chunk delay
    pub chunk_delay: Duration,
    /// Let the success rate steer the delay
    pub adaptive: bool,
    /// Pin the delay to the minimum and disable adaptation
    pub fast: bool,
    /// Retry attempts per chunk
    pub max_retries: u32,
    /// Payload compression choice
    pub compress: CompressMode,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: pacing::DEFAULT_CHUNK_DELAY,
            adaptive: true,
            fast: false,
            max_retries: MAX_RETRIES,
            compress: CompressMode::Auto,
        }
    }
}

impl SendOptions {
    /// Check the options against the permitted ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size <= frame::HEADER_SIZE || self.chunk_size > crate::MAX_FRAME {
            return Err(Error::InvalidConfig {
                key: "chunk_size".to_string(),
                reason: format!(
                    "must be in ({}, {}], got {}",
                    frame::HEADER_SIZE,
                    crate::MAX_FRAME,
                    self.chunk_size
                ),
            });
        }
        if !self.fast
            && (self.chunk_delay < pacing::MIN_CHUNK_DELAY
                || self.chunk_delay > pacing::MAX_CHUNK_DELAY)
        {
            return Err(Error::InvalidConfig {
                key: "chunk_delay".to_string(),
                reason: format!(
                    "must be within [{:?}, {:?}], got {:?}",
                    pacing::MIN_CHUNK_DELAY,
                    pacing::MAX_CHUNK_DELAY,
                    self.chunk_delay
                ),
            });
        }
        Ok(())
    }

    fn pacer(&self) -> AdaptivePacer {
        if self.fast {
            AdaptivePacer::fast()
        } else {
            AdaptivePacer::new(self.chunk_delay, self.adaptive)
        }
    }
}

/// Final result of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Peer confirmed the reassembled payload
    Done,
    /// Terminal failure
    Failed(FailureKind),
    /// Cancelled by the caller
    Cancelled,
}

/// Caller-side handle to one submitted transfer.
#[derive(Debug)]
pub struct TransferHandle {
    key: TransferKey,
    cancel_tx: watch::Sender<bool>,
    progress_rx: watch::Receiver<TransferProgress>,
    outcome_rx: oneshot::Receiver<TransferOutcome>,
}

impl TransferHandle {
    /// Identity of the transfer.
    #[must_use]
    pub const fn key(&self) -> TransferKey {
        self.key
    }

    /// A live progress feed for UIs.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress_rx.clone()
    }

    /// Abort the transfer at the next safe point.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Wait for the transfer to finish.
    pub async fn await_completion(self) -> TransferOutcome {
        self.outcome_rx
            .await
            .unwrap_or(TransferOutcome::Cancelled)
    }
}

struct Submission {
    peer: NodeId,
    transfer_id: u32,
    frames: Vec<Vec<u8>>,
    payload_len: usize,
    options: SendOptions,
    cancel_rx: watch::Receiver<bool>,
    progress_tx: watch::Sender<TransferProgress>,
    outcome_tx: oneshot::Sender<TransferOutcome>,
}

/// Sender engine front door.
///
/// [`Sender::spawn`] starts the engine task; [`Sender::send_blob`] submits
/// work to it.
#[derive(Debug)]
pub struct Sender {
    submit_tx: mpsc::Sender<Submission>,
    control_tx: mpsc::Sender<ControlEvent>,
    task: JoinHandle<()>,
}

impl Sender {
    /// Start the engine on the given link session.
    #[must_use]
    pub fn spawn(link: Arc<LinkSession>) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let task = tokio::spawn(engine(link, submit_rx, control_rx));
        Self {
            submit_tx,
            control_tx,
            task,
        }
    }

    /// Inbox for inbound control messages; hand a clone to whatever drains
    /// the link (typically [`crate::receiver::Receiver::with_control_forwarding`]).
    #[must_use]
    pub fn control_inbox(&self) -> mpsc::Sender<ControlEvent> {
        self.control_tx.clone()
    }

    /// Submit a blob for delivery to `peer`.
    ///
    /// The engine drives one transfer at a time; submissions queue up
    /// behind the in-flight one.
    ///
    /// # Errors
    ///
    /// Fails early on invalid options, an empty or oversized blob, or a
    /// stopped engine.
    pub async fn send_blob(
        &self,
        peer: NodeId,
        blob: Vec<u8>,
        options: SendOptions,
    ) -> Result<TransferHandle> {
        options.validate()?;

        let (payload, compressed) = match options.compress {
            CompressMode::Auto => integrity::maybe_compress(&blob),
            CompressMode::Off => (blob, false),
        };

        let total = frame::chunk_count(payload.len(), options.chunk_size)?;
        let crc = integrity::crc32(&payload);
        let transfer_id = rand::thread_rng().gen::<u32>();

        #[allow(clippy::cast_possible_truncation)]
        let header_for = |index: usize| ChunkHeader {
            transfer_id,
            total_chunks: total,
            chunk_index: index as u8,
            compressed,
            crc32: crc,
            total_size: payload.len() as u32,
        };

        let frames = payload
            .chunks(frame::data_per_chunk(options.chunk_size))
            .enumerate()
            .map(|(index, data)| frame::encode_chunk(&header_for(index), data))
            .collect::<Result<Vec<_>>>()?;

        let key = TransferKey { peer, transfer_id };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let initial = TransferProgress::new(
            u32::from(total),
            payload.len() as u64,
            options.pacer().delay(),
        );
        let (progress_tx, progress_rx) = watch::channel(initial);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let submission = Submission {
            peer,
            transfer_id,
            frames,
            payload_len: payload.len(),
            options,
            cancel_rx,
            progress_tx,
            outcome_tx,
        };

        self.submit_tx
            .send(submission)
            .await
            .map_err(|_| Error::Link("sender engine stopped".to_string()))?;

        tracing::info!(%key, chunks = total, compressed, "transfer queued");
        Ok(TransferHandle {
            key,
            cancel_tx,
            progress_rx,
            outcome_rx,
        })
    }

    /// Stop accepting submissions and wait for the engine to drain.
    pub async fn shutdown(self) {
        drop(self.submit_tx);
        let _ = self.task.await;
    }
}

async fn engine(
    link: Arc<LinkSession>,
    mut submit_rx: mpsc::Receiver<Submission>,
    mut control_rx: mpsc::Receiver<ControlEvent>,
) {
    while let Some(submission) = submit_rx.recv().await {
        let Submission {
            peer,
            transfer_id,
            frames,
            payload_len,
            options,
            cancel_rx,
            progress_tx,
            outcome_tx,
        } = submission;

        let key = TransferKey { peer, transfer_id };
        let pacer = options.pacer();
        let mut transfer = Transfer {
            link: link.as_ref(),
            control_rx: &mut control_rx,
            key,
            frames,
            payload_len,
            options,
            pacer,
            retransmit: VecDeque::new(),
            ok_seen: false,
            chunks_sent: 0,
            bytes_sent: 0,
            cancel_rx,
            cancel_dead: false,
            control_closed: false,
            progress_tx,
        };

        let outcome = match transfer.drive().await {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => TransferOutcome::Cancelled,
            Err(e @ Error::Timeout(_)) => {
                tracing::warn!(%key, "no OK from peer: {e}");
                TransferOutcome::Failed(FailureKind::Timeout)
            }
            Err(e) => {
                tracing::warn!(%key, "transfer aborted: {e}");
                TransferOutcome::Failed(FailureKind::Timeout)
            }
        };

        transfer.publish(match outcome {
            TransferOutcome::Done => TransferState::Completed,
            TransferOutcome::Failed(_) => TransferState::Failed,
            TransferOutcome::Cancelled => TransferState::Cancelled,
        });
        tracing::info!(%key, ?outcome, "transfer finished");
        let _ = outcome_tx.send(outcome);
    }
}

/// What woke the engine out of a suspension point.
enum Wake {
    Deadline,
    Cancelled,
    CancelGone,
    Noop,
    Control(Option<ControlEvent>),
}

struct Transfer<'a> {
    link: &'a LinkSession,
    control_rx: &'a mut mpsc::Receiver<ControlEvent>,
    key: TransferKey,
    frames: Vec<Vec<u8>>,
    payload_len: usize,
    options: SendOptions,
    pacer: AdaptivePacer,
    retransmit: VecDeque<u8>,
    ok_seen: bool,
    chunks_sent: u32,
    bytes_sent: u64,
    cancel_rx: watch::Receiver<bool>,
    cancel_dead: bool,
    control_closed: bool,
    progress_tx: watch::Sender<TransferProgress>,
}

impl Transfer<'_> {
    #[allow(clippy::cast_possible_truncation)]
    fn total(&self) -> u8 {
        self.frames.len() as u8
    }

    async fn drive(&mut self) -> Result<TransferOutcome> {
        self.publish(TransferState::Sending);

        for index in 0..self.total() {
            self.check_cancelled()?;
            let acked = self.send_chunk(index).await?;
            self.chunks_sent += 1;
            self.bytes_sent += (self.frames[usize::from(index)].len() - frame::HEADER_SIZE) as u64;
            self.publish(TransferState::Sending);
            tracing::debug!(key = %self.key, index, acked, "chunk issued");

            if self.ok_seen {
                return Ok(TransferOutcome::Done);
            }
            if usize::from(index) + 1 < self.frames.len() {
                self.paced_sleep().await?;
                self.flush_retransmits().await?;
            }
        }

        self.await_confirmation().await
    }

    /// Transmit one chunk, retrying with exponential backoff. Returns
    /// whether the link acknowledged it; exhausting the retries is not an
    /// error because the peer can still recover via `REQ:`.
    async fn send_chunk(&mut self, index: u8) -> Result<bool> {
        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                let backoff = INITIAL_RETRY_DELAY * 2u32.pow(attempt - 1);
                tracing::debug!(key = %self.key, index, attempt, ?backoff, "chunk retry");
                self.sleep_draining_control(backoff).await?;
            }

            let frame = &self.frames[usize::from(index)];
            let sent = tokio::time::timeout(
                LINK_ACK_DEADLINE,
                self.link.send(self.key.peer, frame, true),
            )
            .await;

            match sent {
                Err(_) => {
                    tracing::debug!(key = %self.key, index, "ack wait deadline elapsed");
                }
                Ok(Err(Error::LinkSessionLost)) => return Err(Error::LinkSessionLost),
                Ok(Err(e)) => {
                    tracing::debug!(key = %self.key, index, "link send failed: {e}");
                }
                Ok(Ok(SendOutcome::AckOk)) => {
                    self.pacer.record(true);
                    return Ok(true);
                }
                Ok(Ok(SendOutcome::AckTimeout | SendOutcome::LinkError)) => {
                    tracing::debug!(key = %self.key, index, attempt, "no link ack");
                }
            }
        }

        self.pacer.record(false);
        tracing::warn!(
            key = %self.key,
            index,
            "chunk unacked after retries, relying on peer recovery"
        );
        Ok(false)
    }

    /// Service queued retransmissions, each under the usual retry and
    /// pacing contract.
    async fn flush_retransmits(&mut self) -> Result<()> {
        while let Some(index) = self.retransmit.pop_front() {
            self.check_cancelled()?;
            tracing::debug!(key = %self.key, index, "retransmitting chunk");
            self.send_chunk(index).await?;
            self.publish(TransferState::Sending);
            self.paced_sleep().await?;
        }
        Ok(())
    }

    /// Wait for the peer's `OK:` under the adaptive timeout. A `REQ:`
    /// round extends the deadline once; a second silence fails the
    /// transfer.
    async fn await_confirmation(&mut self) -> Result<TransferOutcome> {
        self.flush_retransmits().await?;
        self.publish(TransferState::AwaitingOk);

        let mut budget = self.timeout_budget();
        let mut deadline = Instant::now() + budget;
        let mut extended = false;

        loop {
            if self.ok_seen {
                return Ok(TransferOutcome::Done);
            }

            match self.wait_for_event(deadline).await {
                Wake::Deadline => return Err(Error::Timeout(budget.as_secs())),
                Wake::Cancelled => return Err(Error::Cancelled),
                Wake::CancelGone => self.cancel_dead = true,
                Wake::Noop => {}
                Wake::Control(event) => {
                    match event {
                        Some(event) => self.absorb(event),
                        None => self.control_closed = true,
                    }
                    if !self.retransmit.is_empty() {
                        self.flush_retransmits().await?;
                        self.publish(TransferState::AwaitingOk);
                        if !extended {
                            extended = true;
                            budget = self.timeout_budget();
                            deadline = Instant::now() + budget;
                        }
                    }
                }
            }
        }
    }

    /// Park until the deadline, a cancel, or a control event.
    async fn wait_for_event(&mut self, deadline: Instant) -> Wake {
        let cancel_dead = self.cancel_dead;
        let control_closed = self.control_closed;
        let cancel_rx = &mut self.cancel_rx;
        let control_rx = &mut *self.control_rx;

        tokio::select! {
            () = tokio::time::sleep_until(deadline) => Wake::Deadline,
            changed = cancel_rx.changed(), if !cancel_dead => match changed {
                Ok(()) if *cancel_rx.borrow() => Wake::Cancelled,
                Ok(()) => Wake::Noop,
                Err(_) => Wake::CancelGone,
            },
            event = control_rx.recv(), if !control_closed => Wake::Control(event),
        }
    }

    fn timeout_budget(&self) -> Duration {
        pacing::transfer_timeout(self.total(), self.pacer.delay())
    }

    /// Sleep the adaptive inter-chunk delay, absorbing control traffic.
    async fn paced_sleep(&mut self) -> Result<()> {
        self.sleep_draining_control(self.pacer.delay()).await
    }

    async fn sleep_draining_control(&mut self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            match self.wait_for_event(deadline).await {
                Wake::Deadline => return Ok(()),
                Wake::Cancelled => return Err(Error::Cancelled),
                Wake::CancelGone => self.cancel_dead = true,
                Wake::Noop => {}
                Wake::Control(event) => match event {
                    Some(event) => self.absorb(event),
                    None => self.control_closed = true,
                },
            }
        }
    }

    fn check_cancelled(&mut self) -> Result<()> {
        if !self.cancel_dead && *self.cancel_rx.borrow() {
            return Err(Error::Cancelled);
        }
        // Absorb anything already queued before the next chunk.
        while let Ok(event) = self.control_rx.try_recv() {
            self.absorb(event);
        }
        Ok(())
    }

    /// Apply one control event. Duplicate `OK:` frames are idempotent;
    /// `REQ:` indices outside the transfer are ignored.
    fn absorb(&mut self, event: ControlEvent) {
        if event.peer != self.key.peer || event.message.transfer_id() != self.key.transfer_id {
            tracing::debug!(
                key = %self.key,
                from = event.peer,
                "control message for another transfer, ignoring"
            );
            return;
        }

        match event.message {
            ControlMessage::Ok { .. } => {
                tracing::debug!(key = %self.key, "peer confirmed transfer");
                self.ok_seen = true;
            }
            ControlMessage::Req { indices, .. } => {
                let total = self.total();
                for index in indices {
                    if index < total && !self.retransmit.contains(&index) {
                        self.retransmit.push_back(index);
                    }
                }
                tracing::debug!(
                    key = %self.key,
                    queued = self.retransmit.len(),
                    "retransmission requested"
                );
            }
        }
    }

    fn publish(&self, state: TransferState) {
        let mut progress = TransferProgress::new(
            u32::from(self.total()),
            self.payload_len as u64,
            self.pacer.delay(),
        );
        progress.state = state;
        progress.bytes_transferred = self.bytes_sent;
        progress.chunks_transferred = self.chunks_sent.min(u32::from(self.total()));
        progress.success_rate = self.pacer.success_rate();
        progress.started_at = self.progress_tx.borrow().started_at;
        progress.update_eta();
        let _ = self.progress_tx.send(progress);
    }
}
