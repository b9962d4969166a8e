//! # Pixmesh Core Library
//!
//! `pixmesh-core` implements a chunked, reliable image-transport protocol
//! for LoRa mesh radios (Meshtastic-class devices). A datagram link with a
//! ~200-byte payload, seconds-scale latency, and frequent loss carries
//! multi-kilobyte JPEG/WebP blobs end-to-end with integrity guarantees,
//! adaptive pacing, and recoverable stalls.
//!
//! ## Modules
//!
//! - [`buffer`] - Per-transfer reassembly buffers
//! - [`config`] - Configuration management
//! - [`control`] - `OK:`/`REQ:` control message sub-protocol
//! - [`error`] - Unified error type and failure taxonomy
//! - [`frame`] - Chunk frame wire format
//! - [`integrity`] - CRC32 and payload compression
//! - [`link`] - Mesh link driver contract and session guard
//! - [`pacing`] - Adaptive inter-chunk delay controller
//! - [`progress`] - Live status surface for UIs
//! - [`receiver`] - Receiver engine (reassembly, stall recovery)
//! - [`sender`] - Sender engine (fragmentation, pacing, retries)
//!
//! ## Example
//!
//! ```rust,ignore
//! use pixmesh_core::link::LinkSession;
//! use pixmesh_core::receiver::{Receiver, ReceiverConfig};
//! use pixmesh_core::sender::{SendOptions, Sender};
//!
//! let link = Arc::new(LinkSession::open(driver, pixmesh_core::DEFAULT_PORT)?);
//! let sender = Sender::spawn(Arc::clone(&link));
//! let receiver = Receiver::new(Arc::clone(&link), sink, ReceiverConfig::default())
//!     .with_control_forwarding(sender.control_inbox());
//! tokio::spawn(receiver.run(inbound_rx));
//!
//! let handle = sender.send_blob(peer, jpeg_bytes, SendOptions::default()).await?;
//! let outcome = handle.await_completion().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod buffer;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod integrity;
pub mod link;
pub mod pacing;
pub mod progress;
pub mod receiver;
pub mod sender;

pub use error::{Error, FailureKind, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default mesh port for data chunks and control strings
pub const DEFAULT_PORT: u16 = 256;

/// Largest datagram the link accepts
pub const MAX_FRAME: usize = 237;

/// Default datagram size budget, header included
pub const DEFAULT_CHUNK_SIZE: usize = 200;
