//! Control message sub-protocol.
//!
//! Control messages are short UTF-8 strings sharing the data port, one per
//! frame, with no binary header:
//!
//! - `OK:<hex8>` - receiver confirms the transfer is reassembled and verified
//! - `REQ:<hex8>:<idx>[,<idx>]*` - receiver asks for the listed chunk indices
//!
//! `<hex8>` is the transfer id as eight lowercase hex digits. Parsers are
//! strict: a frame is treated as a control message only when the entire
//! frame matches the grammar, otherwise it falls through to chunk parsing.
//! Data chunks begin with a random 32-bit transfer id, so collisions with
//! the ASCII tags are not a practical concern, but the full-grammar check
//! keeps the dispatch defensive.

use crate::error::{Error, Result};
use crate::frame::HEADER_SIZE;
use crate::link::NodeId;
use crate::MAX_FRAME;

/// Tag prefix for completion confirmations.
pub const OK_TAG: &str = "OK:";

/// Tag prefix for missing-chunk requests.
pub const REQ_TAG: &str = "REQ:";

/// A parsed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Transfer reassembled and verified by the receiver
    Ok {
        /// Transfer being confirmed
        transfer_id: u32,
    },
    /// Request to retransmit the listed chunk indices
    Req {
        /// Transfer the request applies to
        transfer_id: u32,
        /// Missing chunk indices, in ascending order as emitted
        indices: Vec<u8>,
    },
}

impl ControlMessage {
    /// Encode the message to its on-wire string form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Ok { transfer_id } => format!("{OK_TAG}{transfer_id:08x}").into_bytes(),
            Self::Req {
                transfer_id,
                indices,
            } => {
                let list = indices
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{REQ_TAG}{transfer_id:08x}:{list}").into_bytes()
            }
        }
    }

    /// Parse a frame as a control message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownControl`] unless the entire frame matches
    /// the control grammar.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(frame)
            .map_err(|_| Error::UnknownControl("not valid UTF-8".to_string()))?;

        if let Some(rest) = text.strip_prefix(OK_TAG) {
            let transfer_id = parse_hex8(rest)?;
            return Ok(Self::Ok { transfer_id });
        }

        if let Some(rest) = text.strip_prefix(REQ_TAG) {
            let (id_part, list_part) = rest
                .split_once(':')
                .ok_or_else(|| Error::UnknownControl(format!("missing index list: {text}")))?;
            let transfer_id = parse_hex8(id_part)?;

            let mut indices = Vec::new();
            for item in list_part.split(',') {
                let index = item
                    .parse::<u8>()
                    .map_err(|_| Error::UnknownControl(format!("bad chunk index: {item}")))?;
                indices.push(index);
            }
            if indices.is_empty() {
                return Err(Error::UnknownControl(format!("empty index list: {text}")));
            }

            return Ok(Self::Req {
                transfer_id,
                indices,
            });
        }

        Err(Error::UnknownControl(format!(
            "unknown tag: {}",
            text.chars().take(8).collect::<String>()
        )))
    }

    /// Transfer id the message refers to.
    #[must_use]
    pub const fn transfer_id(&self) -> u32 {
        match self {
            Self::Ok { transfer_id } | Self::Req { transfer_id, .. } => *transfer_id,
        }
    }
}

fn parse_hex8(s: &str) -> Result<u32> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::UnknownControl(format!("bad transfer id: {s}")));
    }
    u32::from_str_radix(s, 16).map_err(|_| Error::UnknownControl(format!("bad transfer id: {s}")))
}

/// A control message together with the node that sent it.
///
/// The inbound actor posts these into a bounded queue; the sender engine
/// drains the queue at safe points between chunks and during paced sleeps,
/// so no mutable state is shared across the two actors.
#[derive(Debug, Clone)]
pub struct ControlEvent {
    /// Node the message came from
    pub peer: NodeId,
    /// The parsed message
    pub message: ControlMessage,
}

/// What a received frame contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// A complete, well-formed control message
    Control(ControlMessage),
    /// Anything else; hand to the chunk parser
    Data,
}

/// Classify an inbound frame before parsing it as a chunk.
///
/// Frames shorter than a chunk header that carry a recognized tag but fail
/// the full grammar are still classified as [`FrameKind::Data`] so the
/// chunk parser produces the diagnostic.
#[must_use]
pub fn classify(frame: &[u8]) -> FrameKind {
    let tagged = frame.starts_with(OK_TAG.as_bytes()) || frame.starts_with(REQ_TAG.as_bytes());
    if !tagged {
        return FrameKind::Data;
    }

    match ControlMessage::parse(frame) {
        Ok(message) => FrameKind::Control(message),
        Err(_) => FrameKind::Data,
    }
}

/// Split missing indices into `REQ:` messages that each fit one frame.
///
/// Large gaps produce several messages; the stall sweep reissues any that
/// are lost.
#[must_use]
pub fn req_batches(transfer_id: u32, missing: &[u8]) -> Vec<ControlMessage> {
    // "REQ:" + 8 hex digits + ":"
    let fixed = REQ_TAG.len() + 8 + 1;
    let budget = MAX_FRAME - fixed;

    let mut batches = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut used = 0usize;

    for &index in missing {
        let item = index.to_string().len() + usize::from(!current.is_empty());
        if used + item > budget && !current.is_empty() {
            batches.push(ControlMessage::Req {
                transfer_id,
                indices: std::mem::take(&mut current),
            });
            used = 0;
        }
        used += if current.is_empty() {
            index.to_string().len()
        } else {
            item
        };
        current.push(index);
    }

    if !current.is_empty() {
        batches.push(ControlMessage::Req {
            transfer_id,
            indices: current,
        });
    }

    batches
}

/// Upper bound check used by tests and the sweep: every encoded batch must
/// fit a single datagram alongside nothing else.
#[must_use]
pub fn fits_one_frame(message: &ControlMessage) -> bool {
    message.encode().len() <= MAX_FRAME
}

// Control frames are far shorter than a chunk header in the OK case; the
// dispatch in the receiver checks control tags before header length.
const _: () = assert!(OK_TAG.len() + 8 < HEADER_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_roundtrip() {
        let message = ControlMessage::Ok {
            transfer_id: 0x00C0_FFEE,
        };
        let encoded = message.encode();
        assert_eq!(encoded, b"OK:00c0ffee");
        assert_eq!(ControlMessage::parse(&encoded).expect("parse"), message);
    }

    #[test]
    fn test_req_roundtrip() {
        let message = ControlMessage::Req {
            transfer_id: 0xDEAD_BEEF,
            indices: vec![7, 23, 24, 41],
        };
        let encoded = message.encode();
        assert_eq!(encoded, b"REQ:deadbeef:7,23,24,41");
        assert_eq!(ControlMessage::parse(&encoded).expect("parse"), message);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            &b"OK:123"[..],
            b"OK:zzzzzzzz!",
            b"REQ:deadbeef",
            b"REQ:deadbeef:",
            b"REQ:deadbeef:1,abc",
            b"REQ:deadbeef:300",
            b"PING:deadbeef",
            b"",
        ] {
            assert!(
                ControlMessage::parse(bad).is_err(),
                "expected rejection for {:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn test_classify_prefers_full_grammar_match() {
        assert_eq!(
            classify(b"OK:00000001"),
            FrameKind::Control(ControlMessage::Ok { transfer_id: 1 })
        );
        // Tagged but malformed frames fall back to data parsing
        assert_eq!(classify(b"OK:not-a-transfer-id"), FrameKind::Data);
        assert_eq!(classify(b"\xDE\xAD\xBE\xEF rest of a chunk"), FrameKind::Data);
    }

    #[test]
    fn test_req_batches_fit_one_frame() {
        let missing: Vec<u8> = (0..=254).collect();
        let batches = req_batches(0xABCD_0123, &missing);
        assert!(batches.len() > 1);

        let mut seen = Vec::new();
        for batch in &batches {
            assert!(fits_one_frame(batch));
            match batch {
                ControlMessage::Req { indices, .. } => seen.extend_from_slice(indices),
                ControlMessage::Ok { .. } => panic!("unexpected OK batch"),
            }
        }
        assert_eq!(seen, missing);
    }

    #[test]
    fn test_req_batches_small_gap_is_single_message() {
        let batches = req_batches(1, &[7, 23, 24, 41]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].encode(), b"REQ:00000001:7,23,24,41");
    }
}
