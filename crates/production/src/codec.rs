//! Message encoding and decoding for the consensus transport.
//!
//! # Wire Format
//!
//! ```text
//! [version: u8][payload: SBOR-encoded OutboundMessage]
//! ```
//!
//! The codec is an explicit value handed to whoever owns a connection, so
//! two committees can run with different limits side by side.

use tbft_core::{Event, OutboundMessage};
use tbft_types::{PeerId, BLOCK_PART_SIZE_BYTES};
use thiserror::Error;

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Default upper bound for one encoded message: a full block part plus
/// framing.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = BLOCK_PART_SIZE_BYTES + 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("Message too short")]
    MessageTooShort,

    #[error("Message of {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("SBOR decode error: {0}")]
    SborDecode(String),

    #[error("SBOR encode error: {0}")]
    SborEncode(String),
}

/// Versioned SBOR codec for [`OutboundMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireCodec {
    max_message_size: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl WireCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encode a message to wire format.
    pub fn encode(&self, message: &OutboundMessage) -> Result<Vec<u8>, CodecError> {
        let payload =
            sbor::basic_encode(message).map_err(|e| CodecError::SborEncode(format!("{e:?}")))?;
        let size = 1 + payload.len();
        if size > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        let mut bytes = Vec::with_capacity(size);
        bytes.push(WIRE_VERSION);
        bytes.extend(payload);
        Ok(bytes)
    }

    /// Decode a message from wire format.
    pub fn decode(&self, data: &[u8]) -> Result<OutboundMessage, CodecError> {
        if data.len() > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }
        let (&version, payload) = data.split_first().ok_or(CodecError::MessageTooShort)?;
        if version != WIRE_VERSION {
            return Err(CodecError::UnknownVersion(version));
        }
        if payload.is_empty() {
            return Err(CodecError::MessageTooShort);
        }
        sbor::basic_decode(payload).map_err(|e| CodecError::SborDecode(format!("{e:?}")))
    }

    /// Decode bytes received from `peer` straight into a state machine event.
    pub fn decode_event(&self, data: &[u8], peer: PeerId) -> Result<Event, CodecError> {
        Ok(Event::from_message(self.decode(data)?, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbft_types::test_utils::{signed_vote, test_block_id, test_key};
    use tbft_types::VoteType;

    fn vote_message() -> OutboundMessage {
        let key = test_key(0);
        OutboundMessage::Vote(signed_vote(
            "chain",
            &key,
            0,
            3,
            1,
            VoteType::Precommit,
            test_block_id(b"block"),
        ))
    }

    #[test]
    fn test_vote_survives_the_wire() {
        let codec = WireCodec::default();
        let message = vote_message();
        let bytes = codec.encode(&message).unwrap();
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(codec.decode(&bytes).unwrap(), message);

        let peer = PeerId::from("peer-1");
        let event = codec.decode_event(&bytes, peer.clone()).unwrap();
        assert_eq!(event.peer(), Some(&peer));
        assert_eq!(event.height(), Some(3));
    }

    #[test]
    fn test_rejects_bad_frames() {
        let codec = WireCodec::default();
        assert_eq!(codec.decode(&[]), Err(CodecError::MessageTooShort));
        assert_eq!(codec.decode(&[WIRE_VERSION]), Err(CodecError::MessageTooShort));
        assert_eq!(codec.decode(&[9, 1, 2]), Err(CodecError::UnknownVersion(9)));
        assert!(matches!(
            codec.decode(&[WIRE_VERSION, 0xff, 0xff]),
            Err(CodecError::SborDecode(_))
        ));
    }

    #[test]
    fn test_enforces_size_limit() {
        let small = WireCodec::new(16);
        assert!(matches!(
            small.encode(&vote_message()),
            Err(CodecError::MessageTooLarge { max: 16, .. })
        ));
        assert_eq!(
            small.decode(&[WIRE_VERSION; 32]),
            Err(CodecError::MessageTooLarge { size: 32, max: 16 })
        );
    }
}
