//! Identifier newtypes.

use crate::HexError;
use sbor::prelude::BasicSbor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Validator address: the first 20 bytes of the blake3 hash of its public key.
///
/// Ordering is bytewise and is used to break proposer-priority ties.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor)]
pub struct Address([u8; 20]);

impl Address {
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        let array: [u8; 20] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| HexError::InvalidLength {
                expected: 20,
                actual: bytes.len(),
            })?;
        Ok(Address(array))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Opaque transport-level peer identifier.
///
/// The transport derives it from the peer's validator address; the consensus
/// core only uses it as a map key for per-peer bookkeeping. The empty id
/// denotes the local node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BasicSbor, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// The id used for messages originating from this node.
    pub fn local() -> Self {
        PeerId(String::new())
    }

    /// Peer id of the validator owning `address`.
    pub fn from_address(address: &Address) -> Self {
        PeerId(address.to_hex())
    }

    pub fn is_local(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            f.write_str("<local>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Kind of vote cast within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl VoteType {
    /// Wire tag included in canonical sign bytes.
    pub fn as_u8(self) -> u8 {
        match self {
            VoteType::Prevote => 1,
            VoteType::Precommit => 2,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(VoteType::Prevote),
            2 => Some(VoteType::Precommit),
            _ => None,
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => f.write_str("prevote"),
            VoteType::Precommit => f.write_str("precommit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_hex_accepts_prefix() {
        let addr = Address::from_bytes([0xab; 20]);
        assert_eq!(Address::from_hex(&addr.to_string()).unwrap(), addr);
        assert_eq!(Address::from_hex(&addr.to_hex()).unwrap(), addr);
    }

    #[test]
    fn test_vote_type_tags() {
        for t in [VoteType::Prevote, VoteType::Precommit] {
            assert_eq!(VoteType::from_u8(t.as_u8()), Some(t));
        }
        assert_eq!(VoteType::from_u8(0), None);
    }

    #[test]
    fn test_local_peer() {
        assert!(PeerId::local().is_local());
        assert!(!PeerId::from("abc").is_local());
    }
}
