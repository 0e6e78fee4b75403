//! Blocks as seen by consensus, and the chain agent's verdict on them.

use crate::{Address, Hash, PartSet, PartSetError};
use sbor::prelude::BasicSbor;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on an encoded block.
pub const MAX_BLOCK_BYTES: usize = 100 * 1024 * 1024;

/// Errors encoding a block into parts or decoding it back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockCodecError {
    #[error("block encoding failed: {0}")]
    Encode(String),

    #[error("block decoding failed: {0}")]
    Decode(String),

    #[error("encoded block is {size} bytes, limit {max}")]
    TooLarge { size: usize, max: usize },

    #[error(transparent)]
    PartSet(#[from] PartSetError),
}

/// A candidate block.
///
/// Consensus treats `payload` as opaque; its meaning belongs to the chain
/// agent that produced it.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Block {
    pub height: u64,
    pub parent_hash: Hash,
    pub proposer: Address,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

impl Block {
    pub fn new(
        height: u64,
        parent_hash: Hash,
        proposer: Address,
        timestamp_ms: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            height,
            parent_hash,
            proposer,
            timestamp_ms,
            payload,
        }
    }

    pub fn hash(&self) -> Hash {
        Hash::from_parts(&[
            &self.height.to_le_bytes(),
            self.parent_hash.as_bytes(),
            self.proposer.as_bytes(),
            &self.timestamp_ms.to_le_bytes(),
            Hash::from_bytes(&self.payload).as_bytes(),
        ])
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block{{h:{} hash:{} parent:{} {}B}}",
            self.height,
            self.hash().short(),
            self.parent_hash.short(),
            self.payload.len()
        )
    }
}

/// The chain agent's verdict on a verified block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BasicSbor, Serialize, Deserialize)]
pub enum SignResult {
    Agree,
    Against,
}

impl Default for SignResult {
    fn default() -> Self {
        SignResult::Agree
    }
}

/// Signed verification result returned by the chain agent.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct BlockSign {
    pub height: u64,
    pub hash: Hash,
    pub result: SignResult,
    pub signature: Vec<u8>,
}

/// Verification result kept alongside a vote, recoverable at commit time.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct KeepBlockSign {
    pub result: SignResult,
    pub signature: Vec<u8>,
    pub hash: Hash,
}

impl From<BlockSign> for KeepBlockSign {
    fn from(sign: BlockSign) -> Self {
        Self {
            result: sign.result,
            signature: sign.signature,
            hash: sign.hash,
        }
    }
}

/// Serialize a block and split it into parts.
pub fn make_part_set(part_size: usize, block: &Block) -> Result<PartSet, BlockCodecError> {
    let bytes =
        sbor::basic_encode(block).map_err(|e| BlockCodecError::Encode(format!("{e:?}")))?;
    if bytes.len() > MAX_BLOCK_BYTES {
        return Err(BlockCodecError::TooLarge {
            size: bytes.len(),
            max: MAX_BLOCK_BYTES,
        });
    }
    Ok(PartSet::from_data(&bytes, part_size)?)
}

/// Reassemble and decode a complete part set.
pub fn block_from_part_set(parts: &PartSet) -> Result<Block, BlockCodecError> {
    let bytes = parts.assemble()?;
    if bytes.len() > MAX_BLOCK_BYTES {
        return Err(BlockCodecError::TooLarge {
            size: bytes.len(),
            max: MAX_BLOCK_BYTES,
        });
    }
    sbor::basic_decode::<Block>(&bytes).map_err(|e| BlockCodecError::Decode(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Block {
        Block::new(
            7,
            Hash::from_bytes(b"parent"),
            Address::from_bytes([3; 20]),
            1_000,
            vec![42; 5000],
        )
    }

    #[test]
    fn test_block_survives_partitioning() {
        let block = block();
        let source = make_part_set(1024, &block).unwrap();
        assert!(source.total() > 1);

        let mut sink = PartSet::new_from_header(source.header(), 1024).unwrap();
        for i in 0..source.total() {
            sink.add_part(source.get_part(i).unwrap().clone()).unwrap();
        }
        assert_eq!(block_from_part_set(&sink).unwrap(), block);
    }

    #[test]
    fn test_incomplete_part_set_is_rejected() {
        let source = make_part_set(1024, &block()).unwrap();
        let sink = PartSet::new_from_header(source.header(), 1024).unwrap();
        assert!(matches!(
            block_from_part_set(&sink),
            Err(BlockCodecError::PartSet(PartSetError::Incomplete { .. }))
        ));
    }

    #[test]
    fn test_hash_depends_on_payload() {
        let a = block();
        let mut b = block();
        b.payload.push(1);
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), block().hash());
    }

    #[test]
    fn test_keep_sign_from_block_sign() {
        let sign = BlockSign {
            height: 7,
            hash: block().hash(),
            result: SignResult::Against,
            signature: vec![1],
        };
        let keep = KeepBlockSign::from(sign);
        assert_eq!(keep.result, SignResult::Against);
        assert_eq!(keep.hash, block().hash());
    }
}
