//! Canonical sign-byte builders.
//!
//! Every signed consensus message is serialized into a fixed layout prefixed
//! with a domain tag, so a signature over one message type can never be
//! replayed as another. The timestamp is always the final 8 bytes, which lets
//! the signer detect payloads that differ only in their timestamp without
//! decoding them.

use crate::{BlockId, PartSetHeader, VoteType};

/// Domain tag for prevotes and precommits.
pub const DOMAIN_VOTE: &[u8] = b"TBFT_VOTE:";

/// Domain tag for block proposals.
pub const DOMAIN_PROPOSAL: &[u8] = b"TBFT_PROPOSAL:";

/// Width of the trailing timestamp field.
pub const TIMESTAMP_LEN: usize = 8;

fn put_chain_id(buf: &mut Vec<u8>, chain_id: &str) {
    buf.extend_from_slice(&(chain_id.len() as u32).to_le_bytes());
    buf.extend_from_slice(chain_id.as_bytes());
}

fn put_block_id(buf: &mut Vec<u8>, block_id: &BlockId) {
    buf.extend_from_slice(block_id.hash.as_bytes());
    put_parts(buf, &block_id.parts);
}

fn put_parts(buf: &mut Vec<u8>, parts: &PartSetHeader) {
    buf.extend_from_slice(&parts.total.to_le_bytes());
    buf.extend_from_slice(parts.hash.as_bytes());
}

/// Bytes signed for a vote.
///
/// Layout: `DOMAIN_VOTE || chain_id || height || round || type || block_id || timestamp`.
pub fn vote_sign_bytes(
    chain_id: &str,
    height: u64,
    round: u32,
    vote_type: VoteType,
    block_id: &BlockId,
    timestamp_ms: u64,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DOMAIN_VOTE.len() + chain_id.len() + 96);
    buf.extend_from_slice(DOMAIN_VOTE);
    put_chain_id(&mut buf, chain_id);
    buf.extend_from_slice(&height.to_le_bytes());
    buf.extend_from_slice(&round.to_le_bytes());
    buf.push(vote_type.as_u8());
    put_block_id(&mut buf, block_id);
    buf.extend_from_slice(&timestamp_ms.to_le_bytes());
    buf
}

/// Bytes signed for a proposal.
///
/// Layout: `DOMAIN_PROPOSAL || chain_id || height || round || parts || pol_round || pol_block_id || timestamp`.
pub fn proposal_sign_bytes(
    chain_id: &str,
    height: u64,
    round: u32,
    block_parts: &PartSetHeader,
    pol_round: Option<u32>,
    pol_block_id: &BlockId,
    timestamp_ms: u64,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DOMAIN_PROPOSAL.len() + chain_id.len() + 160);
    buf.extend_from_slice(DOMAIN_PROPOSAL);
    put_chain_id(&mut buf, chain_id);
    buf.extend_from_slice(&height.to_le_bytes());
    buf.extend_from_slice(&round.to_le_bytes());
    put_parts(&mut buf, block_parts);
    match pol_round {
        Some(r) => {
            buf.push(1);
            buf.extend_from_slice(&r.to_le_bytes());
        }
        None => {
            buf.push(0);
            buf.extend_from_slice(&0u32.to_le_bytes());
        }
    }
    put_block_id(&mut buf, pol_block_id);
    buf.extend_from_slice(&timestamp_ms.to_le_bytes());
    buf
}

/// Timestamp carried in the trailing field of canonical sign bytes.
pub fn sign_bytes_timestamp(sign_bytes: &[u8]) -> Option<u64> {
    let start = sign_bytes.len().checked_sub(TIMESTAMP_LEN)?;
    let tail: [u8; TIMESTAMP_LEN] = sign_bytes[start..].try_into().ok()?;
    Some(u64::from_le_bytes(tail))
}

/// If `last` and `new` are identical except for the timestamp, returns the
/// timestamp from `last`.
pub fn differ_only_by_timestamp(last: &[u8], new: &[u8]) -> Option<u64> {
    if last.len() != new.len() || last.len() < TIMESTAMP_LEN {
        return None;
    }
    let body = last.len() - TIMESTAMP_LEN;
    if last[..body] != new[..body] {
        return None;
    }
    sign_bytes_timestamp(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hash;

    fn block_id(seed: &[u8]) -> BlockId {
        BlockId::new(
            Hash::from_bytes(seed),
            PartSetHeader::new(1, Hash::from_bytes(seed)),
        )
    }

    #[test]
    fn test_timestamp_is_trailing_field() {
        let bytes = vote_sign_bytes("chain", 5, 1, VoteType::Prevote, &block_id(b"b"), 1234);
        assert_eq!(sign_bytes_timestamp(&bytes), Some(1234));
    }

    #[test]
    fn test_differ_only_by_timestamp() {
        let id = block_id(b"b");
        let a = vote_sign_bytes("chain", 5, 1, VoteType::Prevote, &id, 100);
        let b = vote_sign_bytes("chain", 5, 1, VoteType::Prevote, &id, 200);
        let c = vote_sign_bytes("chain", 5, 1, VoteType::Prevote, &block_id(b"c"), 100);
        assert_eq!(differ_only_by_timestamp(&a, &b), Some(100));
        assert_eq!(differ_only_by_timestamp(&a, &c), None);
    }

    #[test]
    fn test_domains_are_separated() {
        let id = block_id(b"b");
        let vote = vote_sign_bytes("chain", 1, 0, VoteType::Prevote, &id, 0);
        let proposal = proposal_sign_bytes("chain", 1, 0, &id.parts, None, &BlockId::nil(), 0);
        assert!(vote.starts_with(DOMAIN_VOTE));
        assert!(proposal.starts_with(DOMAIN_PROPOSAL));
        assert_ne!(vote, proposal);
    }

    #[test]
    fn test_chain_id_changes_bytes() {
        let id = block_id(b"b");
        let a = vote_sign_bytes("a", 1, 0, VoteType::Precommit, &id, 0);
        let b = vote_sign_bytes("b", 1, 0, VoteType::Precommit, &id, 0);
        assert_ne!(a, b);
    }
}
