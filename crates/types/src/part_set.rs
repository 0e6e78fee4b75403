//! Splitting a serialized block into fixed-size parts and reassembling it.

use crate::{BitArray, Hash, PartSetHeader, MAX_BLOCK_BYTES};
use sbor::prelude::BasicSbor;

/// Default size of one block part.
pub const BLOCK_PART_SIZE_BYTES: usize = 65536;

/// Errors while building or filling a part set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartSetError {
    #[error("part size must be positive")]
    InvalidPartSize,

    #[error("payload needs {0} parts, more than fit in a header")]
    TooManyParts(usize),

    #[error("part set header claims {total} parts, allowed 1..={max}")]
    InvalidTotal { total: u32, max: usize },

    #[error("part index {index} out of range (total {total})")]
    UnexpectedIndex { index: u32, total: u32 },

    #[error("part {0} hash does not match its bytes")]
    InvalidPartHash(u32),

    #[error("reassembled payload hash {actual:?} does not match header {expected:?}")]
    PayloadHashMismatch { expected: Hash, actual: Hash },

    #[error("part set incomplete: {have}/{total} parts")]
    Incomplete { have: u32, total: u32 },
}

/// One slice of a serialized block.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    /// Hash of `bytes`.
    pub hash: Hash,
}

impl Part {
    pub fn new(index: u32, bytes: Vec<u8>) -> Self {
        let hash = Hash::from_bytes(&bytes);
        Self { index, bytes, hash }
    }
}

/// Most parts a block of at most [`MAX_BLOCK_BYTES`] splits into.
pub fn max_parts(part_size: usize) -> Result<usize, PartSetError> {
    if part_size == 0 {
        return Err(PartSetError::InvalidPartSize);
    }
    Ok(MAX_BLOCK_BYTES.div_ceil(part_size))
}

impl PartSetHeader {
    /// Reject headers no block split into `part_size` parts could produce.
    pub fn validate(&self, part_size: usize) -> Result<(), PartSetError> {
        let max = max_parts(part_size)?;
        if self.total == 0 || self.total as usize > max {
            return Err(PartSetError::InvalidTotal {
                total: self.total,
                max,
            });
        }
        Ok(())
    }
}

/// A possibly incomplete set of parts for one payload.
#[derive(Debug, Clone)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    parts_bit_array: BitArray,
    count: u32,
}

impl PartSet {
    /// Split `data` into parts of at most `part_size` bytes.
    ///
    /// Always yields at least one part, so an empty payload still has a
    /// non-zero header.
    pub fn from_data(data: &[u8], part_size: usize) -> Result<Self, PartSetError> {
        if part_size == 0 {
            return Err(PartSetError::InvalidPartSize);
        }
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(part_size).collect()
        };
        let total = u32::try_from(chunks.len()).map_err(|_| PartSetError::TooManyParts(chunks.len()))?;

        let parts: Vec<Option<Part>> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| Some(Part::new(i as u32, chunk.to_vec())))
            .collect();
        let mut bits = BitArray::new(parts.len());
        for i in 0..parts.len() {
            bits.set(i, true);
        }

        Ok(Self {
            header: PartSetHeader::new(total, Hash::from_bytes(data)),
            parts,
            parts_bit_array: bits,
            count: total,
        })
    }

    /// An empty set waiting for the parts described by `header`, which must
    /// be plausible for blocks split into `part_size` parts.
    pub fn new_from_header(header: PartSetHeader, part_size: usize) -> Result<Self, PartSetError> {
        header.validate(part_size)?;
        Ok(Self::empty(header))
    }

    fn empty(header: PartSetHeader) -> Self {
        let total = header.total as usize;
        Self {
            header,
            parts: vec![None; total],
            parts_bit_array: BitArray::new(total),
            count: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.header == *header
    }

    pub fn total(&self) -> u32 {
        self.header.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn bit_array(&self) -> &BitArray {
        &self.parts_bit_array
    }

    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(Option::as_ref)
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    /// Add a received part.
    ///
    /// Returns `Ok(false)` for a part already present. When the final part
    /// arrives the reassembled payload is checked against the header hash;
    /// on mismatch every part is discarded so the set can be refilled.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        if part.index >= self.header.total {
            return Err(PartSetError::UnexpectedIndex {
                index: part.index,
                total: self.header.total,
            });
        }
        if self.parts[part.index as usize].is_some() {
            return Ok(false);
        }
        if Hash::from_bytes(&part.bytes) != part.hash {
            return Err(PartSetError::InvalidPartHash(part.index));
        }

        let index = part.index as usize;
        self.parts[index] = Some(part);
        self.parts_bit_array.set(index, true);
        self.count += 1;

        if self.is_complete() {
            let actual = Hash::from_bytes(&self.concat());
            if actual != self.header.hash {
                *self = Self::empty(self.header);
                return Err(PartSetError::PayloadHashMismatch {
                    expected: self.header.hash,
                    actual,
                });
            }
        }
        Ok(true)
    }

    /// The reassembled payload.
    pub fn assemble(&self) -> Result<Vec<u8>, PartSetError> {
        if !self.is_complete() {
            return Err(PartSetError::Incomplete {
                have: self.count,
                total: self.header.total,
            });
        }
        Ok(self.concat())
    }

    fn concat(&self) -> Vec<u8> {
        self.parts
            .iter()
            .flatten()
            .flat_map(|p| p.bytes.iter().copied())
            .collect()
    }
}
