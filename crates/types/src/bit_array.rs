//! Fixed-length bit array used for vote presence and part tracking.

use sbor::prelude::BasicSbor;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Default, BasicSbor)]
pub struct BitArray {
    len: u32,
    words: Vec<u64>,
}

impl BitArray {
    pub fn new(len: usize) -> Self {
        Self {
            len: len as u32,
            words: vec![0; len.div_ceil(64)],
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Value of bit `index`; false when out of range.
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len() {
            return false;
        }
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Set bit `index`. Returns false when out of range.
    pub fn set(&mut self, index: usize, value: bool) -> bool {
        if index >= self.len() {
            return false;
        }
        let mask = 1u64 << (index % 64);
        if value {
            self.words[index / 64] |= mask;
        } else {
            self.words[index / 64] &= !mask;
        }
        true
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count_ones() == self.len()
    }

    /// Indices of set bits in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter(move |i| self.get(*i))
    }
}

impl fmt::Display for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BA{")?;
        for i in 0..self.len() {
            f.write_str(if self.get(i) { "x" } else { "_" })?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_across_words() {
        let mut bits = BitArray::new(130);
        assert!(bits.set(0, true));
        assert!(bits.set(64, true));
        assert!(bits.set(129, true));
        assert!(!bits.set(130, true));
        assert!(bits.get(64));
        assert!(!bits.get(63));
        assert_eq!(bits.count_ones(), 3);
        assert_eq!(bits.ones().collect::<Vec<_>>(), vec![0, 64, 129]);
        bits.set(64, false);
        assert_eq!(bits.count_ones(), 2);
    }

    #[test]
    fn test_full_and_display() {
        let mut bits = BitArray::new(3);
        bits.set(1, true);
        assert_eq!(bits.to_string(), "BA{_x_}");
        bits.set(0, true);
        bits.set(2, true);
        assert!(bits.is_full());
    }
}
