// SPDX-License-Identifier: MPL-2.0

use bittle::{Bits, BitsMut};
use serde::{Deserialize, Serialize};

use crate::os::Vec;

/// A compact array of bits.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BitMap {
    bits: Vec<u64>,
    nbits: usize,
}

impl BitMap {
    /// Create a new `BitMap` by repeating the `value` for the desired length.
    pub fn repeat(value: bool, nbits: usize) -> Self {
        let vec_len = nbits.div_ceil(64);
        let mut bits = Vec::with_capacity(vec_len);
        if value {
            bits.resize(vec_len, !0u64);
        } else {
            bits.resize(vec_len, 0u64);
        }

        // Keep the unused bits in the last u64 at zero.
        if value && nbits % 64 != 0 {
            let last = vec_len - 1;
            bits[last] = !0u64 >> (64 - nbits % 64);
        }

        Self { bits, nbits }
    }

    /// Return the total number of bits.
    pub fn len(&self) -> usize {
        self.nbits
    }

    /// Returns whether the bitmap holds no bits.
    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    fn check_index(&self, index: usize) {
        if index >= self.len() {
            panic!(
                "bitmap index {} is out of range, total bits {}",
                index, self.nbits,
            );
        }
    }

    /// Test if the given bit is set.
    ///
    /// # Panics
    ///
    /// The `index` must be within the total number of bits. Otherwise, this method panics.
    pub fn test_bit(&self, index: usize) -> bool {
        self.check_index(index);
        self.bits.test_bit(index as _)
    }

    /// Set the given bit to one.
    ///
    /// # Panics
    ///
    /// The `index` must be within the total number of bits. Otherwise, this method panics.
    pub fn set_bit(&mut self, index: usize) {
        self.check_index(index);
        self.bits.set_bit(index as _);
    }

    /// Clear the given bit to zero.
    ///
    /// # Panics
    ///
    /// The `index` must be within the total number of bits. Otherwise, this method panics.
    pub fn clear_bit(&mut self, index: usize) {
        self.check_index(index);
        self.bits.clear_bit(index as _)
    }

    /// Set the given bit to `value`.
    ///
    /// # Panics
    ///
    /// The `index` must be within the total number of bits. Otherwise, this method panics.
    pub fn set(&mut self, index: usize, value: bool) {
        if value {
            self.set_bit(index);
        } else {
            self.clear_bit(index);
        }
    }

    /// Get the number of one bits in the bitmap.
    pub fn count_ones(&self) -> usize {
        self.bits.count_ones() as _
    }

    /// Find the index of the first one bit, starting from the given index (inclusively).
    ///
    /// Return `None` if no one bit is found.
    pub fn first_one(&self, from: usize) -> Option<usize> {
        if from >= self.len() {
            return None;
        }
        let first_u64_index = from / 64;

        self.bits[first_u64_index..]
            .iter_ones()
            .map(|index| first_u64_index * 64 + (index as usize))
            .find(|&index| index >= from)
    }

    /// Find the start of the first run of `count` contiguous one bits whose
    /// start index is a multiple of `align`.
    ///
    /// Return `None` if no such run exists. `align` must be a power of two.
    pub fn first_run(&self, count: usize, align: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        if count == 0 || count > self.len() {
            return None;
        }

        let mut start = 0;
        while start + count <= self.len() {
            // Find the first free bit at or after `start`, aligned up.
            let one = self.first_one(start)?;
            start = one.next_multiple_of(align);
            if start + count > self.len() {
                return None;
            }

            match (start..start + count).find(|&i| !self.test_bit(i)) {
                None => return Some(start),
                Some(hole) => start = hole + 1,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::BitMap;

    #[test]
    fn repeat_and_count() {
        let bm = BitMap::repeat(true, 100);
        assert_eq!(bm.len(), 100);
        assert_eq!(bm.count_ones(), 100);

        let bm = BitMap::repeat(false, 100);
        assert_eq!(bm.count_ones(), 0);
    }

    #[test]
    fn bit_ops() {
        let mut bm = BitMap::repeat(false, 100);

        bm.set_bit(32);
        assert_eq!(bm.count_ones(), 1);
        assert!(bm.test_bit(32));

        bm.set(64, true);
        assert_eq!(bm.count_ones(), 2);

        bm.clear_bit(32);
        assert!(!bm.test_bit(32));
        bm.set(64, false);
        assert_eq!(bm.count_ones(), 0);
    }

    #[test]
    fn find_first_one() {
        let mut bm = BitMap::repeat(false, 100);
        bm.set_bit(64);
        assert_eq!(bm.first_one(0), Some(64));
        assert_eq!(bm.first_one(64), Some(64));
        assert_eq!(bm.first_one(65), None);
    }

    #[test]
    fn find_runs() {
        let mut bm = BitMap::repeat(true, 64);
        assert_eq!(bm.first_run(8, 4), Some(0));

        // Punch a hole so the first aligned run moves up.
        bm.clear_bit(2);
        assert_eq!(bm.first_run(8, 4), Some(4));
        assert_eq!(bm.first_run(4, 1), Some(3));

        bm.clear_bit(11);
        assert_eq!(bm.first_run(8, 4), Some(12));

        let bm = BitMap::repeat(false, 64);
        assert_eq!(bm.first_run(1, 1), None);
    }
}
