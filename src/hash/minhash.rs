//! Densified one-permutation MinHash.
//!
//! Every input coordinate is statically assigned to one of `num_hashes`
//! bins by hashing its index. Hashing a vector takes its top-k
//! largest-magnitude entries; within a bin the winner is the *largest
//! coordinate index* that landed there. Empty bins are densified through
//! the same chained double hash as DWTA.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::hash::Hasher;

use rand::Rng;
use rustc_hash::FxHasher;

use super::{ceil_log2, densify_digits, EMPTY_BIN, TOP_K};
use crate::corpus::Pair;

#[derive(Clone)]
pub struct DensifiedMinhash {
    salt: u32,
    num_hashes: usize,
    log_num_hashes: u32,
    /// Static coordinate -> bin assignment.
    bin_ids: Vec<u32>,
}

/// Heap entry ordered by magnitude (index breaks ties) so a bounded
/// min-heap keeps the k largest-magnitude coordinates.
#[derive(PartialEq)]
struct TopEntry {
    magnitude: f32,
    index: u32,
}

impl Eq for TopEntry {}

impl Ord for TopEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.magnitude
            .total_cmp(&other.magnitude)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for TopEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl DensifiedMinhash {
    pub fn new(num_hashes: usize, dim: usize) -> Self {
        let mut rng = rand::thread_rng();
        let bin_ids = Self::build_bin_map(num_hashes, dim, rng.gen::<u64>());

        Self {
            salt: rng.gen::<u32>() | 1,
            num_hashes,
            log_num_hashes: ceil_log2(num_hashes),
            bin_ids,
        }
    }

    /// Hash each coordinate index into `[0, 2^range_pow)` and split that
    /// range into `num_hashes` equal-width bins. The range exponent is the
    /// input dimensionality; past 64 the mix is simply used at full width,
    /// which keeps the assignment uniform.
    fn build_bin_map(num_hashes: usize, dim: usize, seed: u64) -> Vec<u32> {
        let range_pow = dim.min(64);
        let mask = if range_pow >= 64 {
            u64::MAX
        } else {
            (1u64 << range_pow) - 1
        };
        let bin_size = ((mask as f64 + 1.0) / num_hashes as f64).ceil() as u64;

        (0..dim as u64)
            .map(|coord| {
                let mut hasher = FxHasher::default();
                hasher.write_u64(seed ^ coord);
                let mixed = hasher.finish() & mask;
                (mixed / bin_size) as u32
            })
            .collect()
    }

    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    pub fn hash_sparse(&self, pairs: &[Pair]) -> Vec<u32> {
        self.hash_entries(pairs.iter().map(|p| (p.index, p.value)))
    }

    pub fn hash_dense(&self, data: &[f32]) -> Vec<u32> {
        self.hash_entries(
            data.iter()
                .copied()
                .enumerate()
                .map(|(i, v)| (i as u32, v)),
        )
    }

    fn hash_entries(&self, entries: impl Iterator<Item = (u32, f32)>) -> Vec<u32> {
        // Bounded min-heap: keep the TOP_K largest-magnitude coordinates.
        let mut top: BinaryHeap<std::cmp::Reverse<TopEntry>> =
            BinaryHeap::with_capacity(TOP_K + 1);
        for (index, value) in entries {
            top.push(std::cmp::Reverse(TopEntry {
                magnitude: value.abs(),
                index,
            }));
            if top.len() > TOP_K {
                top.pop();
            }
        }

        let mut raw = vec![EMPTY_BIN; self.num_hashes];
        for std::cmp::Reverse(entry) in top {
            let bin = self.bin_ids[entry.index as usize] as usize;
            // Winner per bin is the largest coordinate index, not the
            // largest value.
            if raw[bin] < entry.index as i64 {
                raw[bin] = entry.index as i64;
            }
        }

        densify_digits(&raw, self.salt, self.log_num_hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_map_covers_range() {
        let hash = DensifiedMinhash::new(8, 100);
        assert_eq!(hash.bin_ids.len(), 100);
        for &bin in &hash.bin_ids {
            assert!((bin as usize) < 8);
        }
    }

    #[test]
    fn test_bin_map_high_dimensional() {
        // Dimensions past the 64-bit range exponent still bin uniformly.
        let hash = DensifiedMinhash::new(12, 5000);
        for &bin in &hash.bin_ids {
            assert!((bin as usize) < 12);
        }
    }

    #[test]
    fn test_winner_is_largest_index() {
        let hash = DensifiedMinhash::new(4, 64);

        // Find two coordinates assigned to the same bin.
        let bin_ids = &hash.bin_ids;
        let (a, b) = (0..64)
            .flat_map(|i| (i + 1..64).map(move |j| (i, j)))
            .find(|&(i, j)| bin_ids[i] == bin_ids[j])
            .expect("64 coords over 4 bins must collide");

        let pairs = vec![
            Pair::new(a as u32, 10.0),
            Pair::new(b as u32, 0.5),
        ];
        let digits = hash.hash_sparse(&pairs);
        assert_eq!(digits[bin_ids[a] as usize], b as u32);
    }

    #[test]
    fn test_sparse_dense_agreement() {
        let hash = DensifiedMinhash::new(6, 40);
        let dense: Vec<f32> = (0..40).map(|i| ((i * 13 + 5) % 17) as f32).collect();
        let pairs: Vec<Pair> = dense
            .iter()
            .enumerate()
            .map(|(i, &v)| Pair::new(i as u32, v))
            .collect();
        assert_eq!(hash.hash_sparse(&pairs), hash.hash_dense(&dense));
    }

    #[test]
    fn test_scale_invariance() {
        let hash = DensifiedMinhash::new(6, 50);
        let base = vec![
            Pair::new(2, 0.5),
            Pair::new(9, -3.0),
            Pair::new(23, 1.75),
            Pair::new(41, 8.0),
        ];
        let reference = hash.hash_sparse(&base);
        for scale in [10.0f32, 100.0] {
            let scaled: Vec<Pair> = base
                .iter()
                .map(|p| Pair::new(p.index, p.value * scale))
                .collect();
            assert_eq!(hash.hash_sparse(&scaled), reference);
        }
    }

    #[test]
    fn test_deterministic_per_instance() {
        let hash = DensifiedMinhash::new(6, 40);
        let pairs = vec![Pair::new(3, 1.0), Pair::new(17, -4.0), Pair::new(39, 2.0)];
        assert_eq!(hash.hash_sparse(&pairs), hash.hash_sparse(&pairs));
    }
}
