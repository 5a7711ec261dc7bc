//! Densified winner-take-all hashing.
//!
//! Like WTA, but built for sparse input: instead of scanning windows of a
//! permuted coordinate list, each coordinate knows (per permutation) which
//! hash bin it feeds and which digit it would contribute if it wins that
//! bin. A sparse vector then updates only the bins its active coordinates
//! map to; bins left empty are densified from occupied ones through a
//! chained double hash.

use rand::seq::SliceRandom;
use rand::Rng;

use super::{ceil_log2, densify_digits, BIN_SIZE, EMPTY_BIN};
use crate::corpus::Pair;

#[derive(Clone)]
pub struct DwtaHash {
    salt: u32,
    num_hashes: usize,
    range_pow: usize,
    log_num_hashes: u32,
    /// Per (permutation, coordinate): the hash bin that slot feeds.
    bin_of: Vec<u32>,
    /// Per (permutation, coordinate): the digit emitted if it wins.
    pos_of: Vec<u32>,
    permute: usize,
}

impl DwtaHash {
    pub fn new(num_hashes: usize, range_pow: usize) -> Self {
        let mut rng = rand::thread_rng();
        let permute = (num_hashes * BIN_SIZE).div_ceil(range_pow);

        let mut coords: Vec<usize> = (0..range_pow).collect();
        let mut bin_of = vec![0u32; range_pow * permute];
        let mut pos_of = vec![0u32; range_pow * permute];

        for p in 0..permute {
            coords.shuffle(&mut rng);
            for (slot, &coord) in coords.iter().enumerate() {
                let flat = p * range_pow + slot;
                bin_of[p * range_pow + coord] = (flat / BIN_SIZE) as u32;
                pos_of[p * range_pow + coord] = (flat % BIN_SIZE) as u32;
            }
        }

        Self {
            salt: rng.gen::<u32>() | 1,
            num_hashes,
            range_pow,
            log_num_hashes: ceil_log2(num_hashes),
            bin_of,
            pos_of,
            permute,
        }
    }

    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    pub fn hash_sparse(&self, pairs: &[Pair]) -> Vec<u32> {
        self.hash_entries(pairs.iter().map(|p| (p.index as usize, p.value)))
    }

    pub fn hash_dense(&self, data: &[f32]) -> Vec<u32> {
        self.hash_entries(data.iter().copied().enumerate())
    }

    fn hash_entries(
        &self,
        entries: impl Iterator<Item = (usize, f32)> + Clone,
    ) -> Vec<u32> {
        let mut raw = vec![EMPTY_BIN; self.num_hashes];
        let mut best = vec![f32::NEG_INFINITY; self.num_hashes];

        for p in 0..self.permute {
            let base = p * self.range_pow;
            for (coord, value) in entries.clone() {
                let bin = self.bin_of[base + coord] as usize;
                if bin < self.num_hashes && value > best[bin] {
                    best[bin] = value;
                    raw[bin] = self.pos_of[base + coord] as i64;
                }
            }
        }

        densify_digits(&raw, self.salt, self.log_num_hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sparse(entries: &[(u32, f32)]) -> Vec<Pair> {
        entries.iter().map(|&(i, v)| Pair::new(i, v)).collect()
    }

    #[test]
    fn test_mapping_tables_cover_all_bins() {
        let hash = DwtaHash::new(6, 16);
        // ceil(6 * 8 / 16) = 3 permutations.
        assert_eq!(hash.permute, 3);
        assert_eq!(hash.bin_of.len(), 48);

        for &bin in &hash.bin_of {
            assert!((bin as usize) < 6);
        }
        for &pos in &hash.pos_of {
            assert!((pos as usize) < BIN_SIZE);
        }
    }

    #[test]
    fn test_digits_within_bin_range() {
        let hash = DwtaHash::new(8, 32);
        let pairs = sparse(&[(1, 0.5), (7, 2.0), (20, 1.5), (31, 0.1)]);
        let digits = hash.hash_sparse(&pairs);
        assert_eq!(digits.len(), 8);
        for digit in digits {
            assert!((digit as usize) < BIN_SIZE);
        }
    }

    #[test]
    fn test_scale_invariance() {
        let hash = DwtaHash::new(6, 24);
        let base = sparse(&[(0, 1.0), (5, 3.0), (11, 0.25), (17, 2.0), (23, 0.75)]);
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
    fn test_sparse_dense_agreement() {
        let hash = DwtaHash::new(6, 16);
        let dense: Vec<f32> = (0..16).map(|i| ((i * 11 + 2) % 16) as f32).collect();
        let pairs: Vec<Pair> = dense
            .iter()
            .enumerate()
            .map(|(i, &v)| Pair::new(i as u32, v))
            .collect();
        assert_eq!(hash.hash_sparse(&pairs), hash.hash_dense(&dense));
    }

    #[test]
    fn test_empty_input_densifies_to_zero() {
        let hash = DwtaHash::new(4, 16);
        assert_eq!(hash.hash_sparse(&[]), vec![0; 4]);
    }
}
