//! Winner-take-all hashing.
//!
//! The input dimensions are permuted (as many concatenated permutations as
//! needed to feed every hash a full window) and each hash reads one 8-wide
//! window of the permuted coordinates: the digit is the position of the
//! window's maximum. Comparative, so invariant under positive scaling.

use rand::seq::SliceRandom;

use super::BIN_SIZE;
use crate::corpus::Pair;

#[derive(Clone)]
pub struct WtaHash {
    /// `permute` concatenated permutations of `[0, range_pow)`.
    indices: Vec<u32>,
    num_hashes: usize,
    range_pow: usize,
}

impl WtaHash {
    pub fn new(num_hashes: usize, range_pow: usize) -> Self {
        let mut rng = rand::thread_rng();
        let permute = (num_hashes * BIN_SIZE).div_ceil(range_pow);

        let mut coords: Vec<u32> = (0..range_pow as u32).collect();
        let mut indices = Vec::with_capacity(range_pow * permute);
        for _ in 0..permute {
            coords.shuffle(&mut rng);
            indices.extend_from_slice(&coords);
        }

        Self {
            indices,
            num_hashes,
            range_pow,
        }
    }

    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    pub fn range_pow(&self) -> usize {
        self.range_pow
    }

    /// Hash pairs whose positions line up with the permuted coordinate
    /// space, i.e. a dense activation list in pair form.
    pub fn hash_pairs(&self, data: &[Pair]) -> Vec<u32> {
        self.hash_with(|coord| data[coord].value)
    }

    pub fn hash_dense(&self, data: &[f32]) -> Vec<u32> {
        self.hash_with(|coord| data[coord])
    }

    fn hash_with(&self, value_at: impl Fn(usize) -> f32) -> Vec<u32> {
        (0..self.num_hashes)
            .map(|i| {
                let window = &self.indices[i * BIN_SIZE..(i + 1) * BIN_SIZE];
                let mut digit = 0u32;
                let mut best = f32::NEG_INFINITY;
                for (pos, &coord) in window.iter().enumerate() {
                    let value = value_at(coord as usize);
                    // Strict comparison: ties keep the first-seen position.
                    if value > best {
                        best = value;
                        digit = pos as u32;
                    }
                }
                digit
            })
            .collect()
    }
}
