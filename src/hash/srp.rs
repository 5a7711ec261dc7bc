//! Sparse random projection (signed random hyperplanes).
//!
//! Each hash observes a random subset of `ceil(dim / ratio)` coordinates
//! with random ±1 signs; the digit is the sign bit of the sampled inner
//! product. Coordinate subsets are kept sorted so sparse input can be
//! intersected with a two-pointer merge.

use rand::seq::index;
use rand::Rng;

use crate::corpus::Pair;

#[derive(Clone)]
pub struct SparseRandomProjection {
    dim: usize,
    num_hashes: usize,
    sample_size: usize,
    /// Per hash: sorted coordinate subset.
    coords: Vec<Vec<u32>>,
    /// Per hash: sign per sampled coordinate (true = +1).
    signs: Vec<Vec<bool>>,
}

impl SparseRandomProjection {
    pub fn new(dim: usize, num_hashes: usize, ratio: usize) -> Self {
        let mut rng = rand::thread_rng();
        let sample_size = dim.div_ceil(ratio);

        let mut coords = Vec::with_capacity(num_hashes);
        let mut signs = Vec::with_capacity(num_hashes);
        for _ in 0..num_hashes {
            let mut subset: Vec<u32> = index::sample(&mut rng, dim, sample_size)
                .iter()
                .map(|i| i as u32)
                .collect();
            subset.sort_unstable();
            coords.push(subset);
            signs.push((0..sample_size).map(|_| rng.gen::<bool>()).collect());
        }

        Self {
            dim,
            num_hashes,
            sample_size,
            coords,
            signs,
        }
    }

    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn hash_dense(&self, vector: &[f32]) -> Vec<u32> {
        (0..self.num_hashes)
            .map(|h| {
                let mut sum = 0.0;
                for (j, &coord) in self.coords[h].iter().enumerate() {
                    let value = vector[coord as usize];
                    if self.signs[h][j] {
                        sum += value;
                    } else {
                        sum -= value;
                    }
                }
                (sum < 0.0) as u32
            })
            .collect()
    }

    /// Sparse input must be sorted by ascending index, as active-set pairs
    /// and corpus features are.
    pub fn hash_sparse(&self, pairs: &[Pair]) -> Vec<u32> {
        (0..self.num_hashes)
            .map(|h| {
                let coords = &self.coords[h];
                let mut sum = 0.0;
                let (mut i, mut j) = (0, 0);
                while i < pairs.len() && j < self.sample_size {
                    match pairs[i].index.cmp(&coords[j]) {
                        std::cmp::Ordering::Equal => {
                            if self.signs[h][j] {
                                sum += pairs[i].value;
                            } else {
                                sum -= pairs[i].value;
                            }
                            i += 1;
                            j += 1;
                        }
                        std::cmp::Ordering::Less => i += 1,
                        std::cmp::Ordering::Greater => j += 1,
                    }
                }
                (sum < 0.0) as u32
            })
            .collect()
    }
}
