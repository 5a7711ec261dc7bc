//! Hash families feeding the LSH index.
//!
//! Each family maps an input vector (sparse index/value pairs or a dense
//! weight slice) to `K·L` integer digits. Construction draws all random
//! state (permutations, signs, salts, bin assignments), so rebuilding a
//! family is simply constructing a fresh one.
//!
//! Digit ranges differ per family and the index composes them accordingly:
//! WTA/DWTA emit window positions in `[0, 8)`, SRP emits sign bits, and
//! densified MinHash emits raw winner indices.

mod dwta;
mod minhash;
mod srp;
mod wta;

pub use dwta::DwtaHash;
pub use minhash::DensifiedMinhash;
pub use srp::SparseRandomProjection;
pub use wta::WtaHash;

use serde::Deserialize;

use crate::corpus::Pair;

/// Width of one winner-take-all comparison window.
pub const BIN_SIZE: usize = 8;

/// log2 of [`BIN_SIZE`]; bits each WTA/DWTA digit contributes to a table key.
pub const LOG_BIN_SIZE: usize = 3;

/// How many top-magnitude entries MinHash considers per vector.
pub const TOP_K: usize = 30;

/// Inverse sampling density of sparse random projection.
pub const SRP_RATIO: usize = 32;

/// Empty-bin sentinel in pre-densification digit arrays.
pub(crate) const EMPTY_BIN: i64 = -1;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HashKind {
    Wta,
    Dwta,
    Minhash,
    Srp,
}

impl std::fmt::Display for HashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Wta => "wta",
            Self::Dwta => "dwta",
            Self::Minhash => "minhash",
            Self::Srp => "srp",
        })
    }
}

/// One constructed hash family with its random state.
#[derive(Clone)]
pub enum HashFamily {
    Wta(WtaHash),
    Dwta(DwtaHash),
    Minhash(DensifiedMinhash),
    Srp(SparseRandomProjection),
}

impl HashFamily {
    /// Draw a fresh family of `kind` producing `num_hashes` digits over
    /// `dim`-dimensional inputs.
    pub fn new(kind: HashKind, num_hashes: usize, dim: usize) -> Self {
        match kind {
            HashKind::Wta => Self::Wta(WtaHash::new(num_hashes, dim)),
            HashKind::Dwta => Self::Dwta(DwtaHash::new(num_hashes, dim)),
            HashKind::Minhash => Self::Minhash(DensifiedMinhash::new(num_hashes, dim)),
            HashKind::Srp => Self::Srp(SparseRandomProjection::new(dim, num_hashes, SRP_RATIO)),
        }
    }

    pub fn kind(&self) -> HashKind {
        match self {
            Self::Wta(_) => HashKind::Wta,
            Self::Dwta(_) => HashKind::Dwta,
            Self::Minhash(_) => HashKind::Minhash,
            Self::Srp(_) => HashKind::Srp,
        }
    }

    /// Digits for a sparse activation vector.
    pub fn hash_sparse(&self, pairs: &[Pair]) -> Vec<u32> {
        match self {
            Self::Wta(h) => h.hash_pairs(pairs),
            Self::Dwta(h) => h.hash_sparse(pairs),
            Self::Minhash(h) => h.hash_sparse(pairs),
            Self::Srp(h) => h.hash_sparse(pairs),
        }
    }

    /// Digits for a dense vector (a neuron's weight row).
    pub fn hash_dense(&self, data: &[f32]) -> Vec<u32> {
        match self {
            Self::Wta(h) => h.hash_dense(data),
            Self::Dwta(h) => h.hash_dense(data),
            Self::Minhash(h) => h.hash_dense(data),
            Self::Srp(h) => h.hash_dense(data),
        }
    }
}

/// The double hash driving densification chains, computed in 64 bits so the
/// pre-clamp value matches the original arithmetic.
pub(crate) fn rand_double_hash(salt: u32, bin: usize, count: u32, log_num_hashes: u32) -> usize {
    let to_hash = ((bin as u64 + 1) << 6) + count as u64;
    (((salt as u64).wrapping_mul(to_hash) << 3) >> (32 - log_num_hashes)) as usize
}

/// Fill empty bins from pseudo-randomly chained occupied ones. Raw digits
/// use [`EMPTY_BIN`] as the empty sentinel; chains read only the raw array
/// so later fills never feed earlier ones. After 100 failed probes the bin
/// falls back to digit 0.
pub(crate) fn densify_digits(raw: &[i64], salt: u32, log_num_hashes: u32) -> Vec<u32> {
    let num_hashes = raw.len();
    raw.iter()
        .enumerate()
        .map(|(bin, &digit)| {
            if digit != EMPTY_BIN {
                return digit as u32;
            }
            let mut count = 0u32;
            loop {
                count += 1;
                if count > 100 {
                    tracing::debug!(bin, "densification chain exhausted, emitting 0");
                    return 0;
                }
                let probe =
                    rand_double_hash(salt, bin, count, log_num_hashes).min(num_hashes - 1);
                if raw[probe] != EMPTY_BIN {
                    return raw[probe] as u32;
                }
            }
        })
        .collect()
}

/// ceil(log2(n)); the densification shift "needs to be ceiled".
pub(crate) fn ceil_log2(n: usize) -> u32 {
    n.next_power_of_two().trailing_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_log2() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(8), 3);
        assert_eq!(ceil_log2(9), 4);
    }

    #[test]
    fn test_densify_keeps_occupied_bins() {
        let raw = vec![4, 2, 7, 0];
        assert_eq!(densify_digits(&raw, 12345, 2), vec![4, 2, 7, 0]);
    }

    #[test]
    fn test_densify_fills_from_occupied() {
        let raw = vec![EMPTY_BIN, 5, EMPTY_BIN, EMPTY_BIN];
        let digits = densify_digits(&raw, 987654321 | 1, 2);
        assert_eq!(digits[1], 5);
        // Every filled bin holds either the only occupied digit or the
        // exhaustion fallback.
        for &d in &digits {
            assert!(d == 5 || d == 0);
        }
    }

    #[test]
    fn test_densify_all_empty_falls_back_to_zero() {
        let raw = vec![EMPTY_BIN; 6];
        assert_eq!(densify_digits(&raw, 22222223, 3), vec![0; 6]);
    }

    #[test]
    fn test_rand_double_hash_varies_with_count() {
        let a = rand_double_hash(2654435761, 3, 1, 5);
        let b = rand_double_hash(2654435761, 3, 2, 5);
        assert_ne!(a, b);
    }
}
