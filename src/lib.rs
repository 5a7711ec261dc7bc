//! Sparse training of very wide classifiers via locality-sensitive hashing.
//!
//! Instead of evaluating every output neuron, each layer keeps an LSH index
//! over its neurons' weight rows and, per example, activates only the small
//! set of neurons whose buckets the input hashes into. Forward pass,
//! gradient accumulation and the optimizer step run over that active set
//! alone; the index is refreshed periodically as weights drift.
//!
//! The building blocks, bottom-up: fixed-capacity [`bucket`]s, the
//! multi-table [`lsh`] index, four [`hash`] families (WTA, densified WTA,
//! densified MinHash, sparse random projection), [`neuron`] state with
//! per-input scratch, [`layer`] active-set selection, and the [`network`]
//! batch step. [`corpus`] reads the sparse Extreme Classification data
//! format and [`config`] the JSON run configuration.

pub mod atomic;
pub mod bucket;
pub mod config;
pub mod corpus;
pub mod hash;
pub mod layer;
pub mod lsh;
pub mod network;
pub mod neuron;

pub use config::{Config, LayerMode};
pub use corpus::{Example, Pair, ScanError, Scanner};
pub use hash::HashKind;
pub use network::{CowId, Network};
