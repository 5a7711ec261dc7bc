//! Run configuration, loaded from a JSON file.
//!
//! Field names are snake_case in the file; unspecified fields fall back to
//! the engine defaults. Loading and validation failures are fatal at
//! startup — there is nothing sensible to train without a coherent config.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::hash::HashKind;

/// Active-set selection strategy, as the numeric modes of the config file.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(try_from = "u8")]
pub enum LayerMode {
    /// Mode 1: keep candidates retrieved from more than 2 tables.
    Threshold,
    /// Mode 2: labels plus uniform random fill (softmax layer only).
    UniformSample,
    /// Mode 3: exact top-k by inner product (softmax layer only).
    ExactTopK,
    /// Mode 4: all retrieved candidates, padded from a random permutation.
    HashPad,
}

impl TryFrom<u8> for LayerMode {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Threshold),
            2 => Ok(Self::UniformSample),
            3 => Ok(Self::ExactTopK),
            4 => Ok(Self::HashPad),
            other => Err(format!("layer mode must be 1..=4, got {other}")),
        }
    }
}

impl LayerMode {
    /// Whether the mode consults the LSH index (and thus whether rehash
    /// and rebuild schedules apply).
    pub fn uses_hashing(self) -> bool {
        matches!(self, Self::Threshold | Self::HashPad)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub range_pow: Vec<usize>,
    pub k: Vec<usize>,
    pub l: Vec<usize>,
    /// Per-layer training sparsities followed by per-layer inference
    /// sparsities (2 · num_layers entries).
    pub sparsity: Vec<f32>,
    pub batch_size: usize,
    pub rehash_period: usize,
    pub rebuild_period: usize,
    pub input_dim: usize,
    pub total_records: usize,
    pub total_records_test: usize,
    pub learning_rate: f32,
    pub epochs: usize,
    /// Evaluate on a few test batches every this many training batches.
    pub step_size: usize,
    pub layer_sizes: Vec<usize>,
    pub num_layers: usize,
    pub train_data_path: String,
    pub test_data_path: String,
    pub use_adam: bool,
    pub hash_function: HashKind,
    pub load_weight: bool,
    pub layer_mode: LayerMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            range_pow: Vec::new(),
            k: Vec::new(),
            l: Vec::new(),
            sparsity: Vec::new(),
            batch_size: 1000,
            rehash_period: 1000,
            rebuild_period: 1000,
            input_dim: 784,
            total_records: 60_000,
            total_records_test: 10_000,
            learning_rate: 1e-4,
            epochs: 5,
            step_size: 20,
            layer_sizes: Vec::new(),
            num_layers: 3,
            train_data_path: String::new(),
            test_data_path: String::new(),
            use_adam: true,
            hash_function: HashKind::Dwta,
            load_weight: false,
            layer_mode: LayerMode::HashPad,
        }
    }
}

impl Config {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("opening configuration {}", path.display()))?;
        let config: Config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing configuration {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            bail!("num_layers must be positive");
        }
        for (name, len) in [
            ("layer_sizes", self.layer_sizes.len()),
            ("k", self.k.len()),
            ("l", self.l.len()),
            ("range_pow", self.range_pow.len()),
        ] {
            if len != self.num_layers {
                bail!("{name} must have {} entries, found {len}", self.num_layers);
            }
        }
        if self.sparsity.len() != 2 * self.num_layers {
            bail!(
                "sparsity must have {} entries (training then inference), found {}",
                2 * self.num_layers,
                self.sparsity.len()
            );
        }
        if self.batch_size == 0 || self.input_dim == 0 {
            bail!("batch_size and input_dim must be positive");
        }
        if self.layer_sizes.iter().any(|&size| size == 0) {
            bail!("layer sizes must be positive");
        }
        for i in 0..self.num_layers {
            // Composed table keys must fit the table: 3 bits per WTA/DWTA
            // digit, 1 per SRP digit.
            let key_bits = match self.hash_function {
                HashKind::Wta | HashKind::Dwta => 3 * self.k[i],
                HashKind::Srp => self.k[i],
                HashKind::Minhash => 0, // keys are masked
            };
            if key_bits > self.range_pow[i] {
                bail!(
                    "layer {i}: k = {} needs {key_bits} key bits but range_pow is {}",
                    self.k[i],
                    self.range_pow[i]
                );
            }
        }
        if self.load_weight {
            bail!("load_weight is not supported");
        }
        Ok(())
    }

    /// Whether the batch at global iteration `iter` ends with an index
    /// rehash. Only hash-driven selection modes maintain the index.
    pub fn rehash_due(&self, iter: usize) -> bool {
        self.layer_mode.uses_hashing() && period_due(iter, self.rehash_period, self.batch_size)
    }

    /// Whether the batch at global iteration `iter` ends with a hash
    /// family rebuild.
    pub fn rebuild_due(&self, iter: usize) -> bool {
        self.layer_mode.uses_hashing() && period_due(iter, self.rebuild_period, self.batch_size)
    }
}

fn period_due(iter: usize, period_records: usize, batch_size: usize) -> bool {
    let period = period_records / batch_size;
    period > 0 && iter % period == period - 1
}
