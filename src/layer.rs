//! One layer: neurons, a hash family, an LSH index, and the active-set
//! machinery that ties them together.
//!
//! Per example the layer selects a small active set of neurons (by LSH
//! lookup, uniform sampling, or exact top-k depending on the configured
//! mode), computes activations only for that set, and — on the softmax
//! layer — normalizes them. Selection and activation take `&self` and are
//! safe to run for many examples at once; index maintenance and parameter
//! application take `&mut self` and run between batches.

use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::atomic::AtomicF32;
use crate::config::LayerMode;
use crate::corpus::Pair;
use crate::hash::{HashFamily, HashKind};
use crate::lsh::LshIndex;
use crate::neuron::{NodeKind, Neuron};

/// Mode 1: a candidate must appear in more than this many tables.
const CANDIDATE_THRESHOLD: u32 = 2;

/// Mode 4: pad the candidate set when fewer than this many were retrieved.
const PAD_TRIGGER: usize = 1500;

/// Mode 4: stop padding once the candidate set reaches this size.
const PAD_TARGET: usize = 1000;

/// Std-dev of the initial weight/bias distribution.
const INIT_STDDEV: f32 = 0.01;

#[derive(Clone)]
pub struct Layer {
    id: usize,
    kind: NodeKind,
    mode: LayerMode,
    hash_kind: HashKind,
    k: usize,
    l: usize,
    prev_size: usize,
    neurons: Vec<Neuron>,
    /// Fallback order for mode-4 padding; reshuffled periodically.
    rand_perm: Vec<u32>,
    /// Per-input softmax normalization constants (empty on ReLU layers).
    norm_consts: Vec<AtomicF32>,
    family: HashFamily,
    index: LshIndex,
}

impl Layer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        size: usize,
        prev_size: usize,
        kind: NodeKind,
        mode: LayerMode,
        hash_kind: HashKind,
        batch_size: usize,
        k: usize,
        l: usize,
        range_pow: usize,
    ) -> Self {
        let mut rng = rand::thread_rng();

        let mut rand_perm: Vec<u32> = (0..size as u32).collect();
        rand_perm.shuffle(&mut rng);

        let neurons: Vec<Neuron> = (0..size as u32)
            .into_par_iter()
            .map(|neuron_id| {
                let mut rng = rand::thread_rng();
                let normal = Normal::new(0.0, INIT_STDDEV).unwrap();
                let weights = (0..prev_size).map(|_| normal.sample(&mut rng)).collect();
                Neuron::new(neuron_id, kind, batch_size, weights, normal.sample(&mut rng))
            })
            .collect();

        let norm_consts = if kind == NodeKind::Softmax {
            (0..batch_size).map(|_| AtomicF32::new(0.0)).collect()
        } else {
            Vec::new()
        };

        let mut layer = Self {
            id,
            kind,
            mode,
            hash_kind,
            k,
            l,
            prev_size,
            neurons,
            rand_perm,
            norm_consts,
            family: HashFamily::new(hash_kind, k * l, prev_size),
            index: LshIndex::new(hash_kind, k, l, range_pow),
        };
        for id in 0..layer.neurons.len() {
            layer.insert_into_index(id);
        }
        layer
    }

    pub fn num_neurons(&self) -> usize {
        self.neurons.len()
    }

    pub fn node_kind(&self) -> NodeKind {
        self.kind
    }

    pub fn neurons(&self) -> &[Neuron] {
        &self.neurons
    }

    /// Softmax normalization constant recorded for `input_id`. Calling
    /// this on a ReLU layer is a programmer error.
    pub fn norm_const(&self, input_id: usize) -> f32 {
        assert!(
            self.kind == NodeKind::Softmax,
            "normalization constant requested on non-softmax layer {}",
            self.id
        );
        self.norm_consts[input_id].load()
    }

    /// Select this layer's active set for one example and compute the
    /// activations over it. Returns the retrieval count (candidates seen
    /// before padding, for sampling diagnostics) and the new active set as
    /// (neuron index, activation) pairs.
    pub fn select_and_activate(
        &self,
        prev_active: &[Pair],
        input_id: usize,
        labels: &[u32],
        sparsity: f32,
    ) -> (usize, Vec<Pair>) {
        let (retrieved, mut active) = self.select_active(prev_active, labels, sparsity);
        self.compute_activations(&mut active, prev_active, input_id);
        (retrieved, active)
    }

    fn select_active(
        &self,
        prev_active: &[Pair],
        labels: &[u32],
        sparsity: f32,
    ) -> (usize, Vec<Pair>) {
        if sparsity == 1.0 {
            let all = (0..self.neurons.len() as u32)
                .map(|i| Pair::new(i, 0.0))
                .collect::<Vec<_>>();
            return (all.len(), all);
        }

        match self.mode {
            LayerMode::Threshold => self.select_thresholded(prev_active, labels),
            LayerMode::UniformSample => self.select_uniform(labels, sparsity),
            LayerMode::ExactTopK => self.select_top_k(prev_active, labels, sparsity),
            LayerMode::HashPad => self.select_hash_padded(prev_active, labels),
        }
    }

    /// Count how often each stored neuron id appears across the L queried
    /// buckets. Labels are pre-seeded with count L on the softmax layer so
    /// they always survive selection.
    fn count_candidates(&self, prev_active: &[Pair], labels: &[u32]) -> FxHashMap<u32, u32> {
        let digits = self.family.hash_sparse(prev_active);
        let keys = self.index.compose_keys(&digits);

        let mut counts = FxHashMap::default();
        if self.kind == NodeKind::Softmax {
            for &label in labels {
                counts.insert(label, self.l as u32);
            }
        }
        for snapshot in self.index.query(&keys) {
            for &stored in snapshot {
                // Ids are stored offset by one; 0 never appears.
                *counts.entry(stored - 1).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Mode 1: keep candidates retrieved from strictly more than
    /// [`CANDIDATE_THRESHOLD`] tables. Sized by the data, often small.
    fn select_thresholded(&self, prev_active: &[Pair], labels: &[u32]) -> (usize, Vec<Pair>) {
        let counts = self.count_candidates(prev_active, labels);
        let active: Vec<Pair> = counts
            .into_iter()
            .filter(|&(_, count)| count > CANDIDATE_THRESHOLD)
            .map(|(id, _)| Pair::new(id, 0.0))
            .collect();
        (active.len(), active)
    }

    /// Mode 2 (softmax only): labels plus distinct uniform samples up to
    /// `floor(size · sparsity)`.
    fn select_uniform(&self, labels: &[u32], sparsity: f32) -> (usize, Vec<Pair>) {
        if self.kind != NodeKind::Softmax {
            return (0, Vec::new());
        }
        let size = self.neurons.len();
        let target = (size as f32 * sparsity).floor() as usize;

        let mut chosen = vec![false; size];
        let mut active = Vec::with_capacity(target.max(labels.len()));
        for &label in labels {
            if !chosen[label as usize] {
                chosen[label as usize] = true;
                active.push(Pair::new(label, 0.0));
            }
        }

        let mut rng = rand::thread_rng();
        while active.len() < target {
            let candidate = rng.gen_range(0..size);
            if !chosen[candidate] {
                chosen[candidate] = true;
                active.push(Pair::new(candidate as u32, 0.0));
            }
        }
        (active.len(), active)
    }

    /// Mode 3 (softmax only): exact inner products for every neuron; label
    /// neurons sort first via a -inf sentinel, the rest by descending
    /// activation, ties broken by index.
    fn select_top_k(&self, prev_active: &[Pair], labels: &[u32], sparsity: f32) -> (usize, Vec<Pair>) {
        if self.kind != NodeKind::Softmax {
            return (0, Vec::new());
        }
        let size = self.neurons.len();
        let target = (size as f32 * sparsity).floor() as usize;

        let mut scored: Vec<(f32, u32)> = self
            .neurons
            .par_iter()
            .map(|neuron| {
                let id = neuron.id();
                if labels.contains(&id) {
                    return (f32::NEG_INFINITY, id);
                }
                let mut product = neuron.bias();
                for pair in prev_active {
                    product += neuron.weights()[pair.index as usize] * pair.value;
                }
                (-product, id)
            })
            .collect();

        scored.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(target);

        let active: Vec<Pair> = scored.into_iter().map(|(_, id)| Pair::new(id, 0.0)).collect();
        (active.len(), active)
    }

    /// Mode 4 (the default): every retrieved candidate, padded from the
    /// fallback permutation when retrieval comes up short.
    fn select_hash_padded(&self, prev_active: &[Pair], labels: &[u32]) -> (usize, Vec<Pair>) {
        let mut counts = self.count_candidates(prev_active, labels);
        let retrieved = counts.len();

        if counts.len() < PAD_TRIGGER {
            let size = self.neurons.len();
            let start = rand::thread_rng().gen_range(0..size);
            for &candidate in &self.rand_perm[start..] {
                if counts.len() >= PAD_TARGET {
                    break;
                }
                counts.entry(candidate).or_insert(0);
            }
            if counts.len() < PAD_TARGET {
                for &candidate in &self.rand_perm {
                    if counts.len() >= PAD_TARGET {
                        break;
                    }
                    counts.entry(candidate).or_insert(0);
                }
            }
        }

        let active: Vec<Pair> = counts.into_keys().map(|id| Pair::new(id, 0.0)).collect();
        (retrieved, active)
    }

    fn compute_activations(&self, active: &mut [Pair], prev_active: &[Pair], input_id: usize) {
        let mut max_activation = 0.0f32;
        for pair in active.iter_mut() {
            let value =
                self.neurons[pair.index as usize].compute_activation(prev_active, input_id);
            pair.value = value;
            if value > max_activation {
                max_activation = value;
            }
        }

        if self.kind == NodeKind::Softmax {
            let mut norm = 0.0;
            for pair in active.iter_mut() {
                let exp = (pair.value - max_activation).exp();
                pair.value = exp;
                self.neurons[pair.index as usize].set_activation(input_id, exp);
                norm += exp;
            }
            self.norm_consts[input_id].store(norm);
        }
    }

    /// Reshuffle the mode-4 fallback order.
    pub fn shuffle_fallback(&mut self) {
        self.rand_perm.shuffle(&mut rand::thread_rng());
    }

    pub fn clear_index(&mut self) {
        self.index.clear();
    }

    /// Re-draw the hash family's random state. Neurons are not re-inserted
    /// here; a rehash normally follows.
    pub fn rebuild_family(&mut self) {
        self.family = HashFamily::new(self.hash_kind, self.k * self.l, self.prev_size);
    }

    /// Hash one neuron's weight row and insert it into every table.
    pub fn insert_into_index(&mut self, neuron_id: usize) {
        let digits = self.family.hash_dense(self.neurons[neuron_id].weights());
        let keys = self.index.compose_keys(&digits);
        self.index.add(&keys, neuron_id as u32 + 1);
    }

    /// Clear the index and re-insert every neuron under current weights.
    pub fn rehash(&mut self) {
        self.index.clear();
        for id in 0..self.neurons.len() {
            self.insert_into_index(id);
        }
    }

    /// End-of-batch parameter application, neuron-parallel; optionally
    /// re-inserts every neuron afterwards (serialized, the index is one
    /// writer per bucket).
    pub fn update_parameters(&mut self, learning_rate: f32, use_adam: bool, reinsert: bool) {
        self.neurons.par_iter_mut().for_each(|neuron| {
            if use_adam {
                neuron.apply_adam(learning_rate);
            } else {
                neuron.commit_mirror();
            }
        });

        if reinsert {
            for id in 0..self.neurons.len() {
                self.insert_into_index(id);
            }
            tracing::debug!(layer = self.id, sizes = ?self.index.table_sizes(), "rehashed");
        }
    }

    #[cfg(test)]
    pub(crate) fn neurons_mut(&mut self) -> &mut [Neuron] {
        &mut self.neurons
    }
}
