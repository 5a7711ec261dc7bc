//! Per-neuron parameters and per-input training scratch.
//!
//! A neuron owns its weight row, bias, optimizer state and one scratch
//! slot per batch position. Forward and backward passes take `&self`:
//! slot fields and gradient accumulators are atomic cells, so rayon
//! workers handling different examples can run concurrently. Slots are
//! partitioned by input id; gradient accumulation genuinely collides
//! across examples and relies on atomic adds. Parameter application
//! (`apply_adam`, `commit_mirror`) is neuron-exclusive and takes `&mut
//! self`.
//!
//! Slot lifecycle per input id within a batch:
//! inactive → activated by `compute_activation` → cleared by
//! `backpropagate`. Between batch steps every slot is inactive with zero
//! activation and delta.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::atomic::AtomicF32;
use crate::corpus::Pair;

pub const BETA1: f32 = 0.9;
pub const BETA2: f32 = 0.999;
pub const EPS: f32 = 1e-8;

/// Step-size multiplier of the Adam update.
const RATIO: f32 = 1.0;

/// Softmax normalization guard against empty active sets.
pub const NORM_EPS: f32 = 1e-7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Relu,
    Softmax,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Relu => "ReLU",
            Self::Softmax => "Softmax",
        })
    }
}

/// Per-input scratch: activation state for one batch position.
#[derive(Debug, Default)]
pub struct Slot {
    active: AtomicBool,
    activation: AtomicF32,
    delta: AtomicF32,
}

impl Clone for Slot {
    fn clone(&self) -> Self {
        Self {
            active: AtomicBool::new(self.active.load(Ordering::Relaxed)),
            activation: self.activation.clone(),
            delta: self.delta.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Neuron {
    id: u32,
    kind: NodeKind,
    batch_size: usize,
    weights: Vec<f32>,
    bias: f32,
    /// Pending SGD updates, committed in bulk; starts equal to the
    /// weights. Unused under Adam but kept so both optimizers drive the
    /// same backward path.
    mirror_weights: Vec<AtomicF32>,
    mirror_bias: AtomicF32,
    /// Raw gradient accumulators, zeroed by every optimizer step.
    grad_weights: Vec<AtomicF32>,
    grad_bias: AtomicF32,
    adam_mom: Vec<f32>,
    adam_vel: Vec<f32>,
    adam_mom_bias: f32,
    adam_vel_bias: f32,
    slots: Vec<Slot>,
}

impl Neuron {
    pub fn new(id: u32, kind: NodeKind, batch_size: usize, weights: Vec<f32>, bias: f32) -> Self {
        let dim = weights.len();
        Self {
            id,
            kind,
            batch_size,
            mirror_weights: weights.iter().map(|&w| AtomicF32::new(w)).collect(),
            mirror_bias: AtomicF32::new(bias),
            grad_weights: (0..dim).map(|_| AtomicF32::new(0.0)).collect(),
            grad_bias: AtomicF32::new(0.0),
            adam_mom: vec![0.0; dim],
            adam_vel: vec![0.0; dim],
            adam_mom_bias: 0.0,
            adam_vel_bias: 0.0,
            slots: (0..batch_size).map(|_| Slot::default()).collect(),
            weights,
            bias,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Input dimensionality (previous layer size).
    pub fn dim(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn bias(&self) -> f32 {
        self.bias
    }

    pub fn is_active(&self, input_id: usize) -> bool {
        self.slots[input_id].active.load(Ordering::Relaxed)
    }

    /// Activation recorded for `input_id`, 0 when the slot is inactive.
    pub fn last_activation(&self, input_id: usize) -> f32 {
        let slot = &self.slots[input_id];
        if slot.active.load(Ordering::Relaxed) {
            slot.activation.load()
        } else {
            0.0
        }
    }

    pub fn last_delta(&self, input_id: usize) -> f32 {
        self.slots[input_id].delta.load()
    }

    fn slot(&self, input_id: usize) -> &Slot {
        assert!(
            input_id < self.batch_size,
            "input id {input_id} out of range for batch size {}",
            self.batch_size
        );
        &self.slots[input_id]
    }

    fn active_slot(&self, input_id: usize) -> &Slot {
        let slot = self.slot(input_id);
        assert!(
            slot.active.load(Ordering::Relaxed),
            "neuron {} slot {input_id} is not active",
            self.id
        );
        slot
    }

    /// Activate the slot and compute `bias + Σ w[idx]·val` over the
    /// previous layer's active pairs. ReLU clamps negatives to zero and
    /// zeroes the pending delta (the gradient dies at the clamp); softmax
    /// activations stay raw until the layer normalizes them.
    pub fn compute_activation(&self, data: &[Pair], input_id: usize) -> f32 {
        let slot = self.slot(input_id);
        slot.active.store(true, Ordering::Relaxed);

        let mut activation = self.bias;
        for pair in data {
            activation += self.weights[pair.index as usize] * pair.value;
        }

        if self.kind == NodeKind::Relu && activation < 0.0 {
            activation = 0.0;
            slot.delta.store(0.0);
        }
        slot.activation.store(activation);
        activation
    }

    /// Write-through for the softmax post-normalization value.
    pub fn set_activation(&self, input_id: usize, value: f32) {
        self.slot(input_id).activation.store(value);
    }

    /// Normalize the recorded activation and derive the cross-entropy
    /// delta. Label neurons push up by `1/|labels|`; everyone active is
    /// pulled down by its probability mass, averaged over the batch.
    pub fn compute_softmax_delta(&self, norm_const: f32, input_id: usize, labels: &[u32]) {
        let slot = self.active_slot(input_id);

        let probability = slot.activation.load() / (norm_const + NORM_EPS);
        slot.activation.store(probability);

        let pull = probability / self.batch_size as f32;
        let delta = if labels.contains(&self.id) {
            1.0 / labels.len() as f32 - pull
        } else {
            -pull
        };
        slot.delta.store(delta);
    }

    /// Accumulate into this neuron's delta as part of a *following* layer's
    /// backward pass. No-op when the recorded activation is not positive:
    /// the ReLU gradient is zero there.
    pub fn increment_delta(&self, input_id: usize, increment: f32) {
        let slot = self.active_slot(input_id);
        if slot.activation.load() <= 0.0 {
            return;
        }
        slot.delta.fetch_add(increment);
    }

    /// Backward step for a hidden/output neuron: push delta into the
    /// previous layer's active slots and accumulate this neuron's
    /// gradients, then clear the slot.
    pub fn backpropagate(
        &self,
        prev_neurons: &[Neuron],
        prev_active: &[Pair],
        learning_rate: f32,
        input_id: usize,
        use_adam: bool,
    ) {
        let delta = self.active_slot(input_id).delta.load();

        for pair in prev_active {
            let idx = pair.index as usize;
            let prev = &prev_neurons[idx];
            prev.increment_delta(input_id, delta * self.weights[idx]);

            let grad = delta * prev.last_activation(input_id);
            if use_adam {
                self.grad_weights[idx].fetch_add(grad);
            } else {
                self.mirror_weights[idx].fetch_add(learning_rate * grad);
            }
        }

        self.finish_backward(delta, learning_rate, input_id, use_adam);
    }

    /// Backward step for the first layer: gradients come straight from the
    /// raw input features.
    pub fn backpropagate_first_layer(
        &self,
        features: &[Pair],
        learning_rate: f32,
        input_id: usize,
        use_adam: bool,
    ) {
        let delta = self.active_slot(input_id).delta.load();

        for pair in features {
            let grad = delta * pair.value;
            let idx = pair.index as usize;
            if use_adam {
                self.grad_weights[idx].fetch_add(grad);
            } else {
                self.mirror_weights[idx].fetch_add(learning_rate * grad);
            }
        }

        self.finish_backward(delta, learning_rate, input_id, use_adam);
    }

    fn finish_backward(&self, delta: f32, learning_rate: f32, input_id: usize, use_adam: bool) {
        if use_adam {
            self.grad_bias.fetch_add(delta);
        } else {
            self.mirror_bias.fetch_add(learning_rate * delta);
        }
        self.deactivate(input_id);
    }

    /// Return the slot to its between-steps state.
    pub fn deactivate(&self, input_id: usize) {
        let slot = &self.slots[input_id];
        slot.active.store(false, Ordering::Relaxed);
        slot.delta.store(0.0);
        slot.activation.store(0.0);
    }

    /// Adam step over the accumulated gradients; resets the accumulators.
    pub fn apply_adam(&mut self, learning_rate: f32) {
        for d in 0..self.weights.len() {
            let grad = self.grad_weights[d].load();
            let mom = BETA1 * self.adam_mom[d] + (1.0 - BETA1) * grad;
            let vel = BETA2 * self.adam_vel[d] + (1.0 - BETA2) * grad * grad;
            self.weights[d] += RATIO * learning_rate * mom / (vel.sqrt() + EPS);
            self.adam_mom[d] = mom;
            self.adam_vel[d] = vel;
            self.grad_weights[d].store(0.0);
        }

        let grad = self.grad_bias.load();
        self.adam_mom_bias = BETA1 * self.adam_mom_bias + (1.0 - BETA1) * grad;
        self.adam_vel_bias = BETA2 * self.adam_vel_bias + (1.0 - BETA2) * grad * grad;
        self.bias += RATIO * learning_rate * self.adam_mom_bias / (self.adam_vel_bias.sqrt() + EPS);
        self.grad_bias.store(0.0);
    }

    /// SGD commit: adopt the mirror accumulators as the new parameters.
    pub fn commit_mirror(&mut self) {
        for (weight, mirror) in self.weights.iter_mut().zip(&self.mirror_weights) {
            *weight = mirror.load();
        }
        self.bias = self.mirror_bias.load();
    }

    #[cfg(test)]
    pub(crate) fn grad_weight(&self, d: usize) -> f32 {
        self.grad_weights[d].load()
    }

    /// Test hook: install known parameters without disturbing the
    /// length invariants.
    #[cfg(test)]
    pub(crate) fn set_parameters(&mut self, weights: Vec<f32>, bias: f32) {
        assert_eq!(weights.len(), self.weights.len());
        self.mirror_weights = weights.iter().map(|&w| AtomicF32::new(w)).collect();
        self.mirror_bias = AtomicF32::new(bias);
        self.weights = weights;
        self.bias = bias;
    }
}
