//! Lock-free f32 cells for cross-example accumulation.
//!
//! Gradient accumulators, per-input deltas and softmax normalization
//! constants are written by several rayon workers at once. Each cell is an
//! f32 stored as `AtomicU32` bits; adds go through a compare-exchange loop.
//!
//! All operations use relaxed ordering: the batch barrier (rayon join)
//! orders the accumulation phase before the parameter-update phase.

use std::sync::atomic::{AtomicU32, Ordering};

/// An f32 value that supports concurrent load/store/add.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Atomically add `delta`, returning the previous value.
    #[inline]
    pub fn fetch_add(&self, delta: f32) -> f32 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return f32::from_bits(current),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Clone for AtomicF32 {
    fn clone(&self) -> Self {
        Self::new(self.load())
    }
}

impl From<f32> for AtomicF32 {
    fn from(value: f32) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_load_store() {
        let cell = AtomicF32::new(1.5);
        assert_eq!(cell.load(), 1.5);
        cell.store(-2.25);
        assert_eq!(cell.load(), -2.25);
    }

    #[test]
    fn test_fetch_add_returns_previous() {
        let cell = AtomicF32::new(1.0);
        assert_eq!(cell.fetch_add(2.0), 1.0);
        assert_eq!(cell.load(), 3.0);
    }

    #[test]
    fn test_concurrent_accumulation() {
        let cell = AtomicF32::new(0.0);
        (0..1000usize).into_par_iter().for_each(|_| {
            cell.fetch_add(1.0);
        });
        // Sums of 1.0 are exact in f32 up to 2^24.
        assert_eq!(cell.load(), 1000.0);
    }
}
