//! Fixed-capacity id container backing each LSH table cell.
//!
//! A bucket holds at most 128 ids. The shipped policy is a FIFO ring: once
//! full, a new id overwrites the oldest slot. A reservoir-sampling policy
//! exists behind a compile-time switch but is disabled; it keeps a uniform
//! sample of everything ever added instead of the most recent window.
//!
//! Retrieval conventions, relied on by the index and its callers:
//! - ids are stored with a `+1` offset by the caller, so `0` always means
//!   "empty slot"
//! - asking for a slot past the capacity yields `-1`

use rand::Rng;

/// Capacity of every bucket. Power of two so the FIFO wrap is a mask.
pub const BUCKET_SIZE: usize = 128;

const BIT_MASK: usize = BUCKET_SIZE - 1;

/// When false, full buckets switch to reservoir sampling. The training
/// engine ships with FIFO; the reservoir path is kept for experiments.
const FIFO: bool = true;

/// Empty-slot sentinel returned by [`Bucket::retrieve`].
pub const EMPTY_SLOT: i64 = 0;

/// Out-of-range marker returned by [`Bucket::retrieve`] for slots >= 128.
pub const OUT_OF_RANGE: i64 = -1;

#[derive(Clone, Debug)]
pub struct Bucket {
    ids: Vec<u32>,
    count: usize,
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

impl Bucket {
    pub fn new() -> Self {
        Self {
            ids: Vec::with_capacity(BUCKET_SIZE),
            count: 0,
        }
    }

    /// Total number of ids ever added (not capped at capacity).
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of ids currently stored.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn reset(&mut self) {
        self.ids.clear();
        self.count = 0;
    }

    /// Store an id and return the slot it landed in, or `None` when the
    /// reservoir policy drops it.
    pub fn add(&mut self, id: u32) -> Option<usize> {
        if FIFO {
            Some(self.add_fifo(id))
        } else {
            self.add_reservoir(id)
        }
    }

    fn add_fifo(&mut self, id: u32) -> usize {
        let slot = self.ids.len();
        if slot == BUCKET_SIZE {
            let slot = self.count & BIT_MASK;
            self.ids[slot] = id;
            self.count += 1;
            return slot;
        }
        self.ids.push(id);
        self.count += 1;
        slot
    }

    fn add_reservoir(&mut self, id: u32) -> Option<usize> {
        self.count += 1;
        if self.ids.len() < BUCKET_SIZE {
            self.ids.push(id);
            return Some(self.ids.len() - 1);
        }
        let mut rng = rand::thread_rng();
        if rng.gen_range(0..self.count) < BUCKET_SIZE {
            let slot = rng.gen_range(0..BUCKET_SIZE);
            self.ids[slot] = id;
            Some(slot)
        } else {
            None
        }
    }

    /// Id at `slot`: the stored value, [`EMPTY_SLOT`] for an unwritten
    /// slot, [`OUT_OF_RANGE`] past the capacity.
    pub fn retrieve(&self, slot: usize) -> i64 {
        if slot >= BUCKET_SIZE {
            return OUT_OF_RANGE;
        }
        match self.ids.get(slot) {
            Some(&id) => id as i64,
            None => EMPTY_SLOT,
        }
    }

    /// The currently stored ids, oldest-overwritten-first once the ring has
    /// wrapped.
    pub fn snapshot(&self) -> &[u32] {
        &self.ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_bucket_is_empty() {
        let b = Bucket::new();
        assert_eq!(b.count(), 0);
        assert_eq!(b.len(), 0);
        assert!(b.snapshot().is_empty());

        assert_eq!(b.retrieve(0), EMPTY_SLOT);
        assert_eq!(b.retrieve(127), EMPTY_SLOT);
        assert_eq!(b.retrieve(128), OUT_OF_RANGE);
    }

    #[test]
    fn test_add_returns_ring_slot() {
        let mut b = Bucket::new();
        for i in 0..BUCKET_SIZE {
            assert_eq!(b.add(i as u32 + 1000), Some(i));
        }
        // After 128 adds the ring wraps: slot = count mod 128.
        assert_eq!(b.add(2000), Some(0));
        assert_eq!(b.add(2001), Some(1));
        assert_eq!(b.count(), 130);
        assert_eq!(b.len(), BUCKET_SIZE);
    }

    #[test]
    fn test_fifo_overwrite_order() {
        // Add 1000..=1129; expect slots 0 and 1 overwritten by 1128, 1129.
        let mut b = Bucket::new();
        for id in 1000..1130u32 {
            b.add(id);
        }

        let all = b.snapshot();
        assert_eq!(all.len(), BUCKET_SIZE);
        assert_eq!(all[0], 1128);
        assert_eq!(all[1], 1129);
        for (slot, &id) in all.iter().enumerate().skip(2) {
            assert_eq!(id, slot as u32 + 1000);
        }

        assert_eq!(b.retrieve(0), 1128);
        assert_eq!(b.retrieve(1), 1129);
        assert_eq!(b.retrieve(2), 1002);
        assert_eq!(b.retrieve(127), 1127);
        assert_eq!(b.retrieve(128), OUT_OF_RANGE);
    }

    #[test]
    fn test_partial_fill_snapshot() {
        let mut b = Bucket::new();
        for id in 1..=10u32 {
            b.add(id);
        }
        assert_eq!(b.snapshot().len(), 10);
        assert_eq!(b.retrieve(9), 10);
        assert_eq!(b.retrieve(10), EMPTY_SLOT);
    }

    #[test]
    fn test_reset() {
        let mut b = Bucket::new();
        for id in 0..200u32 {
            b.add(id);
        }
        b.reset();
        assert_eq!(b.count(), 0);
        assert!(b.snapshot().is_empty());
        assert_eq!(b.retrieve(0), EMPTY_SLOT);
    }
}
