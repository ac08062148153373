//! Weight aggregator: per-event multiplicative weight accumulators.

use crate::atomic::{self, AtomicF64};

/// Dense slab of multiplicative accumulators, one per result slot
/// (typically one per physics event).
///
/// Each slot holds the running product of every reweight factor applied to
/// its event in the current propagation pass. Writers targeting distinct
/// slots never block each other; writers targeting the same slot serialize
/// through the cell's compare-exchange loop without lost updates. Readers
/// only run after the phase barrier that ends the write phase.
#[derive(Debug)]
pub struct WeightAggregator {
    slots: Vec<AtomicF64>,
}

impl WeightAggregator {
    /// Neutral element of the multiplicative accumulation.
    pub const NEUTRAL: f64 = 1.0;

    /// Allocate `len` slots, all initialized to the neutral element.
    pub fn new(len: usize) -> Self {
        Self { slots: atomic::slab(len, Self::NEUTRAL) }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no slots are allocated.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reset every slot to the neutral element.
    pub fn reset(&self) {
        self.reset_partition(0, 1);
    }

    /// Reset the round-robin partition of slots owned by `worker` out of
    /// `n_workers`. Safe to run from all workers of a phase concurrently.
    pub fn reset_partition(&self, worker: usize, n_workers: usize) {
        let mut i = worker;
        while i < self.slots.len() {
            self.slots[i].store(Self::NEUTRAL);
            i += n_workers;
        }
    }

    /// Multiply `factor` into `slot`, race-free under arbitrary
    /// interleavings with other writers.
    #[inline(always)]
    pub fn multiply_into(&self, slot: usize, factor: f64) {
        self.slots[slot].fetch_mul(factor);
    }

    /// Current value of `slot`.
    #[inline(always)]
    pub fn get(&self, slot: usize) -> f64 {
        self.slots[slot].load()
    }
}
