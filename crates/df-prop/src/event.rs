//! Structure-of-arrays event storage.
//!
//! Leaves are stored row-major in one flat buffer; weights and dial caches
//! live in parallel columns. Event weights and dial references are atomic
//! slabs so that workers can fill disjoint round-robin partitions through a
//! shared reference without aliasing `&mut`.

use df_cache::{AtomicF64, ParameterBank, WeightAggregator};
use df_core::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::dial::{DialKind, DialTable, NO_DIAL};

/// Flat event container for one sample.
#[derive(Debug, Default)]
pub struct EventContainer {
    n_leaves: usize,
    /// Row-major leaf values, `len * n_leaves` entries.
    leaves: Vec<f64>,
    /// Immutable generator-level weight.
    tree_weight: Vec<f64>,
    /// Weight captured at the prior parameter point.
    nominal_weight: Vec<f64>,
    /// Current propagated weight.
    event_weight: Vec<AtomicF64>,
    /// Aggregator slot holding this event's accumulated spline factor.
    result_slot: Vec<u32>,
    /// Dataset tag, used to select applicable dials.
    dataset: Vec<u32>,
    /// Dial-cache capacity per event.
    dial_stride: usize,
    /// Per-event dial references, `len * dial_stride` entries, compacted
    /// front-to-back with `NO_DIAL` padding.
    dial_refs: Vec<AtomicU32>,
}

impl EventContainer {
    /// Empty container for events carrying `n_leaves` leaf values each.
    pub fn new(n_leaves: usize) -> Self {
        Self { n_leaves, ..Self::default() }
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.tree_weight.len()
    }

    /// True when no events are stored.
    pub fn is_empty(&self) -> bool {
        self.tree_weight.is_empty()
    }

    /// Number of leaf values per event.
    pub fn n_leaves(&self) -> usize {
        self.n_leaves
    }

    /// Append an event, returning its index. The event weight starts at the
    /// tree weight and the result slot is unset until propagation is wired.
    pub fn push(&mut self, leaves: &[f64], tree_weight: f64, dataset: u32) -> Result<usize> {
        if leaves.len() != self.n_leaves {
            return Err(Error::Validation(format!(
                "event has {} leaves, container expects {}",
                leaves.len(),
                self.n_leaves
            )));
        }
        self.leaves.extend_from_slice(leaves);
        self.tree_weight.push(tree_weight);
        self.nominal_weight.push(tree_weight);
        self.event_weight.push(AtomicF64::new(tree_weight));
        self.result_slot.push(0);
        self.dataset.push(dataset);
        Ok(self.tree_weight.len() - 1)
    }

    /// Leaf values of one event.
    #[inline(always)]
    pub fn leaves(&self, event: usize) -> &[f64] {
        &self.leaves[event * self.n_leaves..(event + 1) * self.n_leaves]
    }

    /// Generator-level weight.
    #[inline(always)]
    pub fn tree_weight(&self, event: usize) -> f64 {
        self.tree_weight[event]
    }

    /// Weight at the prior parameter point.
    #[inline(always)]
    pub fn nominal_weight(&self, event: usize) -> f64 {
        self.nominal_weight[event]
    }

    /// Current propagated weight.
    #[inline(always)]
    pub fn event_weight(&self, event: usize) -> f64 {
        self.event_weight[event].load()
    }

    /// Dataset tag.
    #[inline(always)]
    pub fn dataset(&self, event: usize) -> usize {
        self.dataset[event] as usize
    }

    /// Aggregator slot assigned to this event.
    #[inline(always)]
    pub fn result_slot(&self, event: usize) -> usize {
        self.result_slot[event] as usize
    }

    /// Assign the aggregator slot for one event.
    pub fn set_result_slot(&mut self, event: usize, slot: usize) {
        self.result_slot[event] = slot as u32;
    }

    /// Freeze the current event weights as the nominal point.
    pub fn capture_nominal_weights(&mut self) {
        for (nominal, weight) in self.nominal_weight.iter_mut().zip(&self.event_weight) {
            *nominal = weight.load();
        }
    }

    /// Allocate the per-event dial cache with `stride` slots per event, all
    /// unassigned. Replaces any previous cache.
    pub fn allocate_dial_cache(&mut self, stride: usize) {
        self.dial_stride = stride;
        self.dial_refs = (0..self.len() * stride).map(|_| AtomicU32::new(NO_DIAL)).collect();
    }

    /// Dial-cache capacity per event.
    pub fn dial_stride(&self) -> usize {
        self.dial_stride
    }

    /// Write a dial reference into one cache slot. Takes `&self` so workers
    /// can fill disjoint event partitions concurrently.
    pub fn assign_dial(&self, event: usize, slot: usize, dial: u32) {
        debug_assert!(slot < self.dial_stride);
        self.dial_refs[event * self.dial_stride + slot].store(dial, Ordering::Relaxed);
    }

    /// Dial references cached for one event, assigned slots only.
    pub fn dial_refs(&self, event: usize) -> impl Iterator<Item = u32> + '_ {
        self.dial_refs[event * self.dial_stride..(event + 1) * self.dial_stride]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .take_while(|&id| id != NO_DIAL)
    }

    /// Recompute the weights of this worker's event partition.
    ///
    /// The weight is the tree weight times the event's accumulated spline
    /// factor times every cached normalization factor. Spline dial references
    /// are skipped here: their contribution was already multiplied into the
    /// aggregator slot by the spline cache.
    pub fn reweight_partition(
        &self,
        worker: usize,
        n_workers: usize,
        dials: &DialTable,
        bank: &ParameterBank,
        weights: &WeightAggregator,
    ) {
        let mut event = worker;
        while event < self.len() {
            let mut w = self.tree_weight[event] * weights.get(self.result_slot(event));
            for id in self.dial_refs(event) {
                let dial = dials.get(id);
                match dial.kind {
                    DialKind::Norm => w *= bank.clamped_value(dial.parameter),
                    DialKind::CompactSpline { .. } => {}
                }
            }
            self.event_weight[event].store(w);
            event += n_workers;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::BinCondition;
    use crate::dial::Dial;
    use approx::assert_relative_eq;

    fn norm_dial(parameter: usize) -> Dial {
        Dial {
            parameter,
            dataset: None,
            condition: BinCondition::default(),
            kind: DialKind::Norm,
        }
    }

    #[test]
    fn test_push_validates_leaf_count() {
        let mut events = EventContainer::new(2);
        assert!(events.push(&[1.0, 2.0], 1.0, 0).is_ok());
        assert!(events.push(&[1.0], 1.0, 0).is_err());
    }

    #[test]
    fn test_leaves_are_row_major() {
        let mut events = EventContainer::new(2);
        events.push(&[1.0, 2.0], 1.0, 0).unwrap();
        events.push(&[3.0, 4.0], 1.0, 0).unwrap();
        assert_eq!(events.leaves(0), &[1.0, 2.0]);
        assert_eq!(events.leaves(1), &[3.0, 4.0]);
    }

    #[test]
    fn test_dial_cache_compaction_stops_at_sentinel() {
        let mut events = EventContainer::new(1);
        events.push(&[0.0], 1.0, 0).unwrap();
        events.allocate_dial_cache(3);
        events.assign_dial(0, 0, 7);
        events.assign_dial(0, 1, 2);
        let refs: Vec<u32> = events.dial_refs(0).collect();
        assert_eq!(refs, vec![7, 2]);
    }

    #[test]
    fn test_reweight_multiplies_norm_and_slot_factors() {
        let mut table = DialTable::new();
        let id = table.push(norm_dial(0));

        let bank = ParameterBank::new(
            vec![1.5],
            vec![1.0],
            vec![f64::NEG_INFINITY],
            vec![f64::INFINITY],
        )
        .unwrap();

        let mut events = EventContainer::new(1);
        events.push(&[0.0], 2.0, 0).unwrap();
        events.set_result_slot(0, 0);
        events.allocate_dial_cache(1);
        events.assign_dial(0, 0, id);

        let weights = WeightAggregator::new(1);
        weights.multiply_into(0, 3.0);

        events.reweight_partition(0, 1, &table, &bank, &weights);
        assert_relative_eq!(events.event_weight(0), 2.0 * 3.0 * 1.5);
    }

    #[test]
    fn test_reweight_skips_spline_refs() {
        let mut table = DialTable::new();
        let id = table.push(Dial {
            parameter: 0,
            dataset: None,
            condition: BinCondition::default(),
            kind: DialKind::CompactSpline { raw_points: vec![0.0, 1.0, 1.0, 1.0, 1.0, 1.0] },
        });

        let bank = ParameterBank::new(
            vec![5.0],
            vec![1.0],
            vec![f64::NEG_INFINITY],
            vec![f64::INFINITY],
        )
        .unwrap();

        let mut events = EventContainer::new(1);
        events.push(&[0.0], 1.0, 0).unwrap();
        events.allocate_dial_cache(1);
        events.assign_dial(0, 0, id);

        let weights = WeightAggregator::new(1);
        events.reweight_partition(0, 1, &table, &bank, &weights);
        // Slot factor is neutral and the spline ref contributes nothing here.
        assert_relative_eq!(events.event_weight(0), 1.0);
    }

    #[test]
    fn test_capture_nominal_weights() {
        let mut events = EventContainer::new(1);
        events.push(&[0.0], 1.0, 0).unwrap();
        events.allocate_dial_cache(0);
        let table = DialTable::new();
        let bank = ParameterBank::new(
            vec![0.0],
            vec![1.0],
            vec![f64::NEG_INFINITY],
            vec![f64::INFINITY],
        )
        .unwrap();
        let weights = WeightAggregator::new(1);
        weights.multiply_into(0, 0.5);
        events.reweight_partition(0, 1, &table, &bank, &weights);
        events.capture_nominal_weights();
        assert_relative_eq!(events.nominal_weight(0), 0.5);
    }
}
