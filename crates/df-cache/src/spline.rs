//! Compact-spline weight cache.
//!
//! Stores one spline record per (result slot, parameter) pair that needs
//! reweighting. Records are packed contiguously into a shared knot-space
//! slab: each record's sub-range holds the domain lower bound, the inverse
//! knot spacing, and the ordered control-point values. No x-coordinates are
//! stored.
//!
//! The build protocol is fail-fast: reserve once, append in order, validate
//! everything. Any violation is a configuration bug and surfaces as a
//! `Validation` error before the first propagation pass; nothing here is
//! retried or recovered from.

use crate::atomic::{self, AtomicF64};
use crate::kernel::compact_spline_value;
use crate::parameters::ParameterBank;
use crate::results::WeightAggregator;
use df_core::{Error, Result};

/// Accounting policy for the reserved knot space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceOption {
    /// The supplied capacity counts control points only; the cache adds the
    /// two header values per spline itself.
    Points,
    /// The supplied capacity already includes the per-spline headers.
    Space,
}

/// Pre-built compact-spline bank with batched evaluation.
#[derive(Debug)]
pub struct CompactSplineCache {
    n_parameters: usize,
    n_result_slots: usize,

    splines_reserved: usize,
    splines_used: usize,
    space_reserved: usize,
    space_used: usize,

    /// Aggregator slot each spline multiplies into.
    result_slot: Vec<u32>,
    /// Parameter bank index each spline reads.
    parameter_index: Vec<u16>,
    /// Packed sub-range offsets; `splines_reserved + 1` entries, entry 0 is 0
    /// and entry `splines_used` is the total knot space consumed.
    offsets: Vec<u32>,
    /// Shared knot-space slab.
    knot_space: Vec<f64>,

    /// Per-spline evaluation scratch, written in parallel.
    values: Vec<AtomicF64>,
    /// Slot-grouped spline index (CSR over result slots), built by
    /// `finalize`. Gives each slot exactly one writer, in spline order.
    slot_offsets: Vec<u32>,
    slot_splines: Vec<u32>,
    finalized: bool,
}

impl Default for CompactSplineCache {
    /// Empty cache: evaluation over it is a no-op.
    fn default() -> Self {
        Self {
            n_parameters: 0,
            n_result_slots: 0,
            splines_reserved: 0,
            splines_used: 0,
            space_reserved: 0,
            space_used: 0,
            result_slot: Vec::new(),
            parameter_index: Vec::new(),
            offsets: vec![0],
            knot_space: Vec::new(),
            values: Vec::new(),
            slot_offsets: Vec::new(),
            slot_splines: Vec::new(),
            finalized: false,
        }
    }
}

impl CompactSplineCache {
    /// Reserve backing storage for at most `max_splines` records and
    /// `max_knot_space` knot values (interpreted per `space`).
    ///
    /// `n_parameters` and `n_result_slots` fix the index ranges that
    /// `add_spline` validates against.
    pub fn reserve(
        n_parameters: usize,
        n_result_slots: usize,
        max_splines: usize,
        max_knot_space: usize,
        space: SpaceOption,
    ) -> Result<Self> {
        if n_parameters > u16::MAX as usize {
            return Err(Error::Validation(format!(
                "Too many parameters for the spline cache index table: {}",
                n_parameters
            )));
        }
        if n_result_slots > u32::MAX as usize {
            return Err(Error::Validation(format!(
                "Too many result slots for the spline cache index table: {}",
                n_result_slots
            )));
        }

        let space_reserved = match space {
            SpaceOption::Points => 2 * max_splines + max_knot_space,
            SpaceOption::Space => max_knot_space,
        };

        tracing::info!(
            splines = max_splines,
            knot_space = space_reserved,
            "reserved compact-spline cache"
        );

        Ok(Self {
            n_parameters,
            n_result_slots,
            splines_reserved: max_splines,
            splines_used: 0,
            space_reserved,
            space_used: 0,
            result_slot: vec![0; max_splines],
            parameter_index: vec![0; max_splines],
            offsets: vec![0; max_splines + 1],
            knot_space: vec![0.0; space_reserved],
            values: atomic::slab(max_splines, 1.0),
            slot_offsets: Vec::new(),
            slot_splines: Vec::new(),
            finalized: false,
        })
    }

    /// Number of appended splines.
    pub fn splines_used(&self) -> usize {
        self.splines_used
    }

    /// Reserved spline capacity.
    pub fn splines_reserved(&self) -> usize {
        self.splines_reserved
    }

    /// Knot-space slots consumed so far.
    pub fn space_used(&self) -> usize {
        self.space_used
    }

    /// Append one spline record.
    ///
    /// `raw_points` is the packed form: lower bound, inverse step, then at
    /// least two control-point values (so at least 4 entries in total).
    /// Every violation is fatal for the build.
    pub fn add_spline(
        &mut self,
        result_slot: usize,
        parameter_index: usize,
        raw_points: &[f64],
    ) -> Result<()> {
        if self.finalized {
            return Err(Error::Validation(
                "Cannot append to a finalized spline cache".to_string(),
            ));
        }
        if result_slot >= self.n_result_slots {
            return Err(Error::Validation(format!(
                "Result index out of bounds: {} >= {}",
                result_slot, self.n_result_slots
            )));
        }
        if parameter_index >= self.n_parameters {
            return Err(Error::Validation(format!(
                "Parameter index out of bounds: {} >= {}",
                parameter_index, self.n_parameters
            )));
        }
        if raw_points.len() < 4 {
            return Err(Error::Validation(format!(
                "Insufficient points in spline: {}",
                raw_points.len()
            )));
        }
        if raw_points[1] <= 0.0 {
            return Err(Error::Validation(format!(
                "Non-positive inverse step in spline data: {}",
                raw_points[1]
            )));
        }

        let new_index = self.splines_used;
        if new_index + 1 > self.splines_reserved {
            return Err(Error::Validation(format!(
                "Not enough space reserved for splines: reserved {} used {}",
                self.splines_reserved,
                new_index + 1
            )));
        }
        // Contiguous-append invariant; a mismatch means the index table was
        // corrupted earlier in the build.
        if self.offsets[new_index] as usize != self.space_used {
            return Err(Error::Validation(format!(
                "Spline index table corrupted: offset {} != space used {}",
                self.offsets[new_index], self.space_used
            )));
        }

        let knot_index = self.space_used;
        if knot_index + raw_points.len() > self.space_reserved {
            return Err(Error::Validation(format!(
                "Not enough space reserved for spline knots: reserved {} used {}",
                self.space_reserved,
                knot_index + raw_points.len()
            )));
        }

        self.splines_used += 1;
        self.space_used += raw_points.len();
        self.result_slot[new_index] = result_slot as u32;
        self.parameter_index[new_index] = parameter_index as u16;
        self.offsets[new_index + 1] = self.space_used as u32;
        self.knot_space[knot_index..knot_index + raw_points.len()].copy_from_slice(raw_points);

        Ok(())
    }

    /// Overwrite a single control point of an already-appended spline.
    /// `knot` addresses the control points only, not the two header values.
    pub fn set_knot(&mut self, spline: usize, knot: usize, value: f64) -> Result<()> {
        if spline >= self.splines_used {
            return Err(Error::Validation(format!(
                "Spline index out of bounds: {} >= {}",
                spline, self.splines_used
            )));
        }
        let knot_index = self.offsets[spline] as usize + 2 + knot;
        if knot_index >= self.offsets[spline + 1] as usize {
            return Err(Error::Validation(format!(
                "Knot index out of bounds: {} >= {}",
                knot,
                self.knot_count(spline)
            )));
        }
        self.knot_space[knot_index] = value;
        Ok(())
    }

    /// Packed sub-range of one spline (headers + control points).
    fn spline_data(&self, spline: usize) -> &[f64] {
        let lo = self.offsets[spline] as usize;
        let hi = self.offsets[spline + 1] as usize;
        &self.knot_space[lo..hi]
    }

    /// Number of control points of spline `spline`.
    pub fn knot_count(&self, spline: usize) -> usize {
        self.spline_data(spline).len() - 2
    }

    /// Control point `knot` of spline `spline`.
    pub fn knot_value(&self, spline: usize, knot: usize) -> f64 {
        self.spline_data(spline)[2 + knot]
    }

    /// Domain lower bound of spline `spline`.
    pub fn lower_bound(&self, spline: usize) -> f64 {
        self.spline_data(spline)[0]
    }

    /// Domain upper bound, reconstructed from the stored inverse step.
    pub fn upper_bound(&self, spline: usize) -> f64 {
        let data = self.spline_data(spline);
        let knot_count = data.len() - 2;
        data[0] + (knot_count - 1) as f64 / data[1]
    }

    /// Parameter bank index read by spline `spline`.
    pub fn parameter_of(&self, spline: usize) -> usize {
        self.parameter_index[spline] as usize
    }

    /// Aggregator slot written by spline `spline`.
    pub fn result_slot_of(&self, spline: usize) -> usize {
        self.result_slot[spline] as usize
    }

    /// Freeze the build and derive the slot-grouped evaluation index.
    /// Idempotent; must be called before any `apply`.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }

        // Counting sort of spline ids by result slot. The per-slot lists
        // come out in ascending spline order, which fixes the multiply
        // order per slot.
        let mut counts = vec![0u32; self.n_result_slots + 1];
        for i in 0..self.splines_used {
            counts[self.result_slot[i] as usize + 1] += 1;
        }
        for slot in 0..self.n_result_slots {
            counts[slot + 1] += counts[slot];
        }
        self.slot_splines = vec![0; self.splines_used];
        let mut cursor = counts.clone();
        for i in 0..self.splines_used {
            let slot = self.result_slot[i] as usize;
            self.slot_splines[cursor[slot] as usize] = i as u32;
            cursor[slot] += 1;
        }
        self.slot_offsets = counts;
        self.finalized = true;

        tracing::debug!(
            splines = self.splines_used,
            knot_space = self.space_used,
            "finalized compact-spline cache"
        );
    }

    /// Evaluate the round-robin partition of splines owned by `worker` into
    /// the scratch slab. Embarrassingly parallel; any partitioning yields
    /// the same per-spline values.
    pub fn evaluate_partition(&self, bank: &ParameterBank, worker: usize, n_workers: usize) {
        debug_assert!(self.finalized, "spline cache used before finalize");
        let lower = bank.lower_clamps();
        let upper = bank.upper_clamps();
        let mut i = worker;
        while i < self.splines_used {
            let par = self.parameter_index[i] as usize;
            let x = bank.value(par);
            let v = compact_spline_value(x, lower[par], upper[par], self.spline_data(i));
            self.values[i].store(v);
            i += n_workers;
        }
    }

    /// Multiply the evaluated factors into the aggregator for the
    /// round-robin partition of result slots owned by `worker`.
    ///
    /// Each slot has exactly one writer here and its factors land in fixed
    /// spline order, so repeated passes with identical parameter values are
    /// bit-identical regardless of worker count or scheduling.
    pub fn multiply_partition(&self, weights: &WeightAggregator, worker: usize, n_workers: usize) {
        debug_assert!(self.finalized, "spline cache used before finalize");
        let mut slot = worker;
        while slot < self.n_result_slots {
            let lo = self.slot_offsets[slot] as usize;
            let hi = self.slot_offsets[slot + 1] as usize;
            for &spline in &self.slot_splines[lo..hi] {
                weights.multiply_into(slot, self.values[spline as usize].load());
            }
            slot += n_workers;
        }
    }

    /// Single-threaded evaluate-and-multiply pass. Returns `false` when no
    /// splines are registered (nothing applied).
    pub fn apply(&self, bank: &ParameterBank, weights: &WeightAggregator) -> bool {
        if self.splines_used == 0 {
            return false;
        }
        self.evaluate_partition(bank, 0, 1);
        self.multiply_partition(weights, 0, 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bank() -> ParameterBank {
        ParameterBank::new(vec![0.0, 1.0], vec![1.0, 1.0], vec![-5.0, 0.0], vec![5.0, 3.0])
            .unwrap()
    }

    fn cache() -> CompactSplineCache {
        CompactSplineCache::reserve(2, 4, 3, 18, SpaceOption::Space).unwrap()
    }

    #[test]
    fn test_space_option_points_adds_headers() {
        let c = CompactSplineCache::reserve(1, 1, 5, 20, SpaceOption::Points).unwrap();
        assert_eq!(c.space_reserved, 30);
        let c = CompactSplineCache::reserve(1, 1, 5, 20, SpaceOption::Space).unwrap();
        assert_eq!(c.space_reserved, 20);
    }

    #[test]
    fn test_add_spline_packs_contiguously() {
        let mut c = cache();
        c.add_spline(0, 0, &[0.0, 1.0, 1.0, 2.0]).unwrap();
        c.add_spline(2, 1, &[0.0, 0.5, 0.5, 1.5, 2.5]).unwrap();
        assert_eq!(c.splines_used(), 2);
        assert_eq!(c.space_used(), 9);
        assert_eq!(c.offsets[..3], [0, 4, 9]);
        assert_eq!(c.knot_count(0), 2);
        assert_eq!(c.knot_count(1), 3);
        assert_eq!(c.result_slot_of(1), 2);
        assert_eq!(c.parameter_of(1), 1);
    }

    #[test]
    fn test_bounds_reconstruction() {
        let mut c = cache();
        // Inverse step 0.5 means spacing 2: three knots span [1, 5].
        c.add_spline(0, 0, &[1.0, 0.5, 0.0, 1.0, 0.0]).unwrap();
        assert_eq!(c.lower_bound(0), 1.0);
        assert_eq!(c.upper_bound(0), 5.0);
    }

    #[test]
    fn test_add_spline_validation_failures() {
        let mut c = cache();
        assert!(c.add_spline(4, 0, &[0.0, 1.0, 1.0, 1.0]).is_err()); // slot range
        assert!(c.add_spline(0, 2, &[0.0, 1.0, 1.0, 1.0]).is_err()); // par range
        assert!(c.add_spline(0, 0, &[0.0, 1.0, 1.0]).is_err()); // too short
        assert!(c.add_spline(0, 0, &[0.0, 0.0, 1.0, 1.0]).is_err()); // bad step
        assert_eq!(c.splines_used(), 0);
    }

    #[test]
    fn test_capacity_exceeded_is_an_error_not_a_truncation() {
        let mut c = CompactSplineCache::reserve(1, 1, 2, 8, SpaceOption::Space).unwrap();
        c.add_spline(0, 0, &[0.0, 1.0, 1.0, 1.0]).unwrap();
        c.add_spline(0, 0, &[0.0, 1.0, 1.0, 1.0]).unwrap();
        let err = c.add_spline(0, 0, &[0.0, 1.0, 1.0, 1.0]).unwrap_err();
        assert!(err.to_string().contains("reserved"));

        let mut c = CompactSplineCache::reserve(1, 1, 3, 8, SpaceOption::Space).unwrap();
        c.add_spline(0, 0, &[0.0, 1.0, 1.0, 1.0]).unwrap();
        c.add_spline(0, 0, &[0.0, 1.0, 1.0, 1.0]).unwrap();
        assert!(c.add_spline(0, 0, &[0.0, 1.0, 1.0, 1.0]).is_err()); // knot space
    }

    #[test]
    fn test_set_knot_bounds() {
        let mut c = cache();
        c.add_spline(0, 0, &[0.0, 1.0, 1.0, 2.0, 3.0]).unwrap();
        c.set_knot(0, 1, 7.5).unwrap();
        assert_eq!(c.knot_value(0, 1), 7.5);
        assert!(c.set_knot(0, 3, 0.0).is_err());
        assert!(c.set_knot(1, 0, 0.0).is_err());
    }

    #[test]
    fn test_apply_no_splines_is_noop() {
        let mut c = cache();
        c.finalize();
        let agg = WeightAggregator::new(4);
        assert!(!c.apply(&bank(), &agg));
        assert!((0..4).all(|i| agg.get(i) == 1.0));
    }

    #[test]
    fn test_apply_multiplies_into_slots() {
        let mut c = cache();
        // Flat spline worth 2.0 everywhere on slot 1, reading parameter 0.
        c.add_spline(1, 0, &[-1.0, 1.0, 2.0, 2.0, 2.0]).unwrap();
        // Identity-at-prior spline on slot 3, reading parameter 1 (prior 1.0).
        c.add_spline(3, 1, &[0.0, 1.0, 0.5, 1.0, 1.5]).unwrap();
        c.finalize();

        let agg = WeightAggregator::new(4);
        assert!(c.apply(&bank(), &agg));
        assert_relative_eq!(agg.get(1), 2.0, epsilon = 1e-12);
        assert_relative_eq!(agg.get(3), 1.0, epsilon = 1e-12);
        assert_eq!(agg.get(0), 1.0);
        assert_eq!(agg.get(2), 1.0);
    }

    #[test]
    fn test_apply_clamps_parameter() {
        let mut b = bank();
        let mut c = cache();
        c.add_spline(0, 1, &[0.0, 1.0, 0.5, 1.0, 2.0, 4.0]).unwrap();
        c.finalize();

        // Parameter 1 clamps to [0, 3]; far beyond the upper clamp the
        // factor must be the value at the clamp bound exactly.
        b.set_value(1, 400.0);
        let agg = WeightAggregator::new(4);
        c.apply(&b, &agg);
        let beyond = agg.get(0);

        b.set_value(1, 3.0);
        let agg = WeightAggregator::new(4);
        c.apply(&b, &agg);
        assert_eq!(beyond.to_bits(), agg.get(0).to_bits());
        assert_relative_eq!(beyond, 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_shared_slot_product_is_order_stable() {
        let mut c = cache();
        // Three splines into the same slot; products must land in spline
        // order for any worker count.
        c.add_spline(2, 0, &[-1.0, 1.0, 1.1, 1.1, 1.1]).unwrap();
        c.add_spline(2, 0, &[-1.0, 1.0, 0.7, 0.7, 0.7]).unwrap();
        c.add_spline(2, 1, &[0.0, 1.0, 3.0, 3.0, 3.0]).unwrap();
        c.finalize();
        let b = bank();

        let reference = {
            let agg = WeightAggregator::new(4);
            c.apply(&b, &agg);
            agg.get(2)
        };
        for n_workers in [1, 2, 3, 7] {
            let agg = WeightAggregator::new(4);
            for w in 0..n_workers {
                c.evaluate_partition(&b, w, n_workers);
            }
            for w in 0..n_workers {
                c.multiply_partition(&agg, w, n_workers);
            }
            assert_eq!(agg.get(2).to_bits(), reference.to_bits());
        }
    }
}
