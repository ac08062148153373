//! Samples: binned histograms backed by event containers.
//!
//! Each sample carries an MC container that is refilled on every
//! propagation and a data container that is filled once and then locked.
//! Histogram bins are atomic slabs; during the parallel refill phase each
//! bin has exactly one owning worker, so bin sums are reproducible for any
//! worker count.

use df_cache::AtomicF64;
use df_core::{Error, Result};
use rand::Rng;
use rand_distr::{Distribution, Poisson};
use tracing::debug;

use crate::binning::Binning;
use crate::event::EventContainer;

/// Flat histogram with per-bin sum of weights and sum of squared weights.
#[derive(Debug, Default)]
pub struct Histogram {
    contents: Vec<AtomicF64>,
    sumw2: Vec<AtomicF64>,
}

impl Histogram {
    pub fn new(n_bins: usize) -> Self {
        Self {
            contents: df_cache::slab(n_bins, 0.0),
            sumw2: df_cache::slab(n_bins, 0.0),
        }
    }

    pub fn n_bins(&self) -> usize {
        self.contents.len()
    }

    #[inline(always)]
    pub fn content(&self, bin: usize) -> f64 {
        self.contents[bin].load()
    }

    /// Per-bin statistical error, `sqrt(sum of squared weights)`.
    pub fn error(&self, bin: usize) -> f64 {
        self.sumw2[bin].load().sqrt()
    }

    /// Overwrite one bin. Takes `&self`; concurrent callers must own
    /// disjoint bins.
    #[inline(always)]
    pub fn set(&self, bin: usize, content: f64, sumw2: f64) {
        self.contents[bin].store(content);
        self.sumw2[bin].store(sumw2);
    }

    /// Multiply every bin by `scale` (and sumw2 by its square).
    pub fn rescale(&self, scale: f64) {
        for bin in 0..self.n_bins() {
            self.contents[bin].store(self.contents[bin].load() * scale);
            self.sumw2[bin].store(self.sumw2[bin].load() * scale * scale);
        }
    }

    /// Copy bin contents into `out`, resizing it to the bin count.
    pub fn snapshot_contents(&self, out: &mut Vec<f64>) {
        out.clear();
        out.extend(self.contents.iter().map(|c| c.load()));
    }
}

/// One side of a sample (MC or data): events plus their histogram.
#[derive(Debug)]
pub struct SampleContainer {
    pub events: EventContainer,
    pub histogram: Histogram,
    /// Event indices per bin, in event order. Rebuilt only when the event
    /// set or the binning changes, never during propagation.
    bin_event_lists: Vec<Vec<u32>>,
    /// Post-fill normalization applied to the whole histogram.
    pub hist_scale: f64,
    /// Locked containers are never refilled; the data side locks after its
    /// initial fill.
    locked: bool,
}

impl SampleContainer {
    pub fn new(n_leaves: usize, n_bins: usize) -> Self {
        Self {
            events: EventContainer::new(n_leaves),
            histogram: Histogram::new(n_bins),
            bin_event_lists: vec![Vec::new(); n_bins],
            hist_scale: 1.0,
            locked: false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Freeze the histogram; subsequent refill calls are no-ops.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Rebuild the per-bin event lists from the current events. Events that
    /// fall outside every bin are dropped from the histogram with a debug
    /// note.
    pub fn update_bin_event_list(&mut self, binning: &Binning) {
        for list in &mut self.bin_event_lists {
            list.clear();
        }
        let mut orphans = 0usize;
        for event in 0..self.events.len() {
            match binning.find_bin(self.events.leaves(event)) {
                Some(bin) => self.bin_event_lists[bin].push(event as u32),
                None => orphans += 1,
            }
        }
        if orphans > 0 {
            debug!(orphans, "events outside the binning are excluded from the histogram");
        }
    }

    /// Re-sum this worker's partition of bins from the cached event lists.
    ///
    /// Bins are assigned round-robin so each bin has a single writer; the
    /// per-bin sum runs in event order regardless of the worker count.
    pub fn refill_partition(&self, worker: usize, n_workers: usize) {
        if self.locked {
            return;
        }
        let mut bin = worker;
        while bin < self.histogram.n_bins() {
            let mut content = 0.0;
            let mut sumw2 = 0.0;
            for &event in &self.bin_event_lists[bin] {
                let w = self.events.event_weight(event as usize);
                content += w;
                sumw2 += w * w;
            }
            self.histogram.set(bin, content, sumw2);
            bin += n_workers;
        }
    }

    /// Apply the histogram normalization. Runs single-threaded after the
    /// parallel refill phase.
    pub fn rescale_histogram(&self) {
        if self.locked || self.hist_scale == 1.0 {
            return;
        }
        self.histogram.rescale(self.hist_scale);
    }

    /// Replace every bin content with a Poisson draw around it. Used to
    /// fluctuate Asimov data; must run before the container is locked.
    pub fn apply_stat_fluctuation<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        for bin in 0..self.histogram.n_bins() {
            let mean = self.histogram.content(bin);
            let drawn = if mean > 0.0 {
                let poisson = Poisson::new(mean).map_err(|e| {
                    Error::Computation(format!("poisson draw for bin {bin} (mean {mean}): {e}"))
                })?;
                poisson.sample(rng)
            } else {
                0.0
            };
            self.histogram.set(bin, drawn, drawn);
        }
        Ok(())
    }
}

/// A named analysis sample: binning plus MC and data containers.
#[derive(Debug)]
pub struct Sample {
    pub name: String,
    pub binning: Binning,
    pub mc: SampleContainer,
    pub data: SampleContainer,
}

impl Sample {
    pub fn new(name: impl Into<String>, binning: Binning, n_leaves: usize) -> Self {
        let n_bins = binning.len();
        Self {
            name: name.into(),
            binning,
            mc: SampleContainer::new(n_leaves, n_bins),
            data: SampleContainer::new(n_leaves, n_bins),
        }
    }

    /// Replace the data events with copies of the MC events whose tree
    /// weight is the MC nominal weight. Filling the data histogram from this
    /// container reproduces the nominal MC prediction exactly.
    pub fn build_asimov_data(&mut self) -> Result<()> {
        let mc = &self.mc.events;
        let mut data = EventContainer::new(mc.n_leaves());
        for event in 0..mc.len() {
            data.push(mc.leaves(event), mc.nominal_weight(event), mc.dataset(event) as u32)?;
        }
        self.data.events = data;
        self.data.hist_scale = self.mc.hist_scale;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::{BinCondition, BinEdges};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_bin_binning() -> Binning {
        Binning::new(vec![
            BinCondition { edges: vec![BinEdges { leaf: 0, low: 0.0, high: 1.0 }] },
            BinCondition { edges: vec![BinEdges { leaf: 0, low: 1.0, high: 2.0 }] },
        ])
    }

    fn container_with_events() -> SampleContainer {
        let mut c = SampleContainer::new(1, 2);
        c.events.push(&[0.5], 1.0, 0).unwrap();
        c.events.push(&[0.7], 2.0, 0).unwrap();
        c.events.push(&[1.5], 3.0, 0).unwrap();
        c
    }

    #[test]
    fn test_refill_sums_event_weights_per_bin() {
        let binning = two_bin_binning();
        let mut c = container_with_events();
        c.update_bin_event_list(&binning);
        c.refill_partition(0, 1);
        assert_relative_eq!(c.histogram.content(0), 3.0);
        assert_relative_eq!(c.histogram.content(1), 3.0);
        assert_relative_eq!(c.histogram.error(0), (1.0f64 + 4.0).sqrt());
    }

    #[test]
    fn test_refill_is_identical_across_worker_counts() {
        let binning = two_bin_binning();
        let mut c = container_with_events();
        c.update_bin_event_list(&binning);
        c.refill_partition(0, 1);
        let reference: Vec<f64> = (0..2).map(|b| c.histogram.content(b)).collect();

        for n_workers in [2usize, 3, 5] {
            c.histogram = Histogram::new(2);
            for worker in 0..n_workers {
                c.refill_partition(worker, n_workers);
            }
            for bin in 0..2 {
                assert_eq!(c.histogram.content(bin).to_bits(), reference[bin].to_bits());
            }
        }
    }

    #[test]
    fn test_orphan_events_are_dropped() {
        let binning = two_bin_binning();
        let mut c = SampleContainer::new(1, 2);
        c.events.push(&[5.0], 1.0, 0).unwrap();
        c.update_bin_event_list(&binning);
        c.refill_partition(0, 1);
        assert_relative_eq!(c.histogram.content(0), 0.0);
        assert_relative_eq!(c.histogram.content(1), 0.0);
    }

    #[test]
    fn test_locked_container_is_never_refilled() {
        let binning = two_bin_binning();
        let mut c = container_with_events();
        c.update_bin_event_list(&binning);
        c.refill_partition(0, 1);
        c.lock();
        c.histogram.set(0, 99.0, 0.0);
        c.refill_partition(0, 1);
        assert_relative_eq!(c.histogram.content(0), 99.0);
    }

    #[test]
    fn test_rescale_applies_scale_once() {
        let binning = two_bin_binning();
        let mut c = container_with_events();
        c.hist_scale = 2.0;
        c.update_bin_event_list(&binning);
        c.refill_partition(0, 1);
        c.rescale_histogram();
        assert_relative_eq!(c.histogram.content(0), 6.0);
        assert_relative_eq!(c.histogram.error(0), (4.0 * 5.0f64).sqrt());
    }

    #[test]
    fn test_asimov_data_matches_nominal_mc() {
        let binning = two_bin_binning();
        let mut sample = Sample::new("numu", binning, 1);
        sample.mc.events.push(&[0.5], 1.5, 0).unwrap();
        sample.mc.events.push(&[1.5], 2.5, 0).unwrap();
        sample.build_asimov_data().unwrap();

        let b = two_bin_binning();
        sample.data.update_bin_event_list(&b);
        sample.data.refill_partition(0, 1);
        assert_relative_eq!(sample.data.histogram.content(0), 1.5);
        assert_relative_eq!(sample.data.histogram.content(1), 2.5);
    }

    #[test]
    fn test_stat_fluctuation_is_seed_reproducible() {
        let binning = two_bin_binning();
        let mut a = container_with_events();
        a.update_bin_event_list(&binning);
        a.refill_partition(0, 1);
        let mut b = container_with_events();
        b.update_bin_event_list(&binning);
        b.refill_partition(0, 1);

        a.apply_stat_fluctuation(&mut StdRng::seed_from_u64(7)).unwrap();
        b.apply_stat_fluctuation(&mut StdRng::seed_from_u64(7)).unwrap();
        for bin in 0..2 {
            assert_eq!(a.histogram.content(bin).to_bits(), b.histogram.content(bin).to_bits());
            assert_relative_eq!(a.histogram.error(bin), a.histogram.content(bin).sqrt());
        }
    }
}
