//! Bin-level response functions: a linearized fast path for propagation.
//!
//! Instead of reweighting every event, the histograms are rebuilt from a
//! nominal snapshot plus per-parameter fractional deviations recorded at the
//! +1 sigma anchor point. Event weights are not updated on this path; only
//! the bin contents move.

use df_cache::ParameterBank;

use crate::sample::Sample;
use crate::worker::partition;

/// Linearized per-bin responses for every sample.
#[derive(Debug)]
pub struct ResponseFunctions {
    /// Nominal bin contents, `[sample][bin]`, captured at the priors.
    nominal: Vec<Vec<f64>>,
    /// Fractional deviation from nominal at `prior + 1 sigma`, indexed
    /// `[parameter][sample][bin]`.
    deviations: Vec<Vec<Vec<f64>>>,
}

impl ResponseFunctions {
    pub fn new(nominal: Vec<Vec<f64>>, deviations: Vec<Vec<Vec<f64>>>) -> Self {
        Self { nominal, deviations }
    }

    pub fn n_parameters(&self) -> usize {
        self.deviations.len()
    }

    /// Rebuild this worker's partition of bins in every sample as
    /// `nominal * (1 + sum_p x_p * dev_p)`, where `x_p` is the parameter's
    /// displacement from its prior in sigma units. Bin errors are reset to
    /// the Poisson expectation `sqrt(content)`.
    pub fn apply_partition(
        &self,
        samples: &[Sample],
        bank: &ParameterBank,
        worker: usize,
        n_workers: usize,
    ) {
        let displacements: Vec<f64> =
            (0..self.n_parameters()).map(|p| bank.sigma_displacement(p)).collect();
        for (sample_index, sample) in samples.iter().enumerate() {
            let nominal = &self.nominal[sample_index];
            for bin in partition(worker, n_workers, nominal.len()) {
                let mut shift = 0.0;
                for (parameter, displacement) in displacements.iter().enumerate() {
                    shift += displacement * self.deviations[parameter][sample_index][bin];
                }
                let content = nominal[bin] * (1.0 + shift);
                sample.mc.histogram.set(bin, content, content.max(0.0));
            }
        }
    }
}
