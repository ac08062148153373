//! Likelihood cache: binned Poisson statistics plus prior penalties.
//!
//! The data-side vectors (`observed`, `obs * ln(obs)`, nonzero mask) depend
//! only on the locked data histograms, so they are computed once when the
//! data is locked and reused by every likelihood update. The cache carries a
//! validity flag; any parameter change invalidates it until the next
//! propagation completes.

use df_cache::kernel::poisson_llh_simd;
use df_cache::ParameterBank;
use df_core::{Error, LikelihoodBreakdown, Result};

use crate::parset::ParameterSet;
use crate::sample::Sample;

/// Expected counts below this are clamped before taking the logarithm.
const MIN_EXPECTED: f64 = 1e-10;

/// Precomputed data-side terms for one sample.
#[derive(Debug, Default)]
struct SampleDataRef {
    observed: Vec<f64>,
    obs_ln_obs: Vec<f64>,
    obs_mask: Vec<f64>,
}

impl SampleDataRef {
    fn from_sample(sample: &Sample) -> Self {
        let n_bins = sample.data.histogram.n_bins();
        let mut observed = Vec::with_capacity(n_bins);
        let mut obs_ln_obs = Vec::with_capacity(n_bins);
        let mut obs_mask = Vec::with_capacity(n_bins);
        for bin in 0..n_bins {
            let obs = sample.data.histogram.content(bin);
            observed.push(obs);
            if obs > 0.0 {
                obs_ln_obs.push(obs * obs.ln());
                obs_mask.push(1.0);
            } else {
                obs_ln_obs.push(0.0);
                obs_mask.push(0.0);
            }
        }
        Self { observed, obs_ln_obs, obs_mask }
    }
}

/// Cached likelihood components for the current parameter point.
#[derive(Debug, Default)]
pub struct LikelihoodCache {
    stat: f64,
    penalty: f64,
    valid: bool,
    data_refs: Vec<SampleDataRef>,
    /// Scratch buffer for clamped expected counts.
    expected: Vec<f64>,
}

impl LikelihoodCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the cached data-side vectors. Call after the data histograms
    /// are filled and locked, and again only if they ever change.
    pub fn rebuild_data_refs(&mut self, samples: &[Sample]) {
        self.data_refs = samples.iter().map(SampleDataRef::from_sample).collect();
        self.valid = false;
    }

    /// Mark the cache stale. Reads before the next update are an error.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Recompute both components from the current MC histograms and
    /// parameter point. `samples` must match the containers passed to
    /// `rebuild_data_refs`.
    pub fn update(
        &mut self,
        samples: &[Sample],
        bank: &ParameterBank,
        parameter_sets: &[ParameterSet],
    ) {
        debug_assert_eq!(samples.len(), self.data_refs.len());
        let mut stat = 0.0;
        for (sample, data_ref) in samples.iter().zip(&self.data_refs) {
            let hist = &sample.mc.histogram;
            self.expected.clear();
            self.expected
                .extend((0..hist.n_bins()).map(|bin| hist.content(bin).max(MIN_EXPECTED)));
            stat += poisson_llh_simd(
                &self.expected,
                &data_ref.observed,
                &data_ref.obs_ln_obs,
                &data_ref.obs_mask,
            );
        }
        self.stat = stat;
        self.penalty = parameter_sets.iter().map(|set| set.penalty(bank)).sum();
        self.valid = true;
    }

    /// Current components, or an error if the cache is stale.
    pub fn breakdown(&self) -> Result<LikelihoodBreakdown> {
        if !self.valid {
            return Err(Error::Computation(
                "likelihood cache read before propagation".into(),
            ));
        }
        Ok(LikelihoodBreakdown { stat: self.stat, penalty: self.penalty })
    }
}
