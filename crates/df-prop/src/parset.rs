//! Parameter sets: correlated groups of parameters sharing a prior
//! covariance. A set contributes a quadratic penalty to the likelihood and
//! knows how to throw correlated parameter vectors for validation studies.

use df_cache::ParameterBank;
use df_core::{Error, Result};
use nalgebra::{Cholesky, DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

/// A named, contiguous group of parameters in the global bank.
#[derive(Debug)]
pub struct ParameterSet {
    name: String,
    /// Global bank indices, contiguous and in bank order.
    indices: Vec<usize>,
    /// Inverse prior covariance, present when a covariance was configured.
    inv_covariance: Option<DMatrix<f64>>,
    /// Lower Cholesky factor of the covariance, for correlated throws.
    cholesky_lower: Option<DMatrix<f64>>,
    /// When set, this whole group occupies a single slot in each event's
    /// dial cache and only the first applicable dial is kept.
    use_only_one_dial_per_event: bool,
}

impl ParameterSet {
    /// Build a set over the given bank indices. When `covariance` is present
    /// it must be a positive-definite square matrix matching the set size.
    pub fn new(
        name: impl Into<String>,
        indices: Vec<usize>,
        covariance: Option<DMatrix<f64>>,
        use_only_one_dial_per_event: bool,
    ) -> Result<Self> {
        let name = name.into();
        let (inv_covariance, cholesky_lower) = match covariance {
            None => (None, None),
            Some(cov) => {
                if cov.nrows() != indices.len() || cov.ncols() != indices.len() {
                    return Err(Error::Validation(format!(
                        "parameter set '{}': covariance is {}x{} but the set has {} parameters",
                        name,
                        cov.nrows(),
                        cov.ncols(),
                        indices.len()
                    )));
                }
                let chol = Cholesky::new(cov).ok_or_else(|| {
                    Error::Validation(format!(
                        "parameter set '{name}': covariance is not positive definite"
                    ))
                })?;
                let inv = chol.inverse();
                (Some(inv), Some(chol.l()))
            }
        };
        Ok(Self {
            name,
            indices,
            inv_covariance,
            cholesky_lower,
            use_only_one_dial_per_event,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Global bank indices covered by this set.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn n_parameters(&self) -> usize {
        self.indices.len()
    }

    pub fn use_only_one_dial_per_event(&self) -> bool {
        self.use_only_one_dial_per_event
    }

    /// Number of dial-cache slots this set occupies per event.
    pub fn dial_slots(&self) -> usize {
        if self.use_only_one_dial_per_event {
            1
        } else {
            self.indices.len()
        }
    }

    /// Quadratic prior penalty at the bank's current point.
    ///
    /// With a covariance this is `d^T V^-1 d` for the displacement vector
    /// `d = value - prior`; without one it degrades to the uncorrelated sum
    /// of squared sigma displacements.
    pub fn penalty(&self, bank: &ParameterBank) -> f64 {
        match &self.inv_covariance {
            Some(inv) => {
                let d = DVector::from_iterator(
                    self.indices.len(),
                    self.indices.iter().map(|&i| bank.value(i) - bank.prior(i)),
                );
                (d.transpose() * inv * &d)[(0, 0)]
            }
            None => self
                .indices
                .iter()
                .map(|&i| {
                    let d = bank.sigma_displacement(i);
                    d * d
                })
                .sum(),
        }
    }

    /// Draw a correlated throw around the priors and write it into the bank.
    ///
    /// With a covariance the throw is `prior + gain * L z` for standard
    /// normal `z`; without one each parameter is thrown independently with
    /// its own sigma. Values are left unclamped, clamping happens at
    /// evaluation time.
    pub fn throw_into<R: Rng>(&self, bank: &mut ParameterBank, gain: f64, rng: &mut R) {
        match &self.cholesky_lower {
            Some(l) => {
                let z = DVector::from_iterator(
                    self.indices.len(),
                    (0..self.indices.len()).map(|_| rng.sample::<f64, _>(StandardNormal)),
                );
                let shift = l * z;
                for (row, &index) in self.indices.iter().enumerate() {
                    bank.set_value(index, bank.prior(index) + gain * shift[row]);
                }
            }
            None => {
                for &index in &self.indices {
                    let z: f64 = rng.sample(StandardNormal);
                    bank.set_value(index, bank.prior(index) + gain * bank.sigma(index) * z);
                }
            }
        }
    }
}
