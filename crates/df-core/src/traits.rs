//! Core traits for dialfit
//!
//! The propagation pipeline is consumed by external minimizer/MCMC drivers
//! through [`ObjectiveFunction`]: a parameter vector in, a scalar likelihood
//! out. Keeping the seam here means the drivers never depend on the cache or
//! pipeline crates.

use crate::Result;

/// Objective function seam for external minimizers and samplers.
///
/// Implementations must be safe to call repeatedly with identical parameter
/// vectors and must then return identical values (bit-reproducibility is
/// asserted by the accuracy self-test downstream).
pub trait ObjectiveFunction: Send + Sync {
    /// Number of parameters the objective expects.
    fn n_parameters(&self) -> usize;

    /// Evaluate the objective at the given parameter vector.
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Numerical gradient by central differences. Override when an analytic
    /// gradient is available.
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let n = params.len();
        let mut grad = vec![0.0; n];

        for i in 0..n {
            let eps = 1e-8 * params[i].abs().max(1.0);

            let mut params_plus = params.to_vec();
            params_plus[i] += eps;
            let f_plus = self.eval(&params_plus)?;

            let mut params_minus = params.to_vec();
            params_minus[i] -= eps;
            let f_minus = self.eval(&params_minus)?;

            grad[i] = (f_plus - f_minus) / (2.0 * eps);
        }

        Ok(grad)
    }
}
