//! Parameter bank: current systematic-parameter values and clamp bounds.

use df_core::{Error, Result};

/// Dense store of systematic-parameter state, globally indexed.
///
/// The index space is fixed at construction; the bank is mutated in place by
/// the external minimizer/sampler between propagation passes and is read-only
/// while a pass is in flight.
#[derive(Debug, Clone)]
pub struct ParameterBank {
    values: Vec<f64>,
    priors: Vec<f64>,
    sigmas: Vec<f64>,
    lower_clamps: Vec<f64>,
    upper_clamps: Vec<f64>,
}

impl ParameterBank {
    /// Build a bank from parallel per-parameter arrays.
    ///
    /// Current values start at the priors. All arrays must have the same
    /// length and every clamp interval must be non-empty.
    pub fn new(
        priors: Vec<f64>,
        sigmas: Vec<f64>,
        lower_clamps: Vec<f64>,
        upper_clamps: Vec<f64>,
    ) -> Result<Self> {
        let n = priors.len();
        if sigmas.len() != n || lower_clamps.len() != n || upper_clamps.len() != n {
            return Err(Error::Validation(format!(
                "Parameter bank array length mismatch: priors={} sigmas={} lower={} upper={}",
                n,
                sigmas.len(),
                lower_clamps.len(),
                upper_clamps.len()
            )));
        }
        for i in 0..n {
            if lower_clamps[i] > upper_clamps[i] {
                return Err(Error::Validation(format!(
                    "Parameter {} has empty clamp interval [{}, {}]",
                    i, lower_clamps[i], upper_clamps[i]
                )));
            }
        }
        Ok(Self { values: priors.clone(), priors, sigmas, lower_clamps, upper_clamps })
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the bank holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Current value of parameter `index`.
    #[inline(always)]
    pub fn value(&self, index: usize) -> f64 {
        self.values[index]
    }

    /// All current values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Set parameter `index` to `value`. Out-of-range indices are a
    /// programming error and panic.
    pub fn set_value(&mut self, index: usize, value: f64) {
        self.values[index] = value;
    }

    /// Overwrite every current value from a full-length slice.
    pub fn set_values(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.values.len() {
            return Err(Error::Validation(format!(
                "Parameter vector length mismatch: expected {}, got {}",
                self.values.len(),
                values.len()
            )));
        }
        self.values.copy_from_slice(values);
        Ok(())
    }

    /// Reset every parameter to its prior value.
    pub fn move_to_priors(&mut self) {
        self.values.copy_from_slice(&self.priors);
    }

    /// Prior value of parameter `index`.
    pub fn prior(&self, index: usize) -> f64 {
        self.priors[index]
    }

    /// Prior width of parameter `index`.
    pub fn sigma(&self, index: usize) -> f64 {
        self.sigmas[index]
    }

    /// Signed displacement from the prior in units of the prior width.
    /// Zero when the width is zero (fixed parameter).
    pub fn sigma_displacement(&self, index: usize) -> f64 {
        if self.sigmas[index] == 0.0 {
            0.0
        } else {
            (self.values[index] - self.priors[index]) / self.sigmas[index]
        }
    }

    /// Lower clamp bounds, parallel to the value array.
    pub fn lower_clamps(&self) -> &[f64] {
        &self.lower_clamps
    }

    /// Upper clamp bounds, parallel to the value array.
    pub fn upper_clamps(&self) -> &[f64] {
        &self.upper_clamps
    }

    /// Current value of parameter `index`, clamped into its bounds.
    #[inline(always)]
    pub fn clamped_value(&self, index: usize) -> f64 {
        self.values[index].clamp(self.lower_clamps[index], self.upper_clamps[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> ParameterBank {
        ParameterBank::new(
            vec![0.0, 1.0],
            vec![1.0, 0.5],
            vec![-3.0, 0.0],
            vec![3.0, 2.0],
        )
        .unwrap()
    }

    #[test]
    fn test_starts_at_priors() {
        let b = bank();
        assert_eq!(b.values(), &[0.0, 1.0]);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let r = ParameterBank::new(vec![0.0], vec![1.0, 1.0], vec![0.0], vec![1.0]);
        assert!(r.is_err());
    }

    #[test]
    fn test_empty_clamp_interval_rejected() {
        let r = ParameterBank::new(vec![0.0], vec![1.0], vec![1.0], vec![-1.0]);
        assert!(r.is_err());
    }

    #[test]
    fn test_clamped_value() {
        let mut b = bank();
        b.set_value(0, 10.0);
        assert_eq!(b.value(0), 10.0);
        assert_eq!(b.clamped_value(0), 3.0);
        b.set_value(0, -10.0);
        assert_eq!(b.clamped_value(0), -3.0);
    }

    #[test]
    fn test_sigma_displacement() {
        let mut b = bank();
        b.set_value(1, 2.0);
        assert_eq!(b.sigma_displacement(1), 2.0);
        b.move_to_priors();
        assert_eq!(b.sigma_displacement(1), 0.0);
    }
}
