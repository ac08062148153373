//! Common data types for dialfit

use serde::{Deserialize, Serialize};

/// Likelihood components for one propagation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodBreakdown {
    /// Statistical term: sum of per-bin Poisson contributions.
    pub stat: f64,

    /// Penalty term: quadratic pulls against the parameter priors.
    pub penalty: f64,
}

impl LikelihoodBreakdown {
    /// Total likelihood (stat + penalty).
    pub fn total(&self) -> f64 {
        self.stat + self.penalty
    }
}

/// One point of a parameter scan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScanPoint {
    /// Parameter value at this point.
    pub value: f64,
    /// Statistical likelihood.
    pub stat: f64,
    /// Penalty likelihood.
    pub penalty: f64,
    /// Total likelihood.
    pub total: f64,
}

/// Result of scanning one parameter over a range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// Global index of the scanned parameter.
    pub parameter_index: usize,
    /// Scanned points, in scan order.
    pub points: Vec<ScanPoint>,
}

impl ScanResult {
    /// The scan point with the smallest total likelihood.
    pub fn minimum(&self) -> Option<&ScanPoint> {
        self.points
            .iter()
            .min_by(|a, b| a.total.partial_cmp(&b.total).unwrap_or(std::cmp::Ordering::Equal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakdown_total() {
        let b = LikelihoodBreakdown { stat: 12.5, penalty: 0.5 };
        assert_eq!(b.total(), 13.0);
    }

    #[test]
    fn test_scan_minimum() {
        let points = vec![
            ScanPoint { value: 0.0, stat: 3.0, penalty: 0.0, total: 3.0 },
            ScanPoint { value: 1.0, stat: 1.0, penalty: 0.5, total: 1.5 },
            ScanPoint { value: 2.0, stat: 2.0, penalty: 2.0, total: 4.0 },
        ];
        let scan = ScanResult { parameter_index: 0, points };
        assert_eq!(scan.minimum().unwrap().value, 1.0);
    }
}
