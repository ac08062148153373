//! JSON configuration schema for a fit model.
//!
//! The config is a plain serde tree; `Propagator::from_config` turns it into
//! the runtime structures (parameter bank, dial table, samples) and reports
//! inconsistencies as validation errors.

use df_core::{Error, Result};
use serde::{Deserialize, Serialize};

fn default_weight() -> f64 {
    1.0
}

fn default_sigma() -> f64 {
    1.0
}

fn neg_infinity() -> f64 {
    f64::NEG_INFINITY
}

fn infinity() -> f64 {
    f64::INFINITY
}

/// Top-level fit model description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FitConfig {
    /// Names of the per-event leaf values, in storage order.
    pub leaf_names: Vec<String>,
    pub parameter_sets: Vec<ParameterSetConfig>,
    pub samples: Vec<SampleConfig>,
    /// Worker threads for propagation; 0 picks the hardware default.
    #[serde(default)]
    pub n_workers: usize,
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// When set, Asimov data histograms get a Poisson fluctuation drawn
    /// from this seed before locking.
    #[serde(default)]
    pub stat_fluctuation_seed: Option<u64>,
}

impl FitConfig {
    /// Parse a config from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: FitConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Index of a leaf by name.
    pub fn leaf_index(&self, name: &str) -> Result<usize> {
        self.leaf_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Error::Validation(format!("unknown leaf '{name}'")))
    }

    fn validate(&self) -> Result<()> {
        if self.samples.is_empty() {
            return Err(Error::Validation("config has no samples".into()));
        }
        for sample in &self.samples {
            if sample.bins.is_empty() {
                return Err(Error::Validation(format!(
                    "sample '{}' has no bins",
                    sample.name
                )));
            }
            for event in sample
                .mc_events
                .iter()
                .chain(sample.data_events.iter().flatten())
            {
                if event.leaves.len() != self.leaf_names.len() {
                    return Err(Error::Validation(format!(
                        "sample '{}': event has {} leaves, config declares {}",
                        sample.name,
                        event.leaves.len(),
                        self.leaf_names.len()
                    )));
                }
            }
        }
        for set in &self.parameter_sets {
            if set.parameters.is_empty() {
                return Err(Error::Validation(format!(
                    "parameter set '{}' has no parameters",
                    set.name
                )));
            }
            for parameter in &set.parameters {
                if parameter.sigma <= 0.0 {
                    return Err(Error::Validation(format!(
                        "parameter '{}': sigma must be positive",
                        parameter.name
                    )));
                }
                for dial in &parameter.dials {
                    dial.kind.validate(&parameter.name)?;
                }
            }
        }
        Ok(())
    }
}

/// How propagation rebuilds the MC histograms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Full per-event reweighting.
    #[default]
    Direct,
    /// Linearized bin-level response functions.
    ResponseFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterSetConfig {
    pub name: String,
    pub parameters: Vec<ParameterConfig>,
    /// Row-major prior covariance over this set's parameters.
    #[serde(default)]
    pub covariance: Option<Vec<Vec<f64>>>,
    /// Reserve a single dial-cache slot for the whole set and keep only the
    /// first applicable dial per event.
    #[serde(default)]
    pub use_only_one_dial_per_event: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterConfig {
    pub name: String,
    pub prior: f64,
    #[serde(default = "default_sigma")]
    pub sigma: f64,
    #[serde(default = "neg_infinity")]
    pub lower_clamp: f64,
    #[serde(default = "infinity")]
    pub upper_clamp: f64,
    #[serde(default)]
    pub dials: Vec<DialConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialConfig {
    /// Restrict the dial to events of one dataset; absent applies to all.
    #[serde(default)]
    pub dataset: Option<usize>,
    /// Leaf-range conditions, all of which must hold. Empty matches every
    /// event.
    #[serde(default)]
    pub condition: Vec<EdgeConfig>,
    #[serde(flatten)]
    pub kind: DialKindConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DialKindConfig {
    /// Compact spline on a uniform knot grid.
    CompactSpline {
        /// Parameter value of the first knot.
        lower_bound: f64,
        /// Knot spacing.
        step: f64,
        /// Knot values, at least two.
        knots: Vec<f64>,
    },
    /// Direct normalization by the parameter value.
    Norm,
}

impl DialKindConfig {
    fn validate(&self, parameter: &str) -> Result<()> {
        if let DialKindConfig::CompactSpline { step, knots, .. } = self {
            if *step <= 0.0 {
                return Err(Error::Validation(format!(
                    "parameter '{parameter}': spline step must be positive"
                )));
            }
            if knots.len() < 2 {
                return Err(Error::Validation(format!(
                    "parameter '{parameter}': spline needs at least two knots"
                )));
            }
        }
        Ok(())
    }

    /// Packed spline payload: lower bound, inverse step, then the knots.
    pub fn raw_points(&self) -> Option<Vec<f64>> {
        match self {
            DialKindConfig::CompactSpline { lower_bound, step, knots } => {
                let mut raw = Vec::with_capacity(knots.len() + 2);
                raw.push(*lower_bound);
                raw.push(1.0 / step);
                raw.extend_from_slice(knots);
                Some(raw)
            }
            DialKindConfig::Norm => None,
        }
    }
}

/// One bin-condition edge, half-open over a named leaf.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeConfig {
    pub leaf: String,
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SampleConfig {
    pub name: String,
    /// Post-fill histogram normalization.
    #[serde(default = "default_weight")]
    pub hist_scale: f64,
    /// One condition list per bin; the first matching bin wins.
    pub bins: Vec<Vec<EdgeConfig>>,
    pub mc_events: Vec<EventConfig>,
    /// Observed events; absent means Asimov data built from the nominal MC.
    #[serde(default)]
    pub data_events: Option<Vec<EventConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventConfig {
    pub leaves: Vec<f64>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub dataset: usize,
}
