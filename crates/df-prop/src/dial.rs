//! Dial table: the global arena of reweighting functions.
//!
//! Events never hold pointers to dials; they hold `DialId` indices into this
//! table. The table is built once from configuration and is read-only during
//! propagation, which makes the per-event dial caches trivially replayable.

use crate::binning::BinCondition;

/// Index into the global dial table.
pub type DialId = u32;

/// Sentinel for an unassigned dial-cache slot.
pub const NO_DIAL: u32 = u32::MAX;

/// Dial payload: how a parameter value turns into a weight factor.
#[derive(Debug, Clone)]
pub enum DialKind {
    /// Compact-spline response. The packed raw points (lower bound, inverse
    /// step, control points) are copied into the spline cache once per
    /// assigned event; during reweighting the factor is read back from the
    /// event's aggregator slot instead of being re-evaluated here.
    CompactSpline {
        /// Packed spline data, at least 4 values.
        raw_points: Vec<f64>,
    },
    /// Normalization dial: the factor is the clamped parameter value itself,
    /// evaluated in-line per event.
    Norm,
}

/// One dial: a reweighting function tied to a parameter, applicable to the
/// events selected by its condition.
#[derive(Debug, Clone)]
pub struct Dial {
    /// Global parameter-bank index this dial reads.
    pub parameter: usize,
    /// Optional dataset filter; `None` applies to every dataset.
    pub dataset: Option<usize>,
    /// Leaf-value applicability condition.
    pub condition: BinCondition,
    /// Payload.
    pub kind: DialKind,
}

impl Dial {
    /// True when this dial can apply to an event of `dataset` with the given
    /// leaf values.
    pub fn applies_to(&self, dataset: usize, leaves: &[f64]) -> bool {
        match self.dataset {
            Some(d) if d != dataset => false,
            _ => self.condition.matches(leaves),
        }
    }
}

/// Append-only dial arena.
#[derive(Debug, Default)]
pub struct DialTable {
    dials: Vec<Dial>,
}

impl DialTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a dial, returning its id.
    pub fn push(&mut self, dial: Dial) -> DialId {
        self.dials.push(dial);
        (self.dials.len() - 1) as DialId
    }

    /// Dial by id. Out-of-range ids are a programming error and panic.
    #[inline(always)]
    pub fn get(&self, id: DialId) -> &Dial {
        &self.dials[id as usize]
    }

    /// Number of dials.
    pub fn len(&self) -> usize {
        self.dials.len()
    }

    /// True when the table holds no dials.
    pub fn is_empty(&self) -> bool {
        self.dials.is_empty()
    }

    /// Iterate over `(id, dial)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (DialId, &Dial)> {
        self.dials.iter().enumerate().map(|(i, d)| (i as DialId, d))
    }
}
