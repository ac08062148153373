//! Leaf-value binning.
//!
//! A bin is a conjunction of edge conditions over named event leaves; the
//! same structure serves both histogram binning and dial applicability
//! conditions. Leaves are index-addressed against the shared leaf-name list
//! of the event store.

/// One edge condition: `low <= leaf value < high`.
#[derive(Debug, Clone, PartialEq)]
pub struct BinEdges {
    /// Index into the shared leaf-name list.
    pub leaf: usize,
    /// Inclusive lower edge.
    pub low: f64,
    /// Exclusive upper edge.
    pub high: f64,
}

impl BinEdges {
    /// True when `value` falls inside the edges.
    #[inline(always)]
    pub fn contains(&self, value: f64) -> bool {
        self.low <= value && value < self.high
    }
}

/// A conjunction of edge conditions. An empty condition list matches every
/// event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BinCondition {
    /// Edge conditions, all of which must hold.
    pub edges: Vec<BinEdges>,
}

impl BinCondition {
    /// True when every edge condition holds for the event's leaf values.
    pub fn matches(&self, leaves: &[f64]) -> bool {
        self.edges.iter().all(|e| e.contains(leaves[e.leaf]))
    }
}

/// Ordered bin list; an event lands in the first matching bin.
#[derive(Debug, Clone, Default)]
pub struct Binning {
    bins: Vec<BinCondition>,
}

impl Binning {
    /// Build a binning from ordered bin conditions.
    pub fn new(bins: Vec<BinCondition>) -> Self {
        Self { bins }
    }

    /// Number of bins.
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// True when the binning holds no bins.
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Index of the first bin containing the leaf values, if any. Events
    /// outside every bin are simply not histogrammed.
    pub fn find_bin(&self, leaves: &[f64]) -> Option<usize> {
        self.bins.iter().position(|b| b.matches(leaves))
    }
}
