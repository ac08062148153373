//! Event-weight cache engine.
//!
//! Everything in this crate is flat, index-addressed, structure-of-arrays
//! data: parameter values, clamp bounds, weight accumulators and packed
//! spline knot space are dense slabs addressed by integer indices, never
//! pointer graphs. The same layout works for host-parallel loops or a
//! device kernel, which is the portability property the cache is built
//! around.
//!
//! Build once, evaluate many times: the compact-spline cache is filled
//! through a fail-fast build protocol (reserve, append, validate) and is
//! immutable during evaluation apart from the parameter bank contents.

pub mod atomic;
pub mod kernel;
pub mod parameters;
pub mod results;
pub mod spline;

pub use atomic::{slab, AtomicF64};
pub use parameters::ParameterBank;
pub use results::WeightAggregator;
pub use spline::{CompactSplineCache, SpaceOption};
