//! Core types and traits shared across the dialfit workspace.
//!
//! This crate carries no propagation logic of its own: it defines the error
//! type, the serializable result types, and the objective-function seam that
//! lets an external minimizer or MCMC sampler consume the propagation
//! pipeline as an opaque likelihood function.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::ObjectiveFunction;
pub use types::{LikelihoodBreakdown, ScanPoint, ScanResult};
