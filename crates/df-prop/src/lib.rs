//! Propagation pipeline.
//!
//! Given a parameter bank, this crate reweights every Monte-Carlo event
//! through its cached dial references, refills the per-sample histograms and
//! caches the likelihood, all across a fixed worker pool with deterministic
//! static partitioning. The pipeline is the objective function an external
//! minimizer or MCMC sampler drives between passes.

pub mod binning;
pub mod config;
pub mod dial;
pub mod event;
pub mod likelihood;
pub mod parset;
pub mod propagator;
pub mod response;
pub mod sample;
pub mod worker;

pub use binning::{BinEdges, Binning};
pub use config::FitConfig;
pub use dial::{Dial, DialKind, DialTable};
pub use event::EventContainer;
pub use likelihood::LikelihoodCache;
pub use parset::ParameterSet;
pub use propagator::{FitObjective, PropagationStrategy, Propagator};
pub use sample::{Histogram, Sample, SampleContainer};
pub use worker::WorkerPool;
