//! Error types for dialfit

use thiserror::Error;

/// dialfit error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Build/configuration error. Raised at cache-build time and treated as
    /// an unrecoverable configuration bug, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// The numerical-accuracy self-test observed two different likelihoods
    /// for the same parameter vector. Indicates a race or non-determinism bug.
    #[error("Non-deterministic likelihood: replay differed by {discrepancy:e}")]
    NonDeterministic {
        /// Largest absolute likelihood difference observed across replays.
        discrepancy: f64,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
