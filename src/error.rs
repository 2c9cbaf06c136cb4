//! Error types for particle-ensemble operations.
//!
//! Every fallible operation in the crate returns [`Result`]. None of them retry:
//! an SMC step must be applied exactly once, so a failure leaves the ensemble in
//! an undefined state and the caller decides what to do next.

use std::fmt;

use thiserror::Error;

use crate::choices::Address;

/// Which part of a bijection round trip failed to reproduce its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundTripComponent {
    /// The reconstructed model trace differs from the original one.
    ModelState,
    /// The reconstructed forward-proposal choices differ from the sampled ones.
    AuxiliaryChoices,
    /// The inverse translator's weight is not the negation of the forward weight.
    Weight,
}

impl fmt::Display for RoundTripComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundTripComponent::ModelState => "model state",
            RoundTripComponent::AuxiliaryChoices => "auxiliary choices",
            RoundTripComponent::Weight => "weight",
        };
        f.write_str(name)
    }
}

/// Top-level error type for ensemble operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SmcError {
    /// Normalized weights are degenerate (NaN, all -inf, or all zero after exponentiation).
    #[error("Invalid weights: {reason}")]
    InvalidWeights { reason: String },

    /// An extend-only update discarded values that were already committed.
    #[error("Update discarded previously committed choices at {discarded:?}")]
    StructuralUpdate { discarded: Vec<Address> },

    /// Unknown algorithm selector or unsupported option combination.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A bijection failed its round-trip self-check.
    #[error("Round trip check failed on {component}: {detail}")]
    RoundTrip {
        component: RoundTripComponent,
        detail: String,
    },

    /// Sizes or shapes passed to an operation are inconsistent.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure reported by the probabilistic-program runtime.
    #[error("Model error: {0}")]
    Model(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SmcError>;
