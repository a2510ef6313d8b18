//! Error types shared across the crate.

use thiserror::Error;

/// Errors produced while loading inputs or running a trajectory.
#[derive(Debug, Error)]
pub enum Error {
    /// A parameter file entry is missing, malformed, or inconsistent with the
    /// other entries.
    #[error("parameter '{name}': {reason}")]
    Parameter {
        /// Name of the offending parameter.
        name: String,
        /// What went wrong.
        reason: String,
    },
    /// A morphology file could not be parsed or does not match the requested
    /// lattice geometry.
    #[error("morphology: {0}")]
    Morphology(String),
    /// A rate evaluation produced a non-finite rate or a negative wait time,
    /// or the event queue ran dry while particles are still alive.
    #[error("rate failure: {0}")]
    Rate(String),
    /// A site/particle back-reference invariant was broken (double occupancy
    /// or a dangling occupant).
    #[error("particle invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    pub(crate) fn parameter(name: &str, reason: impl Into<String>) -> Self {
        Self::Parameter {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Shorthand for results with the crate error type.
pub type Result<T> = std::result::Result<T, Error>;
