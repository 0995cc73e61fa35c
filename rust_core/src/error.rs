use std::fmt::Display;

use thiserror::Error;

/// Errors raised while assembling a model or sampling from it.
///
/// Every variant is fatal for the operation that produced it. A failed
/// build leaves the backend in a state that must be reset before reuse.
#[derive(Debug, Error)]
pub enum Error {
    #[error("the distribution family '{name}' is not registered")]
    UnknownDistribution { name: String },

    #[error("the label '{label}' is already registered in this model scope")]
    DuplicateLabel { label: String },

    #[error("cannot register distribution family '{name}': {reason}")]
    InvalidFamily { name: String, reason: String },

    #[error("malformed prior for '{label}': {reason}")]
    MalformedPriorSpec { label: String, reason: String },

    #[error("shape mismatch in '{context}': expected {expected}, found {found}")]
    ShapeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    #[error("sampling failed: {reason}")]
    SamplerFailure { reason: String },

    #[error("no model has been built; call build() before run()")]
    NotBuilt,

    #[error("the build state is unusable after a failed build; call reset() first")]
    InvalidState,

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn malformed(label: &str, reason: impl Into<String>) -> Self {
        Error::MalformedPriorSpec {
            label: label.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(context: &str, expected: impl Display, found: impl Display) -> Self {
        Error::ShapeMismatch {
            context: context.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub(crate) fn sampler(reason: impl Into<String>) -> Self {
        Error::SamplerFailure {
            reason: reason.into(),
        }
    }
}
