//! Default priors applied when a model leaves a role unspecified.

use serde::Deserialize;
use tracing::debug;

use crate::distributions::PriorArg;
use crate::error::Result;
use crate::model::{PriorSpec, SigmaSpec};

/// Role → prior lookup used while finalizing a build.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DefaultPriors {
    /// Residual noise standard deviation.
    pub sigma: PriorSpec,
    /// Group-level standard deviation of a random effect whose own `sigma`
    /// specification is absent or incomplete.
    pub group_sigma: PriorSpec,
    /// Observation likelihood; its location and scale receive the linear
    /// predictor and the residual sigma.
    pub likelihood: PriorSpec,
}

impl Default for DefaultPriors {
    fn default() -> Self {
        Self {
            sigma: half_cauchy(10.0),
            group_sigma: half_cauchy(10.0),
            likelihood: PriorSpec::new("Normal"),
        }
    }
}

impl DefaultPriors {
    /// Load a table from JSON; roles missing from the document keep their
    /// defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn half_cauchy(beta: f64) -> PriorSpec {
    PriorSpec::new("HalfCauchy").arg("beta", PriorArg::Value(beta))
}

/// Group-level sigma prior for the random-effect term `label`.
///
/// A complete `sigma` specification is used as given. Anything else, an
/// absent specification or one missing its name or its arguments, is
/// replaced by `fallback` as a whole. Fields are never merged.
pub fn group_sigma_prior(
    label: &str,
    sigma: Option<&SigmaSpec>,
    fallback: &PriorSpec,
) -> PriorSpec {
    match sigma.and_then(SigmaSpec::complete) {
        Some((name, args)) => PriorSpec {
            name: name.to_string(),
            args: args.clone(),
            sigma: None,
        },
        None => {
            debug!(label, family = %fallback.name, "using default group-level sigma prior");
            PriorSpec {
                sigma: None,
                ..fallback.clone()
            }
        }
    }
}
