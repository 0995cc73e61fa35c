//! Declarative description of a mixed-effects regression: named terms with
//! their design tensors and priors, plus the observed response.

use std::collections::BTreeMap;

use ndarray::{Array, Array1, ArrayD, Dimension};
use serde::{Deserialize, Deserializer};

use crate::distributions::{PriorArg, PriorArgs};
use crate::error::{Error, Result};

/// Family name plus keyword arguments describing a prior.
///
/// Random-effect terms may carry a nested `sigma` specification for their
/// group-level standard deviation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriorSpec {
    pub name: String,
    #[serde(default)]
    pub args: PriorArgs,
    #[serde(default, deserialize_with = "lenient_sigma")]
    pub sigma: Option<SigmaSpec>,
}

/// An unreadable `sigma` is treated as absent, so the term falls back to
/// the default group-level prior instead of rejecting the whole spec.
fn lenient_sigma<'de, D>(deserializer: D) -> std::result::Result<Option<SigmaSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(raw).ok())
}

impl PriorSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: PriorArgs::new(),
            sigma: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<PriorArg>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_sigma(mut self, sigma: SigmaSpec) -> Self {
        self.sigma = Some(sigma);
        self
    }
}

/// Group-level standard deviation prior of a random effect. Either field
/// may be missing; only a complete specification is ever used.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SigmaSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub args: Option<PriorArgs>,
}

impl SigmaSpec {
    pub fn new(name: impl Into<String>, args: PriorArgs) -> Self {
        Self {
            name: Some(name.into()),
            args: Some(args),
        }
    }

    /// The full `(name, args)` pair, or `None` unless both are present and
    /// the name is non-empty.
    pub fn complete(&self) -> Option<(&str, &PriorArgs)> {
        match (&self.name, &self.args) {
            (Some(name), Some(args)) if !name.trim().is_empty() => Some((name.as_str(), args)),
            _ => None,
        }
    }
}

/// Categorical factor whose levels partition a grouped term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingFactor {
    pub levels: Vec<String>,
}

impl GroupingFactor {
    pub fn new<I, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            levels: levels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// One term of the linear predictor.
///
/// `values` has one row per observation. Ungrouped terms are
/// `(rows, columns)`; terms with a `split_by` factor carry a trailing level
/// axis, `(rows, columns, levels)`.
#[derive(Debug, Clone)]
pub struct Term {
    pub label: String,
    pub values: ArrayD<f64>,
    pub random: bool,
    pub split_by: Option<GroupingFactor>,
    pub prior: PriorSpec,
}

impl Term {
    pub fn fixed<D: Dimension>(
        label: impl Into<String>,
        values: Array<f64, D>,
        prior: PriorSpec,
    ) -> Self {
        Self {
            label: label.into(),
            values: values.into_dyn(),
            random: false,
            split_by: None,
            prior,
        }
    }

    pub fn random<D: Dimension>(
        label: impl Into<String>,
        values: Array<f64, D>,
        prior: PriorSpec,
    ) -> Self {
        Self {
            random: true,
            ..Self::fixed(label, values, prior)
        }
    }

    #[must_use]
    pub fn split_by(mut self, factor: GroupingFactor) -> Self {
        self.split_by = Some(factor);
        self
    }
}

/// Observed response, one entry per observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub values: Array1<f64>,
}

impl Response {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<f64>> for Response {
    fn from(values: Vec<f64>) -> Self {
        Self {
            values: Array1::from(values),
        }
    }
}

impl From<Array1<f64>> for Response {
    fn from(values: Array1<f64>) -> Self {
        Self { values }
    }
}

/// Terms keyed by label plus the response they explain.
#[derive(Debug, Clone)]
pub struct Model {
    pub terms: BTreeMap<String, Term>,
    pub y: Response,
}

impl Model {
    pub fn new(y: impl Into<Response>) -> Self {
        Self {
            terms: BTreeMap::new(),
            y: y.into(),
        }
    }

    /// # Errors
    ///
    /// Returns `DuplicateLabel` if a term with the same label exists.
    pub fn add_term(&mut self, term: Term) -> Result<()> {
        if self.terms.contains_key(&term.label) {
            return Err(Error::DuplicateLabel { label: term.label });
        }
        self.terms.insert(term.label.clone(), term);
        Ok(())
    }

    /// Builder form of [`Model::add_term`].
    pub fn with_term(mut self, term: Term) -> Result<Self> {
        self.add_term(term)?;
        Ok(self)
    }
}
