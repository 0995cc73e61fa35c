//! Translation of a [`Model`] into a sampleable graph.
//!
//! A [`Backend`] owns one model scope. `build` walks the model's terms,
//! registers each term's coefficient or effect distributions, sums their
//! contributions into the linear predictor `mu`, and finally attaches the
//! residual prior and the observation likelihood. `run` samples the result.

use std::collections::{BTreeMap, HashMap};

use ndarray::{Array2, ArrayD, ArrayView2, Axis, Ix2, Ix3};
use tracing::{debug, info};

use crate::distributions::{Dist, DistRef, DistributionRegistry, Family, PriorArgs};
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, Shape};
use crate::model::{GroupingFactor, Model, PriorSpec, Response, Term};
use crate::priors::{group_sigma_prior, DefaultPriors};
use crate::sampler::{self, SamplerConfig, Trace};

/// Progress of the current build pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    /// Fresh scope, nothing registered.
    Reset,
    /// Terms are being added to `mu`.
    Accumulating,
    /// Residual prior and likelihood are being attached.
    Finalizing,
    /// Ready to sample.
    Built,
    /// A build failed; only `reset` makes the backend usable again.
    Failed,
}

/// Build state for one model scope.
#[derive(Debug)]
pub struct Backend {
    registry: DistributionRegistry,
    priors: DefaultPriors,
    scope: Graph,
    mu: NodeId,
    dists: BTreeMap<String, Dist>,
    shared_params: HashMap<String, Dist>,
    likelihood: Option<Dist>,
    phase: BuildPhase,
    trace: Option<Trace>,
}

impl Default for Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend {
    pub fn new() -> Self {
        let mut scope = Graph::new();
        let mu = scope.add_constant(0.0);
        Self {
            registry: DistributionRegistry::new(),
            priors: DefaultPriors::default(),
            scope,
            mu,
            dists: BTreeMap::new(),
            shared_params: HashMap::new(),
            likelihood: None,
            phase: BuildPhase::Reset,
            trace: None,
        }
    }

    #[must_use]
    pub fn with_priors(mut self, priors: DefaultPriors) -> Self {
        self.priors = priors;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: DistributionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Families available to term priors. Registering a family here does
    /// not touch the current scope.
    pub fn registry_mut(&mut self) -> &mut DistributionRegistry {
        &mut self.registry
    }

    /// Discard the scope, `mu`, every registered distribution and any
    /// cached trace, and open an empty scope.
    pub fn reset(&mut self) {
        self.scope = Graph::new();
        self.mu = self.scope.add_constant(0.0);
        self.dists.clear();
        self.shared_params.clear();
        self.likelihood = None;
        self.trace = None;
        self.phase = BuildPhase::Reset;
    }

    /// Assemble `model` into the scope.
    ///
    /// With `reset` the previous scope is discarded first; without it the
    /// terms are added to the existing scope. Any error leaves the backend
    /// in [`BuildPhase::Failed`].
    ///
    /// # Errors
    ///
    /// `UnknownDistribution`, `DuplicateLabel`, `MalformedPriorSpec` or
    /// `ShapeMismatch` from the terms, and `InvalidState` when continuing a
    /// failed build without a reset.
    pub fn build(&mut self, model: &Model, reset: bool) -> Result<()> {
        if reset {
            self.reset();
        } else if self.phase == BuildPhase::Failed {
            return Err(Error::InvalidState);
        }
        info!(terms = model.terms.len(), observations = model.y.len(), reset, "building model");

        match self.assemble(model) {
            Ok(()) => {
                self.phase = BuildPhase::Built;
                info!(
                    distributions = self.dists.len(),
                    params = self.scope.param_count,
                    "model built"
                );
                Ok(())
            }
            Err(err) => {
                self.phase = BuildPhase::Failed;
                Err(err)
            }
        }
    }

    /// Sample the posterior of the last successful build and cache the trace.
    pub fn run(&mut self, config: &SamplerConfig) -> Result<&Trace> {
        match self.phase {
            BuildPhase::Built => {}
            BuildPhase::Failed => return Err(Error::InvalidState),
            _ => return Err(Error::NotBuilt),
        }
        let trace = sampler::sample(&self.scope, config)?;
        Ok(self.trace.insert(trace))
    }

    pub fn mu(&self) -> NodeId {
        self.mu
    }

    pub fn dists(&self) -> &BTreeMap<String, Dist> {
        &self.dists
    }

    pub fn dist(&self, label: &str) -> Option<&Dist> {
        self.dists.get(label)
    }

    /// Distributions reused across terms. Nothing populates it yet.
    pub fn shared_params(&self) -> &HashMap<String, Dist> {
        &self.shared_params
    }

    pub fn likelihood(&self) -> Option<&Dist> {
        self.likelihood.as_ref()
    }

    pub fn scope(&self) -> &Graph {
        &self.scope
    }

    pub fn phase(&self) -> BuildPhase {
        self.phase
    }

    pub fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }

    fn assemble(&mut self, model: &Model) -> Result<()> {
        self.phase = BuildPhase::Accumulating;
        for term in model.terms.values() {
            if term.random {
                self.add_random_term(term)?;
            } else {
                self.add_fixed_term(term)?;
            }
        }
        self.phase = BuildPhase::Finalizing;
        self.finalize(&model.y)
    }

    fn resolve<'a>(
        &mut self,
        label: &str,
        dist: impl Into<DistRef<'a>>,
        shape: Shape,
        args: &PriorArgs,
    ) -> Result<NodeId> {
        let dist = self.registry.resolve(&mut self.scope, label, dist, shape, args)?;
        let node = dist.node;
        self.dists.insert(label.to_string(), dist);
        Ok(node)
    }

    fn add_fixed_term(&mut self, term: &Term) -> Result<()> {
        let values = if term.split_by.is_some() {
            squeeze_columns(&term.label, &term.values)?
        } else {
            as_matrix(&term.label, &term.values)?
        };
        let shape = Shape::Vector(values.ncols());
        let label = format!("b_{}", term.label);
        let b = self.resolve(&label, &term.prior.name, shape, &term.prior.args)?;
        self.accumulate(&term.label, values, b)
    }

    fn add_random_term(&mut self, term: &Term) -> Result<()> {
        let family = self.registry.lookup(DistRef::from(&term.prior.name))?;
        let sigma_prior =
            group_sigma_prior(&term.label, term.prior.sigma.as_ref(), &self.priors.group_sigma);

        match &term.split_by {
            None => {
                let values = as_matrix(&term.label, &term.values)?;
                let size = values.ncols();
                let u =
                    self.add_group_effect(&term.label, &family, &term.prior, &sigma_prior, size)?;
                self.accumulate(&term.label, values, u)
            }
            Some(factor) => self.add_split_term(term, factor, &family, &sigma_prior),
        }
    }

    /// Register `sigma_<suffix>` and `u_<suffix>` with the sigma injected
    /// as the effect's scale. Returns the effect vector.
    fn add_group_effect(
        &mut self,
        suffix: &str,
        family: &Family,
        prior: &PriorSpec,
        sigma_prior: &PriorSpec,
        size: usize,
    ) -> Result<NodeId> {
        let sigma_label = format!("sigma_{suffix}");
        let sigma =
            self.resolve(&sigma_label, &sigma_prior.name, Shape::Scalar, &sigma_prior.args)?;
        let label = format!("u_{suffix}");
        let args = family.inject_scale(&label, &prior.args, sigma.into())?;
        self.resolve(&label, family, Shape::Vector(size), &args)
    }

    /// One hierarchical sub-model per level, each over the columns that
    /// are nonzero somewhere at that level.
    fn add_split_term(
        &mut self,
        term: &Term,
        factor: &GroupingFactor,
        family: &Family,
        sigma_prior: &PriorSpec,
    ) -> Result<()> {
        let values = term
            .values
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|_| Error::shape(&term.label, "(rows, columns, levels)", dims(&term.values)))?;
        let (rows, cols, levels) = values.dim();
        if levels != factor.len() {
            return Err(Error::shape(
                &term.label,
                format!("{} levels", factor.len()),
                format!("{levels} levels"),
            ));
        }

        for (i, level) in factor.levels.iter().enumerate() {
            let slice = values.index_axis(Axis(2), i);
            let active = active_columns(&slice);
            let selected =
                Array2::from_shape_fn((rows, active.len()), |(r, j)| slice[[r, active[j]]]);
            debug!(
                term = %term.label,
                level = %level,
                active = active.len(),
                columns = cols,
                "split level"
            );

            let suffix = format!("{}_{level}", term.label);
            let u = self.add_group_effect(&suffix, family, &term.prior, sigma_prior, active.len())?;
            self.accumulate(&term.label, selected, u)?;
        }
        Ok(())
    }

    /// `mu += values · coef`
    fn accumulate(&mut self, label: &str, values: Array2<f64>, coef: NodeId) -> Result<()> {
        let matrix = self.scope.add_matrix(values);
        let contribution = self.scope.mat_vec(matrix, coef)?;
        let current = self.scope.shape(self.mu);
        let added = self.scope.shape(contribution);
        if current.broadcast(added).is_none() {
            return Err(Error::shape(label, current, added));
        }
        self.mu = self.scope.add(self.mu, contribution)?;
        Ok(())
    }

    fn finalize(&mut self, y: &Response) -> Result<()> {
        let sigma_prior = self.priors.sigma.clone();
        let sigma = self.resolve("sigma", &sigma_prior.name, Shape::Scalar, &sigma_prior.args)?;

        let expected = Shape::Vector(y.len());
        let found = self.scope.shape(self.mu);
        if found.broadcast(expected) != Some(expected) {
            return Err(Error::shape("y_pred", expected, found));
        }

        let spec = &self.priors.likelihood;
        let family = self.registry.lookup(DistRef::from(&spec.name))?;
        let args = family.inject_location("y_pred", &spec.args, self.mu.into())?;
        let args = family.inject_scale("y_pred", &args, sigma.into())?;
        let likelihood = self
            .registry
            .observe(&mut self.scope, "y_pred", &family, &args, y.values.to_vec())?;
        self.likelihood = Some(likelihood);
        Ok(())
    }
}

fn dims(values: &ArrayD<f64>) -> String {
    format!("{:?}", values.shape())
}

fn as_matrix(label: &str, values: &ArrayD<f64>) -> Result<Array2<f64>> {
    values
        .view()
        .into_dimensionality::<Ix2>()
        .map(|v| v.to_owned())
        .map_err(|_| Error::shape(label, "(rows, columns)", dims(values)))
}

/// Drop singleton axes after the row axis. The input is left untouched.
fn squeeze_columns(label: &str, values: &ArrayD<f64>) -> Result<Array2<f64>> {
    if values.ndim() == 0 {
        return Err(Error::shape(label, "(rows, columns)", dims(values)));
    }
    let mut view = values.view();
    for axis in (1..view.ndim()).rev() {
        if view.len_of(Axis(axis)) == 1 {
            view = view.index_axis_move(Axis(axis), 0);
        }
    }
    if view.ndim() == 1 {
        view = view.insert_axis(Axis(1));
    }
    view.into_dimensionality::<Ix2>()
        .map(|v| v.to_owned())
        .map_err(|_| Error::shape(label, "(rows, columns)", dims(values)))
}

fn active_columns(slice: &ArrayView2<'_, f64>) -> Vec<usize> {
    slice
        .axis_iter(Axis(1))
        .enumerate()
        .filter(|(_, column)| column.iter().any(|&v| v != 0.0))
        .map(|(c, _)| c)
        .collect()
}
