use crate::autodiff::Evaluator;
use crate::error::{Error, Result};
use crate::graph::{Graph, Shape};
use crate::hmc::{self, ChainResult, HmcConfig};
use crate::nuts::{self, NutsConfig};
use ndarray::{Array2, Array3, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{info, warn};

/// Transition kernel used by every chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Nuts,
    Hmc,
}

/// Configuration for the multi-chain sampler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    #[serde(alias = "chains")]
    pub num_chains: usize,
    /// Retained draws per chain.
    #[serde(alias = "samples", alias = "draws")]
    pub num_draws: usize,
    #[serde(alias = "tune")]
    pub num_warmup: usize,
    pub method: Method,
    /// 0 means find one automatically.
    pub step_size: f64,
    /// Trajectory length for `Method::Hmc`.
    pub num_leapfrog_steps: usize,
    /// Tree depth cap for `Method::Nuts`.
    pub max_tree_depth: usize,
    pub target_accept: f64,
    pub seed: u64,
    /// Number of threads. 0 means use Rayon's default (all cores).
    pub num_threads: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_chains: 4,
            num_draws: 1000,
            num_warmup: 500,
            method: Method::Nuts,
            step_size: 0.0,
            num_leapfrog_steps: 15,
            max_tree_depth: 10,
            target_accept: 0.8,
            seed: 42,
            num_threads: 0,
        }
    }
}

impl SamplerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn validate(&self) -> Result<()> {
        if self.num_chains == 0 {
            return Err(Error::sampler("at least one chain is required"));
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(Error::sampler(format!(
                "target_accept must lie in (0, 1), got {}",
                self.target_accept
            )));
        }
        if self.method == Method::Hmc && self.num_leapfrog_steps == 0 {
            return Err(Error::sampler("HMC needs at least one leapfrog step"));
        }
        Ok(())
    }
}

/// Posterior draws of one registered random variable, on its constrained scale.
#[derive(Debug, Clone)]
pub struct TraceVariable {
    pub name: String,
    pub shape: Shape,
    /// draws[[chain, draw, element]]
    pub draws: Array3<f64>,
}

impl TraceVariable {
    /// All chains stacked: one row per draw, one column per element.
    pub fn flattened(&self) -> Array2<f64> {
        let (chains, draws, elems) = self.draws.dim();
        Array2::from_shape_fn((chains * draws, elems), |(row, e)| {
            self.draws[[row / draws, row % draws, e]]
        })
    }

    /// Posterior mean of each element.
    pub fn mean(&self) -> Vec<f64> {
        let flat = self.flattened();
        match flat.mean_axis(Axis(0)) {
            Some(m) => m.to_vec(),
            None => vec![f64::NAN; flat.ncols()],
        }
    }

    /// Posterior standard deviation of each element.
    pub fn std(&self) -> Vec<f64> {
        let flat = self.flattened();
        if flat.nrows() == 0 {
            return vec![f64::NAN; flat.ncols()];
        }
        flat.std_axis(Axis(0), 0.0).to_vec()
    }
}

/// Result of sampling across all chains.
#[derive(Debug, Clone)]
pub struct Trace {
    pub num_chains: usize,
    pub num_draws: usize,
    pub variables: Vec<TraceVariable>,
    pub accept_rates: Vec<f64>,
    pub step_sizes: Vec<f64>,
    pub divergences: Vec<usize>,
}

impl Trace {
    fn from_chains(graph: &Graph, results: &[ChainResult], num_draws: usize) -> Self {
        let num_chains = results.len();
        let variables = graph
            .variables
            .iter()
            .map(|var| {
                let len = var.shape.len();
                let draws = Array3::from_shape_fn((num_chains, num_draws, len), |(c, d, e)| {
                    var.transform.apply(results[c].samples[d][var.offset + e])
                });
                TraceVariable {
                    name: var.name.clone(),
                    shape: var.shape,
                    draws,
                }
            })
            .collect();

        Self {
            num_chains,
            num_draws,
            variables,
            accept_rates: results.iter().map(|r| r.accept_rate).collect(),
            step_sizes: results.iter().map(|r| r.step_size).collect(),
            divergences: results.iter().map(|r| r.divergences).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&TraceVariable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|v| v.name.as_str())
    }

    /// Draws per chain.
    pub fn len(&self) -> usize {
        self.num_draws
    }

    pub fn is_empty(&self) -> bool {
        self.num_draws == 0
    }

    pub fn total_divergences(&self) -> usize {
        self.divergences.iter().sum()
    }
}

/// Run parallel chains on the given graph.
///
/// The graph is shared read-only across all chains. Chain `c` is seeded
/// with `config.seed + c` (wrapping), so results do not depend on thread
/// scheduling.
pub fn sample(graph: &Graph, config: &SamplerConfig) -> Result<Trace> {
    config.validate()?;
    if graph.param_count == 0 {
        return Err(Error::sampler("the model has no free parameters"));
    }

    let mut evaluator = Evaluator::new(graph);
    evaluator.compute(graph, &vec![0.0; graph.param_count]);
    if !evaluator.total_logp.is_finite() || evaluator.grad.iter().any(|g| !g.is_finite()) {
        return Err(Error::sampler(format!(
            "log-density at the initial point is not finite (logp = {})",
            evaluator.total_logp
        )));
    }

    info!(
        chains = config.num_chains,
        draws = config.num_draws,
        warmup = config.num_warmup,
        method = ?config.method,
        params = graph.param_count,
        "sampling"
    );

    let run = |chain: usize| -> ChainResult {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(chain as u64));
        match config.method {
            Method::Nuts => {
                let nuts_config = NutsConfig {
                    step_size: config.step_size,
                    max_tree_depth: config.max_tree_depth,
                    num_draws: config.num_draws,
                    num_warmup: config.num_warmup,
                    target_accept: config.target_accept,
                };
                nuts::run_chain(graph, &nuts_config, &mut rng, None)
            }
            Method::Hmc => {
                let hmc_config = HmcConfig {
                    step_size: config.step_size,
                    num_leapfrog_steps: config.num_leapfrog_steps,
                    num_draws: config.num_draws,
                    num_warmup: config.num_warmup,
                    target_accept: config.target_accept,
                };
                hmc::run_chain(graph, &hmc_config, &mut rng, None)
            }
        }
    };

    let results: Vec<ChainResult> = if config.num_threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .build()
            .map_err(|e| Error::sampler(format!("cannot start sampler threads: {e}")))?
            .install(|| (0..config.num_chains).into_par_iter().map(run).collect())
    } else {
        (0..config.num_chains).into_par_iter().map(run).collect()
    };

    for (chain, result) in results.iter().enumerate() {
        if result.samples.iter().flatten().any(|v| !v.is_finite()) {
            return Err(Error::sampler(format!("chain {chain} produced non-finite draws")));
        }
        if result.divergences > 0 {
            warn!(chain, divergences = result.divergences, "divergent transitions");
        }
    }

    let trace = Trace::from_chains(graph, &results, config.num_draws);
    info!(
        chains = trace.num_chains,
        draws = trace.num_draws,
        divergences = trace.total_divergences(),
        "sampling finished"
    );
    Ok(trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{DistributionRegistry, PriorArg, PriorArgs};

    fn two_variable_graph() -> Graph {
        let registry = DistributionRegistry::new();
        let mut g = Graph::new();
        let mut args = PriorArgs::new();
        args.insert("mu".into(), PriorArg::Value(1.0));
        registry.resolve(&mut g, "b", "Normal", Shape::Vector(2), &args).unwrap();
        let mut args = PriorArgs::new();
        args.insert("sd".into(), PriorArg::Value(1.0));
        registry.resolve(&mut g, "s", "HalfNormal", Shape::Scalar, &args).unwrap();
        g
    }

    #[test]
    fn config_accepts_pymc_style_keys() {
        let json = r#"{"samples": 250, "tune": 100, "chains": 2, "method": "hmc"}"#;
        let config = SamplerConfig::from_json(json).unwrap();
        assert_eq!(config.num_draws, 250);
        assert_eq!(config.num_warmup, 100);
        assert_eq!(config.num_chains, 2);
        assert_eq!(config.method, Method::Hmc);
        assert_eq!(config.seed, 42);
    }

    #[test]
    fn trace_has_one_array_per_variable() {
        let g = two_variable_graph();
        let config = SamplerConfig {
            num_chains: 2,
            num_draws: 200,
            num_warmup: 200,
            ..SamplerConfig::default()
        };
        let trace = sample(&g, &config).unwrap();
        assert_eq!(trace.names().collect::<Vec<_>>(), vec!["b", "s"]);
        assert_eq!(trace.get("b").unwrap().draws.dim(), (2, 200, 2));
        assert_eq!(trace.get("s").unwrap().flattened().dim(), (400, 1));
        assert!(trace.get("s").unwrap().draws.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn sampling_is_reproducible_per_seed() {
        let g = two_variable_graph();
        let config = SamplerConfig {
            num_chains: 2,
            num_draws: 50,
            num_warmup: 50,
            num_threads: 2,
            ..SamplerConfig::default()
        };
        let a = sample(&g, &config).unwrap();
        let b = sample(&g, &config).unwrap();
        assert_eq!(a.get("b").unwrap().draws, b.get("b").unwrap().draws);
    }

    #[test]
    fn largest_seed_wraps_across_chains() {
        let config = SamplerConfig {
            num_chains: 2,
            num_draws: 20,
            num_warmup: 20,
            seed: u64::MAX,
            ..SamplerConfig::default()
        };
        let trace = sample(&two_variable_graph(), &config).unwrap();
        assert_eq!(trace.num_chains, 2);

        let chain_one = SamplerConfig {
            num_chains: 1,
            seed: 0,
            ..config.clone()
        };
        let wrapped = sample(&two_variable_graph(), &chain_one).unwrap();
        let draws = &trace.get("b").unwrap().draws;
        let first_of_wrapped = &wrapped.get("b").unwrap().draws;
        assert_eq!(draws.index_axis(Axis(0), 1), first_of_wrapped.index_axis(Axis(0), 0));
    }

    #[test]
    fn empty_models_cannot_be_sampled() {
        let err = sample(&Graph::new(), &SamplerConfig::default()).unwrap_err();
        assert!(matches!(err, Error::SamplerFailure { .. }));
    }

    #[test]
    fn zero_chains_are_rejected() {
        let config = SamplerConfig {
            num_chains: 0,
            ..SamplerConfig::default()
        };
        assert!(sample(&two_variable_graph(), &config).is_err());
    }
}
