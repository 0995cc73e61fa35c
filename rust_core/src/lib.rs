pub mod autodiff;
pub mod backend;
pub mod distributions;
pub mod error;
pub mod graph;
pub mod hmc;
pub mod model;
pub mod nuts;
pub mod priors;
pub mod sampler;

pub use backend::{Backend, BuildPhase};
pub use distributions::{Dist, DistRef, DistributionRegistry, Family, PriorArg, PriorArgs};
pub use error::{Error, Result};
pub use model::{GroupingFactor, Model, PriorSpec, Response, SigmaSpec, Term};
pub use priors::DefaultPriors;
pub use sampler::{Method, SamplerConfig, Trace, TraceVariable};

// Future: block-diagonal mass matrices for large hierarchical models, and
// populating `Backend::shared_params` for priors reused across terms.
