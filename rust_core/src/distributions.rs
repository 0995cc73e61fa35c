//! Distribution families and the factory that turns a family reference plus
//! keyword arguments into a registered random variable.
//!
//! Families are looked up in a [`DistributionRegistry`] populated at
//! construction time. Each family declares its parameters, the support of
//! the variable and which parameter acts as its scale, so argument problems
//! are reported before anything is added to the graph.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::f64::consts::{LN_2, PI, TAU};
use std::fmt;

use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, ParamTransform, RandomVariable, Shape};

/// Value of a distribution argument: a number, or a node already built in
/// the same scope (for example a group-level standard deviation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriorArg {
    Value(f64),
    Node(NodeId),
}

impl From<f64> for PriorArg {
    fn from(v: f64) -> Self {
        PriorArg::Value(v)
    }
}

impl From<NodeId> for PriorArg {
    fn from(id: NodeId) -> Self {
        PriorArg::Node(id)
    }
}

impl<'de> Deserialize<'de> for PriorArg {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        f64::deserialize(deserializer).map(PriorArg::Value)
    }
}

pub type PriorArgs = BTreeMap<String, PriorArg>;

/// Support of a random variable; decides its unconstraining transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Real,
    Positive,
    Unit,
    /// Between the family's constant `lower` and `upper` arguments.
    Interval,
}

/// Admissible values of a constant argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSupport {
    Real,
    Positive,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamDef {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub default: Option<f64>,
    pub support: ParamSupport,
}

impl ParamDef {
    fn matches(&self, key: &str) -> bool {
        self.name == key || self.aliases.contains(&key)
    }
}

/// Builds the element-wise log-density of `x` given the bound parameter
/// nodes, in the order of `Family::params`.
pub type LogpBuilder = fn(&mut Graph, NodeId, &[NodeId]) -> Result<NodeId>;

#[derive(Clone, Copy)]
pub struct Family {
    pub name: &'static str,
    pub params: &'static [ParamDef],
    /// Parameter that receives the linear predictor when used as a likelihood.
    pub location: Option<&'static str>,
    /// Parameter that receives an injected group-level standard deviation.
    pub scale: Option<&'static str>,
    pub support: Support,
    pub logp: LogpBuilder,
}

impl fmt::Debug for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Family")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("location", &self.location)
            .field("scale", &self.scale)
            .field("support", &self.support)
            .finish_non_exhaustive()
    }
}

impl Family {
    fn param(&self, key: &str) -> Option<&'static ParamDef> {
        self.params.iter().find(|p| p.matches(key))
    }

    /// Remove every spelling of the scale parameter from `args` and bind
    /// `value` under its canonical name.
    pub fn inject_scale(
        &self,
        label: &str,
        args: &PriorArgs,
        value: PriorArg,
    ) -> Result<PriorArgs> {
        self.inject(label, args, self.scale, "scale", value)
    }

    /// Same as [`Family::inject_scale`] for the location parameter.
    pub fn inject_location(
        &self,
        label: &str,
        args: &PriorArgs,
        value: PriorArg,
    ) -> Result<PriorArgs> {
        self.inject(label, args, self.location, "location", value)
    }

    fn inject(
        &self,
        label: &str,
        args: &PriorArgs,
        role: Option<&'static str>,
        role_name: &str,
        value: PriorArg,
    ) -> Result<PriorArgs> {
        let def = role.and_then(|r| self.param(r)).ok_or_else(|| {
            Error::malformed(
                label,
                format!("family '{}' has no {role_name} parameter", self.name),
            )
        })?;
        let mut out: PriorArgs = args
            .iter()
            .filter(|(k, _)| !def.matches(k))
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        out.insert(def.name.to_string(), value);
        Ok(out)
    }
}

/// Reference to a family: either its registered name or the family itself.
#[derive(Debug, Clone, Copy)]
pub enum DistRef<'a> {
    Name(&'a str),
    Family(&'a Family),
}

impl<'a> From<&'a str> for DistRef<'a> {
    fn from(name: &'a str) -> Self {
        DistRef::Name(name)
    }
}

impl<'a> From<&'a String> for DistRef<'a> {
    fn from(name: &'a String) -> Self {
        DistRef::Name(name)
    }
}

impl<'a> From<&'a Family> for DistRef<'a> {
    fn from(family: &'a Family) -> Self {
        DistRef::Family(family)
    }
}

/// A distribution built inside a model scope.
#[derive(Debug, Clone)]
pub struct Dist {
    pub label: String,
    pub family: &'static str,
    /// Constrained value node (free variables) or data node (observed).
    pub node: NodeId,
    pub shape: Shape,
    /// Bound arguments under their canonical names, defaults included.
    pub params: PriorArgs,
    pub observed: bool,
}

impl Dist {
    pub fn param(&self, name: &str) -> Option<PriorArg> {
        self.params.get(name).copied()
    }
}

/// Name → family table consulted by every construction call.
#[derive(Debug, Clone)]
pub struct DistributionRegistry {
    families: HashMap<&'static str, Family>,
}

impl Default for DistributionRegistry {
    fn default() -> Self {
        let families = BUILTIN_FAMILIES.iter().map(|f| (f.name, **f)).collect();
        Self { families }
    }
}

impl DistributionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a family after checking its declaration is self-consistent.
    pub fn register(&mut self, family: Family) -> Result<()> {
        let invalid = |reason: String| Error::InvalidFamily {
            name: family.name.to_string(),
            reason,
        };
        if family.name.is_empty() {
            return Err(invalid("family name is empty".into()));
        }
        if self.families.contains_key(family.name) {
            return Err(invalid("a family with this name is already registered".into()));
        }
        let mut seen = HashSet::new();
        let spellings = family
            .params
            .iter()
            .flat_map(|p| std::iter::once(&p.name).chain(p.aliases));
        for spelling in spellings {
            if !seen.insert(*spelling) {
                return Err(invalid(format!("parameter name '{spelling}' is declared twice")));
            }
        }
        for role in [family.location, family.scale].into_iter().flatten() {
            if family.param(role).is_none() {
                return Err(invalid(format!("parameter '{role}' is not declared")));
            }
        }
        if family.support == Support::Interval
            && (family.param("lower").is_none() || family.param("upper").is_none())
        {
            return Err(invalid("interval support needs 'lower' and 'upper' parameters".into()));
        }
        self.families.insert(family.name, family);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Family> {
        self.families.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.families.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn lookup(&self, dist: DistRef<'_>) -> Result<Family> {
        match dist {
            DistRef::Family(family) => Ok(*family),
            DistRef::Name(name) => {
                self.get(name).copied().ok_or_else(|| Error::UnknownDistribution {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Build a free random variable named `label` and register it in `graph`.
    ///
    /// The returned handle's `node` holds the constrained value and can be
    /// used as another distribution's argument or in arithmetic with data.
    pub fn resolve<'a>(
        &self,
        graph: &mut Graph,
        label: &str,
        dist: impl Into<DistRef<'a>>,
        shape: Shape,
        args: &PriorArgs,
    ) -> Result<Dist> {
        let family = self.lookup(dist.into())?;
        graph.check_name(label)?;
        let (bound, nodes) = bind_args(graph, &family, label, shape, args)?;
        let transform = transform_for(&family, label, &bound)?;

        let offset = graph.param_count;
        let raw = graph.add_param(shape);
        let value = constrain(graph, raw, transform)?;
        let lp = (family.logp)(graph, value, &nodes)?;
        graph.add_logp_term(lp);
        graph.add_variable(RandomVariable {
            name: label.to_string(),
            family: family.name.to_string(),
            raw,
            value,
            offset,
            shape,
            transform,
        })?;

        debug!(label, family = family.name, %shape, "registered distribution");
        Ok(Dist {
            label: label.to_string(),
            family: family.name,
            node: value,
            shape,
            params: bound,
            observed: false,
        })
    }

    /// Register `observed` as data distributed according to `dist`.
    pub fn observe<'a>(
        &self,
        graph: &mut Graph,
        label: &str,
        dist: impl Into<DistRef<'a>>,
        args: &PriorArgs,
        observed: Vec<f64>,
    ) -> Result<Dist> {
        let family = self.lookup(dist.into())?;
        graph.check_name(label)?;
        let shape = Shape::Vector(observed.len());
        let (bound, nodes) = bind_args(graph, &family, label, shape, args)?;
        let data = graph.add_data(observed);
        let lp = (family.logp)(graph, data, &nodes)?;
        graph.add_logp_term(lp);
        graph.register_name(label, data)?;

        debug!(label, family = family.name, %shape, "registered observed distribution");
        Ok(Dist {
            label: label.to_string(),
            family: family.name,
            node: data,
            shape,
            params: bound,
            observed: true,
        })
    }
}

/// Match keyword arguments to the family's parameters, fill defaults and
/// validate constants. Returns the canonical argument map and the parameter
/// nodes in declaration order.
fn bind_args(
    graph: &mut Graph,
    family: &Family,
    label: &str,
    shape: Shape,
    args: &PriorArgs,
) -> Result<(PriorArgs, Vec<NodeId>)> {
    let mut bound: PriorArgs = BTreeMap::new();
    for (key, arg) in args {
        let def = family.param(key).ok_or_else(|| {
            Error::malformed(label, format!("unknown argument '{key}' for {}", family.name))
        })?;
        if bound.insert(def.name.to_string(), *arg).is_some() {
            let reason = format!("argument '{}' given more than once", def.name);
            return Err(Error::malformed(label, reason));
        }
    }

    let mut nodes = Vec::with_capacity(family.params.len());
    for def in family.params {
        let arg = match bound.get(def.name).copied() {
            Some(arg) => arg,
            None => {
                let default = def.default.ok_or_else(|| {
                    let reason =
                        format!("missing required argument '{}' for {}", def.name, family.name);
                    Error::malformed(label, reason)
                })?;
                bound.insert(def.name.to_string(), PriorArg::Value(default));
                PriorArg::Value(default)
            }
        };
        let node = match arg {
            PriorArg::Value(v) => {
                let admissible = match def.support {
                    ParamSupport::Real => v.is_finite(),
                    ParamSupport::Positive => v.is_finite() && v > 0.0,
                };
                if !admissible {
                    return Err(Error::malformed(
                        label,
                        format!("argument '{}' = {v} is outside its support", def.name),
                    ));
                }
                graph.add_constant(v)
            }
            PriorArg::Node(id) => {
                let found = graph.try_shape(id).ok_or_else(|| {
                    let reason =
                        format!("argument '{}' refers to a node outside this scope", def.name);
                    Error::malformed(label, reason)
                })?;
                if found.broadcast(shape) != Some(shape) {
                    return Err(Error::malformed(
                        label,
                        format!(
                            "argument '{}' has shape {found}, which does not fit {shape}",
                            def.name
                        ),
                    ));
                }
                id
            }
        };
        nodes.push(node);
    }
    Ok((bound, nodes))
}

fn transform_for(family: &Family, label: &str, bound: &PriorArgs) -> Result<ParamTransform> {
    Ok(match family.support {
        Support::Real => ParamTransform::Identity,
        Support::Positive => ParamTransform::Exp,
        Support::Unit => ParamTransform::Sigmoid,
        Support::Interval => {
            let constant = |name: &str| match bound.get(name) {
                Some(PriorArg::Value(v)) => Ok(*v),
                _ => Err(Error::malformed(label, format!("'{name}' must be a constant bound"))),
            };
            let (lower, upper) = (constant("lower")?, constant("upper")?);
            if lower >= upper {
                let reason = format!("lower ({lower}) must be below upper ({upper})");
                return Err(Error::malformed(label, reason));
            }
            ParamTransform::BoundedSigmoid { lower, upper }
        }
    })
}

/// Map `raw` onto the variable's support and add the log-Jacobian of the
/// transform to the model density. Returns the constrained value node.
fn constrain(graph: &mut Graph, raw: NodeId, transform: ParamTransform) -> Result<NodeId> {
    match transform {
        ParamTransform::Identity => Ok(raw),
        ParamTransform::Exp => {
            let x = graph.exp(raw);
            // log|dx/draw| = raw
            graph.add_logp_term(raw);
            Ok(x)
        }
        ParamTransform::Sigmoid => {
            let x = graph.sigmoid(raw);
            let jac = logistic_jacobian(graph, raw)?;
            graph.add_logp_term(jac);
            Ok(x)
        }
        ParamTransform::BoundedSigmoid { lower, upper } => {
            let sig = graph.sigmoid(raw);
            let range = graph.add_constant(upper - lower);
            let lower_node = graph.add_constant(lower);
            let scaled = graph.mul(range, sig)?;
            let x = graph.add(lower_node, scaled)?;
            let jac = logistic_jacobian(graph, raw)?;
            let log_range = graph.add_constant((upper - lower).ln());
            let jac = graph.add(jac, log_range)?;
            graph.add_logp_term(jac);
            Ok(x)
        }
    }
}

/// log σ(r) + log(1 − σ(r)) = log σ(r) + log σ(−r)
fn logistic_jacobian(graph: &mut Graph, raw: NodeId) -> Result<NodeId> {
    let a = graph.log_sigmoid(raw);
    let neg = graph.neg(raw);
    let b = graph.log_sigmoid(neg);
    graph.add(a, b)
}

// ── Log-density builders ──

/// (x - loc) / scale
fn standardize(g: &mut Graph, x: NodeId, loc: Option<NodeId>, scale: NodeId) -> Result<NodeId> {
    let centered = match loc {
        Some(loc) => g.sub(x, loc)?,
        None => x,
    };
    g.div(centered, scale)
}

/// c - log(scale) + k * f(z), the common location-scale layout.
fn location_scale(g: &mut Graph, c: f64, scale: NodeId, k: f64, fz: NodeId) -> Result<NodeId> {
    let k = g.add_constant(k);
    let kernel = g.mul(k, fz)?;
    let log_scale = g.log(scale);
    let a = g.sub(kernel, log_scale)?;
    let c = g.add_constant(c);
    g.add(a, c)
}

fn normal_logp(g: &mut Graph, x: NodeId, p: &[NodeId]) -> Result<NodeId> {
    let z = standardize(g, x, Some(p[0]), p[1])?;
    let sq = g.square(z);
    location_scale(g, -0.5 * TAU.ln(), p[1], -0.5, sq)
}

fn half_normal_logp(g: &mut Graph, x: NodeId, p: &[NodeId]) -> Result<NodeId> {
    let z = standardize(g, x, None, p[0])?;
    let sq = g.square(z);
    location_scale(g, 0.5 * (2.0 / PI).ln(), p[0], -0.5, sq)
}

fn cauchy_logp(g: &mut Graph, x: NodeId, p: &[NodeId]) -> Result<NodeId> {
    let z = standardize(g, x, Some(p[0]), p[1])?;
    let sq = g.square(z);
    let tail = g.log1p(sq);
    location_scale(g, -PI.ln(), p[1], -1.0, tail)
}

fn half_cauchy_logp(g: &mut Graph, x: NodeId, p: &[NodeId]) -> Result<NodeId> {
    let z = standardize(g, x, None, p[0])?;
    let sq = g.square(z);
    let tail = g.log1p(sq);
    location_scale(g, (2.0 / PI).ln(), p[0], -1.0, tail)
}

fn student_t_logp(g: &mut Graph, x: NodeId, p: &[NodeId]) -> Result<NodeId> {
    let (nu, mu, sd) = (p[0], p[1], p[2]);
    let half = g.add_constant(0.5);
    let one = g.add_constant(1.0);

    let nu_plus_one = g.add(nu, one)?;
    let half_nu_plus_one = g.mul(half, nu_plus_one)?;
    let half_nu = g.mul(half, nu)?;
    let lg_a = g.ln_gamma(half_nu_plus_one);
    let lg_b = g.ln_gamma(half_nu);
    let pi = g.add_constant(PI);
    let nu_pi = g.mul(nu, pi)?;
    let log_nu_pi = g.log(nu_pi);
    let half_log_nu_pi = g.mul(half, log_nu_pi)?;
    let norm = g.sub(lg_a, lg_b)?;
    let norm = g.sub(norm, half_log_nu_pi)?;

    let z = standardize(g, x, Some(mu), sd)?;
    let sq = g.square(z);
    let sq_over_nu = g.div(sq, nu)?;
    let tail = g.log1p(sq_over_nu);
    let tail = g.mul(half_nu_plus_one, tail)?;

    let log_sd = g.log(sd);
    let a = g.sub(norm, log_sd)?;
    g.sub(a, tail)
}

fn laplace_logp(g: &mut Graph, x: NodeId, p: &[NodeId]) -> Result<NodeId> {
    let z = standardize(g, x, Some(p[0]), p[1])?;
    let abs = g.abs(z);
    location_scale(g, -LN_2, p[1], -1.0, abs)
}

fn exponential_logp(g: &mut Graph, x: NodeId, p: &[NodeId]) -> Result<NodeId> {
    let lam = p[0];
    let log_lam = g.log(lam);
    let rate = g.mul(lam, x)?;
    g.sub(log_lam, rate)
}

fn gamma_logp(g: &mut Graph, x: NodeId, p: &[NodeId]) -> Result<NodeId> {
    let (alpha, beta) = (p[0], p[1]);
    let one = g.add_constant(1.0);
    let log_beta = g.log(beta);
    let a = g.mul(alpha, log_beta)?;
    let lg = g.ln_gamma(alpha);
    let norm = g.sub(a, lg)?;
    let alpha_m1 = g.sub(alpha, one)?;
    let log_x = g.log(x);
    let shape_term = g.mul(alpha_m1, log_x)?;
    let rate_term = g.mul(beta, x)?;
    let b = g.add(norm, shape_term)?;
    g.sub(b, rate_term)
}

fn beta_logp(g: &mut Graph, x: NodeId, p: &[NodeId]) -> Result<NodeId> {
    let (alpha, beta) = (p[0], p[1]);
    let one = g.add_constant(1.0);
    let ab = g.add(alpha, beta)?;
    let lg_ab = g.ln_gamma(ab);
    let lg_a = g.ln_gamma(alpha);
    let lg_b = g.ln_gamma(beta);
    let norm = g.sub(lg_ab, lg_a)?;
    let norm = g.sub(norm, lg_b)?;

    let alpha_m1 = g.sub(alpha, one)?;
    let beta_m1 = g.sub(beta, one)?;
    let log_x = g.log(x);
    let neg_x = g.neg(x);
    let log_1mx = g.log1p(neg_x);
    let t1 = g.mul(alpha_m1, log_x)?;
    let t2 = g.mul(beta_m1, log_1mx)?;
    let a = g.add(norm, t1)?;
    g.add(a, t2)
}

fn uniform_logp(g: &mut Graph, x: NodeId, p: &[NodeId]) -> Result<NodeId> {
    let range = g.sub(p[1], p[0])?;
    let log_range = g.log(range);
    let density = g.neg(log_range);
    let n = g.shape(x).len();
    let count = g.add_constant(n as f64);
    g.mul(count, density)
}

// ── Built-in families (PyMC3 parameterisation) ──

const fn real(name: &'static str, default: Option<f64>) -> ParamDef {
    ParamDef {
        name,
        aliases: &[],
        default,
        support: ParamSupport::Real,
    }
}

const fn positive(name: &'static str, default: Option<f64>) -> ParamDef {
    ParamDef {
        name,
        aliases: &[],
        default,
        support: ParamSupport::Positive,
    }
}

const SD: ParamDef = ParamDef {
    name: "sd",
    aliases: &["sigma"],
    default: Some(1.0),
    support: ParamSupport::Positive,
};

pub static NORMAL: Family = Family {
    name: "Normal",
    params: &[real("mu", Some(0.0)), SD],
    location: Some("mu"),
    scale: Some("sd"),
    support: Support::Real,
    logp: normal_logp,
};

pub static HALF_NORMAL: Family = Family {
    name: "HalfNormal",
    params: &[SD],
    location: None,
    scale: Some("sd"),
    support: Support::Positive,
    logp: half_normal_logp,
};

pub static CAUCHY: Family = Family {
    name: "Cauchy",
    params: &[real("alpha", None), positive("beta", None)],
    location: Some("alpha"),
    scale: Some("beta"),
    support: Support::Real,
    logp: cauchy_logp,
};

pub static HALF_CAUCHY: Family = Family {
    name: "HalfCauchy",
    params: &[positive("beta", None)],
    location: None,
    scale: Some("beta"),
    support: Support::Positive,
    logp: half_cauchy_logp,
};

pub static STUDENT_T: Family = Family {
    name: "StudentT",
    params: &[positive("nu", None), real("mu", Some(0.0)), SD],
    location: Some("mu"),
    scale: Some("sd"),
    support: Support::Real,
    logp: student_t_logp,
};

pub static LAPLACE: Family = Family {
    name: "Laplace",
    params: &[real("mu", None), positive("b", None)],
    location: Some("mu"),
    scale: Some("b"),
    support: Support::Real,
    logp: laplace_logp,
};

pub static EXPONENTIAL: Family = Family {
    name: "Exponential",
    params: &[positive("lam", None)],
    location: None,
    scale: None,
    support: Support::Positive,
    logp: exponential_logp,
};

pub static GAMMA: Family = Family {
    name: "Gamma",
    params: &[positive("alpha", None), positive("beta", None)],
    location: None,
    scale: None,
    support: Support::Positive,
    logp: gamma_logp,
};

pub static BETA: Family = Family {
    name: "Beta",
    params: &[positive("alpha", None), positive("beta", None)],
    location: None,
    scale: None,
    support: Support::Unit,
    logp: beta_logp,
};

pub static UNIFORM: Family = Family {
    name: "Uniform",
    params: &[real("lower", Some(0.0)), real("upper", Some(1.0))],
    location: None,
    scale: None,
    support: Support::Interval,
    logp: uniform_logp,
};

static BUILTIN_FAMILIES: [&Family; 10] = [
    &NORMAL,
    &HALF_NORMAL,
    &CAUCHY,
    &HALF_CAUCHY,
    &STUDENT_T,
    &LAPLACE,
    &EXPONENTIAL,
    &GAMMA,
    &BETA,
    &UNIFORM,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{eval_logp, grad_logp};

    fn args(pairs: &[(&str, f64)]) -> PriorArgs {
        pairs.iter().map(|(k, v)| (k.to_string(), PriorArg::Value(*v))).collect()
    }

    #[test]
    fn builtin_families_pass_registration_checks() {
        let mut fresh = DistributionRegistry {
            families: HashMap::new(),
        };
        for family in BUILTIN_FAMILIES {
            fresh.register(*family).unwrap();
        }
        assert_eq!(fresh.names().len(), BUILTIN_FAMILIES.len());
        assert_eq!(DistributionRegistry::new().names(), fresh.names());
    }

    #[test]
    fn unknown_family_name_is_rejected() {
        let registry = DistributionRegistry::new();
        let mut g = Graph::new();
        let err = registry
            .resolve(&mut g, "b_x", "NotARealDistribution", Shape::Scalar, &PriorArgs::new())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownDistribution { name } if name == "NotARealDistribution"
        ));
        assert!(g.nodes.is_empty());
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let registry = DistributionRegistry::new();
        let mut g = Graph::new();
        registry.resolve(&mut g, "a", "Normal", Shape::Scalar, &PriorArgs::new()).unwrap();
        let err = registry
            .resolve(&mut g, "a", "Normal", Shape::Scalar, &PriorArgs::new())
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateLabel { .. }));
    }

    #[test]
    fn argument_problems_are_malformed_priors() {
        let registry = DistributionRegistry::new();
        let mut g = Graph::new();
        let cases = [
            ("HalfCauchy", args(&[])),
            ("Normal", args(&[("scale", 1.0)])),
            ("Normal", args(&[("sd", 1.0), ("sigma", 2.0)])),
            ("Normal", args(&[("sd", -1.0)])),
            ("Uniform", args(&[("lower", 2.0), ("upper", 1.0)])),
        ];
        for (i, (family, a)) in cases.iter().enumerate() {
            let err = registry
                .resolve(&mut g, &format!("v{i}"), *family, Shape::Scalar, a)
                .unwrap_err();
            assert!(matches!(err, Error::MalformedPriorSpec { .. }), "case {i}: {err}");
        }
    }

    #[test]
    fn defaults_and_aliases_are_bound_canonically() {
        let registry = DistributionRegistry::new();
        let mut g = Graph::new();
        let d = registry
            .resolve(&mut g, "b", "Normal", Shape::Vector(3), &args(&[("sigma", 5.0)]))
            .unwrap();
        assert_eq!(d.param("mu"), Some(PriorArg::Value(0.0)));
        assert_eq!(d.param("sd"), Some(PriorArg::Value(5.0)));
        assert_eq!(g.param_count, 3);
    }

    #[test]
    fn normal_density_matches_closed_form() {
        let registry = DistributionRegistry::new();
        let mut g = Graph::new();
        registry
            .resolve(&mut g, "x", "Normal", Shape::Scalar, &args(&[("mu", 1.0), ("sd", 2.0)]))
            .unwrap();
        let x: f64 = 0.3;
        let expected = -0.5 * ((x - 1.0) / 2.0).powi(2) - 2.0_f64.ln() - 0.5 * TAU.ln();
        assert!((eval_logp(&g, &[x]) - expected).abs() < 1e-12);
    }

    #[test]
    fn half_cauchy_includes_log_jacobian() {
        let registry = DistributionRegistry::new();
        let mut g = Graph::new();
        let d = registry
            .resolve(&mut g, "s", "HalfCauchy", Shape::Scalar, &args(&[("beta", 10.0)]))
            .unwrap();
        assert_eq!(g.variable("s").unwrap().transform, ParamTransform::Exp);
        assert_eq!(d.family, "HalfCauchy");

        let raw: f64 = 0.7;
        let x = raw.exp();
        let expected = (2.0 / PI).ln() - 10.0_f64.ln() - (x / 10.0).powi(2).ln_1p() + raw;
        assert!((eval_logp(&g, &[raw]) - expected).abs() < 1e-12);
    }

    #[test]
    fn node_arguments_feed_gradients() {
        let registry = DistributionRegistry::new();
        let mut g = Graph::new();
        let sigma = registry
            .resolve(&mut g, "sigma_g", "HalfNormal", Shape::Scalar, &args(&[("sd", 1.0)]))
            .unwrap();
        let a = NORMAL.inject_scale("u_g", &PriorArgs::new(), PriorArg::Node(sigma.node)).unwrap();
        registry.resolve(&mut g, "u_g", &NORMAL, Shape::Vector(2), &a).unwrap();

        let params = [0.2, 0.5, -0.4];
        let (_, grad) = grad_logp(&g, &params);
        let eps = 1e-6;
        let mut plus = params;
        let mut minus = params;
        plus[0] += eps;
        minus[0] -= eps;
        let numerical = (eval_logp(&g, &plus) - eval_logp(&g, &minus)) / (2.0 * eps);
        assert!((grad[0] - numerical).abs() < 1e-5);
    }

    #[test]
    fn scale_injection_replaces_aliases() {
        let a = args(&[("mu", 0.0), ("sigma", 3.0)]);
        let out = NORMAL.inject_scale("u", &a, PriorArg::Value(9.0)).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.get("sd"), Some(&PriorArg::Value(9.0)));
        assert!(GAMMA.inject_scale("u", &a, PriorArg::Value(9.0)).is_err());
    }

    #[test]
    fn densities_are_finite_inside_support() {
        let registry = DistributionRegistry::new();
        let cases: [(&str, PriorArgs); 6] = [
            ("StudentT", args(&[("nu", 3.0)])),
            ("Laplace", args(&[("mu", 0.0), ("b", 1.0)])),
            ("Exponential", args(&[("lam", 2.0)])),
            ("Gamma", args(&[("alpha", 2.0), ("beta", 1.0)])),
            ("Beta", args(&[("alpha", 2.0), ("beta", 3.0)])),
            ("Uniform", args(&[("lower", -1.0), ("upper", 4.0)])),
        ];
        for (family, a) in cases {
            let mut g = Graph::new();
            registry.resolve(&mut g, "x", family, Shape::Vector(2), &a).unwrap();
            let (lp, grad) = grad_logp(&g, &[0.3, -0.8]);
            assert!(lp.is_finite(), "{family}");
            assert!(grad.iter().all(|v| v.is_finite()), "{family}");
        }
    }
}
