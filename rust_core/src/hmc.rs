use crate::autodiff::Evaluator;
use crate::graph::Graph;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Energy error beyond which a transition counts as divergent.
pub(crate) const MAX_DELTA_H: f64 = 1000.0;

/// Configuration for the static-trajectory HMC sampler.
#[derive(Debug, Clone)]
pub struct HmcConfig {
    /// 0 means pick one automatically before warmup.
    pub step_size: f64,
    pub num_leapfrog_steps: usize,
    pub num_draws: usize,
    pub num_warmup: usize,
    pub target_accept: f64,
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            step_size: 0.0,
            num_leapfrog_steps: 20,
            num_draws: 1000,
            num_warmup: 500,
            target_accept: 0.65,
        }
    }
}

/// Result of a single chain run. Draws are on the unconstrained scale.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub samples: Vec<Vec<f64>>,
    pub accept_rate: f64,
    pub step_size: f64,
    pub divergences: usize,
}

/// A point on the Hamiltonian trajectory: (position, momentum, gradient, log-probability).
#[derive(Debug, Clone)]
pub(crate) struct PhasePoint {
    pub q: Vec<f64>,
    pub p: Vec<f64>,
    pub grad: Vec<f64>,
    pub logp: f64,
}

impl PhasePoint {
    pub fn at(graph: &Graph, evaluator: &mut Evaluator, q: Vec<f64>) -> Self {
        evaluator.compute(graph, &q);
        Self {
            p: vec![0.0; q.len()],
            q,
            grad: evaluator.grad.clone(),
            logp: evaluator.total_logp,
        }
    }

    pub fn energy(&self, inv_mass: &[f64]) -> f64 {
        let ke: f64 = self
            .p
            .iter()
            .zip(inv_mass)
            .map(|(&pi, &im)| 0.5 * pi * pi * im)
            .sum();
        -self.logp + ke
    }

    pub fn resample_momentum(&mut self, mass_sqrt: &[f64], rng: &mut ChaCha8Rng) {
        for (pi, &m) in self.p.iter_mut().zip(mass_sqrt) {
            let z: f64 = StandardNormal.sample(rng);
            *pi = z * m;
        }
    }
}

/// Single leapfrog step (half-step momentum, full-step position, half-step momentum).
pub(crate) fn leapfrog(
    graph: &Graph,
    evaluator: &mut Evaluator,
    point: &PhasePoint,
    eps: f64,
    inv_mass: &[f64],
) -> PhasePoint {
    let p_half: Vec<f64> = point
        .p
        .iter()
        .zip(&point.grad)
        .map(|(p, g)| p + 0.5 * eps * g)
        .collect();
    let q: Vec<f64> = point
        .q
        .iter()
        .zip(&p_half)
        .zip(inv_mass)
        .map(|((q, p), m)| q + eps * m * p)
        .collect();

    evaluator.compute(graph, &q);
    let grad = evaluator.grad.clone();
    let p = p_half.iter().zip(&grad).map(|(p, g)| p + 0.5 * eps * g).collect();

    PhasePoint {
        q,
        p,
        grad,
        logp: evaluator.total_logp,
    }
}

/// Double or halve a unit step until a single leapfrog step crosses an
/// acceptance probability of 0.5 (Hoffman & Gelman 2014, Algorithm 4).
pub(crate) fn find_initial_step_size(
    graph: &Graph,
    evaluator: &mut Evaluator,
    start: &PhasePoint,
    inv_mass: &[f64],
    mass_sqrt: &[f64],
    rng: &mut ChaCha8Rng,
) -> f64 {
    let mut point = start.clone();
    point.resample_momentum(mass_sqrt, rng);
    let h0 = point.energy(inv_mass);
    let threshold = 0.5_f64.ln();

    let mut eps = 1.0;
    let mut log_ratio = h0 - leapfrog(graph, evaluator, &point, eps, inv_mass).energy(inv_mass);
    let direction = if log_ratio > threshold { 1.0 } else { -1.0 };

    for _ in 0..50 {
        if log_ratio.is_finite() {
            if direction * log_ratio <= direction * threshold {
                break;
            }
        } else if direction > 0.0 {
            eps *= 0.5;
            break;
        }
        eps *= 2.0_f64.powf(direction);
        log_ratio = h0 - leapfrog(graph, evaluator, &point, eps, inv_mass).energy(inv_mass);
    }

    eps.clamp(1e-10, 1e3)
}

/// Nesterov dual-averaging step-size adaptation (Hoffman & Gelman 2014, §3.2).
#[derive(Debug, Clone)]
pub(crate) struct DualAveraging {
    mu: f64,
    target: f64,
    h_bar: f64,
    log_eps_bar: f64,
    count: u64,
}

impl DualAveraging {
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    pub fn new(step_size: f64, target: f64) -> Self {
        Self {
            mu: (10.0 * step_size).ln(),
            target,
            h_bar: 0.0,
            log_eps_bar: step_size.ln(),
            count: 0,
        }
    }

    /// Feed one acceptance statistic; returns the next step size to try.
    pub fn update(&mut self, accept_stat: f64) -> f64 {
        self.count += 1;
        let m = self.count as f64;
        let w = 1.0 / (m + Self::T0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target - accept_stat);
        let log_eps = self.mu - (m.sqrt() / Self::GAMMA) * self.h_bar;
        let m_pow = m.powf(-Self::KAPPA);
        self.log_eps_bar = m_pow * log_eps + (1.0 - m_pow) * self.log_eps_bar;
        log_eps.exp()
    }

    /// Step size to freeze once warmup ends.
    pub fn final_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }
}

/// Run a single HMC chain with a fixed number of leapfrog steps per draw.
///
/// The graph is shared read-only; each chain brings its own RNG.
pub fn run_chain(
    graph: &Graph,
    config: &HmcConfig,
    rng: &mut ChaCha8Rng,
    init: Option<Vec<f64>>,
) -> ChainResult {
    let dim = graph.param_count;
    let total_iters = config.num_warmup + config.num_draws;
    let unit = vec![1.0; dim];

    let mut evaluator = Evaluator::new(graph);
    let mut current = PhasePoint::at(graph, &mut evaluator, init.unwrap_or_else(|| vec![0.0; dim]));
    let mut samples = Vec::with_capacity(config.num_draws);
    let mut accepted = 0u64;
    let mut divergences = 0usize;

    let mut step_size = if config.step_size > 0.0 {
        config.step_size
    } else {
        find_initial_step_size(graph, &mut evaluator, &current, &unit, &unit, rng)
    };
    let mut adaptation = DualAveraging::new(step_size, config.target_accept);

    for iter in 0..total_iters {
        let is_warmup = iter < config.num_warmup;

        current.resample_momentum(&unit, rng);
        let h_current = current.energy(&unit);

        let mut proposal = current.clone();
        for _ in 0..config.num_leapfrog_steps {
            proposal = leapfrog(graph, &mut evaluator, &proposal, step_size, &unit);
        }

        let log_accept_ratio = h_current - proposal.energy(&unit);
        let diverging = !log_accept_ratio.is_finite() || -log_accept_ratio > MAX_DELTA_H;
        let accept_prob = if log_accept_ratio.is_finite() {
            log_accept_ratio.min(0.0).exp()
        } else {
            0.0
        };

        if diverging {
            divergences += 1;
        } else if rng.gen::<f64>().ln() < log_accept_ratio {
            current = proposal;
            accepted += 1;
        }

        if is_warmup {
            step_size = adaptation.update(accept_prob);
            if iter + 1 == config.num_warmup {
                step_size = adaptation.final_step_size();
            }
        } else {
            samples.push(current.q.clone());
        }
    }

    ChainResult {
        samples,
        accept_rate: if total_iters > 0 {
            accepted as f64 / total_iters as f64
        } else {
            0.0
        },
        step_size,
        divergences,
    }
}
