//! No-U-Turn sampling (Hoffman & Gelman 2014) with multinomial selection
//! of the next state along the trajectory (Betancourt 2017).
//!
//! The trajectory doubles in a random direction until either end starts to
//! turn back, a leaf's energy error exceeds `MAX_DELTA_H`, or
//! `max_tree_depth` doublings have been made.

use crate::autodiff::Evaluator;
use crate::graph::Graph;
use crate::hmc::{self, ChainResult, DualAveraging, PhasePoint, MAX_DELTA_H};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Settings for one NUTS chain.
#[derive(Debug, Clone)]
pub struct NutsConfig {
    /// 0 means pick one automatically before warmup.
    pub step_size: f64,
    pub max_tree_depth: usize,
    pub num_draws: usize,
    pub num_warmup: usize,
    pub target_accept: f64,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            step_size: 0.0,
            max_tree_depth: 10,
            num_draws: 1000,
            num_warmup: 500,
            target_accept: 0.80,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeStatus {
    Open,
    Turned,
    Diverged,
}

/// A contiguous run of leapfrog states, summarised by its end points and
/// the state drawn from it in proportion to exp(H0 - H).
struct Subtree {
    left: PhasePoint,
    right: PhasePoint,
    pick: PhasePoint,
    log_weight: f64,
    /// Sum over leaves of min(1, exp(H0 - H)).
    accept_sum: f64,
    leaves: usize,
    status: TreeStatus,
}

/// Outcome of one NUTS iteration.
struct Transition {
    next: PhasePoint,
    diverging: bool,
    /// Mean Metropolis acceptance over every leaf visited.
    accept_stat: f64,
}

/// Leapfrog integrator bound to one graph and one diagonal mass matrix.
struct Integrator<'g> {
    graph: &'g Graph,
    evaluator: Evaluator,
    inv_mass: Vec<f64>,
    mass_sqrt: Vec<f64>,
}

impl<'g> Integrator<'g> {
    fn new(graph: &'g Graph) -> Self {
        let dim = graph.param_count;
        Self {
            graph,
            evaluator: Evaluator::new(graph),
            inv_mass: vec![1.0; dim],
            mass_sqrt: vec![1.0; dim],
        }
    }

    fn point(&mut self, q: Vec<f64>) -> PhasePoint {
        PhasePoint::at(self.graph, &mut self.evaluator, q)
    }

    fn step(&mut self, point: &PhasePoint, eps: f64) -> PhasePoint {
        hmc::leapfrog(self.graph, &mut self.evaluator, point, eps, &self.inv_mass)
    }

    fn initial_step_size(&mut self, start: &PhasePoint, rng: &mut ChaCha8Rng) -> f64 {
        hmc::find_initial_step_size(
            self.graph,
            &mut self.evaluator,
            start,
            &self.inv_mass,
            &self.mass_sqrt,
            rng,
        )
    }

    /// Set the diagonal mass matrix from warmup variances, shrunk toward
    /// 1e-3 the way Stan regularises its windowed estimate.
    fn adapt_mass(&mut self, variances: &[f64], n: usize) {
        let n = n as f64;
        let shrink = n / (n + 5.0);
        let metric = self.inv_mass.iter_mut().zip(self.mass_sqrt.iter_mut());
        for ((inv_mass, mass_sqrt), &var) in metric.zip(variances) {
            let regularized = shrink * var + 1e-3 * (1.0 - shrink);
            if regularized.is_finite() && regularized > 1e-8 {
                *inv_mass = regularized;
                *mass_sqrt = regularized.sqrt().recip();
            }
        }
    }

    /// True when the momentum at either end points back toward the other
    /// end under the current metric.
    fn turned(&self, left: &PhasePoint, right: &PhasePoint) -> bool {
        let (mut toward_left, mut toward_right) = (0.0f64, 0.0f64);
        for (((ql, qr), (pl, pr)), m) in left
            .q
            .iter()
            .zip(&right.q)
            .zip(left.p.iter().zip(&right.p))
            .zip(&self.inv_mass)
        {
            let span = qr - ql;
            toward_left += span * m * pl;
            toward_right += span * m * pr;
        }
        toward_left < 0.0 || toward_right < 0.0
    }

    /// Double the trajectory in random directions until it turns, diverges
    /// or reaches `max_depth` doublings, and return the selected state.
    fn transition(
        &mut self,
        start: &PhasePoint,
        eps: f64,
        max_depth: usize,
        rng: &mut ChaCha8Rng,
    ) -> Transition {
        let h0 = start.energy(&self.inv_mass);
        let mut tree = Subtree {
            left: start.clone(),
            right: start.clone(),
            pick: start.clone(),
            log_weight: 0.0,
            accept_sum: 0.0,
            leaves: 0,
            status: TreeStatus::Open,
        };

        for depth in 0..max_depth {
            let forward = rng.gen::<bool>();
            let extension = if forward {
                self.build(&tree.right, eps, h0, depth, rng)
            } else {
                self.build(&tree.left, -eps, h0, depth, rng)
            };
            tree.accept_sum += extension.accept_sum;
            tree.leaves += extension.leaves;
            if extension.status != TreeStatus::Open {
                tree.status = extension.status;
                break;
            }

            // The new half is favoured over the old one (biased progressive sampling).
            if rng.gen::<f64>() < (extension.log_weight - tree.log_weight).min(0.0).exp() {
                tree.pick = extension.pick;
            }
            tree.log_weight = log_sum_exp(tree.log_weight, extension.log_weight);
            if forward {
                tree.right = extension.right;
            } else {
                tree.left = extension.left;
            }
            if self.turned(&tree.left, &tree.right) {
                break;
            }
        }

        Transition {
            diverging: tree.status == TreeStatus::Diverged,
            accept_stat: if tree.leaves == 0 { 0.0 } else { tree.accept_sum / tree.leaves as f64 },
            next: tree.pick,
        }
    }

    /// Balanced subtree of 2^depth leapfrog steps starting after `from`.
    fn build(
        &mut self,
        from: &PhasePoint,
        eps: f64,
        h0: f64,
        depth: usize,
        rng: &mut ChaCha8Rng,
    ) -> Subtree {
        if depth == 0 {
            let leaf = self.step(from, eps);
            let error = leaf.energy(&self.inv_mass) - h0;
            let status = if error.is_finite() && error <= MAX_DELTA_H {
                TreeStatus::Open
            } else {
                TreeStatus::Diverged
            };
            let log_weight = if error.is_finite() { -error } else { f64::NEG_INFINITY };
            return Subtree {
                left: leaf.clone(),
                right: leaf.clone(),
                pick: leaf,
                log_weight,
                accept_sum: log_weight.min(0.0).exp(),
                leaves: 1,
                status,
            };
        }

        let first = self.build(from, eps, h0, depth - 1, rng);
        if first.status != TreeStatus::Open {
            return first;
        }
        let edge = if eps > 0.0 { &first.right } else { &first.left };
        let second = self.build(edge, eps, h0, depth - 1, rng);
        let accept_sum = first.accept_sum + second.accept_sum;
        let leaves = first.leaves + second.leaves;
        if second.status != TreeStatus::Open {
            return Subtree {
                accept_sum,
                leaves,
                status: second.status,
                ..first
            };
        }

        let log_weight = log_sum_exp(first.log_weight, second.log_weight);
        let pick = if rng.gen::<f64>() < (second.log_weight - log_weight).exp() {
            second.pick
        } else {
            first.pick
        };
        let (left, right) = if eps > 0.0 {
            (first.left, second.right)
        } else {
            (second.left, first.right)
        };
        let status = if self.turned(&left, &right) {
            TreeStatus::Turned
        } else {
            TreeStatus::Open
        };
        Subtree {
            left,
            right,
            pick,
            log_weight,
            accept_sum,
            leaves,
            status,
        }
    }
}

/// Warmup windows, as iteration boundaries.
///
/// Iterations before `fast_end` tune the step size under a unit metric,
/// iterations in `fast_end..slow_end` also feed the variance estimate for
/// the diagonal metric, and the rest of warmup retunes the step size
/// against that metric.
#[derive(Debug, Clone, Copy)]
struct WarmupSchedule {
    fast_end: usize,
    slow_end: usize,
    end: usize,
}

impl WarmupSchedule {
    fn new(num_warmup: usize) -> Self {
        Self {
            fast_end: num_warmup * 15 / 100,
            slow_end: num_warmup * 90 / 100,
            end: num_warmup,
        }
    }

    fn collects(&self, iter: usize) -> bool {
        (self.fast_end..self.slow_end).contains(&iter)
    }
}

/// Running per-coordinate variance of warmup positions (Welford).
struct MassWindow {
    count: usize,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl MassWindow {
    /// Fewer draws than this leave the unit metric in place.
    const MIN_DRAWS: usize = 10;

    fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
        }
    }

    fn push(&mut self, q: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for ((mean, m2), &x) in self.mean.iter_mut().zip(&mut self.m2).zip(q) {
            let delta = x - *mean;
            *mean += delta / n;
            *m2 += delta * (x - *mean);
        }
    }

    fn variances(&self) -> Option<Vec<f64>> {
        if self.count <= Self::MIN_DRAWS {
            return None;
        }
        let n = self.count as f64;
        Some(self.m2.iter().map(|m2| m2 / n).collect())
    }
}

/// Run one NUTS chain, adapting the step size and a diagonal metric
/// during warmup. Retained draws are on the unconstrained scale.
pub fn run_chain(
    graph: &Graph,
    config: &NutsConfig,
    rng: &mut ChaCha8Rng,
    init: Option<Vec<f64>>,
) -> ChainResult {
    let dim = graph.param_count;
    let schedule = WarmupSchedule::new(config.num_warmup);
    let total_iters = config.num_warmup + config.num_draws;

    let mut integrator = Integrator::new(graph);
    let mut current = integrator.point(init.unwrap_or_else(|| vec![0.0; dim]));
    let mut window = MassWindow::new(dim);
    let mut samples = Vec::with_capacity(config.num_draws);
    let mut divergences = 0usize;
    let mut accept_total = 0.0f64;

    let mut step_size = match config.step_size {
        eps if eps > 0.0 => eps,
        _ => integrator.initial_step_size(&current, rng),
    };
    let mut adaptation = DualAveraging::new(step_size, config.target_accept);

    for iter in 0..total_iters {
        current.resample_momentum(&integrator.mass_sqrt, rng);
        let transition = integrator.transition(&current, step_size, config.max_tree_depth, rng);
        current = transition.next;
        divergences += usize::from(transition.diverging);
        accept_total += transition.accept_stat;

        if iter >= schedule.end {
            samples.push(current.q.clone());
            continue;
        }

        step_size = adaptation.update(transition.accept_stat);
        if schedule.collects(iter) {
            window.push(&current.q);
        }
        if iter + 1 == schedule.slow_end {
            if let Some(variances) = window.variances() {
                integrator.adapt_mass(&variances, window.count);
                current = integrator.point(current.q);
                step_size = integrator.initial_step_size(&current, rng);
                adaptation = DualAveraging::new(step_size, config.target_accept);
            }
        }
        if iter + 1 == schedule.end {
            step_size = adaptation.final_step_size();
        }
    }

    ChainResult {
        samples,
        accept_rate: if total_iters == 0 { 0.0 } else { accept_total / total_iters as f64 },
        step_size,
        divergences,
    }
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY && b == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}
