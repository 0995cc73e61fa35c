use crate::graph::{Graph, NodeId, Op, Shape};

/// Value produced by evaluating a node. Scalars and vectors are tracked
/// separately so scalar parameter arithmetic stays allocation free while
/// data-sized expressions broadcast against it.
#[derive(Debug, Clone)]
pub enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Value {
    /// Element `i` under broadcasting: a scalar answers every index.
    #[inline]
    pub fn at(&self, i: usize) -> f64 {
        match self {
            Value::Scalar(v) => *v,
            Value::Vector(v) => v[i],
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        match self {
            Value::Scalar(v) => std::slice::from_ref(v),
            Value::Vector(v) => v,
        }
    }

    pub fn as_scalar(&self) -> f64 {
        match self {
            Value::Scalar(v) => *v,
            Value::Vector(v) => v.iter().sum(),
        }
    }
}

/// Reusable forward/reverse evaluation buffers for one graph.
///
/// Each sampler chain owns one evaluator; after `compute` the total
/// log-density and its gradient with respect to the unconstrained
/// parameter vector are available in `total_logp` and `grad`.
pub struct Evaluator {
    values: Vec<Value>,
    adjoints: Vec<Vec<f64>>,
    pub grad: Vec<f64>,
    pub total_logp: f64,
}

impl Evaluator {
    pub fn new(graph: &Graph) -> Self {
        Self {
            values: Vec::with_capacity(graph.nodes.len()),
            adjoints: graph.nodes.iter().map(|n| vec![0.0; n.shape.len()]).collect(),
            grad: vec![0.0; graph.param_count],
            total_logp: 0.0,
        }
    }

    /// Value of `id` from the most recent evaluation.
    pub fn value(&self, id: NodeId) -> &Value {
        &self.values[id.0]
    }

    /// Evaluate the total log-density only.
    pub fn logp(&mut self, graph: &Graph, params: &[f64]) -> f64 {
        self.forward(graph, params);
        self.total_logp
    }

    /// Evaluate the total log-density and its gradient.
    pub fn compute(&mut self, graph: &Graph, params: &[f64]) {
        self.forward(graph, params);
        self.reverse(graph);
    }

    fn forward(&mut self, graph: &Graph, params: &[f64]) {
        self.values.clear();

        for node in &graph.nodes {
            let values = &self.values;
            let val = match &node.op {
                Op::Param { offset } => match node.shape {
                    Shape::Scalar => Value::Scalar(params[*offset]),
                    Shape::Vector(n) => Value::Vector(params[*offset..*offset + n].to_vec()),
                },
                Op::Constant(c) => Value::Scalar(*c),
                Op::Data(idx) => Value::Vector(graph.data_vectors[*idx].clone()),
                Op::MatVec { matrix, vector } => {
                    let v = values[vector.0].as_slice();
                    Value::Vector(
                        graph.matrices[*matrix]
                            .rows()
                            .into_iter()
                            .map(|row| row.iter().zip(v).map(|(m, x)| m * x).sum())
                            .collect(),
                    )
                }
                Op::Unary(f, a) => match &values[a.0] {
                    Value::Scalar(x) => Value::Scalar(f.eval(*x)),
                    Value::Vector(xs) => Value::Vector(xs.iter().map(|&x| f.eval(x)).collect()),
                },
                Op::Binary(f, a, b) => {
                    let (va, vb) = (&values[a.0], &values[b.0]);
                    match node.shape {
                        Shape::Scalar => Value::Scalar(f.eval(va.at(0), vb.at(0))),
                        Shape::Vector(n) => {
                            Value::Vector((0..n).map(|i| f.eval(va.at(i), vb.at(i))).collect())
                        }
                    }
                }
                Op::Sum(a) => Value::Scalar(values[a.0].as_slice().iter().sum()),
            };
            self.values.push(val);
        }

        self.total_logp = graph
            .logp_terms
            .iter()
            .map(|id| self.values[id.0].as_scalar())
            .sum();
    }

    fn reverse(&mut self, graph: &Graph) {
        for adj in &mut self.adjoints {
            adj.iter_mut().for_each(|a| *a = 0.0);
        }
        self.grad.iter_mut().for_each(|g| *g = 0.0);

        // Seed: d(total_logp)/d(logp_term) = 1.0
        for id in &graph.logp_terms {
            self.adjoints[id.0][0] += 1.0;
        }

        let values = &self.values;
        for node in graph.nodes.iter().rev() {
            let idx = node.id.0;
            // Operands always precede the node, so they live in `lower`.
            let (lower, upper) = self.adjoints.split_at_mut(idx);
            let upstream = &upper[0];
            if upstream.iter().all(|&g| g == 0.0) {
                continue;
            }

            match &node.op {
                Op::Constant(_) | Op::Data(_) => {}
                Op::Param { offset } => {
                    for (i, g) in upstream.iter().enumerate() {
                        self.grad[offset + i] += g;
                    }
                }
                Op::MatVec { matrix, vector } => {
                    let m = &graph.matrices[*matrix];
                    let target = &mut lower[vector.0];
                    for (row, g) in m.rows().into_iter().zip(upstream) {
                        for (t, x) in target.iter_mut().zip(row.iter()) {
                            *t += g * x;
                        }
                    }
                }
                Op::Unary(f, a) => {
                    let x = &values[a.0];
                    let y = &values[idx];
                    let target = &mut lower[a.0];
                    for (i, g) in upstream.iter().enumerate() {
                        target[i] += g * f.derivative(x.at(i), y.at(i));
                    }
                }
                Op::Binary(f, a, b) => {
                    let (va, vb) = (&values[a.0], &values[b.0]);
                    let a_scalar = graph.shape(*a) == Shape::Scalar;
                    let b_scalar = graph.shape(*b) == Shape::Scalar;
                    for (i, g) in upstream.iter().enumerate() {
                        let (da, db) = f.partials(va.at(i), vb.at(i));
                        lower[a.0][if a_scalar { 0 } else { i }] += g * da;
                        lower[b.0][if b_scalar { 0 } else { i }] += g * db;
                    }
                }
                Op::Sum(a) => {
                    let g = upstream[0];
                    lower[a.0].iter_mut().for_each(|t| *t += g);
                }
            }
        }
    }
}

/// Compute the total log-probability (sum of all logp_terms).
pub fn eval_logp(graph: &Graph, params: &[f64]) -> f64 {
    Evaluator::new(graph).logp(graph, params)
}

/// Reverse-mode autodiff: total log-probability and its gradient w.r.t. params.
pub fn grad_logp(graph: &Graph, params: &[f64]) -> (f64, Vec<f64>) {
    let mut evaluator = Evaluator::new(graph);
    evaluator.compute(graph, params);
    (evaluator.total_logp, evaluator.grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, Shape};
    use ndarray::array;
    use proptest::prelude::*;

    fn normal_model() -> Graph {
        let mut g = Graph::new();
        let x = g.add_param(Shape::Scalar);
        let mu = g.add_constant(0.0);
        let sigma = g.add_constant(1.0);
        let z = g.sub(x, mu).unwrap();
        let z = g.div(z, sigma).unwrap();
        let sq = g.square(z);
        let half = g.add_constant(-0.5);
        let lp = g.mul(half, sq).unwrap();
        g.add_logp_term(lp);
        g
    }

    #[test]
    fn test_normal_logp_gradient() {
        let g = normal_model();
        let (logp, grad) = grad_logp(&g, &[1.5]);
        assert!((logp - (-0.5 * 1.5_f64.powi(2))).abs() < 1e-12);
        // d logp / d x = -x
        assert!((grad[0] + 1.5).abs() < 1e-12);
    }

    fn regression_model() -> Graph {
        // y ~ Normal(X·b, exp(s))
        let mut g = Graph::new();
        let b = g.add_param(Shape::Vector(2));
        let s = g.add_param(Shape::Scalar);
        let m = g.add_matrix(array![[1.0, 0.5], [1.0, -1.0], [1.0, 2.0]]);
        let mu = g.mat_vec(m, b).unwrap();
        let y = g.add_data(vec![0.3, -1.2, 2.5]);
        let sigma = g.exp(s);
        let resid = g.sub(y, mu).unwrap();
        let z = g.div(resid, sigma).unwrap();
        let sq = g.square(z);
        let log_sigma = g.log(sigma);
        let half = g.add_constant(-0.5);
        let a = g.mul(half, sq).unwrap();
        let lp = g.sub(a, log_sigma).unwrap();
        g.add_logp_term(lp);
        g
    }

    #[test]
    fn zero_column_design_contributes_nothing() {
        let mut g = Graph::new();
        let u = g.add_param(Shape::Vector(0));
        let m = g.add_matrix(ndarray::Array2::zeros((3, 0)));
        let mu = g.mat_vec(m, u).unwrap();
        let mut ev = Evaluator::new(&g);
        ev.compute(&g, &[]);
        assert_eq!(ev.value(mu).as_slice(), &[0.0, 0.0, 0.0]);
        assert!(ev.grad.is_empty());
    }

    proptest! {
        #[test]
        fn gradient_matches_finite_differences(
            b0 in -2.0f64..2.0,
            b1 in -2.0f64..2.0,
            s in -1.0f64..1.0,
        ) {
            let g = regression_model();
            let params = [b0, b1, s];
            let (_, grad) = grad_logp(&g, &params);
            let eps = 1e-6;
            for i in 0..params.len() {
                let mut plus = params;
                let mut minus = params;
                plus[i] += eps;
                minus[i] -= eps;
                let numerical = (eval_logp(&g, &plus) - eval_logp(&g, &minus)) / (2.0 * eps);
                prop_assert!(
                    (grad[i] - numerical).abs() < 1e-4 * (1.0 + numerical.abs()),
                    "param {}: analytic={}, numerical={}", i, grad[i], numerical
                );
            }
        }
    }
}
