use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::Array2;
use statrs::function::gamma::{digamma, ln_gamma};

use crate::error::{Error, Result};

/// Unique identifier for a node in the computation graph.
///
/// The second field stamps the scope that created the node, so a handle
/// cannot be used against another graph or a scope opened after a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize, ScopeId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ScopeId(u64);

impl ScopeId {
    fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        ScopeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Static shape of a node's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    Vector(usize),
}

impl Shape {
    /// Number of elements held by a value of this shape.
    pub fn len(self) -> usize {
        match self {
            Shape::Scalar => 1,
            Shape::Vector(n) => n,
        }
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Shape of an element-wise combination, or `None` when the operands
    /// cannot be broadcast against each other.
    pub fn broadcast(self, other: Shape) -> Option<Shape> {
        match (self, other) {
            (Shape::Scalar, s) | (s, Shape::Scalar) => Some(s),
            (Shape::Vector(a), Shape::Vector(b)) if a == b => Some(Shape::Vector(a)),
            _ => None,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Scalar => write!(f, "scalar"),
            Shape::Vector(n) => write!(f, "vector[{n}]"),
        }
    }
}

/// Element-wise single-argument functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unary {
    Neg,
    Abs,
    Exp,
    Log,
    Log1p,
    Square,
    Sigmoid,
    LogSigmoid,
    LnGamma,
}

impl Unary {
    pub fn eval(self, x: f64) -> f64 {
        match self {
            Unary::Neg => -x,
            Unary::Abs => x.abs(),
            Unary::Exp => x.exp(),
            Unary::Log => x.ln(),
            Unary::Log1p => x.ln_1p(),
            Unary::Square => x * x,
            Unary::Sigmoid => sigmoid(x),
            Unary::LogSigmoid => log_sigmoid(x),
            Unary::LnGamma => ln_gamma(x),
        }
    }

    /// d f(x) / dx, given the input `x` and the already computed output `y`.
    pub fn derivative(self, x: f64, y: f64) -> f64 {
        match self {
            Unary::Neg => -1.0,
            Unary::Abs => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            Unary::Exp => y,
            Unary::Log => 1.0 / x,
            Unary::Log1p => 1.0 / (1.0 + x),
            Unary::Square => 2.0 * x,
            Unary::Sigmoid => y * (1.0 - y),
            Unary::LogSigmoid => sigmoid(-x),
            Unary::LnGamma => digamma(x),
        }
    }
}

/// Element-wise two-argument functions with scalar/vector broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binary {
    Add,
    Sub,
    Mul,
    Div,
}

impl Binary {
    pub fn eval(self, a: f64, b: f64) -> f64 {
        match self {
            Binary::Add => a + b,
            Binary::Sub => a - b,
            Binary::Mul => a * b,
            Binary::Div => a / b,
        }
    }

    /// Partial derivatives (d/da, d/db) at `(a, b)`.
    pub fn partials(self, a: f64, b: f64) -> (f64, f64) {
        match self {
            Binary::Add => (1.0, 1.0),
            Binary::Sub => (1.0, -1.0),
            Binary::Mul => (b, a),
            Binary::Div => (1.0 / b, -a / (b * b)),
        }
    }
}

/// Operations supported in the computation graph.
#[derive(Debug, Clone)]
pub enum Op {
    /// A slice of the unconstrained parameter vector starting at `offset`.
    /// The node's shape gives the slice length.
    Param { offset: usize },
    /// A constant scalar value baked into the graph.
    Constant(f64),
    /// Data vector (index into `data_vectors`).
    Data(usize),
    /// Design matrix (index into `matrices`) times a vector node.
    MatVec { matrix: usize, vector: NodeId },
    Unary(Unary, NodeId),
    Binary(Binary, NodeId, NodeId),
    /// Sum of all elements of a node.
    Sum(NodeId),
}

/// A single node in the computation graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    pub shape: Shape,
}

/// Map from the unconstrained sampling space to a variable's support.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamTransform {
    Identity,
    /// x = exp(raw), support (0, ∞).
    Exp,
    /// x = sigmoid(raw), support (0, 1).
    Sigmoid,
    /// x = lower + (upper - lower) * sigmoid(raw).
    BoundedSigmoid { lower: f64, upper: f64 },
}

impl ParamTransform {
    pub fn apply(self, raw: f64) -> f64 {
        match self {
            ParamTransform::Identity => raw,
            ParamTransform::Exp => raw.exp(),
            ParamTransform::Sigmoid => sigmoid(raw),
            ParamTransform::BoundedSigmoid { lower, upper } => {
                lower + (upper - lower) * sigmoid(raw)
            }
        }
    }
}

/// A free random variable registered in the scope.
#[derive(Debug, Clone)]
pub struct RandomVariable {
    pub name: String,
    pub family: String,
    /// Unconstrained parameter node.
    pub raw: NodeId,
    /// Constrained value node, the handle other expressions refer to.
    pub value: NodeId,
    pub offset: usize,
    pub shape: Shape,
    pub transform: ParamTransform,
}

/// The computation graph of one probabilistic model: the explicit model
/// scope every construction call is made against.
///
/// Nodes are stored in topological order (each node only references earlier
/// nodes) and every node carries its static shape, so broadcasting errors
/// surface while the model is being assembled rather than while sampling.
/// Design matrices and observed vectors are stored beside the node list so
/// the graph stays cheap to share read-only across sampler threads.
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub param_count: usize,
    pub data_vectors: Vec<Vec<f64>>,
    pub matrices: Vec<Array2<f64>>,
    pub variables: Vec<RandomVariable>,
    pub logp_terms: Vec<NodeId>,
    name_to_node: HashMap<String, NodeId>,
    scope: ScopeId,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            param_count: 0,
            data_vectors: Vec::new(),
            matrices: Vec::new(),
            variables: Vec::new(),
            logp_terms: Vec::new(),
            name_to_node: HashMap::new(),
            scope: ScopeId::fresh(),
        }
    }

    fn push(&mut self, op: Op, shape: Shape) -> NodeId {
        let id = NodeId(self.nodes.len(), self.scope);
        self.nodes.push(Node { id, op, shape });
        id
    }

    pub fn shape(&self, id: NodeId) -> Shape {
        self.nodes[id.0].shape
    }

    /// Shape of `id`, or `None` when the node was not built in this scope.
    pub fn try_shape(&self, id: NodeId) -> Option<Shape> {
        if id.1 != self.scope {
            return None;
        }
        self.nodes.get(id.0).map(|node| node.shape)
    }

    fn constant_value(&self, id: NodeId) -> Option<f64> {
        match self.nodes[id.0].op {
            Op::Constant(c) => Some(c),
            _ => None,
        }
    }

    /// Fail with `DuplicateLabel` if `name` is already taken in this scope.
    pub fn check_name(&self, name: &str) -> Result<()> {
        if self.name_to_node.contains_key(name) {
            return Err(Error::DuplicateLabel {
                label: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn register_name(&mut self, name: &str, id: NodeId) -> Result<()> {
        self.check_name(name)?;
        self.name_to_node.insert(name.to_string(), id);
        Ok(())
    }

    /// Allocate `shape.len()` unconstrained parameters.
    pub fn add_param(&mut self, shape: Shape) -> NodeId {
        let offset = self.param_count;
        self.param_count += shape.len();
        self.push(Op::Param { offset }, shape)
    }

    pub fn add_variable(&mut self, variable: RandomVariable) -> Result<()> {
        self.register_name(&variable.name, variable.value)?;
        self.variables.push(variable);
        Ok(())
    }

    pub fn variable(&self, name: &str) -> Option<&RandomVariable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn add_constant(&mut self, value: f64) -> NodeId {
        self.push(Op::Constant(value), Shape::Scalar)
    }

    pub fn add_data(&mut self, values: Vec<f64>) -> NodeId {
        let shape = Shape::Vector(values.len());
        let idx = self.data_vectors.len();
        self.data_vectors.push(values);
        self.push(Op::Data(idx), shape)
    }

    /// Store a design matrix and return its index for `mat_vec`.
    pub fn add_matrix(&mut self, matrix: Array2<f64>) -> usize {
        let idx = self.matrices.len();
        self.matrices.push(matrix);
        idx
    }

    /// `matrices[matrix] · vector`, producing one value per matrix row.
    pub fn mat_vec(&mut self, matrix: usize, vector: NodeId) -> Result<NodeId> {
        let (rows, cols) = self.matrices[matrix].dim();
        let found = self.shape(vector);
        if found != Shape::Vector(cols) {
            return Err(Error::shape("design matrix product", Shape::Vector(cols), found));
        }
        Ok(self.push(Op::MatVec { matrix, vector }, Shape::Vector(rows)))
    }

    pub fn binary(&mut self, f: Binary, a: NodeId, b: NodeId) -> Result<NodeId> {
        let (sa, sb) = (self.shape(a), self.shape(b));
        let shape = sa
            .broadcast(sb)
            .ok_or_else(|| Error::shape("element-wise operation", sa, sb))?;
        if let (Some(x), Some(y)) = (self.constant_value(a), self.constant_value(b)) {
            return Ok(self.add_constant(f.eval(x, y)));
        }
        Ok(self.push(Op::Binary(f, a, b), shape))
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(Binary::Add, a, b)
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(Binary::Sub, a, b)
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(Binary::Mul, a, b)
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.binary(Binary::Div, a, b)
    }

    pub fn unary(&mut self, f: Unary, a: NodeId) -> NodeId {
        if let Some(x) = self.constant_value(a) {
            return self.add_constant(f.eval(x));
        }
        let shape = self.shape(a);
        self.push(Op::Unary(f, a), shape)
    }

    pub fn neg(&mut self, a: NodeId) -> NodeId {
        self.unary(Unary::Neg, a)
    }

    pub fn abs(&mut self, a: NodeId) -> NodeId {
        self.unary(Unary::Abs, a)
    }

    pub fn exp(&mut self, a: NodeId) -> NodeId {
        self.unary(Unary::Exp, a)
    }

    pub fn log(&mut self, a: NodeId) -> NodeId {
        self.unary(Unary::Log, a)
    }

    pub fn log1p(&mut self, a: NodeId) -> NodeId {
        self.unary(Unary::Log1p, a)
    }

    pub fn square(&mut self, a: NodeId) -> NodeId {
        self.unary(Unary::Square, a)
    }

    pub fn sigmoid(&mut self, a: NodeId) -> NodeId {
        self.unary(Unary::Sigmoid, a)
    }

    pub fn log_sigmoid(&mut self, a: NodeId) -> NodeId {
        self.unary(Unary::LogSigmoid, a)
    }

    pub fn ln_gamma(&mut self, a: NodeId) -> NodeId {
        self.unary(Unary::LnGamma, a)
    }

    pub fn sum(&mut self, a: NodeId) -> NodeId {
        if self.shape(a) == Shape::Scalar {
            return a;
        }
        self.push(Op::Sum(a), Shape::Scalar)
    }

    /// Add a node's (summed) value to the model's total log-density.
    pub fn add_logp_term(&mut self, node: NodeId) {
        let term = self.sum(node);
        self.logp_terms.push(term);
    }
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}
