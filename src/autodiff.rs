use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, Op};
use crate::Real;
use ndarray::{Array1, Array2, Axis};

/// Value produced by evaluating a node. A scalar constant, a length-n batch
/// (one value per input row), and an n×d point matrix are tracked separately
/// so ops can broadcast between them without guessing intent from raw shapes.
#[derive(Debug, Clone)]
pub enum Value {
    Scalar(Real),
    Batch(Array1<Real>),
    Points(Array2<Real>),
}

impl Value {
    pub fn as_batch(&self) -> Result<&Array1<Real>> {
        match self {
            Value::Batch(v) => Ok(v),
            _ => Err(Error::Computation("expected a per-row value".into())),
        }
    }

    pub fn as_points(&self) -> Result<&Array2<Real>> {
        match self {
            Value::Points(m) => Ok(m),
            _ => Err(Error::Computation("expected an n×d value".into())),
        }
    }

    fn zeros_like(&self) -> Value {
        match self {
            Value::Scalar(_) => Value::Scalar(0.0),
            Value::Batch(v) => Value::Batch(Array1::zeros(v.len())),
            Value::Points(m) => Value::Points(Array2::zeros(m.raw_dim())),
        }
    }
}

/// Elementwise combination of two values under the broadcasting rules:
/// scalars combine with anything, equal shapes combine pointwise, and a
/// length-d vector combines row by row with an n×d matrix. A vector whose
/// length disagrees with the matrix column count is a shape mismatch — this
/// is where a density's baked-in dimensionality meets the fed batch.
fn zip_values(a: &Value, b: &Value, f: impl Fn(Real, Real) -> Real) -> Result<Value> {
    use Value::*;
    match (a, b) {
        (Scalar(x), Scalar(y)) => Ok(Scalar(f(*x, *y))),
        (Batch(x), Scalar(y)) => Ok(Batch(x.mapv(|v| f(v, *y)))),
        (Scalar(x), Batch(y)) => Ok(Batch(y.mapv(|v| f(*x, v)))),
        (Points(x), Scalar(y)) => Ok(Points(x.mapv(|v| f(v, *y)))),
        (Scalar(x), Points(y)) => Ok(Points(y.mapv(|v| f(*x, v)))),
        (Batch(x), Batch(y)) => {
            if x.len() != y.len() {
                return Err(Error::ShapeMismatch {
                    expected: x.len(),
                    found: y.len(),
                });
            }
            let mut out = Array1::zeros(x.len());
            for i in 0..x.len() {
                out[i] = f(x[i], y[i]);
            }
            Ok(Batch(out))
        }
        (Points(x), Points(y)) => {
            if x.dim() != y.dim() {
                return Err(Error::ShapeMismatch {
                    expected: x.ncols(),
                    found: y.ncols(),
                });
            }
            let mut out = Array2::zeros(x.raw_dim());
            for i in 0..x.nrows() {
                for j in 0..x.ncols() {
                    out[[i, j]] = f(x[[i, j]], y[[i, j]]);
                }
            }
            Ok(Points(out))
        }
        (Points(x), Batch(y)) => {
            if y.len() != x.ncols() {
                return Err(Error::ShapeMismatch {
                    expected: y.len(),
                    found: x.ncols(),
                });
            }
            let mut out = Array2::zeros(x.raw_dim());
            for i in 0..x.nrows() {
                for j in 0..x.ncols() {
                    out[[i, j]] = f(x[[i, j]], y[j]);
                }
            }
            Ok(Points(out))
        }
        (Batch(x), Points(y)) => {
            if x.len() != y.ncols() {
                return Err(Error::ShapeMismatch {
                    expected: x.len(),
                    found: y.ncols(),
                });
            }
            let mut out = Array2::zeros(y.raw_dim());
            for i in 0..y.nrows() {
                for j in 0..y.ncols() {
                    out[[i, j]] = f(x[j], y[[i, j]]);
                }
            }
            Ok(Points(out))
        }
    }
}

fn map_value(a: &Value, f: impl Fn(Real) -> Real) -> Value {
    match a {
        Value::Scalar(x) => Value::Scalar(f(*x)),
        Value::Batch(v) => Value::Batch(v.mapv(|x| f(x))),
        Value::Points(m) => Value::Points(m.mapv(|x| f(x))),
    }
}

/// Add `contrib` (shaped like an op's result) into `slot` (shaped like one of
/// its operands), summing over any axis the operand was broadcast across.
fn add_reduced(slot: &mut Value, contrib: &Value) -> Result<()> {
    use Value::*;
    match (slot, contrib) {
        (Scalar(a), Scalar(c)) => *a += *c,
        (Scalar(a), Batch(c)) => *a += c.sum(),
        (Scalar(a), Points(c)) => *a += c.sum(),
        (Batch(a), Batch(c)) if a.len() == c.len() => *a += c,
        (Batch(a), Points(c)) if a.len() == c.ncols() => *a += &c.sum_axis(Axis(0)),
        (Points(a), Points(c)) if a.dim() == c.dim() => *a += c,
        _ => return Err(Error::Computation("adjoint shape mismatch".into())),
    }
    Ok(())
}

/// A scoped evaluation session over one graph.
///
/// Owns the per-node value buffer for a single forward pass (and, for
/// gradients, the adjoint buffer of the reverse pass). Callers create one
/// per evaluation and drop it when the call returns; nothing is cached
/// across calls or shared between instances.
pub struct Evaluator<'g> {
    graph: &'g Graph,
    values: Vec<Value>,
}

impl<'g> Evaluator<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            values: Vec::new(),
        }
    }

    /// Bind `x` to the input placeholder and evaluate every node in tape order.
    pub fn forward(&mut self, x: &Array2<Real>) -> Result<()> {
        let graph = self.graph;
        self.values.clear();
        self.values.reserve(graph.nodes.len());

        for node in &graph.nodes {
            let val = match &node.op {
                Op::Input => Value::Points(x.clone()),
                Op::Const(c) => Value::Scalar(*c),
                Op::RowConst(idx) => Value::Batch(graph.row_values(*idx).clone()),
                Op::Add(a, b) => zip_values(&self.values[a.0], &self.values[b.0], |u, v| u + v)?,
                Op::Sub(a, b) => zip_values(&self.values[a.0], &self.values[b.0], |u, v| u - v)?,
                Op::Mul(a, b) => zip_values(&self.values[a.0], &self.values[b.0], |u, v| u * v)?,
                Op::Div(a, b) => zip_values(&self.values[a.0], &self.values[b.0], |u, v| u / v)?,
                Op::Neg(a) => map_value(&self.values[a.0], |v| -v),
                Op::Exp(a) => map_value(&self.values[a.0], |v| v.exp()),
                Op::Ln(a) => map_value(&self.values[a.0], |v| v.ln()),
                Op::Square(a) => map_value(&self.values[a.0], |v| v * v),
                Op::SumRows(a) => Value::Batch(self.values[a.0].as_points()?.sum_axis(Axis(1))),
            };
            self.values.push(val);
        }

        Ok(())
    }

    /// Value of a node from the last forward pass.
    pub fn value(&self, id: NodeId) -> &Value {
        &self.values[id.0]
    }

    /// Reverse-mode pass: gradient of the per-row `output` with respect to
    /// the n×d node `wrt`.
    ///
    /// Rows of the batch are independent, so seeding every row's adjoint
    /// with one yields the per-row gradients in the accumulated adjoint of
    /// `wrt` — an n×d matrix matching the fed input.
    pub fn backward(&self, output: NodeId, wrt: NodeId) -> Result<Array2<Real>> {
        if self.values.len() != self.graph.nodes.len() {
            return Err(Error::Computation("backward requires a forward pass".into()));
        }
        let n = self.values[output.0].as_batch()?.len();

        let mut adjoints: Vec<Value> = self.values.iter().map(Value::zeros_like).collect();
        adjoints[output.0] = Value::Batch(Array1::ones(n));

        for node in self.graph.nodes.iter().rev() {
            let adj = adjoints[node.id.0].clone();
            match &node.op {
                Op::Input | Op::Const(_) | Op::RowConst(_) => {}
                Op::Add(a, b) => {
                    add_reduced(&mut adjoints[a.0], &adj)?;
                    add_reduced(&mut adjoints[b.0], &adj)?;
                }
                Op::Sub(a, b) => {
                    add_reduced(&mut adjoints[a.0], &adj)?;
                    let neg = map_value(&adj, |v| -v);
                    add_reduced(&mut adjoints[b.0], &neg)?;
                }
                Op::Mul(a, b) => {
                    let da = zip_values(&adj, &self.values[b.0], |g, v| g * v)?;
                    add_reduced(&mut adjoints[a.0], &da)?;
                    let db = zip_values(&adj, &self.values[a.0], |g, v| g * v)?;
                    add_reduced(&mut adjoints[b.0], &db)?;
                }
                Op::Div(a, b) => {
                    let da = zip_values(&adj, &self.values[b.0], |g, v| g / v)?;
                    add_reduced(&mut adjoints[a.0], &da)?;
                    let num = zip_values(&adj, &self.values[a.0], |g, v| g * v)?;
                    let db = zip_values(&num, &self.values[b.0], |t, v| -t / (v * v))?;
                    add_reduced(&mut adjoints[b.0], &db)?;
                }
                Op::Neg(a) => {
                    let neg = map_value(&adj, |v| -v);
                    add_reduced(&mut adjoints[a.0], &neg)?;
                }
                Op::Exp(a) => {
                    // d exp(u)/du = exp(u), the node's own output value.
                    let da = zip_values(&adj, &self.values[node.id.0], |g, v| g * v)?;
                    add_reduced(&mut adjoints[a.0], &da)?;
                }
                Op::Ln(a) => {
                    let da = zip_values(&adj, &self.values[a.0], |g, v| g / v)?;
                    add_reduced(&mut adjoints[a.0], &da)?;
                }
                Op::Square(a) => {
                    let da = zip_values(&adj, &self.values[a.0], |g, v| 2.0 * g * v)?;
                    add_reduced(&mut adjoints[a.0], &da)?;
                }
                Op::SumRows(a) => {
                    // Every entry of row i contributed once to output row i.
                    let g = adj.as_batch()?;
                    let pa = self.values[a.0].as_points()?;
                    let mut contrib = Array2::zeros(pa.raw_dim());
                    for i in 0..contrib.nrows() {
                        for j in 0..contrib.ncols() {
                            contrib[[i, j]] = g[i];
                        }
                    }
                    add_reduced(&mut adjoints[a.0], &Value::Points(contrib))?;
                }
            }
        }

        match std::mem::replace(&mut adjoints[wrt.0], Value::Scalar(0.0)) {
            Value::Points(g) => Ok(g),
            _ => Err(Error::Computation(
                "gradient target must be an n×d node".into(),
            )),
        }
    }
}
