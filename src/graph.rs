use crate::Real;
use ndarray::Array1;

/// Unique identifier for a node in the expression graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// Operations supported in the expression graph.
///
/// Binary ops broadcast: a scalar combines with anything elementwise, and a
/// row constant of length d combines with an n×d batch row by row. The
/// evaluator rejects any other shape pairing.
#[derive(Debug, Clone)]
pub enum Op {
    /// Placeholder for the n×d batch of evaluation points. Its column count
    /// is fixed only when a concrete array is fed at evaluation time.
    Input,
    /// A constant scalar baked into the graph.
    Const(Real),
    /// A constant row vector (index into the row-constant table), e.g. a mean.
    RowConst(usize),
    Add(NodeId, NodeId),
    Sub(NodeId, NodeId),
    Mul(NodeId, NodeId),
    Div(NodeId, NodeId),
    Neg(NodeId),
    Exp(NodeId),
    Ln(NodeId),
    Square(NodeId),
    /// Reduce an n×d matrix to a length-n vector by summing each row.
    SumRows(NodeId),
}

/// A single node in the expression graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
}

/// An expression tape over one batch of points.
///
/// Stores nodes in topological order (each node only references earlier
/// nodes). Row-vector constants live in a side table so the node list stays
/// lightweight. A graph holds at most one `Input` placeholder.
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: Vec<Node>,
    row_constants: Vec<Array1<Real>>,
    input: Option<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            row_constants: Vec::new(),
            input: None,
        }
    }

    fn add_node(&mut self, op: Op) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { id, op });
        id
    }

    /// The batch placeholder. Allocated on first call; every later call
    /// returns the same node.
    pub fn input(&mut self) -> NodeId {
        match self.input {
            Some(id) => id,
            None => {
                let id = self.add_node(Op::Input);
                self.input = Some(id);
                id
            }
        }
    }

    pub fn input_id(&self) -> Option<NodeId> {
        self.input
    }

    pub fn constant(&mut self, value: Real) -> NodeId {
        self.add_node(Op::Const(value))
    }

    pub fn row_constant(&mut self, values: Array1<Real>) -> NodeId {
        let idx = self.row_constants.len();
        self.row_constants.push(values);
        self.add_node(Op::RowConst(idx))
    }

    pub fn row_values(&self, idx: usize) -> &Array1<Real> {
        &self.row_constants[idx]
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::Add(a, b))
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::Sub(a, b))
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::Mul(a, b))
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.add_node(Op::Div(a, b))
    }

    pub fn neg(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Neg(a))
    }

    pub fn exp(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Exp(a))
    }

    pub fn ln(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Ln(a))
    }

    pub fn square(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Square(a))
    }

    pub fn sum_rows(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::SumRows(a))
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
