//! Unnormalized test densities for kernel goodness-of-fit statistics.
//!
//! A density exposes its log-density and the gradient of the log-density
//! with respect to the evaluation points. Both come from one expression
//! graph built at construction time: the log-density is written symbolically
//! over the graph's input placeholder, and the gradient falls out of the
//! reverse-mode pass over the same tape — no hand-derived formulas.

use crate::autodiff::{Evaluator, Value};
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId};
use crate::Real;
use ndarray::{Array1, Array2};

/// Differentiation context for one density instance: the expression tape,
/// its input placeholder and its log-density output.
///
/// Built once at construction and reused by every evaluation. Each call runs
/// in its own scoped [`Evaluator`], so no evaluation state outlives the call
/// or leaks between instances.
pub struct DensityExpr {
    graph: Graph,
    input: NodeId,
    log_den: NodeId,
}

impl DensityExpr {
    /// Build the tape by invoking `formula` against a fresh input placeholder.
    pub fn build<F>(formula: F) -> Self
    where
        F: FnOnce(&mut Graph, NodeId) -> NodeId,
    {
        let mut graph = Graph::new();
        let input = graph.input();
        let log_den = formula(&mut graph, input);
        Self {
            graph,
            input,
            log_den,
        }
    }

    /// Evaluate the log-density for each row of `x`.
    pub fn log_den(&self, x: &Array2<Real>) -> Result<Array1<Real>> {
        let mut session = Evaluator::new(&self.graph);
        session.forward(x)?;
        match session.value(self.log_den) {
            Value::Batch(v) => Ok(v.clone()),
            _ => Err(Error::Computation(
                "log-density expression must produce one value per row".into(),
            )),
        }
    }

    /// Evaluate the gradient of the log-density for each row of `x`.
    pub fn grad_log(&self, x: &Array2<Real>) -> Result<Array2<Real>> {
        let mut session = Evaluator::new(&self.graph);
        session.forward(x)?;
        session.backward(self.log_den, self.input)
    }
}

/// An unnormalized differentiable density.
///
/// `log_den_expr` supplies the symbolic log-density formula; `log_den` and
/// `grad_log` are provided on top of the graph context prebuilt at
/// construction, and may be shadowed by implementations that have a cheaper
/// closed form.
pub trait UnnormalizedDensity {
    /// Build the symbolic log-density over the graph input `x`.
    ///
    /// `x` stands for an n×d batch of points; the returned node must carry
    /// one value per row.
    fn log_den_expr(&self, graph: &mut Graph, x: NodeId) -> NodeId;

    /// The differentiation context prebuilt at construction.
    fn expr(&self) -> &DensityExpr;

    /// Log of the unnormalized density at each of the n points in `x`.
    ///
    /// Returns a length-n array, one value per row of `x`.
    fn log_den(&self, x: &Array2<Real>) -> Result<Array1<Real>> {
        self.expr().log_den(x)
    }

    /// Gradient of the log-density at each of the n points in `x`.
    ///
    /// Returns an n×d array matching the shape of `x`.
    fn grad_log(&self, x: &Array2<Real>) -> Result<Array2<Real>> {
        self.expr().grad_log(x)
    }
}

// ── IsotropicNormal ─────────────────────────────────────────────────

/// Unnormalized density of an isotropic multivariate normal distribution.
pub struct IsotropicNormal {
    mean: Array1<Real>,
    variance: Real,
    expr: DensityExpr,
}

impl IsotropicNormal {
    /// `mean` is the length-d center; `variance` must be positive.
    pub fn new(mean: Array1<Real>, variance: Real) -> Result<Self> {
        if mean.is_empty() {
            return Err(Error::InvalidParameter("mean must be non-empty".into()));
        }
        if !(variance > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "variance must be positive, got {variance}"
            )));
        }
        let expr = DensityExpr::build(|g, x| Self::formula(&mean, variance, g, x));
        Ok(Self {
            mean,
            variance,
            expr,
        })
    }

    pub fn mean(&self) -> &Array1<Real> {
        &self.mean
    }

    pub fn variance(&self) -> Real {
        self.variance
    }

    /// Per row i: -||x_i - mean||^2 / variance. The additive normalizing
    /// constant is omitted — gradients of the log-density are invariant
    /// to it, which is all the goodness-of-fit statistic needs.
    fn formula(mean: &Array1<Real>, variance: Real, g: &mut Graph, x: NodeId) -> NodeId {
        let mean_node = g.row_constant(mean.clone());
        let centered = g.sub(x, mean_node);
        let sq = g.square(centered);
        let sum_sq = g.sum_rows(sq);
        let var = g.constant(variance);
        let scaled = g.div(sum_sq, var);
        g.neg(scaled)
    }
}

impl UnnormalizedDensity for IsotropicNormal {
    fn log_den_expr(&self, graph: &mut Graph, x: NodeId) -> NodeId {
        Self::formula(&self.mean, self.variance, graph, x)
    }

    fn expr(&self) -> &DensityExpr {
        &self.expr
    }
}

// ── CallableDensity ─────────────────────────────────────────────────

/// A density specified by an arbitrary graph-building function.
///
/// `func` maps the input placeholder to a symbolic per-row log-density.
/// The graph context is built at construction like every other variant, so
/// the wrapped formula is evaluable and differentiable immediately.
pub struct CallableDensity<F>
where
    F: Fn(&mut Graph, NodeId) -> NodeId,
{
    func: F,
    expr: DensityExpr,
}

impl<F> CallableDensity<F>
where
    F: Fn(&mut Graph, NodeId) -> NodeId,
{
    pub fn new(func: F) -> Self {
        let expr = DensityExpr::build(&func);
        Self { func, expr }
    }
}

impl<F> UnnormalizedDensity for CallableDensity<F>
where
    F: Fn(&mut Graph, NodeId) -> NodeId,
{
    fn log_den_expr(&self, graph: &mut Graph, x: NodeId) -> NodeId {
        (self.func)(graph, x)
    }

    fn expr(&self) -> &DensityExpr {
        &self.expr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    fn random_batch(rng: &mut ChaCha8Rng, n: usize, d: usize) -> Array2<Real> {
        Array2::from_shape_fn((n, d), |_| StandardNormal.sample(rng))
    }

    #[test]
    fn test_isotropic_normal_log_den_closed_form() {
        let mean = array![1.0, -2.0, 0.5];
        let variance = 1.7;
        let den = IsotropicNormal::new(mean.clone(), variance).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let x = random_batch(&mut rng, 12, 3);
        let logp = den.log_den(&x).unwrap();

        for i in 0..x.nrows() {
            let mut sum_sq = 0.0;
            for j in 0..x.ncols() {
                let diff = x[[i, j]] - mean[j];
                sum_sq += diff * diff;
            }
            assert_abs_diff_eq!(logp[i], -sum_sq / variance, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_isotropic_normal_grad_closed_form() {
        let mean = array![0.0, 3.0];
        let variance = 0.5;
        let den = IsotropicNormal::new(mean.clone(), variance).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let x = random_batch(&mut rng, 8, 2);
        let grad = den.grad_log(&x).unwrap();

        assert_eq!(grad.dim(), x.dim());
        for i in 0..x.nrows() {
            for j in 0..x.ncols() {
                let expected = -2.0 * (x[[i, j]] - mean[j]) / variance;
                assert_abs_diff_eq!(grad[[i, j]], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let den = IsotropicNormal::new(array![0.5, -0.5], 2.0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let x = random_batch(&mut rng, 5, 2);

        let logp_a = den.log_den(&x).unwrap();
        let logp_b = den.log_den(&x).unwrap();
        assert_eq!(logp_a, logp_b);

        let grad_a = den.grad_log(&x).unwrap();
        let grad_b = den.grad_log(&x).unwrap();
        assert_eq!(grad_a, grad_b);
    }

    #[test]
    fn test_batch_size_invariance() {
        let den = IsotropicNormal::new(array![1.0, 2.0, 3.0], 1.3).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(19);
        let x = random_batch(&mut rng, 6, 3);

        let logp = den.log_den(&x).unwrap();
        let grad = den.grad_log(&x).unwrap();

        for i in 0..x.nrows() {
            let row = x.row(i).insert_axis(ndarray::Axis(0)).to_owned();
            let logp_row = den.log_den(&row).unwrap();
            let grad_row = den.grad_log(&row).unwrap();

            assert_abs_diff_eq!(logp[i], logp_row[0], epsilon = 1e-14);
            for j in 0..x.ncols() {
                assert_abs_diff_eq!(grad[[i, j]], grad_row[[0, j]], epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let den = IsotropicNormal::new(array![0.0, 0.0], 1.0).unwrap();
        let x = Array2::zeros((4, 3));

        let err = den.log_den(&x).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch {
                expected: 2,
                found: 3
            }
        ));

        let err = den.grad_log(&x).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_nonpositive_variance_rejected() {
        assert!(matches!(
            IsotropicNormal::new(array![0.0], 0.0),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            IsotropicNormal::new(array![0.0], -1.0),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            IsotropicNormal::new(array![0.0], Real::NAN),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_empty_mean_rejected() {
        assert!(matches!(
            IsotropicNormal::new(Array1::zeros(0), 1.0),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_callable_density_usable_after_construction() {
        // -sum(x^2), the standard normal up to scale.
        let den = CallableDensity::new(|g: &mut Graph, x: NodeId| {
            let sq = g.square(x);
            let s = g.sum_rows(sq);
            g.neg(s)
        });

        let x = array![[1.0, 2.0], [0.0, -3.0]];
        let logp = den.log_den(&x).unwrap();
        assert_abs_diff_eq!(logp[0], -5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(logp[1], -9.0, epsilon = 1e-12);

        let grad = den.grad_log(&x).unwrap();
        for i in 0..x.nrows() {
            for j in 0..x.ncols() {
                assert_abs_diff_eq!(grad[[i, j]], -2.0 * x[[i, j]], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_callable_two_component_mixture_finite_diff() {
        // log(exp(-||x - m1||^2) + exp(-||x - m2||^2)), an unnormalized
        // mixture of two isotropic normals.
        let quad = |g: &mut Graph, x: NodeId, m: Array1<Real>| -> NodeId {
            let m = g.row_constant(m);
            let centered = g.sub(x, m);
            let sq = g.square(centered);
            let s = g.sum_rows(sq);
            g.neg(s)
        };
        let den = CallableDensity::new(move |g: &mut Graph, x: NodeId| {
            let a = quad(g, x, array![1.0, 1.0]);
            let b = quad(g, x, array![-1.0, -1.0]);
            let ea = g.exp(a);
            let eb = g.exp(b);
            let sum = g.add(ea, eb);
            g.ln(sum)
        });

        let points = array![[0.3, -0.7], [1.5, 0.2]];
        let grad = den.grad_log(&points).unwrap();

        let eps = 1e-6;
        for i in 0..points.nrows() {
            for j in 0..points.ncols() {
                let mut plus = points.clone();
                plus[[i, j]] += eps;
                let mut minus = points.clone();
                minus[[i, j]] -= eps;

                let vp = den.log_den(&plus).unwrap()[i];
                let vm = den.log_den(&minus).unwrap()[i];
                let numerical = (vp - vm) / (2.0 * eps);
                assert!(
                    (grad[[i, j]] - numerical).abs() < 1e-4,
                    "analytic={}, numerical={}",
                    grad[[i, j]],
                    numerical
                );
            }
        }
    }

    #[test]
    fn test_log_den_expr_rebuilds_equivalent_graph() {
        let den = IsotropicNormal::new(array![2.0, -1.0], 0.8).unwrap();
        let rebuilt = DensityExpr::build(|g, x| den.log_den_expr(g, x));

        let mut rng = ChaCha8Rng::seed_from_u64(23);
        let x = random_batch(&mut rng, 4, 2);

        let logp = den.log_den(&x).unwrap();
        let logp_rebuilt = rebuilt.log_den(&x).unwrap();
        for i in 0..x.nrows() {
            assert_abs_diff_eq!(logp[i], logp_rebuilt[i], epsilon = 1e-14);
        }
    }
}
