//! # Limited-memory BFGS minimizer
//!
//! Quasi-Newton descent for the parallax regression objective. The inverse
//! Hessian is approximated from a short history of `(s, y)` correction pairs
//! via the standard two-loop recursion; no Hessian is ever formed — with one
//! coefficient per spectral pixel the dimensionality makes that infeasible,
//! and the limited-memory approximation is the design point, not a shortcut.
//!
//! The step length comes from a backtracking Armijo line search. Curvature
//! pairs with a non-positive `sᵀy` are discarded rather than stored, which
//! keeps the implicit approximation positive definite.
//!
//! Convergence is a **hard success criterion**: running out of iterations or
//! failing the line search returns an error. A silently non-converged
//! coefficient vector would corrupt everything downstream of the fit.

use std::collections::VecDeque;

use nalgebra::DVector;

use crate::parallax_errors::ParallaxError;

/// A differentiable objective: loss and its analytic gradient.
pub trait Objective {
    fn loss(&self, b: &DVector<f64>) -> f64;
    fn grad(&self, b: &DVector<f64>) -> DVector<f64>;
}

/// Observer invoked by the minimizer after each accepted step.
///
/// Replaces ad-hoc logging closures: the solver stays oblivious to what the
/// caller does with the iteration trace, and the trace is testable without
/// touching solver internals.
pub trait StepObserver {
    fn on_step(&mut self, iteration: usize, loss: f64);
}

/// Observer that logs the loss every `every` iterations at DEBUG.
#[derive(Debug, Clone)]
pub struct LogObserver {
    pub every: usize,
}

impl Default for LogObserver {
    fn default() -> Self {
        LogObserver { every: 10 }
    }
}

impl StepObserver for LogObserver {
    fn on_step(&mut self, iteration: usize, loss: f64) {
        if self.every > 0 && iteration % self.every == 0 {
            log::debug!("iteration {iteration}: loss {loss:.6e}");
        }
    }
}

/// A converged minimization result.
#[derive(Debug, Clone)]
pub struct Solution {
    pub coefficients: DVector<f64>,
    pub loss: f64,
    pub grad_norm: f64,
    pub iterations: usize,
}

/// The minimizer configuration.
///
/// `grad_tol` is scaled by `1 + |loss|` when tested against the gradient
/// infinity norm, so the stopping rule behaves the same for objectives of
/// very different magnitudes.
#[derive(Debug, Clone, Copy)]
pub struct Lbfgs {
    pub max_iter: usize,
    pub grad_tol: f64,
    /// Number of `(s, y)` correction pairs retained.
    pub history: usize,
    /// Armijo sufficient-decrease constant.
    pub c1: f64,
    /// Backtracking contraction factor.
    pub shrink: f64,
    pub max_line_search: usize,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Lbfgs {
            max_iter: 500,
            grad_tol: 1e-6,
            history: 10,
            c1: 1e-4,
            shrink: 0.5,
            max_line_search: 40,
        }
    }
}

impl Lbfgs {
    /// Minimize `objective` starting from `x0`.
    ///
    /// Arguments
    /// -----------------
    /// * `objective`: loss/gradient pair (the gradient must be analytic and
    ///   consistent — see the self-check in [`crate::solver`]).
    /// * `x0`: starting point; warm starts land here.
    /// * `observer`: optional per-step callback.
    ///
    /// Return
    /// ----------
    /// * A converged [`Solution`], or
    ///   [`ParallaxError::SolverDidNotConverge`] /
    ///   [`ParallaxError::LineSearchFailed`].
    pub fn minimize(
        &self,
        objective: &dyn Objective,
        x0: DVector<f64>,
        mut observer: Option<&mut dyn StepObserver>,
    ) -> Result<Solution, ParallaxError> {
        let mut x = x0;
        let mut f = objective.loss(&x);
        let mut g = objective.grad(&x);

        let mut s_hist: VecDeque<DVector<f64>> = VecDeque::with_capacity(self.history);
        let mut y_hist: VecDeque<DVector<f64>> = VecDeque::with_capacity(self.history);

        for iteration in 0..self.max_iter {
            let grad_norm = g.amax();
            if grad_norm <= self.grad_tol * (1.0 + f.abs()) {
                return Ok(Solution {
                    coefficients: x,
                    loss: f,
                    grad_norm,
                    iterations: iteration,
                });
            }

            let mut direction = two_loop_direction(&g, &s_hist, &y_hist);
            if direction.dot(&g) >= 0.0 {
                // The history produced an ascent direction; fall back to
                // steepest descent and let fresh pairs rebuild it.
                direction = -&g;
            }

            let slope = direction.dot(&g);
            let mut alpha = 1.0;
            let mut accepted = None;
            for _ in 0..self.max_line_search {
                let candidate = &x + alpha * &direction;
                let f_candidate = objective.loss(&candidate);
                if f_candidate.is_finite() && f_candidate <= f + self.c1 * alpha * slope {
                    accepted = Some((candidate, f_candidate));
                    break;
                }
                alpha *= self.shrink;
            }
            let Some((x_new, f_new)) = accepted else {
                return Err(ParallaxError::LineSearchFailed {
                    iteration,
                    grad_norm,
                });
            };

            let g_new = objective.grad(&x_new);
            let s = &x_new - &x;
            let y = &g_new - &g;
            let sy = s.dot(&y);
            // Keep only curvature pairs that preserve positive definiteness.
            if sy > 1e-10 * y.norm_squared().max(f64::MIN_POSITIVE) {
                if s_hist.len() == self.history {
                    s_hist.pop_front();
                    y_hist.pop_front();
                }
                s_hist.push_back(s);
                y_hist.push_back(y);
            }

            x = x_new;
            f = f_new;
            g = g_new;

            if let Some(obs) = observer.as_mut() {
                obs.on_step(iteration, f);
            }
        }

        Err(ParallaxError::SolverDidNotConverge {
            iterations: self.max_iter,
            grad_norm: g.amax(),
        })
    }
}

/// Two-loop recursion: approximate `-H⁻¹ g` from the correction history.
fn two_loop_direction(
    g: &DVector<f64>,
    s_hist: &VecDeque<DVector<f64>>,
    y_hist: &VecDeque<DVector<f64>>,
) -> DVector<f64> {
    if s_hist.is_empty() {
        return -g;
    }

    let k = s_hist.len();
    let mut q = g.clone();
    let mut rho = Vec::with_capacity(k);
    let mut alpha = vec![0.0; k];

    for (s, y) in s_hist.iter().zip(y_hist.iter()) {
        rho.push(1.0 / s.dot(y));
    }

    for i in (0..k).rev() {
        alpha[i] = rho[i] * s_hist[i].dot(&q);
        q -= alpha[i] * &y_hist[i];
    }

    // Initial Hessian scaling from the most recent pair.
    let gamma = s_hist[k - 1].dot(&y_hist[k - 1]) / y_hist[k - 1].norm_squared();
    let mut r = gamma * q;

    for i in 0..k {
        let beta = rho[i] * y_hist[i].dot(&r);
        r += (alpha[i] - beta) * &s_hist[i];
    }

    -r
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Ill-conditioned convex quadratic: 0.5 Σ cᵢ xᵢ².
    struct Quadratic {
        curvature: Vec<f64>,
    }

    impl Objective for Quadratic {
        fn loss(&self, b: &DVector<f64>) -> f64 {
            0.5 * b
                .iter()
                .zip(&self.curvature)
                .map(|(x, c)| c * x * x)
                .sum::<f64>()
        }

        fn grad(&self, b: &DVector<f64>) -> DVector<f64> {
            DVector::from_iterator(
                b.len(),
                b.iter().zip(&self.curvature).map(|(x, c)| c * x),
            )
        }
    }

    #[test]
    fn minimizes_an_anisotropic_quadratic() {
        let objective = Quadratic {
            curvature: vec![1.0, 10.0, 100.0, 0.1],
        };
        let x0 = DVector::from_vec(vec![3.0, -2.0, 1.0, 5.0]);
        let solution = Lbfgs::default()
            .minimize(&objective, x0, None)
            .expect("quadratic must converge");
        for &x in solution.coefficients.iter() {
            assert_relative_eq!(x, 0.0, epsilon = 1e-4);
        }
        assert!(solution.iterations < 200);
    }

    #[test]
    fn minimizes_rosenbrock() {
        struct Rosenbrock;
        impl Objective for Rosenbrock {
            fn loss(&self, b: &DVector<f64>) -> f64 {
                let (a, y) = (b[0], b[1]);
                (1.0 - a).powi(2) + 100.0 * (y - a * a).powi(2)
            }
            fn grad(&self, b: &DVector<f64>) -> DVector<f64> {
                let (a, y) = (b[0], b[1]);
                DVector::from_vec(vec![
                    -2.0 * (1.0 - a) - 400.0 * a * (y - a * a),
                    200.0 * (y - a * a),
                ])
            }
        }

        let x0 = DVector::from_vec(vec![-1.2, 1.0]);
        let solution = Lbfgs {
            max_iter: 2000,
            ..Lbfgs::default()
        }
        .minimize(&Rosenbrock, x0, None)
        .expect("rosenbrock must converge");
        assert_relative_eq!(solution.coefficients[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(solution.coefficients[1], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn iteration_budget_is_enforced() {
        let objective = Quadratic {
            curvature: vec![1.0; 3],
        };
        let tight = Lbfgs {
            max_iter: 1,
            grad_tol: 1e-300,
            ..Lbfgs::default()
        };
        let result = tight.minimize(&objective, DVector::from_element(3, 10.0), None);
        assert!(matches!(
            result,
            Err(ParallaxError::SolverDidNotConverge { iterations: 1, .. })
        ));
    }

    #[test]
    fn observer_sees_monotone_loss() {
        struct Trace(Vec<f64>);
        impl StepObserver for Trace {
            fn on_step(&mut self, _iteration: usize, loss: f64) {
                self.0.push(loss);
            }
        }

        let objective = Quadratic {
            curvature: vec![2.0, 5.0],
        };
        let mut trace = Trace(Vec::new());
        Lbfgs::default()
            .minimize(
                &objective,
                DVector::from_vec(vec![4.0, -3.0]),
                Some(&mut trace),
            )
            .unwrap();
        assert!(!trace.0.is_empty());
        for pair in trace.0.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-12);
        }
    }
}
