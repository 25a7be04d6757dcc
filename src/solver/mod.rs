//! # Regularized parallax regression
//!
//! Fits coefficients `b` minimizing
//!
//! ```text
//! loss(b) = 0.5 · Σᵢ wᵢ (yᵢ − exp((Xb)ᵢ))² + λ · Σⱼ mⱼ |bⱼ|
//! ```
//!
//! an **exponential-link weighted least squares** with an L1 penalty on the
//! masked (spectral) columns. The exponential link is not a statistical
//! nicety: parallax and the photometric predictors combine multiplicatively
//! in the underlying physics, so magnitudes and log-fluxes become additive
//! in the linear predictor, and the predicted parallax stays positive.
//!
//! The analytic gradient is
//!
//! ```text
//! grad(b) = −Xᵀ [ŷ ∘ w ∘ (y − ŷ)] + λ · m ∘ sign(b),   ŷ = exp(Xb)
//! ```
//!
//! Before optimizing, [`fit`] verifies the loss/gradient pair against
//! finite-difference directional derivatives along random unit directions
//! ([`check_gradient`]). A mismatch is a **fatal assertion** — it means the
//! implementation is inconsistent with itself, and every downstream
//! coefficient would be wrong in an undetectable way.
//!
//! Minimization is delegated to [`lbfgs`]; convergence is required, and a
//! warm start is supported so the two-stage fit (high-confidence subset
//! first, then the full sample) can reuse the subset solution.

pub mod lbfgs;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::parallax_errors::ParallaxError;
use crate::solver::lbfgs::{Lbfgs, Objective, Solution, StepObserver};

/// The regression objective over a fixed dataset.
///
/// Borrows the design matrix and target/weight/penalty vectors; constructing
/// one validates every shape, so the optimizer can assume consistency.
#[derive(Debug)]
pub struct Problem<'a> {
    x: &'a DMatrix<f64>,
    y: &'a DVector<f64>,
    w: &'a DVector<f64>,
    penalty: &'a DVector<f64>,
    lambda: f64,
}

impl<'a> Problem<'a> {
    /// Arguments
    /// -----------------
    /// * `x`: design matrix, one row per star, one column per feature.
    /// * `y`: target parallaxes (offset-corrected), length = rows of `x`.
    /// * `w`: observation weights (inverse parallax variance), same length.
    /// * `penalty`: binary column mask; 1 marks a penalized column.
    /// * `lambda`: L1 penalty strength, ≥ 0.
    ///
    /// Return
    /// ----------
    /// * The validated [`Problem`], or [`ParallaxError::ShapeMismatch`].
    pub fn new(
        x: &'a DMatrix<f64>,
        y: &'a DVector<f64>,
        w: &'a DVector<f64>,
        penalty: &'a DVector<f64>,
        lambda: f64,
    ) -> Result<Self, ParallaxError> {
        if y.len() != x.nrows() || w.len() != x.nrows() {
            return Err(ParallaxError::ShapeMismatch(format!(
                "design matrix has {} rows but y has {} and w has {} entries",
                x.nrows(),
                y.len(),
                w.len()
            )));
        }
        if penalty.len() != x.ncols() {
            return Err(ParallaxError::ShapeMismatch(format!(
                "design matrix has {} columns but the penalty mask has {} entries",
                x.ncols(),
                penalty.len()
            )));
        }
        if !lambda.is_finite() || lambda < 0.0 {
            return Err(ParallaxError::InvalidFitParams(format!(
                "lambda must be finite and non-negative, got {lambda}"
            )));
        }
        Ok(Problem {
            x,
            y,
            w,
            penalty,
            lambda,
        })
    }

    pub fn dim(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_observations(&self) -> usize {
        self.x.nrows()
    }
}

/// `sign` with `sign(0) = 0`, the subgradient choice for the L1 term.
fn sign(v: f64) -> f64 {
    if v == 0.0 {
        0.0
    } else {
        v.signum()
    }
}

impl Objective for Problem<'_> {
    fn loss(&self, b: &DVector<f64>) -> f64 {
        let yhat = (self.x * b).map(f64::exp);
        let residual = self.y - &yhat;
        let weighted = 0.5
            * residual
                .iter()
                .zip(self.w.iter())
                .map(|(r, w)| w * r * r)
                .sum::<f64>();
        let l1: f64 = b
            .iter()
            .zip(self.penalty.iter())
            .map(|(b, m)| m * b.abs())
            .sum();
        weighted + self.lambda * l1
    }

    fn grad(&self, b: &DVector<f64>) -> DVector<f64> {
        let yhat = (self.x * b).map(f64::exp);
        // ŷ ∘ w ∘ (y − ŷ)
        let scaled = DVector::from_iterator(
            yhat.len(),
            yhat.iter()
                .zip(self.w.iter())
                .zip(self.y.iter())
                .map(|((yh, w), y)| yh * w * (y - yh)),
        );
        let mut grad = -(self.x.transpose() * scaled);
        for j in 0..grad.len() {
            grad[j] += self.lambda * self.penalty[j] * sign(b[j]);
        }
        grad
    }
}

/// Verify the analytic gradient against central finite differences.
///
/// Draws `directions` random unit vectors, compares the analytic directional
/// derivative `grad(b₀)·u` with `(loss(b₀+εu) − loss(b₀−εu)) / 2ε`, and
/// fails on the first direction whose relative error exceeds `tol`.
///
/// Return
/// ----------
/// * `Ok(())`, or [`ParallaxError::GradientMismatch`] naming the offending
///   direction — which signals an implementation bug, not bad data.
pub fn check_gradient<R: Rng + ?Sized>(
    problem: &Problem<'_>,
    b0: &DVector<f64>,
    directions: usize,
    tol: f64,
    rng: &mut R,
) -> Result<(), ParallaxError> {
    let grad = problem.grad(b0);
    let eps = 1e-6 * (1.0 + b0.norm());

    for direction in 0..directions {
        let mut u = DVector::from_iterator(
            b0.len(),
            (0..b0.len()).map(|_| rng.sample::<f64, _>(StandardNormal)),
        );
        let norm = u.norm();
        if norm == 0.0 {
            continue;
        }
        u /= norm;

        let numeric =
            (problem.loss(&(b0 + eps * &u)) - problem.loss(&(b0 - eps * &u))) / (2.0 * eps);
        let analytic = grad.dot(&u);
        let relative_error =
            (numeric - analytic).abs() / numeric.abs().max(analytic.abs()).max(1e-8);
        if relative_error > tol {
            return Err(ParallaxError::GradientMismatch {
                direction,
                relative_error,
            });
        }
    }
    Ok(())
}

/// Tunable parameters of the regression fit.
///
/// Defaults
/// -----------------
/// * `lambda`: 1e-3 — L1 strength on the spectral columns.
/// * `grad_tol`: 1e-6, `max_iter`: 500, `history`: 10 — optimizer settings,
///   see [`Lbfgs`].
/// * `snr_min`: 10.0 — minimum `ϖ/σ_ϖ` for the stage-one subset of the
///   two-stage fit.
/// * `check_gradient`: true, `check_directions`: 10, `check_tol`: 1e-3 —
///   gradient self-check configuration.
#[derive(Debug, Clone, Copy)]
pub struct FitParams {
    pub lambda: f64,
    pub grad_tol: f64,
    pub max_iter: usize,
    pub history: usize,
    pub snr_min: f64,
    pub check_gradient: bool,
    pub check_directions: usize,
    pub check_tol: f64,
}

impl Default for FitParams {
    fn default() -> Self {
        FitParams {
            lambda: 1e-3,
            grad_tol: 1e-6,
            max_iter: 500,
            history: 10,
            snr_min: 10.0,
            check_gradient: true,
            check_directions: 10,
            check_tol: 1e-3,
        }
    }
}

impl FitParams {
    pub fn builder() -> FitParamsBuilder {
        FitParamsBuilder {
            params: FitParams::default(),
        }
    }

    pub(crate) fn optimizer(&self) -> Lbfgs {
        Lbfgs {
            max_iter: self.max_iter,
            grad_tol: self.grad_tol,
            history: self.history,
            ..Lbfgs::default()
        }
    }
}

/// Builder for [`FitParams`] with validation at `build()`.
#[derive(Debug, Clone, Copy)]
pub struct FitParamsBuilder {
    params: FitParams,
}

impl FitParamsBuilder {
    pub fn lambda(mut self, v: f64) -> Self {
        self.params.lambda = v;
        self
    }

    pub fn grad_tol(mut self, v: f64) -> Self {
        self.params.grad_tol = v;
        self
    }

    pub fn max_iter(mut self, v: usize) -> Self {
        self.params.max_iter = v;
        self
    }

    pub fn history(mut self, v: usize) -> Self {
        self.params.history = v;
        self
    }

    pub fn snr_min(mut self, v: f64) -> Self {
        self.params.snr_min = v;
        self
    }

    pub fn check_gradient(mut self, v: bool) -> Self {
        self.params.check_gradient = v;
        self
    }

    pub fn check_directions(mut self, v: usize) -> Self {
        self.params.check_directions = v;
        self
    }

    pub fn check_tol(mut self, v: f64) -> Self {
        self.params.check_tol = v;
        self
    }

    pub fn build(self) -> Result<FitParams, ParallaxError> {
        let p = self.params;
        if !p.lambda.is_finite() || p.lambda < 0.0 {
            return Err(ParallaxError::InvalidFitParams(format!(
                "lambda must be finite and non-negative, got {}",
                p.lambda
            )));
        }
        if !p.grad_tol.is_finite() || p.grad_tol <= 0.0 {
            return Err(ParallaxError::InvalidFitParams(format!(
                "grad_tol must be finite and positive, got {}",
                p.grad_tol
            )));
        }
        if p.max_iter == 0 || p.history == 0 {
            return Err(ParallaxError::InvalidFitParams(
                "max_iter and history must be at least 1".to_string(),
            ));
        }
        if !p.snr_min.is_finite() || p.snr_min < 0.0 {
            return Err(ParallaxError::InvalidFitParams(format!(
                "snr_min must be finite and non-negative, got {}",
                p.snr_min
            )));
        }
        if p.check_gradient && (p.check_directions == 0 || p.check_tol <= 0.0) {
            return Err(ParallaxError::InvalidFitParams(
                "gradient check needs at least one direction and a positive tolerance"
                    .to_string(),
            ));
        }
        Ok(p)
    }
}

/// Small uniform initial point: magnitude inversely proportional to the
/// dimensionality, so `exp(Xb)` cannot overflow on the first evaluation
/// however wide the design matrix is.
pub fn default_init(dim: usize) -> DVector<f64> {
    DVector::from_element(dim, 0.1 / dim.max(1) as f64)
}

/// Fit coefficients for one dataset.
///
/// Runs the gradient self-check (at the strictly-nonzero default initial
/// point, where the L1 term is differentiable), then minimizes from
/// `warm_start` if given, otherwise from [`default_init`].
///
/// Arguments
/// -----------------
/// * `x`, `y`, `w`, `penalty`: dataset, see [`Problem::new`].
/// * `params`: fit configuration.
/// * `warm_start`: previous solution to start from (two-stage fits).
/// * `observer`: optional optimizer-step callback.
/// * `rng`: source of the random check directions.
///
/// Return
/// ----------
/// * The converged [`Solution`], or the first error: shape mismatch,
///   gradient mismatch, or solver non-convergence (never silently accepted).
#[allow(clippy::too_many_arguments)]
pub fn fit<R: Rng + ?Sized>(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    w: &DVector<f64>,
    penalty: &DVector<f64>,
    params: &FitParams,
    warm_start: Option<&DVector<f64>>,
    observer: Option<&mut dyn StepObserver>,
    rng: &mut R,
) -> Result<Solution, ParallaxError> {
    let problem = Problem::new(x, y, w, penalty, params.lambda)?;

    if let Some(start) = warm_start {
        if start.len() != problem.dim() {
            return Err(ParallaxError::ShapeMismatch(format!(
                "warm start has {} coefficients, design matrix has {} columns",
                start.len(),
                problem.dim()
            )));
        }
    }

    if params.check_gradient {
        check_gradient(
            &problem,
            &default_init(problem.dim()),
            params.check_directions,
            params.check_tol,
            rng,
        )?;
    }

    let start = warm_start
        .cloned()
        .unwrap_or_else(|| default_init(problem.dim()));

    params.optimizer().minimize(&problem, start, observer)
}
