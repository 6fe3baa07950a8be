//! # Portfolio Optimizers
//!
//! $$
//! \min_{\mathbf{w}}\ \mathbf{w}^\top\Sigma\mathbf{w}\quad\text{s.t.}\quad
//! \mathbf{1}^\top\mathbf{w}=1,\ \ \boldsymbol\mu^\top\mathbf{w}=r^\*,\ \ l\le w_i\le u
//! $$
//!
//! Constrained minimum-variance optimizer and the maximum-Sharpe search built on top of it.

use argmin::core::CostFunction;
use argmin::core::Executor;
use argmin::core::State;
use argmin::core::TerminationReason;
use argmin::solver::brent::BrentOpt;
use nalgebra::DMatrix;
use nalgebra::DVector;
use ndarray::Array1;
use ndarray::Array2;
use tracing::debug;
use tracing::warn;

use super::error::PortfolioError;
use super::solver::AdmmSolver;
use super::solver::QuadraticProgram;
use super::solver::QuadraticSolver;
use super::types::WeightBounds;

/// Tolerance on the budget and return equalities of a returned portfolio.
pub const CONSTRAINT_TOLERANCE: f64 = 1e-6;

const SYMMETRY_TOLERANCE: f64 = 1e-10;

/// Expected portfolio return `w' mu`.
pub fn portfolio_return(w: &Array1<f64>, mu: &Array1<f64>) -> f64 {
  w.dot(mu)
}

/// Portfolio variance `w' Sigma w`.
pub fn portfolio_variance(w: &Array1<f64>, cov: &Array2<f64>) -> f64 {
  w.dot(&cov.dot(w))
}

/// Portfolio volatility `sqrt(w' Sigma w)`, floored at zero variance.
pub fn portfolio_volatility(w: &Array1<f64>, cov: &Array2<f64>) -> f64 {
  portfolio_variance(w, cov).max(0.0).sqrt()
}

/// Check that `cov` is a finite symmetric square matrix with non-negative variances.
pub fn check_covariance(cov: &Array2<f64>) -> Result<usize, PortfolioError> {
  let (rows, cols) = cov.dim();
  if rows != cols {
    return Err(PortfolioError::shape("covariance columns", rows, cols));
  }
  if cov.iter().any(|v| !v.is_finite()) {
    return Err(PortfolioError::InvalidCovariance(
      "non-finite entry".into(),
    ));
  }

  let scale = cov.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
  for i in 0..rows {
    if cov[[i, i]] < 0.0 {
      return Err(PortfolioError::InvalidCovariance(format!(
        "negative variance {} on diagonal {i}",
        cov[[i, i]]
      )));
    }
    for j in (i + 1)..rows {
      if (cov[[i, j]] - cov[[j, i]]).abs() > SYMMETRY_TOLERANCE * scale {
        return Err(PortfolioError::InvalidCovariance(format!(
          "asymmetric entries at ({i}, {j})"
        )));
      }
    }
  }

  Ok(rows)
}

/// Smallest and largest component of `mu`.
pub fn return_range(mu: &Array1<f64>) -> (f64, f64) {
  mu.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
    (lo.min(v), hi.max(v))
  })
}

fn check_target(target: f64, mu: &Array1<f64>) -> Result<(), PortfolioError> {
  let (min, max) = return_range(mu);
  let tol = 1e-12 * min.abs().max(max.abs()).max(1.0);
  if !target.is_finite() || target < min - tol || target > max + tol {
    return Err(PortfolioError::InfeasibleTarget { target, min, max });
  }
  Ok(())
}

/// Minimum-variance optimizer under budget, optional target-return and box constraints.
#[derive(Clone, Debug)]
pub struct MinVarianceOptimizer<S = AdmmSolver> {
  solver: S,
  bounds: WeightBounds,
}

impl MinVarianceOptimizer<AdmmSolver> {
  pub fn new(bounds: WeightBounds) -> Self {
    Self {
      solver: AdmmSolver::default(),
      bounds,
    }
  }

  pub fn long_only() -> Self {
    Self::new(WeightBounds::long_only())
  }
}

impl Default for MinVarianceOptimizer<AdmmSolver> {
  fn default() -> Self {
    Self::long_only()
  }
}

impl<S: QuadraticSolver> MinVarianceOptimizer<S> {
  /// Use a custom QP backend.
  pub fn with_solver(solver: S, bounds: WeightBounds) -> Self {
    Self { solver, bounds }
  }

  pub fn bounds(&self) -> WeightBounds {
    self.bounds
  }

  pub fn solver(&self) -> &S {
    &self.solver
  }

  /// Minimize `w' Sigma w` subject to `sum(w) = 1`, `w' mu = target` when a target is
  /// given, and the configured bounds. The solve starts from uniform weights.
  pub fn minimize(
    &self,
    cov: &Array2<f64>,
    mu: Option<&Array1<f64>>,
    target: Option<f64>,
  ) -> Result<Array1<f64>, PortfolioError> {
    let n = check_covariance(cov)?;
    if n == 0 {
      return Err(PortfolioError::InvalidConfiguration(
        "asset universe is empty".into(),
      ));
    }
    if let Some(mu) = mu {
      if mu.len() != n {
        return Err(PortfolioError::shape("expected returns", n, mu.len()));
      }
    }

    let return_constraint = match (mu, target) {
      (Some(mu), Some(target)) => {
        check_target(target, mu)?;
        Some((mu, target))
      }
      (None, Some(_)) => {
        return Err(PortfolioError::InvalidConfiguration(
          "target return requires expected returns".into(),
        ))
      }
      (_, None) => None,
    };

    let m_eq = if return_constraint.is_some() { 2 } else { 1 };
    let mut eq_matrix = DMatrix::<f64>::from_element(m_eq, n, 1.0);
    let mut eq_rhs = DVector::<f64>::from_element(m_eq, 1.0);
    if let Some((mu, target)) = return_constraint {
      for j in 0..n {
        eq_matrix[(1, j)] = mu[j];
      }
      eq_rhs[1] = target;
    }

    let problem = QuadraticProgram {
      hessian: DMatrix::from_fn(n, n, |i, j| 2.0 * cov[[i, j]]),
      eq_matrix,
      eq_rhs,
      lower: DVector::from_element(n, self.bounds.lower),
      upper: DVector::from_element(n, self.bounds.upper),
      x0: DVector::from_element(n, 1.0 / n as f64),
    };

    let solution = self.solver.solve(&problem)?;
    if !solution.is_converged() {
      warn!(
        iterations = solution.iterations,
        primal_residual = solution.primal_residual,
        dual_residual = solution.dual_residual,
        ?target,
        "minimum-variance solve did not converge"
      );
    }
    let iterations = solution.iterations;
    let dual_residual = solution.dual_residual;
    let w = Array1::from_iter(solution.into_result()?.iter().copied());

    let budget_err = (w.sum() - 1.0).abs();
    let return_err = return_constraint
      .map(|(mu, target)| (portfolio_return(&w, mu) - target).abs() / target.abs().max(1.0))
      .unwrap_or(0.0);
    if budget_err >= CONSTRAINT_TOLERANCE || return_err >= CONSTRAINT_TOLERANCE {
      return Err(PortfolioError::SolverNonConvergence {
        iterations,
        primal_residual: budget_err.max(return_err),
        dual_residual,
      });
    }

    Ok(w)
  }

  /// Global minimum-variance portfolio (budget and bounds only).
  pub fn global_minimum_variance(&self, cov: &Array2<f64>) -> Result<Array1<f64>, PortfolioError> {
    self.minimize(cov, None, None)
  }

  /// Minimum-variance portfolio achieving `target` under `mu`.
  pub fn minimum_variance_for_target(
    &self,
    cov: &Array2<f64>,
    mu: &Array1<f64>,
    target: f64,
  ) -> Result<Array1<f64>, PortfolioError> {
    self.minimize(cov, Some(mu), Some(target))
  }

  /// Tangency portfolio maximizing `(w' mu - r_f) / sigma_p`.
  ///
  /// Searches the target return between the global minimum-variance return and
  /// `max(mu)` with Brent's method, one minimum-variance solve per evaluation.
  pub fn maximum_sharpe(
    &self,
    cov: &Array2<f64>,
    mu: &Array1<f64>,
    risk_free: f64,
  ) -> Result<TangencyPortfolio, PortfolioError> {
    let gmv = self.global_minimum_variance(cov)?;
    if mu.len() != gmv.len() {
      return Err(PortfolioError::shape("expected returns", gmv.len(), mu.len()));
    }

    let (min_mu, max_mu) = return_range(mu);
    let lo = portfolio_return(&gmv, mu).clamp(min_mu, max_mu);
    let hi = max_mu;
    if hi - lo <= 1e-12 * hi.abs().max(1.0) {
      return Ok(TangencyPortfolio::new(lo, gmv, mu, cov, risk_free));
    }

    let cost = NegativeSharpe {
      optimizer: self,
      cov,
      mu,
      risk_free,
    };
    let res = Executor::new(cost, BrentOpt::new(lo, hi))
      .configure(|state| state.max_iters(200))
      .run()
      .map_err(|err| match err.downcast::<PortfolioError>() {
        Ok(inner) => inner,
        Err(other) => PortfolioError::Numerical(other.to_string()),
      })?;

    if let Some(TerminationReason::MaxItersReached) = res.state.get_termination_reason() {
      return Err(PortfolioError::SolverNonConvergence {
        iterations: res.state.get_iter() as usize,
        primal_residual: f64::NAN,
        dual_residual: f64::NAN,
      });
    }

    let target = res.state.best_param.unwrap_or(lo);
    let weights = self.minimum_variance_for_target(cov, mu, target)?;
    let mut tangency = TangencyPortfolio::new(target, weights, mu, cov, risk_free);

    // Brent stops strictly inside the bracket; the optimum may sit on an end point.
    for edge in [lo, hi] {
      let w = self.minimum_variance_for_target(cov, mu, edge)?;
      let candidate = TangencyPortfolio::new(edge, w, mu, cov, risk_free);
      if candidate.sharpe > tangency.sharpe {
        tangency = candidate;
      }
    }
    debug!(
      target = tangency.target_return,
      sharpe = tangency.sharpe,
      "tangency portfolio located"
    );

    Ok(tangency)
  }
}

/// Maximum-Sharpe portfolio with its summary statistics.
#[derive(Clone, Debug)]
pub struct TangencyPortfolio {
  pub target_return: f64,
  pub weights: Array1<f64>,
  pub expected_return: f64,
  pub volatility: f64,
  /// `(expected_return - risk_free) / volatility`, zero for a riskless portfolio.
  pub sharpe: f64,
}

impl TangencyPortfolio {
  fn new(
    target_return: f64,
    weights: Array1<f64>,
    mu: &Array1<f64>,
    cov: &Array2<f64>,
    risk_free: f64,
  ) -> Self {
    let expected_return = portfolio_return(&weights, mu);
    let volatility = portfolio_volatility(&weights, cov);
    Self {
      target_return,
      weights,
      expected_return,
      volatility,
      sharpe: sharpe_ratio(expected_return, volatility, risk_free),
    }
  }
}

fn sharpe_ratio(expected_return: f64, volatility: f64, risk_free: f64) -> f64 {
  if volatility > 1e-15 {
    (expected_return - risk_free) / volatility
  } else {
    0.0
  }
}

struct NegativeSharpe<'a, S> {
  optimizer: &'a MinVarianceOptimizer<S>,
  cov: &'a Array2<f64>,
  mu: &'a Array1<f64>,
  risk_free: f64,
}

impl<S: QuadraticSolver> CostFunction for NegativeSharpe<'_, S> {
  type Param = f64;
  type Output = f64;

  fn cost(&self, target: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
    let w = self
      .optimizer
      .minimum_variance_for_target(self.cov, self.mu, *target)?;
    let vol = portfolio_volatility(&w, self.cov);
    Ok(-sharpe_ratio(portfolio_return(&w, self.mu), vol, self.risk_free))
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;

  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::*;
  use crate::portfolio::solver::SolveStatus;
  use crate::portfolio::solver::Solution;

  /// Counts calls and answers with uniform weights scaled by `budget`.
  struct Scripted {
    calls: AtomicUsize,
    budget: f64,
  }

  impl Scripted {
    fn new(budget: f64) -> Self {
      Self {
        calls: AtomicUsize::new(0),
        budget,
      }
    }
  }

  impl QuadraticSolver for Scripted {
    fn solve(&self, problem: &QuadraticProgram) -> Result<Solution, PortfolioError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let n = problem.dim();
      Ok(Solution {
        x: DVector::from_element(n, self.budget / n as f64),
        status: SolveStatus::Converged,
        iterations: 17,
        primal_residual: 1e-12,
        dual_residual: 3e-11,
        polished: false,
      })
    }
  }

  fn three_asset_cov() -> Array2<f64> {
    array![
      [0.04, 0.01, 0.0],
      [0.01, 0.09, 0.02],
      [0.0, 0.02, 0.16],
    ]
  }

  #[test]
  fn markowitz_long_only_weights_sum_to_one() {
    let mu = array![0.08, 0.1, 0.12];
    let cov = three_asset_cov();
    let optimizer = MinVarianceOptimizer::long_only();

    let w = optimizer
      .minimum_variance_for_target(&cov, &mu, 0.1)
      .unwrap();

    assert!((w.sum() - 1.0).abs() < CONSTRAINT_TOLERANCE);
    assert!((portfolio_return(&w, &mu) - 0.1).abs() < CONSTRAINT_TOLERANCE);
    assert!(WeightBounds::long_only().contains(&w));
  }

  #[test]
  fn uncorrelated_minimum_variance_is_inverse_variance() {
    let cov = array![[0.04, 0.0, 0.0], [0.0, 0.09, 0.0], [0.0, 0.0, 0.01]];
    let w = MinVarianceOptimizer::long_only()
      .global_minimum_variance(&cov)
      .unwrap();

    assert_abs_diff_eq!(w[0], 0.1837, epsilon = 1e-3);
    assert_abs_diff_eq!(w[1], 0.0817, epsilon = 1e-3);
    assert_abs_diff_eq!(w[2], 0.7346, epsilon = 1e-3);
  }

  #[test]
  fn identical_assets_split_evenly() {
    let mu = array![0.07, 0.07];
    let cov = array![[0.05, 0.0], [0.0, 0.05]];
    let w = MinVarianceOptimizer::long_only()
      .minimum_variance_for_target(&cov, &mu, 0.07)
      .unwrap();

    assert_abs_diff_eq!(w[0], 0.5, epsilon = 1e-6);
    assert_abs_diff_eq!(w[1], 0.5, epsilon = 1e-6);
  }

  #[test]
  fn two_asset_target_matches_closed_form() {
    // With two assets the constraints pin the weights: w1 = (r - mu2) / (mu1 - mu2).
    let mu = array![0.05, 0.15];
    let cov = array![[0.01, 0.002], [0.002, 0.09]];
    let w = MinVarianceOptimizer::long_only()
      .minimum_variance_for_target(&cov, &mu, 0.12)
      .unwrap();

    assert_abs_diff_eq!(w[0], 0.3, epsilon = 1e-6);
    assert_abs_diff_eq!(w[1], 0.7, epsilon = 1e-6);
  }

  #[test]
  fn target_above_max_return_is_infeasible() {
    let mu = array![0.08, 0.1, 0.12];
    let err = MinVarianceOptimizer::long_only()
      .minimum_variance_for_target(&three_asset_cov(), &mu, 0.2)
      .unwrap_err();

    match err {
      PortfolioError::InfeasibleTarget { target, min, max } => {
        assert_eq!(target, 0.2);
        assert_eq!(min, 0.08);
        assert_eq!(max, 0.12);
      }
      other => panic!("unexpected error {other:?}"),
    }
  }

  #[test]
  fn infeasible_target_never_reaches_the_solver() {
    let mu = array![0.08, 0.1, 0.12];
    let optimizer =
      MinVarianceOptimizer::with_solver(Scripted::new(1.0), WeightBounds::long_only());

    for target in [0.2, 0.01, f64::NAN] {
      assert!(matches!(
        optimizer.minimum_variance_for_target(&three_asset_cov(), &mu, target),
        Err(PortfolioError::InfeasibleTarget { .. })
      ));
    }
    assert_eq!(optimizer.solver().calls.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn budget_miss_keeps_solver_diagnostics() {
    let optimizer =
      MinVarianceOptimizer::with_solver(Scripted::new(0.9), WeightBounds::long_only());
    let err = optimizer
      .global_minimum_variance(&three_asset_cov())
      .unwrap_err();

    match err {
      PortfolioError::SolverNonConvergence {
        iterations,
        primal_residual,
        dual_residual,
      } => {
        assert_eq!(iterations, 17);
        assert_eq!(dual_residual, 3e-11);
        assert!((primal_residual - 0.1).abs() < 1e-12);
      }
      other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(optimizer.solver().calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn shorting_respects_wider_bounds() {
    let mu = array![0.08, 0.1, 0.12];
    let cov = array![[0.04, 0.018, 0.0], [0.018, 0.09, 0.02], [0.0, 0.02, 0.16]];
    let optimizer = MinVarianceOptimizer::new(WeightBounds::long_short());
    let w = optimizer.minimum_variance_for_target(&cov, &mu, 0.08).unwrap();

    assert!(WeightBounds::long_short().contains(&w));
    assert!((w.sum() - 1.0).abs() < CONSTRAINT_TOLERANCE);
    // Shorting cannot do worse than the long-only solve at the same target.
    let long_only = MinVarianceOptimizer::long_only()
      .minimum_variance_for_target(&cov, &mu, 0.08)
      .unwrap();
    assert!(portfolio_variance(&w, &cov) <= portfolio_variance(&long_only, &cov) + 1e-10);
  }

  #[test]
  fn shape_errors_fail_fast() {
    let optimizer = MinVarianceOptimizer::long_only();
    let cov = three_asset_cov();

    assert!(matches!(
      optimizer.minimize(&cov, Some(&array![0.1, 0.2]), Some(0.15)),
      Err(PortfolioError::DataShapeMismatch { .. })
    ));
    assert!(matches!(
      optimizer.global_minimum_variance(&array![[0.04, 0.01], [0.0, 0.09]]),
      Err(PortfolioError::InvalidCovariance(_))
    ));
    assert!(matches!(
      optimizer.global_minimum_variance(&Array2::zeros((0, 0))),
      Err(PortfolioError::InvalidConfiguration(_))
    ));
  }

  #[test]
  fn maximum_sharpe_beats_minimum_variance() {
    let mu = array![0.08, 0.1, 0.12];
    let cov = three_asset_cov();
    let optimizer = MinVarianceOptimizer::long_only();

    let tangency = optimizer.maximum_sharpe(&cov, &mu, 0.02).unwrap();
    let gmv = optimizer.global_minimum_variance(&cov).unwrap();
    let gmv_sharpe =
      (portfolio_return(&gmv, &mu) - 0.02) / portfolio_volatility(&gmv, &cov);

    assert!(tangency.sharpe >= gmv_sharpe - 1e-7);
    assert!((tangency.weights.sum() - 1.0).abs() < CONSTRAINT_TOLERANCE);
  }
}
