//! # Quadratic Solver
//!
//! $$
//! \min_{x}\ \tfrac12 x^\top P x \quad\text{s.t.}\quad Ax=b,\ \ l\le x\le u
//! $$
//!
//! Convex QP capability used by the portfolio optimizer, with an operator-splitting
//! (ADMM) backend followed by an active-set polish on the reduced KKT system.

use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;

use super::error::PortfolioError;

/// Convex quadratic program with affine equalities and box bounds.
#[derive(Clone, Debug)]
pub struct QuadraticProgram {
  /// Symmetric positive semi-definite `P` (objective is `x'Px / 2`).
  pub hessian: DMatrix<f64>,
  /// Equality constraint matrix `A`, one row per constraint.
  pub eq_matrix: DMatrix<f64>,
  pub eq_rhs: DVector<f64>,
  pub lower: DVector<f64>,
  pub upper: DVector<f64>,
  /// Initial iterate.
  pub x0: DVector<f64>,
}

impl QuadraticProgram {
  pub fn dim(&self) -> usize {
    self.hessian.nrows()
  }

  fn validate(&self) -> Result<(), PortfolioError> {
    let n = self.dim();
    if self.hessian.ncols() != n {
      return Err(PortfolioError::shape("hessian columns", n, self.hessian.ncols()));
    }
    if self.eq_matrix.ncols() != n {
      return Err(PortfolioError::shape(
        "equality matrix columns",
        n,
        self.eq_matrix.ncols(),
      ));
    }
    if self.eq_rhs.len() != self.eq_matrix.nrows() {
      return Err(PortfolioError::shape(
        "equality right-hand side",
        self.eq_matrix.nrows(),
        self.eq_rhs.len(),
      ));
    }
    for (context, v) in [
      ("lower bounds", &self.lower),
      ("upper bounds", &self.upper),
      ("initial iterate", &self.x0),
    ] {
      if v.len() != n {
        return Err(PortfolioError::shape(context, n, v.len()));
      }
    }
    Ok(())
  }
}

/// Terminal state of a solve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolveStatus {
  Converged,
  MaxIterationsReached,
  NumericalFailure,
}

/// Solver output. Callers must inspect `status` before trusting `x`.
#[derive(Clone, Debug)]
pub struct Solution {
  pub x: DVector<f64>,
  pub status: SolveStatus,
  pub iterations: usize,
  pub primal_residual: f64,
  pub dual_residual: f64,
  /// Whether `x` comes from the exact active-set polish.
  pub polished: bool,
}

impl Solution {
  pub fn is_converged(&self) -> bool {
    self.status == SolveStatus::Converged
  }

  /// Convert a non-converged solution into [`PortfolioError::SolverNonConvergence`].
  pub fn into_result(self) -> Result<DVector<f64>, PortfolioError> {
    match self.status {
      SolveStatus::Converged => Ok(self.x),
      SolveStatus::MaxIterationsReached | SolveStatus::NumericalFailure => {
        Err(PortfolioError::SolverNonConvergence {
          iterations: self.iterations,
          primal_residual: self.primal_residual,
          dual_residual: self.dual_residual,
        })
      }
    }
  }
}

/// Minimizes a convex quadratic under affine equalities and box bounds.
pub trait QuadraticSolver: Send + Sync {
  fn solve(&self, problem: &QuadraticProgram) -> Result<Solution, PortfolioError>;
}

/// Tuning for [`AdmmSolver`].
#[derive(Clone, Debug)]
pub struct AdmmConfig {
  /// Initial penalty for box rows. Equality rows use `rho * 1e3`.
  pub rho: f64,
  /// Proximal regularization on `x`.
  pub sigma: f64,
  /// Over-relaxation in `(0, 2)`.
  pub alpha: f64,
  pub eps_abs: f64,
  pub eps_rel: f64,
  pub max_iters: usize,
  /// Iterations between penalty updates; `0` disables adaptation.
  pub adaptive_rho_interval: usize,
  pub polish: bool,
}

impl Default for AdmmConfig {
  fn default() -> Self {
    Self {
      rho: 0.1,
      sigma: 1e-6,
      alpha: 1.6,
      eps_abs: 1e-9,
      eps_rel: 1e-9,
      max_iters: 25_000,
      adaptive_rho_interval: 25,
      polish: true,
    }
  }
}

impl AdmmConfig {
  pub fn validate(&self) -> Result<(), PortfolioError> {
    if !(self.rho > 0.0 && self.sigma > 0.0) {
      return Err(PortfolioError::InvalidConfiguration(
        "rho and sigma must be > 0".into(),
      ));
    }
    if !(self.alpha > 0.0 && self.alpha < 2.0) {
      return Err(PortfolioError::InvalidConfiguration(
        "alpha must lie in (0, 2)".into(),
      ));
    }
    if self.max_iters == 0 {
      return Err(PortfolioError::InvalidConfiguration(
        "max_iters must be >= 1".into(),
      ));
    }
    Ok(())
  }
}

const EQ_RHO_SCALE: f64 = 1e3;
const RHO_MIN: f64 = 1e-6;
const RHO_MAX: f64 = 1e6;
const POLISH_TOL: f64 = 1e-9;
const POLISH_DUAL_TOL: f64 = 1e-8;
const VERTEX_DUAL_TOL: f64 = 1e-6;
/// Scaled residual level below which polishing is attempted inside the loop.
const POLISH_TRIGGER: f64 = 1e-6;

/// Operator-splitting QP solver on dense `nalgebra` matrices.
#[derive(Clone, Debug, Default)]
pub struct AdmmSolver {
  config: AdmmConfig,
}

impl AdmmSolver {
  pub fn new(config: AdmmConfig) -> Result<Self, PortfolioError> {
    config.validate()?;
    Ok(Self { config })
  }

  pub fn config(&self) -> &AdmmConfig {
    &self.config
  }
}

/// Constraint rows `C = [A; I]` and their bounds.
struct Stacked {
  c: DMatrix<f64>,
  ct: DMatrix<f64>,
  lo: DVector<f64>,
  hi: DVector<f64>,
  m_eq: usize,
}

impl Stacked {
  fn new(problem: &QuadraticProgram) -> Self {
    let n = problem.dim();
    let m_eq = problem.eq_matrix.nrows();
    let rows = m_eq + n;

    let c = DMatrix::from_fn(rows, n, |i, j| {
      if i < m_eq {
        problem.eq_matrix[(i, j)]
      } else if i - m_eq == j {
        1.0
      } else {
        0.0
      }
    });
    let lo = DVector::from_fn(rows, |i, _| {
      if i < m_eq {
        problem.eq_rhs[i]
      } else {
        problem.lower[i - m_eq]
      }
    });
    let hi = DVector::from_fn(rows, |i, _| {
      if i < m_eq {
        problem.eq_rhs[i]
      } else {
        problem.upper[i - m_eq]
      }
    });

    Self {
      ct: c.transpose(),
      c,
      lo,
      hi,
      m_eq,
    }
  }

  fn project(&self, v: &mut DVector<f64>) {
    for i in 0..v.len() {
      v[i] = v[i].clamp(self.lo[i], self.hi[i]);
    }
  }
}

fn inf_norm(v: &DVector<f64>) -> f64 {
  if v.is_empty() {
    0.0
  } else {
    v.amax()
  }
}

impl AdmmSolver {
  fn factor(
    &self,
    problem: &QuadraticProgram,
    stacked: &Stacked,
    rho: &DVector<f64>,
  ) -> Option<nalgebra::Cholesky<f64, nalgebra::Dyn>> {
    let n = problem.dim();
    let weighted = &stacked.ct * DMatrix::from_diagonal(rho);
    let kkt =
      &problem.hessian + DMatrix::<f64>::identity(n, n) * self.config.sigma + weighted * &stacked.c;
    kkt.cholesky()
  }

  /// Solve the equality-constrained problem on the free variables implied by the
  /// current active-set guess. Accepted only if primal and dual feasible.
  fn polish(
    &self,
    problem: &QuadraticProgram,
    stacked: &Stacked,
    z: &DVector<f64>,
    y: &DVector<f64>,
  ) -> Option<DVector<f64>> {
    let n = problem.dim();
    let m_eq = stacked.m_eq;

    let mut at_lower = vec![false; n];
    let mut at_upper = vec![false; n];
    for i in 0..n {
      let row = m_eq + i;
      if z[row] - problem.lower[i] < -y[row] {
        at_lower[i] = true;
      } else if problem.upper[i] - z[row] < y[row] {
        at_upper[i] = true;
      }
    }

    let free: Vec<usize> = (0..n).filter(|&i| !at_lower[i] && !at_upper[i]).collect();

    let mut x = DVector::<f64>::zeros(n);
    for i in 0..n {
      if at_lower[i] {
        x[i] = problem.lower[i];
      } else if at_upper[i] {
        x[i] = problem.upper[i];
      }
    }

    // A vertex has no free block to solve; fall back to the ADMM equality multipliers.
    let (nu, dual_tol_scale) = if free.is_empty() {
      (y.rows(0, m_eq).into_owned(), VERTEX_DUAL_TOL)
    } else {
      let nf = free.len();
      let size = nf + m_eq;
      let mut kkt = DMatrix::<f64>::zeros(size, size);
      let mut rhs = DVector::<f64>::zeros(size);
      for (a, &i) in free.iter().enumerate() {
        for (b, &j) in free.iter().enumerate() {
          kkt[(a, b)] = problem.hessian[(i, j)];
        }
        for k in 0..m_eq {
          kkt[(a, nf + k)] = problem.eq_matrix[(k, i)];
          kkt[(nf + k, a)] = problem.eq_matrix[(k, i)];
        }
        rhs[a] = -(0..n)
          .filter(|&j| at_lower[j] || at_upper[j])
          .map(|j| problem.hessian[(i, j)] * x[j])
          .sum::<f64>();
      }
      for k in 0..m_eq {
        rhs[nf + k] = problem.eq_rhs[k]
          - (0..n)
            .filter(|&j| at_lower[j] || at_upper[j])
            .map(|j| problem.eq_matrix[(k, j)] * x[j])
            .sum::<f64>();
      }

      let sol = kkt.lu().solve(&rhs)?;
      if sol.iter().any(|v| !v.is_finite()) {
        return None;
      }
      for (a, &i) in free.iter().enumerate() {
        x[i] = sol[a];
      }
      (sol.rows(nf, m_eq).into_owned(), POLISH_DUAL_TOL)
    };

    for &i in &free {
      if x[i] < problem.lower[i] - POLISH_TOL || x[i] > problem.upper[i] + POLISH_TOL {
        return None;
      }
      x[i] = x[i].clamp(problem.lower[i], problem.upper[i]);
    }

    let eq_scale = 1.0 + inf_norm(&problem.eq_rhs);
    let eq_res = &problem.eq_matrix * &x - &problem.eq_rhs;
    if inf_norm(&eq_res) > POLISH_TOL * eq_scale {
      return None;
    }

    // Bound multipliers are -(Px + A'nu) and must point outward at active bounds.
    let grad = &problem.hessian * &x + problem.eq_matrix.transpose() * &nu;
    let dual_tol = dual_tol_scale * (1.0 + inf_norm(&grad));
    for i in 0..n {
      let ok = if at_lower[i] {
        grad[i] >= -dual_tol
      } else if at_upper[i] {
        grad[i] <= dual_tol
      } else {
        grad[i].abs() <= dual_tol
      };
      if !ok {
        return None;
      }
    }

    Some(x)
  }
}

impl QuadraticSolver for AdmmSolver {
  fn solve(&self, problem: &QuadraticProgram) -> Result<Solution, PortfolioError> {
    problem.validate()?;
    let cfg = &self.config;
    let stacked = Stacked::new(problem);
    let rows = stacked.c.nrows();

    let mut rho = DVector::from_fn(rows, |i, _| {
      if i < stacked.m_eq {
        cfg.rho * EQ_RHO_SCALE
      } else {
        cfg.rho
      }
    });
    let Some(mut chol) = self.factor(problem, &stacked, &rho) else {
      return Ok(Solution {
        x: problem.x0.clone(),
        status: SolveStatus::NumericalFailure,
        iterations: 0,
        primal_residual: f64::NAN,
        dual_residual: f64::NAN,
        polished: false,
      });
    };

    let mut x = problem.x0.clone();
    let mut z = &stacked.c * &x;
    stacked.project(&mut z);
    let mut y = DVector::<f64>::zeros(rows);

    let mut converged = false;
    let mut iterations = 0;
    let mut r_prim = f64::INFINITY;
    let mut r_dual = f64::INFINITY;

    for iter in 1..=cfg.max_iters {
      iterations = iter;

      let rhs = &x * cfg.sigma + &stacked.ct * (rho.component_mul(&z) - &y);
      let x_tilde = chol.solve(&rhs);
      let z_tilde = &stacked.c * &x_tilde;

      let x_next = &x_tilde * cfg.alpha + &x * (1.0 - cfg.alpha);
      let z_relaxed = &z_tilde * cfg.alpha + &z * (1.0 - cfg.alpha);
      let mut z_next = &z_relaxed + y.component_div(&rho);
      stacked.project(&mut z_next);
      y += rho.component_mul(&(&z_relaxed - &z_next));
      x = x_next;
      z = z_next;

      let cx = &stacked.c * &x;
      let px = &problem.hessian * &x;
      let cty = &stacked.ct * &y;
      r_prim = inf_norm(&(&cx - &z));
      r_dual = inf_norm(&(&px + &cty));

      let prim_scale = inf_norm(&cx).max(inf_norm(&z));
      let dual_scale = inf_norm(&px).max(inf_norm(&cty));
      if r_prim <= cfg.eps_abs + cfg.eps_rel * prim_scale
        && r_dual <= cfg.eps_abs + cfg.eps_rel * dual_scale
      {
        converged = true;
        break;
      }

      let checkpoint = iter % cfg.adaptive_rho_interval.max(1) == 0;
      if cfg.polish
        && checkpoint
        && r_prim <= POLISH_TRIGGER * (1.0 + prim_scale)
        && r_dual <= POLISH_TRIGGER * (1.0 + dual_scale)
      {
        if let Some(polished) = self.polish(problem, &stacked, &z, &y) {
          return Ok(Solution {
            x: polished,
            status: SolveStatus::Converged,
            iterations,
            primal_residual: 0.0,
            dual_residual: 0.0,
            polished: true,
          });
        }
      }

      if cfg.adaptive_rho_interval > 0 && checkpoint {
        let prim = r_prim / prim_scale.max(1e-12);
        let dual = r_dual / dual_scale.max(1e-12);
        if prim > 0.0 && dual > 0.0 {
          let scale = (prim / dual).sqrt();
          if !(0.2..=5.0).contains(&scale) {
            rho
              .iter_mut()
              .for_each(|r| *r = (*r * scale).clamp(RHO_MIN, RHO_MAX * EQ_RHO_SCALE));
            match self.factor(problem, &stacked, &rho) {
              Some(next) => chol = next,
              None => {
                return Ok(Solution {
                  x,
                  status: SolveStatus::NumericalFailure,
                  iterations,
                  primal_residual: r_prim,
                  dual_residual: r_dual,
                  polished: false,
                })
              }
            }
          }
        }
      }
    }

    if cfg.polish {
      if let Some(polished) = self.polish(problem, &stacked, &z, &y) {
        if !converged {
          debug!(iterations, r_prim, r_dual, "polish recovered an unconverged solve");
        }
        return Ok(Solution {
          x: polished,
          status: SolveStatus::Converged,
          iterations,
          primal_residual: 0.0,
          dual_residual: 0.0,
          polished: true,
        });
      }
    }

    for i in 0..x.len() {
      x[i] = x[i].clamp(problem.lower[i], problem.upper[i]);
    }

    Ok(Solution {
      x,
      status: if converged {
        SolveStatus::Converged
      } else {
        SolveStatus::MaxIterationsReached
      },
      iterations,
      primal_residual: r_prim,
      dual_residual: r_dual,
      polished: false,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn budget_problem(p: DMatrix<f64>, lower: f64, upper: f64) -> QuadraticProgram {
    let n = p.nrows();
    QuadraticProgram {
      hessian: p,
      eq_matrix: DMatrix::from_element(1, n, 1.0),
      eq_rhs: DVector::from_element(1, 1.0),
      lower: DVector::from_element(n, lower),
      upper: DVector::from_element(n, upper),
      x0: DVector::from_element(n, 1.0 / n as f64),
    }
  }

  #[test]
  fn diagonal_budget_problem_matches_closed_form() {
    let p = DMatrix::from_diagonal(&DVector::from_vec(vec![2.0, 8.0]));
    let solution = AdmmSolver::default()
      .solve(&budget_problem(p, 0.0, 1.0))
      .unwrap();

    assert!(solution.is_converged());
    assert!((solution.x[0] - 0.8).abs() < 1e-8);
    assert!((solution.x[1] - 0.2).abs() < 1e-8);
  }

  #[test]
  fn active_bound_is_respected_exactly() {
    // Unconstrained budget optimum would short the second asset.
    let p = DMatrix::from_row_slice(2, 2, &[2.0, 3.0, 3.0, 8.0]);
    let solution = AdmmSolver::default()
      .solve(&budget_problem(p, 0.0, 1.0))
      .unwrap();

    assert!(solution.is_converged());
    assert!(solution.x.iter().all(|&v| (0.0..=1.0).contains(&v)));
    assert!((solution.x[0] - 1.0).abs() < 1e-8);
    assert!((solution.x.sum() - 1.0).abs() < 1e-8);
  }

  #[test]
  fn iteration_cap_is_reported_not_hidden() {
    let solver = AdmmSolver::new(AdmmConfig {
      max_iters: 1,
      polish: false,
      ..AdmmConfig::default()
    })
    .unwrap();
    let p = DMatrix::from_row_slice(3, 3, &[0.08, 0.01, 0.0, 0.01, 0.18, 0.02, 0.0, 0.02, 0.02]);
    let solution = solver.solve(&budget_problem(p, 0.0, 1.0)).unwrap();

    assert_eq!(solution.status, SolveStatus::MaxIterationsReached);
    assert!(!solution.polished);
    assert!(matches!(
      solution.into_result(),
      Err(PortfolioError::SolverNonConvergence { iterations: 1, .. })
    ));
  }

  #[test]
  fn invalid_config_is_rejected() {
    let err = AdmmSolver::new(AdmmConfig {
      alpha: 2.5,
      ..AdmmConfig::default()
    })
    .unwrap_err();
    assert!(matches!(err, PortfolioError::InvalidConfiguration(_)));
  }

  #[test]
  fn mismatched_bounds_are_a_shape_error() {
    let mut problem = budget_problem(DMatrix::identity(2, 2), 0.0, 1.0);
    problem.upper = DVector::from_element(3, 1.0);

    assert!(matches!(
      AdmmSolver::default().solve(&problem),
      Err(PortfolioError::DataShapeMismatch { .. })
    ));
  }
}
