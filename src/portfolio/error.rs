//! # Portfolio Errors
//!
//! Failure kinds shared by the optimizer, the frontier builder and the resampler.

use thiserror::Error;

/// Errors raised while estimating inputs or solving for portfolio weights.
#[derive(Error, Debug)]
pub enum PortfolioError {
  /// A run parameter is outside its admissible range.
  #[error("invalid configuration: {0}")]
  InvalidConfiguration(String),

  /// Covariance, expected-return and universe dimensions disagree.
  #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
  DataShapeMismatch {
    context: String,
    expected: usize,
    actual: usize,
  },

  /// Target return lies outside the attainable `[min(mu), max(mu)]` interval.
  #[error("target return {target} outside attainable range [{min}, {max}]")]
  InfeasibleTarget { target: f64, min: f64, max: f64 },

  /// The quadratic solver stopped before reaching its tolerances.
  #[error(
    "solver did not converge after {iterations} iterations (primal residual {primal_residual:.3e}, dual residual {dual_residual:.3e})"
  )]
  SolverNonConvergence {
    iterations: usize,
    primal_residual: f64,
    dual_residual: f64,
  },

  /// Too few observations to estimate second moments.
  #[error("insufficient history: need at least {required} observations, got {actual}")]
  InsufficientHistory { required: usize, actual: usize },

  /// Covariance matrix is not symmetric, has negative variances or is not PSD.
  #[error("invalid covariance matrix: {0}")]
  InvalidCovariance(String),

  /// Monte Carlo failures exceeded the batch-wide rate, or left a level without any
  /// successful draw. `level` is set in the second case, `threshold` in the first.
  #[error("{failed} of {total} resampled solves failed{}", failure_scope(.level, .threshold))]
  ExcessiveFailures {
    failed: usize,
    total: usize,
    level: Option<usize>,
    threshold: Option<f64>,
  },

  /// Linear-algebra or line-search breakdown outside the quadratic solver.
  #[error("numerical failure: {0}")]
  Numerical(String),

  /// Failure inside the injected data loader.
  #[error(transparent)]
  DataSource(#[from] anyhow::Error),
}

fn failure_scope(level: &Option<usize>, threshold: &Option<f64>) -> String {
  match (level, threshold) {
    (Some(level), _) => format!(" at frontier level {level}"),
    (None, Some(threshold)) => format!(" (threshold {threshold})"),
    (None, None) => String::new(),
  }
}

impl PortfolioError {
  pub(crate) fn shape(context: impl Into<String>, expected: usize, actual: usize) -> Self {
    Self::DataShapeMismatch {
      context: context.into(),
      expected,
      actual,
    }
  }

  /// Whether this error is a per-solve failure that a resampling batch may tolerate.
  pub fn is_solve_failure(&self) -> bool {
    matches!(
      self,
      Self::InfeasibleTarget { .. } | Self::SolverNonConvergence { .. } | Self::Numerical(_)
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn solve_failures_are_classified() {
    let infeasible = PortfolioError::InfeasibleTarget {
      target: 0.3,
      min: 0.05,
      max: 0.2,
    };
    let config = PortfolioError::InvalidConfiguration("num_simulations must be >= 1".into());

    assert!(infeasible.is_solve_failure());
    assert!(!config.is_solve_failure());
    assert!(infeasible.to_string().contains("0.3"));
  }

  #[test]
  fn excessive_failures_name_their_scope() {
    let level = PortfolioError::ExcessiveFailures {
      failed: 4,
      total: 4,
      level: Some(2),
      threshold: None,
    };
    let batch = PortfolioError::ExcessiveFailures {
      failed: 9,
      total: 30,
      level: None,
      threshold: Some(0.25),
    };

    assert_eq!(level.to_string(), "4 of 4 resampled solves failed at frontier level 2");
    assert_eq!(batch.to_string(), "9 of 30 resampled solves failed (threshold 0.25)");
  }
}
