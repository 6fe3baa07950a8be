//! # Efficient Frontier
//!
//! $$
//! r_k=\mu_{\min}+\frac{k}{K-1}\,(\mu_{\max}-\mu_{\min}),\qquad k=0,\dots,K-1
//! $$
//!
//! Target-return grid and the sweep of minimum-variance solves across it.

use ndarray::Array1;
use ndarray::Array2;
use tracing::debug;

use super::error::PortfolioError;
use super::optimizers::return_range;
use super::optimizers::MinVarianceOptimizer;
use super::solver::QuadraticSolver;
use super::types::FrontierPoint;

/// `k` target returns evenly spaced over `[min(mu), max(mu)]`, both ends included.
///
/// A single level sits at `min(mu)`.
pub fn target_returns(mu: &Array1<f64>, k: usize) -> Result<Vec<f64>, PortfolioError> {
  if k == 0 {
    return Err(PortfolioError::InvalidConfiguration(
      "number of frontier portfolios must be >= 1".into(),
    ));
  }
  if mu.is_empty() {
    return Err(PortfolioError::InvalidConfiguration(
      "expected returns are empty".into(),
    ));
  }

  let (min, max) = return_range(mu);
  if k == 1 {
    return Ok(vec![min]);
  }

  let step = (max - min) / (k - 1) as f64;
  let mut targets: Vec<f64> = (0..k).map(|i| min + step * i as f64).collect();
  targets[k - 1] = max;
  Ok(targets)
}

/// Weights for each target in `targets`, one independent result per level.
pub fn frontier_weights<S: QuadraticSolver>(
  optimizer: &MinVarianceOptimizer<S>,
  mu: &Array1<f64>,
  cov: &Array2<f64>,
  targets: &[f64],
) -> Vec<Result<Array1<f64>, PortfolioError>> {
  targets
    .iter()
    .map(|&target| optimizer.minimum_variance_for_target(cov, mu, target))
    .collect()
}

/// Build a `k`-point efficient frontier, stopping at the first failed level.
pub fn efficient_frontier<S: QuadraticSolver>(
  optimizer: &MinVarianceOptimizer<S>,
  mu: &Array1<f64>,
  cov: &Array2<f64>,
  k: usize,
) -> Result<Vec<FrontierPoint>, PortfolioError> {
  let targets = target_returns(mu, k)?;
  let mut points = Vec::with_capacity(k);
  for target in targets {
    let weights = optimizer.minimum_variance_for_target(cov, mu, target)?;
    points.push(FrontierPoint::new(target, weights, cov));
  }
  debug!(points = points.len(), "efficient frontier built");
  Ok(points)
}
