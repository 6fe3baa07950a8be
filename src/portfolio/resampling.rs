//! # Resampled Efficient Frontier
//!
//! $$
//! \boldsymbol\mu_s\sim\mathcal N\!\left(\hat{\boldsymbol\mu}_{\text{shrunk}},\ \hat\Sigma/T\right),\qquad
//! \bar{\mathbf w}_k=\frac{1}{|S_k|}\sum_{s\in S_k}\mathbf w_k(\boldsymbol\mu_s)
//! $$
//!
//! Monte Carlo resampling of the frontier over parameter uncertainty in the mean.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use indicatif::ProgressBar;
use nalgebra::DMatrix;
use nalgebra::SymmetricEigen;
use ndarray::Array1;
use ndarray::Array2;
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::error::PortfolioError;
use super::frontier::frontier_weights;
use super::frontier::target_returns;
use super::optimizers::check_covariance;
use super::optimizers::MinVarianceOptimizer;
use super::solver::QuadraticSolver;
use super::types::FrontierPoint;

const PROGRESS_LOG_INTERVAL: usize = 100;
const PSD_TOLERANCE: f64 = 1e-10;

/// Joint normal sampler `mean + L z` with `L L' = cov`.
#[derive(Clone, Debug)]
pub struct MultivariateNormal {
  mean: Array1<f64>,
  factor: Array2<f64>,
}

impl MultivariateNormal {
  /// Factor `cov` by Cholesky, falling back to a clipped eigen-decomposition for
  /// singular but positive semi-definite input.
  pub fn new(mean: Array1<f64>, cov: &Array2<f64>) -> Result<Self, PortfolioError> {
    let n = check_covariance(cov)?;
    if mean.len() != n {
      return Err(PortfolioError::shape("sampling mean", n, mean.len()));
    }

    let sigma = DMatrix::from_fn(n, n, |i, j| cov[[i, j]]);
    let l = match sigma.clone().cholesky() {
      Some(chol) => chol.l(),
      None => psd_factor(sigma)?,
    };

    Ok(Self {
      mean,
      factor: Array2::from_shape_fn((n, n), |(i, j)| l[(i, j)]),
    })
  }

  pub fn dim(&self) -> usize {
    self.mean.len()
  }

  pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Array1<f64> {
    let z: Array1<f64> = (0..self.dim()).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
    &self.mean + &self.factor.dot(&z)
  }
}

fn psd_factor(sigma: DMatrix<f64>) -> Result<DMatrix<f64>, PortfolioError> {
  let scale = sigma.amax().max(1.0);
  let eig = SymmetricEigen::new(sigma);
  if let Some(min) = eig.eigenvalues.iter().copied().reduce(f64::min) {
    if min < -PSD_TOLERANCE * scale {
      return Err(PortfolioError::InvalidCovariance(format!(
        "not positive semi-definite (smallest eigenvalue {min:.3e})"
      )));
    }
  }

  let mut factor = eig.eigenvectors;
  for (j, lambda) in eig.eigenvalues.iter().enumerate() {
    let s = lambda.max(0.0).sqrt();
    factor.column_mut(j).scale_mut(s);
  }
  Ok(factor)
}

/// How failed per-draw solves are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum FailurePolicy {
  /// Drop failed solves from each level's average and report the counts.
  #[default]
  Exclude,
  /// Abort with `ExcessiveFailures` when the failed share of solves exceeds the rate.
  FailAbove(f64),
}

#[derive(Clone, Debug)]
pub struct ResamplingConfig {
  /// Number of target-return levels `K`.
  pub num_portfolios: usize,
  /// Number of Monte Carlo draws `S`.
  pub num_simulations: usize,
  /// Shrinkage intensity applied to the sample mean before sampling.
  pub shrinkage_intensity: f64,
  pub seed: u64,
  pub failure_policy: FailurePolicy,
}

impl Default for ResamplingConfig {
  fn default() -> Self {
    Self {
      num_portfolios: 10,
      num_simulations: 500,
      shrinkage_intensity: 0.7,
      seed: 42,
      failure_policy: FailurePolicy::Exclude,
    }
  }
}

impl ResamplingConfig {
  pub fn validate(&self) -> Result<(), PortfolioError> {
    if self.num_portfolios < 1 {
      return Err(PortfolioError::InvalidConfiguration(
        "num_portfolios must be >= 1".into(),
      ));
    }
    if self.num_simulations < 1 {
      return Err(PortfolioError::InvalidConfiguration(
        "num_simulations must be >= 1".into(),
      ));
    }
    if !(0.0..=1.0).contains(&self.shrinkage_intensity) {
      return Err(PortfolioError::InvalidConfiguration(format!(
        "shrinkage intensity must lie in [0, 1], got {}",
        self.shrinkage_intensity
      )));
    }
    if let FailurePolicy::FailAbove(rate) = self.failure_policy {
      if !(0.0..=1.0).contains(&rate) {
        return Err(PortfolioError::InvalidConfiguration(format!(
          "failure rate threshold must lie in [0, 1], got {rate}"
        )));
      }
    }
    Ok(())
  }
}

/// Cancellation flag and optional progress bar shared with a running batch.
#[derive(Clone, Default)]
pub struct ResamplingControl {
  cancelled: Arc<AtomicBool>,
  progress: Option<ProgressBar>,
}

impl std::fmt::Debug for ResamplingControl {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ResamplingControl")
      .field("cancelled", &self.is_cancelled())
      .field("progress", &self.progress.is_some())
      .finish()
  }
}

impl ResamplingControl {
  pub fn new() -> Self {
    Self::default()
  }

  /// Advance `progress` by one per completed draw.
  pub fn with_progress(mut self, progress: ProgressBar) -> Self {
    self.progress = Some(progress);
    self
  }

  /// Request an early stop. Draws still in flight are discarded.
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }

  /// Handle to the flag, e.g. for a signal handler.
  pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.cancelled)
  }
}

/// Averaged frontier with per-level and per-batch bookkeeping.
#[derive(Clone, Debug)]
pub struct ResampledFrontier {
  /// One point per level, volatility taken from the averaged weights. Empty if no
  /// draw completed.
  pub points: Vec<FrontierPoint>,
  /// Successful draws contributing to each level.
  pub valid_draws: Vec<usize>,
  pub requested_draws: usize,
  pub completed_draws: usize,
  pub infeasible_solves: usize,
  pub nonconverged_solves: usize,
  pub aborted: bool,
}

impl ResampledFrontier {
  pub fn failed_solves(&self) -> usize {
    self.infeasible_solves + self.nonconverged_solves
  }
}

/// Resample the efficient frontier.
///
/// All draws are taken from `rng` up front, so the result does not depend on the
/// size of the rayon pool. Each draw solves the shared target grid, derived from
/// `shrunk_mean`, against `pricing_cov`; a level whose target falls outside the
/// draw's own return range counts as an infeasible solve.
pub fn resample_frontier<S, R>(
  optimizer: &MinVarianceOptimizer<S>,
  shrunk_mean: &Array1<f64>,
  uncertainty: &Array2<f64>,
  pricing_cov: &Array2<f64>,
  config: &ResamplingConfig,
  control: &ResamplingControl,
  rng: &mut R,
) -> Result<ResampledFrontier, PortfolioError>
where
  S: QuadraticSolver,
  R: Rng + ?Sized,
{
  config.validate()?;
  let n = check_covariance(pricing_cov)?;
  if shrunk_mean.len() != n {
    return Err(PortfolioError::shape("shrunk expected returns", n, shrunk_mean.len()));
  }
  if uncertainty.dim() != (n, n) {
    return Err(PortfolioError::shape(
      "estimation uncertainty covariance",
      n,
      uncertainty.nrows(),
    ));
  }

  let targets = target_returns(shrunk_mean, config.num_portfolios)?;
  let mvn = MultivariateNormal::new(shrunk_mean.clone(), uncertainty)?;
  let draws: Vec<Array1<f64>> = (0..config.num_simulations)
    .map(|_| mvn.sample(&mut *rng))
    .collect();

  let k = targets.len();
  let total = draws.len();
  let completed = AtomicUsize::new(0);

  let outcomes: Vec<Option<Vec<Result<Array1<f64>, PortfolioError>>>> = draws
    .par_iter()
    .map(|mu_s| {
      if control.is_cancelled() {
        return None;
      }
      let levels = frontier_weights(optimizer, mu_s, pricing_cov, &targets);
      if control.is_cancelled() {
        return None;
      }

      let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
      if done % PROGRESS_LOG_INTERVAL == 0 {
        debug!(completed = done, total, "resampling progress");
      }
      if let Some(pb) = &control.progress {
        pb.inc(1);
      }
      Some(levels)
    })
    .collect();

  let mut sums = vec![Array1::<f64>::zeros(n); k];
  let mut valid_draws = vec![0usize; k];
  let mut completed_draws = 0;
  let mut infeasible_solves = 0;
  let mut nonconverged_solves = 0;

  for levels in outcomes.into_iter().flatten() {
    completed_draws += 1;
    for (level, outcome) in levels.into_iter().enumerate() {
      match outcome {
        Ok(w) => {
          sums[level] += &w;
          valid_draws[level] += 1;
        }
        Err(PortfolioError::InfeasibleTarget { .. }) => infeasible_solves += 1,
        Err(err) if err.is_solve_failure() => nonconverged_solves += 1,
        Err(err) => return Err(err),
      }
    }
  }

  let aborted = control.is_cancelled() && completed_draws < total;
  if let Some(pb) = &control.progress {
    if aborted {
      pb.abandon();
    } else {
      pb.finish();
    }
  }

  let failed = infeasible_solves + nonconverged_solves;
  let attempted = completed_draws * k;
  if aborted {
    info!(
      completed = completed_draws,
      requested = total,
      "resampling cancelled, returning partial average"
    );
  }

  let mut points = Vec::with_capacity(k);
  if completed_draws > 0 {
    if let FailurePolicy::FailAbove(rate) = config.failure_policy {
      if failed as f64 > rate * attempted as f64 {
        return Err(PortfolioError::ExcessiveFailures {
          failed,
          total: attempted,
          level: None,
          threshold: Some(rate),
        });
      }
    }

    for (level, (sum, count)) in sums.into_iter().zip(&valid_draws).enumerate() {
      // Every completed draw attempts every level.
      if *count == 0 {
        return Err(PortfolioError::ExcessiveFailures {
          failed: completed_draws,
          total: completed_draws,
          level: Some(level),
          threshold: None,
        });
      }
      let weights = sum / *count as f64;
      points.push(FrontierPoint::new(targets[level], weights, pricing_cov));
    }
  }

  if failed > 0 {
    warn!(
      infeasible = infeasible_solves,
      nonconverged = nonconverged_solves,
      attempted,
      "excluded failed solves from resampled average"
    );
  }
  info!(
    draws = completed_draws,
    levels = k,
    "resampled frontier complete"
  );

  Ok(ResampledFrontier {
    points,
    valid_draws,
    requested_draws: total,
    completed_draws,
    infeasible_solves,
    nonconverged_solves,
    aborted,
  })
}
