//! # Portfolio Engine
//!
//! $$
//! \mathbf{w}^\* = \operatorname{Optimize}(\mu, \Sigma, \text{strategy})
//! $$
//!
//! Strategy dispatch over lazily loaded market inputs.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use super::data::MarketInputs;
use super::data::ReturnLoader;
use super::error::PortfolioError;
use super::frontier::efficient_frontier;
use super::optimizers::portfolio_return;
use super::optimizers::MinVarianceOptimizer;
use super::resampling::resample_frontier;
use super::resampling::ResamplingConfig;
use super::resampling::ResamplingControl;
use super::shrinkage::ShrinkageEstimator;
use super::solver::AdmmSolver;
use super::solver::QuadraticSolver;
use super::types::Algorithm;
use super::types::FrontierPoint;
use super::types::MetadataValue;
use super::types::OptimizationResult;
use super::types::WeightBounds;

/// Runtime configuration shared by every strategy.
#[derive(Clone, Debug)]
pub struct OptimizerConfig {
  /// Allow weights in `[-1, 1]` instead of `[0, 1]`.
  pub allow_short: bool,
  /// Label of the historical window the loader covers.
  pub period: String,
}

impl Default for OptimizerConfig {
  fn default() -> Self {
    Self {
      allow_short: false,
      period: "10y".into(),
    }
  }
}

/// Allocation strategy with its own parameters.
#[derive(Clone, Debug)]
pub enum Strategy {
  /// Deterministic frontier from sample moments.
  MeanVariance { num_portfolios: usize },
  /// Global minimum-variance portfolio.
  MinimumVariance,
  /// Frontier averaged over resampled shrunk means.
  MonteCarloResampling(ResamplingConfig),
  /// Tangency portfolio against `risk_free`.
  MaximumSharpe { risk_free: f64 },
}

impl Strategy {
  pub fn algorithm(&self) -> Algorithm {
    match self {
      Self::MeanVariance { .. } => Algorithm::MeanVariance,
      Self::MinimumVariance => Algorithm::MinimumVariance,
      Self::MonteCarloResampling(_) => Algorithm::MonteCarloResampling,
      Self::MaximumSharpe { .. } => Algorithm::MaximumSharpe,
    }
  }

  fn validate(&self) -> Result<(), PortfolioError> {
    match self {
      Self::MeanVariance { num_portfolios } if *num_portfolios < 1 => Err(
        PortfolioError::InvalidConfiguration("num_portfolios must be >= 1".into()),
      ),
      Self::MonteCarloResampling(config) => config.validate(),
      Self::MaximumSharpe { risk_free } if !risk_free.is_finite() => {
        Err(PortfolioError::InvalidConfiguration(format!(
          "risk-free rate must be finite, got {risk_free}"
        )))
      }
      _ => Ok(()),
    }
  }
}

/// Runs strategies over data supplied by an injected [`ReturnLoader`].
///
/// The loader is called at most once, even under concurrent first use; moments
/// are derived on the first optimization and reused afterwards. A failed load is
/// not cached.
pub struct PortfolioOptimizer<L, S = AdmmSolver> {
  loader: L,
  config: OptimizerConfig,
  optimizer: MinVarianceOptimizer<S>,
  inputs: OnceLock<MarketInputs>,
  loading: Mutex<()>,
}

impl<L: ReturnLoader> PortfolioOptimizer<L, AdmmSolver> {
  pub fn new(loader: L, config: OptimizerConfig) -> Self {
    Self::with_solver(loader, config, AdmmSolver::default())
  }
}

impl<L: ReturnLoader, S: QuadraticSolver> PortfolioOptimizer<L, S> {
  /// Use a custom QP backend.
  pub fn with_solver(loader: L, config: OptimizerConfig, solver: S) -> Self {
    let bounds = WeightBounds::from_allow_short(config.allow_short);
    Self {
      loader,
      config,
      optimizer: MinVarianceOptimizer::with_solver(solver, bounds),
      inputs: OnceLock::new(),
      loading: Mutex::new(()),
    }
  }

  pub fn config(&self) -> &OptimizerConfig {
    &self.config
  }

  /// Market inputs, loading them on first use.
  pub fn load(&self) -> Result<&MarketInputs, PortfolioError> {
    if let Some(inputs) = self.inputs.get() {
      return Ok(inputs);
    }

    let _guard = self.loading.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(inputs) = self.inputs.get() {
      return Ok(inputs);
    }
    let data = self.loader.load()?;
    let inputs = data.inputs()?;
    info!(
      assets = inputs.universe.len(),
      years = inputs.observations(),
      period = %self.config.period,
      "market data loaded"
    );
    Ok(self.inputs.get_or_init(|| inputs))
  }

  pub fn optimize(&self, strategy: &Strategy) -> Result<OptimizationResult, PortfolioError> {
    self.optimize_with_control(strategy, &ResamplingControl::new())
  }

  /// Run `strategy`; `control` is only consulted by the resampling strategy.
  pub fn optimize_with_control(
    &self,
    strategy: &Strategy,
    control: &ResamplingControl,
  ) -> Result<OptimizationResult, PortfolioError> {
    strategy.validate()?;
    let inputs = self.load()?;
    let algorithm = strategy.algorithm();
    let bounds = self.optimizer.bounds();
    info!(
      algorithm = %algorithm,
      assets = inputs.universe.len(),
      allow_short = bounds.allows_short(),
      "running optimization"
    );

    let mut metadata = BTreeMap::new();
    metadata.insert(
      "historical_returns".to_string(),
      MetadataValue::Vector(inputs.historical_returns.clone()),
    );
    metadata.insert(
      "period".to_string(),
      MetadataValue::Text(self.config.period.clone()),
    );
    metadata.insert(
      "allow_short".to_string(),
      MetadataValue::Flag(bounds.allows_short()),
    );

    let cov = &inputs.covariance;
    let points = match strategy {
      Strategy::MeanVariance { num_portfolios } => {
        metadata.insert(
          "num_portfolios".to_string(),
          MetadataValue::Count(*num_portfolios),
        );
        efficient_frontier(&self.optimizer, &inputs.historical_returns, cov, *num_portfolios)?
      }
      Strategy::MinimumVariance => {
        let weights = self.optimizer.global_minimum_variance(cov)?;
        let expected = portfolio_return(&weights, &inputs.historical_returns);
        metadata.insert("expected_return".to_string(), MetadataValue::Scalar(expected));
        vec![FrontierPoint::new(expected, weights, cov)]
      }
      Strategy::MonteCarloResampling(config) => {
        let shrinkage = ShrinkageEstimator::new(config.shrinkage_intensity)?;
        let estimate = shrinkage.estimate(&inputs.yearly)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let resampled = resample_frontier(
          &self.optimizer,
          &estimate.shrunk_mean,
          &estimate.uncertainty_covariance,
          cov,
          config,
          control,
          &mut rng,
        )?;

        let entries = [
          ("shrunk_returns", MetadataValue::Vector(estimate.shrunk_mean)),
          (
            "estimation_uncertainty",
            MetadataValue::Matrix(estimate.uncertainty_covariance),
          ),
          (
            "shrinkage_intensity",
            MetadataValue::Scalar(shrinkage.intensity()),
          ),
          ("num_simulations", MetadataValue::Count(config.num_simulations)),
          ("completed_draws", MetadataValue::Count(resampled.completed_draws)),
          ("infeasible_solves", MetadataValue::Count(resampled.infeasible_solves)),
          (
            "nonconverged_solves",
            MetadataValue::Count(resampled.nonconverged_solves),
          ),
          ("aborted", MetadataValue::Flag(resampled.aborted)),
          (
            "valid_draws_per_level",
            MetadataValue::Counts(resampled.valid_draws),
          ),
        ];
        for (key, value) in entries {
          metadata.insert(key.to_string(), value);
        }
        resampled.points
      }
      Strategy::MaximumSharpe { risk_free } => {
        let tangency = self
          .optimizer
          .maximum_sharpe(cov, &inputs.historical_returns, *risk_free)?;
        metadata.insert("sharpe_ratio".to_string(), MetadataValue::Scalar(tangency.sharpe));
        metadata.insert("risk_free".to_string(), MetadataValue::Scalar(*risk_free));
        metadata.insert(
          "expected_return".to_string(),
          MetadataValue::Scalar(tangency.expected_return),
        );
        vec![FrontierPoint::new(tangency.target_return, tangency.weights, cov)]
      }
    };

    info!(algorithm = %algorithm, points = points.len(), "optimization finished");
    Ok(OptimizationResult {
      universe: inputs.universe.clone(),
      covariance: cov.clone(),
      algorithm,
      points,
      metadata,
    })
  }
}
