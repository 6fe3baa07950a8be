//! # Portfolio Types
//!
//! $$
//! \sigma_p=\sqrt{\mathbf{w}^\top \Sigma \mathbf{w}},\qquad \sum_i w_i = 1
//! $$
//!
//! Shared enums and result containers for portfolio optimization.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt::Display;
use std::str::FromStr;

use ndarray::Array1;
use ndarray::Array2;

use super::error::PortfolioError;
use super::optimizers::portfolio_volatility;

/// Ordered set of asset identifiers for one optimization run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetUniverse {
  ids: Vec<String>,
}

impl AssetUniverse {
  /// Build a universe, rejecting empty lists and duplicate identifiers.
  pub fn new<I, T>(ids: I) -> Result<Self, PortfolioError>
  where
    I: IntoIterator<Item = T>,
    T: Into<String>,
  {
    let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
    if ids.is_empty() {
      return Err(PortfolioError::InvalidConfiguration(
        "asset universe is empty".into(),
      ));
    }

    let mut seen = HashSet::with_capacity(ids.len());
    for id in &ids {
      if !seen.insert(id.as_str()) {
        return Err(PortfolioError::InvalidConfiguration(format!(
          "duplicate asset identifier '{id}'"
        )));
      }
    }

    Ok(Self { ids })
  }

  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  pub fn ids(&self) -> &[String] {
    &self.ids
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.ids.iter().map(String::as_str)
  }

  pub fn index_of(&self, id: &str) -> Option<usize> {
    self.ids.iter().position(|x| x == id)
  }
}

/// Per-asset box constraint applied to every weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WeightBounds {
  pub lower: f64,
  pub upper: f64,
}

impl WeightBounds {
  /// `[0, 1]` for every asset.
  pub fn long_only() -> Self {
    Self {
      lower: 0.0,
      upper: 1.0,
    }
  }

  /// `[-1, 1]` for every asset.
  pub fn long_short() -> Self {
    Self {
      lower: -1.0,
      upper: 1.0,
    }
  }

  pub fn from_allow_short(allow_short: bool) -> Self {
    if allow_short {
      Self::long_short()
    } else {
      Self::long_only()
    }
  }

  pub fn allows_short(&self) -> bool {
    self.lower < 0.0
  }

  /// Whether every component of `weights` lies inside the box.
  pub fn contains(&self, weights: &Array1<f64>) -> bool {
    weights
      .iter()
      .all(|&w| w >= self.lower && w <= self.upper)
  }
}

impl Default for WeightBounds {
  fn default() -> Self {
    Self::long_only()
  }
}

/// One portfolio on a frontier.
#[derive(Clone, Debug)]
pub struct FrontierPoint {
  /// Target return of the solve. For the minimum-variance portfolio this is the
  /// informational return under historical averages.
  pub target_return: f64,
  /// Portfolio weights, summing to one.
  pub weights: Array1<f64>,
  /// `sqrt(w' Sigma w)` of `weights` against the pricing covariance.
  pub volatility: f64,
}

impl FrontierPoint {
  /// Build a point, deriving volatility from `weights` and `cov`.
  pub fn new(target_return: f64, weights: Array1<f64>, cov: &Array2<f64>) -> Self {
    let volatility = portfolio_volatility(&weights, cov);
    Self {
      target_return,
      weights,
      volatility,
    }
  }
}

/// Supported allocation algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Algorithm {
  /// Deterministic frontier from raw sample moments.
  MeanVariance,
  /// Global minimum-variance portfolio.
  MinimumVariance,
  /// Resampled frontier over shrunk, perturbed expected returns.
  MonteCarloResampling,
  /// Tangency portfolio maximizing the Sharpe ratio.
  MaximumSharpe,
}

impl Algorithm {
  pub const ALL: [Algorithm; 4] = [
    Algorithm::MeanVariance,
    Algorithm::MonteCarloResampling,
    Algorithm::MinimumVariance,
    Algorithm::MaximumSharpe,
  ];

  /// Stable identifier used in results and configuration.
  pub fn id(&self) -> &'static str {
    match self {
      Self::MeanVariance => "mean_variance",
      Self::MinimumVariance => "minimum_variance",
      Self::MonteCarloResampling => "monte_carlo_resampling",
      Self::MaximumSharpe => "maximum_sharpe",
    }
  }

  pub fn description(&self) -> &'static str {
    match self {
      Self::MeanVariance => "Classic Markowitz mean-variance efficient frontier",
      Self::MinimumVariance => "Minimum Variance portfolio optimization",
      Self::MonteCarloResampling => "Resampled efficient frontier with estimation uncertainty",
      Self::MaximumSharpe => "Maximum Sharpe ratio (tangency) portfolio",
    }
  }

  /// Identifiers of every registered algorithm.
  pub fn list() -> Vec<&'static str> {
    Self::ALL.iter().map(Algorithm::id).collect()
  }
}

impl FromStr for Algorithm {
  type Err = PortfolioError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().replace('-', "_").as_str() {
      "mean_variance" | "markowitz" | "mv" => Ok(Self::MeanVariance),
      "minimum_variance" | "min_variance" | "gmv" => Ok(Self::MinimumVariance),
      "monte_carlo_resampling" | "monte_carlo" | "resampling" | "mc" => {
        Ok(Self::MonteCarloResampling)
      }
      "maximum_sharpe" | "max_sharpe" | "tangency" => Ok(Self::MaximumSharpe),
      other => Err(PortfolioError::InvalidConfiguration(format!(
        "unknown algorithm '{other}'. Available: {}",
        Self::list().join(", ")
      ))),
    }
  }
}

impl Display for Algorithm {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.id())
  }
}

/// Algorithm-specific side output attached to a result.
#[derive(Clone, Debug, PartialEq)]
pub enum MetadataValue {
  Scalar(f64),
  Count(usize),
  Counts(Vec<usize>),
  Flag(bool),
  Text(String),
  Vector(Array1<f64>),
  Matrix(Array2<f64>),
}

impl Display for MetadataValue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Scalar(v) => write!(f, "{v:.6}"),
      Self::Count(v) => write!(f, "{v}"),
      Self::Counts(v) => write!(f, "{v:?}"),
      Self::Flag(v) => write!(f, "{v}"),
      Self::Text(v) => write!(f, "{v}"),
      Self::Vector(v) => {
        let parts: Vec<String> = v.iter().map(|x| format!("{x:.4}")).collect();
        write!(f, "[{}]", parts.join(", "))
      }
      Self::Matrix(m) => write!(f, "{}x{} matrix", m.nrows(), m.ncols()),
    }
  }
}

/// Terminal artifact of one optimization run.
#[derive(Clone, Debug)]
pub struct OptimizationResult {
  pub universe: AssetUniverse,
  /// Pricing covariance used to compute every volatility.
  pub covariance: Array2<f64>,
  pub algorithm: Algorithm,
  /// Points in ascending target-return order.
  pub points: Vec<FrontierPoint>,
  pub metadata: BTreeMap<String, MetadataValue>,
}

impl OptimizationResult {
  pub fn algorithm_id(&self) -> &'static str {
    self.algorithm.id()
  }

  /// Weights stacked as a `(points, assets)` matrix.
  pub fn weights_matrix(&self) -> Array2<f64> {
    let n = self.universe.len();
    let mut out = Array2::<f64>::zeros((self.points.len(), n));
    for (i, point) in self.points.iter().enumerate() {
      out.row_mut(i).assign(&point.weights);
    }
    out
  }

  pub fn target_returns(&self) -> Array1<f64> {
    self.points.iter().map(|p| p.target_return).collect()
  }

  pub fn volatilities(&self) -> Array1<f64> {
    self.points.iter().map(|p| p.volatility).collect()
  }

  pub fn metadata(&self, key: &str) -> Option<&MetadataValue> {
    self.metadata.get(key)
  }
}
