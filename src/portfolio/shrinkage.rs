//! # Shrinkage Estimator
//!
//! $$
//! \hat\mu_{\text{shrunk}}=(1-\lambda)\,\hat\mu+\lambda\,\frac{\hat\mu}{2.2},\qquad
//! \Sigma_{\text{unc}}=\frac{\hat\Sigma}{T}
//! $$
//!
//! Pulls sample means toward a de-extremized target and sizes the uncertainty of the mean.

use ndarray::Array1;
use ndarray::Array2;

use super::data::sample_covariance;
use super::data::sample_mean;
use super::error::PortfolioError;

/// Divisor turning sample means into the shrinkage target.
pub const DE_EXTREMIZATION: f64 = 2.2;

/// Moments produced by [`ShrinkageEstimator::estimate`].
#[derive(Clone, Debug)]
pub struct ShrinkageEstimate {
  pub sample_mean: Array1<f64>,
  pub target_mean: Array1<f64>,
  pub shrunk_mean: Array1<f64>,
  pub sample_covariance: Array2<f64>,
  /// Covariance of the estimated mean, `sample_covariance / T`.
  pub uncertainty_covariance: Array2<f64>,
  pub observations: usize,
}

/// Linear shrinkage of expected returns toward `mean / 2.2`.
#[derive(Clone, Copy, Debug)]
pub struct ShrinkageEstimator {
  intensity: f64,
}

impl ShrinkageEstimator {
  /// `intensity` must lie in `[0, 1]`.
  pub fn new(intensity: f64) -> Result<Self, PortfolioError> {
    if !(0.0..=1.0).contains(&intensity) {
      return Err(PortfolioError::InvalidConfiguration(format!(
        "shrinkage intensity must lie in [0, 1], got {intensity}"
      )));
    }
    Ok(Self { intensity })
  }

  pub fn intensity(&self) -> f64 {
    self.intensity
  }

  /// Shrink a mean vector without touching second moments.
  pub fn shrink(&self, mean: &Array1<f64>) -> Array1<f64> {
    let target = mean / DE_EXTREMIZATION;
    mean * (1.0 - self.intensity) + &target * self.intensity
  }

  /// Estimate from an `(assets, observations)` panel of yearly returns.
  pub fn estimate(&self, panel: &Array2<f64>) -> Result<ShrinkageEstimate, PortfolioError> {
    let observations = panel.ncols();
    let sample_covariance = sample_covariance(panel)?;
    let sample_mean = sample_mean(panel)?;

    let target_mean = &sample_mean / DE_EXTREMIZATION;
    let shrunk_mean = self.shrink(&sample_mean);
    let uncertainty_covariance = &sample_covariance / observations as f64;

    Ok(ShrinkageEstimate {
      sample_mean,
      target_mean,
      shrunk_mean,
      sample_covariance,
      uncertainty_covariance,
      observations,
    })
  }
}
