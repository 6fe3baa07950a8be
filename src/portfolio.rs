//! # Portfolio
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w}
//! $$
//!
//! Minimum-variance optimization, efficient frontiers and their resampled counterparts.

pub mod data;
pub mod engine;
pub mod error;
pub mod frontier;
pub mod optimizers;
pub mod report;
pub mod resampling;
pub mod shrinkage;
pub mod solver;
pub mod types;

pub use data::periodic_returns;
pub use data::CsvPriceLoader;
pub use data::InMemoryLoader;
pub use data::MarketData;
pub use data::MarketInputs;
pub use data::Period;
pub use data::PriceLoader;
pub use data::ReturnLoader;
pub use data::ReturnSeries;
pub use engine::OptimizerConfig;
pub use engine::PortfolioOptimizer;
pub use engine::Strategy;
pub use error::PortfolioError;
pub use frontier::efficient_frontier;
pub use frontier::target_returns;
pub use optimizers::portfolio_return;
pub use optimizers::portfolio_variance;
pub use optimizers::portfolio_volatility;
pub use optimizers::MinVarianceOptimizer;
pub use optimizers::TangencyPortfolio;
pub use resampling::resample_frontier;
pub use resampling::FailurePolicy;
pub use resampling::MultivariateNormal;
pub use resampling::ResampledFrontier;
pub use resampling::ResamplingConfig;
pub use resampling::ResamplingControl;
pub use shrinkage::ShrinkageEstimate;
pub use shrinkage::ShrinkageEstimator;
pub use solver::AdmmConfig;
pub use solver::AdmmSolver;
pub use solver::QuadraticProgram;
pub use solver::QuadraticSolver;
pub use solver::SolveStatus;
pub use solver::Solution;
pub use types::Algorithm;
pub use types::AssetUniverse;
pub use types::FrontierPoint;
pub use types::MetadataValue;
pub use types::OptimizationResult;
pub use types::WeightBounds;
