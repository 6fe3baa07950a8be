use std::path::PathBuf;

use anyhow::Context;
use chrono::Datelike;
use chrono::NaiveDate;
use chrono::Weekday;
use clap::Parser;
use frontier_rs::portfolio::report;
use frontier_rs::portfolio::Algorithm;
use frontier_rs::portfolio::CsvPriceLoader;
use frontier_rs::portfolio::OptimizerConfig;
use frontier_rs::portfolio::PortfolioError;
use frontier_rs::portfolio::PortfolioOptimizer;
use frontier_rs::portfolio::PriceLoader;
use frontier_rs::portfolio::ResamplingConfig;
use frontier_rs::portfolio::ResamplingControl;
use frontier_rs::portfolio::ReturnLoader;
use frontier_rs::portfolio::Strategy;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Distribution;
use rand_distr::Normal;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const PROGRESS_TEMPLATE: &str =
  "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} draws ({eta})";

#[derive(Parser, Debug)]
#[command(name = "frontier")]
#[command(about = "Minimum-variance portfolios, efficient frontiers and resampled frontiers")]
struct Cli {
  /// Directory of `<TICKER>.csv` files with `date,close` rows. Synthetic prices when unset.
  #[arg(long, env = "FRONTIER_DATA_DIR")]
  data_dir: Option<PathBuf>,

  /// Comma-separated tickers
  #[arg(
    long,
    env = "FRONTIER_TICKERS",
    value_delimiter = ',',
    default_values = ["EQTY", "BOND", "GOLD", "REIT"]
  )]
  tickers: Vec<String>,

  /// Algorithm id, or `all`
  #[arg(long, env = "FRONTIER_ALGORITHM", default_value = "all", value_parser = parse_selection)]
  algorithm: Selection,

  /// Target-return levels on the frontier
  #[arg(long, env = "FRONTIER_PORTFOLIOS", default_value_t = 10)]
  portfolios: usize,

  /// Monte Carlo draws
  #[arg(long, env = "FRONTIER_SIMULATIONS", default_value_t = 500)]
  simulations: usize,

  /// Shrinkage intensity in [0, 1]
  #[arg(long, env = "FRONTIER_SHRINKAGE", default_value_t = 0.7)]
  shrinkage: f64,

  #[arg(long, env = "FRONTIER_SEED", default_value_t = 42)]
  seed: u64,

  /// Risk-free rate for the maximum-Sharpe search
  #[arg(long, env = "FRONTIER_RISK_FREE", default_value_t = 0.0)]
  risk_free: f64,

  /// Allow weights in [-1, 1]
  #[arg(long, env = "FRONTIER_ALLOW_SHORT")]
  allow_short: bool,
}

#[derive(Clone, Copy, Debug)]
enum Selection {
  All,
  One(Algorithm),
}

fn parse_selection(raw: &str) -> Result<Selection, PortfolioError> {
  if raw.trim().eq_ignore_ascii_case("all") {
    Ok(Selection::All)
  } else {
    raw.parse().map(Selection::One)
  }
}

impl Cli {
  fn resampling(&self) -> ResamplingConfig {
    ResamplingConfig {
      num_portfolios: self.portfolios,
      num_simulations: self.simulations,
      shrinkage_intensity: self.shrinkage,
      seed: self.seed,
      ..ResamplingConfig::default()
    }
  }

  fn strategy_for(&self, algorithm: Algorithm) -> Strategy {
    match algorithm {
      Algorithm::MeanVariance => Strategy::MeanVariance {
        num_portfolios: self.portfolios,
      },
      Algorithm::MinimumVariance => Strategy::MinimumVariance,
      Algorithm::MonteCarloResampling => Strategy::MonteCarloResampling(self.resampling()),
      Algorithm::MaximumSharpe => Strategy::MaximumSharpe {
        risk_free: self.risk_free,
      },
    }
  }

  fn strategies(&self) -> Vec<Strategy> {
    match self.algorithm {
      Selection::All => Algorithm::ALL.iter().map(|a| self.strategy_for(*a)).collect(),
      Selection::One(algorithm) => vec![self.strategy_for(algorithm)],
    }
  }

  fn tickers(&self) -> Vec<String> {
    self
      .tickers
      .iter()
      .map(|t| t.trim().to_uppercase())
      .filter(|t| !t.is_empty())
      .collect()
  }
}

/// Daily geometric Brownian motion closes on weekdays, one path per ticker.
fn synthetic_prices(tickers: &[String], seed: u64) -> anyhow::Result<PriceLoader> {
  let params = [(0.08, 0.18), (0.03, 0.06), (0.05, 0.15), (0.07, 0.22)];
  let start = NaiveDate::from_ymd_opt(2014, 1, 1).context("invalid start date")?;
  let end = NaiveDate::from_ymd_opt(2025, 12, 31).context("invalid end date")?;
  let dt = 1.0 / 252.0_f64;
  let mut rng = StdRng::seed_from_u64(seed);

  let mut histories = Vec::with_capacity(tickers.len());
  for (i, ticker) in tickers.iter().enumerate() {
    let (drift, vol) = params[i % params.len()];
    let shock = Normal::new((drift - 0.5 * vol * vol) * dt, vol * dt.sqrt())?;
    let mut price = 100.0_f64;
    let mut prices = Vec::new();
    for date in start.iter_days().take_while(|d| *d <= end) {
      if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        continue;
      }
      price *= shock.sample(&mut rng).exp();
      prices.push((date, price));
    }
    histories.push((ticker.clone(), prices));
  }

  Ok(PriceLoader::new(histories))
}

fn run<L: ReturnLoader>(
  optimizer: &PortfolioOptimizer<L>,
  strategy: &Strategy,
) -> anyhow::Result<()> {
  let control = match strategy {
    Strategy::MonteCarloResampling(config) => {
      let pb = ProgressBar::new(config.num_simulations as u64);
      pb.set_style(
        ProgressStyle::default_bar()
          .template(PROGRESS_TEMPLATE)?
          .progress_chars("#>-"),
      );
      ResamplingControl::new().with_progress(pb)
    }
    _ => ResamplingControl::new(),
  };

  let result = optimizer.optimize_with_control(strategy, &control)?;
  println!("\n{}", report::summary(&result));
  report::render(&result).printstd();
  Ok(())
}

fn run_all<L: ReturnLoader>(
  loader: L,
  config: OptimizerConfig,
  strategies: &[Strategy],
) -> anyhow::Result<()> {
  let optimizer = PortfolioOptimizer::new(loader, config);
  for strategy in strategies {
    run(&optimizer, strategy)?;
  }
  Ok(())
}

fn main() -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(tracing_subscriber::fmt::layer())
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let cli = Cli::parse();
  let tickers = cli.tickers();
  let strategies = cli.strategies();
  let config = OptimizerConfig {
    allow_short: cli.allow_short,
    ..OptimizerConfig::default()
  };

  match &cli.data_dir {
    Some(dir) => {
      info!(dir = %dir.display(), tickers = tickers.len(), "reading price files");
      run_all(CsvPriceLoader::new(dir, tickers), config, &strategies)
    }
    None => {
      info!(tickers = tickers.len(), "no data directory set, using synthetic prices");
      let loader = synthetic_prices(&tickers, cli.seed)?;
      run_all(loader, config, &strategies)
    }
  }
}

#[cfg(test)]
mod tests {
  use clap::CommandFactory;

  use super::*;

  #[test]
  fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
  }

  #[test]
  fn flags_override_defaults() {
    let cli = Cli::try_parse_from([
      "frontier",
      "--algorithm",
      "max-sharpe",
      "--tickers",
      "spy, tlt",
      "--risk-free",
      "0.02",
    ])
    .unwrap();

    assert_eq!(cli.tickers(), vec!["SPY".to_string(), "TLT".to_string()]);
    assert!(matches!(
      cli.strategies().as_slice(),
      [Strategy::MaximumSharpe { risk_free }] if *risk_free == 0.02
    ));
  }

  #[test]
  fn unknown_algorithm_and_bad_numbers_are_rejected() {
    assert!(Cli::try_parse_from(["frontier", "--algorithm", "black-litterman"]).is_err());
    assert!(Cli::try_parse_from(["frontier", "--simulations", "abc"]).is_err());
  }
}
