//! # Portfolio Data Utilities
//!
//! $$
//! r_t=\frac{P_t}{P_{t-1}}-1,\qquad
//! \hat\Sigma_{ij}=\frac{1}{T-1}\sum_{t=1}^T (r_{it}-\bar r_i)(r_{jt}-\bar r_j)
//! $$
//!
//! Return series, the loader seam for historical data, and sample moments.

use std::fs::File;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::bail;
use chrono::Datelike;
use chrono::Months;
use chrono::NaiveDate;
use csv::ReaderBuilder;
use csv::Trim;
use impl_new_derive::ImplNew;
use ndarray::Array1;
use ndarray::Array2;
use ndarray::Axis;
use ndarray_stats::CorrelationExt;
use tracing::debug;
use tracing::info;

use super::error::PortfolioError;
use super::types::AssetUniverse;

/// Sampling resolution of a return series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Period {
  Monthly,
  Yearly,
}

impl Period {
  fn bucket(&self, date: NaiveDate) -> (i32, u32) {
    match self {
      Self::Monthly => (date.year(), date.month()),
      Self::Yearly => (date.year(), 12),
    }
  }

  /// Last calendar day of the period containing `date`.
  pub fn period_end(&self, date: NaiveDate) -> NaiveDate {
    let (year, month) = self.bucket(date);
    NaiveDate::from_ymd_opt(year, month, 1)
      .and_then(|first| first.checked_add_months(Months::new(1)))
      .and_then(|next| next.pred_opt())
      .unwrap_or(date)
  }
}

/// Time-ordered fractional returns of one asset.
#[derive(ImplNew, Clone, Debug, PartialEq)]
pub struct ReturnSeries {
  pub asset: String,
  pub period: Period,
  pub observations: Vec<(NaiveDate, f64)>,
}

impl ReturnSeries {
  pub fn len(&self) -> usize {
    self.observations.len()
  }

  pub fn is_empty(&self) -> bool {
    self.observations.is_empty()
  }

  pub fn values(&self) -> Vec<f64> {
    self.observations.iter().map(|(_, r)| *r).collect()
  }
}

/// Resample daily prices to period-end prices and take simple returns.
///
/// Each period keeps its last available price; the first period only seeds the
/// first return. Pairs with a non-positive previous price are skipped.
pub fn periodic_returns(prices: &[(NaiveDate, f64)], period: Period) -> Vec<(NaiveDate, f64)> {
  let mut sorted = prices.to_vec();
  sorted.sort_by_key(|(date, _)| *date);

  let mut closes: Vec<(NaiveDate, f64)> = Vec::new();
  for (date, price) in sorted {
    match closes.last_mut() {
      Some(last) if period.bucket(last.0) == period.bucket(date) => *last = (date, price),
      _ => closes.push((date, price)),
    }
  }

  let mut out = Vec::with_capacity(closes.len().saturating_sub(1));
  for pair in closes.windows(2) {
    let (_, prev) = pair[0];
    let (date, curr) = pair[1];
    if prev > 0.0 && curr.is_finite() {
      out.push((period.period_end(date), curr / prev - 1.0));
    }
  }
  out
}

/// Per-asset return history as supplied by a [`ReturnLoader`].
#[derive(Clone, Debug)]
pub struct MarketData {
  pub universe: AssetUniverse,
  pub monthly: Vec<ReturnSeries>,
  pub yearly: Vec<ReturnSeries>,
}

impl MarketData {
  /// Build market data from yearly returns only, dated at consecutive year ends
  /// starting at `first_year`.
  pub fn from_yearly_returns<T: Into<String>>(
    assets: Vec<(T, Vec<f64>)>,
    first_year: i32,
  ) -> Result<Self, PortfolioError> {
    let mut ids = Vec::with_capacity(assets.len());
    let mut yearly = Vec::with_capacity(assets.len());
    for (id, returns) in assets {
      let id: String = id.into();
      let observations = returns
        .into_iter()
        .enumerate()
        .map(|(i, r)| {
          let year = first_year + i as i32;
          let date = NaiveDate::from_ymd_opt(year, 12, 31).ok_or_else(|| {
            PortfolioError::InvalidConfiguration(format!("year {year} out of range"))
          })?;
          Ok((date, r))
        })
        .collect::<Result<Vec<_>, PortfolioError>>()?;
      yearly.push(ReturnSeries::new(id.clone(), Period::Yearly, observations));
      ids.push(id);
    }

    Ok(Self {
      universe: AssetUniverse::new(ids)?,
      monthly: Vec::new(),
      yearly,
    })
  }

  /// Validate shapes and derive the moment inputs used by every strategy.
  pub fn inputs(&self) -> Result<MarketInputs, PortfolioError> {
    let n = self.universe.len();
    if self.yearly.len() != n {
      return Err(PortfolioError::shape("yearly return series", n, self.yearly.len()));
    }
    if !self.monthly.is_empty() && self.monthly.len() != n {
      return Err(PortfolioError::shape("monthly return series", n, self.monthly.len()));
    }

    for (id, series) in self.universe.iter().zip(&self.yearly) {
      if series.asset != id {
        return Err(PortfolioError::InvalidConfiguration(format!(
          "yearly series for '{}' found where '{id}' was expected",
          series.asset
        )));
      }
    }

    let t = self.yearly[0].len();
    for series in &self.yearly {
      if series.len() != t {
        return Err(PortfolioError::shape(
          format!("yearly observations of '{}'", series.asset),
          t,
          series.len(),
        ));
      }
    }

    let mut panel = Array2::<f64>::zeros((n, t));
    for (i, series) in self.yearly.iter().enumerate() {
      for (j, (_, r)) in series.observations.iter().enumerate() {
        panel[[i, j]] = *r;
      }
    }

    let historical_returns = sample_mean(&panel)?;
    let covariance = sample_covariance(&panel)?;
    debug!(assets = n, observations = t, "derived yearly moments");

    Ok(MarketInputs {
      universe: self.universe.clone(),
      yearly: panel,
      historical_returns,
      covariance,
    })
  }
}

/// Moment inputs derived once per run from the yearly history.
#[derive(Clone, Debug)]
pub struct MarketInputs {
  pub universe: AssetUniverse,
  /// Yearly returns with assets in rows and years in columns.
  pub yearly: Array2<f64>,
  /// Per-asset arithmetic mean of yearly returns.
  pub historical_returns: Array1<f64>,
  /// Sample covariance of yearly returns (`ddof = 1`).
  pub covariance: Array2<f64>,
}

impl MarketInputs {
  pub fn observations(&self) -> usize {
    self.yearly.ncols()
  }
}

/// Per-asset arithmetic mean over the columns of an `(assets, observations)` panel.
pub fn sample_mean(panel: &Array2<f64>) -> Result<Array1<f64>, PortfolioError> {
  panel
    .mean_axis(Axis(1))
    .ok_or(PortfolioError::InsufficientHistory {
      required: 1,
      actual: 0,
    })
}

/// Unbiased sample covariance of an `(assets, observations)` panel.
pub fn sample_covariance(panel: &Array2<f64>) -> Result<Array2<f64>, PortfolioError> {
  let t = panel.ncols();
  if t < 2 {
    return Err(PortfolioError::InsufficientHistory {
      required: 2,
      actual: t,
    });
  }
  panel
    .cov(1.0)
    .map_err(|err| PortfolioError::Numerical(err.to_string()))
}

/// Source of historical returns, injected into the optimizer.
pub trait ReturnLoader: Send + Sync {
  fn load(&self) -> anyhow::Result<MarketData>;
}

/// Loader over data already held in memory.
#[derive(Clone, Debug)]
pub struct InMemoryLoader {
  data: MarketData,
}

impl InMemoryLoader {
  pub fn new(data: MarketData) -> Self {
    Self { data }
  }
}

impl ReturnLoader for InMemoryLoader {
  fn load(&self) -> anyhow::Result<MarketData> {
    Ok(self.data.clone())
  }
}

/// Loader converting per-asset daily price histories to monthly and yearly returns.
#[derive(Clone, Debug)]
pub struct PriceLoader {
  histories: Vec<(String, Vec<(NaiveDate, f64)>)>,
}

impl PriceLoader {
  pub fn new(histories: Vec<(String, Vec<(NaiveDate, f64)>)>) -> Self {
    Self { histories }
  }
}

fn market_data_from_prices(
  histories: &[(String, Vec<(NaiveDate, f64)>)],
) -> anyhow::Result<MarketData> {
  let universe = AssetUniverse::new(histories.iter().map(|(id, _)| id.clone()))?;
  let mut monthly = Vec::with_capacity(histories.len());
  let mut yearly = Vec::with_capacity(histories.len());
  for (id, prices) in histories {
    monthly.push(ReturnSeries::new(
      id.clone(),
      Period::Monthly,
      periodic_returns(prices, Period::Monthly),
    ));
    yearly.push(ReturnSeries::new(
      id.clone(),
      Period::Yearly,
      periodic_returns(prices, Period::Yearly),
    ));
  }
  Ok(MarketData {
    universe,
    monthly,
    yearly,
  })
}

impl ReturnLoader for PriceLoader {
  fn load(&self) -> anyhow::Result<MarketData> {
    market_data_from_prices(&self.histories)
  }
}

/// Loader reading `<dir>/<TICKER>.csv` files of `date,close` rows.
#[derive(Clone, Debug)]
pub struct CsvPriceLoader {
  dir: PathBuf,
  tickers: Vec<String>,
}

impl CsvPriceLoader {
  pub fn new(dir: impl Into<PathBuf>, tickers: Vec<String>) -> Self {
    Self {
      dir: dir.into(),
      tickers,
    }
  }

  /// Rows must hold exactly two fields, `date,close`. A first row whose date does not
  /// parse is taken as the header.
  fn read_prices(&self, ticker: &str) -> anyhow::Result<Vec<(NaiveDate, f64)>> {
    let path = self.dir.join(format!("{ticker}.csv"));
    let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = ReaderBuilder::new()
      .has_headers(false)
      .trim(Trim::All)
      .from_reader(file);

    let mut prices = Vec::new();
    for (row, record) in reader.records().enumerate() {
      let record = record.with_context(|| format!("reading {}", path.display()))?;
      let line = record.position().map_or(row as u64 + 1, |pos| pos.line());
      if record.len() != 2 {
        bail!(
          "{}:{line}: expected `date,close`, found {} fields",
          path.display(),
          record.len()
        );
      }

      let date = match NaiveDate::parse_from_str(&record[0], "%Y-%m-%d") {
        Ok(date) => date,
        Err(_) if row == 0 => continue,
        Err(err) => bail!("{}:{line}: bad date: {err}", path.display()),
      };
      let close: f64 = record[1]
        .parse()
        .with_context(|| format!("{}:{line}: bad close", path.display()))?;
      prices.push((date, close));
    }

    Ok(prices)
  }
}

impl ReturnLoader for CsvPriceLoader {
  fn load(&self) -> anyhow::Result<MarketData> {
    let histories = self
      .tickers
      .iter()
      .map(|ticker| Ok((ticker.clone(), self.read_prices(ticker)?)))
      .collect::<anyhow::Result<Vec<_>>>()?;
    info!(
      tickers = self.tickers.len(),
      dir = %self.dir.display(),
      "loaded price files"
    );
    market_data_from_prices(&histories)
  }
}
