//! # Report
//!
//! Plain-text rendering of an [`OptimizationResult`].

use prettytable::format;
use prettytable::Cell;
use prettytable::Row;
use prettytable::Table;

use super::types::MetadataValue;
use super::types::OptimizationResult;

/// One row per point: target return, per-asset weights in percent, volatility.
pub fn render(result: &OptimizationResult) -> Table {
  let mut table = Table::new();
  table.set_format(*format::consts::FORMAT_BOX_CHARS);

  let mut titles = vec![Cell::new("Return")];
  titles.extend(result.universe.iter().map(Cell::new));
  titles.push(Cell::new("Volatility"));
  table.set_titles(Row::new(titles));

  for point in &result.points {
    let mut cells = vec![Cell::new(&format!("{:.2}%", point.target_return * 100.0))];
    cells.extend(
      point
        .weights
        .iter()
        .map(|w| Cell::new(&format!("{:.2}%", w * 100.0))),
    );
    cells.push(Cell::new(&format!("{:.2}%", point.volatility * 100.0)));
    table.add_row(Row::new(cells));
  }

  table
}

/// Algorithm, universe and the scalar metadata entries as `key: value` lines.
pub fn summary(result: &OptimizationResult) -> String {
  let mut lines = vec![
    format!(
      "algorithm: {} ({})",
      result.algorithm_id(),
      result.algorithm.description()
    ),
    format!("assets: {}", result.universe.ids().join(", ")),
    format!("points: {}", result.points.len()),
  ];

  for (key, value) in &result.metadata {
    match value {
      MetadataValue::Matrix(_) => continue,
      MetadataValue::Vector(v) if v.len() != result.universe.len() => continue,
      _ => lines.push(format!("{key}: {value}")),
    }
  }

  lines.join("\n")
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use ndarray::array;

  use super::*;
  use crate::portfolio::types::Algorithm;
  use crate::portfolio::types::AssetUniverse;
  use crate::portfolio::types::FrontierPoint;

  fn result() -> OptimizationResult {
    let cov = array![[0.04, 0.0], [0.0, 0.01]];
    let mut metadata = BTreeMap::new();
    metadata.insert("num_simulations".to_string(), MetadataValue::Count(500));
    metadata.insert(
      "estimation_uncertainty".to_string(),
      MetadataValue::Matrix(&cov / 10.0),
    );
    OptimizationResult {
      universe: AssetUniverse::new(["SPY", "TLT"]).unwrap(),
      covariance: cov.clone(),
      algorithm: Algorithm::MonteCarloResampling,
      points: vec![
        FrontierPoint::new(0.05, array![0.2, 0.8], &cov),
        FrontierPoint::new(0.08, array![0.6, 0.4], &cov),
      ],
      metadata,
    }
  }

  #[test]
  fn table_has_one_row_per_point() {
    let table = render(&result());
    let text = table.to_string();

    assert_eq!(table.len(), 2);
    assert!(text.contains("SPY"));
    assert!(text.contains("80.00%"));
    assert!(text.contains("Volatility"));
  }

  #[test]
  fn summary_skips_matrices() {
    let text = summary(&result());

    assert!(text.contains("algorithm: monte_carlo_resampling"));
    assert!(text.contains("num_simulations: 500"));
    assert!(!text.contains("estimation_uncertainty"));
  }
}
