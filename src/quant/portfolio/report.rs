//! # Reporting
//!
//! Plain tabular output of a selection run: per-asset metrics, the strategy
//! comparison and the selected tickers, as terminal tables or CSV text.

use prettytable::format;
use prettytable::row;
use prettytable::Table;

use super::engine::PipelineReport;
use super::statistics::AssetMetrics;
use super::types::ComparisonResult;
use crate::error::Result;
use crate::error::SelectionError;

fn new_table() -> Table {
  let mut table = Table::new();
  table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
  table
}

/// One row per asset: id, annualized return, volatility, Sharpe.
pub fn metrics_table(metrics: &[AssetMetrics]) -> Table {
  let mut table = new_table();
  table.set_titles(row!["asset", "annualized_return", "volatility", "sharpe"]);
  for m in metrics {
    table.add_row(row![
      m.id,
      format!("{:.6}", m.annualized_return),
      format!("{:.6}", m.volatility),
      format!("{:.6}", m.sharpe)
    ]);
  }
  table
}

/// One row per strategy: name, objective, asset count, solver status.
pub fn comparison_table(comparison: &ComparisonResult) -> Table {
  let mut table = new_table();
  table.set_titles(row!["strategy", "objective", "assets", "status"]);
  for (name, r) in [("global", &comparison.global), ("pipeline", &comparison.pipeline)] {
    table.add_row(row![
      name,
      format!("{:.6}", r.objective),
      r.len(),
      r.status
    ]);
  }
  table
}

/// One row per selected ticker, tagged with the strategy that chose it.
pub fn tickers_table(global: &[String], pipeline: &[String]) -> Table {
  let mut table = new_table();
  table.set_titles(row!["strategy", "ticker"]);
  for (name, tickers) in [("global", global), ("pipeline", pipeline)] {
    for t in tickers {
      table.add_row(row![name, t]);
    }
  }
  table
}

/// Serialize a table (titles first) as CSV text.
pub fn to_csv_string(table: &Table) -> Result<String> {
  let writer = table.to_csv(Vec::new()).map_err(std::io::Error::from)?;
  let bytes = writer
    .into_inner()
    .map_err(|e| std::io::Error::new(e.error().kind(), e.error().to_string()))?;
  String::from_utf8(bytes).map_err(|e| SelectionError::InvalidInput(e.to_string()))
}

/// Human-readable summary of a full run.
pub fn render(report: &PipelineReport, risk_free: f64) -> String {
  let metrics = report.statistics.asset_metrics(risk_free);
  let ratio = match report.comparison.approximation_ratio {
    Some(r) => format!("{r:.6}"),
    None => "undefined".to_string(),
  };
  let sizes = report.clusters.sizes();

  format!(
    "Asset metrics\n{}\nClusters: {} {:?}{}\n\nComparison\n{}\nApproximation ratio: {}\n\nSelected tickers\n{}",
    metrics_table(&metrics),
    sizes.len(),
    sizes,
    if report.clusters.fallback_used() {
      " (fallback assignment)"
    } else {
      ""
    },
    comparison_table(&report.comparison),
    ratio,
    tickers_table(&report.global_tickers(), &report.pipeline_tickers()),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::quant::portfolio::types::SelectionResult;
  use crate::quant::portfolio::types::SolverStatus;

  fn comparison() -> ComparisonResult {
    ComparisonResult::new(
      SelectionResult::new(vec![0, 2], -0.5, SolverStatus::Optimal),
      SelectionResult::new(vec![1, 2], -0.25, SolverStatus::FallbackUsed),
    )
  }

  #[test]
  fn comparison_csv_has_header_and_rows() {
    let csv = to_csv_string(&comparison_table(&comparison())).unwrap();
    let lines: Vec<&str> = csv.lines().collect();

    assert_eq!(lines[0], "strategy,objective,assets,status");
    assert_eq!(lines[1], "global,-0.500000,2,optimal");
    assert_eq!(lines[2], "pipeline,-0.250000,2,fallback-used");
  }

  #[test]
  fn tickers_are_tagged_by_strategy() {
    let t = tickers_table(&["AAA".into()], &["BBB".into(), "CCC".into()]);
    let csv = to_csv_string(&t).unwrap();

    assert_eq!(t.len(), 3);
    assert!(csv.contains("global,AAA"));
    assert!(csv.contains("pipeline,CCC"));
  }

  #[test]
  fn metrics_rows_follow_input_order() {
    let metrics = vec![
      AssetMetrics {
        id: "X".into(),
        annualized_return: 0.1,
        volatility: 0.2,
        sharpe: 0.5,
      },
      AssetMetrics {
        id: "Y".into(),
        annualized_return: -0.05,
        volatility: 0.1,
        sharpe: -0.5,
      },
    ];
    let csv = to_csv_string(&metrics_table(&metrics)).unwrap();
    assert!(csv.starts_with("asset,annualized_return,volatility,sharpe"));
    assert!(csv.contains("Y,-0.050000,0.100000,-0.500000"));
  }
}
