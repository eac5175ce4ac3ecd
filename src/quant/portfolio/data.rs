//! # Portfolio Data Utilities
//!
//! $$
//! r_{t,i} = \frac{P_{t,i}}{P_{t-1,i}} - 1
//! $$
//!
//! Price-table preprocessing: minimum-history exclusion, row alignment and
//! conversion to simple returns.

use std::io::Read;

use csv::ReaderBuilder;
use csv::Trim;
use ndarray::Array2;
use ndarray::Axis;
use tracing::debug;
use tracing::info;

use super::types::AssetUniverse;
use super::types::ReturnSeries;
use crate::error::Result;
use crate::error::SelectionError;

/// Price observations keyed by asset, rows = periods in chronological order.
/// Missing observations are stored as `NaN`.
#[derive(Clone, Debug)]
pub struct PriceTable {
  universe: AssetUniverse,
  dates: Vec<String>,
  prices: Array2<f64>,
}

fn csv_error(err: csv::Error) -> SelectionError {
  let line = err.position().map_or(0, |p| p.line() as usize);
  match err.kind() {
    csv::ErrorKind::UnequalLengths {
      expected_len, len, ..
    } => SelectionError::Parse {
      line,
      message: format!("expected {expected_len} cells, found {len}"),
    },
    _ => SelectionError::Parse {
      line,
      message: err.to_string(),
    },
  }
}

fn is_valid_price(p: f64) -> bool {
  p.is_finite() && p > 0.0
}

impl PriceTable {
  /// Wrap a price matrix with one column per asset.
  pub fn new(universe: AssetUniverse, prices: Array2<f64>) -> Result<Self> {
    let dates = (0..prices.nrows()).map(|t| t.to_string()).collect();
    Self::with_dates(universe, dates, prices)
  }

  /// Wrap a price matrix with explicit period labels.
  pub fn with_dates(
    universe: AssetUniverse,
    dates: Vec<String>,
    prices: Array2<f64>,
  ) -> Result<Self> {
    if prices.ncols() != universe.len() {
      return Err(SelectionError::shape(
        format!("{} price columns", universe.len()),
        format!("{} columns", prices.ncols()),
      ));
    }
    if dates.len() != prices.nrows() {
      return Err(SelectionError::shape(
        format!("{} period labels", prices.nrows()),
        format!("{} labels", dates.len()),
      ));
    }

    Ok(Self {
      universe,
      dates,
      prices,
    })
  }

  /// Parse `date,ID1,ID2,...` CSV text. Fields may be quoted; empty cells and
  /// `NA`, `NaN`, `nan`, `null` become missing observations.
  pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
    let mut rdr = ReaderBuilder::new()
      .has_headers(true)
      .trim(Trim::All)
      .flexible(false)
      .from_reader(reader);

    let ids: Vec<String> = rdr
      .headers()
      .map_err(csv_error)?
      .iter()
      .skip(1)
      .map(str::to_string)
      .collect();
    if ids.is_empty() {
      return Err(SelectionError::Parse {
        line: 1,
        message: "header must contain at least one asset column".into(),
      });
    }
    let universe = AssetUniverse::new(ids)?;
    let n = universe.len();

    let mut dates = Vec::new();
    let mut values = Vec::new();
    for record in rdr.records() {
      let record = record.map_err(csv_error)?;
      let line = record.position().map_or(0, |p| p.line() as usize);

      let mut cells = record.iter();
      dates.push(cells.next().unwrap_or_default().to_string());
      for cell in cells {
        let v = match cell {
          "" | "NA" | "NaN" | "nan" | "null" => f64::NAN,
          s => s.parse::<f64>().map_err(|e| SelectionError::Parse {
            line,
            message: format!("invalid price '{s}': {e}"),
          })?,
        };
        values.push(v);
      }
    }

    let prices = Array2::from_shape_vec((dates.len(), n), values)
      .map_err(|e| SelectionError::shape(format!("{} x {n}", dates.len()), e.to_string()))?;

    Self::with_dates(universe, dates, prices)
  }

  pub fn universe(&self) -> &AssetUniverse {
    &self.universe
  }

  pub fn dates(&self) -> &[String] {
    &self.dates
  }

  pub fn prices(&self) -> &Array2<f64> {
    &self.prices
  }

  /// Number of valid (finite, positive) prices per asset.
  pub fn history_lengths(&self) -> Vec<usize> {
    self
      .prices
      .columns()
      .into_iter()
      .map(|col| col.iter().filter(|&&p| is_valid_price(p)).count())
      .collect()
  }

  /// Drop every asset with fewer than `min_len` valid prices.
  pub fn filter_min_history(&self, min_len: usize) -> Self {
    let keep: Vec<usize> = self
      .history_lengths()
      .into_iter()
      .enumerate()
      .filter(|(_, len)| *len >= min_len)
      .map(|(i, _)| i)
      .collect();

    if keep.len() < self.universe.len() {
      let dropped: Vec<&str> = (0..self.universe.len())
        .filter(|i| !keep.contains(i))
        .map(|i| &self.universe[i])
        .collect();
      info!(
        min_len,
        dropped = dropped.len(),
        "excluding assets with short price history: {}",
        dropped.join(", ")
      );
    }

    Self {
      universe: self.universe.subset(&keep),
      dates: self.dates.clone(),
      prices: self.prices.select(Axis(1), &keep),
    }
  }

  /// Align on periods where every asset has a valid price and convert to
  /// simple returns.
  pub fn to_returns(&self) -> Result<ReturnSeries> {
    let rows: Vec<usize> = self
      .prices
      .rows()
      .into_iter()
      .enumerate()
      .filter(|(_, row)| row.iter().all(|&p| is_valid_price(p)))
      .map(|(t, _)| t)
      .collect();

    if rows.len() < 3 {
      return Err(SelectionError::InsufficientData {
        observations: rows.len().saturating_sub(1),
        required: 2,
      });
    }

    debug!(
      aligned = rows.len(),
      total = self.prices.nrows(),
      "aligned price rows"
    );

    let aligned = self.prices.select(Axis(0), &rows);
    let returns = simple_returns(&aligned);
    ReturnSeries::new(self.universe.clone(), returns)
  }
}

/// Column-wise simple returns of a price matrix (one fewer row).
pub fn simple_returns(prices: &Array2<f64>) -> Array2<f64> {
  let t = prices.nrows();
  let n = prices.ncols();
  if t < 2 {
    return Array2::zeros((0, n));
  }

  Array2::from_shape_fn((t - 1, n), |(r, c)| {
    prices[[r + 1, c]] / prices[[r, c]] - 1.0
  })
}

/// Correlation from covariance by standard-deviation normalization; the
/// diagonal is exactly one and assets with no variance are uncorrelated.
pub fn correlation_from_covariance(cov: &Array2<f64>) -> Array2<f64> {
  let n = cov.nrows();
  let sd: Vec<f64> = (0..n).map(|i| cov[[i, i]].max(0.0).sqrt()).collect();

  Array2::from_shape_fn((n, n), |(i, j)| {
    if i == j {
      return 1.0;
    }
    let denom = sd[i] * sd[j];
    if denom > 1e-15 {
      (cov[[i, j]] / denom).clamp(-1.0, 1.0)
    } else {
      0.0
    }
  })
}

#[cfg(test)]
mod tests {
  use std::io::Cursor;

  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::*;

  const CSV: &str = "date,AAA,BBB,CCC\n\
    2024-01-02,100,50,\n\
    2024-01-03,101,NA,10\n\
    2024-01-04,102,51,10.5\n\
    2024-01-05,100,52,\n\
    2024-01-08,103,53,11\n";

  #[test]
  fn parses_csv_with_missing_cells() {
    let table = PriceTable::from_reader(Cursor::new(CSV)).unwrap();
    assert_eq!(table.universe().ids(), &["AAA", "BBB", "CCC"]);
    assert_eq!(table.dates().len(), 5);
    assert!(table.prices()[[0, 2]].is_nan());
    assert_eq!(table.history_lengths(), vec![5, 4, 3]);
  }

  #[test]
  fn parses_quoted_fields() {
    let text = "\"date\",\"AAA\",\"BBB, Inc\"\n\"2024-01-02\",\"100\",\"50\"\n";
    let table = PriceTable::from_reader(text.as_bytes()).unwrap();
    assert_eq!(table.universe().ids(), &["AAA", "BBB, Inc"]);
    assert_eq!(table.dates(), &["2024-01-02"]);
    assert_eq!(table.prices()[[0, 1]], 50.0);
  }

  #[test]
  fn rejects_unparsable_price() {
    let err = PriceTable::from_reader("date,A\nd1,1\nd2,abc\n".as_bytes()).unwrap_err();
    assert!(matches!(err, SelectionError::Parse { line: 3, .. }));
  }

  #[test]
  fn rejects_ragged_rows() {
    let err = PriceTable::from_reader(Cursor::new("date,A,B\nd1,1\n")).unwrap_err();
    assert!(matches!(err, SelectionError::Parse { line: 2, .. }));
  }

  #[test]
  fn min_history_drops_short_assets() {
    let table = PriceTable::from_reader(Cursor::new(CSV)).unwrap();
    let filtered = table.filter_min_history(4);
    assert_eq!(filtered.universe().ids(), &["AAA", "BBB"]);

    let returns = filtered.to_returns().unwrap();
    // row with BBB missing is dropped before differencing
    assert_eq!(returns.n_periods(), 3);
    assert_abs_diff_eq!(returns.returns()[[0, 0]], 102.0 / 100.0 - 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(returns.returns()[[0, 1]], 51.0 / 50.0 - 1.0, epsilon = 1e-12);
  }

  #[test]
  fn too_few_aligned_rows_is_insufficient_data() {
    let table = PriceTable::from_reader(Cursor::new(CSV)).unwrap();
    let err = table.to_returns().unwrap_err();
    assert!(matches!(err, SelectionError::InsufficientData { .. }));
  }

  #[test]
  fn correlation_has_unit_diagonal() {
    let cov = array![[0.04, 0.01, 0.0], [0.01, 0.09, 0.0], [0.0, 0.0, 0.0]];
    let corr = correlation_from_covariance(&cov);
    assert_eq!(corr[[2, 2]], 1.0);
    assert_abs_diff_eq!(corr[[0, 1]], 0.01 / (0.2 * 0.3), epsilon = 1e-12);
    assert_eq!(corr[[0, 2]], 0.0);
  }
}
