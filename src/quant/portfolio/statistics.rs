//! # Return Statistics
//!
//! $$
//! \mu = P\,\bar r,\qquad \Sigma = \frac{P}{T-1}\sum_t (r_t-\bar r)(r_t-\bar r)^\top
//! $$
//!
//! Annualized mean vector, sample covariance and per-asset metrics.

use ndarray::Array1;
use ndarray::Array2;
use ndarray::Axis;

use super::types::AssetUniverse;
use super::types::ReturnSeries;
use crate::error::Result;
use crate::error::SelectionError;

/// Trading periods per year for daily data.
pub const TRADING_DAYS: f64 = 252.0;

/// Annualized first and second moments of a [`ReturnSeries`].
#[derive(Clone, Debug)]
pub struct ReturnStatistics {
  universe: AssetUniverse,
  /// Annualized expected returns.
  pub mean: Array1<f64>,
  /// Annualized sample covariance (raw, before denoising).
  pub covariance: Array2<f64>,
  /// Number of return observations used.
  pub n_observations: usize,
  pub periods_per_year: f64,
}

/// Annualized return, volatility and Sharpe ratio for one asset.
#[derive(Clone, Debug, PartialEq)]
pub struct AssetMetrics {
  pub id: String,
  pub annualized_return: f64,
  pub volatility: f64,
  pub sharpe: f64,
}

impl ReturnStatistics {
  /// Estimate from returns. Requires at least two periods.
  pub fn estimate(series: &ReturnSeries, periods_per_year: f64) -> Result<Self> {
    let returns = series.returns();
    let t = returns.nrows();
    if t < 2 {
      return Err(SelectionError::InsufficientData {
        observations: t,
        required: 2,
      });
    }
    if !(periods_per_year.is_finite() && periods_per_year > 0.0) {
      return Err(SelectionError::InvalidInput(format!(
        "periods_per_year must be positive, got {periods_per_year}"
      )));
    }

    let periodic_mean = returns
      .mean_axis(Axis(0))
      .unwrap_or_else(|| Array1::zeros(returns.ncols()));
    let centered = returns - &periodic_mean;
    let periodic_cov = centered.t().dot(&centered) / (t as f64 - 1.0);

    Ok(Self {
      universe: series.universe().clone(),
      mean: periodic_mean * periods_per_year,
      covariance: periodic_cov * periods_per_year,
      n_observations: t,
      periods_per_year,
    })
  }

  pub fn universe(&self) -> &AssetUniverse {
    &self.universe
  }

  pub fn n_assets(&self) -> usize {
    self.mean.len()
  }

  /// Annualized volatility per asset.
  pub fn volatilities(&self) -> Array1<f64> {
    self.covariance.diag().mapv(|v| v.max(0.0).sqrt())
  }

  /// Per-asset metrics with Sharpe computed against `risk_free`.
  pub fn asset_metrics(&self, risk_free: f64) -> Vec<AssetMetrics> {
    self
      .volatilities()
      .iter()
      .zip(self.mean.iter())
      .enumerate()
      .map(|(i, (&volatility, &annualized_return))| AssetMetrics {
        id: self.universe[i].to_string(),
        annualized_return,
        volatility,
        sharpe: sharpe_ratio(annualized_return, volatility, risk_free),
      })
      .collect()
  }
}

/// `(ret - risk_free) / vol`, zero when volatility vanishes.
pub fn sharpe_ratio(ret: f64, vol: f64, risk_free: f64) -> f64 {
  if vol > 1e-15 {
    (ret - risk_free) / vol
  } else {
    0.0
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::*;

  fn series(returns: Array2<f64>) -> ReturnSeries {
    let ids: Vec<String> = (0..returns.ncols()).map(|i| format!("A{i}")).collect();
    ReturnSeries::new(AssetUniverse::new(ids).unwrap(), returns).unwrap()
  }

  #[test]
  fn annualizes_mean_and_covariance() {
    let s = series(array![[0.01, 0.02], [0.03, -0.02], [0.02, 0.0]]);
    let stats = ReturnStatistics::estimate(&s, 252.0).unwrap();

    assert_abs_diff_eq!(stats.mean[0], 0.02 * 252.0, epsilon = 1e-12);
    assert_abs_diff_eq!(stats.mean[1], 0.0, epsilon = 1e-12);
    // var(a) = ((-.01)^2 + .01^2 + 0) / 2
    assert_abs_diff_eq!(stats.covariance[[0, 0]], 1e-4 * 252.0, epsilon = 1e-12);
    // cov(a, b) = (-.01 * .02 + .01 * -.02 + 0) / 2
    assert_abs_diff_eq!(stats.covariance[[0, 1]], -2e-4 * 252.0, epsilon = 1e-12);
    assert_eq!(stats.covariance[[0, 1]], stats.covariance[[1, 0]]);
  }

  #[test]
  fn single_period_is_insufficient() {
    let s = series(array![[0.01, 0.02]]);
    let err = ReturnStatistics::estimate(&s, 252.0).unwrap_err();
    assert!(matches!(
      err,
      SelectionError::InsufficientData {
        observations: 1,
        required: 2
      }
    ));
  }

  #[test]
  fn metrics_report_sharpe() {
    let s = series(array![[0.01, 0.0], [0.03, 0.0], [0.02, 0.0]]);
    let stats = ReturnStatistics::estimate(&s, 252.0).unwrap();
    let m = stats.asset_metrics(0.0);

    assert_eq!(m[0].id, "A0");
    assert_abs_diff_eq!(m[0].volatility, (1e-4_f64 * 252.0).sqrt(), epsilon = 1e-12);
    assert_abs_diff_eq!(m[0].sharpe, m[0].annualized_return / m[0].volatility, epsilon = 1e-12);
    assert_eq!(m[1].sharpe, 0.0);
  }
}
