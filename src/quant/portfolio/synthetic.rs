//! # Synthetic Universe
//!
//! $$
//! r_{t,i} = \delta + \sigma_f\,f_{t,g(i)} + \sigma_\varepsilon\,\varepsilon_{t,i},\qquad
//! P_{t,i} = P_{t-1,i}\,(1 + r_{t,i})
//! $$
//!
//! Block-factor price generator: assets in the same group share one factor.

use impl_new_derive::ImplNew;
use ndarray::Array2;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::StandardNormal;

use super::data::PriceTable;
use super::types::AssetUniverse;
use crate::error::Result;
use crate::error::SelectionError;

/// Starting price of every synthetic asset.
const INITIAL_PRICE: f64 = 100.0;

#[derive(ImplNew, Clone, Debug)]
pub struct SyntheticUniverse {
  /// Number of factor groups.
  pub groups: usize,
  pub assets_per_group: usize,
  /// Number of prices per asset.
  pub periods: usize,
  /// Per-period factor volatility.
  pub factor_vol: f64,
  /// Per-period idiosyncratic volatility.
  pub idio_vol: f64,
  /// Per-period drift shared by every asset.
  pub drift: f64,
  pub seed: u64,
}

impl Default for SyntheticUniverse {
  fn default() -> Self {
    Self::new(4, 3, 504, 0.015, 0.008, 0.0004, 42)
  }
}

impl SyntheticUniverse {
  pub fn n_assets(&self) -> usize {
    self.groups * self.assets_per_group
  }

  /// Group of asset `i`; assets are laid out group by group.
  pub fn group_of(&self, i: usize) -> usize {
    i / self.assets_per_group.max(1)
  }

  /// Identifiers `G<group>A<asset>`.
  pub fn ids(&self) -> Vec<String> {
    (0..self.groups)
      .flat_map(|g| (0..self.assets_per_group).map(move |a| format!("G{g}A{a}")))
      .collect()
  }

  /// Generate a price table with `periods` rows. Deterministic for a seed.
  pub fn prices(&self) -> Result<PriceTable> {
    let n = self.n_assets();
    if n == 0 || self.periods < 2 {
      return Err(SelectionError::InvalidInput(format!(
        "synthetic universe needs assets and at least 2 periods, got {n} assets x {} periods",
        self.periods
      )));
    }
    if !(self.factor_vol >= 0.0 && self.idio_vol >= 0.0 && self.drift.is_finite()) {
      return Err(SelectionError::InvalidInput(
        "synthetic volatilities must be non-negative".into(),
      ));
    }

    let steps = self.periods - 1;
    let mut rng = StdRng::seed_from_u64(self.seed);
    let factors = Array2::<f64>::random_using((steps, self.groups), StandardNormal, &mut rng);
    let noise = Array2::<f64>::random_using((steps, n), StandardNormal, &mut rng);

    let mut prices = Array2::<f64>::zeros((self.periods, n));
    prices.row_mut(0).fill(INITIAL_PRICE);
    for t in 0..steps {
      for i in 0..n {
        let r = self.drift
          + self.factor_vol * factors[[t, self.group_of(i)]]
          + self.idio_vol * noise[[t, i]];
        // keep prices strictly positive under fat draws
        prices[[t + 1, i]] = prices[[t, i]] * (1.0 + r).max(1e-6);
      }
    }

    PriceTable::new(AssetUniverse::new(self.ids())?, prices)
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;

  use super::*;
  use crate::quant::portfolio::data::correlation_from_covariance;
  use crate::quant::portfolio::statistics::ReturnStatistics;

  #[test]
  fn seeded_and_shaped() {
    let u = SyntheticUniverse::new(3, 2, 50, 0.01, 0.005, 0.0, 9);
    let a = u.prices().unwrap();
    let b = u.prices().unwrap();

    assert_eq!(a.prices().dim(), (50, 6));
    assert_eq!(a.prices(), b.prices());
    assert_eq!(a.universe().ids()[3], "G1A1");
    assert!(a.prices().iter().all(|&p| p > 0.0));
    assert_abs_diff_eq!(a.prices()[[0, 5]], INITIAL_PRICE);
  }

  #[test]
  fn groups_share_correlation() {
    let u = SyntheticUniverse::new(2, 3, 600, 0.02, 0.005, 0.0, 1);
    let returns = u.prices().unwrap().to_returns().unwrap();
    let stats = ReturnStatistics::estimate(&returns, 252.0).unwrap();
    let corr = correlation_from_covariance(&stats.covariance);

    assert!(corr[[0, 1]] > 0.8);
    assert!(corr[[3, 5]] > 0.8);
    assert!(corr[[0, 4]].abs() < 0.3);
  }

  #[test]
  fn rejects_degenerate_shape() {
    assert!(SyntheticUniverse::new(0, 3, 10, 0.01, 0.01, 0.0, 1).prices().is_err());
    assert!(SyntheticUniverse::new(2, 3, 1, 0.01, 0.01, 0.0, 1).prices().is_err());
  }
}
