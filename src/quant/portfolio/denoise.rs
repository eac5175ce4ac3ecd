//! # Covariance Denoising
//!
//! $$
//! \lambda_\pm = \left(1 \pm \sqrt{q}\right)^2,\qquad q = \frac{N}{T}
//! $$
//!
//! Marchenko–Pastur eigenvalue filter. Correlation eigenvalues inside the
//! random-matrix band are flattened to their mean, a dominant market mode is
//! damped to the next eigenvalue, and the spectrum is floored before the
//! covariance is rebuilt in the original volatility units.

use nalgebra::DMatrix;
use nalgebra::SymmetricEigen;
use ndarray::Array1;
use ndarray::Array2;
use tracing::debug;

use super::data::correlation_from_covariance;
use crate::error::Result;
use crate::error::SelectionError;

/// Tunables of the Marchenko–Pastur filter.
#[derive(Clone, Debug)]
pub struct DenoiserConfig {
  /// Added to the diagonal before normalization to guard against singularity.
  pub regularization: f64,
  /// Lower bound applied to every filtered eigenvalue.
  pub eigenvalue_floor: f64,
  /// Cap on `N/T` when there are at least as many assets as observations.
  pub max_aspect_ratio: f64,
  /// Top eigenvalue is damped when it exceeds this multiple of `lambda_max`.
  pub market_mode_multiple: f64,
}

impl Default for DenoiserConfig {
  fn default() -> Self {
    Self {
      regularization: 1e-8,
      eigenvalue_floor: 1e-8,
      max_aspect_ratio: 0.99,
      market_mode_multiple: 2.0,
    }
  }
}

/// Denoised covariance together with the spectral diagnostics that produced it.
#[derive(Clone, Debug)]
pub struct DenoisedCovariance {
  /// Symmetric, numerically PSD covariance in the input units.
  pub covariance: Array2<f64>,
  /// Cleaned correlation matrix with unit diagonal.
  pub correlation: Array2<f64>,
  /// Correlation eigenvalues before filtering, descending.
  pub raw_eigenvalues: Vec<f64>,
  /// Eigenvalues used for reconstruction, paired with `raw_eigenvalues`.
  pub filtered_eigenvalues: Vec<f64>,
  pub lambda_min: f64,
  pub lambda_max: f64,
  /// Eigenvalues classified as noise.
  pub noise_count: usize,
  /// Whether the market mode was replaced by the second eigenvalue.
  pub market_mode_damped: bool,
}

/// Marchenko–Pastur covariance filter.
#[derive(Clone, Debug, Default)]
pub struct CovarianceDenoiser {
  config: DenoiserConfig,
}

/// Marchenko–Pastur support for `n_assets` series of `n_observations` samples.
pub fn marchenko_pastur_bounds(n_assets: usize, n_observations: usize, max_q: f64) -> (f64, f64) {
  let mut q = n_assets as f64 / n_observations.max(1) as f64;
  if q >= 1.0 {
    q = max_q;
  }
  let sq = q.sqrt();
  ((1.0 - sq).powi(2), (1.0 + sq).powi(2))
}

impl CovarianceDenoiser {
  pub fn new(config: DenoiserConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &DenoiserConfig {
    &self.config
  }

  /// Filter `cov` estimated from `n_observations` return periods.
  pub fn denoise(&self, cov: &Array2<f64>, n_observations: usize) -> Result<DenoisedCovariance> {
    let n = cov.nrows();
    if cov.ncols() != n {
      return Err(SelectionError::shape(
        "square covariance matrix",
        format!("{} x {}", n, cov.ncols()),
      ));
    }
    if n_observations == 0 {
      return Err(SelectionError::InsufficientData {
        observations: 0,
        required: 1,
      });
    }
    if cov.iter().any(|v| !v.is_finite()) {
      return Err(SelectionError::InvalidInput(
        "covariance contains non-finite values".into(),
      ));
    }
    if n == 0 {
      return Ok(DenoisedCovariance {
        covariance: Array2::zeros((0, 0)),
        correlation: Array2::zeros((0, 0)),
        raw_eigenvalues: Vec::new(),
        filtered_eigenvalues: Vec::new(),
        lambda_min: 0.0,
        lambda_max: 0.0,
        noise_count: 0,
        market_mode_damped: false,
      });
    }

    let cfg = &self.config;

    let mut sym = (cov + &cov.t()) / 2.0;
    for i in 0..n {
      sym[[i, i]] += cfg.regularization;
    }

    let sd: Array1<f64> = sym.diag().mapv(|v| v.max(cfg.regularization).sqrt());
    let corr = correlation_from_covariance(&sym);

    let (raw_eigenvalues, vectors) = sorted_eigen(&corr);

    let (lambda_min, lambda_max) = marchenko_pastur_bounds(n, n_observations, cfg.max_aspect_ratio);

    let in_band: Vec<bool> = raw_eigenvalues
      .iter()
      .map(|&l| l >= lambda_min && l <= lambda_max)
      .collect();
    let noise_count = in_band.iter().filter(|&&b| b).count();

    let mut filtered = raw_eigenvalues.clone();
    if noise_count > 0 {
      let noise_mean = raw_eigenvalues
        .iter()
        .zip(&in_band)
        .filter(|&(_, &b)| b)
        .map(|(l, _)| l)
        .sum::<f64>()
        / noise_count as f64;
      for (l, _) in filtered.iter_mut().zip(&in_band).filter(|&(_, &b)| b) {
        *l = noise_mean;
      }
    }

    let mut market_mode_damped = false;
    if n > 1 && filtered[0] > cfg.market_mode_multiple * lambda_max {
      filtered[0] = filtered[1];
      market_mode_damped = true;
    }

    for l in filtered.iter_mut() {
      *l = l.max(cfg.eigenvalue_floor);
    }

    debug!(
      n,
      n_observations,
      lambda_min,
      lambda_max,
      noise_count,
      market_mode_damped,
      "marchenko-pastur filter"
    );

    let lambda = DMatrix::from_diagonal(&nalgebra::DVector::from_column_slice(&filtered));
    let rebuilt = &vectors * lambda * vectors.transpose();
    let rebuilt = Array2::from_shape_fn((n, n), |(i, j)| 0.5 * (rebuilt[(i, j)] + rebuilt[(j, i)]));

    // D^{-1/2} C D^{-1/2}: unit diagonal without breaking PSD
    let correlation = correlation_from_covariance(&rebuilt);
    let covariance = Array2::from_shape_fn((n, n), |(i, j)| correlation[[i, j]] * (sd[i] * sd[j]));

    Ok(DenoisedCovariance {
      covariance,
      correlation,
      raw_eigenvalues,
      filtered_eigenvalues: filtered,
      lambda_min,
      lambda_max,
      noise_count,
      market_mode_damped,
    })
  }
}

/// Eigenvalues descending with eigenvectors as matching columns.
pub(crate) fn sorted_eigen(m: &Array2<f64>) -> (Vec<f64>, DMatrix<f64>) {
  let n = m.nrows();
  let dm = DMatrix::from_fn(n, n, |i, j| m[[i, j]]);
  let eig = SymmetricEigen::new(dm);

  let mut order: Vec<usize> = (0..n).collect();
  order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

  let values = order.iter().map(|&k| eig.eigenvalues[k]).collect();
  let vectors = DMatrix::from_fn(n, n, |i, c| eig.eigenvectors[(i, order[c])]);
  (values, vectors)
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use rand::rngs::StdRng;
  use rand::SeedableRng;
  use rand_distr::Distribution;
  use rand_distr::StandardNormal;

  use super::*;

  fn sample_covariance(n: usize, t: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let market: Vec<f64> = (0..t).map(|_| StandardNormal.sample(&mut rng)).collect();
    let x = Array2::from_shape_fn((t, n), |(r, c)| {
      let z: f64 = StandardNormal.sample(&mut rng);
      0.01 * (0.8 * market[r] + z) * (1.0 + c as f64 * 0.1)
    });
    let mean = x.mean_axis(ndarray::Axis(0)).unwrap();
    let centered = &x - &mean;
    centered.t().dot(&centered) / (t as f64 - 1.0)
  }

  fn equicorrelated(n: usize, rho: f64, vols: &[f64]) -> Array2<f64> {
    Array2::from_shape_fn((n, n), |(i, j)| {
      let c = if i == j { 1.0 } else { rho };
      c * vols[i] * vols[j]
    })
  }

  #[test]
  fn bounds_follow_aspect_ratio() {
    let (lo, hi) = marchenko_pastur_bounds(25, 100, 0.99);
    assert_abs_diff_eq!(lo, 0.25, epsilon = 1e-12);
    assert_abs_diff_eq!(hi, 2.25, epsilon = 1e-12);

    let (lo, hi) = marchenko_pastur_bounds(50, 10, 0.99);
    assert!(lo > 0.0 && hi.is_finite());
  }

  #[test]
  fn output_is_symmetric_and_psd() {
    let cfg = DenoiserConfig::default();
    let floor = cfg.eigenvalue_floor;
    let denoiser = CovarianceDenoiser::new(cfg);

    for (n, t, seed) in [(10, 60, 1), (20, 15, 2), (8, 500, 3)] {
      let cov = sample_covariance(n, t, seed);
      let out = denoiser.denoise(&cov, t).unwrap();

      for i in 0..n {
        assert_eq!(out.correlation[[i, i]], 1.0);
        for j in 0..n {
          assert_eq!(out.covariance[[i, j]], out.covariance[[j, i]]);
        }
      }
      assert!(out.filtered_eigenvalues.iter().all(|&l| l >= floor));
      let min_eig = sorted_eigen(&out.covariance)
        .0
        .last()
        .copied()
        .unwrap();
      assert!(min_eig >= -1e-10, "min eigenvalue {min_eig}");
    }
  }

  #[test]
  fn preserves_volatilities() {
    let cov = sample_covariance(12, 80, 9);
    let out = CovarianceDenoiser::default().denoise(&cov, 80).unwrap();
    for i in 0..12 {
      assert_abs_diff_eq!(out.covariance[[i, i]], cov[[i, i]], epsilon = 1e-7);
    }
  }

  #[test]
  fn flattens_noise_band() {
    let cov = sample_covariance(20, 40, 4);
    let out = CovarianceDenoiser::default().denoise(&cov, 40).unwrap();
    assert!(out.noise_count > 1);

    let noise: Vec<f64> = out
      .raw_eigenvalues
      .iter()
      .zip(&out.filtered_eigenvalues)
      .filter(|&(&raw, _)| raw >= out.lambda_min && raw <= out.lambda_max)
      .map(|(_, &f)| f)
      .collect();
    assert!(noise.windows(2).all(|w| (w[0] - w[1]).abs() < 1e-12));
  }

  #[test]
  fn damps_dominant_market_mode() {
    let vols = vec![0.2; 6];
    let cov = equicorrelated(6, 0.9, &vols);
    let out = CovarianceDenoiser::default().denoise(&cov, 1000).unwrap();
    assert!(out.market_mode_damped);
    assert_abs_diff_eq!(out.filtered_eigenvalues[0], out.filtered_eigenvalues[1], epsilon = 1e-12);
  }

  #[test]
  fn rebuilt_correlation_is_rescaled_not_overwritten() {
    // two blocks of three: eigenvalues 3.8, 1.4 and 0.2 (x4)
    let cov = Array2::from_shape_fn((6, 6), |(i, j)| {
      let rho = if i == j {
        1.0
      } else if i / 3 == j / 3 {
        0.8
      } else {
        0.4
      };
      rho * 0.04
    });
    let out = CovarianceDenoiser::default().denoise(&cov, 1000).unwrap();
    assert!(out.market_mode_damped);

    let (_, v) = sorted_eigen(&correlation_from_covariance(&cov));
    let lambda = DMatrix::from_diagonal(&nalgebra::DVector::from_column_slice(&out.filtered_eigenvalues));
    let rebuilt = &v * lambda * v.transpose();
    assert_abs_diff_eq!(rebuilt[(0, 0)], 0.6, epsilon = 1e-6);

    for i in 0..6 {
      for j in (0..6).filter(|&j| j != i) {
        let scaled = rebuilt[(i, j)] / (rebuilt[(i, i)] * rebuilt[(j, j)]).sqrt();
        assert_abs_diff_eq!(out.correlation[[i, j]], scaled, epsilon = 1e-6);
      }
    }
    // within a block the plain overwrite would keep 0.4
    assert_abs_diff_eq!(rebuilt[(0, 1)], 0.4, epsilon = 1e-6);
    assert_abs_diff_eq!(out.correlation[[0, 1]], 0.4 / 0.6, epsilon = 1e-6);
    assert_abs_diff_eq!(out.correlation[[0, 3]], 0.0, epsilon = 1e-6);
  }

  #[test]
  fn clean_matrix_is_a_fixed_point() {
    // eigenvalues 1.9 and 0.7 (x3) lie outside [0.81, 1.21] for q = 0.01
    let vols = [0.1, 0.2, 0.3, 0.4];
    let cov = equicorrelated(4, 0.3, &vols);
    let denoiser = CovarianceDenoiser::default();

    let once = denoiser.denoise(&cov, 400).unwrap();
    assert_eq!(once.noise_count, 0);
    assert!(!once.market_mode_damped);

    let twice = denoiser.denoise(&once.covariance, 400).unwrap();
    for (a, b) in once.covariance.iter().zip(twice.covariance.iter()) {
      assert_abs_diff_eq!(*a, *b, epsilon = 1e-7);
    }
    for (a, b) in cov.iter().zip(once.covariance.iter()) {
      assert_abs_diff_eq!(*a, *b, epsilon = 1e-7);
    }
  }

  #[test]
  fn identity_is_a_fixed_point() {
    let cov = Array2::<f64>::eye(5);
    let denoiser = CovarianceDenoiser::default();
    let once = denoiser.denoise(&cov, 50).unwrap();
    let twice = denoiser.denoise(&once.covariance, 50).unwrap();
    for (a, b) in once.covariance.iter().zip(twice.covariance.iter()) {
      assert_abs_diff_eq!(*a, *b, epsilon = 1e-7);
    }
  }

  #[test]
  fn rejects_non_square() {
    let cov = Array2::<f64>::zeros((2, 3));
    assert!(matches!(
      CovarianceDenoiser::default().denoise(&cov, 10),
      Err(SelectionError::ShapeMismatch { .. })
    ));
  }
}
