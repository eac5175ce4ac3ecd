//! # Fallback Strategies
//!
//! $$
//! \text{label}_i \sim \mathcal U\{0,\dots,k-1\},\qquad
//! S = \operatorname{top}_K \frac{\mu_i}{\sigma_i}
//! $$
//!
//! One-shot substitutes used when spectral clustering or a per-cluster solve
//! fails. They are injected into the partitioner and the orchestrator so tests
//! can force either path deterministically.

use std::fmt::Debug;

use ndarray::ArrayView1;
use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use super::statistics::sharpe_ratio;

/// Replacement cluster labelling used when spectral clustering fails.
pub trait ClusterFallback: Debug + Send + Sync {
  /// Label each of `n_assets` assets with a cluster id in `0..k`.
  fn assign(&self, n_assets: usize, k: usize) -> Vec<usize>;
}

/// Replacement selection used when a per-cluster solve fails.
pub trait SelectionFallback: Debug + Send + Sync {
  /// Choose `k` local indices from the candidates described by `mu` and `cov`.
  fn select(&self, mu: ArrayView1<f64>, cov: ArrayView2<f64>, k: usize) -> Vec<usize>;
}

/// Uniform random bucket per asset, reproducible from `seed`.
#[derive(Clone, Debug)]
pub struct RandomAssignment {
  pub seed: u64,
}

impl RandomAssignment {
  pub fn new(seed: u64) -> Self {
    Self { seed }
  }
}

impl ClusterFallback for RandomAssignment {
  fn assign(&self, n_assets: usize, k: usize) -> Vec<usize> {
    let k = k.max(1);
    let mut rng = StdRng::seed_from_u64(self.seed);
    (0..n_assets).map(|_| rng.gen_range(0..k)).collect()
  }
}

/// Contiguous equal-sized buckets in index order.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContiguousAssignment;

impl ClusterFallback for ContiguousAssignment {
  fn assign(&self, n_assets: usize, k: usize) -> Vec<usize> {
    let k = k.clamp(1, n_assets.max(1));
    (0..n_assets).map(|i| i * k / n_assets.max(1)).collect()
  }
}

/// Highest Sharpe ratios first; ties keep index order.
#[derive(Clone, Copy, Debug, Default)]
pub struct TopSharpe {
  pub risk_free: f64,
}

impl SelectionFallback for TopSharpe {
  fn select(&self, mu: ArrayView1<f64>, cov: ArrayView2<f64>, k: usize) -> Vec<usize> {
    let scores: Vec<f64> = (0..mu.len())
      .map(|i| {
        let s = sharpe_ratio(mu[i], cov[[i, i]].max(0.0).sqrt(), self.risk_free);
        if s.is_finite() {
          s
        } else {
          f64::NEG_INFINITY
        }
      })
      .collect();

    rank_descending(&scores).into_iter().take(k).collect()
  }
}

/// Indices sorted by score, highest first; ties keep index order.
pub(crate) fn rank_descending(scores: &[f64]) -> Vec<usize> {
  let mut order: Vec<usize> = (0..scores.len()).collect();
  order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
  order
}

#[cfg(test)]
mod tests {
  use ndarray::array;

  use super::*;

  #[test]
  fn random_assignment_is_seeded() {
    let a = RandomAssignment::new(7).assign(50, 4);
    let b = RandomAssignment::new(7).assign(50, 4);
    assert_eq!(a, b);
    assert!(a.iter().all(|&l| l < 4));
    assert_ne!(a, RandomAssignment::new(8).assign(50, 4));
  }

  #[test]
  fn contiguous_assignment_balances() {
    assert_eq!(ContiguousAssignment.assign(6, 3), vec![0, 0, 1, 1, 2, 2]);
    assert_eq!(ContiguousAssignment.assign(2, 5), vec![0, 1]);
  }

  #[test]
  fn top_sharpe_prefers_risk_adjusted_return() {
    let mu = array![0.10, 0.20, 0.05];
    let cov = array![[0.01, 0.0, 0.0], [0.0, 0.16, 0.0], [0.0, 0.0, 0.0001]];
    // sharpe: 1.0, 0.5, 5.0
    let picked = TopSharpe::default().select(mu.view(), cov.view(), 2);
    assert_eq!(picked, vec![2, 0]);
  }
}
