//! # Spectral Clustering
//!
//! $$
//! A_{ij} = \rho_{ij}^2,\qquad M = D^{-1/2} A D^{-1/2}
//! $$
//!
//! Balanced community detection over the cleaned correlation matrix. The top
//! eigenvectors of the normalized affinity embed every asset, k-means groups the
//! embedding, and two repair passes merge undersized clusters and split large
//! ones until the requested count is reached where possible.

use std::sync::Arc;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use tracing::debug;
use tracing::warn;

use super::denoise::sorted_eigen;
use super::fallback::ClusterFallback;
use super::fallback::RandomAssignment;
use super::types::ClusterAssignment;
use crate::error::Result;
use crate::error::SelectionError;

/// Configuration for [`ClusterPartitioner`].
#[derive(Clone, Debug)]
pub struct PartitionerConfig {
  /// Target number of clusters `k`.
  pub n_clusters: usize,
  /// Minimum members per cluster after balancing.
  pub min_size: usize,
  /// Seed for k-means initialization and the balancing pass.
  pub seed: u64,
  /// Independent k-means restarts; the lowest inertia wins.
  pub n_init: usize,
  /// Lloyd iterations per restart.
  pub max_iter: usize,
}

impl Default for PartitionerConfig {
  fn default() -> Self {
    Self {
      n_clusters: 4,
      min_size: 3,
      seed: 42,
      n_init: 10,
      max_iter: 300,
    }
  }
}

/// Spectral partitioner with an injectable fallback.
#[derive(Clone, Debug)]
pub struct ClusterPartitioner {
  config: PartitionerConfig,
  fallback: Arc<dyn ClusterFallback>,
}

impl ClusterPartitioner {
  /// Partitioner falling back to seeded uniform random assignment.
  pub fn new(config: PartitionerConfig) -> Self {
    let fallback = Arc::new(RandomAssignment::new(config.seed));
    Self { config, fallback }
  }

  pub fn with_fallback(config: PartitionerConfig, fallback: Arc<dyn ClusterFallback>) -> Self {
    Self { config, fallback }
  }

  pub fn config(&self) -> &PartitionerConfig {
    &self.config
  }

  /// Partition assets given their (denoised) correlation matrix.
  pub fn partition(&self, correlation: &Array2<f64>) -> Result<ClusterAssignment> {
    let n = correlation.nrows();
    if correlation.ncols() != n {
      return Err(SelectionError::shape(
        "square correlation matrix",
        format!("{} x {}", n, correlation.ncols()),
      ));
    }
    if n == 0 {
      return ClusterAssignment::new(Vec::new(), 0);
    }

    let k = self.config.n_clusters;
    let affinity = affinity_matrix(correlation);

    let (labels, fallback_used) = match spectral_labels(&affinity, k, &self.config) {
      Ok(labels) => (labels, false),
      Err(err) => {
        warn!(%err, n, k, "spectral clustering failed, falling back");
        (self.fallback.assign(n, k), true)
      }
    };

    let mut clusters = vec![Vec::new(); k.max(1)];
    for (i, &l) in labels.iter().enumerate() {
      let l = l.min(clusters.len() - 1);
      clusters[l].push(i);
    }
    clusters.retain(|c| !c.is_empty());

    let mut rng = StdRng::seed_from_u64(self.config.seed ^ 0x5EED_BA1A_4CE0_0001);
    let clusters = rebalance(clusters, k, self.config.min_size, &mut rng);

    debug!(
      n,
      k,
      produced = clusters.len(),
      sizes = ?clusters.iter().map(Vec::len).collect::<Vec<_>>(),
      fallback_used,
      "partitioned assets"
    );

    ClusterAssignment::with_fallback_flag(clusters, n, fallback_used)
  }
}

/// Squared-correlation affinity with unit diagonal, symmetrized.
pub fn affinity_matrix(correlation: &Array2<f64>) -> Array2<f64> {
  let n = correlation.nrows();
  Array2::from_shape_fn((n, n), |(i, j)| {
    if i == j {
      1.0
    } else {
      let a = correlation[[i, j]].powi(2);
      let b = correlation[[j, i]].powi(2);
      0.5 * (a + b)
    }
  })
}

/// Merge undersized clusters into random survivors, then split the largest
/// cluster by index order until `k` clusters exist or none is large enough.
/// Overflow beyond `k` is folded into the last kept cluster.
pub fn rebalance(
  mut clusters: Vec<Vec<usize>>,
  k: usize,
  min_size: usize,
  rng: &mut StdRng,
) -> Vec<Vec<usize>> {
  clusters.retain(|c| !c.is_empty());

  while clusters.len() > 1 {
    let Some(pos) = clusters.iter().position(|c| c.len() < min_size) else {
      break;
    };
    let small = clusters.remove(pos);
    let target = rng.gen_range(0..clusters.len());
    clusters[target].extend(small);
  }

  let split_threshold = (2 * min_size).max(2);
  while clusters.len() < k {
    let Some((idx, len)) = clusters
      .iter()
      .map(Vec::len)
      .enumerate()
      .fold(None, |best: Option<(usize, usize)>, (i, len)| match best {
        Some((_, b)) if b >= len => best,
        _ => Some((i, len)),
      })
    else {
      break;
    };
    if len < split_threshold {
      break;
    }

    let mut members = std::mem::take(&mut clusters[idx]);
    members.sort_unstable();
    let second = members.split_off(len / 2);
    clusters[idx] = members;
    clusters.push(second);
  }

  if k > 0 && clusters.len() > k {
    let overflow: Vec<usize> = clusters.drain(k..).flatten().collect();
    clusters[k - 1].extend(overflow);
  }

  for c in clusters.iter_mut() {
    c.sort_unstable();
  }
  clusters
}

fn spectral_labels(affinity: &Array2<f64>, k: usize, config: &PartitionerConfig) -> Result<Vec<usize>> {
  let n = affinity.nrows();
  if k == 0 {
    return Err(SelectionError::ClusteringFailure(
      "cluster count must be positive".into(),
    ));
  }
  if k > n {
    return Err(SelectionError::ClusteringFailure(format!(
      "cannot form {k} clusters from {n} assets"
    )));
  }
  if affinity.iter().any(|v| !v.is_finite()) {
    return Err(SelectionError::ClusteringFailure(
      "affinity contains non-finite values".into(),
    ));
  }
  if k == 1 {
    return Ok(vec![0; n]);
  }

  let degree: Vec<f64> = affinity.rows().into_iter().map(|r| r.sum()).collect();
  if degree.iter().any(|&d| d <= 1e-12) {
    return Err(SelectionError::ClusteringFailure(
      "affinity graph has an isolated node".into(),
    ));
  }
  let inv_sqrt: Vec<f64> = degree.iter().map(|d| 1.0 / d.sqrt()).collect();
  let normalized = Array2::from_shape_fn((n, n), |(i, j)| {
    inv_sqrt[i] * affinity[[i, j]] * inv_sqrt[j]
  });

  let (_, vectors) = sorted_eigen(&normalized);
  let mut embedding = Array2::from_shape_fn((n, k), |(i, c)| vectors[(i, c)]);
  for mut row in embedding.rows_mut() {
    let norm = row.dot(&row).sqrt();
    if !norm.is_finite() {
      return Err(SelectionError::ClusteringFailure(
        "non-finite spectral embedding".into(),
      ));
    }
    if norm > 1e-12 {
      row /= norm;
    }
  }

  let mut rng = StdRng::seed_from_u64(config.seed);
  let mut best: Option<(f64, Vec<usize>)> = None;
  for _ in 0..config.n_init.max(1) {
    let (inertia, labels) = kmeans(&embedding, k, config.max_iter, &mut rng);
    if best.as_ref().map_or(true, |(b, _)| inertia < *b) {
      best = Some((inertia, labels));
    }
  }

  best
    .map(|(_, labels)| labels)
    .ok_or_else(|| SelectionError::ClusteringFailure("k-means produced no labelling".into()))
}

fn squared_distance(points: &Array2<f64>, i: usize, centers: &Array2<f64>, c: usize) -> f64 {
  points
    .row(i)
    .iter()
    .zip(centers.row(c).iter())
    .map(|(a, b)| (a - b) * (a - b))
    .sum()
}

/// k-means++ seeding followed by Lloyd iterations. Returns inertia and labels.
fn kmeans(points: &Array2<f64>, k: usize, max_iter: usize, rng: &mut StdRng) -> (f64, Vec<usize>) {
  let (n, dim) = points.dim();
  let mut centers = Array2::<f64>::zeros((k, dim));

  let first = rng.gen_range(0..n);
  centers.row_mut(0).assign(&points.row(first));
  let mut closest: Vec<f64> = (0..n).map(|i| squared_distance(points, i, &centers, 0)).collect();
  for c in 1..k {
    let total: f64 = closest.iter().sum();
    let pick = if total > 1e-300 {
      let mut target = rng.gen::<f64>() * total;
      let mut chosen = n - 1;
      for (i, &d) in closest.iter().enumerate() {
        if target < d {
          chosen = i;
          break;
        }
        target -= d;
      }
      chosen
    } else {
      rng.gen_range(0..n)
    };
    centers.row_mut(c).assign(&points.row(pick));
    for (i, d) in closest.iter_mut().enumerate() {
      *d = d.min(squared_distance(points, i, &centers, c));
    }
  }

  let mut labels = vec![usize::MAX; n];
  for _ in 0..max_iter.max(1) {
    let mut changed = false;
    for (i, label) in labels.iter_mut().enumerate() {
      let nearest = (0..k)
        .map(|c| (c, squared_distance(points, i, &centers, c)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(c, _)| c);
      if *label != nearest {
        *label = nearest;
        changed = true;
      }
    }

    let mut sums = Array2::<f64>::zeros((k, dim));
    let mut counts = vec![0usize; k];
    for (i, &l) in labels.iter().enumerate() {
      let mut row = sums.row_mut(l);
      row += &points.row(i);
      counts[l] += 1;
    }
    for c in 0..k {
      if counts[c] > 0 {
        let mean = &sums.row(c) / counts[c] as f64;
        centers.row_mut(c).assign(&mean);
      } else {
        // re-seed an empty center at the point farthest from its own center
        let far = (0..n)
          .map(|i| (i, squared_distance(points, i, &centers, labels[i])))
          .max_by(|a, b| a.1.total_cmp(&b.1))
          .map_or(0, |(i, _)| i);
        centers.row_mut(c).assign(&points.row(far));
        changed = true;
      }
    }

    if !changed {
      break;
    }
  }

  let inertia = labels
    .iter()
    .enumerate()
    .map(|(i, &l)| squared_distance(points, i, &centers, l))
    .sum();
  (inertia, labels)
}
