//! # Selection Engine
//!
//! $$
//! \rho = \frac{f(\mathbf x_{\text{pipeline}})}{f(\mathbf x_{\text{global}})},\qquad
//! f(\mathbf x) = q\,\mathbf x^\top\Sigma\mathbf x - \mu^\top\mathbf x
//! $$
//!
//! High-level orchestration: one global solve over the whole universe against
//! independent per-cluster solves that are unioned afterwards.

use std::sync::Arc;
use std::time::Duration;

use ndarray::Array1;
use ndarray::Array2;
use ndarray::Axis;
use rayon::prelude::*;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::clustering::ClusterPartitioner;
use super::clustering::PartitionerConfig;
use super::denoise::CovarianceDenoiser;
use super::denoise::DenoisedCovariance;
use super::denoise::DenoiserConfig;
use super::fallback::rank_descending;
use super::fallback::ClusterFallback;
use super::fallback::SelectionFallback;
use super::fallback::TopSharpe;
use super::selection::portfolio_objective;
use super::selection::validate_cardinality;
use super::selection::BinarySelectionSolver;
use super::selection::SelectionProblem;
use super::statistics::sharpe_ratio;
use super::statistics::ReturnStatistics;
use super::statistics::TRADING_DAYS;
use super::types::AssetUniverse;
use super::types::ClusterAssignment;
use super::types::ComparisonResult;
use super::types::ReturnSeries;
use super::types::SelectionResult;
use super::types::SolverStatus;
use crate::error::Result;
use crate::error::SelectionError;

/// Which picks survive when the pipeline union exceeds the target cardinality.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TruncationOrder {
  /// Keep the first picks in cluster iteration order.
  #[default]
  ClusterOrder,
  /// Keep the highest Sharpe ratios.
  BySharpe,
}

/// Runtime configuration for [`SelectionOrchestrator`].
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
  /// Risk aversion `q` of the global problem.
  pub risk_aversion: f64,
  /// Picks required from each cluster.
  pub min_per_cluster: usize,
  /// Multiplier applied to `q` inside per-cluster sub-problems.
  pub pipeline_risk_discount: f64,
  pub truncation: TruncationOrder,
  /// Wall-clock budget of each MILP solve.
  pub time_limit: Duration,
  /// Solve clusters on the rayon pool.
  pub parallel: bool,
  pub periods_per_year: f64,
  /// Risk-free rate used in Sharpe computations.
  pub risk_free: f64,
  pub denoiser: DenoiserConfig,
  pub partitioner: PartitionerConfig,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      risk_aversion: 0.5,
      min_per_cluster: 3,
      pipeline_risk_discount: 0.8,
      truncation: TruncationOrder::ClusterOrder,
      time_limit: Duration::from_secs(60),
      parallel: false,
      periods_per_year: TRADING_DAYS,
      risk_free: 0.0,
      denoiser: DenoiserConfig::default(),
      partitioner: PartitionerConfig::default(),
    }
  }
}

/// Every intermediate of an end-to-end run.
#[derive(Clone, Debug)]
pub struct PipelineReport {
  pub statistics: ReturnStatistics,
  pub denoised: DenoisedCovariance,
  pub clusters: ClusterAssignment,
  pub comparison: ComparisonResult,
}

impl PipelineReport {
  pub fn universe(&self) -> &AssetUniverse {
    self.statistics.universe()
  }

  pub fn global_tickers(&self) -> Vec<String> {
    self.universe().select(&self.comparison.global.selected)
  }

  pub fn pipeline_tickers(&self) -> Vec<String> {
    self.universe().select(&self.comparison.pipeline.selected)
  }
}

/// Single entry-point engine comparing global and per-cluster selection.
#[derive(Clone, Debug)]
pub struct SelectionOrchestrator {
  config: OrchestratorConfig,
  selection_fallback: Arc<dyn SelectionFallback>,
  cluster_fallback: Option<Arc<dyn ClusterFallback>>,
}

impl SelectionOrchestrator {
  /// Construct a new engine with explicit configuration.
  pub fn new(config: OrchestratorConfig) -> Self {
    let selection_fallback = Arc::new(TopSharpe {
      risk_free: config.risk_free,
    });
    Self {
      config,
      selection_fallback,
      cluster_fallback: None,
    }
  }

  /// Replace the strategy used when a per-cluster solve fails.
  pub fn with_selection_fallback(mut self, fallback: Arc<dyn SelectionFallback>) -> Self {
    self.selection_fallback = fallback;
    self
  }

  /// Replace the strategy used when spectral clustering fails in [`Self::run`].
  pub fn with_cluster_fallback(mut self, fallback: Arc<dyn ClusterFallback>) -> Self {
    self.cluster_fallback = Some(fallback);
    self
  }

  /// Borrow engine configuration.
  pub fn config(&self) -> &OrchestratorConfig {
    &self.config
  }

  fn solver(&self) -> BinarySelectionSolver {
    BinarySelectionSolver::new(self.config.time_limit)
  }

  /// Target cardinality: number of clusters times the per-cluster minimum.
  pub fn target_cardinality(&self, clusters: &ClusterAssignment) -> Result<usize> {
    let requested = clusters.len() * self.config.min_per_cluster;
    validate_cardinality(requested as i64, clusters.n_assets())
  }

  fn check_inputs(
    &self,
    mu: &Array1<f64>,
    cov: &Array2<f64>,
    clusters: &ClusterAssignment,
  ) -> Result<()> {
    let n = mu.len();
    if cov.dim() != (n, n) {
      return Err(SelectionError::shape(
        format!("{n} x {n} covariance"),
        format!("{:?}", cov.dim()),
      ));
    }
    if clusters.n_assets() != n {
      return Err(SelectionError::shape(
        format!("clusters over {n} assets"),
        format!("clusters over {} assets", clusters.n_assets()),
      ));
    }
    Ok(())
  }

  /// One solve over the full universe with cluster minimums enforced.
  pub fn global(
    &self,
    mu: &Array1<f64>,
    cov: &Array2<f64>,
    clusters: &ClusterAssignment,
  ) -> Result<SelectionResult> {
    self.check_inputs(mu, cov, clusters)?;
    let k = self.target_cardinality(clusters)?;

    let problem = SelectionProblem {
      mu: mu.view(),
      cov: cov.view(),
      cardinality: k,
      risk_aversion: self.config.risk_aversion,
      clusters: clusters.clusters(),
      min_per_cluster: self.config.min_per_cluster,
    };
    let result = self.solver().solve(&problem)?;

    info!(
      k,
      objective = result.objective,
      status = %result.status,
      "global selection done"
    );
    Ok(result)
  }

  /// Independent per-cluster solves, unioned in cluster order and truncated
  /// to the target cardinality. The objective uses the undiscounted `q`.
  pub fn pipeline(
    &self,
    mu: &Array1<f64>,
    cov: &Array2<f64>,
    clusters: &ClusterAssignment,
  ) -> Result<SelectionResult> {
    self.check_inputs(mu, cov, clusters)?;
    let k = self.target_cardinality(clusters)?;

    let picks: Vec<(Vec<usize>, SolverStatus)> = if self.config.parallel {
      clusters
        .clusters()
        .par_iter()
        .enumerate()
        .map(|(c, members)| self.select_in_cluster(c, members, mu, cov))
        .collect()
    } else {
      clusters
        .clusters()
        .iter()
        .enumerate()
        .map(|(c, members)| self.select_in_cluster(c, members, mu, cov))
        .collect()
    };

    let status = aggregate_status(picks.iter().map(|(_, s)| *s));
    let union: Vec<usize> = picks.into_iter().flat_map(|(p, _)| p).collect();
    let selected = self.truncate(union, k, mu, cov);
    let objective = portfolio_objective(mu.view(), cov.view(), &selected, self.config.risk_aversion);

    info!(
      k,
      picked = selected.len(),
      objective,
      status = %status,
      "pipeline selection done"
    );
    Ok(SelectionResult::new(selected, objective, status))
  }

  /// Global and pipeline selections with their approximation ratio.
  pub fn compare(
    &self,
    mu: &Array1<f64>,
    cov: &Array2<f64>,
    clusters: &ClusterAssignment,
  ) -> Result<ComparisonResult> {
    let global = self.global(mu, cov, clusters)?;
    let pipeline = self.pipeline(mu, cov, clusters)?;
    let comparison = ComparisonResult::new(global, pipeline);

    info!(ratio = ?comparison.approximation_ratio, "comparison done");
    Ok(comparison)
  }

  /// Statistics, denoising, clustering and comparison from raw returns.
  pub fn run(&self, series: &ReturnSeries) -> Result<PipelineReport> {
    info!(
      assets = series.n_assets(),
      periods = series.n_periods(),
      "running selection pipeline"
    );

    let statistics = ReturnStatistics::estimate(series, self.config.periods_per_year)?;
    let denoised = CovarianceDenoiser::new(self.config.denoiser.clone())
      .denoise(&statistics.covariance, statistics.n_observations)?;
    info!(
      noise = denoised.noise_count,
      lambda_max = denoised.lambda_max,
      market_mode_damped = denoised.market_mode_damped,
      "covariance denoised"
    );

    let partitioner = match &self.cluster_fallback {
      Some(fallback) => {
        ClusterPartitioner::with_fallback(self.config.partitioner.clone(), Arc::clone(fallback))
      }
      None => ClusterPartitioner::new(self.config.partitioner.clone()),
    };
    let clusters = partitioner.partition(&denoised.correlation)?;
    info!(
      clusters = clusters.len(),
      sizes = ?clusters.sizes(),
      fallback_used = clusters.fallback_used(),
      "assets partitioned"
    );

    let comparison = self.compare(&statistics.mean, &denoised.covariance, &clusters)?;

    Ok(PipelineReport {
      statistics,
      denoised,
      clusters,
      comparison,
    })
  }

  /// Solve one cluster; failures fall back to the injected strategy.
  fn select_in_cluster(
    &self,
    cluster: usize,
    members: &[usize],
    mu: &Array1<f64>,
    cov: &Array2<f64>,
  ) -> (Vec<usize>, SolverStatus) {
    let k = self.config.min_per_cluster.min(members.len());
    if k == 0 {
      return (Vec::new(), SolverStatus::Optimal);
    }

    let sub_mu = mu.select(Axis(0), members);
    let sub_cov = cov.select(Axis(0), members).select(Axis(1), members);
    let problem = SelectionProblem::unconstrained(
      sub_mu.view(),
      sub_cov.view(),
      k,
      self.config.risk_aversion * self.config.pipeline_risk_discount,
    );

    let failure = match self.solver().solve(&problem) {
      Ok(r) if !r.is_empty() => {
        debug!(cluster, k, status = %r.status, "cluster solved");
        let picks = r.selected.iter().map(|&i| members[i]).collect();
        return (picks, r.status);
      }
      Ok(r) => SelectionError::SubSelectionFailure {
        cluster,
        reason: format!("solver returned no selection ({})", r.status),
      },
      Err(err) => SelectionError::SubSelectionFailure {
        cluster,
        reason: err.to_string(),
      },
    };

    warn!(%failure, "falling back to heuristic sub-selection");
    let picks = self
      .selection_fallback
      .select(sub_mu.view(), sub_cov.view(), k)
      .into_iter()
      .filter(|&i| i < members.len())
      .take(k)
      .map(|i| members[i])
      .collect();
    (picks, SolverStatus::FallbackUsed)
  }

  // guard only: each cluster contributes at most min_per_cluster picks, so the
  // union built by `pipeline` never exceeds k
  fn truncate(
    &self,
    mut union: Vec<usize>,
    k: usize,
    mu: &Array1<f64>,
    cov: &Array2<f64>,
  ) -> Vec<usize> {
    if union.len() <= k {
      return union;
    }
    warn!(
      picked = union.len(),
      k,
      order = ?self.config.truncation,
      "pipeline union exceeds target, truncating"
    );

    match self.config.truncation {
      TruncationOrder::ClusterOrder => union.truncate(k),
      TruncationOrder::BySharpe => {
        let scores: Vec<f64> = union
          .iter()
          .map(|&i| sharpe_ratio(mu[i], cov[[i, i]].max(0.0).sqrt(), self.config.risk_free))
          .collect();
        union = rank_descending(&scores)
          .into_iter()
          .take(k)
          .map(|pos| union[pos])
          .collect();
      }
    }
    union
  }
}

fn aggregate_status(statuses: impl Iterator<Item = SolverStatus>) -> SolverStatus {
  let mut status = SolverStatus::Optimal;
  for s in statuses {
    match s {
      SolverStatus::FallbackUsed | SolverStatus::Infeasible => return SolverStatus::FallbackUsed,
      SolverStatus::TimedOut => status = SolverStatus::TimedOut,
      SolverStatus::Optimal => {}
    }
  }
  status
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;

  use approx::assert_abs_diff_eq;
  use ndarray::array;
  use ndarray::ArrayView1;
  use ndarray::ArrayView2;
  use tracing_test::traced_test;

  use super::*;

  fn engine(min_per_cluster: usize, risk_aversion: f64) -> SelectionOrchestrator {
    SelectionOrchestrator::new(OrchestratorConfig {
      min_per_cluster,
      risk_aversion,
      time_limit: Duration::from_secs(30),
      ..Default::default()
    })
  }

  #[test]
  fn trivial_instance_has_unit_ratio() {
    let mu = Array1::<f64>::ones(6);
    let cov = Array2::<f64>::eye(6);
    let clusters = ClusterAssignment::new(vec![vec![0, 1, 2], vec![3, 4, 5]], 6).unwrap();

    let cmp = engine(3, 0.5).compare(&mu, &cov, &clusters).unwrap();

    assert_eq!(cmp.global.len(), 6);
    assert_eq!(cmp.pipeline.len(), 6);
    assert_abs_diff_eq!(cmp.global.objective, -3.0, epsilon = 1e-12);
    assert_abs_diff_eq!(cmp.approximation_ratio.unwrap(), 1.0, epsilon = 1e-12);
  }

  #[test]
  fn global_never_loses_to_pipeline() {
    let mu = array![0.30, 0.28, 0.10, 0.25, 0.05, 0.22, 0.15, 0.12];
    let f = array![
      [0.30, 0.05],
      [0.29, 0.06],
      [0.10, 0.02],
      [0.05, 0.25],
      [0.02, 0.10],
      [0.06, 0.24],
      [0.15, 0.15],
      [0.12, 0.10]
    ];
    let cov = f.dot(&f.t()) + Array2::<f64>::eye(8) * 0.01;
    let clusters = ClusterAssignment::new(vec![vec![0, 1, 2, 6], vec![3, 4, 5, 7]], 8).unwrap();

    let cmp = engine(2, 1.0).compare(&mu, &cov, &clusters).unwrap();

    assert_eq!(cmp.global.status, SolverStatus::Optimal);
    assert_eq!(cmp.global.len(), 4);
    assert_eq!(cmp.pipeline.len(), 4);
    assert!(cmp.global.objective <= cmp.pipeline.objective + 1e-9);
  }

  #[test]
  fn parallel_matches_sequential() {
    let mu = array![0.3, 0.1, 0.2, 0.25, 0.05, 0.15];
    let cov = Array2::<f64>::eye(6) * 0.04;
    let clusters = ClusterAssignment::new(vec![vec![0, 1, 2], vec![3, 4, 5]], 6).unwrap();

    let seq = engine(2, 1.0).pipeline(&mu, &cov, &clusters).unwrap();
    let par = SelectionOrchestrator::new(OrchestratorConfig {
      min_per_cluster: 2,
      risk_aversion: 1.0,
      parallel: true,
      ..Default::default()
    })
    .pipeline(&mu, &cov, &clusters)
    .unwrap();

    assert_eq!(seq, par);
    assert_eq!(seq.selected, vec![0, 2, 3, 5]);
  }

  #[test]
  fn target_beyond_universe_is_rejected() {
    let mu = Array1::<f64>::ones(4);
    let cov = Array2::<f64>::eye(4);
    let clusters = ClusterAssignment::new(vec![vec![0, 1], vec![2, 3]], 4).unwrap();
    assert!(matches!(
      engine(3, 0.5).compare(&mu, &cov, &clusters),
      Err(SelectionError::InfeasibleCardinality { .. })
    ));
  }

  #[derive(Debug, Default)]
  struct FirstK {
    calls: AtomicUsize,
  }

  impl SelectionFallback for FirstK {
    fn select(&self, mu: ArrayView1<f64>, _cov: ArrayView2<f64>, k: usize) -> Vec<usize> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      (0..mu.len()).take(k).collect()
    }
  }

  #[test]
  #[traced_test]
  fn failed_cluster_solve_uses_fallback() {
    // a non-finite input makes the first cluster's sub-problem invalid
    let mu = array![f64::NAN, 0.2, 0.1, 0.3, 0.2, 0.1];
    let cov = Array2::<f64>::eye(6) * 0.04;
    let clusters = ClusterAssignment::new(vec![vec![0, 1, 2], vec![3, 4, 5]], 6).unwrap();
    let fallback = Arc::new(FirstK::default());

    let r = engine(2, 1.0)
      .with_selection_fallback(fallback.clone())
      .pipeline(&mu, &cov, &clusters)
      .unwrap();

    assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    assert_eq!(r.status, SolverStatus::FallbackUsed);
    assert_eq!(r.selected, vec![0, 1, 3, 4]);
    assert!(logs_contain("falling back to heuristic sub-selection"));
  }

  #[test]
  fn truncation_orders() {
    let mu = array![0.1, 0.4, 0.2, 0.3];
    let cov = Array2::<f64>::eye(4) * 0.01;
    let union = vec![0, 1, 2, 3];

    let by_cluster = engine(1, 1.0).truncate(union.clone(), 2, &mu, &cov);
    assert_eq!(by_cluster, vec![0, 1]);

    let by_sharpe = SelectionOrchestrator::new(OrchestratorConfig {
      truncation: TruncationOrder::BySharpe,
      ..Default::default()
    })
    .truncate(union, 2, &mu, &cov);
    assert_eq!(by_sharpe, vec![1, 3]);
  }

  #[test]
  fn status_aggregation() {
    use SolverStatus::*;
    assert_eq!(aggregate_status([Optimal, Optimal].into_iter()), Optimal);
    assert_eq!(aggregate_status([Optimal, TimedOut].into_iter()), TimedOut);
    assert_eq!(aggregate_status([TimedOut, FallbackUsed].into_iter()), FallbackUsed);
  }
}
