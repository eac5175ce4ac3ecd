//! # Portfolio Types
//!
//! $$
//! \mathbf{x}^\*=\arg\min_{\mathbf{x}\in\{0,1\}^n} q\,\mathbf{x}^\top \Sigma \mathbf{x}-\mu^\top\mathbf{x}
//! $$
//!
//! Shared value types for the selection pipeline. Every value is built once and
//! never mutated afterwards.

use std::fmt::Display;
use std::ops::Index;
use std::sync::Arc;

use ndarray::Array2;

use crate::error::Result;
use crate::error::SelectionError;

/// Ordered asset identifiers. Index order is the canonical index space of every
/// vector and matrix downstream. Cloning is cheap and shares the same list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetUniverse {
  ids: Arc<[String]>,
}

impl AssetUniverse {
  /// Build a universe from identifiers. Duplicates are rejected.
  pub fn new<I, S>(ids: I) -> Result<Self>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
    for (i, id) in ids.iter().enumerate() {
      if ids[..i].contains(id) {
        return Err(SelectionError::InvalidInput(format!(
          "duplicate asset identifier '{id}'"
        )));
      }
    }

    Ok(Self { ids: ids.into() })
  }

  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  pub fn ids(&self) -> &[String] {
    &self.ids
  }

  /// Identifiers for the given indices, in the order supplied.
  pub fn select(&self, indices: &[usize]) -> Vec<String> {
    indices
      .iter()
      .filter_map(|&i| self.ids.get(i).cloned())
      .collect()
  }

  /// Sub-universe keeping only `indices`.
  pub fn subset(&self, indices: &[usize]) -> Self {
    Self {
      ids: self.select(indices).into(),
    }
  }
}

impl Index<usize> for AssetUniverse {
  type Output = str;

  fn index(&self, index: usize) -> &Self::Output {
    &self.ids[index]
  }
}

/// Per-period simple returns, rows = periods, columns = assets.
#[derive(Clone, Debug)]
pub struct ReturnSeries {
  universe: AssetUniverse,
  returns: Array2<f64>,
}

impl ReturnSeries {
  /// Wrap a returns matrix. Column count must match the universe and every
  /// entry must be finite.
  pub fn new(universe: AssetUniverse, returns: Array2<f64>) -> Result<Self> {
    if returns.ncols() != universe.len() {
      return Err(SelectionError::shape(
        format!("{} return columns", universe.len()),
        format!("{} columns", returns.ncols()),
      ));
    }

    if let Some(((t, i), v)) = returns.indexed_iter().find(|(_, v)| !v.is_finite()) {
      return Err(SelectionError::InvalidInput(format!(
        "non-finite return {v} at period {t} for '{}'",
        &universe[i]
      )));
    }

    Ok(Self { universe, returns })
  }

  pub fn universe(&self) -> &AssetUniverse {
    &self.universe
  }

  pub fn returns(&self) -> &Array2<f64> {
    &self.returns
  }

  pub fn n_periods(&self) -> usize {
    self.returns.nrows()
  }

  pub fn n_assets(&self) -> usize {
    self.returns.ncols()
  }
}

/// Outcome reported by the binary selection solver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverStatus {
  /// The MILP solver proved optimality.
  Optimal,
  /// The solver reported the model infeasible; the selection is empty.
  Infeasible,
  /// The wall-clock limit expired; the selection is the best heuristic incumbent.
  TimedOut,
  /// A fallback heuristic replaced the solver for at least one sub-problem.
  FallbackUsed,
}

impl SolverStatus {
  pub fn is_optimal(self) -> bool {
    matches!(self, Self::Optimal)
  }
}

impl Display for SolverStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SolverStatus::Optimal => write!(f, "optimal"),
      SolverStatus::Infeasible => write!(f, "infeasible"),
      SolverStatus::TimedOut => write!(f, "timed-out"),
      SolverStatus::FallbackUsed => write!(f, "fallback-used"),
    }
  }
}

/// Chosen asset indices together with the objective they attain.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectionResult {
  /// Selected indices, ascending.
  pub selected: Vec<usize>,
  /// `q * x'Σx - μ'x` evaluated on the selection.
  pub objective: f64,
  pub status: SolverStatus,
}

impl SelectionResult {
  pub(crate) fn new(mut selected: Vec<usize>, objective: f64, status: SolverStatus) -> Self {
    selected.sort_unstable();
    selected.dedup();
    Self {
      selected,
      objective,
      status,
    }
  }

  pub(crate) fn empty(status: SolverStatus) -> Self {
    Self {
      selected: Vec::new(),
      objective: 0.0,
      status,
    }
  }

  pub fn len(&self) -> usize {
    self.selected.len()
  }

  pub fn is_empty(&self) -> bool {
    self.selected.is_empty()
  }
}

/// Global and pipeline selections side by side.
#[derive(Clone, Debug)]
pub struct ComparisonResult {
  pub global: SelectionResult,
  pub pipeline: SelectionResult,
  /// `pipeline.objective / global.objective`, undefined when the global objective is zero.
  pub approximation_ratio: Option<f64>,
}

impl ComparisonResult {
  pub(crate) fn new(global: SelectionResult, pipeline: SelectionResult) -> Self {
    let approximation_ratio = approximation_ratio(pipeline.objective, global.objective);
    Self {
      global,
      pipeline,
      approximation_ratio,
    }
  }
}

/// Ratio of a heuristic objective to the reference objective.
pub fn approximation_ratio(heuristic: f64, reference: f64) -> Option<f64> {
  if reference.abs() <= 1e-12 || !reference.is_finite() || !heuristic.is_finite() {
    None
  } else {
    Some(heuristic / reference)
  }
}

/// Disjoint, non-empty clusters covering every asset index exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterAssignment {
  clusters: Vec<Vec<usize>>,
  n_assets: usize,
  fallback_used: bool,
}

impl ClusterAssignment {
  /// Build from explicit clusters. Members are sorted, empty clusters dropped,
  /// and the partition property is checked.
  pub fn new(clusters: Vec<Vec<usize>>, n_assets: usize) -> Result<Self> {
    Self::with_fallback_flag(clusters, n_assets, false)
  }

  pub(crate) fn with_fallback_flag(
    clusters: Vec<Vec<usize>>,
    n_assets: usize,
    fallback_used: bool,
  ) -> Result<Self> {
    let mut seen = vec![false; n_assets];
    let mut out = Vec::with_capacity(clusters.len());

    for mut members in clusters {
      if members.is_empty() {
        continue;
      }
      members.sort_unstable();
      for &i in &members {
        match seen.get_mut(i) {
          Some(flag) if !*flag => *flag = true,
          Some(_) => {
            return Err(SelectionError::InvalidInput(format!(
              "asset {i} assigned to more than one cluster"
            )))
          }
          None => {
            return Err(SelectionError::InvalidInput(format!(
              "asset index {i} out of range for {n_assets} assets"
            )))
          }
        }
      }
      out.push(members);
    }

    if let Some(missing) = seen.iter().position(|s| !s) {
      return Err(SelectionError::InvalidInput(format!(
        "asset {missing} not assigned to any cluster"
      )));
    }

    Ok(Self {
      clusters: out,
      n_assets,
      fallback_used,
    })
  }

  pub fn clusters(&self) -> &[Vec<usize>] {
    &self.clusters
  }

  pub fn len(&self) -> usize {
    self.clusters.len()
  }

  pub fn is_empty(&self) -> bool {
    self.clusters.is_empty()
  }

  pub fn n_assets(&self) -> usize {
    self.n_assets
  }

  /// Whether the clustering fallback produced this partition.
  pub fn fallback_used(&self) -> bool {
    self.fallback_used
  }

  pub fn sizes(&self) -> Vec<usize> {
    self.clusters.iter().map(Vec::len).collect()
  }

  pub fn label_of(&self, asset: usize) -> Option<usize> {
    self.clusters.iter().position(|c| c.binary_search(&asset).is_ok())
  }

  /// Cluster id per asset index.
  pub fn labels(&self) -> Vec<usize> {
    let mut labels = vec![0; self.n_assets];
    for (c, members) in self.clusters.iter().enumerate() {
      for &i in members {
        labels[i] = c;
      }
    }
    labels
  }
}
