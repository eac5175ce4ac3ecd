//! # Binary Selection
//!
//! $$
//! \min_{\mathbf{x}\in\{0,1\}^m} q\sum_{i\le j}(2-\delta_{ij})\,\sigma_{ij}\,y_{ij}-\mu^\top\mathbf{x}
//! \quad\text{s.t.}\quad \mathbf 1^\top\mathbf{x}=K,\ \ y_{ij}\le x_i,\ y_{ij}\le x_j,\ y_{ij}\ge x_i+x_j-1
//! $$
//!
//! Cardinality- and diversification-constrained selection. The quadratic 0/1
//! objective is linearized with one auxiliary binary per unordered pair and
//! handed to a MILP solver under a wall-clock limit. When the limit expires the
//! solver's incumbent is returned with a `TimedOut` status; a greedy incumbent
//! stands in when the solver has none yet.

use std::time::Duration;
use std::time::Instant;

use good_lp::constraint;
use good_lp::microlp;
use good_lp::variable;
use good_lp::Expression;
use good_lp::ProblemVariables;
use good_lp::ResolutionError;
use good_lp::Solution;
use good_lp::SolutionStatus;
use good_lp::SolverModel;
use good_lp::Variable;
use good_lp::WithTimeLimit;
use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::ArrayView2;
use tracing::debug;
use tracing::warn;

use super::types::SelectionResult;
use super::types::SolverStatus;
use crate::error::Result;
use crate::error::SelectionError;

/// One instance of the binary selection problem over `m` candidates.
#[derive(Clone, Debug)]
pub struct SelectionProblem<'a> {
  /// Expected returns of the candidates.
  pub mu: ArrayView1<'a, f64>,
  /// Covariance of the candidates.
  pub cov: ArrayView2<'a, f64>,
  /// Exact number of candidates to select.
  pub cardinality: usize,
  /// Risk-aversion `q`.
  pub risk_aversion: f64,
  /// Clusters over local candidate indices; may be empty.
  pub clusters: &'a [Vec<usize>],
  /// Picks required from every cluster with at least this many members.
  pub min_per_cluster: usize,
}

impl<'a> SelectionProblem<'a> {
  /// Problem without diversification constraints.
  pub fn unconstrained(
    mu: ArrayView1<'a, f64>,
    cov: ArrayView2<'a, f64>,
    cardinality: usize,
    risk_aversion: f64,
  ) -> Self {
    Self {
      mu,
      cov,
      cardinality,
      risk_aversion,
      clusters: &[],
      min_per_cluster: 0,
    }
  }

  pub fn n_candidates(&self) -> usize {
    self.mu.len()
  }

  /// Clusters whose minimum pick count is enforced.
  fn binding_clusters(&self) -> Vec<Vec<usize>> {
    if self.min_per_cluster == 0 {
      return Vec::new();
    }
    self
      .clusters
      .iter()
      .filter(|c| c.len() >= self.min_per_cluster)
      .cloned()
      .collect()
  }

  fn validate(&self) -> Result<()> {
    let m = self.n_candidates();
    if self.cov.dim() != (m, m) {
      return Err(SelectionError::shape(
        format!("{m} x {m} covariance"),
        format!("{:?}", self.cov.dim()),
      ));
    }
    if self.mu.iter().chain(self.cov.iter()).any(|v| !v.is_finite())
      || !self.risk_aversion.is_finite()
    {
      return Err(SelectionError::InvalidInput(
        "selection inputs must be finite".into(),
      ));
    }

    validate_cardinality(self.cardinality as i64, m)?;

    if let Some(bad) = self.clusters.iter().flatten().find(|&&i| i >= m) {
      return Err(SelectionError::InvalidInput(format!(
        "cluster member {bad} out of range for {m} candidates"
      )));
    }

    let required: usize = self.binding_clusters().len() * self.min_per_cluster;
    if required > self.cardinality {
      return Err(SelectionError::InfeasibleCardinality {
        requested: self.cardinality as i64,
        available: m,
        reason: format!("cluster minimums require at least {required} picks"),
      });
    }

    Ok(())
  }
}

/// Check that a requested cardinality lies in `[1, available]`.
pub fn validate_cardinality(requested: i64, available: usize) -> Result<usize> {
  if requested < 1 || requested as u64 > available as u64 {
    return Err(SelectionError::InfeasibleCardinality {
      requested,
      available,
      reason: format!("cardinality must lie in [1, {available}]"),
    });
  }
  Ok(requested as usize)
}

/// `q * x'Σx - μ'x` for the 0/1 vector with ones at `selected`.
pub fn portfolio_objective(
  mu: ArrayView1<f64>,
  cov: ArrayView2<f64>,
  selected: &[usize],
  risk_aversion: f64,
) -> f64 {
  let mut quad = 0.0;
  for &i in selected {
    for &j in selected {
      quad += cov[[i, j]];
    }
  }
  let ret: f64 = selected.iter().map(|&i| mu[i]).sum();
  risk_aversion * quad - ret
}

/// MILP-backed solver for [`SelectionProblem`].
#[derive(Clone, Debug)]
pub struct BinarySelectionSolver {
  time_limit: Duration,
}

impl Default for BinarySelectionSolver {
  fn default() -> Self {
    Self::new(Duration::from_secs(60))
  }
}

impl BinarySelectionSolver {
  pub fn new(time_limit: Duration) -> Self {
    Self { time_limit }
  }

  pub fn time_limit(&self) -> Duration {
    self.time_limit
  }

  /// Solve the problem. Errors only on invalid input or infeasible
  /// cardinality; solver trouble is reported through [`SolverStatus`].
  pub fn solve(&self, problem: &SelectionProblem) -> Result<SelectionResult> {
    problem.validate()?;

    let m = problem.n_candidates();
    let k = problem.cardinality;
    let q = problem.risk_aversion;

    if k == m {
      let all: Vec<usize> = (0..m).collect();
      let objective = portfolio_objective(problem.mu, problem.cov, &all, q);
      return Ok(SelectionResult::new(all, objective, SolverStatus::Optimal));
    }

    let input = MilpInput {
      mu: problem.mu.to_owned(),
      cov: problem.cov.to_owned(),
      cardinality: k,
      risk_aversion: q,
      clusters: problem.binding_clusters(),
      min_per_cluster: problem.min_per_cluster,
    };

    if self.time_limit.is_zero() {
      warn!(m, k, "zero time budget, returning heuristic incumbent");
      return Ok(heuristic_result(&input, SolverStatus::TimedOut));
    }

    let started = Instant::now();
    let result = match solve_milp(&input, self.time_limit) {
      Ok((selected, status)) if selected.len() == k => {
        let objective = portfolio_objective(problem.mu, problem.cov, &selected, q);
        let status = match status {
          SolutionStatus::Optimal => SolverStatus::Optimal,
          SolutionStatus::TimeLimit | SolutionStatus::GapLimit => {
            warn!(
              m,
              k,
              limit_ms = self.time_limit.as_millis() as u64,
              "solver time limit reached, returning its incumbent"
            );
            SolverStatus::TimedOut
          }
        };
        SelectionResult::new(selected, objective, status)
      }
      Ok((selected, _)) => {
        warn!(
          expected = k,
          found = selected.len(),
          "solver returned wrong cardinality, using heuristic incumbent"
        );
        heuristic_result(&input, SolverStatus::FallbackUsed)
      }
      Err(ResolutionError::Infeasible) => {
        warn!(m, k, "solver reported infeasible model");
        SelectionResult::empty(SolverStatus::Infeasible)
      }
      // microlp reports an expired budget without any feasible point this way
      Err(ResolutionError::Other(reason)) => {
        warn!(
          m,
          k,
          %reason,
          "no solver incumbent within time limit, using heuristic incumbent"
        );
        heuristic_result(&input, SolverStatus::TimedOut)
      }
      Err(err) => {
        warn!(%err, "solver error, using heuristic incumbent");
        heuristic_result(&input, SolverStatus::FallbackUsed)
      }
    };

    debug!(
      m,
      k,
      status = %result.status,
      objective = result.objective,
      elapsed_ms = started.elapsed().as_millis() as u64,
      "binary selection solved"
    );

    Ok(result)
  }
}

/// Problem data with only the binding clusters kept.
#[derive(Debug)]
struct MilpInput {
  mu: Array1<f64>,
  cov: Array2<f64>,
  cardinality: usize,
  risk_aversion: f64,
  clusters: Vec<Vec<usize>>,
  min_per_cluster: usize,
}

impl MilpInput {
  fn objective(&self, selected: &[usize]) -> f64 {
    portfolio_objective(self.mu.view(), self.cov.view(), selected, self.risk_aversion)
  }
}

fn solve_milp(
  input: &MilpInput,
  time_limit: Duration,
) -> std::result::Result<(Vec<usize>, SolutionStatus), ResolutionError> {
  let m = input.mu.len();
  let q = input.risk_aversion;
  let mut vars = ProblemVariables::new();

  let x: Vec<Variable> = (0..m).map(|_| vars.add(variable().binary())).collect();
  let mut pairs: Vec<(usize, usize, Variable)> = Vec::with_capacity(m * (m + 1) / 2);
  for i in 0..m {
    for j in i..m {
      pairs.push((i, j, vars.add(variable().binary())));
    }
  }

  let mut objective = Expression::with_capacity(m + pairs.len());
  for (i, &xi) in x.iter().enumerate() {
    objective.add_mul(-input.mu[i], xi);
  }
  for &(i, j, y) in &pairs {
    let weight = if i == j { 1.0 } else { 2.0 };
    objective.add_mul(q * weight * input.cov[[i, j]], y);
  }

  let mut model = vars
    .minimise(objective)
    .using(microlp)
    .with_time_limit(time_limit.as_secs_f64());

  let mut total = Expression::with_capacity(m);
  for &xi in &x {
    total.add_mul(1.0, xi);
  }
  let k = input.cardinality as f64;
  model.add_constraint(constraint!(total == k));

  let min = input.min_per_cluster as f64;
  for members in &input.clusters {
    let mut picked = Expression::with_capacity(members.len());
    for &i in members {
      picked.add_mul(1.0, x[i]);
    }
    model.add_constraint(constraint!(picked >= min));
  }

  for &(i, j, y) in &pairs {
    let (xi, xj) = (x[i], x[j]);
    model.add_constraint(constraint!(y <= xi));
    model.add_constraint(constraint!(y <= xj));
    model.add_constraint(constraint!(y >= xi + xj - 1.0));
  }

  let solution = model.solve()?;
  let selected = x
    .iter()
    .enumerate()
    .filter(|&(_, &xi)| solution.value(xi) > 0.5)
    .map(|(i, _)| i)
    .collect();
  Ok((selected, solution.status()))
}

fn heuristic_result(input: &MilpInput, status: SolverStatus) -> SelectionResult {
  let selected = heuristic_incumbent(input);
  let objective = input.objective(&selected);
  SelectionResult::new(selected, objective, status)
}

/// Greedy construction honoring cluster minimums, refined by pairwise swaps.
fn heuristic_incumbent(input: &MilpInput) -> Vec<usize> {
  let m = input.mu.len();
  let k = input.cardinality.min(m);
  let mut greedy = Greedy::new(input);

  for members in &input.clusters {
    for _ in 0..input.min_per_cluster {
      if let Some(i) = greedy.cheapest(members.iter().copied()) {
        greedy.pick(i);
      }
    }
  }

  while greedy.count < k {
    match greedy.cheapest(0..m) {
      Some(i) => greedy.pick(i),
      None => break,
    }
  }

  let mut selected: Vec<usize> = (0..m).filter(|&i| greedy.chosen[i]).collect();
  improve_by_swaps(input, &mut selected);
  selected
}

struct Greedy<'a> {
  input: &'a MilpInput,
  chosen: Vec<bool>,
  count: usize,
  // cross[i] = sum over chosen j of cov[i, j]
  cross: Vec<f64>,
}

impl<'a> Greedy<'a> {
  fn new(input: &'a MilpInput) -> Self {
    let m = input.mu.len();
    Self {
      input,
      chosen: vec![false; m],
      count: 0,
      cross: vec![0.0; m],
    }
  }

  fn marginal(&self, i: usize) -> f64 {
    let cov = &self.input.cov;
    self.input.risk_aversion * (cov[[i, i]] + 2.0 * self.cross[i]) - self.input.mu[i]
  }

  fn cheapest(&self, candidates: impl Iterator<Item = usize>) -> Option<usize> {
    candidates
      .filter(|&i| !self.chosen[i])
      .map(|i| (i, self.marginal(i)))
      .min_by(|a, b| a.1.total_cmp(&b.1))
      .map(|(i, _)| i)
  }

  fn pick(&mut self, i: usize) {
    self.chosen[i] = true;
    self.count += 1;
    for (j, c) in self.cross.iter_mut().enumerate() {
      *c += self.input.cov[[i, j]];
    }
  }
}

fn swap_keeps_minimums(input: &MilpInput, selected: &[usize], out: usize, inc: usize) -> bool {
  input.clusters.iter().all(|members| {
    let removes = members.contains(&out);
    let adds = members.contains(&inc);
    if !removes || adds {
      return true;
    }
    let count = selected.iter().filter(|i| members.contains(i)).count();
    count > input.min_per_cluster
  })
}

fn improve_by_swaps(input: &MilpInput, selected: &mut [usize]) {
  let m = input.mu.len();
  let mut current = input.objective(selected);

  for _ in 0..100 {
    let mut improved = false;
    for pos in 0..selected.len() {
      for inc in 0..m {
        if selected.contains(&inc) {
          continue;
        }
        let out = selected[pos];
        if !swap_keeps_minimums(input, selected, out, inc) {
          continue;
        }
        selected[pos] = inc;
        let candidate = input.objective(selected);
        if candidate < current - 1e-12 {
          current = candidate;
          improved = true;
        } else {
          selected[pos] = out;
        }
      }
    }
    if !improved {
      break;
    }
  }
}
