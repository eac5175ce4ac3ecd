//! # Errors
//!
//! $$
//! \mathcal{E} = \{\text{data},\ \text{cardinality},\ \text{shape},\ \text{recovered}\}
//! $$
//!
//! Error taxonomy for the selection pipeline. Data-sufficiency and cardinality
//! errors are fatal and surface to the caller. Clustering and per-cluster solve
//! failures are recovered inside the orchestrator and only appear in logs.

use thiserror::Error;

/// Errors produced by the portfolio selection pipeline.
#[derive(Debug, Error)]
pub enum SelectionError {
  /// Too few return observations to estimate a covariance matrix.
  #[error("insufficient data: {observations} observations, at least {required} required")]
  InsufficientData {
    observations: usize,
    required: usize,
  },

  /// Requested cardinality is outside `[1, available]` or cluster minimums cannot be met.
  #[error("infeasible cardinality {requested} for {available} candidates: {reason}")]
  InfeasibleCardinality {
    requested: i64,
    available: usize,
    reason: String,
  },

  /// Matrix or vector dimensions disagree.
  #[error("shape mismatch: expected {expected}, found {found}")]
  ShapeMismatch { expected: String, found: String },

  /// Spectral clustering could not produce labels.
  #[error("clustering failed: {0}")]
  ClusteringFailure(String),

  /// A per-cluster selection could not be solved.
  #[error("sub-selection failed for cluster {cluster}: {reason}")]
  SubSelectionFailure { cluster: usize, reason: String },

  /// Input values are outside their valid domain.
  #[error("invalid input: {0}")]
  InvalidInput(String),

  /// Malformed price table text.
  #[error("parse error on line {line}: {message}")]
  Parse { line: usize, message: String },

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, SelectionError>;

impl SelectionError {
  pub(crate) fn shape(expected: impl Into<String>, found: impl Into<String>) -> Self {
    Self::ShapeMismatch {
      expected: expected.into(),
      found: found.into(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn display_includes_counts() {
    let err = SelectionError::InsufficientData {
      observations: 1,
      required: 2,
    };
    assert_eq!(
      err.to_string(),
      "insufficient data: 1 observations, at least 2 required"
    );
  }

  #[test]
  fn parse_error_names_line() {
    let err = SelectionError::Parse {
      line: 3,
      message: "invalid price 'abc'".into(),
    };
    assert_eq!(err.to_string(), "parse error on line 3: invalid price 'abc'");
  }
}
