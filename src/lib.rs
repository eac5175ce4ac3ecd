//! # discrete-portfolio
//!
//! $$
//! \min_{\mathbf{x}\in\{0,1\}^n,\ \mathbf 1^\top\mathbf x=K} q\,\mathbf{x}^\top \tilde\Sigma \mathbf{x} - \mu^\top\mathbf{x}
//! $$
//!
//! Discrete (0/1-weighted) portfolio selection over a Marchenko–Pastur denoised
//! covariance, with spectral clustering used to enforce diversification and to
//! split the problem into per-cluster sub-problems.

pub mod error;
pub mod quant;

pub use error::Result;
pub use error::SelectionError;
