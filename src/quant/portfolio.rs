//! # Portfolio
//!
//! $$
//! \min_{\mathbf{x}\in\{0,1\}^n} q\,\mathbf{x}^\top \Sigma \mathbf{x} - \mu^\top\mathbf{x}
//! $$
//!
//! Discrete portfolio selection: denoised covariance, spectral clustering and a
//! cardinality-constrained binary solve, global against per-cluster.

pub mod clustering;
pub mod data;
pub mod denoise;
pub mod engine;
pub mod fallback;
pub mod report;
pub mod selection;
pub mod statistics;
pub mod synthetic;
pub mod types;

pub use clustering::ClusterPartitioner;
pub use clustering::PartitionerConfig;
pub use data::PriceTable;
pub use denoise::CovarianceDenoiser;
pub use denoise::DenoisedCovariance;
pub use denoise::DenoiserConfig;
pub use engine::OrchestratorConfig;
pub use engine::PipelineReport;
pub use engine::SelectionOrchestrator;
pub use engine::TruncationOrder;
pub use fallback::ClusterFallback;
pub use fallback::ContiguousAssignment;
pub use fallback::RandomAssignment;
pub use fallback::SelectionFallback;
pub use fallback::TopSharpe;
pub use selection::portfolio_objective;
pub use selection::validate_cardinality;
pub use selection::BinarySelectionSolver;
pub use selection::SelectionProblem;
pub use statistics::AssetMetrics;
pub use statistics::ReturnStatistics;
pub use statistics::TRADING_DAYS;
pub use synthetic::SyntheticUniverse;
pub use types::approximation_ratio;
pub use types::AssetUniverse;
pub use types::ClusterAssignment;
pub use types::ComparisonResult;
pub use types::ReturnSeries;
pub use types::SelectionResult;
pub use types::SolverStatus;
