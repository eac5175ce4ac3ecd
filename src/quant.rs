//! # Quant
//!
pub mod portfolio;
