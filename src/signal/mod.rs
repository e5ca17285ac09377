//! Signal evaluation.
//!
//! Derives per-instrument statistics from bar snapshots:
//! - Rolling mean, standard deviation and z-score
//! - Average true range
//! - Volume ratio and on-balance-volume trend
//! - Market regime from a broad proxy

pub mod indicators;
mod evaluator;
mod regime;

pub use evaluator::{Signal, SignalEvaluator};
pub use indicators::ObvTrend;
pub use regime::{MarketRegime, RegimeClassifier};
