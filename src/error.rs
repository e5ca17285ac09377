//! Error types for the decision engine.
//!
//! `SkipReason` is the recoverable "skip this instrument this cycle" outcome.
//! `EngineError` covers failures the orchestrator must surface.

use thiserror::Error;

/// Why an instrument was left out of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("no bars returned")]
    NoData,
    #[error("insufficient bars: have {have}, need {need}")]
    InsufficientBars { have: usize, need: usize },
    #[error("rolling standard deviation is zero")]
    ZeroVariance,
    #[error("malformed bar at index {index}")]
    MalformedBar { index: usize },
    #[error("market data request timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("market data request failed: {0}")]
    FetchFailed(String),
}

/// Failures surfaced by the cycle orchestrator and operator commands.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load portfolio state: {0}")]
    StateLoad(#[source] anyhow::Error),
    #[error("failed to acquire portfolio state lock: {0}")]
    StateLock(#[source] anyhow::Error),
    #[error("failed to commit portfolio state after {attempts} attempts: {source}")]
    StateCommit {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("command rejected: unrecognised caller {caller}")]
    Unauthorized { caller: String },
}
