//! Risk sizing and trading halts.
//!
//! - Half-Kelly capital fraction with a safety ceiling
//! - Simplified portfolio Value-at-Risk
//! - Losing-streak circuit breaker with timed cooldown
//! - Deterministic forced-liquidation target selection

mod circuit_breaker;
mod kelly;
mod liquidation;
mod var;

pub use circuit_breaker::{BreakerCheck, BreakerState, CircuitBreaker};
pub use kelly::{KellySizer, TradeStats, MIN_EXITS_FOR_STATS};
pub use liquidation::{select_target, LiquidationCandidate};
pub use var::{normal_quantile, portfolio_var, return_volatility, VarReport};
