//! Forced-liquidation target selection on a VaR breach.

use crate::config::LiquidationPolicy;
use rust_decimal::Decimal;
use std::cmp::Ordering;

/// An open position considered for forced liquidation.
#[derive(Debug, Clone)]
pub struct LiquidationCandidate {
    pub symbol: String,
    /// Unrealized P&L fraction at the current price
    pub pnl_fraction: Decimal,
    /// Return standard deviation, when history was available
    pub volatility: Option<Decimal>,
}

/// Pick the position to close. Deterministic: ties go to the
/// lexicographically smallest symbol.
pub fn select_target(
    policy: LiquidationPolicy,
    candidates: &[LiquidationCandidate],
) -> Option<&LiquidationCandidate> {
    candidates.iter().min_by(|a, b| {
        let primary = match policy {
            // Most negative P&L first
            LiquidationPolicy::LargestLoss => a.pnl_fraction.cmp(&b.pnl_fraction),
            LiquidationPolicy::HighestVolatility => {
                let va = a.volatility.unwrap_or(Decimal::ZERO);
                let vb = b.volatility.unwrap_or(Decimal::ZERO);
                vb.cmp(&va)
            }
        };
        match primary {
            Ordering::Equal => a.symbol.cmp(&b.symbol),
            other => other,
        }
    })
}
