//! Simplified portfolio Value-at-Risk.
//!
//! Averages per-instrument return volatility across open positions (no
//! correlation model) and scales by the normal quantile at the requested
//! confidence. The figure is a heuristic, not a calibrated risk model.

use crate::portfolio::PortfolioState;
use crate::utils::decimal::{mean, safe_div, sample_std_dev, simple_returns};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

/// Standard deviation of simple returns over a close series.
pub fn return_volatility(closes: &[Decimal]) -> Option<Decimal> {
    sample_std_dev(&simple_returns(closes))
}

/// Inverse of the standard normal CDF (Acklam's rational approximation).
///
/// Accurate to roughly 1e-9 over (0, 1). Returns zero outside that range.
pub fn normal_quantile(confidence: Decimal) -> Decimal {
    let p = match confidence.to_f64() {
        Some(p) if p > 0.0 && p < 1.0 => p,
        _ => return Decimal::ZERO,
    };

    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    let x = if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    };

    Decimal::from_f64_retain(x).unwrap_or(Decimal::ZERO)
}

/// Result of one VaR evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct VarReport {
    pub confidence: Decimal,
    /// Loss fraction of total portfolio value
    pub var_fraction: Decimal,
    /// Loss in cash terms
    pub var_amount: Decimal,
    pub total_value: Decimal,
    pub avg_volatility: Decimal,
    /// Positions that contributed a volatility estimate
    pub positions_measured: usize,
}

impl VarReport {
    fn zero(confidence: Decimal, total_value: Decimal) -> Self {
        Self {
            confidence,
            var_fraction: Decimal::ZERO,
            var_amount: Decimal::ZERO,
            total_value,
            avg_volatility: Decimal::ZERO,
            positions_measured: 0,
        }
    }
}

/// Portfolio VaR at `confidence`.
///
/// `volatilities` holds per-symbol return standard deviations; positions
/// without an entry are left out of the average. Yields zero with no open
/// positions or no volatility history.
pub fn portfolio_var(
    state: &PortfolioState,
    prices: &HashMap<String, Decimal>,
    volatilities: &HashMap<String, Decimal>,
    confidence: Decimal,
) -> VarReport {
    let total_value = state.total_value(prices);
    if state.positions.is_empty() || total_value <= Decimal::ZERO {
        return VarReport::zero(confidence, total_value);
    }

    let measured: Vec<Decimal> = state
        .positions
        .keys()
        .filter_map(|symbol| volatilities.get(symbol).copied())
        .collect();
    let Some(avg_volatility) = mean(&measured) else {
        return VarReport::zero(confidence, total_value);
    };

    let var_amount = total_value * avg_volatility * normal_quantile(confidence);

    VarReport {
        confidence,
        var_fraction: safe_div(var_amount, total_value),
        var_amount,
        total_value,
        avg_volatility,
        positions_measured: measured.len(),
    }
}
