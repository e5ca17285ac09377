//! Decimal arithmetic utilities for price statistics.

use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let sum: Decimal = values.iter().sum();
    Some(sum / Decimal::from(values.len()))
}

/// Sample standard deviation (n - 1 denominator).
///
/// Returns `None` with fewer than two observations.
pub fn sample_std_dev(values: &[Decimal]) -> Option<Decimal> {
    if values.len() < 2 {
        return None;
    }
    let avg = mean(values)?;
    let sum_sq: Decimal = values.iter().map(|v| (*v - avg) * (*v - avg)).sum();
    let variance = sum_sq / Decimal::from(values.len() - 1);
    variance.sqrt()
}

/// Fractional change from `from` to `to` (0.01 = +1%).
pub fn pct_change(from: Decimal, to: Decimal) -> Decimal {
    safe_div(to - from, from)
}

/// Simple returns between consecutive values.
pub fn simple_returns(values: &[Decimal]) -> Vec<Decimal> {
    values
        .windows(2)
        .filter(|w| w[0] != Decimal::ZERO)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Express a fraction as a percentage for display.
pub fn to_percent(fraction: Decimal) -> Decimal {
    fraction * dec!(100)
}
