//! Indicator math over bar slices.
//!
//! All functions are pure and return `None` instead of dividing by zero or
//! reading past the start of the series.

use crate::market::Bar;
use crate::utils::decimal::{mean, sample_std_dev};
use rust_decimal::Decimal;
use serde::Serialize;

/// Mean and sample standard deviation of the last `window` values.
pub fn rolling_mean_std(values: &[Decimal], window: usize) -> Option<(Decimal, Decimal)> {
    if window < 2 || values.len() < window {
        return None;
    }
    let tail = &values[values.len() - window..];
    Some((mean(tail)?, sample_std_dev(tail)?))
}

/// Standardized deviation of `value` from `mean`; undefined when `std` is zero.
pub fn z_score(value: Decimal, mean: Decimal, std: Decimal) -> Option<Decimal> {
    if std == Decimal::ZERO {
        return None;
    }
    Some((value - mean) / std)
}

/// True range per bar. The first bar has no previous close and uses high - low.
pub fn true_ranges(bars: &[Bar]) -> Vec<Decimal> {
    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let range = bar.high - bar.low;
            if i == 0 {
                return range;
            }
            let prev_close = bars[i - 1].close;
            range
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs())
        })
        .collect()
}

/// Average true range over the last `period` bars.
///
/// With fewer bars than `period`, averages what is available.
pub fn average_true_range(bars: &[Bar], period: usize) -> Option<Decimal> {
    if bars.is_empty() || period == 0 {
        return None;
    }
    let ranges = true_ranges(bars);
    let start = ranges.len().saturating_sub(period);
    mean(&ranges[start..])
}

/// Latest volume divided by the mean volume of the last `window` bars.
pub fn volume_ratio(volumes: &[Decimal], window: usize) -> Option<Decimal> {
    if window == 0 || volumes.len() < window {
        return None;
    }
    let avg = mean(&volumes[volumes.len() - window..])?;
    if avg == Decimal::ZERO {
        return None;
    }
    volumes.last().map(|latest| *latest / avg)
}

/// Cumulative signed volume: added on up-closes, subtracted on down-closes.
pub fn on_balance_volume(bars: &[Bar]) -> Vec<Decimal> {
    let mut obv = Vec::with_capacity(bars.len());
    let mut running = Decimal::ZERO;
    for (i, bar) in bars.iter().enumerate() {
        if i > 0 {
            let prev = bars[i - 1].close;
            if bar.close > prev {
                running += bar.volume;
            } else if bar.close < prev {
                running -= bar.volume;
            }
        }
        obv.push(running);
    }
    obv
}

/// Direction of the OBV series over a short lookback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObvTrend {
    NonDeclining,
    Declining,
}

impl ObvTrend {
    pub fn is_non_declining(&self) -> bool {
        matches!(self, ObvTrend::NonDeclining)
    }
}

/// Compare the latest OBV to the value `lookback` bars earlier (or the first
/// value when the series is shorter).
pub fn obv_trend(bars: &[Bar], lookback: usize) -> ObvTrend {
    let obv = on_balance_volume(bars);
    let Some(latest) = obv.last() else {
        return ObvTrend::Declining;
    };
    let reference_idx = (obv.len() - 1).saturating_sub(lookback);
    if *latest >= obv[reference_idx] {
        ObvTrend::NonDeclining
    } else {
        ObvTrend::Declining
    }
}
