//! Per-instrument signal evaluation.

use super::indicators::{
    average_true_range, obv_trend, rolling_mean_std, volume_ratio, z_score, ObvTrend,
};
use super::regime::MarketRegime;
use crate::config::SignalConfig;
use crate::error::SkipReason;
use crate::market::MarketSnapshot;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::trace;

/// Indicators derived from one instrument snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub symbol: String,
    /// Latest close
    pub price: Decimal,
    pub rolling_mean: Decimal,
    pub rolling_std: Decimal,
    pub z_score: Decimal,
    pub atr: Decimal,
    /// Latest volume over rolling average volume; zero when the average is zero
    pub volume_ratio: Decimal,
    pub obv_trend: ObvTrend,
    pub regime: MarketRegime,
}

/// Computes [`Signal`]s from snapshots.
pub struct SignalEvaluator {
    config: SignalConfig,
}

impl SignalEvaluator {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    /// Check that the snapshot carries enough bars for a full window.
    pub fn check_length(&self, snapshot: &MarketSnapshot) -> Result<(), SkipReason> {
        if snapshot.is_empty() {
            return Err(SkipReason::NoData);
        }
        if snapshot.len() < self.config.window {
            return Err(SkipReason::InsufficientBars {
                have: snapshot.len(),
                need: self.config.window,
            });
        }
        Ok(())
    }

    /// Evaluate a snapshot under the given market regime.
    ///
    /// A flat window (zero standard deviation) yields
    /// [`SkipReason::ZeroVariance`] rather than a signal.
    pub fn evaluate(
        &self,
        snapshot: &MarketSnapshot,
        regime: MarketRegime,
    ) -> Result<Signal, SkipReason> {
        self.check_length(snapshot)?;

        let closes = snapshot.closes();
        let price = *closes.last().ok_or(SkipReason::NoData)?;

        let (rolling_mean, rolling_std) = rolling_mean_std(&closes, self.config.window).ok_or(
            SkipReason::InsufficientBars {
                have: closes.len(),
                need: self.config.window,
            },
        )?;
        let z = z_score(price, rolling_mean, rolling_std).ok_or(SkipReason::ZeroVariance)?;

        let window_start = snapshot.len() - self.config.window;
        let bars = &snapshot.bars[window_start..];
        let atr = average_true_range(&snapshot.bars, self.config.atr_period).unwrap_or(Decimal::ZERO);
        let vol_ratio = volume_ratio(&snapshot.volumes(), self.config.window).unwrap_or(Decimal::ZERO);
        let obv = obv_trend(bars, self.config.obv_lookback);

        trace!(
            symbol = %snapshot.symbol,
            z = %z,
            atr = %atr,
            volume_ratio = %vol_ratio,
            "Signal evaluated"
        );

        Ok(Signal {
            symbol: snapshot.symbol.clone(),
            price,
            rolling_mean,
            rolling_std,
            z_score: z,
            atr,
            volume_ratio: vol_ratio,
            obv_trend: obv,
            regime,
        })
    }
}
