//! Coarse market regime classification from a broad market proxy.

use crate::config::SignalConfig;
use crate::market::MarketSnapshot;
use crate::utils::decimal::{pct_change, sample_std_dev, simple_returns};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Market regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketRegime {
    Bull,
    Bear,
    Sideways,
    Crash,
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketRegime::Bull => write!(f, "BULL"),
            MarketRegime::Bear => write!(f, "BEAR"),
            MarketRegime::Sideways => write!(f, "SIDEWAYS"),
            MarketRegime::Crash => write!(f, "CRASH"),
        }
    }
}

/// Classifies the regime from the proxy's short-horizon return and realized
/// volatility.
pub struct RegimeClassifier {
    config: SignalConfig,
}

impl RegimeClassifier {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    /// Classify a proxy snapshot.
    ///
    /// The return spans the last `regime_horizon` bars; volatility is the
    /// sample standard deviation of per-bar returns over that span. Too few
    /// bars yields SIDEWAYS.
    pub fn classify(&self, snapshot: &MarketSnapshot) -> MarketRegime {
        let closes = snapshot.closes();
        let horizon = self.config.regime_horizon.max(1);
        if closes.len() < horizon + 1 {
            debug!(symbol = %snapshot.symbol, bars = closes.len(), "Not enough proxy bars for regime");
            return MarketRegime::Sideways;
        }

        let window = &closes[closes.len() - horizon - 1..];
        let ret = pct_change(window[0], window[window.len() - 1]);
        let vol = sample_std_dev(&simple_returns(window)).unwrap_or(Decimal::ZERO);

        self.label(ret, vol)
    }

    /// Apply the threshold ladder: CRASH, BEAR, BULL, else SIDEWAYS.
    pub fn label(&self, ret: Decimal, vol: Decimal) -> MarketRegime {
        if ret < self.config.crash_return && vol > self.config.crash_volatility {
            MarketRegime::Crash
        } else if ret < self.config.bear_return {
            MarketRegime::Bear
        } else if ret > self.config.bull_return {
            MarketRegime::Bull
        } else {
            MarketRegime::Sideways
        }
    }
}
