//! Half-Kelly position sizing.

use crate::config::RiskConfig;
use crate::portfolio::PortfolioState;
use crate::utils::decimal::mean;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::debug;

/// Minimum realized exits before trade-log statistics replace the seeds.
pub const MIN_EXITS_FOR_STATS: usize = 10;

/// Win/loss statistics feeding the Kelly formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TradeStats {
    pub win_rate: Decimal,
    /// Mean gain of winning exits, as a positive fraction
    pub avg_win: Decimal,
    /// Mean loss of losing exits, as a positive fraction
    pub avg_loss: Decimal,
    pub exits: usize,
}

impl TradeStats {
    /// Derive statistics from realized exit returns (0.02 = +2%).
    ///
    /// Returns `None` below [`MIN_EXITS_FOR_STATS`] exits or when there are
    /// no wins or no losses to average.
    pub fn from_returns(returns: &[Decimal]) -> Option<Self> {
        if returns.len() < MIN_EXITS_FOR_STATS {
            return None;
        }

        let wins: Vec<Decimal> = returns.iter().copied().filter(|r| *r > Decimal::ZERO).collect();
        let losses: Vec<Decimal> = returns
            .iter()
            .copied()
            .filter(|r| *r < Decimal::ZERO)
            .map(|r| r.abs())
            .collect();

        Some(Self {
            win_rate: Decimal::from(wins.len()) / Decimal::from(returns.len()),
            avg_win: mean(&wins)?,
            avg_loss: mean(&losses)?,
            exits: returns.len(),
        })
    }

    /// Overwrite the seeded statistics on a portfolio.
    pub fn apply_to(&self, state: &mut PortfolioState) {
        state.historical_win_rate = self.win_rate;
        state.historical_avg_win = self.avg_win;
        state.historical_avg_loss = self.avg_loss;
    }
}

/// Computes the capital fraction committed to a new entry.
#[derive(Debug, Clone)]
pub struct KellySizer {
    cap: Decimal,
    default_fraction: Decimal,
}

impl KellySizer {
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            cap: config.kelly_cap,
            default_fraction: config.kelly_default_fraction.min(config.kelly_cap),
        }
    }

    /// `f = win_rate / avg_loss - (1 - win_rate) / avg_win`, floored at zero,
    /// halved, then capped.
    ///
    /// Non-positive `avg_win` or `avg_loss` yields the conservative default.
    pub fn fraction(&self, win_rate: Decimal, avg_win: Decimal, avg_loss: Decimal) -> Decimal {
        if avg_win <= Decimal::ZERO || avg_loss <= Decimal::ZERO {
            debug!(%avg_win, %avg_loss, "Degenerate Kelly inputs, using default fraction");
            return self.default_fraction;
        }

        let p = win_rate.clamp(Decimal::ZERO, Decimal::ONE);
        let raw = p / avg_loss - (Decimal::ONE - p) / avg_win;
        let half = raw.max(Decimal::ZERO) * dec!(0.5);

        half.min(self.cap)
    }

    /// Kelly fraction from the statistics carried on the portfolio.
    pub fn for_state(&self, state: &PortfolioState) -> Decimal {
        self.fraction(
            state.historical_win_rate,
            state.historical_avg_win,
            state.historical_avg_loss,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> KellySizer {
        KellySizer::new(&RiskConfig::default())
    }

    #[test]
    fn test_seeded_stats_hit_cap() {
        // 0.55 / 0.015 - 0.45 / 0.02 = 14.17 -> half 7.08 -> cap 0.2
        assert_eq!(sizer().fraction(dec!(0.55), dec!(0.02), dec!(0.015)), dec!(0.20));
    }

    #[test]
    fn test_negative_edge_floors_to_zero() {
        assert_eq!(sizer().fraction(dec!(0), dec!(0.02), dec!(0.015)), Decimal::ZERO);
    }

    #[test]
    fn test_small_edge_is_halved() {
        // 0.5 / 10 - 0.5 / 20 = 0.025 -> half 0.0125
        assert_eq!(sizer().fraction(dec!(0.5), dec!(20), dec!(10)), dec!(0.0125));
    }

    #[test]
    fn test_degenerate_inputs_use_default() {
        assert_eq!(sizer().fraction(dec!(0.6), Decimal::ZERO, dec!(0.01)), dec!(0.05));
        assert_eq!(sizer().fraction(dec!(0.6), dec!(0.01), Decimal::ZERO), dec!(0.05));
    }

    #[test]
    fn test_fraction_always_bounded() {
        let s = sizer();
        for rate in [dec!(0), dec!(0.1), dec!(0.5), dec!(0.9), dec!(1)] {
            for win in [dec!(0.001), dec!(0.02), dec!(1), dec!(50)] {
                for loss in [dec!(0.001), dec!(0.015), dec!(1), dec!(50)] {
                    let f = s.fraction(rate, win, loss);
                    assert!(f >= Decimal::ZERO && f <= dec!(0.2), "f={} for {}/{}/{}", f, rate, win, loss);
                }
            }
        }
    }

    #[test]
    fn test_stats_need_enough_exits() {
        let returns = vec![dec!(0.02); 9];
        assert!(TradeStats::from_returns(&returns).is_none());
    }

    #[test]
    fn test_stats_from_returns() {
        let mut returns = vec![dec!(0.03); 6];
        returns.extend(vec![dec!(-0.01); 4]);
        let stats = TradeStats::from_returns(&returns).unwrap();

        assert_eq!(stats.win_rate, dec!(0.6));
        assert_eq!(stats.avg_win, dec!(0.03));
        assert_eq!(stats.avg_loss, dec!(0.01));
        assert_eq!(stats.exits, 10);
    }
}
