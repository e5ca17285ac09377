//! Opportunity scanner for oversold entries.

use super::lifecycle::PositionManager;
use crate::portfolio::{PortfolioState, TradeAction, TradeRecord};
use crate::signal::Signal;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

/// Reasons a flat instrument did not qualify for entry.
#[derive(Debug, Clone, Copy)]
enum RejectReason {
    Held,
    NotOversold,
    LowVolume,
    ObvDeclining,
}

/// A qualified entry, not yet sized.
#[derive(Debug, Clone)]
pub struct EntryCandidate {
    pub signal: Signal,
    pub action: TradeAction,
}

/// Filters and ranks entry candidates, then fills them against cash.
pub struct OpportunityScanner {
    min_volume_ratio: Decimal,
    max_positions: usize,
}

impl OpportunityScanner {
    pub fn new(min_volume_ratio: Decimal, max_positions: usize) -> Self {
        Self {
            min_volume_ratio,
            max_positions,
        }
    }

    /// Qualify signals for flat instruments, most oversold first.
    ///
    /// Ties in z-score are ordered by symbol.
    pub fn rank(
        &self,
        manager: &PositionManager,
        state: &PortfolioState,
        signals: Vec<Signal>,
    ) -> Vec<EntryCandidate> {
        let mut rejected = [0usize; 4];
        let mut candidates: Vec<EntryCandidate> = signals
            .into_iter()
            .filter_map(|signal| match self.qualify(manager, state, &signal) {
                Ok(action) => Some(EntryCandidate { signal, action }),
                Err(reason) => {
                    rejected[reason as usize] += 1;
                    None
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.signal
                .z_score
                .cmp(&b.signal.z_score)
                .then_with(|| a.signal.symbol.cmp(&b.signal.symbol))
        });

        debug!(
            qualified = candidates.len(),
            held = rejected[RejectReason::Held as usize],
            not_oversold = rejected[RejectReason::NotOversold as usize],
            low_volume = rejected[RejectReason::LowVolume as usize],
            obv_declining = rejected[RejectReason::ObvDeclining as usize],
            "Entry scan ranked"
        );

        candidates
    }

    fn qualify(
        &self,
        manager: &PositionManager,
        state: &PortfolioState,
        signal: &Signal,
    ) -> Result<TradeAction, RejectReason> {
        if state.positions.contains_key(&signal.symbol) {
            return Err(RejectReason::Held);
        }
        if let Some(action) = manager.entry_action(signal, self.min_volume_ratio) {
            return Ok(action);
        }
        if signal.z_score >= manager.config().z_buy_threshold {
            Err(RejectReason::NotOversold)
        } else if signal.volume_ratio <= self.min_volume_ratio {
            Err(RejectReason::LowVolume)
        } else {
            Err(RejectReason::ObvDeclining)
        }
    }

    /// Open ranked candidates until the position limit is reached. A
    /// candidate that cannot be funded is skipped; later, smaller entries may
    /// still fit.
    ///
    /// Every entry is sized against the cash held before the first fill, so
    /// each gets the same Kelly share of capital.
    pub fn fill(
        &self,
        manager: &PositionManager,
        state: &mut PortfolioState,
        candidates: &[EntryCandidate],
        kelly_fraction: Decimal,
        now: DateTime<Utc>,
    ) -> Vec<TradeRecord> {
        let mut trades = Vec::new();
        let capital = state.cash;

        for candidate in candidates {
            if state.position_count() >= self.max_positions {
                info!(max = self.max_positions, "Position limit reached, stopping entry scan");
                break;
            }
            match manager.open_entry(
                state,
                &candidate.signal,
                candidate.action,
                capital,
                kelly_fraction,
                now,
            ) {
                Some(trade) => trades.push(trade),
                None => debug!(symbol = %candidate.signal.symbol, cash = %state.cash, "Entry not funded"),
            }
        }

        trades
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CapitalConfig, SizingMode, StrategyConfig};
    use crate::signal::{MarketRegime, ObvTrend};
    use rust_decimal_macros::dec;

    fn signal(symbol: &str, z: Decimal) -> Signal {
        Signal {
            symbol: symbol.to_string(),
            price: dec!(100),
            rolling_mean: dec!(105),
            rolling_std: dec!(2),
            z_score: z,
            atr: dec!(1),
            volume_ratio: dec!(3),
            obv_trend: ObvTrend::NonDeclining,
            regime: MarketRegime::Sideways,
        }
    }

    #[test]
    fn test_ranked_most_oversold_first() {
        let manager = PositionManager::new(StrategyConfig::default());
        let state = PortfolioState::new(&CapitalConfig::default());
        let scanner = OpportunityScanner::new(dec!(2), 5);

        let ranked = scanner.rank(
            &manager,
            &state,
            vec![
                signal("MSFT", dec!(-2.2)),
                signal("AAPL", dec!(-3.5)),
                signal("NVDA", dec!(-1.0)),
                signal("AMD", dec!(-2.2)),
            ],
        );

        let symbols: Vec<&str> = ranked.iter().map(|c| c.signal.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAPL", "AMD", "MSFT"]);
        assert_eq!(ranked[0].action, TradeAction::BuyAggressive);
        assert_eq!(ranked[1].action, TradeAction::Buy);
    }

    #[test]
    fn test_held_instrument_not_reentered() {
        let manager = PositionManager::new(StrategyConfig::default());
        let mut state = PortfolioState::new(&CapitalConfig::default());
        state.open_position("AAPL", dec!(100), dec!(1000), TradeAction::Buy, Utc::now());
        let scanner = OpportunityScanner::new(dec!(2), 5);

        let ranked = scanner.rank(&manager, &state, vec![signal("AAPL", dec!(-3))]);
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_fill_respects_position_limit() {
        let manager = PositionManager::new(StrategyConfig::default());
        let mut state = PortfolioState::new(&CapitalConfig::default());
        let scanner = OpportunityScanner::new(dec!(2), 2);

        let ranked = scanner.rank(
            &manager,
            &state,
            vec![signal("AAPL", dec!(-2.5)), signal("MSFT", dec!(-2.6)), signal("AMD", dec!(-2.7))],
        );
        let trades = scanner.fill(&manager, &mut state, &ranked, dec!(0.2), Utc::now());

        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].symbol, "AMD");
        assert_eq!(trades[1].symbol, "MSFT");
        // both sized at 100000 * 0.2
        assert_eq!(state.cash, dec!(60000));
        assert_eq!(trades[0].price * trades[0].shares, trades[1].price * trades[1].shares);
    }

    #[test]
    fn test_fill_skips_unfunded() {
        let manager = PositionManager::new(StrategyConfig {
            sizing: SizingMode::Fixed,
            ..Default::default()
        });
        let mut state = PortfolioState::new(&CapitalConfig {
            initial_cash: dec!(7000),
            ..Default::default()
        });
        let scanner = OpportunityScanner::new(dec!(2), 5);

        // Aggressive needs 10000, base needs 5000
        let ranked = scanner.rank(
            &manager,
            &state,
            vec![signal("AAPL", dec!(-3.5)), signal("MSFT", dec!(-2.5))],
        );
        let trades = scanner.fill(&manager, &mut state, &ranked, dec!(0.2), Utc::now());

        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].symbol, "MSFT");
        assert_eq!(state.cash, dec!(2000));
    }
}
