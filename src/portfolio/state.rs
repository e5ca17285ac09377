//! Portfolio aggregate and position records.
//!
//! `PortfolioState` is the single persisted aggregate. All cash and position
//! mutation goes through the fill methods here so that the invariants hold:
//! - a position record always has `shares > 0`
//! - `high_water_price` never decreases
//! - cash never goes negative

use super::trade::{TradeAction, TradeRecord};
use crate::config::CapitalConfig;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// An open long position in one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub entry_price: Decimal,
    pub shares: Decimal,
    pub entry_time: DateTime<Utc>,
    pub high_water_price: Decimal,
    #[serde(default)]
    pub partially_closed: bool,
}

impl PositionRecord {
    pub fn new(entry_price: Decimal, shares: Decimal, entry_time: DateTime<Utc>) -> Self {
        Self {
            entry_price,
            shares,
            entry_time,
            high_water_price: entry_price,
            partially_closed: false,
        }
    }

    /// Unrealized P&L fraction at `price` (0.01 = +1%).
    pub fn pnl_fraction(&self, price: Decimal) -> Decimal {
        if self.entry_price == Decimal::ZERO {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price
    }

    /// Unrealized P&L in cash at `price`.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.shares
    }

    pub fn market_value(&self, price: Decimal) -> Decimal {
        price * self.shares
    }

    /// Raise the high-water price; never lowers it.
    pub fn update_high_water(&mut self, price: Decimal) {
        if price > self.high_water_price {
            self.high_water_price = price;
        }
    }
}

/// Lifecycle phase of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionPhase {
    Flat,
    Open,
    Partial,
}

/// The persisted trading aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub cash: Decimal,
    pub positions: HashMap<String, PositionRecord>,
    pub consecutive_losses: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub historical_win_rate: Decimal,
    pub historical_avg_win: Decimal,
    pub historical_avg_loss: Decimal,
}

impl PortfolioState {
    /// Fresh portfolio with starting cash and seeded statistics.
    pub fn new(capital: &CapitalConfig) -> Self {
        Self {
            cash: capital.initial_cash,
            positions: HashMap::new(),
            consecutive_losses: 0,
            cooldown_until: None,
            historical_win_rate: capital.historical_win_rate,
            historical_avg_win: capital.historical_avg_win,
            historical_avg_loss: capital.historical_avg_loss,
        }
    }

    pub fn phase(&self, symbol: &str) -> PositionPhase {
        match self.positions.get(symbol) {
            None => PositionPhase::Flat,
            Some(p) if p.partially_closed => PositionPhase::Partial,
            Some(_) => PositionPhase::Open,
        }
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Symbols with open records, sorted for deterministic iteration.
    pub fn open_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Cash plus positions marked at `prices`; missing prices fall back to
    /// the entry price.
    pub fn total_value(&self, prices: &HashMap<String, Decimal>) -> Decimal {
        self.cash
            + self
                .positions
                .iter()
                .map(|(symbol, pos)| {
                    let price = prices.get(symbol).copied().unwrap_or(pos.entry_price);
                    pos.market_value(price)
                })
                .sum::<Decimal>()
    }

    /// Open a new position for `notional` cash at `price`.
    ///
    /// Returns `None` (and changes nothing) when the instrument is already
    /// held, the inputs are non-positive, or cash is insufficient.
    pub fn open_position(
        &mut self,
        symbol: &str,
        price: Decimal,
        notional: Decimal,
        action: TradeAction,
        now: DateTime<Utc>,
    ) -> Option<TradeRecord> {
        if self.positions.contains_key(symbol) {
            debug!(symbol = %symbol, "Already holding, no pyramiding");
            return None;
        }
        if price <= Decimal::ZERO || notional <= Decimal::ZERO || notional > self.cash {
            debug!(symbol = %symbol, %notional, cash = %self.cash, "Entry not fundable");
            return None;
        }

        let shares = notional / price;
        self.cash -= notional;
        self.positions
            .insert(symbol.to_string(), PositionRecord::new(price, shares, now));

        Some(TradeRecord {
            timestamp: now,
            symbol: symbol.to_string(),
            action,
            price,
            shares,
            pnl: Decimal::ZERO,
        })
    }

    /// Sell `fraction` of the shares at `price` and mark the position
    /// partially closed. Refuses when already partially closed.
    pub fn partial_sell(
        &mut self,
        symbol: &str,
        price: Decimal,
        fraction: Decimal,
        now: DateTime<Utc>,
    ) -> Option<TradeRecord> {
        let position = self.positions.get_mut(symbol)?;
        if position.partially_closed || fraction <= Decimal::ZERO || fraction >= Decimal::ONE {
            return None;
        }

        let sold = position.shares * fraction;
        let pnl = (price - position.entry_price) * sold;
        position.shares -= sold;
        position.partially_closed = true;
        self.cash += price * sold;

        Some(TradeRecord {
            timestamp: now,
            symbol: symbol.to_string(),
            action: TradeAction::PartialSell,
            price,
            shares: sold,
            pnl,
        })
    }

    /// Close the whole position at `price`, crediting proceeds to cash and
    /// removing the record.
    pub fn close_position(
        &mut self,
        symbol: &str,
        price: Decimal,
        action: TradeAction,
        now: DateTime<Utc>,
    ) -> Option<TradeRecord> {
        let position = self.positions.remove(symbol)?;
        if price <= Decimal::ZERO {
            warn!(symbol = %symbol, %price, "Refusing to close at non-positive price");
            self.positions.insert(symbol.to_string(), position);
            return None;
        }

        let pnl = position.unrealized_pnl(price);
        self.cash += position.market_value(price);

        Some(TradeRecord {
            timestamp: now,
            symbol: symbol.to_string(),
            action,
            price,
            shares: position.shares,
            pnl,
        })
    }

    /// Update the losing streak after a full exit: a loss extends it, a gain
    /// or flat exit resets it.
    pub fn record_exit_result(&mut self, pnl: Decimal) {
        if pnl < Decimal::ZERO {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }
    }

    /// True when a cooldown is set and still in the future.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn state(cash: Decimal) -> PortfolioState {
        PortfolioState::new(&CapitalConfig {
            initial_cash: cash,
            ..Default::default()
        })
    }

    #[test]
    fn test_open_debits_cash() {
        let mut s = state(dec!(10000));
        let now = Utc::now();
        let trade = s
            .open_position("AAPL", dec!(95), dec!(1900), TradeAction::Buy, now)
            .unwrap();

        assert_eq!(trade.shares, dec!(20));
        assert_eq!(s.cash, dec!(8100));
        assert_eq!(s.phase("AAPL"), PositionPhase::Open);
        assert_eq!(s.positions["AAPL"].high_water_price, dec!(95));
    }

    #[test]
    fn test_no_pyramiding_or_overdraft() {
        let mut s = state(dec!(1000));
        let now = Utc::now();
        assert!(s.open_position("AAPL", dec!(10), dec!(2000), TradeAction::Buy, now).is_none());
        assert!(s.open_position("AAPL", dec!(10), dec!(500), TradeAction::Buy, now).is_some());
        assert!(s.open_position("AAPL", dec!(10), dec!(100), TradeAction::Buy, now).is_none());
        assert_eq!(s.cash, dec!(500));
    }

    #[test]
    fn test_partial_sell_halves_once() {
        let mut s = state(dec!(10000));
        let now = Utc::now();
        s.open_position("AAPL", dec!(100), dec!(1000), TradeAction::Buy, now);

        let trade = s.partial_sell("AAPL", dec!(104), dec!(0.5), now).unwrap();
        assert_eq!(trade.shares, dec!(5));
        assert_eq!(trade.pnl, dec!(20));
        assert_eq!(s.positions["AAPL"].shares, dec!(5));
        assert_eq!(s.cash, dec!(9000) + dec!(520));
        assert_eq!(s.phase("AAPL"), PositionPhase::Partial);

        assert!(s.partial_sell("AAPL", dec!(110), dec!(0.5), now).is_none());
        assert_eq!(s.positions["AAPL"].shares, dec!(5));
    }

    #[test]
    fn test_full_exit_credits_and_removes() {
        let mut s = state(dec!(10000));
        let now = Utc::now();
        s.open_position("AAPL", dec!(100), dec!(1000), TradeAction::Buy, now);
        let cash_before = s.cash;

        let trade = s
            .close_position("AAPL", dec!(106.5), TradeAction::TrailingStop, now)
            .unwrap();

        assert_eq!(trade.pnl, dec!(65));
        assert_eq!(s.cash, cash_before + dec!(106.5) * dec!(10));
        assert!(!s.positions.contains_key("AAPL"));
        assert_eq!(s.phase("AAPL"), PositionPhase::Flat);
    }

    #[test]
    fn test_high_water_never_decreases() {
        let mut p = PositionRecord::new(dec!(100), dec!(1), Utc::now());
        p.update_high_water(dec!(110));
        p.update_high_water(dec!(105));
        assert_eq!(p.high_water_price, dec!(110));
    }

    #[test]
    fn test_loss_streak() {
        let mut s = state(dec!(0));
        s.record_exit_result(dec!(-1));
        s.record_exit_result(dec!(-1));
        assert_eq!(s.consecutive_losses, 2);
        s.record_exit_result(dec!(3));
        assert_eq!(s.consecutive_losses, 0);
    }

    #[test]
    fn test_total_value_falls_back_to_entry() {
        let mut s = state(dec!(1000));
        let now = Utc::now();
        s.open_position("AAPL", dec!(10), dec!(100), TradeAction::Buy, now);
        s.open_position("MSFT", dec!(20), dec!(200), TradeAction::Buy, now);
        let prices = HashMap::from([("AAPL".to_string(), dec!(12))]);
        // 700 cash + 10 * 12 + 10 * 20
        assert_eq!(s.total_value(&prices), dec!(1020));
    }
}
