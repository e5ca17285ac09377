//! Position lifecycle rules.
//!
//! Per open instrument, in priority order:
//! 1. Partial exit on z-score reversion (once per position)
//! 2. High-water update, then trailing exit once the gain is armed
//! 3. Hard stop-loss
//!
//! Forced liquidation on a VaR breach is a portfolio-level rule run by the
//! orchestrator before any of these.

use crate::config::{SizingMode, StrategyConfig, TrailingMode};
use crate::portfolio::{PortfolioState, TradeAction, TradeRecord};
use crate::signal::Signal;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

/// Applies entry and exit rules to the portfolio.
pub struct PositionManager {
    config: StrategyConfig,
}

impl PositionManager {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Trailing stop level for a high-water price.
    pub fn trailing_stop_level(&self, high_water: Decimal, atr: Decimal) -> Decimal {
        match self.config.trailing_mode {
            TrailingMode::Atr => high_water - atr * self.config.atr_multiplier,
            TrailingMode::Percent => {
                high_water * (Decimal::ONE - self.config.trailing_retracement_pct)
            }
        }
    }

    /// Run the exit rules for one held instrument at `price`.
    ///
    /// `signal` is `None` when the window had no usable z-score (for example
    /// zero variance); the partial and trailing rules are then skipped while
    /// the high-water update and hard stop still apply. Returns the trades
    /// executed, at most a partial sell followed by one full exit.
    pub fn manage(
        &self,
        state: &mut PortfolioState,
        symbol: &str,
        price: Decimal,
        signal: Option<&Signal>,
        now: DateTime<Utc>,
    ) -> Vec<TradeRecord> {
        let mut trades = Vec::new();
        if price <= Decimal::ZERO {
            return trades;
        }

        // 1. Partial exit
        if let Some(signal) = signal {
            let partially_closed = state
                .positions
                .get(symbol)
                .map(|p| p.partially_closed)
                .unwrap_or(true);
            if !partially_closed && signal.z_score >= self.config.z_partial_sell_threshold {
                if let Some(trade) =
                    state.partial_sell(symbol, price, self.config.partial_sell_fraction, now)
                {
                    info!(
                        symbol = %symbol,
                        z = %signal.z_score,
                        shares = %trade.shares,
                        pnl = %trade.pnl,
                        "Partial exit on mean reversion"
                    );
                    trades.push(trade);
                }
            }
        }

        let Some(position) = state.positions.get_mut(symbol) else {
            return trades;
        };

        // 2. Trailing exit
        position.update_high_water(price);
        let pnl_fraction = position.pnl_fraction(price);

        if let Some(signal) = signal {
            if pnl_fraction >= self.config.trailing_activation_pct {
                let level = self.trailing_stop_level(position.high_water_price, signal.atr);
                debug!(symbol = %symbol, %price, %level, "Trailing stop armed");
                if price <= level {
                    if let Some(trade) =
                        state.close_position(symbol, price, TradeAction::TrailingStop, now)
                    {
                        state.record_exit_result(trade.pnl);
                        info!(symbol = %symbol, %price, %level, pnl = %trade.pnl, "Trailing stop exit");
                        trades.push(trade);
                    }
                    return trades;
                }
            }
        }

        // 3. Hard stop
        if pnl_fraction <= -self.config.stop_loss_pct {
            if let Some(trade) = state.close_position(symbol, price, TradeAction::HardStopLoss, now) {
                state.record_exit_result(trade.pnl);
                info!(
                    symbol = %symbol,
                    %price,
                    loss = %pnl_fraction,
                    pnl = %trade.pnl,
                    "Hard stop-loss exit"
                );
                trades.push(trade);
            }
        }

        trades
    }

    /// Entry action for a flat instrument's signal, if the entry conditions
    /// hold: z below the buy threshold, volume confirmed, OBV not declining.
    pub fn entry_action(&self, signal: &Signal, min_volume_ratio: Decimal) -> Option<TradeAction> {
        if signal.z_score >= self.config.z_buy_threshold
            || signal.volume_ratio <= min_volume_ratio
            || !signal.obv_trend.is_non_declining()
        {
            return None;
        }

        if signal.z_score < self.config.z_buy_aggressive_threshold {
            Some(TradeAction::BuyAggressive)
        } else {
            Some(TradeAction::Buy)
        }
    }

    /// Cash to commit to an entry.
    pub fn entry_notional(&self, action: TradeAction, cash: Decimal, kelly_fraction: Decimal) -> Decimal {
        match self.config.sizing {
            SizingMode::Kelly => cash * kelly_fraction,
            SizingMode::Fixed if action == TradeAction::BuyAggressive => {
                self.config.aggressive_trade_amount
            }
            SizingMode::Fixed => self.config.base_trade_amount,
        }
    }

    /// Size an entry against `capital` and open it. Returns `None` when the
    /// remaining cash cannot fund it.
    pub fn open_entry(
        &self,
        state: &mut PortfolioState,
        signal: &Signal,
        action: TradeAction,
        capital: Decimal,
        kelly_fraction: Decimal,
        now: DateTime<Utc>,
    ) -> Option<TradeRecord> {
        let notional = self.entry_notional(action, capital, kelly_fraction);
        let trade = state.open_position(&signal.symbol, signal.price, notional, action, now)?;
        info!(
            symbol = %signal.symbol,
            action = %action,
            z = %signal.z_score,
            price = %signal.price,
            %notional,
            "Opened position"
        );
        Some(trade)
    }
}
