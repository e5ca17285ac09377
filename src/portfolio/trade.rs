//! Trade log records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Kind of state transition recorded in the trade log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
    Buy,
    BuyAggressive,
    PartialSell,
    TrailingStop,
    HardStopLoss,
    ForcedLiquidation,
    ManualLiquidate,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::BuyAggressive => "BUY_AGGRESSIVE",
            TradeAction::PartialSell => "PARTIAL_SELL",
            TradeAction::TrailingStop => "TRAILING_STOP",
            TradeAction::HardStopLoss => "HARD_STOP_LOSS",
            TradeAction::ForcedLiquidation => "FORCED_LIQUIDATION",
            TradeAction::ManualLiquidate => "MANUAL_LIQUIDATE",
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, TradeAction::Buy | TradeAction::BuyAggressive)
    }

    /// Full exits remove the position record.
    pub fn is_full_exit(&self) -> bool {
        !self.is_entry() && !matches!(self, TradeAction::PartialSell)
    }

    /// Full exits decided by the strategy or its risk limits. These are the
    /// samples behind the Kelly statistics; operator liquidations are not.
    pub fn is_strategy_exit(&self) -> bool {
        self.is_full_exit() && !matches!(self, TradeAction::ManualLiquidate)
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "BUY" => TradeAction::Buy,
            "BUY_AGGRESSIVE" => TradeAction::BuyAggressive,
            "PARTIAL_SELL" => TradeAction::PartialSell,
            "TRAILING_STOP" => TradeAction::TrailingStop,
            "HARD_STOP_LOSS" => TradeAction::HardStopLoss,
            "FORCED_LIQUIDATION" => TradeAction::ForcedLiquidation,
            "MANUAL_LIQUIDATE" => TradeAction::ManualLiquidate,
            other => anyhow::bail!("unknown trade action: {}", other),
        })
    }
}

/// One append-only trade log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub action: TradeAction,
    pub price: Decimal,
    pub shares: Decimal,
    /// Realized P&L; zero for entries
    pub pnl: Decimal,
}

impl TradeRecord {
    /// Realized return on the cost basis of the shares closed.
    pub fn return_fraction(&self) -> Option<Decimal> {
        let cost = self.price * self.shares - self.pnl;
        if self.action.is_entry() || cost <= Decimal::ZERO {
            return None;
        }
        Some(self.pnl / cost)
    }

    /// Human-readable one-liner for notifications.
    pub fn describe(&self) -> String {
        if self.action.is_entry() {
            format!(
                "{} {}: {:.4} shares at ${:.2} (${:.2})",
                self.action,
                self.symbol,
                self.shares,
                self.price,
                self.price * self.shares
            )
        } else {
            format!(
                "{} {}: {:.4} shares at ${:.2} | PnL: ${:.2}",
                self.action, self.symbol, self.shares, self.price, self.pnl
            )
        }
    }

    /// Emit as structured log for downstream parsing.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        info!(target: "trade_event", "TRADE: {}", json);
    }
}
