//! Operator assistant context.
//!
//! The engine only produces an [`AssistantContext`]; any assistant behind the
//! [`Assistant`] trait is advisory and never feeds a trading decision.

use crate::portfolio::PortfolioState;
use crate::utils::decimal::to_percent;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;

/// One open position as seen by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionContext {
    pub symbol: String,
    pub entry: Decimal,
    pub current: Decimal,
    /// Unrealized P&L in percent (1.5 = +1.5%)
    pub pnl_pct: Decimal,
}

/// Snapshot handed to an assistant with each operator message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantContext {
    pub cash: Decimal,
    pub positions: Vec<PositionContext>,
    pub portfolio_var: Decimal,
}

impl AssistantContext {
    /// Build from state, marking positions at `prices` (entry price when
    /// missing).
    pub fn build(
        state: &PortfolioState,
        prices: &HashMap<String, Decimal>,
        portfolio_var: Decimal,
    ) -> Self {
        let positions = state
            .open_symbols()
            .into_iter()
            .filter_map(|symbol| {
                let pos = state.positions.get(&symbol)?;
                let current = prices.get(&symbol).copied().unwrap_or(pos.entry_price);
                Some(PositionContext {
                    pnl_pct: to_percent(pos.pnl_fraction(current)).round_dp(2),
                    symbol,
                    entry: pos.entry_price,
                    current,
                })
            })
            .collect();

        Self {
            cash: state.cash,
            positions,
            portfolio_var,
        }
    }

    /// Plain-text rendering for operators and prompts.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Cash: ${:.2} | Portfolio VaR: {:.2}%\n",
            self.cash,
            to_percent(self.portfolio_var)
        );
        if self.positions.is_empty() {
            out.push_str("No open positions");
        }
        for p in &self.positions {
            let _ = writeln!(
                out,
                "{}: entry ${:.2} | current ${:.2} | PnL {:+.2}%",
                p.symbol, p.entry, p.current, p.pnl_pct
            );
        }
        out.trim_end().to_string()
    }
}

/// Answers free-form operator messages given the portfolio context.
#[async_trait]
pub trait Assistant: Send + Sync {
    async fn respond(&self, context: &AssistantContext, message: &str) -> Result<String>;
}

/// Offline assistant that answers from the context alone.
#[derive(Debug, Default)]
pub struct SummaryAssistant;

#[async_trait]
impl Assistant for SummaryAssistant {
    async fn respond(&self, context: &AssistantContext, message: &str) -> Result<String> {
        let query = message.to_uppercase();
        let words: Vec<&str> = query
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .collect();

        if let Some(p) = context
            .positions
            .iter()
            .find(|p| words.contains(&p.symbol.as_str()))
        {
            return Ok(format!(
                "{} entered at ${:.2}, now ${:.2} ({:+.2}%)",
                p.symbol, p.entry, p.current, p.pnl_pct
            ));
        }
        if query.contains("VAR") || query.contains("RISK") {
            return Ok(format!("Portfolio VaR: {:.2}%", to_percent(context.portfolio_var)));
        }
        if query.contains("CASH") {
            return Ok(format!("Cash: ${:.2}", context.cash));
        }

        Ok(context.summary())
    }
}
