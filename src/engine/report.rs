//! Per-cycle outcome reporting.

use crate::error::SkipReason;
use crate::portfolio::TradeRecord;
use crate::risk::VarReport;
use crate::signal::MarketRegime;
use crate::strategy::PriceAlert;
use crate::utils::decimal::to_percent;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// What happened to one instrument during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentOutcome {
    /// One or more state transitions executed
    Acted(Vec<TradeRecord>),
    /// Evaluated, no rule fired
    Held,
    /// Data unavailable this cycle
    Skipped(SkipReason),
    /// Evaluation failed (broken data or transport)
    Failed(String),
}

impl InstrumentOutcome {
    /// Classify a skip: transport errors and malformed bars are failures,
    /// everything else is plain unavailability.
    pub fn from_skip(reason: SkipReason) -> Self {
        match reason {
            SkipReason::FetchFailed(_) | SkipReason::MalformedBar { .. } => {
                InstrumentOutcome::Failed(reason.to_string())
            }
            other => InstrumentOutcome::Skipped(other),
        }
    }
}

/// How the cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// Full pass ran
    Completed,
    /// In cooldown; nothing evaluated
    Halted { until: DateTime<Utc> },
    /// Breaker tripped this cycle; entry scan skipped
    Tripped { until: DateTime<Utc> },
}

/// Everything one orchestrator pass did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub status: CycleStatus,
    /// Cooldown expired at the start of this cycle
    pub resumed: bool,
    pub regime: Option<MarketRegime>,
    /// VaR at the liquidation-limit confidence, before any exits
    pub limit_var: Option<VarReport>,
    /// VaR at the reporting confidence, after all transitions
    pub reported_var: Option<VarReport>,
    pub outcomes: BTreeMap<String, InstrumentOutcome>,
    /// Trades in execution order
    pub trades: Vec<TradeRecord>,
    pub alerts: Vec<PriceAlert>,
    /// Operator messages (breaker transitions, forced exits)
    pub notices: Vec<String>,
    pub cash: Decimal,
    pub open_positions: usize,
}

impl CycleReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            status: CycleStatus::Completed,
            resumed: false,
            regime: None,
            limit_var: None,
            reported_var: None,
            outcomes: BTreeMap::new(),
            trades: Vec::new(),
            alerts: Vec::new(),
            notices: Vec::new(),
            cash: Decimal::ZERO,
            open_positions: 0,
        }
    }

    /// Record an instrument outcome. Trades accumulate across phases; a later
    /// non-trading outcome never hides an earlier action.
    pub fn record(&mut self, symbol: &str, outcome: InstrumentOutcome) {
        if let InstrumentOutcome::Acted(trades) = &outcome {
            self.trades.extend(trades.iter().cloned());
        }

        match self.outcomes.get_mut(symbol) {
            Some(InstrumentOutcome::Acted(existing)) => {
                if let InstrumentOutcome::Acted(more) = outcome {
                    existing.extend(more);
                }
            }
            _ => {
                self.outcomes.insert(symbol.to_string(), outcome);
            }
        }
    }

    /// Record trades executed outside the per-instrument phases.
    pub fn record_trade(&mut self, trade: TradeRecord) {
        let symbol = trade.symbol.clone();
        self.record(&symbol, InstrumentOutcome::Acted(vec![trade]));
    }

    pub fn count(&self, pred: impl Fn(&InstrumentOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| pred(o)).count()
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, InstrumentOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, InstrumentOutcome::Failed(_)))
    }

    /// One-paragraph operator summary.
    pub fn summary(&self) -> String {
        let mut out = match self.status {
            CycleStatus::Completed => "Cycle complete".to_string(),
            CycleStatus::Halted { until } => format!("Cooldown active until {}", until.format("%H:%M UTC")),
            CycleStatus::Tripped { until } => {
                format!("Circuit breaker tripped, halted until {}", until.format("%H:%M UTC"))
            }
        };
        let _ = write!(
            out,
            " | trades: {} | skipped: {} | failed: {} | positions: {} | cash: ${:.2}",
            self.trades.len(),
            self.skipped(),
            self.failed(),
            self.open_positions,
            self.cash
        );
        if let Some(regime) = self.regime {
            let _ = write!(out, " | regime: {}", regime);
        }
        if let Some(var) = &self.reported_var {
            let _ = write!(out, " | VaR: {:.2}%", to_percent(var.var_fraction));
        }
        out
    }
}
