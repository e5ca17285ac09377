//! Bar and snapshot types shared by the data adapters and the signal layer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// A bar is well formed when prices are positive, high bounds the range
    /// and volume is non-negative.
    pub fn is_well_formed(&self) -> bool {
        self.low > Decimal::ZERO
            && self.high >= self.low
            && self.close >= self.low
            && self.close <= self.high
            && self.volume >= Decimal::ZERO
    }
}

/// Time-ordered bars for one instrument over a requested window.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub bars: Vec<Bar>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>, bars: Vec<Bar>) -> Self {
        Self {
            symbol: symbol.into(),
            bars,
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Latest close, if any bars exist.
    pub fn last_close(&self) -> Option<Decimal> {
        self.bars.last().map(|b| b.close)
    }

    pub fn closes(&self) -> Vec<Decimal> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn volumes(&self) -> Vec<Decimal> {
        self.bars.iter().map(|b| b.volume).collect()
    }
}
