//! In-memory market data provider for paper runs and tests.

use super::traits::MarketDataProvider;
use super::types::Bar;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Mock provider serving preloaded bars keyed by symbol.
///
/// Lookback and interval are ignored; whatever was loaded for a symbol is
/// returned as-is.
#[derive(Default)]
pub struct MockMarketData {
    bars: Arc<RwLock<HashMap<String, Vec<Bar>>>>,
    failing: Arc<RwLock<HashSet<String>>>,
    request_count: AtomicU64,
    latency_ms: AtomicU64,
}

impl MockMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the bars served for a symbol.
    pub async fn set_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.bars.write().await.insert(symbol.to_string(), bars);
    }

    /// Load bars built from closes and volumes (see [`bars_from_closes`]).
    pub async fn set_closes(&self, symbol: &str, closes: &[Decimal], volumes: &[Decimal]) {
        self.set_bars(symbol, bars_from_closes(closes, volumes)).await;
    }

    /// Make every request for `symbol` fail.
    pub async fn fail_symbol(&self, symbol: &str) {
        self.failing.write().await.insert(symbol.to_string());
    }

    /// Delay every response, simulating a slow feed.
    pub fn set_latency(&self, latency: std::time::Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of fetches served so far.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataProvider for MockMarketData {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn fetch_bars(&self, symbol: &str, _lookback: &str, _interval: &str) -> Result<Vec<Bar>> {
        self.request_count.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(latency)).await;
        }

        if self.failing.read().await.contains(symbol) {
            anyhow::bail!("simulated failure for {}", symbol);
        }

        let bars = self.bars.read().await.get(symbol).cloned().unwrap_or_default();
        debug!(symbol = %symbol, bars = bars.len(), "Mock bars served");
        Ok(bars)
    }
}

/// Build five-minute bars from closes.
///
/// Each bar opens at the previous close, with high/low bracketing open and
/// close. Missing volumes default to the last given volume (or zero).
pub fn bars_from_closes(closes: &[Decimal], volumes: &[Decimal]) -> Vec<Bar> {
    let start: DateTime<Utc> = Utc
        .with_ymd_and_hms(2024, 1, 2, 14, 30, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let fallback_volume = volumes.last().copied().unwrap_or(Decimal::ZERO);

    closes
        .iter()
        .enumerate()
        .map(|(i, close)| {
            let open = if i == 0 { *close } else { closes[i - 1] };
            let volume = volumes.get(i).copied().unwrap_or(fallback_volume);
            Bar::new(
                start + Duration::minutes(5 * i as i64),
                open,
                open.max(*close),
                open.min(*close),
                *close,
                volume,
            )
        })
        .collect()
}
