//! Provider-agnostic interface for historical bar retrieval.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{Bar, MarketSnapshot};
use crate::error::SkipReason;

/// Source of OHLCV bars.
///
/// Implementations return bars in ascending time order. An empty vector is a
/// valid answer (unknown symbol, market closed) and must not be an error.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Fetch bars for `symbol` covering `lookback` (e.g. "5d") sampled at
    /// `interval` (e.g. "5m").
    async fn fetch_bars(
        &self,
        symbol: &str,
        lookback: &str,
        interval: &str,
    ) -> anyhow::Result<Vec<Bar>>;
}

/// Fetch a snapshot with a bounded wait.
///
/// Every failure mode maps to a [`SkipReason`] so a stalled or broken call
/// never holds up the rest of the cycle.
pub async fn fetch_snapshot(
    provider: &dyn MarketDataProvider,
    symbol: &str,
    lookback: &str,
    interval: &str,
    timeout: Duration,
) -> Result<MarketSnapshot, SkipReason> {
    let fetched = tokio::time::timeout(timeout, provider.fetch_bars(symbol, lookback, interval)).await;

    let bars = match fetched {
        Ok(Ok(bars)) => bars,
        Ok(Err(e)) => {
            warn!(symbol = %symbol, provider = provider.name(), error = %e, "Bar fetch failed");
            return Err(SkipReason::FetchFailed(e.to_string()));
        }
        Err(_) => {
            warn!(symbol = %symbol, provider = provider.name(), "Bar fetch timed out");
            return Err(SkipReason::Timeout {
                secs: timeout.as_secs(),
            });
        }
    };

    if bars.is_empty() {
        debug!(symbol = %symbol, "No bars returned");
        return Err(SkipReason::NoData);
    }

    if let Some(index) = bars.iter().position(|b| !b.is_well_formed()) {
        return Err(SkipReason::MalformedBar { index });
    }

    Ok(MarketSnapshot::new(symbol, bars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MockMarketData;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct StalledProvider;

    #[async_trait]
    impl MarketDataProvider for StalledProvider {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn fetch_bars(&self, _: &str, _: &str, _: &str) -> anyhow::Result<Vec<Bar>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_skip() {
        let result = fetch_snapshot(&StalledProvider, "AAPL", "1d", "5m", Duration::from_millis(20)).await;
        assert_eq!(result.unwrap_err(), SkipReason::Timeout { secs: 0 });
    }

    #[tokio::test]
    async fn test_empty_maps_to_no_data() {
        let provider = MockMarketData::new();
        let result = fetch_snapshot(&provider, "AAPL", "1d", "5m", Duration::from_secs(1)).await;
        assert_eq!(result.unwrap_err(), SkipReason::NoData);
    }

    #[tokio::test]
    async fn test_failure_maps_to_fetch_failed() {
        let provider = MockMarketData::new();
        provider.fail_symbol("MSFT").await;
        let result = fetch_snapshot(&provider, "MSFT", "1d", "5m", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SkipReason::FetchFailed(_))));
    }

    #[tokio::test]
    async fn test_malformed_bar_rejected() {
        let provider = MockMarketData::new();
        let ts = Utc::now();
        provider
            .set_bars(
                "AAPL",
                vec![
                    Bar::new(ts, dec!(10), dec!(11), dec!(9), dec!(10), dec!(5)),
                    Bar::new(ts, dec!(10), dec!(9), dec!(11), dec!(10), dec!(5)),
                ],
            )
            .await;
        let result = fetch_snapshot(&provider, "AAPL", "1d", "5m", Duration::from_secs(1)).await;
        assert_eq!(result.unwrap_err(), SkipReason::MalformedBar { index: 1 });
    }
}
