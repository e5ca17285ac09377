//! Yahoo Finance v8 chart API adapter.

use super::traits::MarketDataProvider;
use super::types::Bar;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

pub const DEFAULT_CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const USER_AGENT: &str = "Mozilla/5.0 (compatible; reversion-trader/0.1)";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Chart API client.
pub struct YahooChartClient {
    http: Client,
    base_url: String,
}

impl YahooChartClient {
    /// Create a client against `base_url` with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MarketDataProvider for YahooChartClient {
    fn name(&self) -> &'static str {
        "yahoo"
    }

    #[instrument(skip(self))]
    async fn fetch_bars(&self, symbol: &str, lookback: &str, interval: &str) -> Result<Vec<Bar>> {
        let url = format!("{}/{}", self.base_url, urlencoding::encode(symbol));
        let response = self
            .http
            .get(&url)
            .query(&[("range", lookback), ("interval", interval)])
            .send()
            .await
            .with_context(|| format!("Failed to fetch chart for {}", symbol))?;

        // Unknown symbols come back as 404 with a chart.error body.
        let status = response.status();
        let body: ChartResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to parse chart response for {} ({})", symbol, status))?;

        if let Some(err) = body.chart.error {
            if err.code.eq_ignore_ascii_case("Not Found") {
                debug!(symbol = %symbol, "Symbol not found, returning no bars");
                return Ok(Vec::new());
            }
            anyhow::bail!("chart error for {}: {} ({})", symbol, err.description, err.code);
        }

        let Some(result) = body.chart.result.and_then(|r| r.into_iter().next()) else {
            return Ok(Vec::new());
        };

        let bars = decode_bars(result);
        debug!(symbol = %symbol, bars = bars.len(), "Chart bars decoded");
        Ok(bars)
    }
}

/// Zip the column arrays into bars, dropping rows with any missing field.
fn decode_bars(result: ChartResult) -> Vec<Bar> {
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();

    result
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, ts)| {
            let timestamp = DateTime::<Utc>::from_timestamp(*ts, 0)?;
            let field = |col: &Vec<Option<f64>>| col.get(i).copied().flatten().and_then(Decimal::from_f64);
            Some(Bar::new(
                timestamp,
                field(&quote.open)?,
                field(&quote.high)?,
                field(&quote.low)?,
                field(&quote.close)?,
                field(&quote.volume)?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chart_body() -> serde_json::Value {
        json!({
            "chart": {
                "result": [{
                    "meta": { "symbol": "AAPL" },
                    "timestamp": [1704205800, 1704206100, 1704206400],
                    "indicators": {
                        "quote": [{
                            "open":   [185.0, 185.5, null],
                            "high":   [186.0, 186.25, 187.0],
                            "low":    [184.5, 185.0, 185.5],
                            "close":  [185.5, 186.0, 186.5],
                            "volume": [120000, 95000, 80000]
                        }]
                    }
                }],
                "error": null
            }
        })
    }

    #[tokio::test]
    async fn test_fetch_bars_decodes_and_drops_nulls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/AAPL"))
            .and(query_param("range", "5d"))
            .and(query_param("interval", "5m"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chart_body()))
            .mount(&server)
            .await;

        let client = YahooChartClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let bars = client.fetch_bars("AAPL", "5d", "5m").await.unwrap();

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, dec!(185.5));
        assert_eq!(bars[1].high, dec!(186.25));
        assert_eq!(bars[1].volume, dec!(95000));
    }

    #[tokio::test]
    async fn test_fetch_bars_encodes_index_symbols() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/%5EGSPC"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chart_body()))
            .mount(&server)
            .await;

        let client = YahooChartClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let bars = client.fetch_bars("^GSPC", "1mo", "1d").await.unwrap();
        assert_eq!(bars.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "chart": {
                    "result": null,
                    "error": { "code": "Not Found", "description": "No data found, symbol may be delisted" }
                }
            })))
            .mount(&server)
            .await;

        let client = YahooChartClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        assert!(client.fetch_bars("ZZZZ", "5d", "5m").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_chart_errors_propagate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "chart": {
                    "result": null,
                    "error": { "code": "Bad Request", "description": "Invalid input - interval=7m is not supported" }
                }
            })))
            .mount(&server)
            .await;

        let client = YahooChartClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
        assert!(client.fetch_bars("AAPL", "5d", "7m").await.is_err());
    }
}
