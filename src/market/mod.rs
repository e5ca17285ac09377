//! Market data access.
//!
//! ## Yahoo
//! Chart API client returning OHLCV bars per instrument.
//!
//! ## Mock
//! In-memory provider used for paper runs and tests.

pub mod mock;
mod traits;
mod types;
mod yahoo;

pub use mock::{bars_from_closes, MockMarketData};
pub use traits::{fetch_snapshot, MarketDataProvider};
pub use types::*;
pub use yahoo::{YahooChartClient, DEFAULT_CHART_URL};
