//! Configuration management for the reversion trader.
//!
//! Loads settings from environment variables and config files. Every field
//! has a default, so an empty environment yields a runnable paper setup.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Instrument basket and data source settings
    #[serde(default)]
    pub market: MarketConfig,
    /// Indicator windows and regime thresholds
    #[serde(default)]
    pub signal: SignalConfig,
    /// Entry and exit rule thresholds
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Sizing, VaR and circuit breaker parameters
    #[serde(default)]
    pub risk: RiskConfig,
    /// Starting cash and seeded trade statistics
    #[serde(default)]
    pub capital: CapitalConfig,
    /// Cycle cadence
    #[serde(default)]
    pub engine: EngineConfig,
    /// Outbound notification settings
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Privileged operator command settings
    #[serde(default)]
    pub operator: OperatorConfig,
    /// State database location
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Price watch rules (notification only)
    #[serde(default)]
    pub watch: Vec<WatchRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Fixed basket of tradable instruments
    #[serde(default = "default_instruments")]
    pub instruments: Vec<String>,
    /// Broad market proxy used for regime classification
    #[serde(default = "default_regime_proxy")]
    pub regime_proxy: String,
    /// Lookback requested for instrument bars (e.g. "5d")
    #[serde(default = "default_lookback")]
    pub lookback: String,
    /// Sampling interval for instrument bars (e.g. "5m")
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Lookback for the regime proxy
    #[serde(default = "default_regime_lookback")]
    pub regime_lookback: String,
    /// Sampling interval for the regime proxy
    #[serde(default = "default_regime_interval")]
    pub regime_interval: String,
    /// Bounded wait per market data call
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    /// Maximum in-flight market data requests
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Chart API base URL
    #[serde(default = "default_chart_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Rolling window for mean, std and average volume
    #[serde(default = "default_window")]
    pub window: usize,
    /// Bars averaged for ATR
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    /// OBV is non-declining when latest >= value this many bars back
    #[serde(default = "default_obv_lookback")]
    pub obv_lookback: usize,
    /// Minimum volume ratio confirming an entry
    #[serde(default = "default_min_volume_ratio")]
    pub min_volume_ratio: Decimal,
    /// Bars spanned by the regime return
    #[serde(default = "default_regime_horizon")]
    pub regime_horizon: usize,
    /// Return below which (with high vol) the regime is CRASH
    #[serde(default = "default_crash_return")]
    pub crash_return: Decimal,
    /// Realized volatility above which a sharp drop is CRASH
    #[serde(default = "default_crash_volatility")]
    pub crash_volatility: Decimal,
    /// Return below which the regime is BEAR
    #[serde(default = "default_bear_return")]
    pub bear_return: Decimal,
    /// Return above which the regime is BULL
    #[serde(default = "default_bull_return")]
    pub bull_return: Decimal,
}

/// How a trailing stop level is derived from the high-water price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingMode {
    /// high_water - ATR * multiplier
    Atr,
    /// high_water * (1 - retracement)
    Percent,
}

/// How entry notional is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    /// capital * half-Kelly fraction
    Kelly,
    /// base or aggressive fixed amount
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Enter when z-score is below this
    #[serde(default = "default_z_buy")]
    pub z_buy_threshold: Decimal,
    /// Entries below this z-score are recorded as aggressive
    #[serde(default = "default_z_buy_aggressive")]
    pub z_buy_aggressive_threshold: Decimal,
    /// Take partial profit at or above this z-score
    #[serde(default = "default_z_partial_sell")]
    pub z_partial_sell_threshold: Decimal,
    /// Fraction of shares sold on partial exit
    #[serde(default = "default_partial_sell_fraction")]
    pub partial_sell_fraction: Decimal,
    /// Hard stop on unrealized loss fraction (0.015 = 1.5%)
    #[serde(default = "default_stop_loss")]
    pub stop_loss_pct: Decimal,
    /// Unrealized gain that arms the trailing stop
    #[serde(default = "default_trailing_activation")]
    pub trailing_activation_pct: Decimal,
    #[serde(default = "default_trailing_mode")]
    pub trailing_mode: TrailingMode,
    /// ATR multiple below the high-water price (ATR mode)
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: Decimal,
    /// Retracement from the high-water price (percent mode)
    #[serde(default = "default_trailing_retracement")]
    pub trailing_retracement_pct: Decimal,
    /// Maximum concurrent open positions
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default = "default_sizing")]
    pub sizing: SizingMode,
    /// Fixed sizing: normal entry notional
    #[serde(default = "default_base_trade_amount")]
    pub base_trade_amount: Decimal,
    /// Fixed sizing: aggressive entry notional
    #[serde(default = "default_aggressive_trade_amount")]
    pub aggressive_trade_amount: Decimal,
    /// Skip the entry scan while the market regime is CRASH
    #[serde(default = "default_true")]
    pub skip_entries_in_crash: bool,
}

/// Which position to close when portfolio VaR breaches its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationPolicy {
    LargestLoss,
    HighestVolatility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Ceiling on the half-Kelly fraction
    #[serde(default = "default_kelly_cap")]
    pub kelly_cap: Decimal,
    /// Fraction used when Kelly inputs are degenerate
    #[serde(default = "default_kelly_default_fraction")]
    pub kelly_default_fraction: Decimal,
    /// Confidence used for the reported VaR figure
    #[serde(default = "default_var_confidence")]
    pub var_confidence: Decimal,
    /// Confidence used for the forced-liquidation check
    #[serde(default = "default_var_limit_confidence")]
    pub var_limit_confidence: Decimal,
    /// VaR fraction above which one position is force-liquidated
    #[serde(default = "default_var_limit")]
    pub var_limit: Decimal,
    /// Losing full exits in a row that trip the circuit breaker
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    /// Cooldown length once tripped
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    #[serde(default = "default_liquidation_policy")]
    pub liquidation_policy: LiquidationPolicy,
    /// Recompute Kelly inputs from realized exits in the trade log
    #[serde(default)]
    pub update_stats_from_trades: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalConfig {
    /// Cash for a fresh portfolio
    #[serde(default = "default_initial_cash")]
    pub initial_cash: Decimal,
    #[serde(default = "default_win_rate")]
    pub historical_win_rate: Decimal,
    #[serde(default = "default_avg_win")]
    pub historical_avg_win: Decimal,
    #[serde(default = "default_avg_loss")]
    pub historical_avg_loss: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Delay between cycles
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Status summary cadence (0 disables)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Attempts for the end-of-cycle state write
    #[serde(default = "default_commit_retries")]
    pub state_commit_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Webhook receiving JSON `{"text": ...}` posts; log-only when unset
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Caller identifiers allowed to issue privileged commands
    #[serde(default)]
    pub authorized_ids: Vec<String>,
    /// Optional HMAC-SHA256 key; when set, commands must carry a signature
    #[serde(default)]
    pub command_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// How long a writer waits for another holder of the state lock
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

/// Price alert rule for a watched symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchRule {
    pub symbol: String,
    /// Alert when the latest price is below this
    #[serde(default)]
    pub below: Option<Decimal>,
    /// Alert when the latest price is above this
    #[serde(default)]
    pub above: Option<Decimal>,
    /// Alert when |change over the window| exceeds this fraction
    #[serde(default)]
    pub max_abs_change_pct: Option<Decimal>,
}

// Default value functions
fn default_instruments() -> Vec<String> {
    [
        "AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "META", "TSLA", "AVGO", "PEP", "COST", "ADBE",
        "CSCO", "NFLX", "AMD", "INTC", "CMCSA", "TMUS", "AMGN", "TXN", "HON", "QCOM", "INTU",
        "SBUX", "AMAT", "ISRG", "MDLZ", "GILD", "BKNG", "ADI", "VRTX",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_regime_proxy() -> String {
    "SPY".to_string()
}

fn default_lookback() -> String {
    "5d".to_string()
}

fn default_interval() -> String {
    "5m".to_string()
}

fn default_regime_lookback() -> String {
    "1mo".to_string()
}

fn default_regime_interval() -> String {
    "1d".to_string()
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_max_concurrent_fetches() -> usize {
    8
}

fn default_chart_url() -> String {
    crate::market::DEFAULT_CHART_URL.to_string()
}

fn default_window() -> usize {
    20
}

fn default_atr_period() -> usize {
    14
}

fn default_obv_lookback() -> usize {
    5
}

fn default_min_volume_ratio() -> Decimal {
    Decimal::new(2, 0) // 2.0x average volume
}

fn default_regime_horizon() -> usize {
    5
}

fn default_crash_return() -> Decimal {
    Decimal::new(-5, 2) // -5%
}

fn default_crash_volatility() -> Decimal {
    Decimal::new(2, 2) // 2% per-bar realized vol
}

fn default_bear_return() -> Decimal {
    Decimal::new(-2, 2) // -2%
}

fn default_bull_return() -> Decimal {
    Decimal::new(2, 2) // +2%
}

fn default_z_buy() -> Decimal {
    Decimal::new(-20, 1) // -2.0
}

fn default_z_buy_aggressive() -> Decimal {
    Decimal::new(-30, 1) // -3.0
}

fn default_z_partial_sell() -> Decimal {
    Decimal::new(15, 1) // 1.5
}

fn default_partial_sell_fraction() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_stop_loss() -> Decimal {
    Decimal::new(15, 3) // 0.015
}

fn default_trailing_activation() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_trailing_mode() -> TrailingMode {
    TrailingMode::Atr
}

fn default_atr_multiplier() -> Decimal {
    Decimal::new(15, 1) // 1.5
}

fn default_trailing_retracement() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_max_positions() -> usize {
    5
}

fn default_sizing() -> SizingMode {
    SizingMode::Kelly
}

fn default_base_trade_amount() -> Decimal {
    Decimal::new(5000, 0)
}

fn default_aggressive_trade_amount() -> Decimal {
    Decimal::new(10000, 0)
}

fn default_true() -> bool {
    true
}

fn default_kelly_cap() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_kelly_default_fraction() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_var_confidence() -> Decimal {
    Decimal::new(95, 2) // 0.95
}

fn default_var_limit_confidence() -> Decimal {
    Decimal::new(99, 2) // 0.99
}

fn default_var_limit() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_max_consecutive_losses() -> u32 {
    3
}

fn default_cooldown_minutes() -> i64 {
    120
}

fn default_liquidation_policy() -> LiquidationPolicy {
    LiquidationPolicy::LargestLoss
}

fn default_initial_cash() -> Decimal {
    Decimal::new(100_000, 0)
}

fn default_win_rate() -> Decimal {
    Decimal::new(55, 2) // 0.55
}

fn default_avg_win() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_avg_loss() -> Decimal {
    Decimal::new(15, 3) // 0.015
}

fn default_cycle_interval() -> u64 {
    300
}

fn default_heartbeat_interval() -> u64 {
    3600
}

fn default_commit_retries() -> u32 {
    3
}

fn default_notify_timeout() -> u64 {
    10
}

fn default_db_path() -> String {
    "data/trader_state.db".to_string()
}

fn default_lock_timeout_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("RVT"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.market.instruments.is_empty(),
            "at least one instrument is required"
        );

        anyhow::ensure!(
            self.signal.window >= 2 && self.signal.atr_period >= 1,
            "window must be >= 2 and atr_period >= 1"
        );

        anyhow::ensure!(
            self.strategy.z_buy_aggressive_threshold <= self.strategy.z_buy_threshold
                && self.strategy.z_buy_threshold < self.strategy.z_partial_sell_threshold,
            "z thresholds must satisfy aggressive <= buy < partial_sell"
        );

        anyhow::ensure!(
            self.strategy.partial_sell_fraction > Decimal::ZERO
                && self.strategy.partial_sell_fraction < Decimal::ONE,
            "partial_sell_fraction must be between 0 and 1 (exclusive)"
        );

        anyhow::ensure!(
            self.strategy.stop_loss_pct > Decimal::ZERO && self.strategy.stop_loss_pct < Decimal::ONE,
            "stop_loss_pct must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.kelly_cap > Decimal::ZERO && self.risk.kelly_cap <= Decimal::ONE,
            "kelly_cap must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.kelly_default_fraction >= Decimal::ZERO
                && self.risk.kelly_default_fraction <= self.risk.kelly_cap,
            "kelly_default_fraction must be between 0 and kelly_cap"
        );

        anyhow::ensure!(
            self.risk.var_confidence > Decimal::ZERO && self.risk.var_confidence < Decimal::ONE,
            "var_confidence must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.var_limit_confidence > Decimal::ZERO
                && self.risk.var_limit_confidence < Decimal::ONE,
            "var_limit_confidence must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.max_consecutive_losses >= 1 && self.risk.cooldown_minutes > 0,
            "max_consecutive_losses and cooldown_minutes must be positive"
        );

        anyhow::ensure!(
            self.capital.initial_cash >= Decimal::ZERO,
            "initial_cash must be non-negative"
        );

        anyhow::ensure!(
            self.engine.cycle_interval_secs > 0,
            "cycle_interval_secs must be positive"
        );

        Ok(())
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            instruments: default_instruments(),
            regime_proxy: default_regime_proxy(),
            lookback: default_lookback(),
            interval: default_interval(),
            regime_lookback: default_regime_lookback(),
            regime_interval: default_regime_interval(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            base_url: default_chart_url(),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            atr_period: default_atr_period(),
            obv_lookback: default_obv_lookback(),
            min_volume_ratio: default_min_volume_ratio(),
            regime_horizon: default_regime_horizon(),
            crash_return: default_crash_return(),
            crash_volatility: default_crash_volatility(),
            bear_return: default_bear_return(),
            bull_return: default_bull_return(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            z_buy_threshold: default_z_buy(),
            z_buy_aggressive_threshold: default_z_buy_aggressive(),
            z_partial_sell_threshold: default_z_partial_sell(),
            partial_sell_fraction: default_partial_sell_fraction(),
            stop_loss_pct: default_stop_loss(),
            trailing_activation_pct: default_trailing_activation(),
            trailing_mode: default_trailing_mode(),
            atr_multiplier: default_atr_multiplier(),
            trailing_retracement_pct: default_trailing_retracement(),
            max_positions: default_max_positions(),
            sizing: default_sizing(),
            base_trade_amount: default_base_trade_amount(),
            aggressive_trade_amount: default_aggressive_trade_amount(),
            skip_entries_in_crash: default_true(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            kelly_cap: default_kelly_cap(),
            kelly_default_fraction: default_kelly_default_fraction(),
            var_confidence: default_var_confidence(),
            var_limit_confidence: default_var_limit_confidence(),
            var_limit: default_var_limit(),
            max_consecutive_losses: default_max_consecutive_losses(),
            cooldown_minutes: default_cooldown_minutes(),
            liquidation_policy: default_liquidation_policy(),
            update_stats_from_trades: false,
        }
    }
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            initial_cash: default_initial_cash(),
            historical_win_rate: default_win_rate(),
            historical_avg_win: default_avg_win(),
            historical_avg_loss: default_avg_loss(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            state_commit_retries: default_commit_retries(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notify_timeout(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.market.instruments.len(), 30);
        assert_eq!(config.signal.window, 20);
        assert_eq!(config.strategy.stop_loss_pct, dec!(0.015));
        assert_eq!(config.risk.kelly_cap, dec!(0.20));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = Config::default();
        config.strategy.z_buy_threshold = dec!(2.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "strategy": { "trailing_mode": "percent", "max_positions": 3 },
                 "watch": [ { "symbol": "NVDA", "below": "192" } ] }"#,
        )
        .unwrap();

        assert_eq!(config.strategy.trailing_mode, TrailingMode::Percent);
        assert_eq!(config.strategy.max_positions, 3);
        assert_eq!(config.strategy.z_partial_sell_threshold, dec!(1.5));
        assert_eq!(config.watch[0].below, Some(dec!(192)));
        assert!(config.watch[0].above.is_none());
        assert!(config.validate().is_ok());
    }
}
