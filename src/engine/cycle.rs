//! One full evaluation pass over the portfolio.
//!
//! Order within a cycle:
//! 1. Take the state lease, load state; expire or honour a cooldown
//! 2. Fetch held instruments and the regime proxy concurrently
//! 3. Forced liquidation if VaR at the limit confidence breaches the limit
//! 4. Exit rules per held instrument (sequential state mutation)
//! 5. Trip the breaker on a losing streak, short-circuiting the rest
//! 6. Entry scan over flat instruments, watch alerts
//! 7. Commit state, then append the trade log and notify
//!
//! The lease is held from load to commit, so an operator command from this
//! or another process never interleaves with a cycle.

use super::report::{CycleReport, CycleStatus, InstrumentOutcome};
use crate::assistant::AssistantContext;
use crate::config::Config;
use crate::error::{EngineError, SkipReason};
use crate::market::{fetch_snapshot, MarketDataProvider, MarketSnapshot};
use crate::notify::{notify_best_effort, Notifier};
use crate::persistence::{StateLease, StateStore};
use crate::portfolio::{PortfolioState, TradeAction};
use crate::risk::{
    portfolio_var, return_volatility, select_target, BreakerCheck, BreakerState, CircuitBreaker,
    KellySizer, LiquidationCandidate, TradeStats, VarReport,
};
use crate::signal::{MarketRegime, RegimeClassifier, SignalEvaluator};
use crate::strategy::{check_rule, OpportunityScanner, PositionManager};
use crate::utils::decimal::to_percent;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

type Snapshots = HashMap<String, Result<MarketSnapshot, SkipReason>>;

/// Portfolio marked to the latest available prices.
#[derive(Debug, Clone)]
pub struct Valuation {
    pub state: PortfolioState,
    pub prices: HashMap<String, Decimal>,
    pub var: VarReport,
}

impl Valuation {
    pub fn equity(&self) -> Decimal {
        self.state.total_value(&self.prices)
    }
}

fn last_prices(snapshots: &Snapshots) -> HashMap<String, Decimal> {
    snapshots
        .iter()
        .filter_map(|(symbol, snap)| {
            let price = snap.as_ref().ok()?.last_close()?;
            Some((symbol.clone(), price))
        })
        .collect()
}

fn volatilities(snapshots: &Snapshots) -> HashMap<String, Decimal> {
    snapshots
        .iter()
        .filter_map(|(symbol, snap)| {
            let vol = return_volatility(&snap.as_ref().ok()?.closes())?;
            Some((symbol.clone(), vol))
        })
        .collect()
}

/// Drives the decision engine once per cycle.
///
/// Holds no portfolio state of its own: every pass loads the aggregate from
/// the store and commits it back.
pub struct CycleOrchestrator {
    pub(crate) config: Config,
    provider: Arc<dyn MarketDataProvider>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) store: Arc<dyn StateStore>,
    evaluator: SignalEvaluator,
    regime: RegimeClassifier,
    manager: PositionManager,
    scanner: OpportunityScanner,
    kelly: KellySizer,
    breaker: CircuitBreaker,
    commit_backoff: Duration,
}

impl CycleOrchestrator {
    pub fn new(
        config: Config,
        provider: Arc<dyn MarketDataProvider>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            evaluator: SignalEvaluator::new(config.signal.clone()),
            regime: RegimeClassifier::new(config.signal.clone()),
            manager: PositionManager::new(config.strategy.clone()),
            scanner: OpportunityScanner::new(
                config.signal.min_volume_ratio,
                config.strategy.max_positions,
            ),
            kelly: KellySizer::new(&config.risk),
            breaker: CircuitBreaker::new(&config.risk),
            commit_backoff: Duration::from_millis(500),
            config,
            provider,
            notifier,
            store,
        }
    }

    /// Override the delay between state commit attempts.
    pub fn with_commit_backoff(mut self, backoff: Duration) -> Self {
        self.commit_backoff = backoff;
        self
    }

    /// Exclusive hold on the persisted portfolio until commit or drop.
    pub(crate) async fn lease(&self) -> Result<StateLease, EngineError> {
        StateLease::acquire(self.store.clone())
            .await
            .map_err(EngineError::StateLock)
    }

    /// Load the persisted portfolio, or a fresh one when none exists.
    pub(crate) fn load_state(&self) -> Result<PortfolioState, EngineError> {
        let loaded = self.store.load_state().map_err(EngineError::StateLoad)?;
        Ok(loaded.unwrap_or_else(|| {
            info!(cash = %self.config.capital.initial_cash, "No saved state, starting fresh portfolio");
            PortfolioState::new(&self.config.capital)
        }))
    }

    /// Write the portfolio and release the lease, retrying with linear
    /// backoff.
    pub(crate) async fn commit(&self, state: &PortfolioState) -> Result<(), EngineError> {
        let attempts = self.config.engine.state_commit_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let result = self
                .store
                .save_state(state)
                .and_then(|()| self.store.release_exclusive(true));
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "State commit failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.commit_backoff * attempt).await;
                    }
                }
            }
        }

        let source = last_error.unwrap_or_else(|| anyhow::anyhow!("no commit attempted"));
        error!(attempts, error = %source, "❌ State commit abandoned");
        notify_best_effort(
            self.notifier.as_ref(),
            &format!("State commit failed after {} attempts: {}", attempts, source),
        )
        .await;
        Err(EngineError::StateCommit { attempts, source })
    }

    /// Fetch instrument snapshots concurrently, each with a bounded wait.
    pub(crate) async fn fetch_many(&self, symbols: &[String]) -> Snapshots {
        let market = &self.config.market;
        let provider = self.provider.as_ref();
        let timeout = Duration::from_secs(market.fetch_timeout_secs);

        stream::iter(symbols.iter().cloned())
            .map(|symbol| async move {
                let result =
                    fetch_snapshot(provider, &symbol, &market.lookback, &market.interval, timeout)
                        .await;
                (symbol, result)
            })
            .buffer_unordered(market.max_concurrent_fetches.max(1))
            .collect()
            .await
    }

    async fn fetch_regime(&self) -> MarketRegime {
        let market = &self.config.market;
        let fetched = fetch_snapshot(
            self.provider.as_ref(),
            &market.regime_proxy,
            &market.regime_lookback,
            &market.regime_interval,
            Duration::from_secs(market.fetch_timeout_secs),
        )
        .await;

        match fetched {
            Ok(snapshot) => self.regime.classify(&snapshot),
            Err(reason) => {
                warn!(proxy = %market.regime_proxy, %reason, "Regime proxy unavailable, assuming SIDEWAYS");
                MarketRegime::Sideways
            }
        }
    }

    /// Replace seeded Kelly inputs with trade-log statistics when enabled.
    fn refresh_trade_stats(&self, state: &mut PortfolioState) {
        if !self.config.risk.update_stats_from_trades {
            return;
        }
        match self.store.realized_exit_returns() {
            Ok(returns) => {
                if let Some(stats) = TradeStats::from_returns(&returns) {
                    debug!(
                        win_rate = %stats.win_rate,
                        avg_win = %stats.avg_win,
                        avg_loss = %stats.avg_loss,
                        exits = stats.exits,
                        "Kelly inputs refreshed from trade log"
                    );
                    stats.apply_to(state);
                }
            }
            Err(e) => warn!(error = %e, "Could not read trade log for Kelly statistics"),
        }
    }

    /// Run one full cycle at `now`.
    #[instrument(skip(self), fields(at = %now.format("%H:%M:%S")))]
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, EngineError> {
        let _lease = self.lease().await?;
        let mut state = self.load_state()?;
        let mut report = CycleReport::new(now);

        self.refresh_trade_stats(&mut state);

        match self.breaker.check(&mut state, now) {
            BreakerCheck::Halted { until } => {
                debug!(%until, "Cooldown active, skipping cycle");
                report.status = CycleStatus::Halted { until };
                report.cash = state.cash;
                report.open_positions = state.position_count();
                return Ok(report);
            }
            BreakerCheck::Resumed => {
                report.resumed = true;
                report.notices.push("Cooldown expired, trading resumed".to_string());
            }
            BreakerCheck::Active => {}
        }

        if let Some(until) = self.breaker.trip_if_needed(&mut state, now) {
            self.tripped(&mut report, state.consecutive_losses, until);
            return self.finish(state, report).await;
        }

        let held = state.open_symbols();
        let (mut snapshots, regime) = tokio::join!(self.fetch_many(&held), self.fetch_regime());
        report.regime = Some(regime);

        let prices = last_prices(&snapshots);
        let vols = volatilities(&snapshots);
        self.enforce_var_limit(&mut state, &prices, &vols, &mut report, now);

        for symbol in state.open_symbols() {
            let outcome = match snapshots.get(&symbol) {
                Some(Ok(snapshot)) => self.manage_position(&mut state, snapshot, regime, now),
                Some(Err(reason)) => InstrumentOutcome::from_skip(reason.clone()),
                None => InstrumentOutcome::Skipped(SkipReason::NoData),
            };
            if let InstrumentOutcome::Failed(reason) = &outcome {
                warn!(symbol = %symbol, %reason, "Position evaluation failed");
            }
            report.record(&symbol, outcome);
        }

        if let Some(until) = self.breaker.trip_if_needed(&mut state, now) {
            self.tripped(&mut report, state.consecutive_losses, until);
            return self.finish(state, report).await;
        }

        let held_at_start: HashSet<String> = held.into_iter().collect();
        self.scan_entries(&mut state, &mut snapshots, &held_at_start, regime, &mut report, now)
            .await;
        self.check_watch_rules(&mut snapshots, &mut report).await;

        report.reported_var = Some(portfolio_var(
            &state,
            &last_prices(&snapshots),
            &volatilities(&snapshots),
            self.config.risk.var_confidence,
        ));

        self.finish(state, report).await
    }

    fn tripped(&self, report: &mut CycleReport, losses: u32, until: DateTime<Utc>) {
        report.status = CycleStatus::Tripped { until };
        report.notices.push(format!(
            "🚨 Circuit breaker: {} consecutive losses, trading halted until {}",
            losses,
            until.format("%Y-%m-%d %H:%M UTC")
        ));
    }

    /// Close one position when VaR at the limit confidence exceeds the limit.
    fn enforce_var_limit(
        &self,
        state: &mut PortfolioState,
        prices: &HashMap<String, Decimal>,
        vols: &HashMap<String, Decimal>,
        report: &mut CycleReport,
        now: DateTime<Utc>,
    ) {
        if state.positions.is_empty() {
            return;
        }

        let risk = &self.config.risk;
        let var = portfolio_var(state, prices, vols, risk.var_limit_confidence);
        let breached = var.var_fraction > risk.var_limit;
        debug!(var = %var.var_fraction, limit = %risk.var_limit, breached, "VaR limit check");
        report.limit_var = Some(var.clone());

        if !breached {
            return;
        }

        let candidates: Vec<LiquidationCandidate> = state
            .open_symbols()
            .into_iter()
            .filter_map(|symbol| {
                let price = *prices.get(&symbol)?;
                let position = state.positions.get(&symbol)?;
                Some(LiquidationCandidate {
                    pnl_fraction: position.pnl_fraction(price),
                    volatility: vols.get(&symbol).copied(),
                    symbol,
                })
            })
            .collect();

        let Some(target) = select_target(risk.liquidation_policy, &candidates) else {
            warn!(var = %var.var_fraction, "VaR limit breached but no position can be priced");
            return;
        };
        let Some(&price) = prices.get(&target.symbol) else {
            return;
        };

        if let Some(trade) =
            state.close_position(&target.symbol, price, TradeAction::ForcedLiquidation, now)
        {
            warn!(
                symbol = %trade.symbol,
                var = %var.var_fraction,
                limit = %risk.var_limit,
                pnl = %trade.pnl,
                "[RISK] VaR limit breached, position force-liquidated"
            );
            report.notices.push(format!(
                "⚠️ VaR {:.2}% above {:.2}% limit: force-liquidated {}",
                to_percent(var.var_fraction),
                to_percent(risk.var_limit),
                trade.symbol
            ));
            report.record_trade(trade);
        }
    }

    fn manage_position(
        &self,
        state: &mut PortfolioState,
        snapshot: &MarketSnapshot,
        regime: MarketRegime,
        now: DateTime<Utc>,
    ) -> InstrumentOutcome {
        let Some(price) = snapshot.last_close() else {
            return InstrumentOutcome::Skipped(SkipReason::NoData);
        };

        let signal = match self.evaluator.evaluate(snapshot, regime) {
            Ok(signal) => Some(signal),
            Err(SkipReason::ZeroVariance) => {
                debug!(symbol = %snapshot.symbol, "Flat window, price-only rules apply");
                None
            }
            Err(reason) => return InstrumentOutcome::from_skip(reason),
        };

        let trades = self
            .manager
            .manage(state, &snapshot.symbol, price, signal.as_ref(), now);
        if trades.is_empty() {
            InstrumentOutcome::Held
        } else {
            InstrumentOutcome::Acted(trades)
        }
    }

    async fn scan_entries(
        &self,
        state: &mut PortfolioState,
        snapshots: &mut Snapshots,
        exclude: &HashSet<String>,
        regime: MarketRegime,
        report: &mut CycleReport,
        now: DateTime<Utc>,
    ) {
        let strategy = &self.config.strategy;
        if state.position_count() >= strategy.max_positions {
            debug!(positions = state.position_count(), "Position limit reached, no entry scan");
            return;
        }
        if regime == MarketRegime::Crash && strategy.skip_entries_in_crash {
            info!("Market regime CRASH, skipping entry scan");
            return;
        }

        let flat: Vec<String> = self
            .config
            .market
            .instruments
            .iter()
            .filter(|s| !state.positions.contains_key(*s) && !exclude.contains(*s))
            .cloned()
            .collect();
        let missing: Vec<String> = flat
            .iter()
            .filter(|s| !snapshots.contains_key(*s))
            .cloned()
            .collect();
        let fetched = self.fetch_many(&missing).await;
        snapshots.extend(fetched);

        let mut signals = Vec::new();
        for symbol in &flat {
            let evaluated = match snapshots.get(symbol) {
                Some(Ok(snapshot)) => self.evaluator.evaluate(snapshot, regime),
                Some(Err(reason)) => Err(reason.clone()),
                None => Err(SkipReason::NoData),
            };
            match evaluated {
                Ok(signal) => signals.push(signal),
                Err(reason) => report.record(symbol, InstrumentOutcome::from_skip(reason)),
            }
        }

        let evaluated: Vec<String> = signals.iter().map(|s| s.symbol.clone()).collect();
        let candidates = self.scanner.rank(&self.manager, state, signals);
        let kelly_fraction = self.kelly.for_state(state);
        let mut opened: HashMap<String, _> = self
            .scanner
            .fill(&self.manager, state, &candidates, kelly_fraction, now)
            .into_iter()
            .map(|trade| (trade.symbol.clone(), trade))
            .collect();

        debug!(
            evaluated = evaluated.len(),
            qualified = candidates.len(),
            opened = opened.len(),
            %kelly_fraction,
            "Entry scan complete"
        );

        for symbol in evaluated {
            let outcome = match opened.remove(&symbol) {
                Some(trade) => InstrumentOutcome::Acted(vec![trade]),
                None => InstrumentOutcome::Held,
            };
            report.record(&symbol, outcome);
        }
    }

    async fn check_watch_rules(&self, snapshots: &mut Snapshots, report: &mut CycleReport) {
        if self.config.watch.is_empty() {
            return;
        }

        let missing: Vec<String> = self
            .config
            .watch
            .iter()
            .map(|rule| rule.symbol.clone())
            .filter(|s| !snapshots.contains_key(s))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let fetched = self.fetch_many(&missing).await;
        snapshots.extend(fetched);

        for rule in &self.config.watch {
            match snapshots.get(&rule.symbol) {
                Some(Ok(snapshot)) => report.alerts.extend(check_rule(rule, snapshot)),
                Some(Err(reason)) => debug!(symbol = %rule.symbol, %reason, "Watch symbol unavailable"),
                None => {}
            }
        }
    }

    /// Commit, then log trades and notify. Nothing is logged or announced
    /// for a cycle whose state did not persist.
    async fn finish(
        &self,
        state: PortfolioState,
        mut report: CycleReport,
    ) -> Result<CycleReport, EngineError> {
        report.cash = state.cash;
        report.open_positions = state.position_count();

        self.commit(&state).await?;

        for trade in &report.trades {
            trade.emit();
            if let Err(e) = self.store.record_trade(trade) {
                warn!(symbol = %trade.symbol, error = %e, "Failed to append trade log");
            }
        }

        let notifier = self.notifier.as_ref();
        for trade in &report.trades {
            notify_best_effort(notifier, &trade.describe()).await;
        }
        for notice in &report.notices {
            notify_best_effort(notifier, notice).await;
        }
        for alert in &report.alerts {
            notify_best_effort(notifier, &alert.message()).await;
        }

        info!("[CYCLE] {}", report.summary());
        Ok(report)
    }

    /// Load state and mark held positions to fresh prices.
    pub async fn valuation(&self) -> Result<Valuation, EngineError> {
        let state = self.load_state()?;
        let snapshots = self.fetch_many(&state.open_symbols()).await;
        let prices = last_prices(&snapshots);
        let var = portfolio_var(
            &state,
            &prices,
            &volatilities(&snapshots),
            self.config.risk.var_confidence,
        );
        Ok(Valuation { state, prices, var })
    }

    /// Context object for the operator assistant.
    pub async fn assistant_context(&self) -> Result<AssistantContext, EngineError> {
        let valuation = self.valuation().await?;
        Ok(AssistantContext::build(
            &valuation.state,
            &valuation.prices,
            valuation.var.var_fraction,
        ))
    }

    /// Send a status summary through the notifier.
    pub async fn heartbeat(&self, now: DateTime<Utc>) {
        let valuation = match self.valuation().await {
            Ok(valuation) => valuation,
            Err(e) => {
                warn!(error = %e, "Heartbeat skipped");
                return;
            }
        };

        let breaker = match self.breaker.state(&valuation.state, now) {
            BreakerState::Active => "ACTIVE".to_string(),
            BreakerState::Cooldown { until } => format!("COOLDOWN until {}", until.format("%H:%M UTC")),
        };
        let message = format!(
            "💓 Heartbeat | equity ${:.2} | cash ${:.2} | positions {} | VaR({}) {:.2}% | {}",
            valuation.equity(),
            valuation.state.cash,
            valuation.state.position_count(),
            valuation.var.confidence,
            to_percent(valuation.var.var_fraction),
            breaker
        );
        notify_best_effort(self.notifier.as_ref(), &message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchRule;
    use crate::market::MockMarketData;
    use crate::notify::RecordingNotifier;
    use crate::persistence::PersistenceManager;
    use crate::portfolio::PositionRecord;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        engine: CycleOrchestrator,
        market: Arc<MockMarketData>,
        notifier: Arc<RecordingNotifier>,
        store: Arc<PersistenceManager>,
    }

    fn config(instruments: &[&str]) -> Config {
        let mut config = Config::default();
        config.market.instruments = instruments.iter().map(|s| s.to_string()).collect();
        config
    }

    fn harness(config: Config) -> Harness {
        let market = Arc::new(MockMarketData::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(PersistenceManager::new(":memory:").unwrap());
        let engine = CycleOrchestrator::new(config, market.clone(), notifier.clone(), store.clone())
            .with_commit_backoff(Duration::ZERO);
        Harness {
            engine,
            market,
            notifier,
            store,
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-04T15:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    /// Oversold drop: z ~ -2.95, volume ratio ~ 2.33, OBV non-declining.
    fn oversold_closes() -> (Vec<Decimal>, Vec<Decimal>) {
        let mut closes: Vec<Decimal> = (0..15)
            .map(|i| if i % 2 == 0 { dec!(101) } else { dec!(99) })
            .collect();
        closes.extend([dec!(101.5), dec!(102), dec!(102.5), dec!(103), dec!(95)]);
        let mut volumes = vec![dec!(1000); 19];
        volumes.push(dec!(2500));
        (closes, volumes)
    }

    fn alternating(a: Decimal, b: Decimal, n: usize) -> Vec<Decimal> {
        (0..n).map(|i| if i % 2 == 0 { a } else { b }).collect()
    }

    fn hold(state: &mut PortfolioState, symbol: &str, entry: Decimal, shares: Decimal) {
        state.cash -= entry * shares;
        state
            .positions
            .insert(symbol.to_string(), PositionRecord::new(entry, shares, now()));
    }

    fn seed(h: &Harness, edit: impl FnOnce(&mut PortfolioState)) {
        let mut state = PortfolioState::new(&h.engine.config.capital);
        edit(&mut state);
        h.store.save_state(&state).unwrap();
    }

    fn saved(h: &Harness) -> PortfolioState {
        h.store.load_state().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_oversold_entry_sized_by_kelly() {
        let h = harness(config(&["AAPL"]));
        let (closes, volumes) = oversold_closes();
        h.market.set_closes("AAPL", &closes, &volumes).await;

        let report = h.engine.run_cycle(now()).await.unwrap();

        assert_eq!(report.trades.len(), 1);
        let trade = &report.trades[0];
        assert_eq!(trade.action, TradeAction::Buy);
        assert_eq!(trade.price, dec!(95));
        // 100000 cash * 0.20 half-Kelly cap
        assert_eq!((trade.price * trade.shares).round_dp(2), dec!(20000));

        let state = saved(&h);
        assert_eq!(state.cash, dec!(80000));
        assert_eq!(state.positions["AAPL"].high_water_price, dec!(95));
        assert_eq!(h.store.recent_trades(10).unwrap().len(), 1);
        assert!(h.notifier.contains("BUY AAPL"));
    }

    #[tokio::test]
    async fn test_trailing_exit_realizes_gain() {
        let h = harness(config(&["AAPL"]));
        seed(&h, |s| {
            hold(s, "AAPL", dec!(100), dec!(10));
            s.positions.get_mut("AAPL").unwrap().high_water_price = dec!(110);
            s.consecutive_losses = 2;
        });
        let mut closes = alternating(dec!(106.4), dec!(106.6), 20);
        closes.push(dec!(106.5));
        h.market.set_closes("AAPL", &closes, &[dec!(1000)]).await;

        let report = h.engine.run_cycle(now()).await.unwrap();

        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].action, TradeAction::TrailingStop);
        assert_eq!(report.trades[0].pnl, dec!(65));
        let state = saved(&h);
        assert!(state.positions.is_empty());
        assert_eq!(state.cash, dec!(99000) + dec!(1065));
        assert_eq!(state.consecutive_losses, 0);
    }

    #[tokio::test]
    async fn test_hard_stop_counts_loss() {
        let h = harness(config(&["AAPL"]));
        seed(&h, |s| hold(s, "AAPL", dec!(100), dec!(10)));
        let mut closes = alternating(dec!(98.5), dec!(98.3), 20);
        closes.push(dec!(98.4));
        h.market.set_closes("AAPL", &closes, &[dec!(1000)]).await;

        let report = h.engine.run_cycle(now()).await.unwrap();

        assert_eq!(report.trades[0].action, TradeAction::HardStopLoss);
        assert_eq!(report.trades[0].pnl, dec!(-16));
        assert_eq!(saved(&h).consecutive_losses, 1);
    }

    #[tokio::test]
    async fn test_flat_window_skips_z_rules() {
        let h = harness(config(&["AAPL", "MSFT"]));
        seed(&h, |s| hold(s, "AAPL", dec!(100), dec!(10)));
        h.market.set_closes("AAPL", &[dec!(100); 25], &[dec!(1000)]).await;
        h.market.set_closes("MSFT", &[dec!(50); 25], &[dec!(1000)]).await;

        let report = h.engine.run_cycle(now()).await.unwrap();

        assert!(report.trades.is_empty());
        assert_eq!(report.outcomes["AAPL"], InstrumentOutcome::Held);
        assert_eq!(
            report.outcomes["MSFT"],
            InstrumentOutcome::Skipped(SkipReason::ZeroVariance)
        );
        assert_eq!(saved(&h).positions["AAPL"].shares, dec!(10));
    }

    #[tokio::test]
    async fn test_flat_window_still_hard_stops() {
        let h = harness(config(&["AAPL"]));
        seed(&h, |s| hold(s, "AAPL", dec!(100), dec!(10)));
        h.market.set_closes("AAPL", &[dec!(98); 25], &[dec!(1000)]).await;

        let report = h.engine.run_cycle(now()).await.unwrap();
        assert_eq!(report.trades[0].action, TradeAction::HardStopLoss);
    }

    #[tokio::test]
    async fn test_partial_exit_not_repeated() {
        let h = harness(config(&["AAPL"]));
        seed(&h, |s| hold(s, "AAPL", dec!(100), dec!(10)));
        // Sharp rally above the window mean, gain below the trailing trigger
        let mut closes = alternating(dec!(99.6), dec!(99.4), 19);
        closes.push(dec!(100.5));
        h.market.set_closes("AAPL", &closes, &[dec!(1000)]).await;

        let first = h.engine.run_cycle(now()).await.unwrap();
        assert_eq!(first.trades.len(), 1);
        assert_eq!(first.trades[0].action, TradeAction::PartialSell);
        assert_eq!(saved(&h).positions["AAPL"].shares, dec!(5));

        let second = h.engine.run_cycle(now() + ChronoDuration::minutes(5)).await.unwrap();
        assert!(second.trades.is_empty());
        let state = saved(&h);
        assert_eq!(state.positions["AAPL"].shares, dec!(5));
        assert!(state.positions["AAPL"].partially_closed);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_entries_until_expiry() {
        let h = harness(config(&["AAPL", "MSFT", "NVDA", "AMD"]));
        seed(&h, |s| {
            hold(s, "AAPL", dec!(100), dec!(10));
            hold(s, "MSFT", dec!(100), dec!(10));
            hold(s, "NVDA", dec!(100), dec!(10));
        });
        let mut losing = alternating(dec!(98.1), dec!(97.9), 20);
        losing.push(dec!(98));
        for symbol in ["AAPL", "MSFT", "NVDA"] {
            h.market.set_closes(symbol, &losing, &[dec!(1000)]).await;
        }
        let (closes, volumes) = oversold_closes();
        h.market.set_closes("AMD", &closes, &volumes).await;

        // Three stop-outs trip the breaker; AMD is not entered this cycle
        let tripped = h.engine.run_cycle(now()).await.unwrap();
        assert_eq!(tripped.trades.len(), 3);
        assert!(matches!(tripped.status, CycleStatus::Tripped { .. }));
        assert!(!tripped.outcomes.contains_key("AMD"));
        assert!(h.notifier.contains("Circuit breaker"));

        let state = saved(&h);
        assert_eq!(state.consecutive_losses, 3);
        assert_eq!(state.cooldown_until, Some(now() + ChronoDuration::hours(2)));

        // Next cycle is halted
        let halted = h.engine.run_cycle(now() + ChronoDuration::minutes(5)).await.unwrap();
        assert!(matches!(halted.status, CycleStatus::Halted { .. }));
        assert!(halted.trades.is_empty());

        // After expiry, entries resume and the streak is reset
        let resumed = h.engine.run_cycle(now() + ChronoDuration::hours(2)).await.unwrap();
        assert!(resumed.resumed);
        assert_eq!(resumed.trades.len(), 1);
        assert_eq!(resumed.trades[0].symbol, "AMD");
        assert!(resumed.trades[0].action.is_entry());
        let state = saved(&h);
        assert_eq!(state.consecutive_losses, 0);
        assert!(state.cooldown_until.is_none());
    }

    #[tokio::test]
    async fn test_instrument_failure_is_isolated() {
        let h = harness(config(&["AAPL", "MSFT", "NVDA"]));
        seed(&h, |s| hold(s, "MSFT", dec!(100), dec!(10)));
        h.market.fail_symbol("MSFT").await;
        let (closes, volumes) = oversold_closes();
        h.market.set_closes("AAPL", &closes, &volumes).await;

        let report = h.engine.run_cycle(now()).await.unwrap();

        assert!(matches!(report.outcomes["MSFT"], InstrumentOutcome::Failed(_)));
        assert_eq!(
            report.outcomes["NVDA"],
            InstrumentOutcome::Skipped(SkipReason::NoData)
        );
        assert!(matches!(report.outcomes["AAPL"], InstrumentOutcome::Acted(_)));

        let state = saved(&h);
        assert!(state.positions.contains_key("MSFT"));
        assert!(state.positions.contains_key("AAPL"));
    }

    #[tokio::test]
    async fn test_var_breach_liquidates_largest_loss() {
        let h = harness(config(&["AAPL", "MSFT"]));
        seed(&h, |s| {
            hold(s, "AAPL", dec!(101), dec!(10));
            hold(s, "MSFT", dec!(101), dec!(10));
        });
        // ~3% swings per bar put 99% VaR far above 2%
        h.market
            .set_closes("AAPL", &alternating(dec!(103), dec!(100), 20), &[dec!(1000)])
            .await;
        h.market
            .set_closes("MSFT", &alternating(dec!(100), dec!(103), 20), &[dec!(1000)])
            .await;

        let report = h.engine.run_cycle(now()).await.unwrap();

        let var = report.limit_var.as_ref().unwrap();
        assert!(var.var_fraction > dec!(0.02));
        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].action, TradeAction::ForcedLiquidation);
        assert_eq!(report.trades[0].symbol, "AAPL");

        let state = saved(&h);
        assert!(!state.positions.contains_key("AAPL"));
        assert!(state.positions.contains_key("MSFT"));
        assert_eq!(state.consecutive_losses, 0);
        assert!(h.notifier.contains("force-liquidated AAPL"));
    }

    #[tokio::test]
    async fn test_crash_regime_skips_entries() {
        let h = harness(config(&["AAPL"]));
        let (closes, volumes) = oversold_closes();
        h.market.set_closes("AAPL", &closes, &volumes).await;
        // Proxy: steep, volatile slide
        h.market
            .set_closes(
                "SPY",
                &[dec!(100), dec!(97), dec!(99), dec!(94), dec!(96), dec!(90)],
                &[dec!(1)],
            )
            .await;

        let report = h.engine.run_cycle(now()).await.unwrap();
        assert_eq!(report.regime, Some(MarketRegime::Crash));
        assert!(report.trades.is_empty());
    }

    #[tokio::test]
    async fn test_watch_rule_alerts() {
        let mut cfg = config(&["AAPL"]);
        cfg.watch.push(WatchRule {
            symbol: "NVDA".to_string(),
            below: Some(dec!(192)),
            above: None,
            max_abs_change_pct: None,
        });
        let h = harness(cfg);
        h.market
            .set_closes("NVDA", &[dec!(195), dec!(193), dec!(191)], &[dec!(1)])
            .await;

        let report = h.engine.run_cycle(now()).await.unwrap();
        assert_eq!(report.alerts.len(), 1);
        assert!(h.notifier.contains("NVDA below $192.00"));
    }

    struct BrokenStore {
        saves: AtomicU32,
    }

    impl StateStore for BrokenStore {
        fn load_state(&self) -> anyhow::Result<Option<PortfolioState>> {
            Ok(None)
        }
        fn save_state(&self, _state: &PortfolioState) -> anyhow::Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("disk full")
        }
        fn record_trade(&self, _trade: &crate::portfolio::TradeRecord) -> anyhow::Result<()> {
            panic!("trade log written for an uncommitted cycle")
        }
        fn realized_exit_returns(&self) -> anyhow::Result<Vec<Decimal>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_commit_failure_is_retried_and_surfaced() {
        let market = Arc::new(MockMarketData::new());
        let (closes, volumes) = oversold_closes();
        market.set_closes("AAPL", &closes, &volumes).await;
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(BrokenStore {
            saves: AtomicU32::new(0),
        });
        let engine = CycleOrchestrator::new(
            config(&["AAPL"]),
            market,
            notifier.clone(),
            store.clone(),
        )
        .with_commit_backoff(Duration::ZERO);

        let err = engine.run_cycle(now()).await.unwrap_err();

        assert!(matches!(err, EngineError::StateCommit { attempts: 3, .. }));
        assert_eq!(store.saves.load(Ordering::SeqCst), 3);
        assert!(notifier.contains("State commit failed"));
        assert!(!notifier.contains("BUY AAPL"));
    }

    #[tokio::test]
    async fn test_kelly_stats_refresh_from_trade_log() {
        let mut cfg = config(&["AAPL"]);
        cfg.risk.update_stats_from_trades = true;
        let h = harness(cfg);
        for pnl in [dec!(30), dec!(30), dec!(30), dec!(30), dec!(30), dec!(30)] {
            h.store
                .record_trade(&crate::portfolio::TradeRecord {
                    timestamp: now(),
                    symbol: "MSFT".to_string(),
                    action: TradeAction::TrailingStop,
                    price: dec!(103),
                    shares: dec!(10),
                    pnl,
                })
                .unwrap();
        }
        for _ in 0..4 {
            h.store
                .record_trade(&crate::portfolio::TradeRecord {
                    timestamp: now(),
                    symbol: "MSFT".to_string(),
                    action: TradeAction::HardStopLoss,
                    price: dec!(98),
                    shares: dec!(10),
                    pnl: dec!(-20),
                })
                .unwrap();
        }

        h.engine.run_cycle(now()).await.unwrap();

        let state = saved(&h);
        assert_eq!(state.historical_win_rate, dec!(0.6));
        assert_eq!(state.historical_avg_win, dec!(0.03));
        assert_eq!(state.historical_avg_loss, dec!(0.02));
    }

    #[tokio::test]
    async fn test_heartbeat_reports_equity() {
        let h = harness(config(&["AAPL"]));
        seed(&h, |s| hold(s, "AAPL", dec!(100), dec!(10)));
        h.market
            .set_closes("AAPL", &alternating(dec!(101), dec!(102), 20), &[dec!(1000)])
            .await;

        h.engine.heartbeat(now()).await;

        // 99000 cash + 10 * 102
        assert!(h.notifier.contains("equity $100020.00"));
        assert!(h.notifier.contains("ACTIVE"));
    }
}
