//! SQLite persistence for portfolio state and the trade log.
//!
//! Persists trading state to survive restarts:
//! - Cash, loss streak, cooldown and seeded Kelly statistics (singleton row)
//! - Open positions
//! - Append-only trade log
//!
//! Every load-mutate-save of the portfolio runs under [`StateLease`], an
//! exclusive write transaction on the database. A second process (or a
//! second connection) opening a lease waits until the first one commits.

use crate::portfolio::{PortfolioState, PositionRecord, TradeAction, TradeRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Durable storage for the portfolio aggregate and trade log.
///
/// Absence of a stored state means "start fresh".
pub trait StateStore: Send + Sync {
    fn load_state(&self) -> Result<Option<PortfolioState>>;
    fn save_state(&self, state: &PortfolioState) -> Result<()>;
    fn record_trade(&self, trade: &TradeRecord) -> Result<()>;
    /// Return fractions of strategy full exits, oldest first.
    fn realized_exit_returns(&self) -> Result<Vec<Decimal>>;

    /// Take the exclusive write lock on the aggregate, waiting for any
    /// other holder.
    fn lock_exclusive(&self) -> Result<()> {
        Ok(())
    }

    /// End the span opened by `lock_exclusive`, committing or rolling back.
    /// No-op when no lock is held.
    fn release_exclusive(&self, _commit: bool) -> Result<()> {
        Ok(())
    }
}

/// Exclusive hold on the persisted portfolio from load through commit.
///
/// Dropping the lease rolls back anything not yet committed through
/// [`StateStore::release_exclusive`].
pub struct StateLease {
    store: Arc<dyn StateStore>,
}

impl StateLease {
    /// Wait for the state lock without blocking the async runtime.
    pub async fn acquire(store: Arc<dyn StateStore>) -> Result<Self> {
        let locking = store.clone();
        tokio::task::spawn_blocking(move || locking.lock_exclusive())
            .await
            .context("State lock task panicked")??;
        debug!("State lease acquired");
        Ok(Self { store })
    }
}

impl Drop for StateLease {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_exclusive(false) {
            warn!(error = %e, "Failed to release state lease");
        }
    }
}

/// SQLite-based persistence manager.
///
/// The connection sits behind a mutex so the manager can be shared with the
/// async engine.
pub struct PersistenceManager {
    conn: Mutex<Connection>,
}

fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<TradeRecord> {
    let action: String = row.get(2)?;
    Ok(TradeRecord {
        timestamp: timestamp_at(row, 0)?,
        symbol: row.get(1)?,
        action: TradeAction::from_str(&action).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
        })?,
        price: decimal_at(row, 3)?,
        shares: decimal_at(row, 4)?,
        pnl: decimal_at(row, 5)?,
    })
}

impl PersistenceManager {
    /// Open (or create) the database, initializing the schema if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        // WAL keeps status readers from blocking a committing writer
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.busy_timeout(DEFAULT_LOCK_TIMEOUT)?;
        debug!(journal = %journal, "Database opened");

        let manager = Self {
            conn: Mutex::new(conn),
        };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", path);
        Ok(manager)
    }

    /// Override how long a writer waits on another holder of the state lock.
    pub fn with_lock_timeout(self, timeout: Duration) -> Result<Self> {
        self.conn()?.busy_timeout(timeout)?;
        Ok(self)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            -- Portfolio aggregate (singleton row)
            CREATE TABLE IF NOT EXISTS portfolio_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                cash TEXT NOT NULL,
                consecutive_losses INTEGER NOT NULL,
                cooldown_until TEXT,
                historical_win_rate TEXT NOT NULL,
                historical_avg_win TEXT NOT NULL,
                historical_avg_loss TEXT NOT NULL,
                last_saved TEXT NOT NULL
            );

            -- Open positions
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                entry_price TEXT NOT NULL,
                shares TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                high_water_price TEXT NOT NULL,
                partially_closed INTEGER NOT NULL DEFAULT 0
            );

            -- Trade log (append-only)
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                price TEXT NOT NULL,
                shares TEXT NOT NULL,
                pnl TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp);
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Latest trades, newest first.
    pub fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT timestamp, symbol, action, price, shares, pnl
            FROM trades
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let trades = stmt
            .query_map([limit as i64], trade_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read trade log")?;
        Ok(trades)
    }

    /// Realized P&L summed per action kind.
    pub fn pnl_by_action(&self) -> Result<HashMap<TradeAction, Decimal>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT timestamp, symbol, action, price, shares, pnl FROM trades")?;

        let mut totals: HashMap<TradeAction, Decimal> = HashMap::new();
        for trade in stmt.query_map([], trade_from_row)? {
            let trade = trade?;
            if !trade.action.is_entry() {
                *totals.entry(trade.action).or_default() += trade.pnl;
            }
        }
        Ok(totals)
    }

    /// Check if we have any saved state.
    pub fn has_state(&self) -> Result<bool> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM portfolio_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

impl StateStore for PersistenceManager {
    /// Save the complete portfolio atomically. Inside a lease this only
    /// stages the write; the lease commit makes it durable.
    fn save_state(&self, state: &PortfolioState) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.savepoint()?;

        tx.execute(
            r#"
            INSERT INTO portfolio_state (id, cash, consecutive_losses, cooldown_until,
                                         historical_win_rate, historical_avg_win,
                                         historical_avg_loss, last_saved)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                cash = ?1,
                consecutive_losses = ?2,
                cooldown_until = ?3,
                historical_win_rate = ?4,
                historical_avg_win = ?5,
                historical_avg_loss = ?6,
                last_saved = ?7
            "#,
            params![
                state.cash.to_string(),
                state.consecutive_losses,
                state.cooldown_until.map(|t| t.to_rfc3339()),
                state.historical_win_rate.to_string(),
                state.historical_avg_win.to_string(),
                state.historical_avg_loss.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        // Clear and reinsert positions
        tx.execute("DELETE FROM positions", [])?;

        for (symbol, pos) in &state.positions {
            tx.execute(
                r#"
                INSERT INTO positions (symbol, entry_price, shares, entry_time,
                                       high_water_price, partially_closed)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    symbol,
                    pos.entry_price.to_string(),
                    pos.shares.to_string(),
                    pos.entry_time.to_rfc3339(),
                    pos.high_water_price.to_string(),
                    pos.partially_closed,
                ],
            )?;
        }

        tx.commit()?;

        debug!(
            cash = %state.cash,
            positions = state.positions.len(),
            "State saved to database"
        );
        Ok(())
    }

    fn load_state(&self) -> Result<Option<PortfolioState>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT cash, consecutive_losses, cooldown_until, historical_win_rate,
                       historical_avg_win, historical_avg_loss
                FROM portfolio_state WHERE id = 1
                "#,
                [],
                |row| {
                    let cooldown_until = match row.get::<_, Option<String>>(2)? {
                        Some(_) => Some(timestamp_at(row, 2)?),
                        None => None,
                    };
                    Ok(PortfolioState {
                        cash: decimal_at(row, 0)?,
                        positions: HashMap::new(),
                        consecutive_losses: row.get(1)?,
                        cooldown_until,
                        historical_win_rate: decimal_at(row, 3)?,
                        historical_avg_win: decimal_at(row, 4)?,
                        historical_avg_loss: decimal_at(row, 5)?,
                    })
                },
            )
            .optional()
            .context("Failed to read portfolio state")?;

        let Some(mut state) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            r#"
            SELECT symbol, entry_price, shares, entry_time, high_water_price, partially_closed
            FROM positions
            "#,
        )?;

        state.positions = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    PositionRecord {
                        entry_price: decimal_at(row, 1)?,
                        shares: decimal_at(row, 2)?,
                        entry_time: timestamp_at(row, 3)?,
                        high_water_price: decimal_at(row, 4)?,
                        partially_closed: row.get(5)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()
            .context("Failed to read positions")?;

        debug!(
            cash = %state.cash,
            positions = state.positions.len(),
            losses = state.consecutive_losses,
            "Loaded state from database"
        );

        Ok(Some(state))
    }

    fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO trades (timestamp, symbol, action, price, shares, pnl)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                trade.timestamp.to_rfc3339(),
                trade.symbol,
                trade.action.as_str(),
                trade.price.to_string(),
                trade.shares.to_string(),
                trade.pnl.to_string(),
            ],
        )?;
        Ok(())
    }

    fn realized_exit_returns(&self) -> Result<Vec<Decimal>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, symbol, action, price, shares, pnl FROM trades ORDER BY id ASC",
        )?;

        let mut returns = Vec::new();
        for trade in stmt.query_map([], trade_from_row)? {
            let trade = trade?;
            if !trade.action.is_strategy_exit() {
                continue;
            }
            if let Some(r) = trade.return_fraction() {
                returns.push(r);
            }
        }
        Ok(returns)
    }

    fn lock_exclusive(&self) -> Result<()> {
        let conn = self.conn()?;
        if !conn.is_autocommit() {
            warn!("Abandoned state lease found, rolling back");
            conn.execute_batch("ROLLBACK")?;
        }
        conn.execute_batch("BEGIN IMMEDIATE")
            .context("Failed to acquire state lock")
    }

    fn release_exclusive(&self, commit: bool) -> Result<()> {
        let conn = self.conn()?;
        if conn.is_autocommit() {
            return Ok(());
        }
        if commit {
            conn.execute_batch("COMMIT").context("Failed to commit state")
        } else {
            debug!("Rolling back uncommitted state lease");
            conn.execute_batch("ROLLBACK").context("Failed to roll back state")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapitalConfig;
    use rust_decimal_macros::dec;

    fn trade(action: TradeAction, price: Decimal, shares: Decimal, pnl: Decimal) -> TradeRecord {
        TradeRecord {
            timestamp: Utc::now(),
            symbol: "AAPL".to_string(),
            action,
            price,
            shares,
            pnl,
        }
    }

    #[test]
    fn test_absent_state_is_none() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        assert!(manager.load_state().unwrap().is_none());
        assert!(!manager.has_state().unwrap());
    }

    #[test]
    fn test_save_and_load_state() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        let mut state = PortfolioState::new(&CapitalConfig::default());
        let now = Utc::now();
        state.open_position("AAPL", dec!(95), dec!(19000), TradeAction::Buy, now);
        state.partial_sell("AAPL", dec!(98), dec!(0.5), now);
        state.positions.get_mut("AAPL").unwrap().update_high_water(dec!(99.5));
        state.consecutive_losses = 2;
        state.cooldown_until = Some(now);

        manager.save_state(&state).unwrap();
        let loaded = manager.load_state().unwrap().unwrap();

        assert_eq!(loaded.cash, state.cash);
        assert_eq!(loaded.consecutive_losses, 2);
        assert!(loaded.cooldown_until.is_some());
        let pos = &loaded.positions["AAPL"];
        assert_eq!(pos.shares, dec!(100));
        assert_eq!(pos.high_water_price, dec!(99.5));
        assert!(pos.partially_closed);
        assert!(manager.has_state().unwrap());
    }

    #[test]
    fn test_closed_positions_removed_on_save() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        let mut state = PortfolioState::new(&CapitalConfig::default());
        let now = Utc::now();
        state.open_position("AAPL", dec!(100), dec!(1000), TradeAction::Buy, now);
        manager.save_state(&state).unwrap();

        state.close_position("AAPL", dec!(101), TradeAction::TrailingStop, now);
        manager.save_state(&state).unwrap();

        assert!(manager.load_state().unwrap().unwrap().positions.is_empty());
    }

    #[test]
    fn test_trade_log() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        manager.record_trade(&trade(TradeAction::Buy, dec!(100), dec!(10), Decimal::ZERO)).unwrap();
        manager.record_trade(&trade(TradeAction::TrailingStop, dec!(106.5), dec!(10), dec!(65))).unwrap();
        manager.record_trade(&trade(TradeAction::HardStopLoss, dec!(98.4), dec!(10), dec!(-16))).unwrap();

        let recent = manager.recent_trades(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, TradeAction::HardStopLoss);

        let returns = manager.realized_exit_returns().unwrap();
        assert_eq!(returns, vec![dec!(0.065), dec!(-0.016)]);

        let totals = manager.pnl_by_action().unwrap();
        assert_eq!(totals[&TradeAction::TrailingStop], dec!(65));
        assert_eq!(totals[&TradeAction::HardStopLoss], dec!(-16));
        assert!(!totals.contains_key(&TradeAction::Buy));
    }

    #[test]
    fn test_kelly_samples_are_strategy_full_exits_only() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        manager.record_trade(&trade(TradeAction::Buy, dec!(100), dec!(10), Decimal::ZERO)).unwrap();
        // half the round trip at 102, the rest trails out at 104
        manager.record_trade(&trade(TradeAction::PartialSell, dec!(102), dec!(5), dec!(10))).unwrap();
        manager.record_trade(&trade(TradeAction::TrailingStop, dec!(104), dec!(5), dec!(20))).unwrap();
        manager.record_trade(&trade(TradeAction::ForcedLiquidation, dec!(97), dec!(10), dec!(-30))).unwrap();
        manager.record_trade(&trade(TradeAction::ManualLiquidate, dec!(90), dec!(10), dec!(-100))).unwrap();

        let returns = manager.realized_exit_returns().unwrap();
        assert_eq!(returns, vec![dec!(0.04), dec!(-0.03)]);
    }

    fn shared_db(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "reversion-trader-{}-{}-{}.db",
            name,
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn remove_db(path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.as_os_str().to_owned();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }

    #[test]
    fn test_lease_excludes_second_connection() {
        let path = shared_db("lease");
        let first = PersistenceManager::new(&path).unwrap();
        let second = PersistenceManager::new(&path)
            .unwrap()
            .with_lock_timeout(Duration::from_millis(50))
            .unwrap();

        let mut state = PortfolioState::new(&CapitalConfig::default());
        first.lock_exclusive().unwrap();
        state.cash = dec!(42);
        first.save_state(&state).unwrap();

        assert!(second.lock_exclusive().is_err());
        // staged but uncommitted writes stay invisible to the other connection
        assert!(second.load_state().unwrap().is_none());

        first.release_exclusive(true).unwrap();
        second.lock_exclusive().unwrap();
        assert_eq!(second.load_state().unwrap().unwrap().cash, dec!(42));
        second.release_exclusive(false).unwrap();

        drop(first);
        drop(second);
        remove_db(&path);
    }

    #[test]
    fn test_release_without_commit_discards_writes() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        let mut state = PortfolioState::new(&CapitalConfig::default());
        manager.save_state(&state).unwrap();

        manager.lock_exclusive().unwrap();
        state.cash = dec!(1);
        manager.save_state(&state).unwrap();
        manager.release_exclusive(false).unwrap();

        assert_eq!(manager.load_state().unwrap().unwrap().cash, CapitalConfig::default().initial_cash);
        // releasing with nothing held is harmless
        manager.release_exclusive(true).unwrap();
    }
}
