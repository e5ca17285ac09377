//! # Reversion Trader
//!
//! A mean-reversion decision and state engine for a fixed equity basket,
//! paper-trading against a persisted portfolio.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `market`: Bar retrieval (Yahoo chart API + in-memory mock)
//! - `signal`: Z-score, ATR, volume and OBV indicators, market regime
//! - `strategy`: Entry, partial/trailing/stop exits, entry ranking, price watch
//! - `risk`: Half-Kelly sizing, VaR, circuit breaker, liquidation targeting
//! - `portfolio`: Portfolio aggregate and trade records
//! - `engine`: Cycle orchestration, operator commands, scheduling
//! - `persistence`: SQLite state store and trade log
//! - `notify`: Operator notifications
//! - `assistant`: Read-only portfolio context for an operator assistant
//! - `utils`: Shared decimal arithmetic

pub mod assistant;
pub mod config;
pub mod engine;
pub mod error;
pub mod market;
pub mod notify;
pub mod persistence;
pub mod portfolio;
pub mod risk;
pub mod signal;
pub mod strategy;
pub mod utils;

pub use config::Config;
