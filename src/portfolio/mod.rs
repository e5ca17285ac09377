//! Portfolio state and trade records.
//!
//! - `PortfolioState`: cash, open positions, loss streak and cooldown
//! - `PositionRecord`: per-instrument entry, size and high-water price
//! - `TradeRecord`: append-only log entry per state transition

mod state;
mod trade;

pub use state::{PortfolioState, PositionPhase, PositionRecord};
pub use trade::{TradeAction, TradeRecord};
