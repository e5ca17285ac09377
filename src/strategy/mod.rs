//! Trading strategy implementation.
//!
//! Contains the decision logic for:
//! - Position lifecycle rules (partial exit, trailing exit, hard stop)
//! - Entry qualification, ranking and sizing
//! - Price watch alerts

mod lifecycle;
mod scanner;
mod watch;

pub use lifecycle::PositionManager;
pub use scanner::{EntryCandidate, OpportunityScanner};
pub use watch::{check_rule, AlertKind, PriceAlert};
