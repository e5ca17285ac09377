//! Cycle orchestration, operator commands and scheduling.

mod command;
mod cycle;
mod report;
mod scheduler;

pub use command::{CommandAuthorizer, CommandRequest, OperatorCommand};
pub use cycle::{CycleOrchestrator, Valuation};
pub use report::{CycleReport, CycleStatus, InstrumentOutcome};
pub use scheduler::{Scheduler, SchedulerStats, SharedEngine};
