//! Timers driving the engine.
//!
//! The cycle and heartbeat tick independently; operator commands arrive on a
//! channel. Every operation takes the engine lock for its whole
//! load-mutate-commit span, so a liquidate-all never interleaves with a cycle.

use super::command::{CommandAuthorizer, CommandRequest};
use super::cycle::CycleOrchestrator;
use crate::config::EngineConfig;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Engine shared between the scheduler and command sources.
pub type SharedEngine = Arc<Mutex<CycleOrchestrator>>;

/// Counters for one scheduler run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub heartbeats: u64,
    pub commands: u64,
}

pub struct Scheduler {
    engine: SharedEngine,
    authorizer: CommandAuthorizer,
    cycle_every: Duration,
    heartbeat_every: Option<Duration>,
}

fn every(period: Duration) -> Interval {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl Scheduler {
    pub fn new(engine: SharedEngine, authorizer: CommandAuthorizer, config: &EngineConfig) -> Self {
        Self {
            engine,
            authorizer,
            cycle_every: Duration::from_secs(config.cycle_interval_secs.max(1)),
            heartbeat_every: (config.heartbeat_interval_secs > 0)
                .then(|| Duration::from_secs(config.heartbeat_interval_secs)),
        }
    }

    /// Override timer periods. `None` disables the heartbeat.
    pub fn with_periods(mut self, cycle: Duration, heartbeat: Option<Duration>) -> Self {
        self.cycle_every = cycle;
        self.heartbeat_every = heartbeat;
        self
    }

    /// Run until `shutdown` resolves. The first cycle starts immediately.
    pub async fn run(
        self,
        mut commands: mpsc::Receiver<CommandRequest>,
        shutdown: impl Future<Output = ()>,
    ) -> SchedulerStats {
        let mut stats = SchedulerStats::default();
        let mut cycle_timer = every(self.cycle_every);
        let mut heartbeat_timer = self.heartbeat_every.map(|period| {
            let mut timer = every(period);
            timer.reset();
            timer
        });
        tokio::pin!(shutdown);

        info!(
            cycle_secs = self.cycle_every.as_secs(),
            heartbeat_secs = self.heartbeat_every.map(|d| d.as_secs()).unwrap_or(0),
            "🚀 Scheduler started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("🛑 Shutdown signal received");
                    break;
                }
                _ = cycle_timer.tick() => {
                    let engine = self.engine.lock().await;
                    match engine.run_cycle(Utc::now()).await {
                        Ok(_) => stats.cycles += 1,
                        Err(e) => {
                            stats.failed_cycles += 1;
                            error!(error = %e, "❌ Cycle failed");
                        }
                    }
                }
                _ = tick(&mut heartbeat_timer) => {
                    let engine = self.engine.lock().await;
                    engine.heartbeat(Utc::now()).await;
                    stats.heartbeats += 1;
                }
                Some(request) = commands.recv() => {
                    let engine = self.engine.lock().await;
                    match engine.handle_command(&self.authorizer, &request, Utc::now()).await {
                        Ok(Some(_)) => stats.commands += 1,
                        Ok(None) => {}
                        Err(e) => warn!(caller = %request.caller, error = %e, "Command failed"),
                    }
                }
            }
        }

        info!(
            cycles = stats.cycles,
            failed = stats.failed_cycles,
            heartbeats = stats.heartbeats,
            commands = stats.commands,
            "👋 Scheduler stopped"
        );
        stats
    }
}
