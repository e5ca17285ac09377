//! Losing-streak circuit breaker.
//!
//! ACTIVE -> COOLDOWN once `consecutive_losses` reaches the limit; COOLDOWN ->
//! ACTIVE when the cooldown expires, which also resets the streak. The
//! timestamps live on `PortfolioState` so a restart resumes the same halt.

use crate::config::RiskConfig;
use crate::portfolio::PortfolioState;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

/// Breaker phase at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Active,
    Cooldown { until: DateTime<Utc> },
}

/// Outcome of the start-of-cycle expiry check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    /// Trading allowed
    Active,
    /// Cooldown just expired; streak reset
    Resumed,
    /// Still halted until the given time
    Halted { until: DateTime<Utc> },
}

pub struct CircuitBreaker {
    max_consecutive_losses: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            max_consecutive_losses: config.max_consecutive_losses,
            cooldown: Duration::minutes(config.cooldown_minutes),
        }
    }

    pub fn state(&self, portfolio: &PortfolioState, now: DateTime<Utc>) -> BreakerState {
        match portfolio.cooldown_until {
            Some(until) if now < until => BreakerState::Cooldown { until },
            _ => BreakerState::Active,
        }
    }

    /// Expire a finished cooldown. Mutates `portfolio` only on expiry.
    pub fn check(&self, portfolio: &mut PortfolioState, now: DateTime<Utc>) -> BreakerCheck {
        match portfolio.cooldown_until {
            Some(until) if now < until => BreakerCheck::Halted { until },
            Some(until) => {
                info!(
                    %until,
                    losses = portfolio.consecutive_losses,
                    "Cooldown expired, resuming trading"
                );
                portfolio.cooldown_until = None;
                portfolio.consecutive_losses = 0;
                BreakerCheck::Resumed
            }
            None => BreakerCheck::Active,
        }
    }

    /// Enter cooldown if the losing streak has reached the limit.
    ///
    /// Returns the cooldown end when the breaker trips on this call.
    pub fn trip_if_needed(
        &self,
        portfolio: &mut PortfolioState,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if portfolio.consecutive_losses < self.max_consecutive_losses || portfolio.in_cooldown(now) {
            return None;
        }

        let until = now + self.cooldown;
        portfolio.cooldown_until = Some(until);
        warn!(
            losses = portfolio.consecutive_losses,
            %until,
            "[CIRCUIT BREAKER] Losing streak limit reached, trading halted"
        );
        Some(until)
    }
}
