//! Privileged operator commands.
//!
//! Only `LiquidateAll` exists today. Callers are checked against the
//! configured identifier list and, when a command secret is set, must sign
//! `"{caller}:{command}"` with HMAC-SHA256.

use super::cycle::CycleOrchestrator;
use crate::config::OperatorConfig;
use crate::error::EngineError;
use crate::notify::notify_best_effort;
use crate::portfolio::{TradeAction, TradeRecord};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Close every open position at the latest price
    LiquidateAll,
}

impl OperatorCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorCommand::LiquidateAll => "liquidate",
        }
    }
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatorCommand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "liquidate" | "liquidate_all" | "liquidate-all" => Ok(OperatorCommand::LiquidateAll),
            other => anyhow::bail!("unknown operator command: {}", other),
        }
    }
}

/// A command as received from an operator channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub caller: String,
    pub command: OperatorCommand,
    /// Hex HMAC-SHA256 over [`CommandRequest::signing_payload`]
    pub signature: Option<String>,
}

impl CommandRequest {
    pub fn new(caller: impl Into<String>, command: OperatorCommand) -> Self {
        Self {
            caller: caller.into(),
            command,
            signature: None,
        }
    }

    pub fn signed(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn signing_payload(&self) -> String {
        format!("{}:{}", self.caller, self.command)
    }

    /// Parse `"<command> <caller> [signature]"`.
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let mut parts = line.split_whitespace();
        let command: OperatorCommand = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty command"))?
            .parse()?;
        let caller = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing caller id"))?;

        let mut request = Self::new(caller, command);
        if let Some(signature) = parts.next() {
            request = request.signed(signature);
        }
        Ok(request)
    }
}

/// Checks caller identity (and signature, when configured).
#[derive(Debug, Clone)]
pub struct CommandAuthorizer {
    authorized_ids: Vec<String>,
    secret: Option<String>,
}

impl CommandAuthorizer {
    pub fn new(config: &OperatorConfig) -> Self {
        Self {
            authorized_ids: config.authorized_ids.clone(),
            secret: config.command_secret.clone().filter(|s| !s.is_empty()),
        }
    }

    /// Hex HMAC-SHA256 of `payload` under `secret`.
    pub fn sign(secret: &str, payload: &str) -> anyhow::Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid command secret: {}", e))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn authorize(&self, request: &CommandRequest) -> Result<(), EngineError> {
        let unauthorized = || EngineError::Unauthorized {
            caller: request.caller.clone(),
        };

        if !self.authorized_ids.iter().any(|id| id == &request.caller) {
            return Err(unauthorized());
        }

        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let Some(signature) = &request.signature else {
            return Err(unauthorized());
        };
        let Ok(expected) = hex::decode(signature) else {
            return Err(unauthorized());
        };

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| unauthorized())?;
        mac.update(request.signing_payload().as_bytes());
        mac.verify_slice(&expected).map_err(|_| unauthorized())
    }
}

impl CycleOrchestrator {
    /// Close every open position at the latest available price.
    ///
    /// Positions whose price cannot be fetched stay open and are reported in
    /// the notification. The losing streak is reset: an operator flattening
    /// the book is not a strategy loss.
    ///
    /// Runs under the state lease, so it waits for an in-flight cycle (in this
    /// process or another) to commit and then acts on the committed state.
    pub async fn liquidate_all(&self, now: DateTime<Utc>) -> Result<Vec<TradeRecord>, EngineError> {
        let _lease = self.lease().await?;
        let mut state = self.load_state()?;
        let held = state.open_symbols();
        if held.is_empty() {
            info!("[COMMAND] Liquidate-all: no open positions");
            notify_best_effort(self.notifier.as_ref(), "Liquidate-all: no open positions").await;
            return Ok(Vec::new());
        }

        let snapshots = self.fetch_many(&held).await;
        let mut trades = Vec::new();
        let mut stranded = Vec::new();

        for symbol in &held {
            let price = snapshots
                .get(symbol)
                .and_then(|s| s.as_ref().ok())
                .and_then(|s| s.last_close());
            let closed = price.and_then(|price| {
                state.close_position(symbol, price, TradeAction::ManualLiquidate, now)
            });
            match closed {
                Some(trade) => trades.push(trade),
                None => {
                    warn!(symbol = %symbol, "No price available, position left open");
                    stranded.push(symbol.clone());
                }
            }
        }
        state.consecutive_losses = 0;

        self.commit(&state).await?;

        let realized: rust_decimal::Decimal = trades.iter().map(|t| t.pnl).sum();
        for trade in &trades {
            trade.emit();
            if let Err(e) = self.store.record_trade(trade) {
                warn!(symbol = %trade.symbol, error = %e, "Failed to append trade log");
            }
        }

        let mut message = format!(
            "🛑 Liquidate-all: closed {} position(s), realized PnL ${:.2}, cash ${:.2}",
            trades.len(),
            realized,
            state.cash
        );
        if !stranded.is_empty() {
            message.push_str(&format!(" | still open (no price): {}", stranded.join(", ")));
        }
        info!("[COMMAND] {}", message);
        notify_best_effort(self.notifier.as_ref(), &message).await;

        Ok(trades)
    }

    /// Authorize and run a command. Unauthorized callers are ignored.
    pub async fn handle_command(
        &self,
        authorizer: &CommandAuthorizer,
        request: &CommandRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<TradeRecord>>, EngineError> {
        if let Err(e) = authorizer.authorize(request) {
            debug!(caller = %request.caller, command = %request.command, error = %e, "Ignoring command");
            return Ok(None);
        }

        info!(caller = %request.caller, command = %request.command, "[COMMAND] Accepted");
        match request.command {
            OperatorCommand::LiquidateAll => self.liquidate_all(now).await.map(Some),
        }
    }
}
