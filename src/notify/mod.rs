//! Outbound operator notifications.
//!
//! Delivery is fire-and-forget from the engine's point of view: failures are
//! logged and never abort a cycle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Delivers plain-text messages to an operator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// Send and log (but swallow) any delivery failure.
pub async fn notify_best_effort(notifier: &dyn Notifier, message: &str) {
    if let Err(e) = notifier.notify(message).await {
        warn!(error = %e, "Notification delivery failed");
    }
}

/// Posts `{"text": message}` to a webhook (Slack/Discord-style).
pub struct WebhookNotifier {
    http: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip(self, message))]
    async fn notify(&self, message: &str) -> Result<()> {
        self.http
            .post(&self.url)
            .json(&json!({ "text": message }))
            .send()
            .await
            .context("Failed to send webhook notification")?
            .error_for_status()
            .context("Webhook rejected notification")?;
        Ok(())
    }
}

/// Writes notifications to the operational log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        info!(target: "notify", "{}", message);
        Ok(())
    }
}

/// Keeps every message in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
        Ok(())
    }
}
