// SPDX-License-Identifier: MIT
//! Notification sink port. Strictly best-effort: a dead webhook must never
//! stall a tick, so every failure is logged at `warn` and dropped.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification. `kind` is a stable machine-readable tag
    /// (`circuit_open`, `patrol_cleanup`, `task_failed`, …).
    async fn notify(&self, kind: &str, message: &str);
}

/// Discards everything. Default when no webhook is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, kind: &str, message: &str) {
        debug!(kind, message, "notification dropped (no sink configured)");
    }
}

/// POSTs `{kind, message, at}` to a configured webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, kind: &str, message: &str) {
        let body = json!({
            "kind": kind,
            "message": message,
            "at": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.client.post(&self.url).json(&body).send().await {
            warn!(kind, err = %e, "notification webhook failed");
        }
    }
}
