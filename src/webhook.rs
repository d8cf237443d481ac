//! Operator webhook notifier.
//!
//! Mirrors retriable failures, capacity warnings and fatal errors into a
//! Discord-style webhook. Purely observational: disabling it changes
//! nothing else.

use serde_json::json;
use tracing::debug;

/// Posts operator notifications to a webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
    server_name: String,
    enabled: bool,
}

impl WebhookNotifier {
    /// Creates a notifier. With `enabled` false or no URL configured every
    /// call is a no-op.
    pub fn new(url: Option<String>, server_name: impl Into<String>, enabled: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            server_name: server_name.into(),
            enabled,
        }
    }

    async fn post(&self, content: String) {
        let Some(url) = &self.url else { return };
        if !self.enabled {
            return;
        }

        let result = self.client.post(url).json(&json!({"content": content})).send().await;

        // Failures to notify are never allowed to affect the relay.
        if let Err(err) = result {
            debug!(%err, "failed to deliver webhook notification");
        }
    }

    /// Sends an informational message.
    pub async fn notify(&self, message: &str) {
        self.post(format!("[{}] {}", self.server_name, message)).await;
    }

    /// Sends a warning.
    pub async fn notify_warning(&self, message: &str) {
        self.post(format!("[{}] warning: {}", self.server_name, message)).await;
    }

    /// Sends an error.
    pub async fn notify_error(&self, message: &str) {
        self.post(format!("[{}] error: {}", self.server_name, message)).await;
    }
}
