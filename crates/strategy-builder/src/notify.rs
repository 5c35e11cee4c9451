//! Chat notifications on terminal transitions.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a one-line message. Never fails the caller.
    async fn notify(&self, message: &str);
}

/// Slack-compatible incoming webhook. Without a URL it only logs.
pub struct SlackNotifier {
    webhook: Option<String>,
    http: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook: Option<String>) -> Self {
        Self {
            webhook: webhook.filter(|w| !w.is_empty()),
            http: reqwest::Client::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.webhook.is_some()
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, message: &str) {
        let Some(url) = &self.webhook else {
            info!(message, "Notification (no webhook configured)");
            return;
        };
        let result = self
            .http
            .post(url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(&json!({ "text": message }))
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => info!(message, "Sent chat notification"),
            Err(e) => warn!("Chat notification failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_notifier_only_logs() {
        let notifier = SlackNotifier::new(Some(String::new()));
        assert!(!notifier.is_configured());
        notifier.notify("build finished").await;
    }

    #[tokio::test]
    async fn unreachable_webhook_is_not_fatal() {
        let notifier = SlackNotifier::new(Some("http://127.0.0.1:9/hook".into()));
        assert!(notifier.is_configured());
        notifier.notify("build finished").await;
    }
}
