//! Home Assistant notifier for scheduled reminders.
//!
//! Endpoint: POST /api/services/notify/mobile_app_<device>
//! Auth: Bearer token

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Notification, Notifier};
use crate::domain::OwnerId;

/// Configuration for the Home Assistant notifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeAssistantConfig {
    pub url: String,
    pub token: String,
    pub device: String,
}

/// Payload for the notify service
#[derive(Debug, Serialize)]
struct NotifyPayload<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<ClickData<'a>>,
}

/// Tap target; iOS reads `url`, Android reads `clickAction`
#[derive(Debug, Serialize)]
struct ClickData<'a> {
    url: &'a str,
    #[serde(rename = "clickAction")]
    click_action: &'a str,
}

/// Home Assistant mobile-app notifier
pub struct HomeAssistantNotifier {
    base_url: String,
    token: String,
    device: String,
    client: reqwest::Client,
}

impl HomeAssistantNotifier {
    pub fn new(config: HomeAssistantConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token,
            device: config.device,
            client: reqwest::Client::new(),
        }
    }

    fn service_url(&self) -> String {
        format!(
            "{}/api/services/notify/mobile_app_{}",
            self.base_url, self.device
        )
    }
}

#[async_trait]
impl Notifier for HomeAssistantNotifier {
    fn name(&self) -> &str {
        "homeassistant"
    }

    async fn notify(&self, owner: OwnerId, notification: &Notification) -> Result<()> {
        let payload = NotifyPayload {
            message: &notification.message,
            title: Some(notification.title.as_str()),
            data: notification.url.as_deref().map(|url| ClickData {
                url,
                click_action: url,
            }),
        };

        let response = self
            .client
            .post(self.service_url())
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .context("Failed to connect to Home Assistant")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Home Assistant API error: {}", status);
        }

        info!(owner, device = %self.device, "Sent notification");
        Ok(())
    }
}

/// Fallback used when no push channel is configured
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, owner: OwnerId, notification: &Notification) -> Result<()> {
        warn!(
            owner,
            title = %notification.title,
            message = %notification.message,
            "No notifier configured; reminder only logged"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_url() {
        let notifier = HomeAssistantNotifier::new(HomeAssistantConfig {
            url: "http://ha.local:8123/".to_string(),
            token: "t".to_string(),
            device: "pixel_7".to_string(),
        });
        assert_eq!(
            notifier.service_url(),
            "http://ha.local:8123/api/services/notify/mobile_app_pixel_7"
        );
    }

    #[test]
    fn test_payload_shape() {
        let payload = NotifyPayload {
            message: "Buy milk",
            title: Some("Scribe: Todo"),
            data: Some(ClickData {
                url: "http://x/web/notes/1",
                click_action: "http://x/web/notes/1",
            }),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["data"]["clickAction"], "http://x/web/notes/1");
        assert_eq!(value["title"], "Scribe: Todo");
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        let notification = Notification {
            title: "t".to_string(),
            message: "m".to_string(),
            url: None,
        };
        assert!(LogNotifier.notify(1, &notification).await.is_ok());
    }
}
