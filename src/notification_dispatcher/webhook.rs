//! Generic JSON webhook sink

use super::AlertSink;
use crate::error::{Error, Result};
use crate::models::EventTransition;
use async_trait::async_trait;

/// POSTs each transition as JSON
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    name: String,
}

impl WebhookSink {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        let name = format!("webhook:{}", url);
        Self { client, url, name }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, transition: &EventTransition) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(transition)
            .send()
            .await
            .map_err(|e| Error::NotificationDeliveryFailure {
                sink: self.name.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::NotificationDeliveryFailure {
                sink: self.name.clone(),
                message: format!("HTTP {}", status),
            });
        }

        tracing::debug!(
            sink = %self.name,
            event_id = %transition.event.id,
            kind = transition.kind.as_str(),
            "Webhook delivered"
        );
        Ok(())
    }
}
