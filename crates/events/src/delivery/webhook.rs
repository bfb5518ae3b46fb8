//! Webhook delivery.
//!
//! [`WebhookChannel`] POSTs a JSON body with the rendered message (and the
//! originating event, when there is one) to a configured URL. One attempt per
//! message.

use std::time::Duration;

use async_trait::async_trait;

use super::{ChannelError, NotificationChannel};
use crate::bus::HealthEvent;

/// HTTP request timeout for a delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Request body sent to the endpoint.
pub fn webhook_body(message: &str, event: Option<&HealthEvent>) -> serde_json::Value {
    match event {
        Some(event) => serde_json::json!({
            "message": message,
            "category": event.category,
            "kind": event.kind,
            "identity": event.identity,
            "payload": event.payload,
            "timestamp": event.timestamp,
        }),
        None => serde_json::json!({ "message": message }),
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, message: &str, event: Option<&HealthEvent>) -> Result<(), ChannelError> {
        let response = self
            .client
            .post(&self.url)
            .json(&webhook_body(message, event))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChannelError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}
