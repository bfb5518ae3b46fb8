//! Notification router.
//!
//! Consumes [`HealthEvent`]s from the bus, renders them in the configured
//! language, records the text as `lastNotification` and fans it out to every
//! channel.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::HealthEvent;
use crate::delivery::NotificationChannel;
use crate::message::{render_event, MessageStyle};
use crate::sink::{StateSink, LAST_NOTIFICATION_KEY};

pub struct NotificationRouter {
    style: MessageStyle,
    channels: Vec<Arc<dyn NotificationChannel>>,
    sink: Arc<dyn StateSink>,
}

impl NotificationRouter {
    pub fn new(
        style: MessageStyle,
        channels: Vec<Arc<dyn NotificationChannel>>,
        sink: Arc<dyn StateSink>,
    ) -> Self {
        Self {
            style,
            channels,
            sink,
        }
    }

    pub fn style(&self) -> MessageStyle {
        self.style
    }

    /// Render and deliver one event.
    pub async fn dispatch(&self, event: &HealthEvent) {
        let message = render_event(event, self.style);
        self.deliver(&message, Some(event)).await;
    }

    /// Record `message` and hand it to every channel. Channel failures are
    /// logged; the remaining channels still get the message.
    pub async fn deliver(&self, message: &str, event: Option<&HealthEvent>) {
        tracing::info!(message, "Sending notification");
        self.sink
            .write_if_changed(LAST_NOTIFICATION_KEY, serde_json::Value::from(message))
            .await;

        for channel in &self.channels {
            if let Err(e) = channel.send(message, event).await {
                tracing::error!(channel = channel.name(), error = %e, "Notification delivery failed");
            }
        }
    }

    /// Run until `cancel` fires or the bus closes.
    pub async fn run(&self, mut rx: broadcast::Receiver<HealthEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Notification router cancelled");
                    break;
                }
                received = rx.recv() => match received {
                    Ok(event) => self.dispatch(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Notification router lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event bus closed, stopping notification router");
                        break;
                    }
                },
            }
        }
    }
}
