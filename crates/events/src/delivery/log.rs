use async_trait::async_trait;

use super::{ChannelError, NotificationChannel};
use crate::bus::HealthEvent;

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &str, event: Option<&HealthEvent>) -> Result<(), ChannelError> {
        match event {
            Some(event) => tracing::info!(
                kind = ?event.kind,
                identity = %event.identity,
                message,
                "Notification"
            ),
            None => tracing::info!(message, "Overview notification"),
        }
        Ok(())
    }
}
