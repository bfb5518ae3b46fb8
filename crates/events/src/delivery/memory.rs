use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ChannelError, NotificationChannel};
use crate::bus::HealthEvent;

/// Collects delivered messages in memory.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    messages: Mutex<Vec<String>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl NotificationChannel for MemoryChannel {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, message: &str, _event: Option<&HealthEvent>) -> Result<(), ChannelError> {
        self.messages.lock().await.push(message.to_string());
        Ok(())
    }
}
