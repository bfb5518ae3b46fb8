//! Outbound notification channels.
//!
//! The router hands every rendered message to each configured
//! [`NotificationChannel`]. Delivery is a single attempt; failures are logged
//! by the caller and never retried.

use async_trait::async_trait;

use crate::bus::HealthEvent;

pub mod log;
pub mod memory;
pub mod webhook;

pub use log::LogChannel;
pub use memory::MemoryChannel;
pub use webhook::WebhookChannel;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server returned a non-2xx status code.
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Deliver one message. `event` is `None` for overview messages.
    async fn send(&self, message: &str, event: Option<&HealthEvent>) -> Result<(), ChannelError>;
}
