//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`HealthEvent`]s. It is
//! shared via `Arc<EventBus>` between the engine and the notification router.

use chrono::Utc;
use fleetwatch_core::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// HealthEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Device,
    Instance,
    AdapterUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LowBattery,
    Online,
    Offline,
    UpdateAvailable,
    InstanceError,
    InstanceDeactivated,
}

/// A health transition worth surfacing.
///
/// Constructed via [`HealthEvent::new`] and enriched with
/// [`with_payload`](HealthEvent::with_payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub category: EventCategory,
    pub kind: EventKind,

    /// Device main path, instance id, or `adapterUpdates`.
    pub identity: String,

    /// Event-specific data used to render messages.
    pub payload: serde_json::Value,

    pub timestamp: Timestamp,
}

impl HealthEvent {
    pub fn new(category: EventCategory, kind: EventKind, identity: impl Into<String>) -> Self {
        Self {
            category,
            kind,
            identity: identity.into(),
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// String field of the payload, empty when missing.
    pub fn payload_str(&self, key: &str) -> &str {
        self.payload.get(key).and_then(|v| v.as_str()).unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// # Usage
///
/// ```rust
/// use fleetwatch_events::bus::{EventBus, EventCategory, EventKind, HealthEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(HealthEvent::new(EventCategory::Device, EventKind::Offline, "hue.0.lamp.reachable"));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<HealthEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: HealthEvent) {
        tracing::debug!(
            category = ?event.category,
            kind = ?event.kind,
            identity = %event.identity,
            "Publishing health event"
        );
        // Zero receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let event = HealthEvent::new(EventCategory::Device, EventKind::LowBattery, "zigbee.0.a.battery")
            .with_payload(serde_json::json!({"device": "Door"}));
        bus.publish(event);

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.kind, EventKind::LowBattery);
        assert_eq!(received.identity, "zigbee.0.a.battery");
        assert_eq!(received.payload_str("device"), "Door");
        assert_eq!(received.payload_str("missing"), "");
    }

    #[tokio::test]
    async fn every_subscriber_sees_an_instance_error() {
        let bus = EventBus::default();
        let mut router = bus.subscribe();
        let mut audit = bus.subscribe();

        bus.publish(HealthEvent::new(EventCategory::Instance, EventKind::InstanceError, "hue.0"));

        assert_eq!(router.recv().await.unwrap().identity, "hue.0");
        assert_eq!(audit.recv().await.unwrap().kind, EventKind::InstanceError);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for path in ["a.0.x.link_quality", "a.0.y.link_quality", "a.0.z.link_quality"] {
            bus.publish(HealthEvent::new(EventCategory::Device, EventKind::Offline, path));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(rx.recv().await.unwrap().identity, "a.0.y.link_quality");
    }

    #[test]
    fn publishing_without_listeners_is_silent() {
        let bus = EventBus::default();
        bus.publish(HealthEvent::new(EventCategory::Device, EventKind::Online, "orphan"));
    }
}
