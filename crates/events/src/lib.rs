//! Fleetwatch events and notification infrastructure.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`HealthEvent`]: the health transition envelope.
//! - [`HealthEventEmitter`]: decides which record changes become events.
//! - [`NotificationRouter`]: renders events and fans them out to
//!   [`delivery`] channels.
//! - [`DigestScheduler`]: weekday/time based overview messages.
//! - [`sink`]: "write if changed" output state.

pub mod bus;
pub mod delivery;
pub mod digest;
pub mod emitter;
pub mod message;
pub mod router;
pub mod sink;

pub use bus::{EventBus, EventCategory, EventKind, HealthEvent};
pub use delivery::{ChannelError, LogChannel, MemoryChannel, NotificationChannel, WebhookChannel};
pub use digest::DigestScheduler;
pub use emitter::HealthEventEmitter;
pub use message::MessageStyle;
pub use router::NotificationRouter;
pub use sink::{LogSink, MemorySink, StateSink};
