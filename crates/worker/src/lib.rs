//! Fleetwatch worker.
//!
//! - [`transport`]: the [`Telemetry`](transport::Telemetry) seam and its
//!   in-memory implementation.
//! - [`aggregator`]: device discovery and incremental updates.
//! - [`instances`]: instance health with confirmation timers.
//! - [`engine`]: the single task owning all records.
//! - [`config`]: environment and file based configuration.

pub mod aggregator;
pub mod config;
pub mod engine;
pub mod instances;
pub mod transport;

pub use engine::Engine;
pub use transport::{MemoryTelemetry, Telemetry, TransportEvent};
