//! Fleetwatch domain core.
//!
//! Pure, synchronous building blocks of the health engine:
//!
//! - [`profile`] and [`strategy`]: per-source field templates and decision
//!   rules.
//! - [`signal`], [`battery`], [`update`], [`reachability`]: the resolvers.
//! - [`record`]: canonical device and instance records.
//! - [`instance`]: instance health derivation and the confirmation debounce.
//! - [`projection`]: lists and counters derived from a [`FleetSnapshot`].
//! - [`config`] and [`blacklist`]: engine settings.

pub mod battery;
pub mod blacklist;
pub mod config;
pub mod cron;
pub mod error;
pub mod i18n;
pub mod instance;
pub mod profile;
pub mod projection;
pub mod reachability;
pub mod record;
pub mod signal;
pub mod strategy;
pub mod types;
pub mod update;

pub use error::CoreError;
pub use projection::FleetSnapshot;
pub use record::{DeviceRecord, InstanceRecord};
pub use types::{FieldState, FieldValue, Timestamp};
