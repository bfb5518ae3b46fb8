//! Telemetry transport.
//!
//! [`Telemetry`] is everything the engine needs from the outside world:
//! directory listing, field and object reads, subscriptions and a change
//! stream. [`MemoryTelemetry`] keeps the whole tree in memory and backs the
//! tests and the replay binary.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use fleetwatch_core::types::ObjectMeta;
use fleetwatch_core::{FieldState, FieldValue, Timestamp};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    FieldChanged { path: String, state: FieldState },
    ObjectChanged { path: String, meta: ObjectMeta },
    Deleted { path: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Telemetry: Send + Sync {
    /// Paths of existing fields matching a `*` glob.
    async fn list_matching(&self, pattern: &str) -> Result<Vec<String>, TransportError>;

    async fn read_field(&self, path: &str) -> Result<Option<FieldState>, TransportError>;

    async fn read_object(&self, path: &str) -> Result<Option<ObjectMeta>, TransportError>;

    /// Ask for change events on paths matching a `*` glob.
    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError>;

    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Translate a `*` glob into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, TransportError> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).map_err(|e| TransportError::Pattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// MemoryTelemetry
// ---------------------------------------------------------------------------

/// Serialized form of an in-memory tree, used by the replay binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryDump {
    pub fields: BTreeMap<String, FieldState>,
    pub objects: BTreeMap<String, ObjectMeta>,
}

pub struct MemoryTelemetry {
    fields: RwLock<BTreeMap<String, FieldState>>,
    objects: RwLock<BTreeMap<String, ObjectMeta>>,
    subscriptions: RwLock<Vec<Regex>>,
    sender: broadcast::Sender<TransportEvent>,
}

impl Default for MemoryTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            fields: RwLock::new(BTreeMap::new()),
            objects: RwLock::new(BTreeMap::new()),
            subscriptions: RwLock::new(Vec::new()),
            sender,
        }
    }

    pub fn from_dump(dump: TelemetryDump) -> Self {
        let telemetry = Self::new();
        *telemetry.fields.write().unwrap_or_else(|e| e.into_inner()) = dump.fields;
        *telemetry.objects.write().unwrap_or_else(|e| e.into_inner()) = dump.objects;
        telemetry
    }

    /// Seed a field without emitting a change.
    pub fn insert_field(&self, path: impl Into<String>, state: FieldState) {
        self.fields
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.into(), state);
    }

    pub fn insert_object(&self, path: impl Into<String>, meta: ObjectMeta) {
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.into(), meta);
    }

    /// Write a value at `at`. `lc` only moves when the value changes.
    /// Subscribers see a `FieldChanged` event.
    pub fn set_field(&self, path: &str, value: impl Into<FieldValue>, at: Timestamp) -> FieldState {
        let value = value.into();
        let state = {
            let mut fields = self.fields.write().unwrap_or_else(|e| e.into_inner());
            let state = match fields.get(path) {
                Some(prev) if prev.val.as_ref() == Some(&value) => FieldState {
                    val: Some(value),
                    ts: at,
                    lc: prev.lc,
                },
                _ => FieldState::new(value, at),
            };
            fields.insert(path.to_string(), state.clone());
            state
        };
        if self.is_subscribed(path) {
            let _ = self.sender.send(TransportEvent::FieldChanged {
                path: path.to_string(),
                state: state.clone(),
            });
        }
        state
    }

    /// Replace object metadata and notify subscribers.
    pub fn set_object(&self, path: &str, meta: ObjectMeta) {
        self.insert_object(path, meta.clone());
        if self.is_subscribed(path) {
            let _ = self.sender.send(TransportEvent::ObjectChanged {
                path: path.to_string(),
                meta,
            });
        }
    }

    /// Remove a field or object and notify subscribers.
    pub fn delete(&self, path: &str) {
        self.fields
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
        if self.is_subscribed(path) {
            let _ = self.sender.send(TransportEvent::Deleted {
                path: path.to_string(),
            });
        }
    }

    pub fn is_subscribed(&self, path: &str) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|re| re.is_match(path))
    }
}

#[async_trait]
impl Telemetry for MemoryTelemetry {
    async fn list_matching(&self, pattern: &str) -> Result<Vec<String>, TransportError> {
        let re = glob_to_regex(pattern)?;
        Ok(self
            .fields
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|path| re.is_match(path))
            .cloned()
            .collect())
    }

    async fn read_field(&self, path: &str) -> Result<Option<FieldState>, TransportError> {
        Ok(self
            .fields
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned())
    }

    async fn read_object(&self, path: &str) -> Result<Option<ObjectMeta>, TransportError> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError> {
        let re = glob_to_regex(pattern)?;
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        if !subscriptions.iter().any(|r| r.as_str() == re.as_str()) {
            subscriptions.push(re);
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }
}
