//! Output state sink.
//!
//! Counters, lists and the last notification are written through a
//! [`StateSink`] with "write if changed" semantics: a value equal to the last
//! one written under the same key is dropped.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

/// Key of the most recent notification text.
pub const LAST_NOTIFICATION_KEY: &str = "lastNotification";

#[async_trait]
pub trait StateSink: Send + Sync {
    /// Store `value` under `key` unless it equals the stored value. Returns
    /// whether a write happened.
    async fn write_if_changed(&self, key: &str, value: Value) -> bool;
}

/// Write every entry; returns how many were actually written.
pub async fn write_all(sink: &dyn StateSink, entries: Vec<(String, Value)>) -> usize {
    let mut written = 0;
    for (key, value) in entries {
        if sink.write_if_changed(&key, value).await {
            written += 1;
        }
    }
    written
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Keeps the written state in memory. Used by tests and the replay binary.
#[derive(Default)]
pub struct MemorySink {
    values: RwLock<HashMap<String, Value>>,
    writes: RwLock<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.values.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of writes that changed a value.
    pub async fn write_count(&self) -> usize {
        *self.writes.read().await
    }
}

#[async_trait]
impl StateSink for MemorySink {
    async fn write_if_changed(&self, key: &str, value: Value) -> bool {
        let mut values = self.values.write().await;
        if values.get(key) == Some(&value) {
            return false;
        }
        values.insert(key.to_string(), value);
        *self.writes.write().await += 1;
        true
    }
}

// ---------------------------------------------------------------------------
// LogSink
// ---------------------------------------------------------------------------

/// Emits changed values as `tracing` events.
#[derive(Default)]
pub struct LogSink {
    last: RwLock<HashMap<String, Value>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateSink for LogSink {
    async fn write_if_changed(&self, key: &str, value: Value) -> bool {
        let mut last = self.last.write().await;
        if last.get(key) == Some(&value) {
            return false;
        }
        tracing::info!(key, value = %value, "State changed");
        last.insert(key.to_string(), value);
        true
    }
}
