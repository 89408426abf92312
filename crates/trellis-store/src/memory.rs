use std::sync::{Arc, RwLock};

use serde_json::Value;

/// In-process key/value state scoped to one session. Read by edge
/// conditions and system prompts; written only by accumulator flushes and
/// edge-traversal bookkeeping.
#[derive(Clone, Default)]
pub struct SharedMemory {
    inner: Arc<RwLock<serde_json::Map<String, Value>>>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: serde_json::Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().unwrap().insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().unwrap().contains_key(key)
    }

    /// Copy of the full map, used for persistence and edge evaluation.
    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        self.inner.read().unwrap().clone()
    }

    /// Replace the full map, used by checkpoint restore.
    pub fn restore(&self, snapshot: serde_json::Map<String, Value>) {
        *self.inner.write().unwrap() = snapshot;
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}
