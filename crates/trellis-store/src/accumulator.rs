use std::sync::{Arc, Mutex};

use serde_json::Value;

use trellis_core::types::OutputSink;

use crate::memory::SharedMemory;

/// Write-through buffer for a node visit's outputs.
///
/// The `set_output` tool writes into the shared sink through its context;
/// the executor persists the sink into `cursor.json` after every tool call
/// so a crash between Set and judge acceptance loses nothing. `flush` moves
/// the buffered outputs into SharedMemory — called on ACCEPT and on the
/// cancellation cleanup path, always before `state.json` is rewritten.
pub struct OutputAccumulator {
    sink: OutputSink,
}

impl OutputAccumulator {
    pub fn new() -> Self {
        Self {
            sink: Arc::new(Mutex::new(serde_json::Map::new())),
        }
    }

    /// Rebuild from a persisted cursor's outputs.
    pub fn restore(outputs: serde_json::Map<String, Value>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(outputs)),
        }
    }

    /// The sink handed to tool contexts.
    pub fn sink(&self) -> OutputSink {
        self.sink.clone()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.sink.lock().unwrap().insert(key.into(), value);
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.sink.lock().unwrap().contains_key(key)
    }

    /// Currently-set output keys, for judge evaluation.
    pub fn keys(&self) -> Vec<String> {
        self.sink.lock().unwrap().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        self.sink.lock().unwrap().clone()
    }

    /// Write the accumulated outputs into shared memory.
    pub fn flush(&self, memory: &SharedMemory) {
        for (key, value) in self.sink.lock().unwrap().iter() {
            memory.set(key.clone(), value.clone());
        }
    }
}

impl Default for OutputAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
