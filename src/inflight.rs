//! Single-flight registry shared by all workers.
//!
//! A worker acquires a key before touching a document and holds the
//! returned guard for the duration of the operation. A second acquisition
//! of the same key fails until the guard is dropped.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlightKey {
    /// An existing document being reprocessed.
    Document(i64),
    /// A new file being ingested, by content hash.
    Hash(String),
}

impl fmt::Display for FlightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlightKey::Document(id) => write!(f, "document {}", id),
            FlightKey::Hash(hash) => write!(f, "hash {}", hash),
        }
    }
}

#[derive(Debug, Default)]
pub struct InFlight {
    keys: Mutex<HashSet<FlightKey>>,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `key`, or `None` if another operation holds it.
    pub fn try_acquire(self: &Arc<Self>, key: FlightKey) -> Option<FlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(FlightGuard {
            registry: self.clone(),
            key,
        })
    }

    pub fn contains(&self, key: &FlightKey) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct FlightGuard {
    registry: Arc<InFlight>,
    key: FlightKey,
}

impl FlightGuard {
    pub fn key(&self) -> &FlightKey {
        &self.key
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.registry
            .keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}
