//! Disconnect-triggered writes.
//!
//! A session handle carries writes that must land if the owning connection
//! terminates without explicit cleanup. Dropping the handle applies them,
//! so abrupt network loss converges to the same state as a graceful
//! teardown. Graceful paths write their final state explicitly and disarm
//! before dropping the handle.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use tracing::{error, warn};

use crate::Store;

/// A write armed on a session. `Timestamp` resolves to the wall clock at
/// apply time (the disconnect moment), not at arm time.
#[derive(Debug, Clone)]
pub enum ArmedWrite {
    Value(Value),
    Timestamp,
}

/// Session-scoped cleanup registration. Applies its armed writes at most
/// once: on `disconnect()` or on drop, whichever comes first.
pub struct SessionHandle {
    store: Store,
    armed: Mutex<BTreeMap<String, ArmedWrite>>,
    applied: AtomicBool,
}

impl SessionHandle {
    pub(crate) fn new(store: Store) -> Self {
        Self {
            store,
            armed: Mutex::new(BTreeMap::new()),
            applied: AtomicBool::new(false),
        }
    }

    /// Arm a write. Re-arming the same path replaces the pending value
    /// (idempotent with respect to repeated arming).
    pub fn arm(&self, path: &str, write: ArmedWrite) {
        match self.armed.lock() {
            Ok(mut armed) => {
                armed.insert(path.to_string(), write);
            }
            Err(_) => warn!(path, "armed-write lock poisoned, arm skipped"),
        }
    }

    pub fn disarm(&self, path: &str) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.remove(path);
        }
    }

    pub fn disarm_all(&self) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.clear();
        }
    }

    /// Apply armed writes now, as an explicit disconnect would.
    pub fn disconnect(&self) {
        self.apply();
    }

    fn apply(&self) {
        if self.applied.swap(true, Ordering::SeqCst) {
            return;
        }
        let armed = match self.armed.lock() {
            Ok(mut armed) => std::mem::take(&mut *armed),
            Err(_) => {
                warn!("armed-write lock poisoned, disconnect writes lost");
                return;
            }
        };
        if armed.is_empty() {
            return;
        }
        let now = chrono::Utc::now().timestamp_millis();
        let updates: Vec<(String, Value)> = armed
            .into_iter()
            .map(|(path, write)| {
                let value = match write {
                    ArmedWrite::Value(v) => v,
                    ArmedWrite::Timestamp => json!(now),
                };
                (path, value)
            })
            .collect();
        if let Err(e) = self.store.update(updates) {
            // Presence correctness degrades to the next successful write;
            // never propagate from a teardown path.
            error!("disconnect writes failed: {e}");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.apply();
    }
}
