//! Ephemeral typing flags with debounce-driven auto-clear.
//!
//! Every keystroke event re-arms a 1-second idle timer; the flag drops to
//! false only when input pauses for the full window. Session-scoped state:
//! nothing here survives a restart or joins the persisted record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::warn;

use pingup_store::{Store, StoreError, Subscription};

use crate::error::EngineError;

/// Idle window measured from the last keystroke event.
pub const TYPING_IDLE: Duration = Duration::from_secs(1);

pub fn typing_path(conversation_id: &str, uid: &str) -> String {
    format!("chats/{conversation_id}/typing/{uid}")
}

type TimerKey = (String, String);

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct TypingSignal {
    store: Store,
    timers: Arc<Mutex<HashMap<TimerKey, Timer>>>,
    generation: AtomicU64,
}

impl TypingSignal {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Record a keystroke: the flag goes true and the idle timer restarts.
    /// Continuous input keeps the flag true until input pauses for the
    /// full window.
    pub fn set_typing(&self, conversation_id: &str, uid: &str) -> Result<(), EngineError> {
        let path = typing_path(conversation_id, uid);
        self.store.write(&path, json!(true))?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let key: TimerKey = (conversation_id.to_string(), uid.to_string());

        let handle = {
            let store = self.store.clone();
            let timers = Arc::clone(&self.timers);
            let path = path.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(TYPING_IDLE).await;
                // Only the newest timer for this (conversation, uid) may
                // clear the flag; a later keystroke supersedes this one.
                let still_current = {
                    let Ok(mut timers) = timers.lock() else { return };
                    match timers.get(&key) {
                        Some(timer) if timer.generation == generation => {
                            timers.remove(&key);
                            true
                        }
                        _ => false,
                    }
                };
                if still_current {
                    if let Err(e) = store.write(&path, json!(false)) {
                        warn!("typing auto-clear failed: {e}");
                    }
                }
            })
        };

        let mut timers = self
            .timers
            .lock()
            .map_err(|_| EngineError::Store(StoreError::LockPoisoned))?;
        if let Some(previous) = timers.insert(key, Timer { generation, handle }) {
            previous.handle.abort();
        }
        Ok(())
    }

    /// Clear the flag immediately and cancel any pending timer. Used when
    /// a session switches conversations or tears down.
    pub fn clear(&self, conversation_id: &str, uid: &str) -> Result<(), EngineError> {
        let key: TimerKey = (conversation_id.to_string(), uid.to_string());
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(timer) = timers.remove(&key) {
                timer.handle.abort();
            }
        }
        self.store
            .write(&typing_path(conversation_id, uid), json!(false))?;
        Ok(())
    }

    /// Deduplicated stream of the peer's typing flag: consecutive equal
    /// states collapse, so one idle expiry drives exactly one `false`.
    pub fn subscribe(
        &self,
        conversation_id: &str,
        other_uid: &str,
    ) -> Result<TypingStream, EngineError> {
        Ok(TypingStream {
            sub: self
                .store
                .subscribe(&typing_path(conversation_id, other_uid))?,
            last: None,
        })
    }
}

impl Drop for TypingSignal {
    fn drop(&mut self) {
        if let Ok(timers) = self.timers.lock() {
            for timer in timers.values() {
                timer.handle.abort();
            }
        }
    }
}

pub struct TypingStream {
    sub: Subscription,
    last: Option<bool>,
}

impl TypingStream {
    pub async fn recv(&mut self) -> Option<bool> {
        while let Some(v) = self.sub.recv().await {
            let typing = v.as_bool().unwrap_or(false);
            if self.last == Some(typing) {
                continue;
            }
            self.last = Some(typing);
            return Some(typing);
        }
        None
    }
}
