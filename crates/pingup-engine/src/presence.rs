//! Presence tracking: online flag plus last-seen timestamp per user.
//!
//! Going online arms disconnect writes on the session, so abrupt network
//! loss converges to `{online: false, last_seen: <disconnect time>}`
//! without explicit teardown. Graceful teardown performs the same writes
//! immediately and disarms the pending ones.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info};

use pingup_store::{ArmedWrite, SessionHandle, Store, Subscription};
use pingup_types::models::{Presence, PresenceTransition};
use pingup_types::now_ms;

use crate::error::EngineError;

/// Minimum spacing between transition alerts for one uid seen by one
/// observer. Reconnect storms flip the flag rapidly; observers get at most
/// one alert per window.
const REANNOUNCE_WINDOW: Duration = Duration::from_secs(1);

pub fn presence_path(uid: &str) -> String {
    format!("users/{uid}/presence")
}

pub fn last_seen_path(uid: &str) -> String {
    format!("users/{uid}/lastSeen")
}

#[derive(Clone)]
pub struct PresenceTracker {
    store: Store,
}

impl PresenceTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Mark `uid` online and arm the disconnect writes. The returned
    /// session converges presence to offline when dropped without an
    /// explicit `go_offline`.
    pub fn go_online(&self, uid: &str) -> Result<PresenceSession, EngineError> {
        self.store.write(&presence_path(uid), json!(true))?;
        let session = self.store.session();
        session.arm(&presence_path(uid), ArmedWrite::Value(json!(false)));
        session.arm(&last_seen_path(uid), ArmedWrite::Timestamp);
        info!(uid, "presence online");
        Ok(PresenceSession {
            store: self.store.clone(),
            session,
            uid: uid.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    /// Stream of presence snapshots for `uid`; the current state arrives
    /// first, then every change.
    pub fn subscribe(&self, uid: &str) -> Result<PresenceStream, EngineError> {
        Ok(PresenceStream {
            online: self.store.subscribe(&presence_path(uid))?,
            last_seen: self.store.subscribe(&last_seen_path(uid))?,
            current: Presence::default(),
        })
    }

    /// Edge-triggered transition stream for `uid`: emits only when the
    /// online flag actually flips, never on snapshot redelivery, with at
    /// most one alert per transition per `REANNOUNCE_WINDOW`.
    pub fn watch_transitions(&self, uid: &str) -> Result<PresenceTransitions, EngineError> {
        Ok(PresenceTransitions {
            uid: uid.to_string(),
            sub: self.store.subscribe(&presence_path(uid))?,
            last: None,
            last_emit: None,
        })
    }
}

/// Live presence session for one uid. Holds the armed disconnect writes.
pub struct PresenceSession {
    store: Store,
    session: SessionHandle,
    uid: String,
    closed: AtomicBool,
}

impl PresenceSession {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Graceful teardown: writes offline + last-seen now, then disarms the
    /// disconnect writes. Safe to call more than once.
    pub fn go_offline(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.store.update([
            (presence_path(&self.uid), json!(false)),
            (last_seen_path(&self.uid), json!(now_ms())),
        ])?;
        // Disarm only after the explicit writes landed; if they failed,
        // the armed writes still fire on drop.
        self.session.disarm_all();
        self.closed.store(true, Ordering::SeqCst);
        info!(uid = %self.uid, "presence offline");
        Ok(())
    }
}

pub struct PresenceStream {
    online: Subscription,
    last_seen: Subscription,
    current: Presence,
}

impl PresenceStream {
    pub async fn recv(&mut self) -> Option<Presence> {
        tokio::select! {
            v = self.online.recv() => {
                self.current.online = v?.as_bool().unwrap_or(false);
            }
            v = self.last_seen.recv() => {
                self.current.last_seen = v?.as_i64();
            }
        }
        Some(self.current.clone())
    }
}

pub struct PresenceTransitions {
    uid: String,
    sub: Subscription,
    last: Option<bool>,
    last_emit: Option<Instant>,
}

impl PresenceTransitions {
    pub async fn recv(&mut self) -> Option<PresenceTransition> {
        while let Some(v) = self.sub.recv().await {
            let online = v.as_bool().unwrap_or(false);
            let Some(previous) = self.last.replace(online) else {
                // First snapshot primes the detector; it is not an edge.
                continue;
            };
            if previous == online {
                continue;
            }
            if let Some(at) = self.last_emit {
                if at.elapsed() < REANNOUNCE_WINDOW {
                    debug!(uid = %self.uid, online, "transition alert suppressed");
                    continue;
                }
            }
            self.last_emit = Some(Instant::now());
            return Some(PresenceTransition {
                uid: self.uid.clone(),
                online,
                at: now_ms(),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn graceful_offline_writes_last_seen() {
        let store = Store::open_in_memory().unwrap();
        let tracker = PresenceTracker::new(store.clone());

        let session = tracker.go_online("u1").unwrap();
        assert_eq!(store.read(&presence_path("u1")).unwrap(), json!(true));

        session.go_offline().unwrap();
        assert_eq!(store.read(&presence_path("u1")).unwrap(), json!(false));
        assert!(store.read(&last_seen_path("u1")).unwrap().as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn abrupt_disconnect_converges_to_offline() {
        let store = Store::open_in_memory().unwrap();
        let tracker = PresenceTracker::new(store.clone());
        let mut stream = tracker.subscribe("u1").unwrap();

        let session = tracker.go_online("u1").unwrap();
        // Session dropped without go_offline: the armed writes fire.
        drop(session);

        loop {
            let snapshot = stream.recv().await.unwrap();
            if !snapshot.online && snapshot.last_seen.is_some() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn go_offline_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let tracker = PresenceTracker::new(store.clone());
        let session = tracker.go_online("u1").unwrap();
        session.go_offline().unwrap();
        let first = store.read(&last_seen_path("u1")).unwrap();
        session.go_offline().unwrap();
        assert_eq!(store.read(&last_seen_path("u1")).unwrap(), first);
    }

    #[tokio::test]
    async fn transitions_fire_only_on_change() {
        let store = Store::open_in_memory().unwrap();
        let tracker = PresenceTracker::new(store.clone());
        store.write(&presence_path("u1"), json!(false)).unwrap();

        let mut transitions = tracker.watch_transitions("u1").unwrap();
        // Redundant writes of the same value are not edges.
        store.write(&presence_path("u1"), json!(false)).unwrap();
        store.write(&presence_path("u1"), json!(true)).unwrap();

        let t = transitions.recv().await.unwrap();
        assert!(t.online);
        assert_eq!(t.uid, "u1");
    }
}
