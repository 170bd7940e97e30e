//! Inbox aggregation: a user's recency-ordered conversation list.
//!
//! Joins the user's membership index with each conversation's lastMessage
//! summary and the other participant's profile. Recomputes and re-emits
//! whenever the membership set changes or any member conversation's
//! summary changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use pingup_store::{Store, Subscription};
use pingup_types::models::{ConversationSummary, LastMessage, User};

use crate::conversation::{conversation_id, last_message_path, other_participant};
use crate::error::EngineError;

fn member_path(uid: &str, conversation_id: &str) -> String {
    format!("userChats/{uid}/{conversation_id}")
}

fn index_path(uid: &str) -> String {
    format!("userChats/{uid}")
}

/// Per-conversation lastMessage watcher tasks, shared between the
/// supervisor (which spawns and retires them as membership changes) and
/// the stream handle (which aborts them all on drop).
type SummaryWatchers = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

fn abort_all(watchers: &SummaryWatchers) {
    if let Ok(mut watchers) = watchers.lock() {
        for (_, handle) in watchers.drain() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct InboxAggregator {
    store: Store,
}

impl InboxAggregator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Register the conversation into both participants' personal indices
    /// in one atomic update. Set-once: the guard marker decides inside the
    /// transaction, so concurrent first registrations commit exactly once
    /// and repeats never re-notify inbox subscribers.
    pub fn register_conversation(&self, a: &str, b: &str) -> Result<String, EngineError> {
        let cid = conversation_id(a, b);
        // Canonical guard regardless of argument order
        let guard = member_path(a.min(b), &cid);
        let registered = self.store.update_if_absent(
            &guard,
            [
                (member_path(a, &cid), json!(true)),
                (member_path(b, &cid), json!(true)),
            ],
        )?;
        if registered {
            debug!(conversation_id = %cid, "conversation registered");
        }
        Ok(cid)
    }

    /// Stream of full inbox snapshots for `uid`, most recent conversation
    /// first, message-less conversations last in index order. Dropping the
    /// stream cancels every inner watcher.
    pub fn subscribe(&self, uid: &str) -> Result<InboxStream, EngineError> {
        let membership = self.store.subscribe(&index_path(uid))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let watchers: SummaryWatchers = Arc::default();
        let task = tokio::spawn(run_inbox(
            self.store.clone(),
            uid.to_string(),
            membership,
            Arc::clone(&watchers),
            tx,
        ));
        Ok(InboxStream { rx, task, watchers })
    }
}

pub struct InboxStream {
    rx: mpsc::UnboundedReceiver<Vec<ConversationSummary>>,
    task: JoinHandle<()>,
    watchers: SummaryWatchers,
}

impl InboxStream {
    pub async fn recv(&mut self) -> Option<Vec<ConversationSummary>> {
        self.rx.recv().await
    }
}

impl Drop for InboxStream {
    fn drop(&mut self) {
        self.task.abort();
        // Aborting the supervisor does not reach the inner watcher tasks;
        // without this they (and their store subscriptions) would linger
        // until the next delivery on each watched path.
        abort_all(&self.watchers);
    }
}

async fn run_inbox(
    store: Store,
    uid: String,
    mut membership: Subscription,
    watchers: SummaryWatchers,
    tx: mpsc::UnboundedSender<Vec<ConversationSummary>>,
) {
    let (dirty_tx, mut dirty_rx) = mpsc::unbounded_channel::<()>();
    let mut cids: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            v = membership.recv() => {
                let Some(value) = v else { break };
                cids = member_ids(&value);
                sync_watchers(&store, &cids, &watchers, &dirty_tx);
                if tx.send(compute(&store, &uid, &cids)).is_err() {
                    break;
                }
            }
            _ = dirty_rx.recv() => {
                // Coalesce bursts of summary changes into one recompute
                while dirty_rx.try_recv().is_ok() {}
                if tx.send(compute(&store, &uid, &cids)).is_err() {
                    break;
                }
            }
        }
    }

    abort_all(&watchers);
}

fn member_ids(value: &Value) -> Vec<String> {
    let Value::Object(map) = value else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, marker)| marker.as_bool() == Some(true))
        .map(|(cid, _)| cid.clone())
        .collect()
}

fn sync_watchers(
    store: &Store,
    cids: &[String],
    watchers: &SummaryWatchers,
    dirty_tx: &mpsc::UnboundedSender<()>,
) {
    let Ok(mut watchers) = watchers.lock() else {
        warn!("summary watcher lock poisoned");
        return;
    };
    watchers.retain(|cid, handle| {
        if cids.iter().any(|c| c == cid) {
            true
        } else {
            handle.abort();
            false
        }
    });

    for cid in cids {
        if watchers.contains_key(cid) {
            continue;
        }
        match store.subscribe(&last_message_path(cid)) {
            Ok(mut sub) => {
                let dirty = dirty_tx.clone();
                watchers.insert(
                    cid.clone(),
                    tokio::spawn(async move {
                        // The membership emit already covered current state
                        let _ = sub.recv().await;
                        while sub.recv().await.is_some() {
                            if dirty.send(()).is_err() {
                                break;
                            }
                        }
                    }),
                );
            }
            Err(e) => warn!(conversation_id = %cid, "summary watch failed: {e}"),
        }
    }
}

fn compute(store: &Store, uid: &str, cids: &[String]) -> Vec<ConversationSummary> {
    let mut rows = Vec::new();
    for cid in cids {
        let Some(other_uid) = other_participant(cid, uid) else {
            warn!(conversation_id = %cid, uid, "index entry without this participant");
            continue;
        };

        let other = match store.read(&format!("users/{other_uid}")) {
            Ok(Value::Null) => {
                debug!(other_uid, "skipping conversation with unknown profile");
                continue;
            }
            Ok(raw) => match serde_json::from_value::<User>(raw) {
                Ok(mut user) => {
                    user.uid = other_uid.to_string();
                    user
                }
                Err(e) => {
                    warn!(other_uid, "undecodable profile: {e}");
                    continue;
                }
            },
            Err(e) => {
                warn!(other_uid, "profile read failed: {e}");
                continue;
            }
        };

        let last: Option<LastMessage> = store
            .read(&last_message_path(cid))
            .ok()
            .and_then(|raw| serde_json::from_value(raw).ok());

        rows.push(ConversationSummary {
            conversation_id: cid.clone(),
            other,
            preview: last.as_ref().map(|l| l.preview.clone()),
            timestamp: last.as_ref().map(|l| l.timestamp),
        });
    }

    // Most recent first; conversations with no messages sort last, stable
    // in index order.
    rows.sort_by(|a, b| match (a.timestamp, b.timestamp) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    rows
}
