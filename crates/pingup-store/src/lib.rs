//! Realtime key-path store: the single logical store the messaging engine
//! is defined against.
//!
//! Values live in a hierarchical keyspace. Writing an object flattens it
//! into scalar leaves; reading a path returns either the leaf stored there
//! or the subtree below it assembled back into a JSON object. Writes are
//! durable (SQLite, WAL) and fan out in-process to every subscription whose
//! path overlaps the written one. Compound updates (`update`) commit in a
//! single transaction. The store enforces no schema — every data-model
//! invariant is the engine's job.

pub mod path;
pub mod session;

use std::path::Path as FsPath;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use session::{ArmedWrite, SessionHandle};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    #[error("stored value at {0} is not valid JSON")]
    Corrupt(String),

    #[error("store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the shared store. Cheap to clone; all clones observe the same
/// state and the same subscriber set.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    watchers: Mutex<Vec<Watcher>>,
}

struct Watcher {
    id: Uuid,
    path: String,
    tx: mpsc::UnboundedSender<Value>,
}

/// A live subscription to the value at one path. The current value is
/// delivered immediately, then every change whose path overlaps the
/// subscribed one. Dropping the subscription deregisters the watcher;
/// no further deliveries occur.
pub struct Subscription {
    id: Uuid,
    store: Arc<StoreInner>,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut watchers) = self.store.watchers.lock() {
            watchers.retain(|w| w.id != self.id);
        }
    }
}

impl Store {
    pub fn open(db_path: &FsPath) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::with_connection(conn)?;
        info!("store opened at {}", db_path.display());
        Ok(store)
    }

    /// Private per-instance store, used by tests and ephemeral deployments.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                path   TEXT PRIMARY KEY,
                value  TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                watchers: Mutex::new(Vec::new()),
            }),
        })
    }

    // Lock order is always conn before watchers; subscribe and notify both
    // follow it, so a subscription registered between a commit and its
    // fan-out cannot observe the write twice or miss it.

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Value at `path`: the stored leaf, the assembled subtree object, or
    /// `Null` when nothing is stored at or below the path.
    pub fn read(&self, p: &str) -> Result<Value> {
        path::validate(p)?;
        let conn = self.conn()?;
        read_value(&conn, p)
    }

    /// Replace the subtree at `path` with `value`. Objects are flattened to
    /// leaves; `Null` (or an empty object) deletes; writing below a scalar
    /// destroys that scalar.
    pub fn write(&self, p: &str, value: Value) -> Result<()> {
        self.update([(p.to_string(), value)])
    }

    /// Atomic multi-path write: every entry commits in one transaction, and
    /// each affected subscriber is notified exactly once.
    pub fn update<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let entries: Vec<(String, Value)> = entries.into_iter().collect();
        for (p, _) in &entries {
            path::validate(p)?;
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (p, value) in &entries {
            apply_write(&tx, p, value)?;
        }
        tx.commit()?;

        let written: Vec<&str> = entries.iter().map(|(p, _)| p.as_str()).collect();
        self.notify(&conn, &written);
        Ok(())
    }

    /// Set-once primitive: writes `value` at `path` only when nothing is
    /// stored at or below it. Returns whether the write happened.
    pub fn write_if_absent(&self, p: &str, value: Value) -> Result<bool> {
        self.update_if_absent(p, [(p.to_string(), value)])
    }

    /// Guarded atomic update: commits `entries` in one transaction only
    /// when nothing is stored at or below `guard`. Concurrent callers
    /// racing on the same guard serialize on the transaction, so exactly
    /// one of them writes (and notifies). Returns whether the writes
    /// happened.
    pub fn update_if_absent<I>(&self, guard: &str, entries: I) -> Result<bool>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        path::validate(guard)?;
        let entries: Vec<(String, Value)> = entries.into_iter().collect();
        for (p, _) in &entries {
            path::validate(p)?;
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let occupied: bool = tx.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM kv
                WHERE path = ?1 OR (path >= ?1 || '/' AND path < ?1 || '0')
            )",
            [guard],
            |row| row.get(0),
        )?;
        if occupied {
            return Ok(false);
        }
        for (p, value) in &entries {
            apply_write(&tx, p, value)?;
        }
        tx.commit()?;

        let written: Vec<&str> = entries.iter().map(|(p, _)| p.as_str()).collect();
        self.notify(&conn, &written);
        Ok(true)
    }

    /// Subscribe to the value at `path`. The current value arrives first.
    pub fn subscribe(&self, p: &str) -> Result<Subscription> {
        path::validate(p)?;
        let conn = self.conn()?;
        let current = read_value(&conn, p)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(current);
        let id = Uuid::new_v4();
        self.inner
            .watchers
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .push(Watcher {
                id,
                path: p.to_string(),
                tx,
            });
        debug!(path = p, "subscription registered");
        Ok(Subscription {
            id,
            store: self.inner.clone(),
            rx,
        })
    }

    /// Open a session whose armed writes apply on disconnect (explicit or
    /// abrupt, via drop). Re-arm after every successful reconnect.
    pub fn session(&self) -> SessionHandle {
        SessionHandle::new(self.clone())
    }

    fn notify(&self, conn: &Connection, written: &[&str]) {
        let Ok(mut watchers) = self.inner.watchers.lock() else {
            warn!("watcher lock poisoned, skipping fan-out");
            return;
        };
        watchers.retain(|w| !w.tx.is_closed());
        for w in watchers.iter() {
            if !written.iter().any(|p| path::overlaps(&w.path, p)) {
                continue;
            }
            match read_value(conn, &w.path) {
                Ok(value) => {
                    let _ = w.tx.send(value);
                }
                Err(e) => warn!(path = %w.path, "fan-out read failed: {e}"),
            }
        }
    }
}

fn read_value(conn: &Connection, p: &str) -> Result<Value> {
    let leaf: Option<String> = conn
        .query_row("SELECT value FROM kv WHERE path = ?1", [p], |row| {
            row.get(0)
        })
        .optional()?;
    if let Some(raw) = leaf {
        return serde_json::from_str(&raw).map_err(|_| StoreError::Corrupt(p.to_string()));
    }

    // Path chars sort above '/', so the half-open range [p + "/", p + "0")
    // covers exactly the descendants.
    let mut stmt = conn.prepare_cached(
        "SELECT path, value FROM kv
         WHERE path >= ?1 || '/' AND path < ?1 || '0'
         ORDER BY path",
    )?;
    let rows: Vec<(String, String)> = stmt
        .query_map([p], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<_, _>>()?;
    if rows.is_empty() {
        return Ok(Value::Null);
    }

    let mut root = Map::new();
    for (leaf_path, raw) in rows {
        let value: Value =
            serde_json::from_str(&raw).map_err(|_| StoreError::Corrupt(leaf_path.clone()))?;
        let rel = &leaf_path[p.len() + 1..];
        let segments: Vec<&str> = rel.split('/').collect();
        insert_nested(&mut root, &segments, value);
    }
    Ok(Value::Object(root))
}

fn insert_nested(map: &mut Map<String, Value>, segments: &[&str], value: Value) {
    if segments.len() == 1 {
        map.insert(segments[0].to_string(), value);
        return;
    }
    let entry = map
        .entry(segments[0].to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(child) = entry {
        insert_nested(child, &segments[1..], value);
    }
}

fn apply_write(tx: &rusqlite::Transaction<'_>, p: &str, value: &Value) -> Result<()> {
    tx.execute("DELETE FROM kv WHERE path = ?1", [p])?;
    tx.execute(
        "DELETE FROM kv WHERE path >= ?1 || '/' AND path < ?1 || '0'",
        [p],
    )?;
    for ancestor in path::ancestors(p) {
        tx.execute("DELETE FROM kv WHERE path = ?1", [ancestor])?;
    }

    let mut leaves = Vec::new();
    flatten(p, value, &mut leaves)?;
    let mut stmt = tx.prepare_cached("INSERT INTO kv (path, value) VALUES (?1, ?2)")?;
    for (leaf_path, leaf) in leaves {
        stmt.execute(params![leaf_path, leaf.to_string()])?;
    }
    Ok(())
}

fn flatten(p: &str, value: &Value, out: &mut Vec<(String, Value)>) -> Result<()> {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, child) in map {
                path::validate_segment(key)?;
                flatten(&format!("{p}/{key}"), child, out)?;
            }
        }
        other => out.push((p.to_string(), other.clone())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn leaf_roundtrip() {
        let s = store();
        s.write("users/u1/presence", json!(true)).unwrap();
        assert_eq!(s.read("users/u1/presence").unwrap(), json!(true));
        assert_eq!(s.read("users/u2/presence").unwrap(), Value::Null);
    }

    #[test]
    fn object_flattens_and_reassembles() {
        let s = store();
        s.write(
            "chats/c1/messages/m1",
            json!({"senderId": "u1", "text": "hi", "timestamp": 5}),
        )
        .unwrap();
        assert_eq!(s.read("chats/c1/messages/m1/text").unwrap(), json!("hi"));
        assert_eq!(
            s.read("chats/c1/messages").unwrap(),
            json!({"m1": {"senderId": "u1", "text": "hi", "timestamp": 5}})
        );
    }

    #[test]
    fn null_deletes_subtree() {
        let s = store();
        s.write("a/b", json!({"x": 1, "y": 2})).unwrap();
        s.write("a/b", Value::Null).unwrap();
        assert_eq!(s.read("a/b").unwrap(), Value::Null);
        assert_eq!(s.read("a").unwrap(), Value::Null);
    }

    #[test]
    fn write_replaces_whole_subtree() {
        let s = store();
        s.write("a", json!({"x": 1, "y": 2})).unwrap();
        s.write("a", json!({"z": 3})).unwrap();
        assert_eq!(s.read("a").unwrap(), json!({"z": 3}));
    }

    #[test]
    fn deep_write_destroys_scalar_ancestor() {
        let s = store();
        s.write("a", json!("scalar")).unwrap();
        s.write("a/b", json!(1)).unwrap();
        assert_eq!(s.read("a").unwrap(), json!({"b": 1}));
    }

    #[test]
    fn write_if_absent_is_set_once() {
        let s = store();
        assert!(s.write_if_absent("m/readBy/u2", json!(100)).unwrap());
        assert!(!s.write_if_absent("m/readBy/u2", json!(200)).unwrap());
        assert_eq!(s.read("m/readBy/u2").unwrap(), json!(100));
    }

    #[test]
    fn guarded_update_is_set_once() {
        let s = store();
        assert!(
            s.update_if_absent(
                "idx/a/c1",
                [
                    ("idx/a/c1".to_string(), json!(true)),
                    ("idx/b/c1".to_string(), json!(true)),
                ],
            )
            .unwrap()
        );
        // A loser on the same guard writes nothing at all
        assert!(
            !s.update_if_absent(
                "idx/a/c1",
                [
                    ("idx/a/c1".to_string(), json!(false)),
                    ("idx/b/c1".to_string(), json!(false)),
                ],
            )
            .unwrap()
        );
        assert_eq!(s.read("idx/a/c1").unwrap(), json!(true));
        assert_eq!(s.read("idx/b/c1").unwrap(), json!(true));
    }

    #[test]
    fn invalid_paths_rejected() {
        let s = store();
        assert!(matches!(
            s.write("", json!(1)),
            Err(StoreError::InvalidPath(_))
        ));
        assert!(matches!(
            s.write("a//b", json!(1)),
            Err(StoreError::InvalidPath(_))
        ));
        // Object keys become path segments and get the same checks.
        assert!(s.write("a", json!({"b/c": 1})).is_err());
    }

    #[tokio::test]
    async fn subscribe_delivers_current_then_changes() {
        let s = store();
        s.write("k", json!(1)).unwrap();
        let mut sub = s.subscribe("k").unwrap();
        assert_eq!(sub.recv().await, Some(json!(1)));
        s.write("k", json!(2)).unwrap();
        assert_eq!(sub.recv().await, Some(json!(2)));
    }

    #[tokio::test]
    async fn ancestor_subscription_sees_descendant_writes() {
        let s = store();
        let mut sub = s.subscribe("chats/c1").unwrap();
        assert_eq!(sub.recv().await, Some(Value::Null));
        s.write("chats/c1/typing/u1", json!(true)).unwrap();
        assert_eq!(sub.recv().await, Some(json!({"typing": {"u1": true}})));
        // Sibling paths do not wake this watcher
        s.write("chats/c2/typing/u1", json!(true)).unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn atomic_update_notifies_each_watcher_once() {
        let s = store();
        let mut sub = s.subscribe("chats/c1").unwrap();
        assert_eq!(sub.recv().await, Some(Value::Null));
        s.update([
            ("chats/c1/messages/m1/text".to_string(), json!("hi")),
            ("chats/c1/lastMessage/preview".to_string(), json!("hi")),
        ])
        .unwrap();
        let v = sub.recv().await.unwrap();
        assert_eq!(v["messages"]["m1"]["text"], "hi");
        assert_eq!(v["lastMessage"]["preview"], "hi");
        // Both entries landed in one transaction -> one delivery
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_stops_deliveries() {
        let s = store();
        let mut sub = s.subscribe("k").unwrap();
        assert_eq!(sub.recv().await, Some(Value::Null));
        drop(sub);
        // No watcher left; the write must not panic or leak a sender
        s.write("k", json!(1)).unwrap();
        assert!(s.inner.watchers.lock().unwrap().is_empty());
    }
}
