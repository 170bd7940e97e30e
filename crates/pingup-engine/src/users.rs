//! User profiles and the follow graph.
//!
//! Profiles are created by the external registration flow; this module
//! reads them for inbox joins and mutates only the follow edges (both
//! sides in one atomic update) and basic profile fields.

use serde_json::{Value, json};

use pingup_store::Store;
use pingup_types::models::User;

use crate::error::EngineError;

fn user_path(uid: &str) -> String {
    format!("users/{uid}")
}

#[derive(Clone)]
pub struct UserDirectory {
    store: Store,
}

impl UserDirectory {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Write the profile fields, leaving presence, follow edges and the
    /// delivery token (which live under the same subtree) untouched.
    pub fn upsert(&self, user: &User) -> Result<(), EngineError> {
        let base = user_path(&user.uid);
        self.store.update([
            (format!("{base}/name"), json!(user.name)),
            (format!("{base}/username"), json!(user.username)),
            (format!("{base}/email"), json!(user.email)),
        ])?;
        Ok(())
    }

    pub fn user(&self, uid: &str) -> Result<Option<User>, EngineError> {
        let raw = self.store.read(&user_path(uid))?;
        if raw.is_null() {
            return Ok(None);
        }
        let mut user: User = serde_json::from_value(raw)?;
        user.uid = uid.to_string();
        Ok(Some(user))
    }

    /// Flip the follow edge from `uid` to `other_uid`: both the
    /// `following` and the mirrored `followers` marker change in one
    /// atomic update. Returns the new state.
    pub fn toggle_follow(&self, uid: &str, other_uid: &str) -> Result<bool, EngineError> {
        let forward = format!("users/{uid}/following/{other_uid}");
        let backward = format!("users/{other_uid}/followers/{uid}");
        let currently = self.store.read(&forward)?.as_bool() == Some(true);
        let marker = if currently { Value::Null } else { json!(true) };
        self.store
            .update([(forward, marker.clone()), (backward, marker)])?;
        Ok(!currently)
    }
}
